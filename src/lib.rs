pub mod access_log;
pub mod admin;
pub mod blocklist;
pub mod clock;
pub mod config;
pub mod constants;
pub mod consul;
pub mod discovery;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod runtime;
pub mod server;
pub mod services;
pub mod signer;
pub mod title;
pub mod upstream;
