pub const CLIENT_URI_KEY: &str = "X-Client-URI";
pub const CLIENT_ID_KEY: &str = "X-Client-ID";
pub const CACHE_SERVER_KEY: &str = "X-Cache-Server";
pub const FORWARDED_FOR_KEY: &str = "X-Forwarded-For";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const LOCATION_KEY: &str = "X-Location";
pub const ERROR_KEY: &str = "X-Error";

/// Tries against the next-ranked servers before falling back to the proxy hint.
pub const MAX_TRIES: usize = 3;

pub const CHUNK_PATH_PREFIX: &str = "/videos/media/ts/";
