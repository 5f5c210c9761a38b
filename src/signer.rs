//! nginx `secure_link` tokens.
//!
//! The token is `base64url(md5(expires ‖ uri ‖ cache_ip ‖ uid ‖ " " ‖ secret))`
//! without padding, which is what nginx recomputes from
//! `$secure_link_md5 "$secure_link_expires$uri$remote_addr$uid secret"`.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureLink {
    pub expires: String,
    pub extra: String,
}

impl SecureLink {
    pub fn query(&self) -> String {
        format!("expires={}&extra={}", self.expires, self.extra)
    }
}

#[derive(Clone)]
pub struct Signer {
    secret: String,
    expiration: Duration,
}

impl Signer {
    pub fn new(secret: &str, expiration: Duration) -> Self {
        Self {
            secret: secret.to_string(),
            expiration,
        }
    }

    pub fn sign(&self, uri: &str, cache_ip: &str, uid: &str) -> SecureLink {
        let expires = clock::unix_seconds(clock::now() + self.expiration);
        self.sign_at(expires, uri, cache_ip, uid)
    }

    pub fn sign_at(&self, expires: u64, uri: &str, cache_ip: &str, uid: &str) -> SecureLink {
        let expires = expires.to_string();
        let extra = token(&expires, uri, cache_ip, uid, &self.secret);
        SecureLink { expires, extra }
    }
}

pub fn token(expires: &str, uri: &str, cache_ip: &str, uid: &str, secret: &str) -> String {
    let mut ctx = md5::Context::new();
    ctx.consume(expires.as_bytes());
    ctx.consume(uri.as_bytes());
    ctx.consume(cache_ip.as_bytes());
    ctx.consume(uid.as_bytes());
    ctx.consume(b" ");
    ctx.consume(secret.as_bytes());
    let digest = ctx.compute();
    // url-safe alphabet without padding == `tr +/ -_ | tr -d =` over standard base64
    URL_SAFE_NO_PAD.encode(digest.0)
}
