//! Exchange request signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a request as the exchange expects: hex-encoded HMAC-SHA256 over
/// `method + timestamp + path`.
///
/// The same signature scheme covers REST headers and the WebSocket auth
/// frame (where `method` is `GET` and `path` is the socket path).
pub fn sign_request(secret: &str, method: &str, timestamp: &str, path: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(method.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(path.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
