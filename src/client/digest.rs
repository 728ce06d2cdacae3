//! HTTP Digest authentication (RFC 2617, MD5) for Gen2+ devices.
//!
//! The device answers the first unauthenticated RPC with a 401 carrying a
//! `WWW-Authenticate` challenge. We keep the challenge, increment `nc` per
//! reuse and mint a fresh cnonce per attempt.

use std::sync::Mutex;

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

/// Parse a `WWW-Authenticate: Digest ...` header value.
pub fn parse_challenge(header: &str) -> Result<DigestChallenge> {
    let rest = header
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| Error::AuthFailed(format!("unsupported auth scheme: {}", header)))?
        .trim();

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut opaque = None;
    let mut algorithm = None;

    for part in split_challenge_params(rest) {
        let Some((key, value)) = part.split_once('=') else { continue };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            // qop may be a list ("auth,auth-int"); we only speak auth.
            "qop" => {
                qop = value
                    .split(',')
                    .map(str::trim)
                    .find(|q| *q == "auth")
                    .map(String::from)
            }
            "opaque" => opaque = Some(value),
            "algorithm" => algorithm = Some(value),
            _ => {}
        }
    }

    Ok(DigestChallenge {
        realm: realm.ok_or_else(|| Error::AuthFailed("challenge missing realm".into()))?,
        nonce: nonce.ok_or_else(|| Error::AuthFailed("challenge missing nonce".into()))?,
        qop,
        opaque,
        algorithm,
    })
}

/// Split on commas that are outside quoted strings.
fn split_challenge_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Compute the digest `response` value.
pub fn compute_response(
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match challenge.qop.as_deref() {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, challenge.nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Per-client digest session: remembers the latest challenge and the
/// monotonically increasing nonce count for it.
pub struct DigestSession {
    username: String,
    password: String,
    state: Mutex<Option<(DigestChallenge, u32)>>,
}

impl DigestSession {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password, state: Mutex::new(None) }
    }

    /// Adopt a fresh challenge; resets the nonce count.
    pub fn accept_challenge(&self, header: &str) -> Result<()> {
        let challenge = parse_challenge(header)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some((challenge, 0));
        Ok(())
    }

    /// Build an `Authorization` header for the next request, or `None` when
    /// no challenge has been seen yet. Each call consumes one `nc`.
    pub fn authorize(&self, method: &str, uri: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (challenge, nc) = state.as_mut()?;
        *nc += 1;
        let nc = *nc;
        let cnonce = new_cnonce();
        let response =
            compute_response(&self.username, &self.password, challenge, method, uri, nc, &cnonce);

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri
        );
        if let Some(qop) = &challenge.qop {
            header.push_str(&format!(", qop={}, nc={:08x}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        header.push_str(&format!(", response=\"{}\"", response));
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header.push_str(", algorithm=MD5");
        Some(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Digest realm="shellyplus1-a8", nonce="60dc2b3c", qop="auth", algorithm=SHA-256"#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "shellyplus1-a8");
        assert_eq!(challenge.nonce, "60dc2b3c");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm.as_deref(), Some("SHA-256"));
    }

    #[test]
    fn test_parse_challenge_rejects_basic() {
        assert!(parse_challenge(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn test_parse_challenge_quoted_commas() {
        let challenge =
            parse_challenge(r#"Digest realm="a,b", nonce="n", qop="auth,auth-int""#).unwrap();
        assert_eq!(challenge.realm, "a,b");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn test_response_matches_rfc_shape() {
        // response = MD5(MD5(u:r:p):nonce:nc:cnonce:qop:MD5(POST:/rpc))
        let challenge = DigestChallenge {
            realm: "r".into(),
            nonce: "n".into(),
            qop: Some("auth".into()),
            opaque: None,
            algorithm: None,
        };
        let response = compute_response("u", "p", &challenge, "POST", "/rpc", 1, "0123456789abcdef");
        let ha1 = md5_hex("u:r:p");
        let ha2 = md5_hex("POST:/rpc");
        let expected = md5_hex(&format!("{}:n:00000001:0123456789abcdef:auth:{}", ha1, ha2));
        assert_eq!(response, expected);
    }

    #[test]
    fn test_nc_increments_per_authorize() {
        let session = DigestSession::new("u".into(), "p".into());
        assert!(session.authorize("POST", "/rpc").is_none());

        session
            .accept_challenge(r#"Digest realm="r", nonce="n", qop="auth""#)
            .unwrap();
        let first = session.authorize("POST", "/rpc").unwrap();
        let second = session.authorize("POST", "/rpc").unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));

        // A new challenge resets the count.
        session
            .accept_challenge(r#"Digest realm="r", nonce="n2", qop="auth""#)
            .unwrap();
        let third = session.authorize("POST", "/rpc").unwrap();
        assert!(third.contains("nc=00000001"));
        assert!(third.contains("nonce=\"n2\""));
    }

    #[test]
    fn test_cnonce_is_16_hex() {
        let session = DigestSession::new("u".into(), "p".into());
        session
            .accept_challenge(r#"Digest realm="r", nonce="n", qop="auth""#)
            .unwrap();
        let header = session.authorize("POST", "/rpc").unwrap();
        let cnonce = header
            .split("cnonce=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap();
        assert_eq!(cnonce.len(), 16);
        assert!(cnonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
