//! Digest access authentication (RFC 2069, the RFC 2617 subset without `qop`).
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:HA2)
//! ```
//!
//! [`DigestAuthentication`] is stateless: the connection decides which nonce
//! it issued and when to issue a new one.

use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

/// Server or client side credential set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestAuthentication {
    realm: String,
    username: String,
    password: String,
}

impl DigestAuthentication {
    pub fn new(realm: &str, username: &str, password: &str) -> Self {
        Self {
            realm: realm.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// A fresh nonce: MD5 over the current time and 64 random bits.
    pub fn get_nonce(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let salt: u64 = rand::random();
        md5_hex(&format!("{nanos}:{salt}"))
    }

    pub fn get_response(&self, nonce: &str, method: &str, url: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
        let ha2 = md5_hex(&format!("{}:{}", method, url));
        md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
    }

    /// Check client-supplied credentials against the nonce this side issued.
    pub fn verify(&self, credentials: &DigestCredentials, method: &str, nonce: &str) -> bool {
        if credentials.username != self.username
            || credentials.realm != self.realm
            || credentials.nonce != nonce
        {
            return false;
        }
        let expected = self.get_response(nonce, method, &credentials.uri);
        expected.eq_ignore_ascii_case(&credentials.response)
    }

    /// `Authorization` header value answering `challenge` (client side).
    pub fn authorization(&self, challenge: &DigestChallenge, method: &str, uri: &str) -> String {
        let response = self.get_response(&challenge.nonce, method, uri);
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri, response
        )
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fields of an `Authorization: Digest ...` request header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestCredentials {
    /// Parse an `Authorization` header value. Non-Digest schemes yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let params = digest_params(value)?;
        let mut credentials = DigestCredentials::default();
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "username" => credentials.username = value,
                "realm" => credentials.realm = value,
                "nonce" => credentials.nonce = value,
                "uri" => credentials.uri = value,
                "response" => credentials.response = value,
                _ => {}
            }
        }
        Some(credentials)
    }
}

/// Fields of a `WWW-Authenticate: Digest ...` response header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Option<Self> {
        let params = digest_params(value)?;
        let mut challenge = DigestChallenge::default();
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "nonce" => challenge.nonce = value,
                _ => {}
            }
        }
        if challenge.nonce.is_empty() {
            return None;
        }
        Some(challenge)
    }
}

/// Split `Digest k1="v1", k2=v2` into pairs. Quoted values may contain commas.
fn digest_params(value: &str) -> Option<Vec<(String, String)>> {
    let (scheme, rest) = value.trim().split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }

    let mut params = Vec::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let name: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let name = name.trim().to_string();
        if name.is_empty() {
            break;
        }

        let mut val = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                val.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                val.push(c);
                chars.next();
            }
            val = val.trim().to_string();
        }
        params.push((name, val));
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2069_vector() {
        // Example from RFC 2069 §2.4.
        let auth = DigestAuthentication::new("testrealm@host.com", "Mufasa", "CircleOfLife");
        let response = auth.get_response(
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
        );
        assert_eq!(response, "1949323746fe6a43ef61f8606e7febea");
    }

    #[test]
    fn any_input_change_changes_digest() {
        let auth = DigestAuthentication::new("realm", "user", "pass");
        let base = auth.get_response("n", "DESCRIBE", "rtsp://h/s");
        assert_ne!(base, auth.get_response("m", "DESCRIBE", "rtsp://h/s"));
        assert_ne!(base, auth.get_response("n", "SETUP", "rtsp://h/s"));
        assert_ne!(base, auth.get_response("n", "DESCRIBE", "rtsp://h/t"));
        let other = DigestAuthentication::new("realm", "user", "secret");
        assert_ne!(base, other.get_response("n", "DESCRIBE", "rtsp://h/s"));
    }

    #[test]
    fn nonces_are_fresh() {
        let auth = DigestAuthentication::new("r", "u", "p");
        let a = auth.get_nonce();
        let b = auth.get_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn client_header_verifies_on_server() {
        let server = DigestAuthentication::new("cam", "admin", "12345");
        let nonce = server.get_nonce();
        let challenge = DigestChallenge {
            realm: "cam".into(),
            nonce: nonce.clone(),
        };

        let client = DigestAuthentication::new("cam", "admin", "12345");
        let header = client.authorization(&challenge, "DESCRIBE", "rtsp://h/live");
        let credentials = DigestCredentials::parse(&header).unwrap();
        assert_eq!(credentials.uri, "rtsp://h/live");
        assert!(server.verify(&credentials, "DESCRIBE", &nonce));
        assert!(!server.verify(&credentials, "DESCRIBE", "stale"));
        assert!(!server.verify(&credentials, "SETUP", &nonce));
    }

    #[test]
    fn parse_challenge() {
        let challenge =
            DigestChallenge::parse("Digest realm=\"Streaming, Inc\", nonce=\"abc123\"").unwrap();
        assert_eq!(challenge.realm, "Streaming, Inc");
        assert_eq!(challenge.nonce, "abc123");
        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn parse_unquoted_params() {
        let creds = DigestCredentials::parse("Digest username=bob, nonce=n1 , response=ff").unwrap();
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.nonce, "n1");
        assert_eq!(creds.response, "ff");
    }
}
