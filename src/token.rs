//! Server identity tokens
//!
//! A token pairs the node's 128-bit ID with a random secret and is presented
//! to the backend as a bearer credential. Textual form:
//! `base64url(id) "." base64url(secret)`, both unpadded.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Secret key size for freshly generated tokens
const SECRET_KEY_LEN: usize = 64;

/// Token parsing errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("illformed token string")]
    Illformed,

    #[error("illformed token ID: {0}")]
    Id(String),

    #[error("illformed token key")]
    Key,
}

/// Node identity + secret presented to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerToken {
    pub id: Uuid,
    pub secret_key: Vec<u8>,
}

impl ServerToken {
    /// Generate a new random token
    pub fn generate() -> Self {
        let mut secret_key = vec![0u8; SECRET_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut secret_key);

        Self {
            id: Uuid::new_v4(),
            secret_key,
        }
    }
}

impl fmt::Display for ServerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            URL_SAFE_NO_PAD.encode(self.id.as_bytes()),
            URL_SAFE_NO_PAD.encode(&self.secret_key)
        )
    }
}

impl FromStr for ServerToken {
    type Err = TokenError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let (id_part, key_part) = val.split_once('.').ok_or(TokenError::Illformed)?;

        let id_bytes = URL_SAFE_NO_PAD
            .decode(id_part)
            .map_err(|err| TokenError::Id(err.to_string()))?;

        let id = Uuid::from_slice(&id_bytes).map_err(|err| TokenError::Id(err.to_string()))?;

        let secret_key = URL_SAFE_NO_PAD.decode(key_part).map_err(|_| TokenError::Key)?;

        Ok(Self { id, secret_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = ServerToken::generate();

        let restored: ServerToken = token.to_string().parse().expect("parse token");

        assert_eq!(restored.id, token.id);
        assert_eq!(restored.secret_key, token.secret_key);
    }

    #[test]
    fn test_token_rejects_garbage() {
        assert!("".parse::<ServerToken>().is_err());
        assert!("no-separator-here".parse::<ServerToken>().is_err());
        assert!("a.b.c".parse::<ServerToken>().is_err());
        assert!("!!!.???".parse::<ServerToken>().is_err());

        // valid shape but the ID half is not 16 bytes
        let short = format!("{}.{}", URL_SAFE_NO_PAD.encode(b"short"), URL_SAFE_NO_PAD.encode(b"key"));
        assert!(short.parse::<ServerToken>().is_err());
    }
}
