use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{Result, VmError};

/// Number of random bytes behind every session token.
pub const TOKEN_BYTES: usize = 32;

/// Opaque handle a shim presents to claim an I/O session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(String);

impl Token {
    /// Draw `n_bytes` from the OS random source and render them as padded
    /// URL-safe base64. Entropy failures are returned, never retried.
    pub fn generate(n_bytes: usize) -> Result<Token> {
        let mut bytes = vec![0u8; n_bytes];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| VmError::TokenGeneration(e.to_string()))?;
        Ok(Token(URL_SAFE.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
