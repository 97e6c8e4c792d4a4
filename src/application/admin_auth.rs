use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdminAuthError {
    #[error("admin API is disabled")]
    Disabled,
    #[error("missing admin token")]
    Missing,
    #[error("invalid admin token")]
    Invalid,
}

/// Checks bearer tokens against the configured digest.
#[derive(Debug, Clone, Default)]
pub struct AdminAuth {
    token_hash: Option<Vec<u8>>,
}

impl AdminAuth {
    pub fn new(token_hash: Option<Vec<u8>>) -> Self {
        Self { token_hash }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Some(hash_token(token)))
    }

    pub fn is_enabled(&self) -> bool {
        self.token_hash.is_some()
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<(), AdminAuthError> {
        let expected = self.token_hash.as_ref().ok_or(AdminAuthError::Disabled)?;
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AdminAuthError::Missing)?;

        let hashed_input = hash_token(token);
        if expected.ct_eq(&hashed_input).unwrap_u8() == 0 {
            return Err(AdminAuthError::Invalid);
        }
        Ok(())
    }
}

pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
