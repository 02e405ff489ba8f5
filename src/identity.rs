//! Identity provider collaborator.
//!
//! Turns an opaque bearer token into a stable user id. The core never takes
//! a user id from a request body; every tenant-scoped operation receives
//! the id produced here.
//!
//! [`HmacTokenVerifier`] accepts tokens of the form
//!
//! ```text
//! <user_id>.<hex(HMAC-SHA256(secret, user_id))>
//! ```

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DocError, Result};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve `token` to a user id, or fail with [`DocError::Unauthenticated`].
    async fn authenticate(&self, token: &str) -> Result<String>;
}

pub struct HmacTokenVerifier {
    /// Keyed MAC state, cloned per token.
    keyed: HmacSha256,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            anyhow::bail!("auth secret must not be empty");
        }
        let keyed = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow::anyhow!("invalid auth secret: {}", e))?;
        Ok(Self { keyed })
    }

    fn mac(&self, user_id: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(user_id.as_bytes());
        mac
    }

    /// Mint a token for `user_id`.
    pub fn issue(&self, user_id: &str) -> String {
        let tag = hex::encode(self.mac(user_id).finalize().into_bytes());
        format!("{}.{}", user_id, tag)
    }

    pub fn verify(&self, token: &str) -> Result<String> {
        let (user_id, tag) = token
            .rsplit_once('.')
            .ok_or_else(|| DocError::Unauthenticated("malformed token".to_string()))?;
        if user_id.is_empty() {
            return Err(DocError::Unauthenticated("malformed token".to_string()));
        }
        let tag = hex::decode(tag)
            .map_err(|_| DocError::Unauthenticated("malformed token".to_string()))?;
        self.mac(user_id)
            .verify_slice(&tag)
            .map_err(|_| DocError::Unauthenticated("invalid token signature".to_string()))?;
        Ok(user_id.to_string())
    }
}

#[async_trait]
impl IdentityProvider for HmacTokenVerifier {
    async fn authenticate(&self, token: &str) -> Result<String> {
        self.verify(token.trim())
    }
}
