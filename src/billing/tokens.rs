use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use super::models::{DownloadToken, IssuedToken, OrderStatus, SchoolId};
use super::store::{with_store_retry, LedgerStore};
use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};

const SECRET_BYTES: usize = 32;

/// Hex SHA-256 of a presented secret; the only form a token is stored in.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.trim().as_bytes()))
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// key: download-token-issuer -> single-use credentials for paid orders
#[derive(Clone)]
pub struct DownloadTokenIssuer {
    store: Arc<dyn LedgerStore>,
    config: BillingConfig,
}

impl DownloadTokenIssuer {
    pub fn new(store: Arc<dyn LedgerStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    /// Mints a token for a paid order, revoking whatever token was live before.
    pub async fn issue_token(
        &self,
        school_id: SchoolId,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<IssuedToken> {
        let order = self
            .store
            .find_order(school_id, order_id)
            .await?
            .ok_or_else(|| AppError::not_found("retail_order", order_id))?;
        if order.status != OrderStatus::Paid {
            return Err(AppError::conflict(
                "retail_order",
                order_id,
                format!(
                    "download tokens are issued only for paid orders, order is {}",
                    order.status.as_str()
                ),
            ));
        }

        let secret = generate_secret();
        let token = DownloadToken {
            id: Uuid::new_v4(),
            school_id,
            order_id,
            secret_hash: hash_secret(&secret),
            expires_at: now + self.config.token_ttl,
            consumed_at: None,
            revoked_at: None,
            created_at: now,
        };
        let store = &self.store;
        let stored = &token;
        with_store_retry(&self.config, "replace_download_token", move || {
            store.replace_download_token(stored)
        })
        .await?;
        info!(
            %school_id,
            %order_id,
            token_id = %token.id,
            expires_at = %token.expires_at,
            "download token issued"
        );

        Ok(IssuedToken {
            token: secret,
            order_id,
            expires_at: token.expires_at,
        })
    }

    /// One-time redemption. A consumed, revoked or lapsed token is `Expired`; an unknown one is
    /// `NotFound`.
    pub async fn consume_token(
        &self,
        school_id: SchoolId,
        token: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        if token.trim().is_empty() {
            return Err(AppError::Validation {
                message: "download token is empty".to_string(),
                offending: vec!["token".to_string()],
            });
        }
        let store = &self.store;
        let secret_hash = hash_secret(token);
        let secret_hash = secret_hash.as_str();
        let order_id = with_store_retry(&self.config, "consume_download_token", move || {
            store.consume_download_token(school_id, secret_hash, now)
        })
        .await?;
        info!(%school_id, %order_id, "download token redeemed");
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_random_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), SECRET_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn hashing_ignores_surrounding_whitespace() {
        assert_eq!(hash_secret("abc"), hash_secret(" abc\n"));
        assert_ne!(hash_secret("abc"), "abc");
        assert_eq!(hash_secret("abc").len(), 64);
    }
}
