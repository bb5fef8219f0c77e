//! # Checkpoint Tokens
//!
//! A checkpoint token binds an order to a target stage. It is printed on the
//! physical scan medium as compact JSON:
//!
//! ```text
//! {"orderId":42,"stageId":1,"timestamp":1760000000,"signature":"<64 hex chars>"}
//! ```
//!
//! The signature is `HMAC-SHA256(secret, "{orderId}:{stageId}:{timestamp}")`,
//! lowercase hex. Because the signature covers every field, a token can be
//! checked for integrity and age without a database round trip; only the
//! single-use check needs the store.
//!
//! The same JSON may also travel as base64url without padding, which is
//! friendlier to QR encoders. [`TokenSigner::verify`] accepts both forms.
//!
//! Verification order:
//! 1. parse, failing with `Malformed`
//! 2. signature, failing with `Tampered`
//! 3. age, failing with `Expired`

use crate::error::{EngineError, TokenError};
use crate::primitives::{MAX_RAW_TOKEN_LENGTH, MIN_SECRET_LENGTH};
use crate::types::{OperatorId, OrderId, StageIndex, TokenId};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of a SHA-256 MAC.
const SIGNATURE_HEX_LEN: usize = 64;

// =============================================================================
// WIRE FORM
// =============================================================================

/// The externalized token, exactly as it is printed or encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignedToken {
    pub order_id: OrderId,
    pub stage_id: StageIndex,
    pub timestamp: u64,
    pub signature: String,
}

impl SignedToken {
    /// Compact JSON form.
    pub fn to_json(&self) -> Result<String, TokenError> {
        serde_json::to_string(self).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    /// base64url (no padding) of the JSON form, for QR codes.
    pub fn to_scan_code(&self) -> Result<String, TokenError> {
        Ok(URL_SAFE_NO_PAD.encode(self.to_json()?))
    }
}

/// Claims of a token whose signature and age checked out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedToken {
    pub order_id: OrderId,
    pub stage_id: StageIndex,
    pub issued_at: u64,
    pub signature: String,
}

// =============================================================================
// STORED FORM
// =============================================================================

/// Why a token stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deactivation {
    /// Scanned and used for a confirm.
    Consumed,
    /// Replaced by a newer token, or the order moved on without it.
    Superseded,
}

/// A token as the store keeps it. Only `is_active` and `deactivation` ever change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub order_id: OrderId,
    pub stage_id: StageIndex,
    pub issued_at: u64,
    pub expires_at: u64,
    pub signature: String,
    pub issued_by: OperatorId,
    pub is_active: bool,
    pub deactivation: Option<Deactivation>,
}

impl TokenRecord {
    /// The error a caller gets for presenting this token again.
    #[must_use]
    pub fn inactive_error(&self) -> TokenError {
        match self.deactivation {
            Some(Deactivation::Superseded) => TokenError::Superseded,
            Some(Deactivation::Consumed) | None => TokenError::AlreadyConsumed,
        }
    }
}

/// A token waiting for its id inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewToken {
    pub order_id: OrderId,
    pub stage_id: StageIndex,
    pub issued_at: u64,
    pub expires_at: u64,
    pub signature: String,
    pub issued_by: OperatorId,
}

impl NewToken {
    #[must_use]
    pub fn into_record(self, id: TokenId) -> TokenRecord {
        TokenRecord {
            id,
            order_id: self.order_id,
            stage_id: self.stage_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            signature: self.signature,
            issued_by: self.issued_by,
            is_active: true,
            deactivation: None,
        }
    }
}

// =============================================================================
// SIGNER
// =============================================================================

/// Holds the keyed MAC and the lifetime policy.
///
/// `Debug` never prints the secret.
#[derive(Clone)]
pub struct TokenSigner {
    keyed: HmacSha256,
    max_lifetime_secs: u64,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"<redacted>")
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .finish()
    }
}

impl TokenSigner {
    /// Create a signer. The secret must be at least `MIN_SECRET_LENGTH` bytes.
    pub fn new(secret: impl Into<Vec<u8>>, max_lifetime_secs: u64) -> Result<Self, EngineError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(EngineError::invalid(
                "token.secret",
                format!("must be at least {MIN_SECRET_LENGTH} bytes"),
            ));
        }
        if max_lifetime_secs == 0 {
            return Err(EngineError::invalid("token.max_lifetime_secs", "must be positive"));
        }
        let keyed = HmacSha256::new_from_slice(&secret)
            .map_err(|e| EngineError::invalid("token.secret", e.to_string()))?;
        Ok(Self {
            keyed,
            max_lifetime_secs,
        })
    }

    /// Expiry instant of a token issued at `issued_at`.
    #[must_use]
    pub fn expires_at(&self, issued_at: u64) -> u64 {
        issued_at.saturating_add(self.max_lifetime_secs)
    }

    fn mac(&self, order_id: OrderId, stage_id: StageIndex, timestamp: u64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(format!("{order_id}:{stage_id}:{timestamp}").as_bytes());
        mac
    }

    /// Sign the binding of `order_id` to `stage_id` at `timestamp`.
    #[must_use]
    pub fn sign(&self, order_id: OrderId, stage_id: StageIndex, timestamp: u64) -> SignedToken {
        let signature = hex::encode(self.mac(order_id, stage_id, timestamp).finalize().into_bytes());
        SignedToken {
            order_id,
            stage_id,
            timestamp,
            signature,
        }
    }

    /// Parse a raw token (JSON or base64url JSON) without checking the signature.
    pub fn parse(raw: &str) -> Result<SignedToken, TokenError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TokenError::Malformed("empty token".to_string()));
        }
        if trimmed.len() > MAX_RAW_TOKEN_LENGTH {
            return Err(TokenError::Malformed(format!(
                "token exceeds {MAX_RAW_TOKEN_LENGTH} bytes"
            )));
        }
        let json = if trimmed.starts_with('{') {
            trimmed.as_bytes().to_vec()
        } else {
            URL_SAFE_NO_PAD
                .decode(trimmed)
                .map_err(|_| TokenError::Malformed("neither JSON nor base64url".to_string()))?
        };
        serde_json::from_slice(&json).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    /// Verify a raw token against the secret and the lifetime policy at `now`.
    pub fn verify(&self, raw: &str, now: u64) -> Result<VerifiedToken, TokenError> {
        let token = Self::parse(raw)?;

        let well_formed = token.signature.len() == SIGNATURE_HEX_LEN
            && token
                .signature
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(TokenError::Tampered);
        }
        let provided = hex::decode(&token.signature).map_err(|_| TokenError::Tampered)?;
        self.mac(token.order_id, token.stage_id, token.timestamp)
            .verify_slice(&provided)
            .map_err(|_| TokenError::Tampered)?;

        let age_secs = now.saturating_sub(token.timestamp);
        if age_secs > self.max_lifetime_secs {
            return Err(TokenError::Expired {
                age_secs,
                max_lifetime_secs: self.max_lifetime_secs,
            });
        }

        Ok(VerifiedToken {
            order_id: token.order_id,
            stage_id: token.stage_id,
            issued_at: token.timestamp,
            signature: token.signature,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
