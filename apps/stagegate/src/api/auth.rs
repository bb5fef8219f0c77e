//! # Authentication Module
//!
//! API key identity for the stagegate HTTP API.
//!
//! Each configured operator has one API key. The key is sent as
//! ```text
//! Authorization: Bearer <operator-api-key>
//! ```
//! and resolves to that operator's [`Principal`], which handlers read from
//! the request extensions. `/health` is always reachable.

use super::types::ApiError;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use stagegate_core::Principal;
use std::sync::Arc;
use subtle::ConstantTimeEq;

// =============================================================================
// OPERATOR DIRECTORY
// =============================================================================

/// API key to principal lookup.
#[derive(Clone, Default)]
pub struct OperatorDirectory {
    entries: Arc<Vec<(Vec<u8>, Principal)>>,
}

impl std::fmt::Debug for OperatorDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorDirectory")
            .field("operators", &self.entries.len())
            .finish()
    }
}

/// Compare over the longer of the two lengths so timing does not leak the
/// key length.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    let max_len = provided.len().max(expected.len());
    let mut padded_provided = vec![0u8; max_len];
    let mut padded_expected = vec![0u8; max_len];
    padded_provided[..provided.len()].copy_from_slice(provided);
    padded_expected[..expected.len()].copy_from_slice(expected);

    let bytes_match: bool = padded_provided.ct_eq(&padded_expected).into();
    bytes_match && provided.len() == expected.len()
}

impl OperatorDirectory {
    pub fn new(entries: Vec<(String, Principal)>) -> Self {
        Self {
            entries: Arc::new(
                entries
                    .into_iter()
                    .map(|(key, principal)| (key.into_bytes(), principal))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an API key. Every entry is compared.
    pub fn authenticate(&self, key: &str) -> Option<&Principal> {
        let provided = key.as_bytes();
        let mut found = None;
        for (expected, principal) in self.entries.iter() {
            if keys_match(provided, expected) && found.is_none() {
                found = Some(principal);
            }
        }
        found
    }
}

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// Resolve the caller and attach their [`Principal`] to the request.
///
/// - `/health` is always allowed (for load balancer checks)
/// - Everything else requires `Authorization: Bearer <key>` (or the raw key)
pub async fn operator_auth_middleware(
    State(operators): State<OperatorDirectory>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header_value) = auth_header else {
        tracing::warn!(
            event = "auth_failure",
            reason = "missing_authorization_header",
            "Missing Authorization header"
        );
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "Missing Authorization header",
        ));
    };

    let provided_key = header_value.strip_prefix("Bearer ").unwrap_or(header_value);
    match operators.authenticate(provided_key) {
        Some(principal) => {
            tracing::debug!(operator = %principal.id, "request authenticated");
            request.extensions_mut().insert(principal.clone());
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!(
                event = "auth_failure",
                reason = "invalid_api_key",
                "Authentication failed: invalid API key"
            );
            Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "Invalid API key",
            ))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::CapabilitySet;

    fn directory() -> OperatorDirectory {
        OperatorDirectory::new(vec![
            ("lead-key".to_string(), Principal::new("lead", CapabilitySet::supervisor())),
            ("frame-key".to_string(), Principal::new("frame", CapabilitySet::default())),
        ])
    }

    #[test]
    fn resolves_each_key_to_its_operator() {
        let dir = directory();
        assert_eq!(dir.authenticate("lead-key").map(|p| p.id.as_str()), Some("lead"));
        assert_eq!(dir.authenticate("frame-key").map(|p| p.id.as_str()), Some("frame"));
    }

    #[test]
    fn rejects_prefixes_and_unknown_keys() {
        let dir = directory();
        assert!(dir.authenticate("lead").is_none());
        assert!(dir.authenticate("lead-key-extra").is_none());
        assert!(dir.authenticate("").is_none());
    }

    #[test]
    fn debug_hides_keys() {
        assert!(!format!("{:?}", directory()).contains("lead-key"));
    }
}
