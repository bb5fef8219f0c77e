//! # Engine Primitives
//!
//! Reference policy constants. They are the defaults; the application
//! configuration may override the token lifetime and the retry policy.

/// Maximum checkpoint token lifetime: 30 days.
///
/// A token verified at `issued_at + MAX_TOKEN_LIFETIME_SECS` is still valid;
/// one second later it is expired.
pub const DEFAULT_MAX_TOKEN_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// Attempts made by a unit of work before surfacing `ConcurrencyExhausted`.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Backoff base: the delay after failed attempt `n` is `n * base`.
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 100;

/// Minimum length of the HMAC signing secret in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length of a raw token accepted by `verify`.
///
/// The JSON form is well under 200 bytes; anything larger is rejected as
/// malformed before parsing.
pub const MAX_RAW_TOKEN_LENGTH: usize = 1024;

/// Maximum length of free-text notes and rework reasons.
pub const MAX_NOTES_LENGTH: usize = 4096;

/// Maximum length of a material or stage name.
pub const MAX_NAME_LENGTH: usize = 128;
