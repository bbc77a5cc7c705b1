//! Deterministic identity hashing and bucketing
//!
//! Two primitives underpin every allocation decision:
//!
//! - [`allocation_key`]: a salted SHA-256 of the identity. One-way, stable
//!   across restarts for a fixed salt, and the uniqueness key for
//!   allocations and holdout memberships. Rotating the salt invalidates
//!   reproducibility of every existing allocation.
//! - [`bucket_value`]: a uniform point in [0, 1) derived from the
//!   allocation key via SHA-512. A different hash function (not a
//!   truncation of the SHA-256 digest) keeps the bucket distribution
//!   independent of the key distribution when identical salts are reused
//!   for different purposes.

use sha2::{Digest, Sha256, Sha512};

use crate::errors::{AllocationError, AllocationResult};
use crate::experiment::UserContext;

/// Number of digest bits folded into the bucket value.
///
/// 53 bits is the f64 mantissa width: dividing a 53-bit integer by 2^53
/// produces every representable value in [0, 1) with equal probability
/// and can never round up to 1.0.
const BUCKET_BITS: u32 = 53;

/// Extract the hashing identity from a user context.
///
/// userId wins over sessionId when both are present, so a user keeps the
/// same variant after logging in on a session that already carried one.
pub fn identity_of(ctx: &UserContext) -> AllocationResult<&str> {
    ctx.user_id
        .as_deref()
        .or(ctx.session_id.as_deref())
        .ok_or(AllocationError::NoIdentity)
}

/// Derive the salted allocation key for an identity.
///
/// Hex-encoded SHA-256 of `identity:salt`. Pure function of its inputs.
pub fn allocation_key(identity: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map an allocation key to a uniform point in [0, 1).
///
/// SHA-512 of the key, top 53 bits of the first 8 digest bytes, divided
/// by 2^53.
pub fn bucket_value(allocation_key: &str) -> f64 {
    let mut hasher = Sha512::new();
    hasher.update(allocation_key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(prefix) >> (64 - BUCKET_BITS);

    bits as f64 / (1u64 << BUCKET_BITS) as f64
}

/// Bucket value under a purpose-specific domain, for derivations that
/// must be independent of experiment bucketing (holdout percentages).
pub fn domain_bucket_value(allocation_key: &str, domain: &str) -> f64 {
    let mut hasher = Sha512::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(allocation_key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(prefix) >> (64 - BUCKET_BITS);

    bits as f64 / (1u64 << BUCKET_BITS) as f64
}
