//! Stable identifier derivation.

use crate::canonical::{sha256_hex, to_canonical_bytes, Value};

/// Content-derived identifier: SHA-256 over the canonical form of the parts.
///
/// No randomness anywhere; the same parts always produce the same id, on any
/// host, in any run.
pub fn stable_id(parts: &[&str]) -> String {
    let tuple = Value::Array(parts.iter().map(|p| Value::Str((*p).to_string())).collect());
    sha256_hex(&to_canonical_bytes(&tuple))
}
