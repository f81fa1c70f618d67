//! Content-addressed cache key generation.

use sha2::{Digest, Sha256};

use crate::rows::SqlValue;

/// Compute a content-addressed cache key for a statement and its parameters.
///
/// Each parameter is hashed with its storage class, so `1` and `'1'` give
/// different keys.
pub fn compute_query_key(sql: &str, params: &[SqlValue]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.trim().as_bytes());
    for param in params {
        hasher.update(b"\n");
        match param {
            SqlValue::Null => hasher.update(b"n:"),
            SqlValue::Integer(i) => {
                hasher.update(b"i:");
                hasher.update(i.to_le_bytes());
            }
            SqlValue::Real(f) => {
                hasher.update(b"r:");
                hasher.update(f.to_le_bytes());
            }
            SqlValue::Text(s) => {
                hasher.update(b"t:");
                hasher.update(s.as_bytes());
            }
            SqlValue::Blob(b) => {
                hasher.update(b"b:");
                hasher.update(b);
            }
        }
    }
    hex::encode(hasher.finalize())
}
