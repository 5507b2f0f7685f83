//! Content addressing for posts.
//!
//! Two nodes that hold the same immutable fields must derive the same
//! fingerprint, so the concatenation order and placeholder below are fixed.

use crate::database::models::PostRecord;
use crate::utils::format_creation_date;
use sha2::{Digest, Sha256};

/// Stands in for any missing field in the hashed concatenation.
pub const EMPTY_FIELD: &str = ".EMPTY.";

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// Topics hash their subject alone; everything else hashes every immutable
/// content field.
pub fn compute(post: &PostRecord) -> String {
    if post.parent_fingerprint.is_none() {
        return sha256_hex(post.subject.as_deref().unwrap_or(EMPTY_FIELD).as_bytes());
    }

    let creation = post.creation_date.map(format_creation_date);
    let protocol = post.protocol_version.map(|version| version.to_string());
    let fields = [
        post.subject.as_deref(),
        post.body.as_deref(),
        creation.as_deref(),
        protocol.as_deref(),
        post.owner_username.as_deref(),
        post.owner_fingerprint.as_deref(),
        post.parent_fingerprint.as_deref(),
    ];

    let mut buffer = String::new();
    for field in fields {
        buffer.push_str(field.unwrap_or(EMPTY_FIELD));
    }
    sha256_hex(buffer.as_bytes())
}

/// Whether the stored fingerprint matches the content it claims to address.
pub fn verify(post: &PostRecord) -> bool {
    compute(post) == post.fingerprint
}
