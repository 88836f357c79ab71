use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the exact bytes.
///
/// Every stored script and image blob carries this value as its etag;
/// clients treat it as opaque and equality is byte equality.
pub fn etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
