use sha2::{Digest, Sha256};

/// Server clock, unix seconds. The only time source used for ordering and retention.
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
