//! Per-device credentials. Only the SHA-256 digest is ever stored.

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::utils::sha256_hex;

const CREDENTIAL_BYTES: usize = 32;

pub fn generate() -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash(credential: &str) -> String {
    sha256_hex(credential.as_bytes())
}

pub fn verify(credential: &str, stored_hash: &str) -> bool {
    !credential.is_empty() && hash(credential).as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_credentials_are_unique_hex() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), CREDENTIAL_BYTES * 2);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn verify_against_hash() {
        let cred = generate();
        let stored = hash(&cred);
        assert!(verify(&cred, &stored));
        assert!(!verify(&generate(), &stored));
        assert!(!verify("", &hash("")));
        assert!(!verify(&cred, &stored[..32]));
    }
}
