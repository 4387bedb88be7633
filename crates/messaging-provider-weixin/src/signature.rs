use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Lowercase hex SHA-1 over the lexicographically sorted parts, joined
/// without a separator.
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Signature the platform attaches to the GET handshake.
pub fn handshake_signature(token: &str, timestamp: &str, nonce: &str) -> String {
    compute_signature(&[token, timestamp, nonce])
}

/// Case-sensitive comparison of a received signature with a computed one.
pub fn verify(expected: &str, computed: &str) -> bool {
    expected.len() == computed.len() && bool::from(expected.as_bytes().ct_eq(computed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_digest() {
        // digits sort before letters
        let expected = {
            let mut hasher = Sha1::new();
            hasher.update(b"14093043481634398466some token");
            hex::encode(hasher.finalize())
        };
        assert_eq!(
            handshake_signature("some token", "1409304348", "1634398466"),
            expected
        );
    }

    #[test]
    fn independent_of_argument_order() {
        let parts = ["some token", "1409304348", "1634398466"];
        let reference = compute_signature(&parts);
        assert_eq!(compute_signature(&[parts[2], parts[0], parts[1]]), reference);
        assert_eq!(compute_signature(&[parts[1], parts[2], parts[0]]), reference);
        assert_eq!(handshake_signature(parts[1], parts[0], parts[2]), reference);
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let sig = handshake_signature("token", "1", "2");
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn verify_rejects_mutations() {
        let sig = handshake_signature("token", "1", "2");
        assert!(verify(&sig, &sig));
        assert!(!verify(&sig.to_uppercase(), &sig));
        assert!(!verify(&sig[1..], &sig));
        assert!(!verify("", &sig));

        let mut mutated = sig.clone().into_bytes();
        mutated[7] = if mutated[7] == b'0' { b'1' } else { b'0' };
        let mutated = String::from_utf8(mutated).unwrap();
        assert!(!verify(&mutated, &sig));
    }
}
