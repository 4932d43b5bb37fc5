//! The token handshake authenticating the forwarding client.
//!
//! The pre-shared token never crosses the wire. The server draws 512 bytes
//! from a CSPRNG, splits them into two nonces and sends both to the client.
//! The client proves knowledge of the token by returning
//! `SHA256(SHA256(token ‖ nonce1) ‖ nonce2)`, which the server compares in
//! constant time against the digest it computed when issuing the challenge.
//!
//! A fresh pair of nonces is drawn for every connection, so a captured
//! digest cannot be replayed against a later challenge.

use rand::{CryptoRng, RngCore};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq as _;

/// Length of each of the two challenge nonces.
pub const NONCE_LEN: usize = 256;

/// Length of the client's response digest.
pub const DIGEST_LEN: usize = 32;

/// An issued challenge: the nonces to send and the digest to expect back.
pub struct Challenge {
    nonces: [u8; NONCE_LEN * 2],
    expected: [u8; DIGEST_LEN],
}

impl Challenge {
    pub fn new(token: &SecretString, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let mut nonces = [0u8; NONCE_LEN * 2];
        rng.fill_bytes(&mut nonces);

        let expected = digest(token, &nonces[..NONCE_LEN], &nonces[NONCE_LEN..]);

        Self { nonces, expected }
    }

    /// The `nonce1 ‖ nonce2` message to send to the client.
    pub fn nonces(&self) -> &[u8] {
        &self.nonces
    }

    /// Compares a response against the expected digest in constant time.
    pub fn verify(&self, response: &[u8]) -> bool {
        if response.len() != DIGEST_LEN {
            return false;
        }

        self.expected.as_slice().ct_eq(response).into()
    }
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge").finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected {expected} bytes of nonces, got {actual}")]
pub struct BadChallengeLength {
    expected: usize,
    actual: usize,
}

/// Computes the response digest for a received `nonce1 ‖ nonce2` challenge.
pub fn respond(token: &SecretString, nonces: &[u8]) -> Result<[u8; DIGEST_LEN], BadChallengeLength> {
    if nonces.len() != NONCE_LEN * 2 {
        return Err(BadChallengeLength {
            expected: NONCE_LEN * 2,
            actual: nonces.len(),
        });
    }

    Ok(digest(token, &nonces[..NONCE_LEN], &nonces[NONCE_LEN..]))
}

fn digest(token: &SecretString, nonce1: &[u8], nonce2: &[u8]) -> [u8; DIGEST_LEN] {
    let inner = Sha256::new()
        .chain_update(token.expose_secret().as_bytes())
        .chain_update(nonce1)
        .finalize();

    Sha256::new()
        .chain_update(inner)
        .chain_update(nonce2)
        .finalize()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn token(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn response_matches_challenge() {
        let challenge = Challenge::new(&token("hunter2"), &mut OsRng);

        let response = respond(&token("hunter2"), challenge.nonces()).unwrap();

        assert!(challenge.verify(&response));
    }

    #[test]
    fn wrong_token_fails_verification() {
        let challenge = Challenge::new(&token("a"), &mut OsRng);

        let response = respond(&token("b"), challenge.nonces()).unwrap();

        assert!(!challenge.verify(&response));
    }

    #[test]
    fn any_nonce_bit_flip_changes_the_digest() {
        let challenge = Challenge::new(&token("hunter2"), &mut OsRng);
        let baseline = respond(&token("hunter2"), challenge.nonces()).unwrap();

        // One flip in the first nonce, one in the second.
        for index in [17, NONCE_LEN + 17] {
            let mut nonces = challenge.nonces().to_vec();
            nonces[index] ^= 0x01;

            let response = respond(&token("hunter2"), &nonces).unwrap();

            assert_ne!(response, baseline);
            assert!(!challenge.verify(&response));
        }
    }

    #[test]
    fn token_bit_flip_changes_the_digest() {
        let challenge = Challenge::new(&token("hunter2"), &mut OsRng);

        let baseline = respond(&token("hunter2"), challenge.nonces()).unwrap();
        let flipped = respond(&token("hunter3"), challenge.nonces()).unwrap();

        assert_ne!(baseline, flipped);
    }

    #[test]
    fn rejects_short_and_long_nonces() {
        assert!(respond(&token("t"), &[0u8; 511]).is_err());
        assert!(respond(&token("t"), &[0u8; 513]).is_err());
    }

    #[test]
    fn rejects_short_response() {
        let challenge = Challenge::new(&token("t"), &mut OsRng);

        assert!(!challenge.verify(&[]));
        assert!(!challenge.verify(&[0u8; DIGEST_LEN - 1]));
        assert!(!challenge.verify(&[0u8; DIGEST_LEN + 1]));
    }

    #[test]
    fn nonces_are_unique_per_challenge() {
        let first = Challenge::new(&token("t"), &mut OsRng);
        let second = Challenge::new(&token("t"), &mut OsRng);

        assert_ne!(first.nonces(), second.nonces());
    }
}
