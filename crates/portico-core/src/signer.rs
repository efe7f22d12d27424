//! Pluggable signer capability for the handshake challenge.
//!
//! Production deployments load a native validator that mints and checks
//! challenge blobs; without one the handshake still functions, sending a
//! fixed placeholder and falling back to shared-token equality.

use crate::constants::SIGN_PLACEHOLDER;

/// Challenge mint-and-verify capability.
pub trait Signer: Send + Sync {
    /// Produce the challenge blob sent in the `sign` message.
    fn create_challenge(&self, seed: &str) -> String;

    /// Validate a client's `signedData` response.
    fn validate(&self, signed: &str) -> bool;
}

/// The challenge to send given an optional signer.
pub fn challenge_for(signer: Option<&dyn Signer>, seed: &str) -> String {
    match signer {
        Some(signer) => signer.create_challenge(seed),
        None => SIGN_PLACEHOLDER.to_string(),
    }
}
