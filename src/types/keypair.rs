/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Wrapper around the replica's Ed25519 keypair.

pub use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::basic::SignatureBytes;

/// The keypair a replica uses to sign blocks it proposes and votes it casts.
///
/// Wraps an [`ed25519_dalek::SigningKey`]. Immutable after startup; cheap to clone into the
/// subsystems that need to sign.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Create a new `Keypair` wrapping `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign `message`, returning the signature bytes.
    pub(crate) fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the verifying (public) key of this `Keypair`.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}
