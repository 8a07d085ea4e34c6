//! Shared cluster-key handling.
//!
//! Every inter-node request carries the pre-shared cluster key. Nodes keep
//! only its SHA-256 digest and compare digests, never the raw strings.

use sha2::{Digest, Sha256};
use std::fmt;

/// Header carrying the cluster key on every inter-node request.
pub const CLUSTER_KEY_HEADER: &str = "x-vigil-cluster-key";

/// A pre-shared cluster key.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterKey {
    plaintext: String,
    digest: [u8; 32],
}

impl ClusterKey {
    /// Wrap a plaintext key.
    pub fn new(plaintext: impl Into<String>) -> Self {
        let plaintext = plaintext.into();
        let digest = digest(&plaintext);
        Self { plaintext, digest }
    }

    /// The raw key, for sending in a request header.
    pub fn expose(&self) -> &str {
        &self.plaintext
    }

    /// Hex-encoded SHA-256 digest of the key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.digest)
    }

    /// Whether `presented` matches this key.
    pub fn verify(&self, presented: &str) -> bool {
        let other = digest(presented);
        // Fold every byte so the comparison time does not depend on the
        // position of the first mismatch.
        self.digest
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.plaintext.is_empty()
    }
}

impl fmt::Debug for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterKey")
            .field("fingerprint", &&self.fingerprint()[..12])
            .finish()
    }
}

fn digest(input: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}
