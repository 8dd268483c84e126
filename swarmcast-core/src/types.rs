//! Identifiers and key-derivation helpers shared across the fabric.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(StreamId);
string_id!(TrackId);
string_id!(NodeAddress);

/// DHT lookup key for a single track: `sha256(stream_id:track_id:rid)`, hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    /// Reconstruct a key from its wire-transmitted hex form, as received
    /// in a `Subscription` message. Does not re-derive or validate the
    /// hash; callers only ever pass along a key a `Publish` handler
    /// already derived and announced.
    pub fn from_wire(raw: String) -> Self {
        Self(raw)
    }

    pub fn derive(stream_id: &StreamId, track_id: &TrackId, rid: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stream_id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(track_id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(rid.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic ed25519 signing key for this key's BEP-44 record,
    /// seeded from `sha256(key)` so any node can independently derive
    /// the same keypair for a given lookup key.
    pub fn signing_key(&self) -> SigningKey {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        SigningKey::from_bytes(&seed)
    }

    /// BEP-44 target address: `sha1(verifying key bytes)`.
    pub fn dht_target(&self) -> [u8; 20] {
        let verifying = self.signing_key().verifying_key();
        let mut hasher = Sha1::new();
        hasher.update(verifying.as_bytes());
        hasher.finalize().into()
    }

    /// Sign `value` with this key's derived signing key, for BEP-44 puts.
    pub fn sign(&self, value: &[u8]) -> [u8; 64] {
        self.signing_key().sign(value).to_bytes()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = StreamKey::derive(&"s1".into(), &"t1".into(), "");
        let b = StreamKey::derive(&"s1".into(), &"t1".into(), "");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_distinguishes_inputs() {
        let a = StreamKey::derive(&"s1".into(), &"t1".into(), "");
        let b = StreamKey::derive(&"s1".into(), &"t2".into(), "");
        assert_ne!(a, b);
    }

    #[test]
    fn signing_key_is_stable_across_calls() {
        let key = StreamKey::derive(&"s1".into(), &"t1".into(), "");
        assert_eq!(
            key.signing_key().to_bytes(),
            key.signing_key().to_bytes()
        );
    }

    #[test]
    fn dht_target_matches_verifying_key_hash() {
        let key = StreamKey::derive(&"s1".into(), &"t1".into(), "");
        let verifying = key.signing_key().verifying_key();
        let mut hasher = Sha1::new();
        hasher.update(verifying.as_bytes());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(key.dht_target(), expected);
    }
}
