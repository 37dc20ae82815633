//! Shared hashing abstraction.
//!
//! Mirrors [`crate::clock::Clock`]'s injectable-dependency shape: every
//! module that needs a fingerprint or content hash (`options_signature`,
//! `Fingerprint::compute`, `ResourceNamer`'s sharding, `OutputResource`'s
//! inline content hash, `Resource::fill_in_partition_input_info`) takes a
//! `&dyn Hasher` rather than calling `blake3` directly, so a
//! [`ServerContext`](crate::server_context::ServerContext) can swap the
//! implementation in one place (spec §4.10 "the hasher").

/// A non-cryptographic fingerprint/content hasher (spec §4.10).
pub trait Hasher: Send + Sync {
    /// Hashes `bytes`, returning a lowercase hex digest.
    fn hash_hex(&self, bytes: &[u8]) -> String;

    /// Length, in hex characters, of a digest this hasher produces —
    /// used by [`crate::url_codec::ResourceNamer::eventual_len`] to size
    /// the `hash`/`signature` segments before they're filled in.
    fn hex_len(&self) -> usize;
}

/// The default hasher, backed by `blake3`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    fn hash_hex(&self, bytes: &[u8]) -> String {
        blake3::hash(bytes).to_hex().to_string()
    }

    fn hex_len(&self) -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_hasher_is_deterministic() {
        let hasher = Blake3Hasher;
        assert_eq!(hasher.hash_hex(b"abc"), hasher.hash_hex(b"abc"));
        assert_ne!(hasher.hash_hex(b"abc"), hasher.hash_hex(b"abd"));
        assert_eq!(hasher.hash_hex(b"abc").len(), hasher.hex_len());
    }
}
