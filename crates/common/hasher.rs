use blake2::digest::{Update as Blake2Update, VariableOutput};
use blake2::Blake2bVar;
use ethereum_types::H256;
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};
use std::hash::Hasher as _;
use twox_hash::XxHash64;

/// One-shot digests over byte slices.
///
/// All chain-facing identifiers (block hashes, trie merkle values) use
/// `blake2b_256`; the twox family exists for non-cryptographic storage keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hasher;

impl Hasher {
    pub fn blake2b_256(data: &[u8]) -> H256 {
        let mut out = [0u8; 32];
        blake2b(data, &mut out);
        H256(out)
    }

    pub fn blake2b_128(data: &[u8]) -> [u8; 16] {
        let mut out = [0u8; 16];
        blake2b(data, &mut out);
        out
    }

    pub fn blake2b_64(data: &[u8]) -> [u8; 8] {
        let mut out = [0u8; 8];
        blake2b(data, &mut out);
        out
    }

    pub fn twox_64(data: &[u8]) -> [u8; 8] {
        let mut out = [0u8; 8];
        twox(data, &mut out);
        out
    }

    pub fn twox_128(data: &[u8]) -> [u8; 16] {
        let mut out = [0u8; 16];
        twox(data, &mut out);
        out
    }

    pub fn twox_256(data: &[u8]) -> H256 {
        let mut out = [0u8; 32];
        twox(data, &mut out);
        H256(out)
    }

    pub fn keccak_256(data: &[u8]) -> H256 {
        H256::from_slice(Keccak256::digest(data).as_slice())
    }

    pub fn sha2_256(data: &[u8]) -> H256 {
        H256::from_slice(Sha256::digest(data).as_slice())
    }
}

fn blake2b(data: &[u8], out: &mut [u8]) {
    let mut hasher = Blake2bVar::new(out.len()).expect("output size is 8..=32 bytes");
    hasher.update(data);
    hasher
        .finalize_variable(out)
        .expect("buffer matches the requested output size");
}

// The N-byte twox digest is the concatenation of 64-bit xxHash runs with
// consecutive seeds, each emitted little-endian.
fn twox(data: &[u8], out: &mut [u8]) {
    for (seed, chunk) in out.chunks_exact_mut(8).enumerate() {
        let mut hasher = XxHash64::with_seed(seed as u64);
        hasher.write(data);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn blake2b_256_known_vector() {
        // blake2b-256 of the empty string
        assert_eq!(
            Hasher::blake2b_256(b"").0,
            hex!("0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8")
        );
    }

    #[test]
    fn blake2b_widths_are_prefixes_of_nothing() {
        // distinct widths are independent digests, not truncations
        let h256 = Hasher::blake2b_256(b"abc");
        let h128 = Hasher::blake2b_128(b"abc");
        assert_ne!(&h256.0[..16], &h128[..]);
    }

    #[test]
    fn twox_128_known_vector() {
        // twox_128("") as used for well-known storage prefixes
        assert_eq!(Hasher::twox_128(b""), hex!("99e9d85137db46ef4bbea33613baafd5"));
    }

    #[test]
    fn sha2_and_keccak_disagree() {
        assert_ne!(Hasher::sha2_256(b"abc"), Hasher::keccak_256(b"abc"));
    }
}
