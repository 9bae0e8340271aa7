//! Userspace computation of fs-verity digests.
//!
//! The fs-verity digest is a cryptographic hash over the fs-verity
//! descriptor, which itself contains the root hash of a Merkle tree with an
//! arity determined by the block size and the output size of the chosen hash
//! algorithm.  The block size is hardcoded to 4096 and salt is not supported.
//!
//! See <https://www.kernel.org/doc/html/latest/filesystems/fsverity.html#file-digest-computation>

use core::{fmt, hash::Hash};

use hex::FromHexError;
use sha2::{digest::FixedOutputReset, digest::Output, Digest, Sha256, Sha512};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const LG_BLKSZ: u8 = 12;
const BLKSZ: usize = 1 << LG_BLKSZ;

/// A hash value usable as an fs-verity digest.
pub trait FsVerityHashValue
where
    Self: Clone,
    Self: From<Output<Self::Digest>>,
    Self: FromBytes + Immutable + IntoBytes + KnownLayout + Unaligned,
    Self: Hash + Eq,
    Self: fmt::Debug,
    Self: Send + Sync + Unpin + 'static,
{
    /// The underlying hash digest algorithm type.
    type Digest: Digest + FixedOutputReset + fmt::Debug;
    /// The fs-verity algorithm identifier (1 for SHA-256, 2 for SHA-512).
    const ALGORITHM: u8;
    /// An all-zeros hash value.
    const EMPTY: Self;
    /// The algorithm identifier string ("sha256" or "sha512").
    const ID: &str;

    /// Parses a hash value from a hexadecimal string.
    fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, FromHexError> {
        let mut value = Self::EMPTY;
        hex::decode_to_slice(hex.as_ref(), value.as_mut_bytes())?;
        Ok(value)
    }

    /// Formats the hash value as a hexadecimal string.
    fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Formats the hash value as "algorithm:hex" (e.g. "sha256:abc...").
    fn to_id(&self) -> String {
        format!("{}:{}", Self::ID, self.to_hex())
    }
}

/// A 32-byte SHA-256 fs-verity hash value.
#[derive(Clone, Eq, FromBytes, Hash, Immutable, IntoBytes, KnownLayout, PartialEq, Unaligned)]
#[repr(C)]
pub struct Sha256HashValue([u8; 32]);

impl From<Output<Sha256>> for Sha256HashValue {
    fn from(value: Output<Sha256>) -> Self {
        Self(value.into())
    }
}

impl From<[u8; 32]> for Sha256HashValue {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Sha256HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl FsVerityHashValue for Sha256HashValue {
    type Digest = Sha256;
    const ALGORITHM: u8 = 1;
    const EMPTY: Self = Self([0; 32]);
    const ID: &str = "sha256";
}

/// A 64-byte SHA-512 fs-verity hash value.
#[derive(Clone, Eq, FromBytes, Hash, Immutable, IntoBytes, KnownLayout, PartialEq, Unaligned)]
#[repr(C)]
pub struct Sha512HashValue([u8; 64]);

impl From<Output<Sha512>> for Sha512HashValue {
    fn from(value: Output<Sha512>) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for Sha512HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha512:{}", self.to_hex())
    }
}

impl FsVerityHashValue for Sha512HashValue {
    type Digest = Sha512;
    const ALGORITHM: u8 = 2;
    const EMPTY: Self = Self([0; 64]);
    const ID: &str = "sha512";
}

#[derive(Debug)]
struct FsVerityLayer<H: FsVerityHashValue> {
    context: H::Digest,
    remaining: usize,
}

impl<H: FsVerityHashValue> FsVerityLayer<H> {
    fn new() -> Self {
        Self {
            context: H::Digest::new(),
            remaining: BLKSZ,
        }
    }

    fn add_data(&mut self, data: &[u8]) {
        self.context.update(data);
        self.remaining -= data.len();
    }

    fn complete(&mut self) -> H {
        self.context.update([0].repeat(self.remaining));
        self.remaining = BLKSZ;
        self.context.finalize_reset().into()
    }
}

#[derive(Debug)]
struct FsVerityHasher<H: FsVerityHashValue> {
    layers: Vec<FsVerityLayer<H>>,
    value: Option<H>,
    n_bytes: u64,
}

impl<H: FsVerityHashValue> FsVerityHasher<H> {
    fn new() -> Self {
        Self {
            layers: vec![],
            value: None,
            n_bytes: 0,
        }
    }

    /// Adds one data block.  Every block must be full-size except the last.
    fn add_block(&mut self, data: &[u8]) {
        if let Some(value) = self.value.take() {
            // We had a complete value, but now we're adding new data.
            // This means that we need to add a new hash layer...
            let mut new_layer = FsVerityLayer::new();
            new_layer.add_data(value.as_bytes());
            self.layers.push(new_layer);
        }

        // Get the value of this block
        let mut context = FsVerityLayer::<H>::new();
        context.add_data(data);
        let mut value = context.complete();
        self.n_bytes += data.len() as u64;

        for layer in self.layers.iter_mut() {
            // We have a layer we need to hash this value into
            layer.add_data(value.as_bytes());
            if layer.remaining != 0 {
                return;
            }
            // ...but now this layer itself is now complete, so get the value of *it*.
            value = layer.complete();
        }

        // If we made it this far, we completed the last layer and have a value.  Store it.
        self.value = Some(value);
    }

    fn root_hash(&mut self) -> H {
        if let Some(value) = &self.value {
            value.clone()
        } else {
            let mut value = H::EMPTY;

            for layer in self.layers.iter_mut() {
                if value != H::EMPTY {
                    layer.add_data(value.as_bytes());
                }
                if layer.remaining != BLKSZ {
                    value = layer.complete();
                } else {
                    value = H::EMPTY;
                }
            }

            self.value = Some(value.clone());

            value
        }
    }

    fn digest(&mut self) -> H {
        let mut context = H::Digest::new();
        context.update(1u8.to_le_bytes()); /* version */
        context.update(H::ALGORITHM.to_le_bytes()); /* hash_algorithm */
        context.update(LG_BLKSZ.to_le_bytes()); /* log_blocksize */
        context.update(0u8.to_le_bytes()); /* salt_size */
        context.update([0; 4]); /* reserved */
        context.update(self.n_bytes.to_le_bytes());
        context.update(self.root_hash().as_bytes());
        context.update([0].repeat(64 - size_of::<H>()));
        context.update([0; 32]); /* salt */
        context.update([0; 144]); /* reserved */
        context.finalize().into()
    }
}

/// A streaming fs-verity digest context.
///
/// Accepts arbitrarily-sized writes and buffers them into Merkle tree
/// blocks.  This is how the image writer tees every serialized byte into
/// the digest, and how per-file content digests are computed from readers.
#[derive(Debug)]
pub struct FsVerityStream<H: FsVerityHashValue = Sha256HashValue> {
    hasher: FsVerityHasher<H>,
    block: Vec<u8>,
}

impl<H: FsVerityHashValue> FsVerityStream<H> {
    pub fn new() -> Self {
        Self {
            hasher: FsVerityHasher::new(),
            block: Vec::with_capacity(BLKSZ),
        }
    }

    /// Feeds more data into the digest.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let want = BLKSZ - self.block.len();
            let (chunk, rest) = data.split_at(want.min(data.len()));
            self.block.extend_from_slice(chunk);
            data = rest;

            if self.block.len() == BLKSZ {
                self.hasher.add_block(&self.block);
                self.block.clear();
            }
        }
    }

    /// Consumes the context and returns the fs-verity digest of everything
    /// fed to [`Self::update`].
    pub fn finalize(mut self) -> H {
        if !self.block.is_empty() {
            self.hasher.add_block(&self.block);
        }
        self.hasher.digest()
    }
}

impl<H: FsVerityHashValue> Default for FsVerityStream<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the fs-verity digest for a block of data held in memory.
pub fn compute_verity<H: FsVerityHashValue>(data: &[u8]) -> H {
    let mut stream = FsVerityStream::new();
    stream.update(data);
    stream.finalize()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_digest() {
        assert_eq!(
            compute_verity::<Sha256HashValue>(b"hello world").to_hex(),
            "1e2eaa4202d750a41174ee454970b92c1bc2f925b1e35076d8c7d5f56362ba64"
        );

        assert_eq!(
            compute_verity::<Sha512HashValue>(b"hello world").to_hex(),
            "18430270729d162d4e469daca123ae61893db4b0583d8f7081e3bf4f92b88ba514e7982f10733fb6aa895195c5ae8fd2eb2c47a8be05513ce5a0c51a6f570409"
        );
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        // A bit more than two blocks, fed in awkward chunk sizes.
        let data = vec![0x5a; 2 * BLKSZ + 77];
        for chunk_size in [1, 7, 512, BLKSZ, BLKSZ + 1, data.len()] {
            let mut stream = FsVerityStream::<Sha256HashValue>::new();
            for chunk in data.chunks(chunk_size) {
                stream.update(chunk);
            }
            assert_eq!(
                stream.finalize(),
                compute_verity::<Sha256HashValue>(&data),
                "chunk_size={chunk_size}"
            );
        }
    }

    #[test]
    fn test_empty_digest() {
        // The empty stream still has a well-defined descriptor digest.
        assert_eq!(
            compute_verity::<Sha256HashValue>(b"").to_hex(),
            "3d248ca542a24fc62d1c43b916eae5016878e2533c88238480b26128a1f1af95"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = compute_verity::<Sha256HashValue>(b"some data");
        assert_eq!(Sha256HashValue::from_hex(digest.to_hex()), Ok(digest.clone()));
        assert_eq!(digest.to_id(), format!("sha256:{}", digest.to_hex()));
        assert_eq!(
            Sha256HashValue::from_hex("lol"),
            Err(FromHexError::OddLength)
        );
    }
}
