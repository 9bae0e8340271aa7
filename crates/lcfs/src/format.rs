//! On-disk format definitions for lcfs images.
//!
//! All multi-byte fields are little-endian.  The structures are defined in
//! terms of pure LE integer types from zerocopy, which are unaligned, so the
//! `repr(C)` structs below contain no implicit padding and can be written to
//! the image with `as_bytes()`.

use std::fmt;

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Image format version, stored in the superblock.
pub const VERSION: u32 = 1;

/// Image magic number, stored in the superblock.
pub const MAGIC: u32 = 0xc078_629a;

/// Maximum length in bytes of one directory entry name.  Must fit the
/// dirent's `name_len` field.
pub const MAX_NAME_LENGTH: usize = 255;

/// Size in bytes of a per-file fs-verity content digest (SHA-256).
pub const DIGEST_SIZE: usize = 32;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFSOCK: u32 = 0o140000;

/// Rounds up a value to the nearest multiple of `to` (a power of two).
pub fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

/// Directory entry type, in the POSIX `DT_*` encoding used by `readdir`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    Unknown = 0,
    Fifo = 1,
    CharacterDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    Symlink = 10,
    Socket = 12,
}

impl DType {
    /// The entry type for the given `st_mode` value.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFIFO => DType::Fifo,
            S_IFCHR => DType::CharacterDevice,
            S_IFDIR => DType::Directory,
            S_IFBLK => DType::BlockDevice,
            S_IFREG => DType::RegularFile,
            S_IFLNK => DType::Symlink,
            S_IFSOCK => DType::Socket,
            _ => DType::Unknown,
        }
    }
}

/// The fixed header at offset 0 of every image.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    pub version: U32,
    pub magic: U32,
    pub vdata_offset: U64,
}

/// A reference into the variable-data region.  `off == 0 && len == 0` means
/// the field is absent.
#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq, Eq)]
#[repr(C)]
pub struct VdataRef {
    pub off: U64,
    pub len: U32,
}

impl VdataRef {
    pub fn is_empty(self) -> bool {
        self.off.get() == 0 && self.len.get() == 0
    }
}

impl fmt::Debug for VdataRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(+{}, {})", self.off.get(), self.len.get())
    }
}

/// One entry of the flat inode table that follows the superblock.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct InodeWire {
    pub st_mode: U32,
    pub st_nlink: U32,
    pub st_uid: U32,
    pub st_gid: U32,
    pub st_rdev: U32,
    pub st_size: U64,

    pub st_mtim_sec: U64,
    pub st_mtim_nsec: U32,
    pub st_ctim_sec: U64,
    pub st_ctim_nsec: U32,

    pub variable_data: VdataRef,
    pub xattrs: VdataRef,
    pub digest: VdataRef,
}

/// Header of a directory block in the vdata region, followed by `n_dirents`
/// [`DirentWire`] records and then the concatenated name bytes (without NUL
/// terminators).
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirHeaderWire {
    pub n_dirents: U32,
}

/// One directory entry.  `name_offset` is relative to the start of the name
/// area of the containing directory block.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirentWire {
    pub inode_num: U32,
    pub name_offset: U32,
    pub name_len: u8,
    pub d_type: u8,
    pub _padding: U16,
}

/// Header of an xattr block in the vdata region, followed by `n_attr`
/// [`XattrEntryWire`] records and then the key and value bytes of each
/// attribute, in per-attribute order.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrHeaderWire {
    pub n_attr: U16,
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrEntryWire {
    pub key_length: U16,
    pub value_length: U16,
}

/// Size of a directory block header with `n` entries, names excluded.
pub fn dir_header_size(n: usize) -> usize {
    size_of::<DirHeaderWire>() + n * size_of::<DirentWire>()
}

/// Size of an xattr block header with `n` attributes, data excluded.
pub fn xattr_header_size(n: usize) -> usize {
    size_of::<XattrHeaderWire>() + n * size_of::<XattrEntryWire>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_sizes() {
        // The on-disk layout is fixed; any change here breaks every reader.
        assert_eq!(size_of::<Superblock>(), 16);
        assert_eq!(size_of::<VdataRef>(), 12);
        assert_eq!(size_of::<InodeWire>(), 88);
        assert_eq!(size_of::<DirentWire>(), 12);
        assert_eq!(size_of::<DirHeaderWire>(), 4);
        assert_eq!(size_of::<XattrHeaderWire>(), 2);
        assert_eq!(size_of::<XattrEntryWire>(), 4);
    }

    #[test]
    fn test_dtype_from_mode() {
        assert_eq!(DType::from_mode(S_IFDIR | 0o755), DType::Directory);
        assert_eq!(DType::from_mode(S_IFREG | 0o644), DType::RegularFile);
        assert_eq!(DType::from_mode(S_IFLNK | 0o777), DType::Symlink);
        assert_eq!(DType::from_mode(S_IFBLK | 0o600), DType::BlockDevice);
        assert_eq!(DType::from_mode(S_IFCHR | 0o600), DType::CharacterDevice);
        assert_eq!(DType::from_mode(S_IFIFO), DType::Fifo);
        assert_eq!(DType::from_mode(S_IFSOCK), DType::Socket);
        assert_eq!(DType::from_mode(0), DType::Unknown);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(4, 4), 4);
        assert_eq!(round_up(17, 4), 20);
        assert_eq!(round_up(4095, 4096), 4096);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(dir_header_size(0), 4);
        assert_eq!(dir_header_size(2), 4 + 24);
        assert_eq!(xattr_header_size(0), 2);
        assert_eq!(xattr_header_size(3), 2 + 12);
    }
}
