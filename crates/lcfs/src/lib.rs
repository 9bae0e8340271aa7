//! Building composefs (lcfs) metadata images.
//!
//! An image is a deterministic, byte-exact binary encoding of a directory
//! tree: inodes, directory entries, symlink targets, extended attributes,
//! and per-file content digests.  Regular file content lives outside the
//! image; each file records only an opaque backing reference and an
//! optional fs-verity digest.
//!
//! Build a [`tree::Node`] hierarchy programmatically or ingest one from a
//! host directory with [`fs::build_from_filesystem`], then serialize it
//! with [`writer::write_to`].  Logically identical trees always produce
//! byte-identical images, so a single fs-verity digest covers the whole
//! image and downstream verifiers can reject any tampering.

pub mod format;
pub mod fs;
pub mod fsverity;
pub mod tree;
mod util;
pub mod writer;
