//! Serialization of a node tree into an image.
//!
//! Writing happens in phases: a breadth-first canonicalization pass fixes
//! the inode numbering, child order, and directory link counts; the
//! variable-data pass encodes directory blocks, payloads, digests, and
//! xattr blocks into the vdata arena with deduplication; finally the
//! superblock, the flat inode table, and the vdata region are streamed to
//! the sink in one pass, optionally teeing every byte through an fs-verity
//! digest context.
//!
//! The produced byte sequence is a pure function of the logical tree
//! content: iteration orders, hash buckets, and allocation sizes never
//! leak into the output.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{self, ErrorKind, Write},
    os::unix::ffi::OsStrExt,
};

use log::trace;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;
use zerocopy::IntoBytes;

use crate::{
    format::{
        dir_header_size, round_up, xattr_header_size, DType, DirHeaderWire, DirentWire, InodeWire,
        Superblock, VdataRef, XattrEntryWire, XattrHeaderWire, MAGIC, S_IFDIR, S_IFLNK, S_IFMT,
        S_IFREG, VERSION,
    },
    fsverity::{FsVerityStream, Sha256HashValue},
    tree::{Node, NodeData},
};

/// Errors from serializing a tree.
#[derive(Error, Debug)]
pub enum WriteError {
    /// A non-directory node has children.
    #[error("only directories may have children")]
    NotDirectory,
    /// The sink failed, or refused to make progress.
    #[error(transparent)]
    Io(#[from] io::Error),
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    struct AppendFlags: u32 {
        /// Coalesce with an existing byte-equal blob.
        const DEDUP = 1 << 0;
        /// Pad the arena to a 4-byte boundary before appending.
        const ALIGN = 1 << 1;
    }
}

/// The variable-data arena and its content-addressed dedup index.
///
/// The index maps a content hash to the `(off, len)` references of blobs
/// already in the arena; collisions are resolved by comparing the arena
/// bytes, so equal blobs always share one reference.
#[derive(Debug, Default)]
struct Vdata {
    bytes: Vec<u8>,
    index: HashMap<u64, Vec<VdataRef>>,
}

impl Vdata {
    fn find(&self, hash: u64, data: &[u8]) -> Option<VdataRef> {
        let bucket = self.index.get(&hash)?;
        bucket.iter().copied().find(|r| {
            let off = r.off.get() as usize;
            r.len.get() as usize == data.len() && &self.bytes[off..off + data.len()] == data
        })
    }

    fn append(&mut self, data: &[u8], flags: AppendFlags) -> VdataRef {
        let hash = xxh64(data, 0);
        let existing = self.find(hash, data);

        if flags.contains(AppendFlags::DEDUP) {
            if let Some(out) = existing {
                trace!("vdata dedup hit for {} bytes at {out:?}", data.len());
                return out;
            }
        }

        if flags.contains(AppendFlags::ALIGN) {
            self.bytes.resize(round_up(self.bytes.len(), 4), 0);
        }

        let out = VdataRef {
            off: (self.bytes.len() as u64).into(),
            len: (data.len() as u32).into(),
        };
        self.bytes.extend_from_slice(data);

        // The first blob with given content wins; later appends of equal
        // bytes resolve to it whether or not they asked for dedup.
        if existing.is_none() {
            self.index.entry(hash).or_default().push(out);
        }

        out
    }
}

/// The vdata references of one inode, indexed in canonical order.
#[derive(Clone, Copy, Debug, Default)]
struct InodeRefs {
    variable_data: VdataRef,
    xattrs: VdataRef,
    digest: VdataRef,
}

/// Canonicalizes the tree and returns the nodes in canonical order.
///
/// Visits breadth-first from the root.  Every visited node gets its
/// children sorted bytewise by name, its xattrs sorted by key, its link
/// count fixed up (directories count 2 plus their subdirectories), and its
/// inode number assigned from the visitation index.  Hard-link aliases are
/// not visited: they surface only as directory entries pointing at their
/// target's inode.
fn compute_tree(root: &Node) -> Result<Vec<Node>, WriteError> {
    let mut order = vec![];
    let mut in_tree = HashSet::new();
    let mut queue = VecDeque::new();

    queue.push_back(root.clone());
    in_tree.insert(root.ptr_id());

    while let Some(node) = queue.pop_front() {
        let mut data = node.0.borrow_mut();

        if data.stat.st_mode & S_IFMT != S_IFDIR && !data.children.is_empty() {
            return Err(WriteError::NotDirectory);
        }

        if data.stat.st_mode & S_IFMT == S_IFDIR {
            let n_subdirs = data.children.iter().filter(|c| c.is_dir()).count();
            data.stat.st_nlink = 2 + n_subdirs as u32;
        }

        data.children.sort_by(|a, b| {
            let a = a.0.borrow();
            let b = b.0.borrow();
            a.name_bytes().cmp(b.name_bytes())
        });
        data.xattrs
            .sort_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));

        data.inode_num = order.len() as u32;

        for child in &data.children {
            if child.is_hardlink() {
                continue;
            }
            assert!(
                in_tree.insert(child.ptr_id()),
                "node is reachable twice from the root"
            );
            queue.push_back(child.clone());
        }

        drop(data);
        order.push(node);
    }

    Ok(order)
}

fn payload_bytes(data: &NodeData) -> Option<&[u8]> {
    match data.payload.as_deref() {
        Some(payload) if !payload.is_empty() => Some(payload.as_bytes()),
        _ => None,
    }
}

/// Encodes a directory block: header, packed dirents, then the
/// concatenated name bytes.  Returns `None` for empty directories.
fn build_dirents(dir: &NodeData) -> Option<Vec<u8>> {
    if dir.children.is_empty() {
        return None;
    }

    let names_size: usize = dir
        .children
        .iter()
        .map(|c| c.0.borrow().name_bytes().len())
        .sum();
    let mut block = Vec::with_capacity(dir_header_size(dir.children.len()) + names_size);

    block.extend_from_slice(
        DirHeaderWire {
            n_dirents: (dir.children.len() as u32).into(),
        }
        .as_bytes(),
    );

    let mut name_offset = 0u32;
    for child in &dir.children {
        // The entry carries the child's name but the hard-link target's
        // inode number and type.
        let target = child.follow_links();
        let target = target.0.borrow();
        let name_len = child.0.borrow().name_bytes().len();

        block.extend_from_slice(
            DirentWire {
                inode_num: target.inode_num.into(),
                name_offset: name_offset.into(),
                name_len: name_len as u8,
                d_type: DType::from_mode(target.stat.st_mode) as u8,
                _padding: 0.into(),
            }
            .as_bytes(),
        );
        name_offset += name_len as u32;
    }

    for child in &dir.children {
        block.extend_from_slice(child.0.borrow().name_bytes());
    }

    Some(block)
}

/// Emits directory blocks, payloads, and content digests into the arena,
/// recording the references for each inode.
fn compute_variable_data(nodes: &[Node], refs: &mut [InodeRefs], vdata: &mut Vdata) {
    for (node, refs) in nodes.iter().zip(refs.iter_mut()) {
        let data = node.0.borrow();

        match data.stat.st_mode & S_IFMT {
            S_IFDIR => {
                if let Some(block) = build_dirents(&data) {
                    refs.variable_data = vdata.append(&block, AppendFlags::ALIGN);
                }
            }
            S_IFREG => {
                // Empty files never carry a payload reference, so that
                // equal trees encode identically no matter what payload
                // was set.
                if data.stat.st_size != 0 {
                    if let Some(payload) = payload_bytes(&data) {
                        refs.variable_data = vdata.append(payload, AppendFlags::DEDUP);
                    }
                }
            }
            S_IFLNK => {
                if let Some(payload) = payload_bytes(&data) {
                    refs.variable_data = vdata.append(payload, AppendFlags::DEDUP);
                }
            }
            _ => {}
        }

        if let Some(digest) = &data.digest {
            refs.digest = vdata.append(digest.as_bytes(), AppendFlags::DEDUP);
        }
    }
}

/// Encodes the xattr block of every node that has attributes.  The xattrs
/// were already key-sorted by canonicalization, so equal attribute sets
/// produce byte-equal blocks and share one arena reference.
fn compute_xattrs(nodes: &[Node], refs: &mut [InodeRefs], vdata: &mut Vdata) {
    for (node, refs) in nodes.iter().zip(refs.iter_mut()) {
        let data = node.0.borrow();
        if data.xattrs.is_empty() {
            continue;
        }

        let data_length: usize = data
            .xattrs
            .iter()
            .map(|x| x.key.as_bytes().len() + x.value.len())
            .sum();
        let mut block = Vec::with_capacity(xattr_header_size(data.xattrs.len()) + data_length);

        block.extend_from_slice(
            XattrHeaderWire {
                n_attr: (data.xattrs.len() as u16).into(),
            }
            .as_bytes(),
        );
        for xattr in &data.xattrs {
            block.extend_from_slice(
                XattrEntryWire {
                    key_length: (xattr.key.as_bytes().len() as u16).into(),
                    value_length: (xattr.value.len() as u16).into(),
                }
                .as_bytes(),
            );
        }
        for xattr in &data.xattrs {
            block.extend_from_slice(xattr.key.as_bytes());
            block.extend_from_slice(&xattr.value);
        }

        refs.xattrs = vdata.append(&block, AppendFlags::DEDUP | AppendFlags::ALIGN);
    }
}

fn inode_wire(node: &Node, refs: &InodeRefs) -> InodeWire {
    let data = node.0.borrow();
    InodeWire {
        st_mode: data.stat.st_mode.into(),
        st_nlink: data.stat.st_nlink.into(),
        st_uid: data.stat.st_uid.into(),
        st_gid: data.stat.st_gid.into(),
        st_rdev: data.stat.st_rdev.into(),
        st_size: data.stat.st_size.into(),
        st_mtim_sec: data.stat.st_mtim_sec.into(),
        st_mtim_nsec: data.stat.st_mtim_nsec.into(),
        st_ctim_sec: data.stat.st_ctim_sec.into(),
        st_ctim_nsec: data.stat.st_ctim_nsec.into(),
        variable_data: refs.variable_data,
        xattrs: refs.xattrs,
        digest: refs.digest,
    }
}

/// The single output sink.  Tracks the byte count, re-drives short
/// writes, and tees every accepted byte into the fs-verity context when
/// one is attached, so the digest covers the image exactly once.
struct ImageWriter<W: Write> {
    sink: W,
    digest: Option<FsVerityStream<Sha256HashValue>>,
    bytes_written: u64,
}

impl<W: Write> ImageWriter<W> {
    fn new(sink: W, with_digest: bool) -> Self {
        Self {
            sink,
            digest: with_digest.then(FsVerityStream::new),
            bytes_written: 0,
        }
    }

    fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        if let Some(digest) = &mut self.digest {
            digest.update(data);
        }
        self.bytes_written += data.len() as u64;

        while !data.is_empty() {
            match self.sink.write(data) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn write_pad(&mut self, len: usize) -> io::Result<()> {
        const ZEROS: [u8; 256] = [0; 256];

        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            self.write(&ZEROS[..n])?;
            remaining -= n;
        }

        Ok(())
    }

    fn finalize(self) -> Option<Sha256HashValue> {
        self.digest.map(FsVerityStream::finalize)
    }
}

/// Serializes the canonical image of the tree rooted at `root` into
/// `sink`.
///
/// When `with_digest` is set, every written byte also passes through an
/// fs-verity context and the digest of the complete image is returned.
///
/// Serialization leaves the tree usable: beyond assigning inode numbers,
/// fixing directory link counts, and sorting, no node state is modified.
/// On error the sink may hold an arbitrary prefix of the image and should
/// be discarded.
pub fn write_to<W: Write>(
    root: &Node,
    sink: W,
    with_digest: bool,
) -> Result<Option<Sha256HashValue>, WriteError> {
    let nodes = compute_tree(root)?;
    let inode_table_size = nodes.len() * size_of::<InodeWire>();
    let data_offset = round_up(size_of::<Superblock>() + inode_table_size, 4);

    let mut refs = vec![InodeRefs::default(); nodes.len()];
    let mut vdata = Vdata::default();
    compute_variable_data(&nodes, &mut refs, &mut vdata);
    compute_xattrs(&nodes, &mut refs, &mut vdata);

    trace!(
        "writing image: {} inodes, vdata {} bytes at {data_offset}",
        nodes.len(),
        vdata.bytes.len()
    );

    let mut writer = ImageWriter::new(sink, with_digest);

    let superblock = Superblock {
        version: VERSION.into(),
        magic: MAGIC.into(),
        vdata_offset: (data_offset as u64).into(),
    };
    writer.write(superblock.as_bytes())?;

    for (node, refs) in nodes.iter().zip(&refs) {
        writer.write(inode_wire(node, refs).as_bytes())?;
    }
    assert_eq!(
        writer.bytes_written as usize,
        size_of::<Superblock>() + inode_table_size
    );

    let pad = data_offset - writer.bytes_written as usize;
    writer.write_pad(pad)?;
    writer.write(&vdata.bytes)?;

    Ok(writer.finalize())
}
