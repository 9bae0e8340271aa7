//! The in-memory node tree that images are built from.
//!
//! Nodes model one inode each: files, directories, symlinks, devices, and
//! hard links.  A node is created detached, configured through the
//! accessors, and attached to a parent directory with [`Node::add_child`].
//! Ownership is shared: parents own their children, hard-link aliases own
//! their targets, and parent back-edges are weak so the tree never forms a
//! reference cycle.

use std::{
    cell::RefCell,
    ffi::OsStr,
    io::{ErrorKind, Read},
    os::unix::ffi::OsStrExt,
    rc::{Rc, Weak},
};

use thiserror::Error;

use crate::format::{MAX_NAME_LENGTH, S_IFDIR, S_IFMT};
use crate::fsverity::{FsVerityStream, Sha256HashValue};

/// Errors from tree manipulation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    /// The operation requires a directory.
    #[error("not a directory")]
    NotDirectory,
    /// The entry name exceeds [`MAX_NAME_LENGTH`] bytes.
    #[error("name {0:?} is too long")]
    NameTooLong(Box<OsStr>),
    /// The node is already attached to a parent under the given name.
    #[error("node is already attached as {0:?}")]
    AlreadyAttached(Box<OsStr>),
    /// A sibling with the same name already exists.
    #[error("directory entry {0:?} already exists")]
    Exists(Box<OsStr>),
    /// No entry with the given name exists.
    #[error("directory entry {0:?} does not exist")]
    NotFound(Box<OsStr>),
    /// The operation makes no sense for the given arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// POSIX stat attributes of one node, as they will appear in the image.
#[derive(Debug, Default, Clone)]
pub(crate) struct Stat {
    pub(crate) st_mode: u32,
    pub(crate) st_nlink: u32,
    pub(crate) st_uid: u32,
    pub(crate) st_gid: u32,
    pub(crate) st_rdev: u32,
    pub(crate) st_size: u64,
    pub(crate) st_mtim_sec: u64,
    pub(crate) st_mtim_nsec: u32,
    pub(crate) st_ctim_sec: u64,
    pub(crate) st_ctim_nsec: u32,
}

/// An extended attribute: a key string and an arbitrary byte value.
#[derive(Debug, Clone)]
pub struct Xattr {
    pub(crate) key: Box<OsStr>,
    pub(crate) value: Box<[u8]>,
}

#[derive(Debug)]
pub(crate) struct NodeData {
    pub(crate) stat: Stat,
    pub(crate) name: Option<Box<OsStr>>,
    pub(crate) payload: Option<Box<OsStr>>,
    pub(crate) digest: Option<Sha256HashValue>,
    pub(crate) children: Vec<Node>,
    pub(crate) xattrs: Vec<Xattr>,
    pub(crate) link_to: Option<Node>,
    pub(crate) parent: Weak<RefCell<NodeData>>,
    /// Assigned by the canonicalization pass; meaningless before it runs.
    pub(crate) inode_num: u32,
}

impl NodeData {
    pub(crate) fn name_bytes(&self) -> &[u8] {
        self.name.as_deref().map(OsStrExt::as_bytes).unwrap_or_default()
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.stat.st_mode & S_IFMT == S_IFDIR
    }
}

/// One inode of the tree being built.
///
/// `Node` is a shared handle: cloning it clones the handle, not the node.
/// Nodes are not safe to share across threads.
#[derive(Clone, Debug)]
pub struct Node(pub(crate) Rc<RefCell<NodeData>>);

impl Node {
    /// Creates a fresh detached node with mode 0 and a link count of 1.
    pub fn new() -> Self {
        Node(Rc::new(RefCell::new(NodeData {
            stat: Stat {
                st_nlink: 1,
                ..Stat::default()
            },
            name: None,
            payload: None,
            digest: None,
            children: vec![],
            xattrs: vec![],
            link_to: None,
            parent: Weak::new(),
            inode_num: 0,
        })))
    }

    /// Whether `self` and `other` are handles to the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn mode(&self) -> u32 {
        self.0.borrow().stat.st_mode
    }

    pub fn set_mode(&self, mode: u32) {
        self.0.borrow_mut().stat.st_mode = mode;
    }

    pub fn uid(&self) -> u32 {
        self.0.borrow().stat.st_uid
    }

    pub fn set_uid(&self, uid: u32) {
        self.0.borrow_mut().stat.st_uid = uid;
    }

    pub fn gid(&self) -> u32 {
        self.0.borrow().stat.st_gid
    }

    pub fn set_gid(&self, gid: u32) {
        self.0.borrow_mut().stat.st_gid = gid;
    }

    pub fn rdev(&self) -> u32 {
        self.0.borrow().stat.st_rdev
    }

    pub fn set_rdev(&self, rdev: u32) {
        self.0.borrow_mut().stat.st_rdev = rdev;
    }

    pub fn nlink(&self) -> u32 {
        self.0.borrow().stat.st_nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        self.0.borrow_mut().stat.st_nlink = nlink;
    }

    pub fn size(&self) -> u64 {
        self.0.borrow().stat.st_size
    }

    pub fn set_size(&self, size: u64) {
        self.0.borrow_mut().stat.st_size = size;
    }

    pub fn mtime(&self) -> (u64, u32) {
        let data = self.0.borrow();
        (data.stat.st_mtim_sec, data.stat.st_mtim_nsec)
    }

    pub fn set_mtime(&self, sec: u64, nsec: u32) {
        let mut data = self.0.borrow_mut();
        data.stat.st_mtim_sec = sec;
        data.stat.st_mtim_nsec = nsec;
    }

    pub fn ctime(&self) -> (u64, u32) {
        let data = self.0.borrow();
        (data.stat.st_ctim_sec, data.stat.st_ctim_nsec)
    }

    pub fn set_ctime(&self, sec: u64, nsec: u32) {
        let mut data = self.0.borrow_mut();
        data.stat.st_ctim_sec = sec;
        data.stat.st_ctim_nsec = nsec;
    }

    /// Whether this node is a directory, going by its mode bits.
    pub fn is_dir(&self) -> bool {
        self.0.borrow().is_dir()
    }

    /// The name this node is attached under, if it has a parent.
    pub fn name(&self) -> Option<Box<OsStr>> {
        self.0.borrow().name.clone()
    }

    /// The directory this node is attached to, if any.
    pub fn parent(&self) -> Option<Node> {
        self.0.borrow().parent.upgrade().map(Node)
    }

    /// The symlink target or regular-file backing reference.
    pub fn payload(&self) -> Option<Box<OsStr>> {
        self.0.borrow().payload.clone()
    }

    /// Sets the payload: the symlink target for symlinks, or an opaque
    /// backing-file reference for regular files.  Stored verbatim.
    pub fn set_payload(&self, payload: impl AsRef<OsStr>) {
        self.0.borrow_mut().payload = Some(payload.as_ref().into());
    }

    /// The fs-verity content digest, if one was set.
    pub fn fsverity_digest(&self) -> Option<Sha256HashValue> {
        self.0.borrow().digest.clone()
    }

    /// Records the fs-verity digest of this file's content.
    pub fn set_fsverity_digest(&self, digest: Sha256HashValue) {
        self.0.borrow_mut().digest = Some(digest);
    }

    /// Streams `reader` to the end and records the fs-verity digest of the
    /// bytes read.  Retries reads interrupted by signals.
    pub fn compute_fsverity_digest(&self, reader: &mut impl Read) -> std::io::Result<()> {
        let mut context = FsVerityStream::new();
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => context.update(&buffer[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.set_fsverity_digest(context.finalize());
        Ok(())
    }

    pub fn n_children(&self) -> usize {
        self.0.borrow().children.len()
    }

    pub fn child(&self, i: usize) -> Option<Node> {
        self.0.borrow().children.get(i).cloned()
    }

    /// Attaches `child` to this directory under `name`.
    ///
    /// The parent takes a reference on the child; the child's name and
    /// parent back-edge are set.  Nothing is modified on failure.
    pub fn add_child(&self, child: &Node, name: impl AsRef<OsStr>) -> Result<(), TreeError> {
        let name = name.as_ref();

        if !self.is_dir() {
            return Err(TreeError::NotDirectory);
        }
        if Rc::ptr_eq(&self.0, &child.0) {
            return Err(TreeError::InvalidArgument("cannot attach a node to itself"));
        }
        if name.is_empty() {
            return Err(TreeError::InvalidArgument("empty entry name"));
        }
        if name.as_bytes().len() > MAX_NAME_LENGTH {
            return Err(TreeError::NameTooLong(name.into()));
        }
        if let Some(existing) = child.name() {
            return Err(TreeError::AlreadyAttached(existing));
        }
        if self.lookup_child(name).is_some() {
            return Err(TreeError::Exists(name.into()));
        }

        {
            let mut data = child.0.borrow_mut();
            data.name = Some(name.into());
            data.parent = Rc::downgrade(&self.0);
        }
        self.0.borrow_mut().children.push(child.clone());

        Ok(())
    }

    /// Detaches the child named `name` and returns it.  The detached node
    /// loses its name and parent and may be re-attached elsewhere.
    pub fn remove_child(&self, name: impl AsRef<OsStr>) -> Result<Node, TreeError> {
        let name = name.as_ref();

        if !self.is_dir() {
            return Err(TreeError::NotDirectory);
        }

        let mut data = self.0.borrow_mut();
        let pos = data
            .children
            .iter()
            .position(|c| c.0.borrow().name.as_deref() == Some(name))
            .ok_or_else(|| TreeError::NotFound(name.into()))?;
        let child = data.children.remove(pos);

        {
            let mut data = child.0.borrow_mut();
            data.name = None;
            data.parent = Weak::new();
        }

        Ok(child)
    }

    /// Looks up a direct child by name.
    pub fn lookup_child(&self, name: impl AsRef<OsStr>) -> Option<Node> {
        let name = name.as_ref();
        self.0
            .borrow()
            .children
            .iter()
            .find(|c| c.0.borrow().name.as_deref() == Some(name))
            .cloned()
    }

    /// Turns this node into a hard link to `target`.
    ///
    /// Link chains are flattened at creation time, so the stored edge
    /// always points at a node that is not itself an alias.  The node
    /// keeps its own attributes but is emitted only as a directory entry
    /// referring to the target's inode.  Directories cannot be hard
    /// linked.
    pub fn make_hardlink(&self, target: &Node) -> Result<(), TreeError> {
        if self.is_dir() || target.is_dir() {
            return Err(TreeError::InvalidArgument("cannot hard link a directory"));
        }

        let target = target.follow_links();
        if Rc::ptr_eq(&self.0, &target.0) {
            return Err(TreeError::InvalidArgument("cannot hard link a node to itself"));
        }

        self.0.borrow_mut().link_to = Some(target.clone());
        target.0.borrow_mut().stat.st_nlink += 1;

        Ok(())
    }

    /// The node this one is an alias for, or `self` if it isn't one.
    /// Chains are flattened at creation, so this walk is at most one hop
    /// deep and self-links are rejected, making a cycle impossible.
    pub(crate) fn follow_links(&self) -> Node {
        let mut node = self.clone();
        loop {
            let next = node.0.borrow().link_to.clone();
            match next {
                Some(target) => node = target,
                None => return node,
            }
        }
    }

    pub(crate) fn is_hardlink(&self) -> bool {
        self.0.borrow().link_to.is_some()
    }

    pub fn n_xattrs(&self) -> usize {
        self.0.borrow().xattrs.len()
    }

    pub fn xattr_name(&self, i: usize) -> Option<Box<OsStr>> {
        self.0.borrow().xattrs.get(i).map(|x| x.key.clone())
    }

    /// The value of the named extended attribute, if set.
    pub fn get_xattr(&self, name: impl AsRef<OsStr>) -> Option<Box<[u8]>> {
        let name = name.as_ref();
        self.0
            .borrow()
            .xattrs
            .iter()
            .find(|x| x.key.as_ref() == name)
            .map(|x| x.value.clone())
    }

    /// Sets an extended attribute, replacing any previous value.  The
    /// value is copied.  Keys and values must fit the wire format's
    /// 16-bit length fields.
    pub fn set_xattr(&self, name: impl AsRef<OsStr>, value: &[u8]) -> Result<(), TreeError> {
        let name = name.as_ref();

        if name.as_bytes().len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(TreeError::InvalidArgument("xattr key or value too large"));
        }

        let mut data = self.0.borrow_mut();
        if let Some(xattr) = data.xattrs.iter_mut().find(|x| x.key.as_ref() == name) {
            xattr.value = Box::from(value);
        } else {
            data.xattrs.push(Xattr {
                key: name.into(),
                value: Box::from(value),
            });
        }

        Ok(())
    }

    /// Removes an extended attribute.  Removing a key that isn't set is a
    /// no-op.
    pub fn unset_xattr(&self, name: impl AsRef<OsStr>) {
        let name = name.as_ref();
        self.0.borrow_mut().xattrs.retain(|x| x.key.as_ref() != name);
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use crate::format::{S_IFLNK, S_IFREG};
    use crate::fsverity::FsVerityHashValue;

    use super::*;

    fn new_dir() -> Node {
        let node = Node::new();
        node.set_mode(S_IFDIR | 0o755);
        node
    }

    fn new_file() -> Node {
        let node = Node::new();
        node.set_mode(S_IFREG | 0o644);
        node
    }

    #[test]
    fn test_new_node_defaults() {
        let node = Node::new();
        assert_eq!(node.mode(), 0);
        assert_eq!(node.nlink(), 1);
        assert_eq!(node.size(), 0);
        assert!(node.name().is_none());
        assert!(node.parent().is_none());
        assert!(node.payload().is_none());
        assert!(node.fsverity_digest().is_none());
    }

    #[test]
    fn test_add_lookup_remove() {
        let root = new_dir();
        let file = new_file();

        root.add_child(&file, "hello").unwrap();
        assert_eq!(file.name().unwrap(), OsString::from("hello").into_boxed_os_str());
        assert!(file.parent().unwrap().ptr_eq(&root));
        assert_eq!(root.n_children(), 1);

        let found = root.lookup_child("hello").unwrap();
        assert!(found.ptr_eq(&file));
        assert!(root.lookup_child("missing").is_none());

        let removed = root.remove_child("hello").unwrap();
        assert!(removed.ptr_eq(&file));
        assert!(file.name().is_none());
        assert!(file.parent().is_none());
        assert_eq!(root.n_children(), 0);

        // A detached node can be re-attached under a different name.
        root.add_child(&file, "goodbye").unwrap();
        assert!(root.lookup_child("goodbye").unwrap().ptr_eq(&file));
    }

    #[test]
    fn test_add_child_errors() {
        let root = new_dir();
        let file = new_file();

        assert_eq!(
            file.add_child(&Node::new(), "x"),
            Err(TreeError::NotDirectory)
        );

        let long_name = OsString::from("x".repeat(MAX_NAME_LENGTH));
        root.add_child(&new_file(), &long_name).unwrap();
        let too_long = OsString::from("x".repeat(MAX_NAME_LENGTH + 1));
        assert!(matches!(
            root.add_child(&new_file(), &too_long),
            Err(TreeError::NameTooLong(_))
        ));

        root.add_child(&file, "taken").unwrap();
        assert!(matches!(
            root.add_child(&file, "other"),
            Err(TreeError::AlreadyAttached(_))
        ));

        let other = new_file();
        assert!(matches!(
            root.add_child(&other, "taken"),
            Err(TreeError::Exists(_))
        ));
        // The rejected child is left untouched.
        assert!(other.name().is_none());
        assert!(other.parent().is_none());

        assert!(matches!(
            root.add_child(&new_file(), ""),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_child_errors() {
        let root = new_dir();
        assert!(matches!(
            root.remove_child("nope"),
            Err(TreeError::NotFound(_))
        ));
        assert!(matches!(
            new_file().remove_child("x"),
            Err(TreeError::NotDirectory)
        ));
    }

    #[test]
    fn test_hardlink() {
        let target = new_file();
        let alias = new_file();

        alias.make_hardlink(&target).unwrap();
        assert_eq!(target.nlink(), 2);
        assert!(alias.is_hardlink());
        assert!(alias.follow_links().ptr_eq(&target));

        // Chains are flattened: linking to the alias links to its target.
        let another = new_file();
        another.make_hardlink(&alias).unwrap();
        assert!(another.follow_links().ptr_eq(&target));
        assert_eq!(target.nlink(), 3);
    }

    #[test]
    fn test_hardlink_rejects_directories() {
        let dir = new_dir();
        let file = new_file();
        assert!(matches!(
            file.make_hardlink(&dir),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.make_hardlink(&file),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            file.make_hardlink(&file),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_xattrs() {
        let node = new_file();
        assert!(node.get_xattr("user.a").is_none());

        node.set_xattr("user.a", b"one").unwrap();
        node.set_xattr("user.b", b"two").unwrap();
        assert_eq!(node.n_xattrs(), 2);
        assert_eq!(node.get_xattr("user.a").unwrap().as_ref(), b"one");

        // Setting an existing key replaces the value in place.
        node.set_xattr("user.a", b"replaced").unwrap();
        assert_eq!(node.n_xattrs(), 2);
        assert_eq!(node.get_xattr("user.a").unwrap().as_ref(), b"replaced");

        node.unset_xattr("user.a");
        assert!(node.get_xattr("user.a").is_none());
        assert_eq!(node.n_xattrs(), 1);

        // Unsetting a missing key is fine.
        node.unset_xattr("user.missing");

        // Values sized past the wire format's u16 limits are rejected.
        let huge = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            node.set_xattr("user.huge", &huge),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_symlink_payload() {
        let link = Node::new();
        link.set_mode(S_IFLNK | 0o777);
        link.set_payload("some/target");
        assert_eq!(
            link.payload().unwrap(),
            OsString::from("some/target").into_boxed_os_str()
        );
    }

    #[test]
    fn test_compute_fsverity_digest() {
        let node = new_file();
        node.compute_fsverity_digest(&mut &b"hello world"[..]).unwrap();
        assert_eq!(
            node.fsverity_digest().unwrap().to_hex(),
            "1e2eaa4202d750a41174ee454970b92c1bc2f925b1e35076d8c7d5f56362ba64"
        );
    }

    #[test]
    fn test_timestamps() {
        let node = new_file();
        node.set_mtime(1700000000, 123456789);
        node.set_ctime(1700000001, 5);
        assert_eq!(node.mtime(), (1700000000, 123456789));
        assert_eq!(node.ctime(), (1700000001, 5));
    }
}
