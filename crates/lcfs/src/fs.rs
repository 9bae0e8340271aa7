//! Building node trees from a directory on the host filesystem.

use std::{
    ffi::{CStr, OsStr},
    fs::File,
    mem::MaybeUninit,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use bitflags::bitflags;
use rustix::{
    fd::AsFd,
    fs::{getxattr, listxattr, openat, readlinkat, statat, AtFlags, Dir, FileType, Mode, OFlags},
    io::Errno,
};

use thiserror::Error;

use crate::{
    format::{S_IFLNK, S_IFMT, S_IFREG},
    tree::{Node, TreeError},
    util::proc_self_fd,
};

bitflags! {
    /// Options for [`build_from_filesystem`].
    ///
    /// For untyped callers, `BuildFlags::from_bits()` rejects unknown
    /// bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BuildFlags: u32 {
        /// Do not read extended attributes.
        const SKIP_XATTRS = 1 << 0;
        /// Leave all timestamps at the epoch instead of taking them from
        /// the filesystem.
        const USE_EPOCH = 1 << 1;
        /// Omit block and character devices.
        const SKIP_DEVICES = 1 << 2;
        /// Compute the fs-verity content digest of regular files.
        const COMPUTE_DIGEST = 1 << 3;
    }
}

#[derive(Debug, Error)]
pub enum BuildErrorKind {
    #[error(transparent)]
    Errno(#[from] Errno),
    /// Reading file content back for digest computation failed.
    #[error("no data available while computing content digest")]
    NoData,
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Failure to ingest a file, carrying the path of the first file that
/// could not be read, joined from the starting name down to the failing
/// leaf.
#[derive(Debug, Error)]
#[error("{}: {kind}", path.display())]
pub struct BuildError {
    path: PathBuf,
    #[source]
    kind: BuildErrorKind,
}

impl BuildError {
    fn new(name: &OsStr, kind: impl Into<BuildErrorKind>) -> Self {
        Self {
            path: PathBuf::from(name),
            kind: kind.into(),
        }
    }

    /// Prefixes the failing path with the directory it was found in.
    fn within(mut self, name: &OsStr) -> Self {
        self.path = Path::new(name).join(&self.path);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &BuildErrorKind {
        &self.kind
    }
}

/// Reads all extended attributes of `fname` onto `node`.
///
/// flistxattr() and fgetxattr() don't work with O_PATH fds, so this goes
/// through the /proc/self/fd name.  The symlink-following calls give the
/// correct behaviour even for xattrs of a symlink itself.
fn read_xattrs(node: &Node, dirfd: impl AsFd, fname: &OsStr) -> Result<(), BuildErrorKind> {
    let fd = openat(
        dirfd,
        fname,
        OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    let path = proc_self_fd(&fd);

    let mut names = [MaybeUninit::new(0); 65536];
    let (names, _) = listxattr(&path, &mut names)?;

    for name in names.split_inclusive(|c| *c == 0) {
        let name = CStr::from_bytes_with_nul(name).map_err(|_| Errno::INVAL)?;
        let mut buffer = [MaybeUninit::new(0); 65536];
        let (value, _) = getxattr(&path, name, &mut buffer)?;
        node.set_xattr(OsStr::from_bytes(name.to_bytes()), value)?;
    }

    Ok(())
}

/// Creates a single node from `fname` without descending into it.
fn load_node(dirfd: impl AsFd, fname: &OsStr, flags: BuildFlags) -> Result<Node, BuildError> {
    let st = statat(&dirfd, fname, AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|e| BuildError::new(fname, e))?;

    let node = Node::new();
    node.set_mode(st.st_mode);
    node.set_uid(st.st_uid);
    node.set_gid(st.st_gid);
    node.set_rdev(st.st_rdev as u32);
    node.set_size(st.st_size as u64);

    if st.st_mode & S_IFMT == S_IFREG
        && st.st_size != 0
        && flags.contains(BuildFlags::COMPUTE_DIGEST)
    {
        let fd = openat(
            &dirfd,
            fname,
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| BuildError::new(fname, e))?;
        let mut file = File::from(fd);
        node.compute_fsverity_digest(&mut file)
            .map_err(|_| BuildError::new(fname, BuildErrorKind::NoData))?;
    }

    if st.st_mode & S_IFMT == S_IFLNK {
        let target =
            readlinkat(&dirfd, fname, Vec::new()).map_err(|e| BuildError::new(fname, e))?;
        node.set_payload(OsStr::from_bytes(target.to_bytes()));
    }

    if !flags.contains(BuildFlags::USE_EPOCH) {
        node.set_mtime(st.st_mtime as u64, st.st_mtime_nsec as u32);
        node.set_ctime(st.st_ctime as u64, st.st_ctime_nsec as u32);
    }

    if !flags.contains(BuildFlags::SKIP_XATTRS) {
        read_xattrs(&node, &dirfd, fname).map_err(|e| BuildError::new(fname, e))?;
    }

    Ok(node)
}

fn descend(
    node: &Node,
    dirfd: impl AsFd,
    fname: &OsStr,
    flags: BuildFlags,
) -> Result<(), BuildError> {
    let fd = openat(
        &dirfd,
        fname,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| BuildError::new(fname, e))?;

    for item in Dir::read_from(&fd).map_err(|e| BuildError::new(fname, e))? {
        let entry = item.map_err(|e| BuildError::new(fname, e))?;
        let name = OsStr::from_bytes(entry.file_name().to_bytes());

        if name == "." || name == ".." {
            continue;
        }

        let mut file_type = entry.file_type();
        if file_type == FileType::Unknown {
            let st = statat(&fd, name, AtFlags::SYMLINK_NOFOLLOW)
                .map_err(|e| BuildError::new(name, e).within(fname))?;
            file_type = FileType::from_raw_mode(st.st_mode);
        }

        let child = if file_type == FileType::Directory {
            build_from_filesystem(&fd, name, flags).map_err(|e| e.within(fname))?
        } else {
            if flags.contains(BuildFlags::SKIP_DEVICES)
                && matches!(file_type, FileType::BlockDevice | FileType::CharacterDevice)
            {
                continue;
            }
            load_node(&fd, name, flags).map_err(|e| e.within(fname))?
        };

        node.add_child(&child, name)
            .map_err(|e| BuildError::new(name, e).within(fname))?;
    }

    Ok(())
}

/// Builds a node tree from the host filesystem.
///
/// Ingests the file at `fname`, relative to `dirfd`, recursing into
/// directories.  Symlinks are never followed.  On failure, the error
/// names the first offending path below `fname`.
pub fn build_from_filesystem(
    dirfd: impl AsFd,
    fname: impl AsRef<OsStr>,
    flags: BuildFlags,
) -> Result<Node, BuildError> {
    let fname = fname.as_ref();
    let node = load_node(&dirfd, fname, flags)?;

    if node.is_dir() {
        descend(&node, &dirfd, fname, flags)?;
    }

    Ok(node)
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink, path::Path};

    use rustix::fs::CWD;
    use similar_asserts::assert_eq;

    use crate::format::{S_IFDIR, S_IFREG};
    use crate::fsverity::{compute_verity, FsVerityHashValue, Sha256HashValue};
    use crate::writer::write_to;

    use super::*;

    fn make_test_tree(base: &Path) {
        fs::create_dir(base.join("subdir")).unwrap();
        fs::write(base.join("hello.txt"), b"hello world").unwrap();
        fs::write(base.join("subdir/empty"), b"").unwrap();
        symlink("hello.txt", base.join("link")).unwrap();
    }

    #[test]
    fn test_build_flags_from_bits() {
        assert_eq!(
            BuildFlags::from_bits(0b1111),
            Some(BuildFlags::all())
        );
        assert_eq!(BuildFlags::from_bits(1 << 7), None);
    }

    #[test]
    fn test_ingest_structure() {
        let td = tempfile::tempdir().unwrap();
        make_test_tree(td.path());

        let flags = BuildFlags::USE_EPOCH | BuildFlags::COMPUTE_DIGEST;
        let root = build_from_filesystem(CWD, td.path(), flags).unwrap();

        assert!(root.is_dir());
        assert_eq!(root.n_children(), 3);

        let hello = root.lookup_child("hello.txt").unwrap();
        assert_eq!(hello.mode() & S_IFMT, S_IFREG);
        assert_eq!(hello.size(), 11);
        assert_eq!(
            hello.fsverity_digest().unwrap(),
            compute_verity::<Sha256HashValue>(b"hello world")
        );
        // Epoch build: no timestamps taken from the filesystem.
        assert_eq!(hello.mtime(), (0, 0));

        let link = root.lookup_child("link").unwrap();
        assert_eq!(link.mode() & S_IFMT, S_IFLNK);
        assert_eq!(link.payload().unwrap(), Box::from(OsStr::new("hello.txt")));

        let subdir = root.lookup_child("subdir").unwrap();
        assert_eq!(subdir.mode() & S_IFMT, S_IFDIR);
        let empty = subdir.lookup_child("empty").unwrap();
        assert_eq!(empty.size(), 0);
        // Empty files get no digest even when digests were requested.
        assert!(empty.fsverity_digest().is_none());
    }

    #[test]
    fn test_ingest_is_deterministic() {
        let td = tempfile::tempdir().unwrap();
        make_test_tree(td.path());

        let flags = BuildFlags::USE_EPOCH | BuildFlags::SKIP_XATTRS;
        let digest = |root: &Node| {
            write_to(root, std::io::sink(), true)
                .unwrap()
                .unwrap()
                .to_hex()
        };

        let first = build_from_filesystem(CWD, td.path(), flags).unwrap();
        let second = build_from_filesystem(CWD, td.path(), flags).unwrap();
        assert_eq!(digest(&first), digest(&second));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let td = tempfile::tempdir().unwrap();
        let missing = td.path().join("no-such-file");

        let err = build_from_filesystem(CWD, &missing, BuildFlags::empty()).unwrap_err();
        assert_eq!(err.path(), missing);
        assert!(matches!(err.kind(), BuildErrorKind::Errno(e) if *e == Errno::NOENT));
    }

    #[test]
    fn test_mtime_taken_without_epoch() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("f"), b"x").unwrap();

        let root = build_from_filesystem(CWD, td.path(), BuildFlags::empty()).unwrap();
        let (sec, _) = root.lookup_child("f").unwrap().mtime();
        assert_ne!(sec, 0);
    }
}
