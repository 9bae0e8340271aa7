use std::os::fd::{AsFd, AsRawFd};

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be
/// used to work with kernel APIs that don't directly accept file
/// descriptors.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}
