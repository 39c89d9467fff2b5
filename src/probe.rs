//! Kernel support probe.
//!
//! Multishot recvmsg with ring-provided buffers and `DEFER_TASKRUN` are all
//! present from Linux 6.1 on, so the probe only looks at the release string
//! reported by `uname(2)`.

use std::ffi::CStr;

/// Oldest kernel release (major, minor) the handler runs on.
pub const MIN_KERNEL_RELEASE: (u32, u32) = (6, 1);

/// Check if the running kernel supports the handler.
///
/// Never fails: an unreadable or unparsable release counts as unsupported.
pub fn is_supported() -> bool {
    match kernel_release() {
        Some(release) => release_supports(&release),
        None => false,
    }
}

/// Check whether a kernel release string such as `"6.1.0-13-amd64"` is at
/// or above [`MIN_KERNEL_RELEASE`].
pub fn release_supports(release: &str) -> bool {
    match parse_release(release) {
        Some(version) => version >= MIN_KERNEL_RELEASE,
        None => false,
    }
}

/// Read the two leading dot-separated decimal integers of a release string.
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let (major, rest) = release.split_once('.')?;
    let minor_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let major = major.parse().ok()?;
    let minor = rest[..minor_end].parse().ok()?;
    Some((major, minor))
}

fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    // Safety: uname NUL-terminates every field it fills in.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    release.to_str().ok().map(str::to_owned)
}
