//! Layout and parsing of buffers filled by multishot recvmsg.
//!
//! Each completed buffer starts with the kernel's `io_uring_recvmsg_out`
//! header, followed by the control (ancillary) area sized by the msghdr
//! template and then the payload:
//!
//! ```text
//! | recvmsg_out (16) | cmsghdr + ucred (ancillary_len) | payload ... |
//! ```
//!
//! No name area is requested, so the payload offset is fixed per pool.

use io_uring::types::RecvMsgOut;
use std::fmt;
use std::mem;

/// Size of `struct io_uring_recvmsg_out`: namelen, controllen, payloadlen, flags.
pub const RECVMSG_OUT_LEN: usize = 4 * mem::size_of::<u32>();

/// Space for one `SCM_CREDENTIALS` control message, header included.
pub fn credentials_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) as usize }
}

/// Byte layout shared by every buffer in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    ancillary_len: usize,
    payload_size: usize,
}

impl BufferLayout {
    pub fn new(payload_size: usize) -> Self {
        Self {
            ancillary_len: credentials_space(),
            payload_size,
        }
    }

    /// Length of the control area requested from the kernel.
    pub fn ancillary_len(&self) -> usize {
        self.ancillary_len
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn payload_offset(&self) -> usize {
        RECVMSG_OUT_LEN + self.ancillary_len
    }

    /// Header, control area and payload together.
    pub fn buffer_size(&self) -> usize {
        self.payload_offset() + self.payload_size
    }

    /// A zeroed msghdr asking for `ancillary_len` bytes of control data and
    /// no source address.
    pub fn recvmsg_template(&self) -> libc::msghdr {
        let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
        msghdr.msg_controllen = self.ancillary_len as _;
        msghdr
    }
}

/// Sender credentials as delivered in an `SCM_CREDENTIALS` control message.
///
/// This is a view into the received buffer, not a copy.
#[repr(transparent)]
pub struct Credentials(libc::ucred);

impl Credentials {
    pub fn pid(&self) -> libc::pid_t {
        self.0.pid
    }

    pub fn uid(&self) -> libc::uid_t {
        self.0.uid
    }

    pub fn gid(&self) -> libc::gid_t {
        self.0.gid
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("pid", &self.pid())
            .field("uid", &self.uid())
            .field("gid", &self.gid())
            .finish()
    }
}

/// Offsets of a validated datagram within its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDatagram {
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Offset of the `ucred` body, when the sender's credentials were attached.
    pub credentials_offset: Option<usize>,
    /// The kernel dropped payload bytes that did not fit (`MSG_TRUNC`).
    pub truncated: bool,
}

/// Validate the recvmsg-out header against the `len` bytes the kernel
/// reported and locate payload and credentials.
///
/// Returns `None` when the header does not fit in `len` or `len` exceeds the
/// buffer.
pub fn parse(buffer: &[u8], len: usize, msghdr: &libc::msghdr) -> Option<ParsedDatagram> {
    let filled = buffer.get(..len)?;
    let out = RecvMsgOut::parse(filled, msghdr).ok()?;

    let base = filled.as_ptr() as usize;
    let payload = out.payload_data();
    let control = out.control_data();

    let credentials_offset =
        find_credentials(control).map(|offset| control.as_ptr() as usize - base + offset);

    Some(ParsedDatagram {
        payload_offset: payload.as_ptr() as usize - base,
        payload_len: payload.len(),
        credentials_offset,
        truncated: out.is_payload_truncated(),
    })
}

/// Reinterpret `mem::size_of::<libc::ucred>()` bytes at `offset` as credentials.
///
/// Returns `None` if the range is out of bounds or misaligned.
pub fn credentials_at(buffer: &[u8], offset: usize) -> Option<&Credentials> {
    let bytes = buffer.get(offset..offset.checked_add(mem::size_of::<libc::ucred>())?)?;
    let ptr = bytes.as_ptr();
    if ptr.align_offset(mem::align_of::<libc::ucred>()) != 0 {
        return None;
    }
    // Safety: in bounds and aligned; ucred is plain integers.
    Some(unsafe { &*(ptr as *const Credentials) })
}

/// Walk the control messages looking for `SOL_SOCKET`/`SCM_CREDENTIALS` and
/// return the offset of its body within `control`.
fn find_credentials(control: &[u8]) -> Option<usize> {
    if control.as_ptr().align_offset(mem::align_of::<libc::cmsghdr>()) != 0 {
        return None;
    }

    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_control = control.as_ptr() as *mut libc::c_void;
    msghdr.msg_controllen = control.len() as _;

    let base = control.as_ptr() as usize;
    let wanted = mem::size_of::<libc::ucred>();

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            let cmsg_ref = &*cmsg;
            if cmsg_ref.cmsg_level == libc::SOL_SOCKET
                && cmsg_ref.cmsg_type == libc::SCM_CREDENTIALS
                && cmsg_ref.cmsg_len as usize >= libc::CMSG_LEN(wanted as u32) as usize
            {
                let offset = libc::CMSG_DATA(cmsg) as usize - base;
                if offset + wanted <= control.len() {
                    return Some(offset);
                }
                return None;
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }
    None
}
