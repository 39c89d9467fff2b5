//! uring-dgram - multishot io_uring datagram receiver.
//!
//! This crate reads datagrams from an existing socket with one multishot
//! `IORING_OP_RECVMSG` submission and a ring of kernel-provided buffers.
//! Each datagram is lent to the caller in place, together with the sender's
//! `SCM_CREDENTIALS` when present, and recycled to the kernel when the
//! caller drops it.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::os::fd::AsRawFd;
//! use uring_dgram::{Config, Handler, Reception};
//!
//! let socket = std::os::unix::net::UnixDatagram::bind("/run/example.sock")?;
//! let mut handler = Handler::with_config(socket.as_raw_fd(), &Config::default())?;
//!
//! loop {
//!     match handler.receive()? {
//!         Reception::Datagram(datagram) => {
//!             let sender = datagram.credentials().map(|creds| creds.pid());
//!             println!("{} bytes from {:?}", datagram.len(), sender);
//!             // dropping the datagram returns its buffer to the kernel
//!         }
//!         Reception::Empty => {}
//!     }
//! }
//! ```
//!
//! # Requirements
//!
//! Linux 6.1 or newer. Check [`is_supported`] before building a handler;
//! [`Handler::setup`] fails with [`Error::Unsupported`] on older kernels.

mod buf_ring;
mod config;
mod error;
mod handler;
mod msg;
mod probe;
mod ring;

pub use config::Config;
pub use error::{Error, Result};
pub use handler::{Datagram, Handler, RECV_BGID, Reception, Stats};
pub use msg::{BufferLayout, Credentials, RECVMSG_OUT_LEN};
pub use probe::{MIN_KERNEL_RELEASE, is_supported, release_supports};
