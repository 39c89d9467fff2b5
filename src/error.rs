use std::io;

/// Errors returned by the datagram handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The running kernel lacks multishot recvmsg with ring-provided buffers.
    #[error("kernel does not support multishot recvmsg with provided buffer rings")]
    Unsupported,
    /// A caller-supplied parameter was rejected before reaching the kernel.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("ring already set up")]
    AlreadySetUp,
    #[error("ring not set up")]
    NotSetUp,
    #[error("buffer group already registered")]
    AlreadyRegistered,
    #[error("no buffer group registered")]
    NotRegistered,
    /// A datagram is still surfaced to the caller and must be released first.
    #[error("a received buffer is still outstanding")]
    BufferOutstanding,
    /// The kernel refused to create the ring (permissions, memory, seccomp).
    #[error("ring setup: {0}")]
    RingSetup(#[source] io::Error),
    /// The kernel refused to create or populate the provided buffer ring.
    #[error("buffer registration: {0}")]
    Registration(#[source] io::Error),
    /// The multishot recvmsg submission was rejected.
    #[error("submission: {0}")]
    Submit(#[source] io::Error),
    /// Waiting for completions kept failing.
    #[error("completion wait: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
