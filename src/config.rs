use crate::buf_ring::MAX_RING_ENTRIES;
use crate::error::{Error, Result};

/// Configuration for a datagram handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of SQ entries. Bounds the in-flight receives the kernel accepts.
    pub queue_depth: u32,
    /// Number of buffers in the provided buffer ring (must be power of 2).
    pub num_buffers: u16,
    /// Largest datagram payload exposed to the caller, in bytes.
    pub payload_size: usize,
    /// Consecutive failed completion waits tolerated before `receive`
    /// reports an error instead of re-arming.
    pub wait_failure_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_depth: 8,
            num_buffers: 64,
            payload_size: 4096,
            wait_failure_limit: 8,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        validate_queue_depth(self.queue_depth)?;
        validate_pool(self.num_buffers, self.payload_size)
    }
}

pub(crate) fn validate_queue_depth(queue_depth: u32) -> Result<()> {
    if queue_depth == 0 {
        return Err(Error::InvalidArgument("queue depth must be positive"));
    }
    Ok(())
}

pub(crate) fn validate_pool(num_buffers: u16, payload_size: usize) -> Result<()> {
    if !num_buffers.is_power_of_two() || num_buffers > MAX_RING_ENTRIES {
        return Err(Error::InvalidArgument(
            "buffer count must be a power of two no larger than 32768",
        ));
    }
    if payload_size == 0 {
        return Err(Error::InvalidArgument("payload size must be positive"));
    }
    Ok(())
}
