//! Multishot datagram receive handler.
//!
//! A [`Handler`] owns one io_uring instance and one provided buffer ring and
//! reads datagrams from a borrowed socket with a single multishot recvmsg
//! submission. Each completion lends one pool buffer to the caller as a
//! [`Datagram`]; dropping it hands the buffer back to the kernel and re-arms
//! the recvmsg if the kernel ended the multishot chain.
//!
//! The handler is `!Send`: the ring is created with `SINGLE_ISSUER`, so the
//! thread that calls [`Handler::setup`] is the only one allowed to use it.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::RawFd;

use io_uring::cqueue;
use tracing::{debug, error, trace, warn};

use crate::buf_ring::BufRing;
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::msg::{self, BufferLayout, Credentials, ParsedDatagram};
use crate::probe;
use crate::ring::Ring;

/// Buffer group ID for the provided buffer ring.
pub const RECV_BGID: u16 = 0;

/// Registered buffer pool.
struct Pool {
    buf_ring: BufRing,
    layout: BufferLayout,
}

/// The buffer currently lent to the caller.
#[derive(Debug, Clone, Copy)]
struct Active {
    buf_id: u16,
    /// `IORING_CQE_F_MORE` of the completion that delivered it.
    more: bool,
}

/// Counters for handler activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Successful multishot recvmsg submissions.
    pub arms: u64,
    /// Datagrams surfaced to the caller.
    pub received: u64,
    /// Surfaced buffers handed back to the kernel.
    pub released: u64,
    /// Completions carrying a negative result.
    pub kernel_errors: u64,
    /// Completions whose buffer failed validation.
    pub invalid_headers: u64,
    /// Failed waits for a completion.
    pub wait_failures: u64,
}

/// Outcome of [`Handler::receive`].
#[derive(Debug)]
pub enum Reception<'a> {
    /// A datagram is lent to the caller until the guard is dropped.
    Datagram(Datagram<'a>),
    /// The completion carried no datagram; the chain was re-armed if needed.
    Empty,
}

impl<'a> Reception<'a> {
    pub fn into_datagram(self) -> Option<Datagram<'a>> {
        match self {
            Reception::Datagram(datagram) => Some(datagram),
            Reception::Empty => None,
        }
    }
}

/// Datagram receiver over an externally owned socket.
pub struct Handler {
    /// Borrowed socket. Never closed by the handler.
    fd: RawFd,
    ring: Option<Ring>,
    pool: Option<Pool>,
    /// recvmsg template shared with the kernel; boxed so its address is stable.
    msghdr: Box<libc::msghdr>,
    active: Option<Active>,
    /// A multishot recvmsg is believed to be in flight.
    armed: bool,
    wait_failure_limit: u32,
    consecutive_wait_failures: u32,
    stats: Stats,
}

impl Handler {
    /// Create a handler for `fd`. No kernel resources are acquired yet.
    ///
    /// The socket must stay open for the handler's lifetime. Unix datagram
    /// sockets need `SO_PASSCRED` for sender credentials to be delivered.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            ring: None,
            pool: None,
            msghdr: Box::new(unsafe { mem::zeroed() }),
            active: None,
            armed: false,
            wait_failure_limit: Config::default().wait_failure_limit,
            consecutive_wait_failures: 0,
            stats: Stats::default(),
        }
    }

    /// Create a handler, set up its ring, register its pool and arm the
    /// multishot recvmsg.
    pub fn with_config(fd: RawFd, config: &Config) -> Result<Self> {
        config.validate()?;

        let mut handler = Self::new(fd);
        handler.wait_failure_limit = config.wait_failure_limit;
        handler.setup(config.queue_depth)?;
        handler.allocate_and_register(config.num_buffers, config.payload_size)?;
        handler.arm_multishot_recv()?;
        Ok(handler)
    }

    /// Check if the running kernel supports the handler.
    pub fn is_supported() -> bool {
        probe::is_supported()
    }

    /// Create the io_uring instance. May be called once.
    pub fn setup(&mut self, queue_depth: u32) -> Result<()> {
        config::validate_queue_depth(queue_depth)?;
        if self.ring.is_some() {
            return Err(Error::AlreadySetUp);
        }
        if !probe::is_supported() {
            warn!("kernel too old for multishot recvmsg with provided buffers");
            return Err(Error::Unsupported);
        }

        let ring = Ring::setup(queue_depth).map_err(|e| {
            error!(queue_depth, error = %e, "failed to set up io_uring");
            Error::RingSetup(e)
        })?;
        self.ring = Some(ring);

        debug!(fd = self.fd, queue_depth, "io_uring ready");
        Ok(())
    }

    /// Allocate `num_buffers` buffers able to hold `payload_size` payload
    /// bytes each and register them as the handler's buffer group.
    ///
    /// On failure nothing stays registered and the call can be retried.
    pub fn allocate_and_register(&mut self, num_buffers: u16, payload_size: usize) -> Result<()> {
        config::validate_pool(num_buffers, payload_size)?;
        let ring = self.ring.as_ref().ok_or(Error::NotSetUp)?;
        if self.pool.is_some() {
            return Err(Error::AlreadyRegistered);
        }

        let layout = BufferLayout::new(payload_size);
        let buf_ring = BufRing::new(num_buffers, layout.buffer_size()).map_err(|e| {
            error!(num_buffers, buffer_size = layout.buffer_size(), error = %e, "failed to allocate buffer pool");
            Error::Registration(e)
        })?;

        // Safety: the pool is only dropped after a successful unregister.
        unsafe { ring.register_buf_ring(&buf_ring, RECV_BGID) }.map_err(|e| {
            error!(num_buffers, bgid = RECV_BGID, error = %e, "failed to register buffer ring");
            Error::Registration(e)
        })?;

        debug!(
            num_buffers,
            buffer_size = layout.buffer_size(),
            ancillary_len = layout.ancillary_len(),
            "buffer ring registered"
        );
        self.pool = Some(Pool { buf_ring, layout });
        Ok(())
    }

    /// Take the buffer group back from the kernel and free the pool.
    ///
    /// A live multishot recvmsg is cancelled first and every completion it
    /// already posted is dropped, so nothing from the old pool reaches a
    /// later registration. Datagrams in those completions are lost. No-op
    /// when nothing is registered. Any buffer still lent out is forgotten.
    pub fn deregister(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        self.active = None;

        let Some(ring) = self.ring.as_mut() else {
            drop(pool);
            return;
        };

        if self.armed {
            match ring.cancel_multishot_recvmsg() {
                Ok(discarded) => {
                    self.armed = false;
                    debug!(fd = self.fd, discarded, "multishot recvmsg cancelled");
                }
                Err(e) => {
                    error!(fd = self.fd, error = %e, "failed to cancel multishot recvmsg, leaking pool");
                    mem::forget(pool);
                    return;
                }
            }
        }

        if let Err(e) = ring.unregister_buf_ring(RECV_BGID) {
            // The kernel may still write into the pool; leak it rather than free it.
            error!(bgid = RECV_BGID, error = %e, "failed to unregister buffer ring, leaking pool");
            mem::forget(pool);
            return;
        }

        debug!(bgid = RECV_BGID, "buffer ring unregistered");
        drop(pool);
    }

    /// Submit a multishot recvmsg selecting buffers from the handler's group.
    pub fn arm_multishot_recv(&mut self) -> Result<()> {
        let fd = self.fd;
        let ring = self.ring.as_mut().ok_or(Error::NotSetUp)?;
        let pool = self.pool.as_ref().ok_or(Error::NotRegistered)?;

        *self.msghdr = pool.layout.recvmsg_template();

        // Safety: msghdr is boxed and lives as long as the handler.
        unsafe { ring.submit_multishot_recvmsg(fd, &*self.msghdr, RECV_BGID) }.map_err(|e| {
            warn!(fd, error = %e, "failed to arm multishot recvmsg");
            self.armed = false;
            Error::Submit(e)
        })?;

        self.armed = true;
        self.stats.arms += 1;
        trace!(fd, "multishot recvmsg armed");
        Ok(())
    }

    /// Wait for the next completion and lend its datagram to the caller.
    ///
    /// Blocks until the kernel posts a completion. Completions that carry no
    /// usable datagram (kernel errors, invalid headers, failed waits) yield
    /// [`Reception::Empty`] after re-arming the chain when it has ended.
    /// Errors mean the handler cannot make progress: re-arming failed or
    /// waits kept failing past the configured limit.
    pub fn receive(&mut self) -> Result<Reception<'_>> {
        if self.active.is_some() {
            return Err(Error::BufferOutstanding);
        }
        if self.ring.is_none() {
            return Err(Error::NotSetUp);
        }
        if self.pool.is_none() {
            return Err(Error::NotRegistered);
        }
        if !self.armed {
            self.arm_multishot_recv()?;
        }

        let ring = self.ring.as_mut().ok_or(Error::NotSetUp)?;
        let cqe = match ring.next_completion() {
            Ok(cqe) => cqe,
            Err(e) => return self.on_wait_failure(e),
        };
        self.consecutive_wait_failures = 0;

        self.on_completion(cqe.result(), cqe.flags())
    }

    fn on_completion(&mut self, result: i32, flags: u32) -> Result<Reception<'_>> {
        let more = cqueue::more(flags);
        let selected = cqueue::buffer_select(flags);
        if !more {
            self.armed = false;
        }

        if result < 0 {
            self.stats.kernel_errors += 1;
            let err = io::Error::from_raw_os_error(-result);
            if result == -libc::ENOBUFS {
                debug!(fd = self.fd, "buffer ring exhausted, multishot recvmsg ended");
            } else {
                warn!(fd = self.fd, error = %err, more, "multishot recvmsg failed");
            }
            if let Some(buf_id) = selected {
                self.recycle(buf_id);
            }
            self.rearm_if_ended()?;
            return Ok(Reception::Empty);
        }

        let Some(buf_id) = selected else {
            self.stats.invalid_headers += 1;
            warn!(fd = self.fd, len = result, "completion without a selected buffer");
            self.rearm_if_ended()?;
            return Ok(Reception::Empty);
        };

        let parsed = self
            .pool
            .as_ref()
            .and_then(|pool| pool.buf_ring.get(buf_id))
            .and_then(|buf| msg::parse(buf, result as usize, &self.msghdr));

        let Some(parsed) = parsed else {
            self.stats.invalid_headers += 1;
            warn!(fd = self.fd, buf_id, len = result, "invalid recvmsg header, recycling buffer");
            self.recycle(buf_id);
            self.rearm_if_ended()?;
            return Ok(Reception::Empty);
        };

        if parsed.truncated {
            debug!(fd = self.fd, buf_id, "datagram truncated to buffer payload size");
        }

        self.active = Some(Active { buf_id, more });
        self.stats.received += 1;
        trace!(
            buf_id,
            len = parsed.payload_len,
            credentials = parsed.credentials_offset.is_some(),
            more,
            "datagram received"
        );

        Ok(Reception::Datagram(Datagram {
            handler: self,
            buf_id,
            parsed,
        }))
    }

    /// Hand the surfaced buffer back to the kernel.
    ///
    /// Re-arms the multishot recvmsg if the completion that delivered the
    /// buffer ended the chain. No-op when no buffer is surfaced.
    pub fn release(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.recycle(active.buf_id);
        self.stats.released += 1;
        trace!(buf_id = active.buf_id, "buffer released");

        if !active.more {
            debug!(fd = self.fd, "multishot recvmsg ended, re-arming");
            // Failure is logged by arm; the next receive retries it.
            let _ = self.arm_multishot_recv();
        }
    }

    fn recycle(&mut self, buf_id: u16) {
        if let Some(pool) = self.pool.as_mut()
            && buf_id < pool.buf_ring.ring_entries()
        {
            pool.buf_ring.return_buffer(buf_id);
        }
    }

    fn rearm_if_ended(&mut self) -> Result<()> {
        if self.armed {
            return Ok(());
        }
        self.arm_multishot_recv()
    }

    fn on_wait_failure(&mut self, e: io::Error) -> Result<Reception<'_>> {
        self.stats.wait_failures += 1;
        self.consecutive_wait_failures += 1;

        if self.consecutive_wait_failures > self.wait_failure_limit {
            error!(
                fd = self.fd,
                failures = self.consecutive_wait_failures,
                error = %e,
                "completion wait keeps failing"
            );
            return Err(Error::Wait(e));
        }

        warn!(fd = self.fd, error = %e, armed = self.armed, "completion wait failed");
        self.rearm_if_ended()?;
        Ok(Reception::Empty)
    }

    /// Buffer currently lent to the caller.
    pub fn active_buffer(&self) -> Option<u16> {
        self.active.map(|active| active.buf_id)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_setup(&self) -> bool {
        self.ring.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Number of registered buffers, 0 when unregistered.
    pub fn num_buffers(&self) -> u16 {
        self.pool
            .as_ref()
            .map(|pool| pool.buf_ring.ring_entries())
            .unwrap_or(0)
    }

    /// Size of each registered buffer, 0 when unregistered.
    pub fn buffer_size(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.buf_ring.buffer_size())
            .unwrap_or(0)
    }

    /// Control area length requested per datagram, 0 when unregistered.
    pub fn ancillary_len(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.layout.ancillary_len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        // Buffers go back before the ring is torn down.
        self.deregister();
        self.ring = None;
    }
}

/// A received datagram borrowed from the handler's pool.
///
/// Dropping it releases the buffer back to the kernel.
pub struct Datagram<'a> {
    handler: &'a mut Handler,
    buf_id: u16,
    parsed: ParsedDatagram,
}

impl Datagram<'_> {
    /// Pool index of the buffer holding this datagram.
    pub fn buffer_id(&self) -> u16 {
        self.buf_id
    }

    fn buffer(&self) -> &[u8] {
        self.handler
            .pool
            .as_ref()
            .and_then(|pool| pool.buf_ring.get(self.buf_id))
            .unwrap_or(&[])
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.parsed.payload_offset;
        self.buffer()
            .get(start..start + self.parsed.payload_len)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.parsed.payload_len
    }

    pub fn is_empty(&self) -> bool {
        self.parsed.payload_len == 0
    }

    /// Sender credentials, if the kernel attached `SCM_CREDENTIALS`.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.parsed
            .credentials_offset
            .and_then(|offset| msg::credentials_at(self.buffer(), offset))
    }

    /// The datagram did not fit and was cut to the payload size.
    pub fn is_truncated(&self) -> bool {
        self.parsed.truncated
    }

    /// Release the buffer now. Same as dropping the datagram.
    pub fn release(self) {}
}

impl fmt::Debug for Datagram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("buffer_id", &self.buf_id)
            .field("len", &self.parsed.payload_len)
            .field("credentials", &self.credentials())
            .field("truncated", &self.parsed.truncated)
            .finish()
    }
}

impl Drop for Datagram<'_> {
    fn drop(&mut self) {
        self.handler.release();
    }
}
