use std::io;
use std::os::fd::RawFd;

use io_uring::types::Fd;
use io_uring::{IoUring, cqueue, opcode, squeue};
use tracing::trace;

use crate::buf_ring::BufRing;

/// user_data of the multishot recvmsg.
const RECV_USER_DATA: u64 = 1;
/// user_data of the cancel request targeting it.
const CANCEL_USER_DATA: u64 = 2;

/// Owned io_uring instance driven by a single thread.
pub struct Ring {
    ring: IoUring,
}

impl Ring {
    /// Create the ring with `queue_depth` SQ entries.
    ///
    /// The calling thread becomes the only submitter (`SINGLE_ISSUER`), task
    /// work runs only when we reap completions (`DEFER_TASKRUN`) and submits
    /// never IPI the issuer (`COOP_TASKRUN`, `TASKRUN_FLAG`).
    pub fn setup(queue_depth: u32) -> io::Result<Self> {
        let mut builder = IoUring::builder();
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_taskrun_flag();
        builder.setup_defer_taskrun();

        let ring = builder.build(queue_depth)?;
        Ok(Ring { ring })
    }

    /// Register the provided buffer ring under `bgid`.
    ///
    /// # Safety
    ///
    /// `buf_ring` must stay alive and unmoved until [`Ring::unregister_buf_ring`]
    /// succeeds for the same group.
    pub unsafe fn register_buf_ring(&self, buf_ring: &BufRing, bgid: u16) -> io::Result<()> {
        unsafe {
            self.ring.submitter().register_buf_ring_with_flags(
                buf_ring.ring_addr(),
                buf_ring.ring_entries(),
                bgid,
                0,
            )
        }
    }

    pub fn unregister_buf_ring(&self, bgid: u16) -> io::Result<()> {
        self.ring.submitter().unregister_buf_ring(bgid)
    }

    /// Queue and submit a multishot recvmsg on `fd` drawing buffers from `bgid`.
    ///
    /// The opcode sets `IOSQE_BUFFER_SELECT` and stamps the group itself.
    ///
    /// # Safety
    ///
    /// `msghdr` must point to a valid msghdr that outlives the submission.
    pub unsafe fn submit_multishot_recvmsg(
        &mut self,
        fd: RawFd,
        msghdr: *const libc::msghdr,
        bgid: u16,
    ) -> io::Result<()> {
        let entry = opcode::RecvMsgMulti::new(Fd(fd), msghdr, bgid)
            .build()
            .user_data(RECV_USER_DATA);
        unsafe { self.push_and_submit(&entry) }
    }

    /// Cancel the multishot recvmsg and reap completions until both the
    /// cancel and the chain's final (non-`MORE`) completion are seen.
    ///
    /// Every recvmsg completion reaped on the way is dropped. Returns how many
    /// of them held a selected buffer.
    pub fn cancel_multishot_recvmsg(&mut self) -> io::Result<usize> {
        let entry = opcode::AsyncCancel::new(RECV_USER_DATA)
            .build()
            .user_data(CANCEL_USER_DATA);
        // Safety: cancel carries no pointers.
        unsafe { self.push_and_submit(&entry)? };

        let mut cancelled = false;
        let mut ended = false;
        let mut discarded = 0;
        while !(cancelled && ended) {
            let next = self.ring.completion().next();
            let Some(cqe) = next else {
                match self.ring.submit_and_wait(1) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
                continue;
            };

            match cqe.user_data() {
                RECV_USER_DATA => {
                    if cqueue::buffer_select(cqe.flags()).is_some() {
                        discarded += 1;
                    }
                    ended |= !cqueue::more(cqe.flags());
                }
                CANCEL_USER_DATA => {
                    trace!(result = cqe.result(), "recvmsg cancel completed");
                    cancelled = true;
                }
                user_data => trace!(user_data, "dropping unrelated completion"),
            }
        }
        Ok(discarded)
    }

    /// # Safety
    ///
    /// Any buffers `entry` points at must stay valid until it completes.
    unsafe fn push_and_submit(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        unsafe {
            self.ring
                .submission()
                .push(entry)
                .map_err(|_| io::Error::other("SQ full"))?;
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Pop the next completion, entering the kernel to wait for one if the
    /// CQ is empty.
    ///
    /// Only recvmsg completions are returned. The entry is consumed from the
    /// CQ as it is returned; callers keep the copy for as long as they need
    /// its flags.
    pub fn next_completion(&mut self) -> io::Result<cqueue::Entry> {
        loop {
            while let Some(cqe) = self.ring.completion().next() {
                if cqe.user_data() == RECV_USER_DATA {
                    return Ok(cqe);
                }
                trace!(user_data = cqe.user_data(), "dropping unrelated completion");
            }
            self.ring.submit_and_wait(1)?;
        }
    }
}
