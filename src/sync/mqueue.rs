/*
 * Message Queue
 *
 * Fixed-size message slots ordered by (message priority descending,
 * arrival sequence ascending): receive always returns the
 * highest-priority, oldest message. Senders block when the queue is
 * full, receivers when it is empty; both wait lists are ordered by
 * thread priority.
 *
 * Hand-offs copy directly between the blocked peer's buffer and the
 * queue inside one critical section: a send to a waiting receiver lands
 * in the receiver's buffer without touching a slot, and a receive that
 * frees a slot immediately absorbs the highest-ranked blocked sender's
 * message.
 */

use core::fmt;

use crate::config::{MQ_MSG_SIZE, MQ_SLOTS};
use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadId};
use crate::sched::types::{Step, WaitOrder, WaitSite};
use crate::sched::with_kernel;

/// Message-queue identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MqueueId(pub usize);

impl fmt::Display for MqueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mqueue({})", self.0)
    }
}

/// One queued message.
#[derive(Clone, Copy)]
pub(crate) struct MsgSlot {
    pub(crate) prio: u8,
    pub(crate) seq: u32,
    pub(crate) len: usize,
    pub(crate) data: [u8; MQ_MSG_SIZE],
}

/// Message-queue control block
pub struct MessageQueue {
    pub id: MqueueId,
    pub name: &'static str,
    pub(crate) capacity: usize,
    pub(crate) msg_size: usize,
    /// Pending messages, kept ordered (priority desc, sequence asc).
    pub(crate) msgs: heapless::Vec<MsgSlot, MQ_SLOTS>,
    pub(crate) seq: u32,
    pub(crate) senders: ListHead,
    pub(crate) receivers: ListHead,
}

impl Kernel {
    pub(crate) fn mqueue_create(
        &mut self,
        name: &'static str,
        capacity: usize,
        msg_size: usize,
    ) -> Result<MqueueId> {
        ensure(capacity > 0 && capacity <= MQ_SLOTS, Errno::EINVAL)?;
        ensure(msg_size > 0 && msg_size <= MQ_MSG_SIZE, Errno::EINVAL)?;
        let slot = self.mqueues.insert_with(|slot| MessageQueue {
            id: MqueueId(slot),
            name,
            capacity,
            msg_size,
            msgs: heapless::Vec::new(),
            seq: 0,
            senders: ListHead::new(),
            receivers: ListHead::new(),
        })?;
        log::debug!("Created message queue '{}' with ID {}", name, MqueueId(slot));
        Ok(MqueueId(slot))
    }

    pub(crate) fn mqueue_destroy(&mut self, id: MqueueId) -> Result<()> {
        let q = self.mqueues.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(q.senders.is_empty() && q.receivers.is_empty(), Errno::EAGAIN)?;
        self.mqueues.remove(id.0);
        Ok(())
    }

    pub(crate) fn mqueue_send_step(
        &mut self,
        id: MqueueId,
        buf: *const u8,
        len: usize,
        prio: u8,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<()>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        ensure(!buf.is_null(), Errno::EINVAL)?;
        {
            let q = self.mqueues.get(id.0).ok_or(Errno::EINVAL)?;
            ensure(len <= q.msg_size, Errno::EMSGSIZE)?;
        }

        // A waiting receiver means the queue is empty: copy straight
        // into its buffer.
        let popped = {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            debug_assert!(q.receivers.is_empty() || q.msgs.is_empty());
            q.receivers.pop_front(&mut SchedLinks(&mut self.threads))
        };
        if let Some(slot) = popped {
            if let Some(t) = self.threads.get_mut(slot) {
                unsafe { core::ptr::copy_nonoverlapping(buf, t.mq_buf, len) };
                t.mq_len = len;
                t.mq_prio = prio;
            }
            self.wake(ThreadId(slot), Ok(()));
            return Ok(Step::Ready(Ok(())));
        }

        let stored = {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            if q.msgs.len() < q.capacity {
                Self::mqueue_store(q, buf, len, prio);
                true
            } else {
                false
            }
        };
        if stored {
            return Ok(Step::Ready(Ok(())));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        // Queue full: park with the pending message recorded for the
        // receive path to absorb.
        {
            let t = self.threads.get_mut(caller.0).ok_or(Errno::EINVAL)?;
            t.mq_buf = buf.cast_mut();
            t.mq_len = len;
            t.mq_prio = prio;
        }
        let (threads, mqueues) = (&mut self.threads, &mut self.mqueues);
        let q = mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut q.senders, caller, WaitOrder::Priority);
        self.block_current(WaitSite::MqSend(id), deadline)?;
        Ok(Step::Blocked)
    }

    pub(crate) fn mqueue_receive_step(
        &mut self,
        id: MqueueId,
        buf: *mut u8,
        cap: usize,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<(usize, u8)>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));
        ensure(!buf.is_null(), Errno::EINVAL)?;
        {
            let q = self.mqueues.get(id.0).ok_or(Errno::EINVAL)?;
            // The buffer must be able to hold any message this queue can
            // carry.
            ensure(cap >= q.msg_size, Errno::EMSGSIZE)?;
        }

        let taken = {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            if q.msgs.is_empty() {
                None
            } else {
                Some(q.msgs.remove(0))
            }
        };
        if let Some(msg) = taken {
            ensure(msg.len <= cap, Errno::EBADMSG)?;
            unsafe { core::ptr::copy_nonoverlapping(msg.data.as_ptr(), buf, msg.len) };
            self.mqueue_absorb_sender(id)?;
            return Ok(Step::Ready(Ok((msg.len, msg.prio))));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        {
            let t = self.threads.get_mut(caller.0).ok_or(Errno::EINVAL)?;
            t.mq_buf = buf;
            t.mq_len = cap;
            t.mq_prio = 0;
        }
        let (threads, mqueues) = (&mut self.threads, &mut self.mqueues);
        let q = mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut q.receivers, caller, WaitOrder::Priority);
        self.block_current(WaitSite::MqRecv(id), deadline)?;
        Ok(Step::Blocked)
    }

    /// Drop all pending messages, then absorb as many blocked senders as
    /// now fit. Returns how many messages were dropped.
    pub(crate) fn mqueue_flush_step(&mut self, id: MqueueId) -> Result<usize> {
        let dropped = {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            let n = q.msgs.len();
            q.msgs.clear();
            n
        };
        loop {
            let room = {
                let q = self.mqueues.get(id.0).ok_or(Errno::EINVAL)?;
                q.msgs.len() < q.capacity && !q.senders.is_empty()
            };
            if !room {
                break;
            }
            self.mqueue_absorb_sender(id)?;
        }
        Ok(dropped)
    }

    /// Move the highest-ranked blocked sender's message into a free slot
    /// and release the sender.
    fn mqueue_absorb_sender(&mut self, id: MqueueId) -> Result<()> {
        let popped = {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            q.senders.pop_front(&mut SchedLinks(&mut self.threads))
        };
        let Some(slot) = popped else {
            return Ok(());
        };
        let (src, len, prio) = {
            let t = self.threads.get(slot).ok_or(Errno::EINVAL)?;
            (t.mq_buf.cast_const(), t.mq_len, t.mq_prio)
        };
        {
            let q = self.mqueues.get_mut(id.0).ok_or(Errno::EINVAL)?;
            debug_assert!(q.msgs.len() < q.capacity, "absorb into a full queue");
            Self::mqueue_store(q, src, len, prio);
        }
        self.wake(ThreadId(slot), Ok(()));
        Ok(())
    }

    /// Copy a message into the queue, keeping (priority desc, seq asc)
    /// order so FIFO holds within each priority.
    fn mqueue_store(q: &mut MessageQueue, src: *const u8, len: usize, prio: u8) {
        let mut slot = MsgSlot {
            prio,
            seq: q.seq,
            len,
            data: [0; MQ_MSG_SIZE],
        };
        q.seq = q.seq.wrapping_add(1);
        unsafe { core::ptr::copy_nonoverlapping(src, slot.data.as_mut_ptr(), len) };
        let pos = q.msgs.partition_point(|m| m.prio >= prio);
        let _ = q.msgs.insert(pos, slot);
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a queue of `capacity` slots carrying messages up to
/// `msg_size` bytes.
pub fn create(name: &'static str, capacity: usize, msg_size: usize) -> Result<MqueueId> {
    with_kernel(|k| k.mqueue_create(name, capacity, msg_size))
}

/// Destroy a queue nobody is blocked on. Pending messages are dropped.
pub fn destroy(id: MqueueId) -> Result<()> {
    with_kernel(|k| k.mqueue_destroy(id))
}

/// Send a message at the given priority, blocking while the queue is
/// full. `EMSGSIZE` when the message exceeds the queue's slot size.
pub fn send(id: MqueueId, msg: &[u8], prio: u8) -> Result<()> {
    send_common(id, msg, prio, None, false)
}

/// Non-suspending send. Safe from ISRs.
pub fn try_send(id: MqueueId, msg: &[u8], prio: u8) -> Result<()> {
    send_common(id, msg, prio, None, true)
}

/// Send bounded by a tick count.
pub fn timed_send(id: MqueueId, msg: &[u8], prio: u8, ticks: u64) -> Result<()> {
    send_common(id, msg, prio, Some(ticks), false)
}

fn send_common(
    id: MqueueId,
    msg: &[u8],
    prio: u8,
    timeout: Option<u64>,
    try_only: bool,
) -> Result<()> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.mqueue_send_step(id, msg.as_ptr(), msg.len(), prio, timeout, try_only))?
    {
        Step::Ready(r) => {
            crate::sched::preempt();
            r
        }
        Step::Blocked => super::finish_wait(),
    }
}

/// Receive the highest-priority, oldest message into `buf`; returns the
/// message length and priority. Blocks while the queue is empty.
pub fn receive(id: MqueueId, buf: &mut [u8]) -> Result<(usize, u8)> {
    receive_common(id, buf, None, false)
}

/// Non-suspending receive. Safe from ISRs.
pub fn try_receive(id: MqueueId, buf: &mut [u8]) -> Result<(usize, u8)> {
    receive_common(id, buf, None, true)
}

/// Receive bounded by a tick count.
pub fn timed_receive(id: MqueueId, buf: &mut [u8], ticks: u64) -> Result<(usize, u8)> {
    receive_common(id, buf, Some(ticks), false)
}

fn receive_common(
    id: MqueueId,
    buf: &mut [u8],
    timeout: Option<u64>,
    try_only: bool,
) -> Result<(usize, u8)> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| {
        k.mqueue_receive_step(id, buf.as_mut_ptr(), buf.len(), timeout, try_only)
    })? {
        Step::Ready(r) => {
            crate::sched::preempt();
            r
        }
        Step::Blocked => {
            super::finish_wait()?;
            with_kernel(|k| {
                let tid = k.current_tid()?;
                let t = k.threads.get(tid.0).ok_or(Errno::EINVAL)?;
                Ok((t.mq_len, t.mq_prio))
            })
        }
    }
}

/// Drop every pending message; returns how many were dropped.
pub fn flush(id: MqueueId) -> Result<usize> {
    let r = with_kernel(|k| k.mqueue_flush_step(id));
    crate::sched::preempt();
    r
}

/// Number of queued messages.
pub fn used(id: MqueueId) -> Result<usize> {
    with_kernel(|k| Ok(k.mqueues.get(id.0).ok_or(Errno::EINVAL)?.msgs.len()))
}

/// Remaining free slots.
pub fn free(id: MqueueId) -> Result<usize> {
    with_kernel(|k| {
        let q = k.mqueues.get(id.0).ok_or(Errno::EINVAL)?;
        Ok(q.capacity - q.msgs.len())
    })
}
