/*
 * Memory Pool
 *
 * A fixed-block allocator over a caller-supplied buffer. The free list
 * is threaded through the unused blocks themselves (first word: next
 * free block index), so the pool needs no storage beyond the buffer.
 * Freed blocks are stamped with a magic word, which makes double-frees
 * detectable while the stamp survives.
 *
 * `alloc` blocks when the pool is exhausted; `free` hands the block
 * directly to the first waiter.
 */

use core::fmt;
use core::mem::{align_of, size_of};

use crate::errno::{Errno, Result, ensure};
use crate::list::ListHead;
use crate::port;
use crate::sched::kernel::Kernel;
use crate::sched::thread::{SchedLinks, ThreadId};
use crate::sched::types::{Step, WaitOrder, WaitSite};
use crate::sched::with_kernel;

/// Memory-pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub usize);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({})", self.0)
    }
}

/// End-of-list marker inside a free block's link word.
const FREE_END: usize = usize::MAX;

/// Stamp written into the second word of a free block.
const FREE_STAMP: usize = 0x4652_4545; // "FREE"

/// Memory-pool control block
pub struct MemoryPool {
    pub id: PoolId,
    pub name: &'static str,
    pub(crate) base: *mut u8,
    pub(crate) block_size: usize,
    pub(crate) block_count: usize,
    pub(crate) free_head: Option<usize>,
    pub(crate) free_count: usize,
    pub(crate) waiters: ListHead,
}

impl MemoryPool {
    fn block(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.block_count);
        unsafe { self.base.add(index * self.block_size) }
    }

    /// Blocks big enough for two words carry the double-free stamp.
    fn stamped(&self) -> bool {
        self.block_size >= 2 * size_of::<usize>()
    }

    unsafe fn read_word(&self, index: usize, word: usize) -> usize {
        unsafe { self.block(index).cast::<usize>().add(word).read() }
    }

    unsafe fn write_word(&self, index: usize, word: usize, value: usize) {
        unsafe { self.block(index).cast::<usize>().add(word).write(value) }
    }
}

impl Kernel {
    pub(crate) fn pool_create(
        &mut self,
        name: &'static str,
        base: *mut u8,
        block_size: usize,
        block_count: usize,
    ) -> Result<PoolId> {
        ensure(!base.is_null(), Errno::EINVAL)?;
        ensure(block_count > 0, Errno::EINVAL)?;
        // The free list lives inside the blocks: each one must hold at
        // least a link word, correctly aligned.
        ensure(block_size >= size_of::<usize>(), Errno::EINVAL)?;
        ensure(block_size % align_of::<usize>() == 0, Errno::EINVAL)?;
        ensure(base as usize % align_of::<usize>() == 0, Errno::EINVAL)?;

        let slot = self.pools.insert_with(|slot| MemoryPool {
            id: PoolId(slot),
            name,
            base,
            block_size,
            block_count,
            free_head: Some(0),
            free_count: block_count,
            waiters: ListHead::new(),
        })?;

        // Thread the free list through the blocks.
        let p = self.pools.get(slot).ok_or(Errno::EINVAL)?;
        for i in 0..block_count {
            let next = if i + 1 < block_count { i + 1 } else { FREE_END };
            unsafe {
                p.write_word(i, 0, next);
                if p.stamped() {
                    p.write_word(i, 1, FREE_STAMP);
                }
            }
        }

        log::debug!("Created memory pool '{}' with ID {}", name, PoolId(slot));
        Ok(PoolId(slot))
    }

    pub(crate) fn pool_destroy(&mut self, id: PoolId) -> Result<()> {
        let p = self.pools.get(id.0).ok_or(Errno::EINVAL)?;
        ensure(p.waiters.is_empty(), Errno::EAGAIN)?;
        self.pools.remove(id.0);
        Ok(())
    }

    pub(crate) fn pool_alloc_step(
        &mut self,
        id: PoolId,
        timeout: Option<u64>,
        try_only: bool,
    ) -> Result<Step<*mut u8>> {
        let caller = self.current_tid()?;
        let deadline = timeout.map(|t| self.deadline_in(t));

        let taken = {
            let p = self.pools.get_mut(id.0).ok_or(Errno::EINVAL)?;
            match p.free_head {
                Some(index) => {
                    let next = unsafe { p.read_word(index, 0) };
                    p.free_head = if next == FREE_END { None } else { Some(next) };
                    p.free_count -= 1;
                    if p.stamped() {
                        unsafe { p.write_word(index, 1, 0) };
                    }
                    Some(p.block(index))
                }
                None => None,
            }
        };
        if let Some(block) = taken {
            return Ok(Step::Ready(Ok(block)));
        }
        if try_only {
            return Ok(Step::Ready(Err(Errno::EAGAIN)));
        }

        let (threads, pools) = (&mut self.threads, &mut self.pools);
        let p = pools.get_mut(id.0).ok_or(Errno::EINVAL)?;
        Self::wait_insert(threads, &mut p.waiters, caller, WaitOrder::Fifo);
        self.block_current(WaitSite::Pool(id), deadline)?;
        Ok(Step::Blocked)
    }

    pub(crate) fn pool_free_step(&mut self, id: PoolId, block: *mut u8) -> Result<()> {
        let index = {
            let p = self.pools.get(id.0).ok_or(Errno::EINVAL)?;
            let offset = (block as usize).wrapping_sub(p.base as usize);
            ensure(
                offset < p.block_count * p.block_size && offset % p.block_size == 0,
                Errno::EINVAL,
            )?;
            let index = offset / p.block_size;
            if p.stamped() {
                let stamp = unsafe { p.read_word(index, 1) };
                ensure(stamp != FREE_STAMP, Errno::EINVAL)?;
            }
            index
        };

        // Direct hand-off to the first waiter keeps the block hot and
        // the free list untouched.
        let popped = {
            let p = self.pools.get_mut(id.0).ok_or(Errno::EINVAL)?;
            p.waiters.pop_front(&mut SchedLinks(&mut self.threads))
        };
        if let Some(slot) = popped {
            if let Some(t) = self.threads.get_mut(slot) {
                t.alloc_ptr = block;
            }
            self.wake(ThreadId(slot), Ok(()));
            return Ok(());
        }

        let p = self.pools.get_mut(id.0).ok_or(Errno::EINVAL)?;
        let next = match p.free_head {
            Some(head) => head,
            None => FREE_END,
        };
        unsafe {
            p.write_word(index, 0, next);
            if p.stamped() {
                p.write_word(index, 1, FREE_STAMP);
            }
        }
        p.free_head = Some(index);
        p.free_count += 1;
        Ok(())
    }
}

// ================================================================================================
// PUBLIC API
// ================================================================================================

/// Create a pool of fixed blocks carved from a static buffer. The block
/// count is the buffer length divided by `block_size`.
pub fn create(name: &'static str, region: &'static mut [u8], block_size: usize) -> Result<PoolId> {
    ensure(block_size > 0, Errno::EINVAL)?;
    let count = region.len() / block_size;
    with_kernel(|k| k.pool_create(name, region.as_mut_ptr(), block_size, count))
}

/// Create a pool over a raw region.
///
/// # Safety
/// `base` must point to a writable region of at least
/// `block_size * block_count` bytes that stays valid and unaliased for
/// the pool's lifetime.
pub unsafe fn create_from_raw(
    name: &'static str,
    base: *mut u8,
    block_size: usize,
    block_count: usize,
) -> Result<PoolId> {
    with_kernel(|k| k.pool_create(name, base, block_size, block_count))
}

/// Destroy a pool nobody is waiting on.
pub fn destroy(id: PoolId) -> Result<()> {
    with_kernel(|k| k.pool_destroy(id))
}

/// Take one block, blocking while the pool is exhausted.
pub fn alloc(id: PoolId) -> Result<*mut u8> {
    alloc_common(id, None, false)
}

/// Non-suspending take. Safe from ISRs.
pub fn try_alloc(id: PoolId) -> Result<*mut u8> {
    alloc_common(id, None, true)
}

/// Take bounded by a tick count.
pub fn timed_alloc(id: PoolId, ticks: u64) -> Result<*mut u8> {
    alloc_common(id, Some(ticks), false)
}

fn alloc_common(id: PoolId, timeout: Option<u64>, try_only: bool) -> Result<*mut u8> {
    if !try_only {
        ensure(!port::in_handler_mode(), Errno::EPERM)?;
    }
    match with_kernel(|k| k.pool_alloc_step(id, timeout, try_only))? {
        Step::Ready(r) => r,
        Step::Blocked => {
            super::finish_wait()?;
            with_kernel(|k| {
                let tid = k.current_tid()?;
                Ok(k.threads.get(tid.0).ok_or(Errno::EINVAL)?.alloc_ptr)
            })
        }
    }
}

/// Return a block to the pool, waking one waiter if any. `EINVAL` on a
/// pointer outside the pool, a misaligned pointer or a detected
/// double-free.
pub fn free(id: PoolId, block: *mut u8) -> Result<()> {
    let r = with_kernel(|k| k.pool_free_step(id, block));
    crate::sched::preempt();
    r
}

/// Total block count.
pub fn block_count(id: PoolId) -> Result<usize> {
    with_kernel(|k| Ok(k.pools.get(id.0).ok_or(Errno::EINVAL)?.block_count))
}

/// Blocks currently free.
pub fn free_count(id: PoolId) -> Result<usize> {
    with_kernel(|k| Ok(k.pools.get(id.0).ok_or(Errno::EINVAL)?.free_count))
}
