/*
 * Ready List
 *
 * Ready threads are kept in one FIFO per priority level, indexed by a
 * two-level bitmap: one bit per 16-level group, one bit per level within
 * the group. Selecting the next runnable thread is find-highest-set-bit
 * twice, then pop the head of that level's FIFO.
 *
 * Push-back and remove are O(1); pop-highest is O(1) in the number of
 * threads. FIFO order within a level gives round-robin among equal
 * priorities.
 */

use crate::config::{PRIO_GROUPS, PRIO_LEVELS};
use crate::list::ListHead;

use super::thread::{SchedLinks, ThreadArena, ThreadId};
use super::types::Priority;

pub(crate) struct ReadyQueue {
    /// One bit per group of 16 levels; set when any level bit is set.
    groups: u16,
    /// One bit per level within each group.
    level_bits: [u16; PRIO_GROUPS],
    /// Per-level FIFO of ready threads, linked through the scheduling
    /// link embedded in each thread control block.
    fifos: [ListHead; PRIO_LEVELS],
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            groups: 0,
            level_bits: [0; PRIO_GROUPS],
            fifos: [ListHead::new(); PRIO_LEVELS],
        }
    }

    /// Highest priority with at least one ready thread.
    pub fn highest(&self) -> Option<Priority> {
        if self.groups == 0 {
            return None;
        }
        let group = 15 - self.groups.leading_zeros() as usize;
        let bits = self.level_bits[group];
        debug_assert!(bits != 0, "group bit set with empty group");
        let sub = 15 - bits.leading_zeros() as usize;
        Some(Priority((group * 16 + sub) as u8))
    }

    /// Append a thread at the tail of its priority level's FIFO. The
    /// thread's current priority decides the level; it must not change
    /// while the thread is queued.
    pub fn push(&mut self, threads: &mut ThreadArena, tid: ThreadId) {
        let Some(level) = threads.get(tid.0).map(|t| t.priority.level()) else {
            return;
        };
        self.fifos[level].push_back(&mut SchedLinks(threads), tid.0);
        self.mark(level);
    }

    /// Pop the head of the highest non-empty level.
    pub fn pop_highest(&mut self, threads: &mut ThreadArena) -> Option<ThreadId> {
        let prio = self.highest()?;
        let level = prio.level();
        let slot = self.fifos[level].pop_front(&mut SchedLinks(threads))?;
        if self.fifos[level].is_empty() {
            self.unmark(level);
        }
        Some(ThreadId(slot))
    }

    /// Unlink a thread from its level's FIFO (priority change, kill).
    /// Returns false when the thread was not queued.
    pub fn remove(&mut self, threads: &mut ThreadArena, tid: ThreadId) -> bool {
        let Some(level) = threads.get(tid.0).map(|t| t.priority.level()) else {
            return false;
        };
        let removed = self.fifos[level].remove(&mut SchedLinks(threads), tid.0);
        if removed && self.fifos[level].is_empty() {
            self.unmark(level);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fifos.iter().map(|f| f.len()).sum()
    }

    fn mark(&mut self, level: usize) {
        self.level_bits[level / 16] |= 1 << (level % 16);
        self.groups |= 1 << (level / 16);
    }

    fn unmark(&mut self, level: usize) {
        self.level_bits[level / 16] &= !(1 << (level % 16));
        if self.level_bits[level / 16] == 0 {
            self.groups &= !(1 << (level / 16));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::kernel::Kernel;
    use super::super::types::{Priority, Stack};
    use super::*;

    fn stack() -> Stack {
        // Leaked so the region outlives the test thread.
        Stack::new(Box::leak(Box::new([0u8; 128])))
    }

    fn spawn(k: &mut Kernel, prio: u8) -> ThreadId {
        let tid = k
            .thread_create(|_| {}, 0, "t", Priority(prio), stack())
            .unwrap();
        k.activate(tid).unwrap();
        tid
    }

    #[test]
    fn test_pop_highest_first() {
        let mut k = Kernel::new();
        let low = spawn(&mut k, 10);
        let high = spawn(&mut k, 200);
        let mid = spawn(&mut k, 100);

        assert_eq!(k.ready.highest(), Some(Priority(200)));
        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(high));
        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(mid));
        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(low));
        assert_eq!(k.ready.pop_highest(&mut k.threads), None);
        assert_eq!(k.ready.highest(), None);
    }

    #[test]
    fn test_fifo_among_equals() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, 50);
        let b = spawn(&mut k, 50);
        let c = spawn(&mut k, 50);

        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(a));
        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(b));
        assert_eq!(k.ready.pop_highest(&mut k.threads), Some(c));
    }

    #[test]
    fn test_remove_clears_bitmap() {
        let mut k = Kernel::new();
        let t = spawn(&mut k, 42);
        assert_eq!(k.ready.highest(), Some(Priority(42)));
        assert!(k.ready.remove(&mut k.threads, t));
        assert_eq!(k.ready.highest(), None);
        assert!(!k.ready.remove(&mut k.threads, t));
    }
}
