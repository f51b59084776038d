//! Blocking slot allocator for the transfer and task request lists.
//!
//! Waiters are served in arrival order: each caller draws a ticket and only the caller holding
//! the oldest ticket may take a freed slot. There is no timeout here; the only way out of a
//! blocked `acquire` other than getting a slot is closing the pool.

use crate::error::{UfsError, UfsResult};
use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// SCSI transfer requests.
    Transfer,
    /// The transfer slot reserved for NOP and query requests.
    DeviceManagement,
    /// Task management requests.
    Task,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Transfer => "transfer",
            SlotKind::DeviceManagement => "dev-mgmt",
            SlotKind::Task => "task",
        })
    }
}

struct PoolState {
    /// Free slots, relative to the pool base.
    free: u64,
    next_ticket: u64,
    serving: u64,
    closed: bool,
}

pub struct SlotPool {
    kind: SlotKind,
    base: usize,
    count: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SlotPool {
    /// Pool of `count` slots numbered `base..base + count` in the hardware list.
    pub fn new(kind: SlotKind, base: usize, count: usize) -> Arc<Self> {
        assert!(count > 0 && base + count <= 32, "slot pool exceeds list size");
        Arc::new(Self {
            kind,
            base,
            count,
            state: Mutex::new(PoolState {
                free: full_mask(count),
                next_ticket: 0,
                serving: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.base && index < self.base + self.count
    }

    /// Block until a slot is free and this caller is first in line.
    pub fn acquire(self: &Arc<Self>) -> UfsResult<SlotGuard> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(UfsError::Interrupted);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        loop {
            if state.closed {
                return Err(UfsError::Interrupted);
            }
            if state.serving == ticket && state.free != 0 {
                let bit = state.free.trailing_zeros() as usize;
                state.free &= !(1u64 << bit);
                state.serving += 1;
                // The next ticket may be able to proceed too.
                self.available.notify_all();
                return Ok(SlotGuard {
                    pool: Arc::clone(self),
                    index: self.base + bit,
                    armed: true,
                });
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a slot to the pool and wake waiters.
    pub fn release(&self, index: usize) {
        debug_assert!(self.contains(index), "slot {index} not in {} pool", self.kind);
        let bit = 1u64 << (index - self.base);
        let mut state = self.state.lock();
        debug_assert!(state.free & bit == 0, "slot {index} released twice");
        state.free |= bit;
        self.available.notify_all();
    }

    /// Fail all current and future `acquire` calls with [`UfsError::Interrupted`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    /// Slots currently handed out, as a bitmap of absolute list indices.
    pub fn in_use(&self) -> u32 {
        let state = self.state.lock();
        ((!state.free & full_mask(self.count)) << self.base) as u32
    }

    /// Callers queued behind an unavailable slot.
    pub fn waiters(&self) -> u64 {
        let state = self.state.lock();
        state.next_ticket - state.serving
    }
}

fn full_mask(count: usize) -> u64 {
    (1u64 << count) - 1
}

/// A slot owned by the caller. Dropping the guard returns the slot; once the command has been
/// handed to the controller the guard is disarmed and the completion path releases it.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    index: usize,
    armed: bool,
}

impl SlotGuard {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> SlotKind {
        self.pool.kind
    }

    pub(crate) fn disarm(mut self) -> usize {
        self.armed = false;
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.index);
        }
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("kind", &self.pool.kind)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, RecvTimeoutError};
    use std::{collections::HashSet, thread, time::Duration};

    #[test]
    fn indices_are_offset_by_base() {
        let pool = SlotPool::new(SlotKind::DeviceManagement, 31, 1);
        let slot = pool.acquire().unwrap();
        assert_eq!(slot.index(), 31);
        assert_eq!(pool.in_use(), 1 << 31);
        drop(slot);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn concurrent_callers_never_share_a_slot() {
        let pool = SlotPool::new(SlotKind::Transfer, 0, 8);
        let (tx, rx) = bounded(64);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let slot = pool.acquire().unwrap();
                        tx.send((slot.index(), true)).unwrap();
                        thread::yield_now();
                        tx.send((slot.index(), false)).unwrap();
                        drop(slot);
                    }
                })
            })
            .collect();
        drop(tx);
        // Events are sent while holding the slot, so no index may be seen held twice.
        let mut held = HashSet::new();
        let checker = thread::spawn(move || {
            for (index, acquired) in rx {
                if acquired {
                    assert!(held.insert(index), "slot {index} handed out twice");
                } else {
                    held.remove(&index);
                }
            }
        });
        for worker in workers {
            worker.join().unwrap();
        }
        checker.join().unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn extra_caller_blocks_until_release() {
        let pool = SlotPool::new(SlotKind::Transfer, 0, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let (tx, rx) = bounded(1);
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let slot = pool.acquire().unwrap();
                tx.send(slot.index()).unwrap();
            })
        };
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );
        let freed = b.index();
        drop(b);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), freed);
        waiter.join().unwrap();
        drop(a);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let pool = SlotPool::new(SlotKind::Task, 0, 1);
        let held = pool.acquire().unwrap();
        let (tx, rx) = bounded(4);
        let mut workers = Vec::new();
        for id in 0..3 {
            let waiter_pool = pool.clone();
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                let slot = waiter_pool.acquire().unwrap();
                tx.send(id).unwrap();
                drop(slot);
            }));
            // Make sure this caller has drawn its ticket before starting the next.
            while pool.waiters() < id as u64 + 1 {
                thread::yield_now();
            }
        }
        drop(held);
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn close_interrupts_blocked_waiter() {
        let pool = SlotPool::new(SlotKind::Transfer, 0, 1);
        let _held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|slot| slot.index()))
        };
        while pool.waiters() < 1 {
            thread::yield_now();
        }
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(UfsError::Interrupted)));
        assert!(matches!(pool.acquire(), Err(UfsError::Interrupted)));
    }
}
