// ============================================================================
// Lock Table
// ============================================================================
//
// Per-key exclusive locks on the primary owner with FIFO wait queues.
// Acquisition returns a future: completed when the lock is free or already
// held by the same transaction, pending when queued behind the current
// holder. Deadlock avoidance is the caller's job via the global lock order;
// the table is pure mechanism.
//
// ============================================================================

use crate::core::{fnv1a, GridError, Key, PartitionId, Result};
use crate::io::GridFuture;
use crate::tx::state::TxId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Position of a key in the global lock order. Transactions acquire their
/// locks sorted by this rank (ties broken by the key text), which rules out
/// circular wait between any two transactions.
pub fn lock_rank(partition: PartitionId, key: &str) -> (PartitionId, u64) {
    (partition, fnv1a(key.as_bytes()))
}

struct Waiter {
    tx: TxId,
    fut: GridFuture<()>,
}

struct LockQueue {
    owner: TxId,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Tables {
    queues: HashMap<(PartitionId, Key), LockQueue>,
    owned: HashMap<TxId, HashSet<(PartitionId, Key)>>,
}

#[derive(Default)]
pub struct LockTable {
    inner: Mutex<Tables>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the lock for a transaction. The returned future completes
    /// when the lock is held. Re-acquiring a held lock completes
    /// immediately; re-queuing while already waiting returns the same wait.
    pub fn acquire(&self, partition: PartitionId, key: &str, tx: TxId) -> GridFuture<()> {
        let mut inner = self.inner.lock();
        let slot = (partition, key.to_string());
        match inner.queues.get_mut(&slot) {
            None => {
                inner.queues.insert(
                    slot.clone(),
                    LockQueue {
                        owner: tx,
                        waiters: VecDeque::new(),
                    },
                );
                inner.owned.entry(tx).or_default().insert(slot);
                GridFuture::completed(())
            }
            Some(queue) => {
                if queue.owner == tx {
                    return GridFuture::completed(());
                }
                if let Some(w) = queue.waiters.iter().find(|w| w.tx == tx) {
                    return w.fut.clone();
                }
                let fut = GridFuture::new();
                queue.waiters.push_back(Waiter {
                    tx,
                    fut: fut.clone(),
                });
                fut
            }
        }
    }

    /// Releases one lock, promoting the first waiter if any. Promotion
    /// futures complete after the table lock is dropped.
    pub fn release(&self, partition: PartitionId, key: &str, tx: TxId) -> Result<()> {
        let promoted = {
            let mut inner = self.inner.lock();
            let slot = (partition, key.to_string());
            let queue = inner.queues.get_mut(&slot).ok_or_else(|| {
                GridError::Internal(format!("released lock '{}' is not held", key))
            })?;
            if queue.owner != tx {
                return Err(GridError::Internal(format!(
                    "lock '{}' released by non-owner {}",
                    key, tx
                )));
            }
            let promoted = queue.waiters.pop_front();
            match &promoted {
                Some(next) => {
                    queue.owner = next.tx;
                    let next_tx = next.tx;
                    inner.owned.entry(next_tx).or_default().insert(slot.clone());
                }
                None => {
                    inner.queues.remove(&slot);
                }
            }
            if let Some(owned) = inner.owned.get_mut(&tx) {
                owned.remove(&slot);
                if owned.is_empty() {
                    inner.owned.remove(&tx);
                }
            }
            promoted
        };
        if let Some(next) = promoted {
            next.fut.complete(());
        }
        Ok(())
    }

    /// Drops everything a transaction holds or waits for. Held locks are
    /// released with FIFO promotion; pending waits fail so abandoned
    /// acquirers observe the cancellation.
    pub fn release_all(&self, tx: TxId) {
        let (promoted, cancelled) = {
            let mut inner = self.inner.lock();
            let mut promoted = Vec::new();
            let mut cancelled = Vec::new();

            let slots: Vec<(PartitionId, Key)> = inner
                .owned
                .remove(&tx)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            for slot in slots {
                if let Some(queue) = inner.queues.get_mut(&slot) {
                    match queue.waiters.pop_front() {
                        Some(next) => {
                            queue.owner = next.tx;
                            let next_tx = next.tx;
                            inner
                                .owned
                                .entry(next_tx)
                                .or_default()
                                .insert(slot.clone());
                            promoted.push(next.fut);
                        }
                        None => {
                            inner.queues.remove(&slot);
                        }
                    }
                }
            }
            for queue in inner.queues.values_mut() {
                let mut kept = VecDeque::with_capacity(queue.waiters.len());
                for waiter in queue.waiters.drain(..) {
                    if waiter.tx == tx {
                        cancelled.push(waiter.fut);
                    } else {
                        kept.push_back(waiter);
                    }
                }
                queue.waiters = kept;
            }
            (promoted, cancelled)
        };
        for fut in promoted {
            fut.complete(());
        }
        for fut in cancelled {
            fut.fail(GridError::InvalidTransactionState(format!(
                "{} finished while waiting for a lock",
                tx
            )));
        }
    }

    /// Withdraws one pending wait after its deadline elapsed.
    pub fn cancel_wait(&self, partition: PartitionId, key: &str, tx: TxId) {
        let cancelled = {
            let mut inner = self.inner.lock();
            let slot = (partition, key.to_string());
            inner.queues.get_mut(&slot).and_then(|queue| {
                let at = queue.waiters.iter().position(|w| w.tx == tx)?;
                queue.waiters.remove(at)
            })
        };
        if let Some(waiter) = cancelled {
            waiter.fut.fail(GridError::LockTimeout {
                key: key.to_string(),
            });
        }
    }

    pub fn owner_of(&self, partition: PartitionId, key: &str) -> Option<TxId> {
        self.inner
            .lock()
            .queues
            .get(&(partition, key.to_string()))
            .map(|q| q.owner)
    }

    /// Whether the transaction currently holds every one of the given locks.
    /// The prepare step confirms this before voting.
    pub fn holds_all<'a>(
        &self,
        tx: TxId,
        mut slots: impl Iterator<Item = (PartitionId, &'a str)>,
    ) -> bool {
        let inner = self.inner.lock();
        let Some(owned) = inner.owned.get(&tx) else {
            return slots.next().is_none();
        };
        slots.all(|(p, k)| owned.contains(&(p, k.to_string())))
    }

    pub fn held_count(&self, tx: TxId) -> usize {
        self.inner
            .lock()
            .owned
            .get(&tx)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Locks held across all transactions on this node.
    pub fn held_total(&self) -> usize {
        self.inner.lock().owned.values().map(|s| s.len()).sum()
    }
}
