//! Lock manager: point read/write locks, range locks, predicate locks,
//! FIFO wait queues, timeouts, and a single-step deadlock probe.
//!
//! One mutex guards the whole lock table. Waiters park on a oneshot
//! channel; a releasing transaction re-examines the wait queues and grants
//! (then notifies) every now-compatible waiter in FIFO order. Grants happen
//! under the mutex before notification, so a waiter whose timeout races
//! with the grant discovers the held lock when it re-takes the mutex.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use meteor_common::error::TxnError;
use meteor_common::types::TxnId;

/// Default deadline for a single lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a lock covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// A single key.
    Point(String),
    /// Every key in the inclusive lexicographic interval `[start, end]`.
    Range { start: String, end: String },
    /// A textual predicate; conflicts with the identical predicate string.
    Predicate(String),
}

impl LockScope {
    pub fn point(key: impl Into<String>) -> Self {
        LockScope::Point(key.into())
    }

    pub fn range(start: impl Into<String>, end: impl Into<String>) -> Self {
        LockScope::Range {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn predicate(p: impl Into<String>) -> Self {
        LockScope::Predicate(p.into())
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Point(k) => write!(f, "key {k}"),
            LockScope::Range { start, end } => write!(f, "range [{start}, {end}]"),
            LockScope::Predicate(p) => write!(f, "predicate {p}"),
        }
    }
}

/// Point locks come in shared (read) and exclusive (write) flavors; range
/// and predicate locks are always exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A granted lock.
#[derive(Debug, Clone)]
pub struct Lock {
    pub txn_id: TxnId,
    pub scope: LockScope,
    pub mode: LockMode,
    pub acquired_at: Instant,
}

struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    by_scope: HashMap<LockScope, Vec<Lock>>,
    by_txn: HashMap<TxnId, Vec<Lock>>,
    waiters: HashMap<LockScope, VecDeque<Waiter>>,
}

fn range_contains(start: &str, end: &str, key: &str) -> bool {
    key >= start && key <= end
}

fn ranges_overlap(s1: &str, e1: &str, s2: &str, e2: &str) -> bool {
    !(e1 < s2 || e2 < s1)
}

/// Whether a held lock blocks a request by a *different* transaction.
fn scopes_conflict(
    held: &LockScope,
    held_mode: LockMode,
    requested: &LockScope,
    requested_mode: LockMode,
) -> bool {
    match (held, requested) {
        (LockScope::Point(a), LockScope::Point(b)) => {
            a == b && !(held_mode == LockMode::Shared && requested_mode == LockMode::Shared)
        }
        // A range blocks any point lock inside it, and vice versa,
        // whatever the point lock's mode.
        (LockScope::Point(k), LockScope::Range { start, end })
        | (LockScope::Range { start, end }, LockScope::Point(k)) => range_contains(start, end, k),
        (
            LockScope::Range { start: s1, end: e1 },
            LockScope::Range { start: s2, end: e2 },
        ) => ranges_overlap(s1, e1, s2, e2),
        (LockScope::Predicate(a), LockScope::Predicate(b)) => a == b,
        _ => false,
    }
}

impl LockState {
    fn conflicting_holders(
        &self,
        txn_id: TxnId,
        scope: &LockScope,
        mode: LockMode,
    ) -> Vec<TxnId> {
        let mut holders = Vec::new();
        for locks in self.by_scope.values() {
            for lock in locks {
                if lock.txn_id == txn_id {
                    continue;
                }
                if scopes_conflict(&lock.scope, lock.mode, scope, mode)
                    && !holders.contains(&lock.txn_id)
                {
                    holders.push(lock.txn_id);
                }
            }
        }
        holders
    }

    fn grant(&mut self, txn_id: TxnId, scope: LockScope, mode: LockMode) {
        let lock = Lock {
            txn_id,
            scope: scope.clone(),
            mode,
            acquired_at: Instant::now(),
        };
        self.by_scope.entry(scope).or_default().push(lock.clone());
        self.by_txn.entry(txn_id).or_default().push(lock);
    }

    /// Single-step deadlock probe: would waiting here close a 2-cycle?
    /// A holder blocking us that is itself queued on a scope we hold means
    /// deadlock. Longer cycles are broken by the timeout.
    fn would_deadlock(&self, txn_id: TxnId, scope: &LockScope, mode: LockMode) -> bool {
        let holders = self.conflicting_holders(txn_id, scope, mode);
        let Some(my_locks) = self.by_txn.get(&txn_id) else {
            return false;
        };
        for holder in holders {
            for my_lock in my_locks {
                if let Some(queue) = self.waiters.get(&my_lock.scope) {
                    if queue.iter().any(|w| w.txn_id == holder) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Grant every now-compatible waiter, queue by queue, FIFO within each.
    /// Notification may fail when the waiter's timeout already fired; the
    /// granted lock is then reclaimed immediately.
    fn wake_waiters(&mut self) {
        let scopes: Vec<LockScope> = self.waiters.keys().cloned().collect();
        for scope in scopes {
            let Some(mut queue) = self.waiters.remove(&scope) else {
                continue;
            };
            let mut still_waiting = VecDeque::new();
            while let Some(waiter) = queue.pop_front() {
                if self
                    .conflicting_holders(waiter.txn_id, &scope, waiter.mode)
                    .is_empty()
                {
                    let txn_id = waiter.txn_id;
                    let mode = waiter.mode;
                    self.grant(txn_id, scope.clone(), mode);
                    if waiter.notify.send(()).is_err() {
                        // Receiver timed out between queue removal attempts.
                        self.remove_lock(txn_id, &scope, mode);
                    }
                } else {
                    still_waiting.push_back(waiter);
                }
            }
            if !still_waiting.is_empty() {
                self.waiters.insert(scope, still_waiting);
            }
        }
    }

    /// Remove one matching granted lock. Returns true if found.
    fn remove_lock(&mut self, txn_id: TxnId, scope: &LockScope, mode: LockMode) -> bool {
        let mut found = false;
        if let Some(locks) = self.by_scope.get_mut(scope) {
            if let Some(idx) = locks
                .iter()
                .position(|l| l.txn_id == txn_id && l.mode == mode)
            {
                locks.remove(idx);
                found = true;
            }
            if locks.is_empty() {
                self.by_scope.remove(scope);
            }
        }
        if found {
            if let Some(locks) = self.by_txn.get_mut(&txn_id) {
                if let Some(idx) = locks
                    .iter()
                    .position(|l| &l.scope == scope && l.mode == mode)
                {
                    locks.remove(idx);
                }
                if locks.is_empty() {
                    self.by_txn.remove(&txn_id);
                }
            }
        }
        found
    }

    fn holds(&self, txn_id: TxnId, scope: &LockScope, mode: LockMode) -> bool {
        self.by_scope
            .get(scope)
            .map(|locks| {
                locks
                    .iter()
                    .any(|l| l.txn_id == txn_id && l.mode == mode)
            })
            .unwrap_or(false)
    }

    fn remove_waiter(&mut self, txn_id: TxnId, scope: &LockScope) -> bool {
        let Some(queue) = self.waiters.get_mut(scope) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.txn_id != txn_id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.waiters.remove(scope);
        }
        removed
    }
}

/// Lock statistics for observability.
#[derive(Debug, Clone, Default)]
pub struct LockStats {
    pub locked_scopes: usize,
    pub holding_txns: usize,
    pub waiting_requests: usize,
}

/// The lock manager. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `scope` in `mode` for `txn_id`, waiting up to `timeout`.
    ///
    /// Grants immediately when compatible with all current holders (locks
    /// held by the same transaction are always compatible, supporting
    /// re-entry and upgrade). Otherwise the request either fails fast with
    /// `Deadlock` or parks in the scope's FIFO queue.
    pub async fn acquire(
        &self,
        txn_id: TxnId,
        scope: LockScope,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<(), TxnError> {
        let receiver = {
            let mut state = self.state.lock();
            if state.conflicting_holders(txn_id, &scope, mode).is_empty() {
                state.grant(txn_id, scope, mode);
                return Ok(());
            }
            if state.would_deadlock(txn_id, &scope, mode) {
                tracing::warn!(txn = %txn_id, %scope, "deadlock detected");
                return Err(TxnError::Deadlock(txn_id));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(scope.clone()).or_default().push_back(Waiter {
                txn_id,
                mode,
                notify: tx,
            });
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                // Timed out, or the sender vanished. Re-take the mutex: if
                // the waiter is gone and the lock is held, the grant won the
                // race and the acquisition succeeded after all.
                let mut state = self.state.lock();
                if state.remove_waiter(txn_id, &scope) {
                    tracing::warn!(txn = %txn_id, %scope, "lock acquisition timed out");
                    Err(TxnError::LockTimeout {
                        txn: txn_id,
                        scope: scope.to_string(),
                    })
                } else if state.holds(txn_id, &scope, mode) {
                    Ok(())
                } else {
                    Err(TxnError::LockTimeout {
                        txn: txn_id,
                        scope: scope.to_string(),
                    })
                }
            }
        }
    }

    /// Release one lock and wake any now-compatible waiters. Releasing a
    /// lock that is not held is a no-op.
    pub fn release(&self, txn_id: TxnId, scope: &LockScope, mode: LockMode) {
        let mut state = self.state.lock();
        if state.remove_lock(txn_id, scope, mode) {
            state.wake_waiters();
        }
    }

    /// Release every lock held by `txn_id`.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut state = self.state.lock();
        let Some(locks) = state.by_txn.remove(&txn_id) else {
            return;
        };
        for lock in &locks {
            if let Some(held) = state.by_scope.get_mut(&lock.scope) {
                held.retain(|l| l.txn_id != txn_id);
                if held.is_empty() {
                    state.by_scope.remove(&lock.scope);
                }
            }
        }
        state.wake_waiters();
    }

    /// Whether `txn_id` currently holds the given lock.
    pub fn holds(&self, txn_id: TxnId, scope: &LockScope, mode: LockMode) -> bool {
        self.state.lock().holds(txn_id, scope, mode)
    }

    /// Every lock currently held by `txn_id`.
    pub fn locks_of(&self, txn_id: TxnId) -> Vec<Lock> {
        self.state
            .lock()
            .by_txn
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> LockStats {
        let state = self.state.lock();
        LockStats {
            locked_scopes: state.by_scope.len(),
            holding_txns: state.by_txn.len(),
            waiting_requests: state.waiters.values().map(|q| q.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(2), LockScope::point("k"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        assert_eq!(lm.stats().locked_scopes, 1);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_and_times_out() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        let err = lm
            .acquire(TxnId(2), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_shared_then_exclusive_conflicts() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        let err = lm
            .acquire(TxnId(2), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_same_txn_reentry_and_upgrade() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        use std::sync::Arc;
        let lm = Arc::new(LockManager::new());
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();

        let lm2 = lm.clone();
        let waiter = tokio::spawn(async move {
            lm2.acquire(
                TxnId(2),
                LockScope::point("k"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        lm.release(TxnId(1), &LockScope::point("k"), LockMode::Exclusive);
        waiter.await.unwrap().unwrap();
        assert!(lm.holds(TxnId(2), &LockScope::point("k"), LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_release_all_wakes_waiters() {
        use std::sync::Arc;
        let lm = Arc::new(LockManager::new());
        lm.acquire(TxnId(1), LockScope::point("a"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(1), LockScope::point("b"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();

        let lm2 = lm.clone();
        let w1 = tokio::spawn(async move {
            lm2.acquire(
                TxnId(2),
                LockScope::point("a"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });
        let lm3 = lm.clone();
        let w2 = tokio::spawn(async move {
            lm3.acquire(
                TxnId(3),
                LockScope::point("b"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        lm.release_all(TxnId(1));
        w1.await.unwrap().unwrap();
        w2.await.unwrap().unwrap();
        assert!(lm.locks_of(TxnId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        use std::sync::Arc;
        let lm = Arc::new(LockManager::new());
        lm.acquire(TxnId(1), LockScope::point("k"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();

        let lm2 = lm.clone();
        let w2 = tokio::spawn(async move {
            lm2.acquire(
                TxnId(2),
                LockScope::point("k"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lm3 = lm.clone();
        let w3 = tokio::spawn(async move {
            lm3.acquire(
                TxnId(3),
                LockScope::point("k"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        lm.release(TxnId(1), &LockScope::point("k"), LockMode::Exclusive);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Txn 2 queued first, so it owns the lock; txn 3 still waits.
        assert!(lm.holds(TxnId(2), &LockScope::point("k"), LockMode::Exclusive));
        assert!(!lm.holds(TxnId(3), &LockScope::point("k"), LockMode::Exclusive));

        lm.release(TxnId(2), &LockScope::point("k"), LockMode::Exclusive);
        w2.await.unwrap().unwrap();
        w3.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_range_conflicts_with_point_inside() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("m"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        let err = lm
            .acquire(TxnId(2), LockScope::range("a", "z"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));

        // Disjoint point is fine.
        lm.acquire(TxnId(3), LockScope::range("n", "z"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_point_conflicts_with_covering_range() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::range("a", "f"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        let err = lm
            .acquire(TxnId(2), LockScope::point("c"), LockMode::Shared, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
        lm.acquire(TxnId(2), LockScope::point("q"), LockMode::Shared, SHORT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_range_range_true_overlap() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::range("b", "m"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        // Overlapping interval under a different composite key conflicts.
        let err = lm
            .acquire(TxnId(2), LockScope::range("k", "z"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
        // Touching at a single key is still overlap.
        let err = lm
            .acquire(TxnId(2), LockScope::range("m", "z"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
        // Disjoint is fine.
        lm.acquire(TxnId(2), LockScope::range("n", "z"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_predicate_equality_conflict() {
        let lm = LockManager::new();
        lm.acquire(
            TxnId(1),
            LockScope::predicate("$value > 5"),
            LockMode::Exclusive,
            SHORT,
        )
        .await
        .unwrap();
        let err = lm
            .acquire(
                TxnId(2),
                LockScope::predicate("$value > 5"),
                LockMode::Exclusive,
                SHORT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::LockTimeout { .. }));
        // Different predicate string: no conflict.
        lm.acquire(
            TxnId(2),
            LockScope::predicate("$value > 6"),
            LockMode::Exclusive,
            SHORT,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_two_cycle_deadlock_detected() {
        use std::sync::Arc;
        let lm = Arc::new(LockManager::new());
        // T1 holds a, T2 holds b.
        lm.acquire(TxnId(1), LockScope::point("a"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(2), LockScope::point("b"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();

        // T2 queues on a.
        let lm2 = lm.clone();
        let blocked = tokio::spawn(async move {
            lm2.acquire(
                TxnId(2),
                LockScope::point("a"),
                LockMode::Exclusive,
                Duration::from_secs(5),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // T1 requesting b closes the cycle: fail fast.
        let err = lm
            .acquire(TxnId(1), LockScope::point("b"), LockMode::Exclusive, SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::Deadlock(_)));

        // Breaking the cycle lets T2 through.
        lm.release_all(TxnId(1));
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stats() {
        let lm = LockManager::new();
        lm.acquire(TxnId(1), LockScope::point("a"), LockMode::Shared, SHORT)
            .await
            .unwrap();
        lm.acquire(TxnId(2), LockScope::point("b"), LockMode::Exclusive, SHORT)
            .await
            .unwrap();
        let stats = lm.stats();
        assert_eq!(stats.locked_scopes, 2);
        assert_eq!(stats.holding_txns, 2);
        assert_eq!(stats.waiting_requests, 0);
    }
}
