//! Shared/exclusive lock table with FIFO wait queues and wait-for-graph
//! deadlock detection.
//!
//! The lock manager uses the std mutex/condvar pair (condvars require it;
//! the rest of the crate keeps parking_lot for plain data locks). A
//! blocked `lock` call re-checks grantability every time its resource is
//! notified, refreshes its wait-for edges, and runs cycle detection
//! before sleeping. On a cycle, the youngest member (largest txn id) is
//! flagged as victim and woken; its lock call fails with
//! [`LockError::DeadlockVictim`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use log::{debug, warn};
use thiserror::Error;

use crate::common::types::{ResourceId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock request would block")]
    WouldBlock,
    #[error("Transaction {0} aborted as deadlock victim")]
    DeadlockVictim(TxnId),
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct ResourceQueue {
    sharing: HashSet<TxnId>,
    exclusive: Option<TxnId>,
    queue: VecDeque<LockRequest>,
    /// Set when this entry has been dropped from the table; late arrivals
    /// holding a stale Arc must re-resolve the resource.
    retired: bool,
}

impl ResourceQueue {
    fn is_free(&self) -> bool {
        self.sharing.is_empty() && self.exclusive.is_none() && self.queue.is_empty()
    }

    /// Transactions holding this resource in a mode that conflicts with
    /// the given request (the requester itself never conflicts).
    fn conflicting_holders(&self, txn_id: TxnId, mode: LockMode) -> Vec<TxnId> {
        let mut holders = Vec::new();
        match mode {
            LockMode::Shared => {
                if let Some(ex) = self.exclusive {
                    if ex != txn_id {
                        holders.push(ex);
                    }
                }
            }
            LockMode::Exclusive => {
                for &holder in &self.sharing {
                    if holder != txn_id {
                        holders.push(holder);
                    }
                }
                if let Some(ex) = self.exclusive {
                    if ex != txn_id {
                        holders.push(ex);
                    }
                }
            }
        }
        holders
    }

    fn holds(&self, txn_id: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.sharing.contains(&txn_id) || self.exclusive == Some(txn_id),
            LockMode::Exclusive => self.exclusive == Some(txn_id),
        }
    }

    fn compatible(&self, txn_id: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none() || self.exclusive == Some(txn_id),
            LockMode::Exclusive => {
                (self.exclusive.is_none() || self.exclusive == Some(txn_id))
                    && self.sharing.iter().all(|&t| t == txn_id)
            }
        }
    }
}

#[derive(Debug, Default)]
struct WaitState {
    queue: Mutex<ResourceQueue>,
    cvar: Condvar,
}

/// Per-resource lock table with deadlock detection.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<ResourceId, Arc<WaitState>>>,
    waits_for: Mutex<HashMap<TxnId, Vec<TxnId>>>,
    victims: Mutex<HashSet<TxnId>>,
    waiting_on: Mutex<HashMap<TxnId, Arc<WaitState>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock, blocking until granted or until deadlock
    /// resolution picks this transaction as the victim.
    pub fn lock(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        loop {
            let wait_state = {
                let mut table = self.table.lock().unwrap();
                table.entry(resource).or_default().clone()
            };

            let mut guard = wait_state.queue.lock().unwrap();
            if guard.retired {
                continue;
            }

            if guard.holds(txn_id, mode) {
                return Ok(());
            }

            guard.queue.push_back(LockRequest { txn_id, mode });

            loop {
                if self.victims.lock().unwrap().remove(&txn_id) {
                    guard.queue.retain(|r| r.txn_id != txn_id);
                    self.waits_for.lock().unwrap().remove(&txn_id);
                    self.waiting_on.lock().unwrap().remove(&txn_id);
                    wait_state.cvar.notify_all();
                    drop(guard);
                    self.maybe_retire(resource, &wait_state);
                    warn!("transaction {} aborted as deadlock victim", txn_id);
                    return Err(LockError::DeadlockVictim(txn_id));
                }

                if Self::try_acquire(&mut guard, txn_id, mode) {
                    self.waits_for.lock().unwrap().remove(&txn_id);
                    self.waiting_on.lock().unwrap().remove(&txn_id);
                    // The wait edge that made us a victim candidate is gone.
                    self.victims.lock().unwrap().remove(&txn_id);
                    // A grant can unblock a run of shared waiters behind us.
                    wait_state.cvar.notify_all();
                    return Ok(());
                }

                // Blocked: refresh wait-for edges and look for a cycle.
                let holders = guard.conflicting_holders(txn_id, mode);
                {
                    let mut wf = self.waits_for.lock().unwrap();
                    if holders.is_empty() {
                        wf.remove(&txn_id);
                    } else {
                        wf.insert(txn_id, holders);
                    }

                    if let Some(cycle) = find_cycle(&wf) {
                        let victim = *cycle.iter().max().expect("cycle is non-empty");
                        debug!(
                            "deadlock cycle {:?} detected, victim is {}",
                            cycle, victim
                        );
                        if victim == txn_id {
                            wf.remove(&txn_id);
                            drop(wf);
                            guard.queue.retain(|r| r.txn_id != txn_id);
                            self.waiting_on.lock().unwrap().remove(&txn_id);
                            wait_state.cvar.notify_all();
                            drop(guard);
                            self.maybe_retire(resource, &wait_state);
                            warn!("transaction {} aborted as deadlock victim", txn_id);
                            return Err(LockError::DeadlockVictim(txn_id));
                        }
                        self.victims.lock().unwrap().insert(victim);
                        let victim_state = self.waiting_on.lock().unwrap().get(&victim).cloned();
                        if let Some(vs) = victim_state {
                            vs.cvar.notify_all();
                        }
                    }
                }

                self.waiting_on
                    .lock()
                    .unwrap()
                    .insert(txn_id, wait_state.clone());
                // A bounded wait, not a pure block: a victim flag raised
                // between the check above and this sleep must still be
                // observed.
                let (g, _timeout) = wait_state
                    .cvar
                    .wait_timeout(guard, std::time::Duration::from_millis(50))
                    .unwrap();
                guard = g;
            }
        }
    }

    /// Non-blocking acquire: fails with `WouldBlock` instead of queueing.
    pub fn try_lock(
        &self,
        txn_id: TxnId,
        resource: ResourceId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let mut table = self.table.lock().unwrap();
        let wait_state = table.entry(resource).or_default().clone();
        let mut guard = wait_state.queue.lock().unwrap();

        if guard.holds(txn_id, mode) {
            return Ok(());
        }

        if guard.compatible(txn_id, mode) && guard.queue.is_empty() {
            match mode {
                LockMode::Shared => {
                    guard.sharing.insert(txn_id);
                }
                LockMode::Exclusive => {
                    guard.sharing.remove(&txn_id);
                    guard.exclusive = Some(txn_id);
                }
            }
            return Ok(());
        }

        // Leave no empty entry behind on failure.
        if guard.is_free() {
            guard.retired = true;
            drop(guard);
            table.remove(&resource);
        }
        Err(LockError::WouldBlock)
    }

    /// Release a single resource held by the transaction, promoting the
    /// next compatible waiters in FIFO order.
    pub fn unlock(&self, txn_id: TxnId, resource: ResourceId) {
        let wait_state = {
            let table = self.table.lock().unwrap();
            match table.get(&resource) {
                Some(ws) => ws.clone(),
                None => return,
            }
        };

        {
            let mut guard = wait_state.queue.lock().unwrap();
            guard.sharing.remove(&txn_id);
            if guard.exclusive == Some(txn_id) {
                guard.exclusive = None;
            }
        }

        wait_state.cvar.notify_all();
        self.maybe_retire(resource, &wait_state);
    }

    /// Release every lock and queued request of the transaction
    /// (end-of-transaction cleanup).
    pub fn unlock_all(&self, txn_id: TxnId) {
        self.victims.lock().unwrap().remove(&txn_id);
        self.waits_for.lock().unwrap().remove(&txn_id);
        self.waiting_on.lock().unwrap().remove(&txn_id);

        let entries: Vec<(ResourceId, Arc<WaitState>)> = {
            let table = self.table.lock().unwrap();
            table.iter().map(|(&r, ws)| (r, ws.clone())).collect()
        };

        for (resource, wait_state) in entries {
            let changed = {
                let mut guard = wait_state.queue.lock().unwrap();
                let mut changed = guard.sharing.remove(&txn_id);
                if guard.exclusive == Some(txn_id) {
                    guard.exclusive = None;
                    changed = true;
                }
                let before = guard.queue.len();
                guard.queue.retain(|r| r.txn_id != txn_id);
                changed || guard.queue.len() != before
            };

            if changed {
                wait_state.cvar.notify_all();
            }
            self.maybe_retire(resource, &wait_state);
        }
    }

    /// Whether the transaction currently holds the resource in the mode.
    pub fn holds(&self, txn_id: TxnId, resource: ResourceId, mode: LockMode) -> bool {
        let table = self.table.lock().unwrap();
        match table.get(&resource) {
            Some(ws) => ws.queue.lock().unwrap().holds(txn_id, mode),
            None => false,
        }
    }

    fn try_acquire(queue: &mut ResourceQueue, txn_id: TxnId, mode: LockMode) -> bool {
        if !queue.compatible(txn_id, mode) {
            return false;
        }

        let pos = match queue
            .queue
            .iter()
            .position(|r| r.txn_id == txn_id && r.mode == mode)
        {
            Some(pos) => pos,
            None => return false,
        };

        // FIFO: an exclusive request only proceeds from the head; a shared
        // request proceeds when everything ahead of it is also shared.
        let my_turn = match mode {
            LockMode::Exclusive => pos == 0,
            LockMode::Shared => queue.queue.iter().take(pos).all(|r| r.mode == LockMode::Shared),
        };
        if !my_turn {
            return false;
        }

        queue.queue.remove(pos);
        match mode {
            LockMode::Shared => {
                queue.sharing.insert(txn_id);
            }
            LockMode::Exclusive => {
                queue.sharing.remove(&txn_id);
                queue.exclusive = Some(txn_id);
            }
        }
        true
    }

    /// Drop the table entry once it has neither holders nor waiters.
    fn maybe_retire(&self, resource: ResourceId, wait_state: &Arc<WaitState>) {
        let mut table = self.table.lock().unwrap();
        if let Some(current) = table.get(&resource) {
            if Arc::ptr_eq(current, wait_state) {
                let mut guard = wait_state.queue.lock().unwrap();
                if guard.is_free() {
                    guard.retired = true;
                    drop(guard);
                    table.remove(&resource);
                }
            }
        }
    }
}

/// DFS over the wait-for graph; returns the members of the first cycle
/// found.
fn find_cycle(waits_for: &HashMap<TxnId, Vec<TxnId>>) -> Option<Vec<TxnId>> {
    fn dfs(
        node: TxnId,
        waits_for: &HashMap<TxnId, Vec<TxnId>>,
        visiting: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(pos) = visiting.iter().position(|&n| n == node) {
            return Some(visiting[pos..].to_vec());
        }
        if visited.contains(&node) {
            return None;
        }

        visiting.push(node);
        if let Some(successors) = waits_for.get(&node) {
            for &next in successors {
                if let Some(cycle) = dfs(next, waits_for, visiting, visited) {
                    return Some(cycle);
                }
            }
        }
        visiting.pop();
        visited.insert(node);
        None
    }

    let mut visited = HashSet::new();
    for &start in waits_for.keys() {
        let mut visiting = Vec::new();
        if let Some(cycle) = dfs(start, waits_for, &mut visiting, &mut visited) {
            return Some(cycle);
        }
    }
    None
}
