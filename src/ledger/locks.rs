//! Per-account lock table.
//!
//! Every ledger operation holds the locks of all accounts it touches for the
//! whole unit of work. Locks are always taken in ascending account id order,
//! so two operations over the same pair of accounts cannot deadlock, and
//! operations over disjoint accounts never wait on each other.

use crate::models::AccountId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = HashMap<AccountId, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct AccountLocks {
    // parking_lot: held only while looking up a slot, never across an await
    table: Arc<Mutex<LockTable>>,
}

/// Holds one or more account locks until dropped.
pub struct AccountGuard {
    guards: Vec<(AccountId, OwnedMutexGuard<()>)>,
    table: Arc<Mutex<LockTable>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every account in `accounts` (duplicates allowed) in ascending id order.
    pub async fn lock(&self, accounts: &[AccountId]) -> AccountGuard {
        let mut ids = accounts.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let slot = self.slot(id);
            guards.push((id, slot.lock_owned().await));
        }

        AccountGuard {
            guards,
            table: self.table.clone(),
        }
    }

    fn slot(&self, id: AccountId) -> Arc<AsyncMutex<()>> {
        self.table.lock().entry(id).or_default().clone()
    }

    /// Number of accounts with a live lock slot.
    pub fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}

impl AccountGuard {
    pub fn accounts(&self) -> Vec<AccountId> {
        self.guards.iter().map(|(id, _)| *id).collect()
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        let released: Vec<AccountId> = self.guards.drain(..).map(|(id, _guard)| id).collect();
        // Slots nobody else holds or waits on can go; waiters keep their own Arc.
        let mut table = self.table.lock();
        for id in released {
            if table.get(&id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                table.remove(&id);
            }
        }
    }
}
