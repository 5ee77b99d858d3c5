use std::{collections::HashMap, sync::Arc};

use ctxsync_common::token::Token;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per workspace, held around every read-modify-write of
/// that workspace's cache entry.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceLocks {
    locks: Arc<std::sync::Mutex<HashMap<Token, Arc<Mutex<()>>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `workspace`; released when the guard drops.
    pub async fn acquire(&self, workspace: &Token) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(workspace.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops entries nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkspaceLocks;
    use ctxsync_common::token::Token;
    use std::time::Duration;

    #[tokio::test]
    async fn same_workspace_is_serialized() {
        let locks = WorkspaceLocks::new();
        let workspace = Token::generate();

        let guard = locks.acquire(&workspace).await;
        let contender = {
            let locks = locks.clone();
            let workspace = workspace.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&workspace).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second acquire must wait");

        drop(guard);
        contender.await.expect("contender should finish once released");
    }

    #[tokio::test]
    async fn different_workspaces_do_not_block() {
        let locks = WorkspaceLocks::new();
        let _first = locks.acquire(&Token::generate()).await;
        let _second = locks.acquire(&Token::generate()).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = WorkspaceLocks::new();
        let held = locks.acquire(&Token::generate()).await;
        drop(locks.acquire(&Token::generate()).await);

        assert_eq!(locks.prune_idle(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune_idle(), 1);
    }
}
