use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::SyncError;

/// Users with a run in flight. Different users never contend.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunLocks {
    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self, user_id: &str) -> Result<RunGuard, SyncError> {
        if !self.active().insert(user_id.to_string()) {
            return Err(SyncError::Busy(user_id.to_string()));
        }
        Ok(RunGuard {
            locks: self.clone(),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.active().contains(user_id)
    }
}

/// Holds a user's slot until dropped.
#[derive(Debug)]
pub struct RunGuard {
    locks: RunLocks,
    user_id: String,
}

impl RunGuard {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.locks.active().remove(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_for_same_user_is_busy() {
        let locks = RunLocks::default();
        let guard = locks.try_acquire("u1").expect("slot is free");
        assert!(matches!(locks.try_acquire("u1"), Err(SyncError::Busy(user)) if user == "u1"));
        assert!(locks.try_acquire("u2").is_ok());

        drop(guard);
        assert!(!locks.is_running("u1"));
        assert!(locks.try_acquire("u1").is_ok());
    }
}
