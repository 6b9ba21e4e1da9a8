//! Per-interface mutual exclusion.
//!
//! The kernel's interface state is shared and the control protocol is not
//! atomic, so two controller operations against the same bridge or interface
//! name must serialize. [`NameLocks`] hands out one lock per name; managers
//! and the orchestrator share a table so the boundary holds across them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vif_wire::InterfaceName;

/// A table of per-interface-name locks.
#[derive(Debug, Default)]
pub struct NameLocks {
    inner: Mutex<HashMap<InterfaceName, Arc<Mutex<()>>>>,
}

impl NameLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the lock for an interface name.
    ///
    /// The caller holds the returned `Arc` and locks it for the duration of
    /// the operation sequence.
    pub fn acquire(&self, name: &InterfaceName) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(name.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_shares_a_lock() {
        let locks = NameLocks::new();
        let name = InterfaceName::new("bridge0").unwrap();
        let a = locks.acquire(&name);
        let b = locks.acquire(&name);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_different_names_do_not_contend() {
        let locks = NameLocks::new();
        let a = locks.acquire(&InterfaceName::new("bridge0").unwrap());
        let b = locks.acquire(&InterfaceName::new("bridge1").unwrap());
        assert!(!Arc::ptr_eq(&a, &b));

        let _ga = a.lock().unwrap();
        // Locking b must not block while a is held.
        let _gb = b.try_lock().unwrap();
    }
}
