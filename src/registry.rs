//! Lookup tables for the live connections of a proxy.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::address::Address;

/// Connections indexed by their remote address and, once composed, by the address of
/// their local TCP leg.
///
/// The registry holds the strong references of the connections it contains.  Connections
/// remove themselves when they stop.
#[derive(Debug)]
pub(crate) struct Registry<C> {
    inner: Mutex<Maps<C>>,
}

#[derive(Debug)]
struct Maps<C> {
    by_remote: HashMap<Address, Arc<C>>,
    by_local: HashMap<Address, Arc<C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Maps {
                by_remote: HashMap::new(),
                by_local: HashMap::new(),
            }),
        }
    }
}

impl<C> Registry<C> {
    pub(crate) fn insert_remote(&self, remote: Address, conn: Arc<C>) {
        self.inner
            .lock()
            .expect("poisoned")
            .by_remote
            .insert(remote, conn);
    }

    pub(crate) fn insert_local(&self, local: Address, conn: Arc<C>) {
        self.inner
            .lock()
            .expect("poisoned")
            .by_local
            .insert(local, conn);
    }

    pub(crate) fn get_remote(&self, remote: &Address) -> Option<Arc<C>> {
        self.inner
            .lock()
            .expect("poisoned")
            .by_remote
            .get(remote)
            .cloned()
    }

    pub(crate) fn get_local(&self, local: &Address) -> Option<Arc<C>> {
        self.inner
            .lock()
            .expect("poisoned")
            .by_local
            .get(local)
            .cloned()
    }

    /// Removes the entries pointing at `conn`.
    ///
    /// Entries which were already replaced by another connection are left alone.
    pub(crate) fn remove(&self, remote: &Address, local: Option<&Address>, conn: &C) {
        let mut maps = self.inner.lock().expect("poisoned");
        if maps
            .by_remote
            .get(remote)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn))
        {
            maps.by_remote.remove(remote);
        }
        if let Some(local) = local {
            if maps
                .by_local
                .get(local)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn))
            {
                maps.by_local.remove(local);
            }
        }
    }

    /// The number of started connections.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("poisoned").by_remote.len()
    }

    /// All started connections.
    pub(crate) fn all(&self) -> Vec<Arc<C>> {
        self.inner
            .lock()
            .expect("poisoned")
            .by_remote
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_only_own_entries() {
        let registry = Registry::<u8>::default();
        let remote: Address = "127.0.0.1:1".parse().unwrap();
        let local: Address = "127.0.0.1:2".parse().unwrap();
        let first = Arc::new(1u8);
        let second = Arc::new(2u8);

        registry.insert_remote(remote, first.clone());
        registry.insert_local(local, first.clone());
        registry.insert_remote(remote, second.clone());

        registry.remove(&remote, Some(&local), &first);
        assert_eq!(registry.get_remote(&remote).as_deref(), Some(&2));
        assert!(registry.get_local(&local).is_none());
        assert_eq!(registry.len(), 1);

        registry.remove(&remote, None, &second);
        assert_eq!(registry.len(), 0);
        assert!(registry.all().is_empty());
    }
}
