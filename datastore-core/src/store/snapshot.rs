/*
    snapshot.rs - Immutable committed store values

    A snapshot is replaced wholesale on every commit and never mutated in
    place. Versions are per store instance: 0 for the first load, then +1 for
    every value installed afterwards (commit, reload, reset).
*/

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Committed value of a store together with its version
pub struct Snapshot<T> {
    version: u64,
    inner: Arc<T>,
}

impl<T> Snapshot<T> {
    pub(crate) fn new(version: u64, value: T) -> Self {
        Snapshot {
            version,
            inner: Arc::new(value),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &T {
        &self.inner
    }

    /// Shared handle to the value, cheap to clone
    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Snapshot {
            version: self.version,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("value", &self.inner)
            .finish()
    }
}

impl<T: PartialEq> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.inner == other.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_value() {
        let snapshot = Snapshot::new(3, vec![1, 2, 3]);
        let copy = snapshot.clone();

        assert_eq!(copy.version(), 3);
        assert!(Arc::ptr_eq(&snapshot.shared(), &copy.shared()));
        assert_eq!(copy.len(), 3);
    }
}
