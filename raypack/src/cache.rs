use foldhash::HashMap;
use parking_lot::RwLock;
use std::{hash::Hash, sync::Arc};

/// A map specialized to memoizing computed serialization data.
///
/// Readers never block each other, except when an entry is vacant. In that
/// case it gets written to once and then never again; entries are immutable
/// after insertion, and the first writer wins.
#[derive(Debug)]
pub(crate) struct OnceCache<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for OnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OnceCache<K, V> {
    /// Creates a new `OnceCache`.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash,
{
    /// Returns the value for the specified `key`, if it exists.
    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.read().get(key).cloned()
    }

    /// Returns the value for the specified `key`. The entry gets written to
    /// with the value returned by `f` if it doesn't exist.
    pub(crate) fn get_or_insert(&self, key: K, f: impl FnOnce() -> V) -> Arc<V> {
        if let Some(value) = self.get(&key) {
            return value;
        }

        let value = Arc::new(f());

        self.inner
            .write()
            .entry(key)
            .or_insert_with(|| value.clone())
            .clone()
    }

    /// Returns the value for the specified `key`. The entry gets written to
    /// with the key-value pair returned by `f` if it doesn't exist. If `f`
    /// returns [`Err`], the error is propagated and the entry isn't written
    /// to.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: &K,
        f: impl FnOnce() -> Result<(K, Arc<V>), E>,
    ) -> Result<Arc<V>, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let (key, value) = f()?;

        Ok(self
            .inner
            .write()
            .entry(key)
            .or_insert_with(|| value.clone())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let cache: OnceCache<u32, u32> = OnceCache::new();
        let first = cache.get_or_insert(1, || 10);
        let second = cache.get_or_insert(1, || 20);
        assert_eq!(*first, 10);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn failed_insert_leaves_entry_vacant() {
        let cache: OnceCache<u32, u32> = OnceCache::new();
        let result: Result<_, ()> = cache.get_or_try_insert(&1, || Err(()));
        assert!(result.is_err());
        assert!(cache.get(&1).is_none());
        let value = cache
            .get_or_try_insert::<()>(&1, || Ok((1, Arc::new(5))))
            .unwrap();
        assert_eq!(*value, 5);
    }
}
