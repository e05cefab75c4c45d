mod lru_table {
    use std::collections::BTreeSet;
    use std::panic::UnwindSafe;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    use proptest::prelude::*;

    use crate::{Error, LruTable, Opened};

    static_assertions::assert_impl_all!(LruTable<String, String>: Send, Sync, UnwindSafe);
    static_assertions::assert_not_impl_any!(LruTable<Rc<String>, Rc<String>>: Send, Sync);
    static_assertions::assert_not_impl_any!(LruTable<String, *const String>: Send, Sync);

    struct R(&'static AtomicUsize);
    impl R {
        fn new(cnt: &'static AtomicUsize) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt)
        }
    }
    impl crate::Recency for R {
        fn last_access(&self) -> u64 {
            0
        }
    }
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    fn keys(table: &LruTable<u64, ()>) -> Vec<u64> {
        table.iter_lru().iter().map(|n| *n.key()).collect()
    }

    #[test]
    fn open_get_remove() {
        let table: LruTable<u64, ()> = LruTable::default();
        for k in 0..64 {
            assert!(matches!(table.open(k, || (), |_| false), Ok(Opened::Vacant(_))));
        }
        assert_eq!(table.len(), 64);
        for k in 0..64 {
            let Ok(Opened::Occupied(node, key)) = table.open(k, || (), |_| false) else {
                unreachable!();
            };
            assert_eq!((*node.key(), key), (k, k));
            assert_eq!(table.get(&k).map(|n| *n.key()), Some(k));
        }
        for k in 0..32 {
            assert!(table.remove(&k).is_some());
            assert!(table.remove(&k).is_none());
            assert!(table.get(&k).is_none());
        }
        assert_eq!(table.len(), 32);
        assert_eq!(table.iter_lru().len(), 32);
    }

    #[test]
    fn remove_node_is_generation_checked() {
        let table: LruTable<u64, ()> = LruTable::default();
        let Ok(Opened::Vacant(old)) = table.open(1, || (), |_| false) else {
            unreachable!();
        };
        assert!(table.remove_node(&old));
        assert!(table.open(1, || (), |_| false).is_ok());
        assert!(!table.remove_node(&old));
        assert!(!table.touch(&old));
        assert!(table.get(&1).is_some());
    }

    #[test]
    fn touch_and_trim() {
        let table: LruTable<u64, ()> = LruTable::default();
        for k in 0..4 {
            assert!(table.open(k, || (), |_| false).is_ok());
        }
        assert_eq!(keys(&table), vec![3, 2, 1, 0]);
        let node = table.get(&0).unwrap();
        assert!(table.touch(&node));
        assert_eq!(keys(&table), vec![0, 3, 2, 1]);

        let removed = table.trim(1, |_| true);
        assert_eq!(removed.iter().map(|n| *n.key()).collect::<Vec<_>>(), vec![1]);
        let removed = table.trim(8, |n| *n.key() != 3);
        assert_eq!(removed.iter().map(|n| *n.key()).collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(keys(&table), vec![3]);
    }

    #[test]
    fn unlinked_node_is_relinked_by_fix_lru() {
        let table: LruTable<u64, ()> = LruTable::default();
        for k in 0..4 {
            assert!(table.open(k, || (), |_| false).is_ok());
        }
        let node = table.get(&2).unwrap();
        assert!(table.unlink(&node));
        assert_eq!(keys(&table).len(), 3);
        assert_eq!(table.fix_lru(), 4);
        assert_eq!(keys(&table).len(), 4);
        assert_eq!(table.repairs(), 1);
    }

    #[test]
    fn capacity_bound() {
        let table: LruTable<u64, ()> = LruTable::with_max_capacity(4);
        for k in 0..16 {
            assert!(table.open(k, || (), |_| true).is_ok());
            assert!(table.len() <= 4);
        }
        assert_eq!(keys(&table), vec![15, 14, 13, 12]);
    }

    #[test]
    fn capacity_exhausted() {
        let table: LruTable<u64, ()> = LruTable::with_max_capacity(2);
        assert!(table.open(0, || (), |_| false).is_ok());
        assert!(table.open(1, || (), |_| false).is_ok());
        assert!(matches!(
            table.open(2, || (), |_| false),
            Err(Error::CapacityExhausted(2))
        ));
        assert!(table.get(&2).is_none());
        assert!(matches!(table.open(2, || (), |n| *n.key() == 1), Ok(Opened::Vacant(_))));
        assert_eq!(keys(&table), vec![2, 0]);
    }

    #[test]
    fn eviction_stops_at_lru_end() {
        let table: LruTable<u64, ()> = LruTable::with_max_capacity(4096);
        for k in 0..4096 {
            assert!(table.open(k, || (), |_| true).is_ok());
        }
        let mut visited = Vec::new();
        for k in 4096..4160 {
            visited.clear();
            let opened = table.open(
                k,
                || (),
                |n| {
                    visited.push(*n.key());
                    true
                },
            );
            assert!(matches!(opened, Ok(Opened::Vacant(_))));
            assert_eq!(visited, vec![k - 4096]);
        }
        assert_eq!(table.len(), 4096);

        let mut visited = 0;
        let removed = table.trim(2, |n| {
            visited += 1;
            *n.key() % 2 == 0
        });
        assert_eq!(removed.iter().map(|n| *n.key()).collect::<Vec<_>>(), vec![64, 66]);
        assert_eq!(visited, 3);
        assert_eq!(table.repairs(), 0);
    }

    #[test]
    fn corrupted_list_is_repaired_by_trim() {
        let table: LruTable<u64, ()> = LruTable::default();
        for k in 0..4 {
            assert!(table.open(k, || (), |_| false).is_ok());
        }
        let node = table.get(&1).unwrap();
        table.corrupt_lru(&node);
        let removed = table.trim(4, |_| true);
        assert_eq!(removed.len(), 4);
        assert!(table.is_empty());
        assert_eq!(table.repairs(), 1);
    }

    #[test]
    fn sweep_stops() {
        let table: LruTable<u64, ()> = LruTable::default();
        for k in 0..8 {
            assert!(table.open(k, || (), |_| false).is_ok());
        }
        let removed = table.sweep(|n| match *n.key() {
            k if k >= 4 => crate::Sweep::Stop,
            k if k % 2 == 0 => crate::Sweep::Evict,
            _ => crate::Sweep::Keep,
        });
        assert_eq!(removed.iter().map(|n| *n.key()).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(keys(&table), vec![7, 6, 5, 4, 3, 1]);
    }

    #[test]
    fn resize_and_pinch() {
        let table: LruTable<u64, ()> = LruTable::default();
        let initial = table.capacity();
        for k in 0..4096 {
            assert!(table.open(k, || (), |_| false).is_ok());
        }
        let grown = table.capacity();
        assert!(grown >= 4096 && grown > initial);
        assert!(!table.resize());
        assert!(!table.pinch());

        for k in 0..4080 {
            assert!(table.remove(&k).is_some());
        }
        assert!(table.pinch());
        assert!(table.capacity() < grown);
        for k in 4080..4096 {
            assert!(table.get(&k).is_some());
        }
        assert_eq!(keys(&table), (4080..4096).rev().collect::<Vec<_>>());
        assert!(table.open(0, || (), |_| false).is_ok());
        assert_eq!(table.len(), 17);
    }

    #[test]
    fn drop_payloads() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);
        let table: LruTable<u64, R> = LruTable::with_max_capacity(64);
        for k in 0..256 {
            assert!(table.open(k, || R::new(&INST_CNT), |_| true).is_ok());
        }
        assert_eq!(INST_CNT.load(Relaxed), 64);
        drop(table.clear());
        assert_eq!(INST_CNT.load(Relaxed), 0);

        for k in 0..256 {
            assert!(table.open(k, || R::new(&INST_CNT), |_| true).is_ok());
        }
        drop(table);
        assert_eq!(INST_CNT.load(Relaxed), 0);
    }

    proptest! {
        #[cfg_attr(miri, ignore)]
        #[test]
        fn uniqueness(ops in prop::collection::vec((0_u64..64, 0_u8..3), 0..512)) {
            let table: LruTable<u64, ()> = LruTable::with_max_capacity(32);
            let mut model = BTreeSet::new();
            for (k, op) in ops {
                match op {
                    0 => prop_assert!(table.open(k, || (), |_| true).is_ok()),
                    1 => {
                        drop(table.remove(&k));
                    }
                    _ => {
                        if let Some(node) = table.get(&k) {
                            prop_assert!(table.touch(&node));
                        }
                    }
                }
                prop_assert!(table.len() <= 32);
            }
            for node in table.iter_lru() {
                prop_assert!(model.insert(*node.key()));
            }
            prop_assert_eq!(model.len(), table.len());
            for k in 0..64 {
                prop_assert_eq!(table.get(&k).is_some(), model.contains(&k));
            }
        }

        #[cfg_attr(miri, ignore)]
        #[test]
        fn lru_order(touches in prop::collection::vec(0_u64..16, 1..256)) {
            let table: LruTable<u64, ()> = LruTable::default();
            let mut model: Vec<u64> = Vec::new();
            for k in touches {
                match table.open(k, || (), |_| false) {
                    Ok(Opened::Occupied(node, _)) => prop_assert!(table.touch(&node)),
                    Ok(Opened::Vacant(_)) => (),
                    Err(_) => unreachable!(),
                }
                model.retain(|m| *m != k);
                model.insert(0, k);
            }
            prop_assert_eq!(keys(&table), model.clone());
            let removed = table.trim(1, |_| true);
            prop_assert_eq!(removed.first().map(|n| *n.key()), model.last().copied());
        }
    }
}

mod loading_cache {
    use std::collections::BTreeSet;
    use std::hash::{Hash, Hasher};
    use std::io;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    use proptest::prelude::*;
    use tracing_subscriber::EnvFilter;

    use crate::{CacheConfig, DirtyEntry, Equivalent, Error, IdlePolicy, LoadingCache};
    use crate::{ManualClock, NullPolicy, Pressure};

    static_assertions::assert_impl_all!(LoadingCache<String, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(LoadingCache<Rc<String>, Rc<String>>: Send, Sync);
    static_assertions::assert_not_impl_any!(LoadingCache<String, *const String>: Send, Sync);
    static_assertions::assert_impl_all!(DirtyEntry<String, String>: Send, Sync);
    static_assertions::assert_impl_all!(Error: Send, Sync, Clone);

    struct R(&'static AtomicUsize);
    impl R {
        fn new(cnt: &'static AtomicUsize) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt)
        }
    }
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    #[derive(Debug, Eq, PartialEq)]
    struct EqTest(String, usize);

    impl Equivalent<EqTest> for str {
        fn equivalent(&self, key: &EqTest) -> bool {
            key.0.eq(self)
        }
    }

    impl Hash for EqTest {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.0.hash(state);
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn manual(config: CacheConfig) -> (LoadingCache<String, u64>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = LoadingCache::with_config(config).with_clock(clock.clone());
        (cache, clock)
    }

    fn ok(v: u64) -> impl FnOnce(&String) -> Result<u64, io::Error> {
        move |_: &String| Ok(v)
    }

    fn drained(cache: &LoadingCache<String, u64>) -> Vec<String> {
        let mut batch = cache.drain_dirty(usize::MAX, false);
        let keys = batch.by_ref().map(|e| e.key().clone()).collect();
        batch.rollback();
        keys
    }

    #[test]
    fn equivalent() {
        let cache: LoadingCache<EqTest, usize> = LoadingCache::default();
        assert!(cache.put_if_absent(EqTest("HELLO".to_owned(), 1), 1).is_ok());
        assert!(!cache.contains("NO"));
        assert!(cache.contains("HELLO"));
        assert_eq!(cache.get("HELLO").as_deref(), Some(&1));
    }

    #[test]
    fn capacity_two() {
        init_tracing();
        let cache: LoadingCache<String, u64> = LoadingCache::with_capacity(2);
        for (i, k) in ["a", "b", "c"].into_iter().enumerate() {
            assert!(cache.get_or_load(k.to_owned(), ok(i as u64), 0).is_ok());
        }
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some(&1));
        assert_eq!(cache.get("c").as_deref(), Some(&2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn load_once() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        let calls = AtomicUsize::new(0);
        for _ in 0..4 {
            let v = cache.get_or_load(
                "x".to_owned(),
                |_| {
                    calls.fetch_add(1, Relaxed);
                    Ok::<_, io::Error>(7)
                },
                0,
            );
            assert_eq!(*v.unwrap(), 7);
        }
        assert_eq!(calls.load(Relaxed), 1);
        let stats = cache.stats();
        assert_eq!((stats.loads, stats.misses, stats.hits), (1, 1, 3));
    }

    #[test]
    fn loader_error() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        let result = cache.get_or_load("x".to_owned(), |_| Err("boom"), 0);
        let Err(Error::Loader(e)) = result else {
            unreachable!();
        };
        assert_eq!(e.to_string(), "boom");
        assert!(cache.get("x").is_none());
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(1), 0).unwrap(), 1);
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[test]
    fn loader_panic() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        cache.set_max_load_concurrency(1);
        let result = catch_unwind(AssertUnwindSafe(|| {
            cache.get_or_load(
                "x".to_owned(),
                |_| -> Result<u64, io::Error> { panic!("loader panicked") },
                0,
            )
        }));
        assert!(result.is_err());
        assert!(cache.get("x").is_none());
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(3), 0).unwrap(), 3);
    }

    #[test]
    fn overload() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        cache.set_max_load_concurrency(1);
        let nested = cache.get_or_load(
            "outer".to_owned(),
            |_| match cache.get_or_load("inner".to_owned(), ok(1), 0) {
                Err(Error::Overload(1)) => Ok(2),
                _ => Err("nested load was not rejected"),
            },
            0,
        );
        assert_eq!(*nested.unwrap(), 2);
        assert!(!cache.contains("inner"));
        assert_eq!(cache.stats().overloads, 1);

        cache.set_max_load_concurrency(0);
        let nested = cache.get_or_load(
            "other".to_owned(),
            |_| cache.get_or_load("inner".to_owned(), ok(1), 0).map(|v| *v + 1),
            0,
        );
        assert_eq!(*nested.unwrap(), 2);
    }

    #[test]
    fn expiry() {
        let (cache, clock) = manual(CacheConfig::default());
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(1), 10).unwrap(), 1);
        clock.advance(9);
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(2), 10).unwrap(), 1);
        clock.advance(1);
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(3), 10).unwrap(), 3);
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(4), 0).unwrap(), 3);
    }

    #[test]
    fn dirty_never_expires() {
        let (cache, clock) = manual(CacheConfig::default());
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(1)).is_ok());
        clock.advance(100);
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(2), 10).unwrap(), 1);
    }

    #[test]
    fn null_policy() {
        let (cache, clock) = manual(CacheConfig::default());
        let none = |_: &String| Ok::<Option<u64>, io::Error>(None);
        assert!(cache.get_or_load_optional("x".to_owned(), none, 0).unwrap().is_none());
        clock.advance(100);
        let v = cache.get_or_load_optional("x".to_owned(), |_| Ok::<_, io::Error>(Some(1)), 0);
        assert!(v.unwrap().is_none());
        assert_eq!(*cache.get_or_load("x".to_owned(), ok(2), 0).unwrap(), 2);

        let (cache, clock) = manual(CacheConfig {
            null_policy: NullPolicy::Retry {
                null_timeout_secs: 5,
            },
            ..CacheConfig::default()
        });
        assert!(cache.get_or_load_optional("x".to_owned(), none, 0).unwrap().is_none());
        clock.advance(4);
        let v = cache.get_or_load_optional("x".to_owned(), |_| Ok::<_, io::Error>(Some(1)), 0);
        assert!(v.unwrap().is_none());
        clock.advance(1);
        let v = cache.get_or_load_optional("x".to_owned(), |_| Ok::<_, io::Error>(Some(1)), 0);
        assert_eq!(v.unwrap().as_deref(), Some(&1));
    }

    #[test]
    fn update_and_mark() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        let add = |_: &String, v: Option<&u64>| Ok::<_, io::Error>(v.map_or(1, |v| v + 1));
        assert_eq!(*cache.update("x".to_owned(), add).unwrap(), 1);
        assert_eq!(*cache.update("x".to_owned(), add).unwrap(), 2);
        assert_eq!(cache.dirty_len(), 1);

        let failed = cache.update("x".to_owned(), |_, _| Err("rejected"));
        assert!(matches!(failed, Err(Error::Updater(_))));
        assert_eq!(cache.get("x").as_deref(), Some(&2));

        assert!(!cache.mark_updated("y"));
        assert!(cache.get_or_load("y".to_owned(), ok(5), 0).is_ok());
        assert!(cache.mark_updated("y"));
        assert!(cache.mark_updated("y"));
        assert_eq!(cache.dirty_len(), 2);
        assert_eq!(drained(&cache), vec!["x".to_owned(), "y".to_owned()]);
    }

    #[test]
    fn debug_format() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(1)).is_ok());
        assert!(cache.put_if_absent("y".to_owned(), 2).is_ok());
        let formatted = format!("{cache:?}");
        assert!(formatted.contains("len: 2"));
        assert!(formatted.contains("dirty: 1"));
        assert_eq!(cache.dirty_len(), 1);
    }

    #[test]
    fn update_abort_keeps_dirty() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(1)).is_ok());
        let mut batch = cache.drain_dirty(10, false);
        assert_eq!(batch.next().map(|e| e.key().clone()), Some("x".to_owned()));
        assert_eq!(cache.dirty_len(), 0);
        assert_eq!(batch.abort(), 1);
        let mut batch = cache.drain_dirty(10, false);
        assert_eq!(batch.next().map(|e| e.key().clone()), Some("x".to_owned()));
        assert_eq!(batch.commit(), 1);
        assert_eq!(cache.dirty_len(), 0);
        assert_eq!(cache.trim(1), 1);
    }

    #[test]
    fn commit_partially_consumed() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        for k in ["a", "b", "c"] {
            assert!(cache.update(k.to_owned(), |_, _| Ok::<_, io::Error>(0)).is_ok());
        }
        let mut batch = cache.drain_dirty(2, false);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.next().map(|e| e.key().clone()), Some("a".to_owned()));
        assert_eq!(batch.commit(), 1);
        assert_eq!(drained(&cache), vec!["b".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn mutation_during_direct_batch() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(1)).is_ok());
        let mut batch = cache.drain_dirty(10, false);
        let entry = batch.next().unwrap();
        assert_eq!(**entry.value(), 1);
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(2)).is_ok());
        assert_eq!(cache.dirty_len(), 0);
        assert_eq!(batch.commit(), 0);
        let mut batch = cache.drain_dirty(10, false);
        assert_eq!(batch.next().map(|e| *e.into_value()), Some(2));
        assert_eq!(batch.commit(), 1);
    }

    #[test]
    fn copy_on_batch() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        for k in ["x", "y", "z"] {
            assert!(cache.update(k.to_owned(), |_, _| Ok::<_, io::Error>(0)).is_ok());
        }
        let mut batch = cache.drain_dirty(10, true);
        assert!(batch.is_copy_on());
        assert_eq!(cache.dirty_len(), 0);
        assert!(batch.next().is_some());
        assert_eq!(batch.rollback(), 3);
        assert_eq!(drained(&cache), vec!["x".to_owned(), "y".to_owned(), "z".to_owned()]);

        let mut batch = cache.drain_dirty(10, true);
        assert!(batch.next().is_some());
        assert_eq!(batch.consumed(), 1);
        assert_eq!(batch.abort(), 2);
        assert_eq!(drained(&cache), vec!["y".to_owned(), "z".to_owned()]);

        let mut batch = cache.drain_dirty(10, true);
        assert!(batch.next().is_some());
        assert!(cache.mark_updated("y"));
        assert_eq!(cache.dirty_len(), 1);
        assert_eq!(batch.by_ref().count(), 1);
        assert_eq!(batch.commit(), 1);
        assert_eq!(drained(&cache), vec!["y".to_owned()]);
    }

    #[test]
    fn dropped_batch() {
        init_tracing();
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        for k in ["x", "y"] {
            assert!(cache.update(k.to_owned(), |_, _| Ok::<_, io::Error>(0)).is_ok());
        }
        let mut batch = cache.drain_dirty(10, false);
        assert!(batch.next().is_some());
        drop(batch);
        assert_eq!(cache.dirty_len(), 2);

        let mut batch = cache.drain_dirty(10, true);
        assert!(batch.next().is_some());
        drop(batch);
        assert_eq!(drained(&cache), vec!["x".to_owned(), "y".to_owned()]);
    }

    #[test]
    fn dirty_protected() {
        let cache: LoadingCache<String, u64> = LoadingCache::with_capacity(2);
        for k in ["a", "b"] {
            assert!(cache.update(k.to_owned(), |_, _| Ok::<_, io::Error>(0)).is_ok());
        }
        assert!(matches!(
            cache.get_or_load("c".to_owned(), ok(1), 0),
            Err(Error::CapacityExhausted(2))
        ));
        assert_eq!(cache.trim(2), 0);
        cache.on_pressure(Pressure::Critical);
        assert_eq!(cache.len(), 2);

        let mut batch = cache.drain_dirty(1, false);
        assert!(batch.next().is_some());
        assert_eq!(batch.commit(), 1);
        assert_eq!(*cache.get_or_load("c".to_owned(), ok(1), 0).unwrap(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn invalidate_and_clear() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        assert!(cache.update("x".to_owned(), |_, _| Ok::<_, io::Error>(1)).is_ok());
        assert!(cache.put_if_absent("y".to_owned(), 2).is_ok());
        assert_eq!(cache.invalidate("x").as_deref(), Some(&1));
        assert!(cache.invalidate("x").is_none());
        assert_eq!(cache.dirty_len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(drained(&cache), vec!["x".to_owned()]);
    }

    #[test]
    fn put_if_absent() {
        let cache: LoadingCache<String, u64> = LoadingCache::default();
        assert_eq!(*cache.put_if_absent("x".to_owned(), 1).unwrap(), 1);
        assert_eq!(*cache.put_if_absent("x".to_owned(), 2).unwrap(), 1);
        assert!(cache.get_or_load_optional("y".to_owned(), |_| Ok::<_, io::Error>(None), 0).is_ok());
        assert_eq!(*cache.put_if_absent("y".to_owned(), 3).unwrap(), 3);

        let mut sum = 0_u64;
        cache.scan(|_, v| sum += *v);
        assert_eq!(sum, 4);
    }

    #[test]
    fn idle_remove() {
        let (cache, clock) = manual(CacheConfig {
            idle_policy: IdlePolicy::Remove,
            ..CacheConfig::default()
        });
        let held = cache.put_if_absent("a".to_owned(), 1).unwrap();
        assert!(cache.update("b".to_owned(), |_, _| Ok::<_, io::Error>(2)).is_ok());
        clock.advance(10);
        assert!(cache.put_if_absent("c".to_owned(), 3).is_ok());
        assert_eq!(cache.evict_idle(5), 1);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(*held, 1);
    }

    #[test]
    fn idle_detach() {
        let (cache, clock) = manual(CacheConfig {
            idle_policy: IdlePolicy::Detach,
            ..CacheConfig::default()
        });
        let held = cache.put_if_absent("a".to_owned(), 1).unwrap();
        assert!(cache.put_if_absent("b".to_owned(), 2).is_ok());
        clock.advance(10);
        assert_eq!(cache.idle_trim(5), 0);
        assert_eq!(cache.stats().detaches, 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(Arc::ptr_eq(&cache.get("a").unwrap(), &held));
        assert!(cache.get("b").is_none());
        assert_eq!(*cache.get_or_load("b".to_owned(), ok(4), 0).unwrap(), 4);
    }

    #[test]
    fn idle_unloaded() {
        let (cache, clock) = manual(CacheConfig {
            idle_policy: IdlePolicy::Remove,
            ..CacheConfig::default()
        });
        assert!(cache.get_or_load("x".to_owned(), |_| Err("unavailable"), 0).is_err());
        clock.advance(100);
        assert_eq!(cache.evict_idle(10), 1);
        assert!(cache.is_empty());

        let (cache, clock) = manual(CacheConfig::default());
        assert!(cache.get_or_load("x".to_owned(), |_| Err("unavailable"), 0).is_err());
        let held = cache.put_if_absent("y".to_owned(), 1).unwrap();
        clock.advance(10);
        assert_eq!(cache.idle_trim(5), 1);
        assert_eq!(cache.len(), 1);
        drop(held);
        assert!(cache.get("y").is_none());
        assert_eq!(cache.idle_trim(5), 1);
        assert!(cache.is_empty());

        let (cache, clock) = manual(CacheConfig {
            idle_policy: IdlePolicy::Detach,
            ..CacheConfig::default()
        });
        assert!(cache.get_or_load("x".to_owned(), |_| Err("unavailable"), 0).is_err());
        clock.advance(100);
        assert_eq!(cache.evict_idle(10), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn idle_reachability_aware() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);
        let clock = Arc::new(ManualClock::new(0));
        let cache: LoadingCache<u64, R> = LoadingCache::default().with_clock(clock.clone());
        let held = cache.put_if_absent(0, R::new(&INST_CNT)).unwrap();
        for k in 1..4 {
            assert!(cache.put_if_absent(k, R::new(&INST_CNT)).is_ok());
        }
        clock.advance(10);
        assert_eq!(cache.idle_trim(5), 3);
        assert_eq!(INST_CNT.load(Relaxed), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().detaches, 1);

        drop(held);
        assert_eq!(INST_CNT.load(Relaxed), 0);
        assert_eq!(cache.idle_trim(5), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn pressure() {
        let cache: LoadingCache<u64, u64> = LoadingCache::default();
        for k in 0..100 {
            assert!(cache.put_if_absent(k, k).is_ok());
        }
        cache.on_pressure(Pressure::Low);
        assert_eq!(cache.len(), 75);
        assert!(!cache.contains(&24));
        assert!(cache.contains(&25));
        cache.on_pressure(Pressure::Critical);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 100);
    }

    #[test]
    fn set_max_capacity() {
        let cache: LoadingCache<u64, u64> = LoadingCache::default();
        for k in 0..16 {
            assert!(cache.put_if_absent(k, k).is_ok());
        }
        assert!(cache.get(&0).is_some());
        cache.set_max_capacity(4);
        assert_eq!(cache.max_capacity(), 4);
        assert_eq!(cache.len(), 4);
        assert!(cache.contains(&0));
        assert!(cache.contains(&15));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn lru_repair() {
        init_tracing();
        let cache: LoadingCache<u64, u64> = LoadingCache::default();
        for k in 0..8 {
            assert!(cache.put_if_absent(k, k).is_ok());
        }
        let node = cache.table().get(&3).unwrap();
        cache.table().corrupt_lru(&node);
        assert_eq!(cache.trim(8), 8);
        assert_eq!(cache.stats().lru_repairs, 1);
    }

    #[test]
    fn drop_values() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);
        let cache: LoadingCache<u64, R> = LoadingCache::with_capacity(64);
        for k in 0..256 {
            assert!(cache.put_if_absent(k, R::new(&INST_CNT)).is_ok());
        }
        for k in 256..320 {
            assert!(cache.update(k, |_, _| Ok::<_, io::Error>(R::new(&INST_CNT))).is_ok());
        }
        assert!(INST_CNT.load(Relaxed) <= 64);
        let mut batch = cache.drain_dirty(16, true);
        assert!(batch.next().is_some());
        drop(cache.invalidate(&256));
        drop(batch);
        drop(cache);
        assert_eq!(INST_CNT.load(Relaxed), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_tokens() {
        use serde_test::{assert_tokens, Token};

        let config = CacheConfig {
            null_policy: NullPolicy::Retry {
                null_timeout_secs: 3,
            },
            ..CacheConfig::default()
        };
        assert_tokens(
            &config,
            &[
                Token::Struct {
                    name: "CacheConfig",
                    len: 7,
                },
                Token::Str("max_capacity"),
                Token::U64(256),
                Token::Str("initial_capacity"),
                Token::U64(0),
                Token::Str("load_factor"),
                Token::F64(0.75),
                Token::Str("pending_timeout_secs"),
                Token::U64(5),
                Token::Str("max_load_concurrency"),
                Token::U64(0),
                Token::Str("null_policy"),
                Token::StructVariant {
                    name: "NullPolicy",
                    variant: "Retry",
                    len: 1,
                },
                Token::Str("null_timeout_secs"),
                Token::U64(3),
                Token::StructVariantEnd,
                Token::Str("idle_policy"),
                Token::UnitVariant {
                    name: "IdlePolicy",
                    variant: "ReachabilityAware",
                },
                Token::StructEnd,
            ],
        );
    }

    proptest! {
        #[cfg_attr(miri, ignore)]
        #[test]
        fn uniqueness_and_capacity(ops in prop::collection::vec((0_u64..32, 0_u8..4), 0..256)) {
            let cache: LoadingCache<u64, u64> = LoadingCache::with_capacity(8);
            for (k, op) in ops {
                let result = match op {
                    0 => cache.get_or_load(k, |k| Ok::<_, io::Error>(*k), 0).map(drop),
                    1 => cache.put_if_absent(k, k).map(drop),
                    2 => {
                        drop(cache.invalidate(&k));
                        Ok(())
                    }
                    _ => cache.update(k, |k, _| Ok::<_, io::Error>(*k)).map(drop),
                };
                prop_assert!(matches!(result, Ok(()) | Err(Error::CapacityExhausted(8))));
                prop_assert!(cache.len() <= 8);
            }
            let mut keys = BTreeSet::new();
            let mut count = 0;
            cache.scan(|k, v| {
                assert_eq!(k, v);
                keys.insert(*k);
                count += 1;
            });
            prop_assert_eq!(keys.len(), count);
        }

        #[cfg_attr(miri, ignore)]
        #[test]
        fn dirty_conservation(
            ops in prop::collection::vec((0_u8..4, 0_u64..16, 0_usize..8, any::<bool>()), 0..128)
        ) {
            let cache: LoadingCache<u64, u64> = LoadingCache::default();
            let mut model = BTreeSet::new();
            for (op, k, n, copy_on) in ops {
                if op == 0 {
                    prop_assert!(cache.update(k, |_, _| Ok::<_, io::Error>(k)).is_ok());
                    model.insert(k);
                    continue;
                }
                let mut batch = cache.drain_dirty(k as usize, copy_on);
                prop_assert!(batch.len() <= model.len());
                let taken = batch.by_ref().take(n).map(|e| *e.key()).collect::<Vec<_>>();
                prop_assert_eq!(taken.iter().collect::<BTreeSet<_>>().len(), taken.len());
                for k in &taken {
                    prop_assert!(model.contains(k));
                }
                let written = match op {
                    1 => {
                        prop_assert_eq!(batch.commit(), taken.len());
                        true
                    }
                    2 => {
                        batch.abort();
                        copy_on
                    }
                    _ => {
                        batch.rollback();
                        false
                    }
                };
                if written {
                    for k in &taken {
                        model.remove(k);
                    }
                }
                prop_assert_eq!(cache.dirty_len(), model.len());
            }
            let mut batch = cache.drain_dirty(usize::MAX, false);
            let keys = batch.by_ref().map(|e| *e.key()).collect::<Vec<_>>();
            prop_assert_eq!(batch.commit(), model.len());
            prop_assert_eq!(keys.into_iter().collect::<BTreeSet<_>>(), model);
        }

        #[cfg_attr(miri, ignore)]
        #[test]
        fn lru_order(touches in prop::collection::vec(0_u64..16, 1..128)) {
            let cache: LoadingCache<u64, u64> = LoadingCache::default();
            let mut model: Vec<u64> = Vec::new();
            for k in touches {
                prop_assert!(cache.get_or_load(k, |k| Ok::<_, io::Error>(*k), 0).is_ok());
                model.retain(|m| *m != k);
                model.insert(0, k);
            }
            let keys = cache.table().iter_lru().iter().map(|n| *n.key()).collect::<Vec<_>>();
            prop_assert_eq!(&keys, &model);
            prop_assert_eq!(cache.trim(1), 1);
            prop_assert!(!cache.contains(model.last().unwrap()));
        }
    }
}
