//! Multi-thread stress coverage: concurrent inserts/deletes across many
//! contending threads, checked against the invariants the library promises
//! rather than against a fixed interleaving.

use std::sync::atomic::{AtomicUsize, Ordering};

use hazard_sorted_list::{Cleanup, DeleteResult, InsertResult, OrderedList, Registry};
use rand::seq::SliceRandom;

const THREADS: usize = 10;
const KEYS_PER_THREAD: usize = 1000;

#[test]
fn ten_threads_insert_then_delete_their_own_keys() {
    static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    let registry = Registry::new();
    let list: OrderedList<'_, usize, usize> = OrderedList::new(&registry);

    std::thread::scope(|scope| {
        for thread_id in 0..THREADS {
            let list = &list;
            let registry = &registry;
            scope.spawn(move || {
                let record = registry.register_thread();
                let mut keys: Vec<usize> =
                    (0..KEYS_PER_THREAD).map(|i| thread_id * KEYS_PER_THREAD + i).collect();
                // Randomize insertion and, separately, deletion order so
                // the interleaving across threads isn't the same every
                // run.
                keys.shuffle(&mut rand::thread_rng());
                for &key in &keys {
                    let cleanup: Cleanup<usize, usize> = Box::new(|_k: &usize, _v: &usize| {
                        CLEANUPS.fetch_add(1, Ordering::SeqCst);
                    });
                    assert!(matches!(
                        list.insert(&record, key, key, Some(cleanup)),
                        InsertResult::Ok
                    ));
                }
                keys.shuffle(&mut rand::thread_rng());
                for &key in &keys {
                    assert!(matches!(
                        list.delete_by_key(&record, &key),
                        DeleteResult::Ok
                    ));
                }
            });
        }
    });

    assert!(list.keys(&registry.register_thread()).is_empty());
    // Every retired node is reclaimed at the latest when its owning
    // thread's record drains on drop, which already happened above (the
    // scope joined every thread before returning).
    assert_eq!(CLEANUPS.load(Ordering::SeqCst), THREADS * KEYS_PER_THREAD);
}

#[test]
fn concurrent_inserts_of_distinct_keys_leave_every_key_exactly_once() {
    let registry = Registry::new();
    let list: OrderedList<'_, usize, ()> = OrderedList::new(&registry);

    std::thread::scope(|scope| {
        for thread_id in 0..THREADS {
            let list = &list;
            let registry = &registry;
            scope.spawn(move || {
                let record = registry.register_thread();
                for i in 0..KEYS_PER_THREAD {
                    let key = thread_id * KEYS_PER_THREAD + i;
                    assert!(matches!(list.insert(&record, key, (), None), InsertResult::Ok));
                }
            });
        }
    });

    let record = registry.register_thread();
    let keys = list.keys(&record);
    assert_eq!(keys.len(), THREADS * KEYS_PER_THREAD);
    for window in keys.windows(2) {
        assert!(window[0] < window[1], "traversal must stay strictly ascending");
    }
}

#[test]
fn racing_insert_and_delete_on_a_shared_key_never_leaves_it_duplicated() {
    // Every thread repeatedly inserts then deletes the *same* key, racing
    // with every other thread doing the same thing. Regardless of who wins
    // each round, the key must never be observable twice, and the final
    // state (after everyone stops) must be consistent with some thread's
    // last action.
    const ROUNDS: usize = 200;

    let registry = Registry::new();
    let list: OrderedList<'_, &'static str, ()> = OrderedList::new(&registry);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let list = &list;
            let registry = &registry;
            scope.spawn(move || {
                let record = registry.register_thread();
                for _ in 0..ROUNDS {
                    let _ = list.insert(&record, "shared", (), None);
                    let keys = list.keys(&record);
                    assert!(keys.len() <= 1, "key must never appear more than once");
                    let _ = list.delete_by_key(&record, &"shared");
                }
            });
        }
    });

    let record = registry.register_thread();
    // Whatever state it ends in, at most one live "shared" entry exists.
    assert!(list.keys(&record).len() <= 1);
}
