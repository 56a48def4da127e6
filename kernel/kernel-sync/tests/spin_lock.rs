use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_unlocks_on_drop() {
    let lock = SpinLock::new(0_u32);

    {
        let mut guard = lock.lock();
        *guard = 41;
    }

    // The previous guard must have released the lock.
    let mut guard = lock.lock();
    *guard += 1;
    assert_eq!(*guard, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(());

    let held = lock.try_lock();
    assert!(held.is_some());
    assert!(lock.try_lock().is_none());

    drop(held);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let lock = SpinLock::new(vec![1_u64, 2]);
    let len = lock.with_lock(|v| {
        v.push(3);
        v.len()
    });
    assert_eq!(len, 3);
    assert_eq!(lock.with_lock(|v| v.clone()), vec![1, 2, 3]);
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = SpinLock::new(7_u64);
    *lock.get_mut() += 1;
    assert_eq!(*lock.lock(), 8);
}

#[test]
fn contended_increments_stay_exclusive() {
    let threads = 8;
    let iters = 4_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let in_critical = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_critical = Arc::clone(&in_critical);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|count| {
                        assert_eq!(
                            in_critical.fetch_add(1, Ordering::SeqCst),
                            0,
                            "mutual exclusion violated"
                        );
                        *count += 1;
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lock.with_lock(|count| *count), threads * iters);
}
