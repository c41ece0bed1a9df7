use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread;

use rand::Rng;

use dhp::Guard;

// all tests construct and destruct the process-wide SMR instance and must
// therefore run strictly one after another
static SMR_LOCK: Mutex<()> = Mutex::new(());

fn serialized() -> MutexGuard<'static, ()> {
    SMR_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

unsafe fn counting_delete(ptr: *mut (), extra: *mut ()) {
    drop(Box::from_raw(ptr as *mut u64));
    (*(extra as *const AtomicUsize)).fetch_add(1, Ordering::Relaxed);
}

fn retire_counted(value: u64, counter: &AtomicUsize) {
    let ptr = Box::into_raw(Box::new(value)) as *mut ();
    unsafe { dhp::retire(ptr, counting_delete, counter as *const AtomicUsize as *mut ()) };
}

#[test]
fn single_thread_cycle() {
    let _lock = serialized();

    let counter = AtomicUsize::new(0);

    dhp::construct(16);
    dhp::attach_thread();
    for i in 0..1000 {
        retire_counted(i, &counter);
    }
    dhp::detach_thread();
    unsafe { dhp::destruct(false) };

    // every retired pointer was freed exactly once
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
}

#[test]
fn protected_pointer_survives_until_released() {
    let _lock = serialized();

    dhp::construct(16);

    let counter = Arc::new(AtomicUsize::new(0));
    let target = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(7_u64))));

    let published = Arc::new(Barrier::new(2));
    let swept_once = Arc::new(Barrier::new(2));
    let released = Arc::new(Barrier::new(2));
    let swept_twice = Arc::new(Barrier::new(2));

    let reader = {
        let target = Arc::clone(&target);
        let published = Arc::clone(&published);
        let swept_once = Arc::clone(&swept_once);
        let released = Arc::clone(&released);
        let swept_twice = Arc::clone(&swept_twice);
        thread::spawn(move || {
            dhp::attach_thread();

            let guard = Guard::new();
            let ptr = guard.protect(&target);
            assert!(!ptr.is_null());
            published.wait();

            // the writer has retired the pointer and swept; the hazard must
            // have kept it alive
            swept_once.wait();
            assert_eq!(unsafe { *ptr }, 7);

            drop(guard);
            released.wait();

            swept_twice.wait();
            dhp::detach_thread();
        })
    };

    dhp::attach_thread();
    published.wait();

    let old = target.swap(ptr::null_mut(), Ordering::AcqRel);
    unsafe {
        dhp::retire(old as *mut (), counting_delete, Arc::as_ptr(&counter) as *mut ());
    }
    dhp::scan();
    assert_eq!(counter.load(Ordering::Relaxed), 0);
    swept_once.wait();

    released.wait();
    dhp::scan();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    swept_twice.wait();

    reader.join().unwrap();
    dhp::detach_thread();
    unsafe { dhp::destruct(false) };
}

#[test]
fn orphaned_retirees_are_adopted() {
    let _lock = serialized();

    dhp::construct(16);

    let counter = Arc::new(AtomicUsize::new(0));
    let hazarded = Box::into_raw(Box::new(1_u64)) as usize;

    // this thread's guard keeps one retiree alive across the detach below
    dhp::attach_thread();
    let guard = Guard::new();
    guard.protect_raw(hazarded as *mut ());

    {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
            dhp::attach_thread();
            unsafe {
                dhp::retire(
                    hazarded as *mut (),
                    counting_delete,
                    Arc::as_ptr(&counter) as *mut (),
                );
            }
            for i in 0..499 {
                retire_counted(i, &counter);
            }
            // detaching cannot reclaim the hazarded retiree; the record is
            // left behind with a null owner for someone else to adopt
            dhp::detach_thread();
        })
        .join()
        .unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 499);

    // dropping the hazard and detaching migrates the orphaned retiree into
    // this thread's record and frees it
    drop(guard);
    dhp::detach_thread();
    assert_eq!(counter.load(Ordering::Relaxed), 500);

    unsafe { dhp::destruct(false) };
}

#[test]
fn exit_without_detach_is_recovered() {
    let _lock = serialized();

    dhp::construct(16);

    let counter = Arc::new(AtomicUsize::new(0));

    {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
            dhp::attach_thread();
            for i in 0..500 {
                retire_counted(i, &counter);
            }
            // exits without detach_thread
        })
        .join()
        .unwrap();
    }

    // a detach by any other thread adopts the dead thread's leftovers if the
    // OS reports it gone; teardown recovers them in any case
    dhp::attach_thread();
    dhp::detach_thread();
    unsafe { dhp::destruct(true) };

    assert_eq!(counter.load(Ordering::Relaxed), 500);
}

#[test]
fn extend_under_pressure() {
    let _lock = serialized();

    const COUNT: usize = 300;

    dhp::construct(16);

    let counter = Arc::new(AtomicUsize::new(0));
    let addrs: Arc<Vec<usize>> =
        Arc::new((0..COUNT).map(|i| Box::into_raw(Box::new(i as u64)) as usize).collect());

    let protected = Arc::new(Barrier::new(2));
    let finished = Arc::new(Barrier::new(2));

    let holder = {
        let addrs = Arc::clone(&addrs);
        let protected = Arc::clone(&protected);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            dhp::attach_thread();

            // one guard per pointer; this also grows the hazard array well
            // past its initial capacity
            let guards: Vec<_> = addrs
                .iter()
                .map(|&addr| {
                    let guard = Guard::new();
                    guard.protect_raw(addr as *mut ());
                    guard
                })
                .collect();

            protected.wait();
            finished.wait();

            drop(guards);
            dhp::detach_thread();
        })
    };

    dhp::attach_thread();
    protected.wait();

    // retiring more than one block's worth of permanently hazarded pointers
    // must extend the retired array rather than free or overflow
    for &addr in addrs.iter() {
        unsafe {
            dhp::retire(addr as *mut (), counting_delete, Arc::as_ptr(&counter) as *mut ());
        }
    }
    dhp::scan();
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    finished.wait();
    holder.join().unwrap();

    // all hazards are gone now
    dhp::scan();
    assert_eq!(counter.load(Ordering::Relaxed), COUNT);

    dhp::detach_thread();
    unsafe { dhp::destruct(false) };
}

#[test]
fn destruct_detach_all_reclaims_everything() {
    let _lock = serialized();

    let counter = AtomicUsize::new(0);

    dhp::construct(16);
    dhp::attach_thread();
    for i in 0..100 {
        retire_counted(i, &counter);
    }
    // no detach: teardown winds the record down on our behalf
    unsafe { dhp::destruct(true) };

    assert_eq!(counter.load(Ordering::Relaxed), 100);
}

#[test]
fn concurrent_retire_stress() {
    let _lock = serialized();

    const THREADS: usize = 8;
    const STEPS: usize = 1000;

    dhp::construct(16);

    let freed = Arc::new(AtomicUsize::new(0));
    let shared = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(0_u64))));
    let allocated = Arc::new(AtomicUsize::new(1));

    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let freed = Arc::clone(&freed);
            let shared = Arc::clone(&shared);
            let allocated = Arc::clone(&allocated);
            thread::spawn(move || {
                dhp::attach_thread();
                let mut rng = rand::thread_rng();
                let guard = Guard::new();

                for step in 0..STEPS {
                    // read the current node under protection
                    let ptr = guard.protect(&shared);
                    if !ptr.is_null() {
                        let _ = unsafe { ptr.read_volatile() };
                    }
                    guard.clear();

                    // replace it and retire the displaced node
                    let new = Box::into_raw(Box::new((id * STEPS + step) as u64));
                    allocated.fetch_add(1, Ordering::Relaxed);
                    let old = shared.swap(new, Ordering::AcqRel);
                    if !old.is_null() {
                        unsafe {
                            dhp::retire(
                                old as *mut (),
                                counting_delete,
                                Arc::as_ptr(&freed) as *mut (),
                            );
                        }
                    }

                    if rng.gen_ratio(1, 64) {
                        dhp::scan();
                    }
                }

                drop(guard);
                dhp::detach_thread();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // retire the last node and adopt whatever the workers left behind
    dhp::attach_thread();
    let last = shared.swap(ptr::null_mut(), Ordering::AcqRel);
    unsafe {
        dhp::retire(last as *mut (), counting_delete, Arc::as_ptr(&freed) as *mut ());
    }
    dhp::detach_thread();

    assert_eq!(freed.load(Ordering::Relaxed), allocated.load(Ordering::Relaxed));
    unsafe { dhp::destruct(false) };
}
