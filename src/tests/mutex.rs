/*
 * Mutex Tests: protocols, types, robustness, inheritance chains
 */

use super::{booted, prio, spawn, state, switch_to};
use crate::errno::Errno;
use crate::sched::kernel::Kernel;
use crate::sched::types::{Priority, Step, ThreadState};
use crate::sync::mutex::{MutexId, MutexProtocol, MutexType, Robustness};

fn create(
    k: &mut Kernel,
    protocol: MutexProtocol,
    robustness: Robustness,
    ceiling: u8,
) -> MutexId {
    k.mutex_create(
        "m",
        MutexType::Normal,
        protocol,
        robustness,
        Priority(ceiling),
    )
    .unwrap()
}

fn lock_now(k: &mut Kernel, m: MutexId) {
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => r.unwrap(),
        Step::Blocked => panic!("expected uncontended acquisition"),
    }
}

#[test]
fn test_priority_inheritance_boost_and_restore() {
    // Thread L (prio 5) owns an inherit mutex; thread H (prio 20)
    // contends. L runs at 20 until it unlocks, then drops back to 5 and
    // H owns the mutex.
    let mut k = booted();
    let low = spawn(&mut k, "L", 5);
    let high = spawn(&mut k, "H", 20);

    switch_to(&mut k, low);
    let m = create(&mut k, MutexProtocol::Inherit, Robustness::Stalled, 0);
    lock_now(&mut k, m);

    switch_to(&mut k, high);
    assert!(matches!(
        k.mutex_lock_step(m, None, false).unwrap(),
        Step::Blocked
    ));
    assert_eq!(prio(&k, low), Priority(20), "owner inherits waiter priority");
    assert_eq!(prio(&k, high), Priority(20));

    switch_to(&mut k, low);
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(prio(&k, low), Priority(5), "boost drops with the last mutex");
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(high));
    assert_eq!(state(&k, high), ThreadState::Ready);
    assert_eq!(k.take_wait_result(high), Ok(()));
}

#[test]
fn test_inheritance_propagates_through_chain() {
    // A owns m1; B owns m2 and waits on m1; C waits on m2. C's priority
    // must reach A through the chain.
    let mut k = booted();
    let a = spawn(&mut k, "A", 5);
    let b = spawn(&mut k, "B", 10);
    let c = spawn(&mut k, "C", 20);

    switch_to(&mut k, a);
    let m1 = create(&mut k, MutexProtocol::Inherit, Robustness::Stalled, 0);
    lock_now(&mut k, m1);

    switch_to(&mut k, b);
    let m2 = create(&mut k, MutexProtocol::Inherit, Robustness::Stalled, 0);
    lock_now(&mut k, m2);
    assert!(matches!(
        k.mutex_lock_step(m1, None, false).unwrap(),
        Step::Blocked
    ));
    assert_eq!(prio(&k, a), Priority(10));

    switch_to(&mut k, c);
    assert!(matches!(
        k.mutex_lock_step(m2, None, false).unwrap(),
        Step::Blocked
    ));
    assert_eq!(prio(&k, b), Priority(20), "B inherits C");
    assert_eq!(prio(&k, a), Priority(20), "A inherits through B");

    // Unwind: A releases m1 to B; B keeps C's boost through m2.
    switch_to(&mut k, a);
    k.mutex_unlock_step(m1).unwrap();
    assert_eq!(prio(&k, a), Priority(5));
    assert_eq!(prio(&k, b), Priority(20));

    switch_to(&mut k, b);
    k.mutex_unlock_step(m2).unwrap();
    assert_eq!(prio(&k, b), Priority(10));
    assert_eq!(k.mutexes.get(m2.0).unwrap().owner, Some(c));
}

#[test]
fn test_ceiling_violation_is_invalid() {
    // Base priority 30 against a ceiling of 20: the lock is refused.
    let mut k = booted();
    let t = spawn(&mut k, "A", 30);
    switch_to(&mut k, t);

    let m = create(&mut k, MutexProtocol::Protect, Robustness::Stalled, 20);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::EINVAL)),
        Step::Blocked => panic!("ceiling violation must fail fast"),
    }
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, None);
}

#[test]
fn test_ceiling_boost_on_acquisition() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 10);
    switch_to(&mut k, t);

    let m = create(&mut k, MutexProtocol::Protect, Robustness::Stalled, 50);
    lock_now(&mut k, m);
    assert_eq!(prio(&k, t), Priority(50), "raised to the ceiling immediately");

    k.mutex_unlock_step(m).unwrap();
    assert_eq!(prio(&k, t), Priority(10));
}

#[test]
fn test_robust_mutex_recovery_chain() {
    // X dies holding a robust mutex. Y locks: EOWNERDEAD with tentative
    // ownership. Y unlocks without consistent(): not recoverable for Z.
    let mut k = booted();
    let x = spawn(&mut k, "X", 10);
    let y = spawn(&mut k, "Y", 10);
    let z = spawn(&mut k, "Z", 10);

    switch_to(&mut k, x);
    let m = create(&mut k, MutexProtocol::None, Robustness::Robust, 0);
    lock_now(&mut k, m);
    k.thread_exit(0).unwrap();

    switch_to(&mut k, y);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::EOWNERDEAD)),
        Step::Blocked => panic!("dead-owner mutex must be granted tentatively"),
    }
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(y), "Y holds it");

    k.mutex_unlock_step(m).unwrap();

    switch_to(&mut k, z);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::ENOTRECOVERABLE)),
        Step::Blocked => panic!("poisoned mutex must fail fast"),
    }
}

#[test]
fn test_robust_mutex_consistent_repairs() {
    let mut k = booted();
    let x = spawn(&mut k, "X", 10);
    let y = spawn(&mut k, "Y", 10);
    let z = spawn(&mut k, "Z", 10);

    switch_to(&mut k, x);
    let m = create(&mut k, MutexProtocol::None, Robustness::Robust, 0);
    lock_now(&mut k, m);
    k.thread_exit(0).unwrap();

    switch_to(&mut k, y);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::EOWNERDEAD)),
        Step::Blocked => panic!("dead-owner mutex must be granted tentatively"),
    }
    k.mutex_consistent(m).unwrap();
    k.mutex_unlock_step(m).unwrap();

    switch_to(&mut k, z);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Ok(())),
        Step::Blocked => panic!("repaired mutex must lock cleanly"),
    }
}

#[test]
fn test_dead_owner_hands_off_to_waiter() {
    let mut k = booted();
    let x = spawn(&mut k, "X", 10);
    let w = spawn(&mut k, "W", 20);

    switch_to(&mut k, x);
    let m = create(&mut k, MutexProtocol::None, Robustness::Robust, 0);
    lock_now(&mut k, m);

    switch_to(&mut k, w);
    assert!(matches!(
        k.mutex_lock_step(m, None, false).unwrap(),
        Step::Blocked
    ));

    switch_to(&mut k, x);
    k.thread_exit(0).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(w));
    assert_eq!(state(&k, w), ThreadState::Ready);
    assert_eq!(k.take_wait_result(w), Err(Errno::EOWNERDEAD));
}

#[test]
fn test_errorcheck_self_relock_and_stranger_unlock() {
    let mut k = booted();
    let a = spawn(&mut k, "a", 10);
    let b = spawn(&mut k, "b", 10);

    switch_to(&mut k, a);
    let m = k
        .mutex_create(
            "ec",
            MutexType::Errorcheck,
            MutexProtocol::None,
            Robustness::Stalled,
            Priority::NONE,
        )
        .unwrap();
    lock_now(&mut k, m);
    match k.mutex_lock_step(m, None, false).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::EDEADLK)),
        Step::Blocked => panic!("errorcheck self-relock must not block"),
    }

    switch_to(&mut k, b);
    assert_eq!(k.mutex_unlock_step(m), Err(Errno::EPERM));
}

#[test]
fn test_recursive_lock_counts() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 10);
    switch_to(&mut k, t);

    let m = k
        .mutex_create(
            "rec",
            MutexType::Recursive,
            MutexProtocol::None,
            Robustness::Stalled,
            Priority::NONE,
        )
        .unwrap();
    lock_now(&mut k, m);
    lock_now(&mut k, m);
    lock_now(&mut k, m);
    assert_eq!(k.mutexes.get(m.0).unwrap().count, 3);

    k.mutex_unlock_step(m).unwrap();
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(t));
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, None);
    assert_eq!(k.mutexes.get(m.0).unwrap().count, 0);
}

#[test]
fn test_timed_lock_times_out() {
    let mut k = booted();
    let a = spawn(&mut k, "a", 10);
    let b = spawn(&mut k, "b", 10);

    switch_to(&mut k, a);
    let m = create(&mut k, MutexProtocol::None, Robustness::Stalled, 0);
    lock_now(&mut k, m);

    switch_to(&mut k, b);
    assert!(matches!(
        k.mutex_lock_step(m, Some(10), false).unwrap(),
        Step::Blocked
    ));
    for _ in 0..10 {
        k.tick();
    }
    assert_eq!(state(&k, b), ThreadState::Ready);
    assert_eq!(k.take_wait_result(b), Err(Errno::ETIMEDOUT));
    assert!(k.mutexes.get(m.0).unwrap().waiters.is_empty());
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(a));
}

#[test]
fn test_try_lock_never_suspends() {
    let mut k = booted();
    let a = spawn(&mut k, "a", 10);
    let b = spawn(&mut k, "b", 10);

    switch_to(&mut k, a);
    let m = create(&mut k, MutexProtocol::None, Robustness::Stalled, 0);
    lock_now(&mut k, m);

    switch_to(&mut k, b);
    match k.mutex_lock_step(m, None, true).unwrap() {
        Step::Ready(r) => assert_eq!(r, Err(Errno::EAGAIN)),
        Step::Blocked => panic!("try_lock must not block"),
    }
}

#[test]
fn test_priority_ordered_handoff() {
    // Under inherit, the highest-priority waiter gets the mutex first;
    // FIFO breaks ties.
    let mut k = booted();
    let owner = spawn(&mut k, "owner", 40);
    let w1 = spawn(&mut k, "w1", 10);
    let w2 = spawn(&mut k, "w2", 30);
    let w3 = spawn(&mut k, "w3", 30);

    switch_to(&mut k, owner);
    let m = create(&mut k, MutexProtocol::Inherit, Robustness::Stalled, 0);
    lock_now(&mut k, m);

    for w in [w1, w2, w3] {
        switch_to(&mut k, w);
        assert!(matches!(
            k.mutex_lock_step(m, None, false).unwrap(),
            Step::Blocked
        ));
    }

    switch_to(&mut k, owner);
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(w2), "priority first");

    switch_to(&mut k, w2);
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(w3), "FIFO among equals");

    switch_to(&mut k, w3);
    k.mutex_unlock_step(m).unwrap();
    assert_eq!(k.mutexes.get(m.0).unwrap().owner, Some(w1));
}
