/*
 * Clock, Sleep and Software-Timer Tests
 */

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{booted, spawn, state, switch_to};
use crate::errno::Errno;
use crate::sched::types::{Step, ThreadState, WaitSite};
use crate::timer::TimerType;

fn run_ticks(k: &mut crate::sched::kernel::Kernel, n: u64) {
    for _ in 0..n {
        k.tick();
    }
}

#[test]
fn test_sleep_wakes_at_deadline() {
    let mut k = booted();
    let t = spawn(&mut k, "sleeper", 50);
    switch_to(&mut k, t);

    let deadline = k.deadline_in(10);
    k.sleep_current_until(deadline).unwrap();
    assert_eq!(state(&k, t), ThreadState::Waiting);

    run_ticks(&mut k, 9);
    assert_eq!(state(&k, t), ThreadState::Waiting);
    run_ticks(&mut k, 1);
    assert_eq!(state(&k, t), ThreadState::Ready);
    // A normal sleep expiry is a success, not a timeout
    assert_eq!(k.take_wait_result(t), Ok(()));
}

#[test]
fn test_sleepers_drain_in_deadline_order() {
    let mut k = booted();
    let early = spawn(&mut k, "early", 50);
    let late = spawn(&mut k, "late", 50);

    switch_to(&mut k, late);
    let d = k.deadline_in(20);
    k.sleep_current_until(d).unwrap();
    switch_to(&mut k, early);
    let d = k.deadline_in(5);
    k.sleep_current_until(d).unwrap();

    run_ticks(&mut k, 5);
    assert_eq!(state(&k, early), ThreadState::Ready);
    assert_eq!(state(&k, late), ThreadState::Waiting);
    run_ticks(&mut k, 15);
    assert_eq!(state(&k, late), ThreadState::Ready);
}

#[test]
fn test_timed_semaphore_wait_times_out() {
    // Semaphore at zero, a 100-tick wait and no post: ETIMEDOUT.
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let s = k.semaphore_create("s", 0, 10).unwrap();
    assert!(matches!(
        k.semaphore_wait_step(s, Some(100), false).unwrap(),
        Step::Blocked
    ));

    run_ticks(&mut k, 99);
    assert_eq!(state(&k, t), ThreadState::Waiting);
    run_ticks(&mut k, 1);
    assert_eq!(state(&k, t), ThreadState::Ready);
    assert_eq!(k.take_wait_result(t), Err(Errno::ETIMEDOUT));
    // The timeout removed the waiter node
    assert!(k.semaphores.get(s.0).unwrap().waiters.is_empty());
    assert_eq!(k.threads.get(t.0).unwrap().wait_site, WaitSite::None);
}

#[test]
fn test_tick_requests_round_robin_among_equals() {
    let mut k = booted();
    let a = spawn(&mut k, "a", 50);
    let _b = spawn(&mut k, "b", 50);
    switch_to(&mut k, a);

    assert!(k.tick(), "an equal-priority peer earns its turn at the tick");
    assert!(k.preempt_pending);
}

#[test]
fn test_one_shot_timer_fires_once() {
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    fn cb(arg: usize) {
        FIRED.fetch_add(arg, Ordering::SeqCst);
    }

    let mut k = booted();
    let id = k.timer_create("once", cb, 3, TimerType::OneShot, 5).unwrap();
    k.timer_start(id).unwrap();

    run_ticks(&mut k, 5);
    let (f, arg) = k.take_expired().expect("timer expired");
    f(arg);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    assert!(k.take_expired().is_none());
    assert!(!k.timers.get(id.0).unwrap().active);

    // No re-arm: another period passes silently
    run_ticks(&mut k, 5);
    assert!(k.take_expired().is_none());
}

#[test]
fn test_periodic_timer_rearms_without_drift() {
    fn cb(_arg: usize) {}

    let mut k = booted();
    let id = k.timer_create("tick", cb, 0, TimerType::Periodic, 3).unwrap();
    k.timer_start(id).unwrap();

    run_ticks(&mut k, 3);
    assert!(k.take_expired().is_some());
    // Re-armed relative to the previous deadline, not "now"
    assert_eq!(k.timers.get(id.0).unwrap().deadline, 6);

    run_ticks(&mut k, 3);
    assert!(k.take_expired().is_some());
    assert_eq!(k.timers.get(id.0).unwrap().deadline, 9);
}

#[test]
fn test_stop_suppresses_pending_callback() {
    fn cb(_arg: usize) {
        panic!("stopped timer must not run its callback");
    }

    let mut k = booted();
    let id = k.timer_create("stopped", cb, 0, TimerType::OneShot, 2).unwrap();
    k.timer_start(id).unwrap();

    run_ticks(&mut k, 2);
    // Expired and queued for the service thread, then stopped before
    // the callback could run: the expiry is dropped.
    k.timer_stop(id).unwrap();
    assert!(k.take_expired().is_none());
}

#[test]
fn test_timer_expiry_signals_service_thread() {
    fn cb(_arg: usize) {}

    let mut k = booted();
    let svc = spawn(&mut k, "timer-service", 50);
    k.timer_service = Some(svc);

    let id = k.timer_create("t", cb, 0, TimerType::OneShot, 4).unwrap();
    k.timer_start(id).unwrap();
    run_ticks(&mut k, 4);

    let pending = k.threads.get(svc.0).unwrap().sig_pending;
    assert_eq!(pending & crate::timer::SERVICE_SIGNAL, crate::timer::SERVICE_SIGNAL);
}

#[test]
fn test_timer_restart_rebases_deadline() {
    fn cb(_arg: usize) {}

    let mut k = booted();
    let id = k.timer_create("r", cb, 0, TimerType::OneShot, 10).unwrap();
    k.timer_start(id).unwrap();
    run_ticks(&mut k, 6);
    k.timer_start(id).unwrap();
    assert_eq!(k.timers.get(id.0).unwrap().deadline, 16);

    run_ticks(&mut k, 4);
    assert!(k.take_expired().is_none(), "original deadline must not fire");
    run_ticks(&mut k, 6);
    assert!(k.take_expired().is_some());
}

#[test]
fn test_zero_period_is_invalid() {
    fn cb(_arg: usize) {}
    let mut k = booted();
    assert_eq!(
        k.timer_create("z", cb, 0, TimerType::OneShot, 0).unwrap_err(),
        Errno::EINVAL
    );
}
