/*
 * Message Queue and Memory Pool Tests
 */

use super::{booted, spawn, state, switch_to};
use crate::errno::Errno;
use crate::sched::kernel::Kernel;
use crate::sched::types::{Step, ThreadState};
use crate::sync::mqueue::MqueueId;

fn recv_now(k: &mut Kernel, q: MqueueId, buf: &mut [u8]) -> (usize, u8) {
    match k
        .mqueue_receive_step(q, buf.as_mut_ptr(), buf.len(), None, false)
        .unwrap()
    {
        Step::Ready(r) => r.unwrap(),
        Step::Blocked => panic!("expected a pending message"),
    }
}

fn send_now(k: &mut Kernel, q: MqueueId, msg: &[u8], prio: u8) {
    match k
        .mqueue_send_step(q, msg.as_ptr(), msg.len(), prio, None, false)
        .unwrap()
    {
        Step::Ready(r) => r.unwrap(),
        Step::Blocked => panic!("expected a free slot"),
    }
}

// ================================================================================================
// MESSAGE QUEUE
// ================================================================================================

#[test]
fn test_mqueue_priority_ordering() {
    // Send (0,"a"), (1,"b"), (0,"c"), (2,"d"); receive "d","b","a","c":
    // highest priority first, FIFO within a priority.
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let q = k.mqueue_create("q", 4, 8).unwrap();
    send_now(&mut k, q, b"a", 0);
    send_now(&mut k, q, b"b", 1);
    send_now(&mut k, q, b"c", 0);
    send_now(&mut k, q, b"d", 2);

    let mut buf = [0u8; 8];
    let mut got = Vec::new();
    for _ in 0..4 {
        let (len, _prio) = recv_now(&mut k, q, &mut buf);
        got.push(buf[..len].to_vec());
    }
    assert_eq!(got, vec![b"d".to_vec(), b"b".to_vec(), b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_mqueue_used_plus_free_is_capacity() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let q = k.mqueue_create("q", 3, 4).unwrap();
    send_now(&mut k, q, b"x", 0);
    send_now(&mut k, q, b"y", 5);

    let cb = k.mqueues.get(q.0).unwrap();
    assert_eq!(cb.msgs.len(), 2);
    assert_eq!(cb.capacity - cb.msgs.len(), 1);
}

#[test]
fn test_mqueue_rejects_oversized_messages() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let q = k.mqueue_create("q", 2, 4).unwrap();
    let msg = [0u8; 5];
    assert_eq!(
        k.mqueue_send_step(q, msg.as_ptr(), msg.len(), 0, None, false)
            .unwrap_err(),
        Errno::EMSGSIZE
    );

    // A receive buffer smaller than the slot size cannot hold every
    // possible message either.
    let mut small = [0u8; 2];
    assert_eq!(
        k.mqueue_receive_step(q, small.as_mut_ptr(), small.len(), None, false)
            .unwrap_err(),
        Errno::EMSGSIZE
    );
}

#[test]
fn test_mqueue_send_to_waiting_receiver_copies_directly() {
    let mut k = booted();
    let rx = spawn(&mut k, "rx", 50);
    let tx = spawn(&mut k, "tx", 40);

    let q = k.mqueue_create("q", 2, 8).unwrap();

    let mut buf = [0u8; 8];
    switch_to(&mut k, rx);
    assert!(matches!(
        k.mqueue_receive_step(q, buf.as_mut_ptr(), buf.len(), None, false)
            .unwrap(),
        Step::Blocked
    ));

    switch_to(&mut k, tx);
    send_now(&mut k, q, b"ping", 3);

    assert_eq!(state(&k, rx), ThreadState::Ready);
    assert_eq!(k.threads.get(rx.0).unwrap().mq_len, 4);
    assert_eq!(k.threads.get(rx.0).unwrap().mq_prio, 3);
    assert_eq!(&buf[..4], b"ping");
    // Nothing was queued: the copy went straight to the receiver
    assert!(k.mqueues.get(q.0).unwrap().msgs.is_empty());
}

#[test]
fn test_mqueue_full_blocks_sender_until_receive_absorbs() {
    let mut k = booted();
    let tx = spawn(&mut k, "tx", 50);
    let rx = spawn(&mut k, "rx", 40);

    let q = k.mqueue_create("q", 1, 8).unwrap();

    switch_to(&mut k, tx);
    send_now(&mut k, q, b"one", 0);
    let pending = *b"two";
    assert!(matches!(
        k.mqueue_send_step(q, pending.as_ptr(), pending.len(), 7, None, false)
            .unwrap(),
        Step::Blocked
    ));
    assert_eq!(state(&k, tx), ThreadState::Waiting);

    // Receiving frees the slot and immediately absorbs the blocked
    // sender's message.
    switch_to(&mut k, rx);
    let mut buf = [0u8; 8];
    let (len, prio) = recv_now(&mut k, q, &mut buf);
    assert_eq!((&buf[..len], prio), (&b"one"[..], 0));
    assert_eq!(state(&k, tx), ThreadState::Ready);
    assert_eq!(k.take_wait_result(tx), Ok(()));

    let (len, prio) = recv_now(&mut k, q, &mut buf);
    assert_eq!((&buf[..len], prio), (&b"two"[..], 7));
}

#[test]
fn test_mqueue_flush_drops_and_releases_senders() {
    let mut k = booted();
    let tx = spawn(&mut k, "tx", 50);
    switch_to(&mut k, tx);

    let q = k.mqueue_create("q", 1, 8).unwrap();
    send_now(&mut k, q, b"old", 0);
    let pending = *b"new";
    assert!(matches!(
        k.mqueue_send_step(q, pending.as_ptr(), pending.len(), 0, None, false)
            .unwrap(),
        Step::Blocked
    ));

    let dropped = k.mqueue_flush_step(q).unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(state(&k, tx), ThreadState::Ready, "sender released into the space");
    assert_eq!(k.mqueues.get(q.0).unwrap().msgs.len(), 1);
}

#[test]
fn test_mqueue_try_forms_never_suspend() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let q = k.mqueue_create("q", 1, 8).unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(
        k.mqueue_receive_step(q, buf.as_mut_ptr(), buf.len(), None, true)
            .unwrap(),
        Step::Ready(Err(Errno::EAGAIN))
    ));
    send_now(&mut k, q, b"x", 0);
    assert!(matches!(
        k.mqueue_send_step(q, buf.as_ptr(), 1, 0, None, true).unwrap(),
        Step::Ready(Err(Errno::EAGAIN))
    ));
}

// ================================================================================================
// MEMORY POOL
// ================================================================================================

fn pool_region(blocks: usize, block_size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; blocks * block_size].into_boxed_slice())
}

#[test]
fn test_pool_alloc_and_free_cycle() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let region = pool_region(4, 32);
    let base = region.as_mut_ptr();
    let p = k.pool_create("p", base, 32, 4).unwrap();

    let mut blocks = Vec::new();
    for _ in 0..4 {
        match k.pool_alloc_step(p, None, false).unwrap() {
            Step::Ready(r) => blocks.push(r.unwrap()),
            Step::Blocked => panic!("pool should not be empty yet"),
        }
    }
    assert_eq!(k.pools.get(p.0).unwrap().free_count, 0);

    // Distinct, in-range, block-aligned pointers
    for (i, &b) in blocks.iter().enumerate() {
        let offset = b as usize - base as usize;
        assert_eq!(offset % 32, 0);
        assert!(offset < 4 * 32);
        for &other in &blocks[..i] {
            assert_ne!(b, other);
        }
    }

    // Exhausted: the try form reports busy
    assert!(matches!(
        k.pool_alloc_step(p, None, true).unwrap(),
        Step::Ready(Err(Errno::EAGAIN))
    ));

    for b in blocks {
        k.pool_free_step(p, b).unwrap();
    }
    assert_eq!(k.pools.get(p.0).unwrap().free_count, 4);
}

#[test]
fn test_pool_free_hands_block_to_waiter() {
    let mut k = booted();
    let holder = spawn(&mut k, "holder", 50);
    let waiter = spawn(&mut k, "waiter", 40);

    let region = pool_region(1, 16);
    let base = region.as_mut_ptr();
    let p = k.pool_create("p", base, 16, 1).unwrap();

    switch_to(&mut k, holder);
    let block = match k.pool_alloc_step(p, None, false).unwrap() {
        Step::Ready(r) => r.unwrap(),
        Step::Blocked => panic!("first block available"),
    };

    switch_to(&mut k, waiter);
    assert!(matches!(
        k.pool_alloc_step(p, None, false).unwrap(),
        Step::Blocked
    ));

    switch_to(&mut k, holder);
    k.pool_free_step(p, block).unwrap();
    assert_eq!(state(&k, waiter), ThreadState::Ready);
    assert_eq!(k.threads.get(waiter.0).unwrap().alloc_ptr, block);
    // Handed off directly; never returned to the free list
    assert_eq!(k.pools.get(p.0).unwrap().free_count, 0);
}

#[test]
fn test_pool_detects_double_free() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let region = pool_region(2, 32);
    let base = region.as_mut_ptr();
    let p = k.pool_create("p", base, 32, 2).unwrap();

    let block = match k.pool_alloc_step(p, None, false).unwrap() {
        Step::Ready(r) => r.unwrap(),
        Step::Blocked => panic!("block available"),
    };
    k.pool_free_step(p, block).unwrap();
    assert_eq!(k.pool_free_step(p, block), Err(Errno::EINVAL));
}

#[test]
fn test_pool_rejects_foreign_pointers() {
    let mut k = booted();
    let t = spawn(&mut k, "t", 50);
    switch_to(&mut k, t);

    let region = pool_region(2, 32);
    let base = region.as_mut_ptr();
    let p = k.pool_create("p", base, 32, 2).unwrap();

    // Misaligned interior pointer
    let inside = unsafe { base.add(5) };
    assert_eq!(k.pool_free_step(p, inside), Err(Errno::EINVAL));
    // Outside the pool entirely
    let outside = unsafe { base.add(1024) };
    assert_eq!(k.pool_free_step(p, outside), Err(Errno::EINVAL));
}

#[test]
fn test_pool_create_validates_geometry() {
    let mut k = booted();
    // Block too small to thread the free list through
    let region = pool_region(4, 2);
    assert_eq!(
        k.pool_create("p", region.as_mut_ptr(), 2, 4).unwrap_err(),
        Errno::EINVAL
    );
    assert_eq!(
        k.pool_create("p", core::ptr::null_mut(), 32, 4).unwrap_err(),
        Errno::EINVAL
    );
}
