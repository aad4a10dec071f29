//! Overflow chains across restarts: reference counting down to release.

use pagelog_core::ops::overflow_chain;
use pagelog_core::{PageNo, PageType};
use pagelog_testkit::prelude::*;
use std::collections::HashSet;

fn value(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn adjust(env: &TestEnv, head: PageNo, delta: i32) -> u16 {
    let mut txn = env.begin().unwrap();
    let refs = env.adjust_overflow_refcount(&mut txn, head, delta).unwrap();
    env.commit(&mut txn).unwrap();
    refs
}

#[test]
fn refcount_counts_down_through_restarts() {
    init_test_logging();
    let data = value(1500);
    let env = TestEnv::memory();

    let mut txn = env.begin().unwrap();
    let head = env.put_overflow(&mut txn, &data).unwrap();
    assert_eq!(env.adjust_overflow_refcount(&mut txn, head, 1).unwrap(), 2);
    env.commit(&mut txn).unwrap();
    let chain = overflow_chain(env.pages().as_ref(), head).unwrap();
    assert!(chain.len() > 2);

    let env = env.restart();
    assert_eq!(env.read_overflow(head).unwrap(), data);
    assert_eq!(env.read_page(head).unwrap().entries(), 2);

    assert_eq!(adjust(&env, head, -1), 1);
    let env = env.restart();
    assert_eq!(env.read_page(head).unwrap().entries(), 1);
    assert_eq!(env.read_overflow(head).unwrap(), data);

    assert_eq!(adjust(&env, head, -1), 0);
    let env = env.restart();
    let free = env.free_list().unwrap();
    let unique: HashSet<PageNo> = free.iter().copied().collect();
    assert_eq!(unique.len(), free.len());
    assert_eq!(unique, chain.iter().copied().collect());
    for pgno in chain {
        assert_eq!(env.read_page(pgno).unwrap().page_type(), PageType::Free);
    }
}

#[test]
fn release_cut_off_by_crash_keeps_chain() {
    let data = value(900);
    let env = TestEnv::memory();
    let mut txn = env.begin().unwrap();
    let head = env.put_overflow(&mut txn, &data).unwrap();
    env.commit(&mut txn).unwrap();

    let mut loser = env.begin().unwrap();
    assert_eq!(env.adjust_overflow_refcount(&mut loser, head, -1).unwrap(), 0);
    assert!(!env.free_list().unwrap().is_empty());

    let image = CrashImage::capture(env.memory_pages().unwrap());
    let env = env.crash_with(image.into_store().unwrap()).unwrap();
    assert_eq!(env.recovery_report().forced_aborts, 1);
    assert!(env.free_list().unwrap().is_empty());
    assert_eq!(env.read_page(head).unwrap().entries(), 1);
    assert_eq!(env.read_overflow(head).unwrap(), data);
}

#[test]
fn reused_chain_pages_hold_new_value() {
    let env = TestEnv::memory();
    let first = value(1200);
    let mut txn = env.begin().unwrap();
    let head = env.put_overflow(&mut txn, &first).unwrap();
    env.adjust_overflow_refcount(&mut txn, head, -1).unwrap();
    let freed = env.free_list().unwrap().len();

    let second = vec![0xAB; 700];
    let head2 = env.put_overflow(&mut txn, &second).unwrap();
    env.commit(&mut txn).unwrap();
    assert!(env.free_list().unwrap().len() < freed);

    let env = env.restart();
    assert_eq!(env.read_overflow(head2).unwrap(), second);
}
