//! The allocate/insert/commit and allocate/abort scenarios, live and after
//! crashes with different sets of pages flushed.

use pagelog_core::{Item, PageNo, PageType, PGNO_INVALID};
use pagelog_testkit::prelude::*;

/// Commits a transaction that allocates `count` pages and frees the
/// pages in `free`, leaving them on the free list.
fn with_pages(env: &TestEnv, count: usize, free: &[PageNo]) -> Vec<PageNo> {
    let mut txn = env.begin().unwrap();
    let pages: Vec<PageNo> = (0..count)
        .map(|_| env.allocate_page(&mut txn, PageType::Leaf).unwrap())
        .collect();
    for pgno in free {
        env.free_page(&mut txn, *pgno).unwrap();
    }
    env.commit(&mut txn).unwrap();
    pages
}

#[test]
fn scenario_a_commit_survives_crash_before_any_flush() {
    init_test_logging();
    let env = TestEnv::memory();
    let before = CrashImage::capture(env.memory_pages().unwrap());

    let mut txn = env.begin().unwrap();
    let p1 = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
    let insert = env.insert_item(&mut txn, p1, 0, &Item::Data(b"x".to_vec())).unwrap();
    env.commit(&mut txn).unwrap();

    let env = env.crash_with(before.into_store().unwrap()).unwrap();
    let page = env.read_page(p1).unwrap();
    assert_eq!(page.page_type(), PageType::Leaf);
    assert_eq!(page.item(0).unwrap(), Item::Data(b"x".to_vec()));
    assert_eq!(page.lsn(), insert);
    assert!(env.free_list().unwrap().is_empty());
    assert_eq!(env.read_page(0).unwrap().last_pgno(), p1);
}

#[test]
fn scenario_a_live() {
    let env = TestEnv::memory();
    let mut txn = env.begin().unwrap();
    let p1 = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
    let insert = env.insert_item(&mut txn, p1, 0, &Item::Data(b"x".to_vec())).unwrap();
    env.commit(&mut txn).unwrap();

    let page = env.read_page(p1).unwrap();
    assert_eq!(page.item(0).unwrap(), Item::Data(b"x".to_vec()));
    assert_eq!(page.lsn(), insert);
    assert!(env.free_list().unwrap().is_empty());
}

#[test]
fn scenario_b_live_abort_returns_page_as_head() {
    let env = TestEnv::memory();
    let pages = with_pages(&env, 2, &[2]);
    assert_eq!(env.free_list().unwrap(), vec![pages[1]]);

    let mut txn = env.begin().unwrap();
    let p2 = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
    assert_eq!(p2, 2);
    assert!(env.free_list().unwrap().is_empty());
    env.abort(&mut txn).unwrap();

    assert_eq!(env.free_list().unwrap(), vec![p2]);
    assert_eq!(env.read_page(p2).unwrap().page_type(), PageType::Free);
}

#[test]
fn scenario_b_crash_with_every_page_flushed() {
    init_test_logging();
    let env = TestEnv::memory();
    with_pages(&env, 2, &[2]);

    let mut txn = env.begin().unwrap();
    let p2 = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
    env.insert_item(&mut txn, p2, 0, &Item::Data(b"lost".to_vec())).unwrap();
    let flushed = CrashImage::capture(env.memory_pages().unwrap());

    let env = env.crash_with(flushed.into_store().unwrap()).unwrap();
    assert_eq!(env.recovery_report().forced_aborts, 1);
    assert_eq!(env.free_list().unwrap(), vec![p2]);
    assert_eq!(env.read_page(p2).unwrap().page_type(), PageType::Free);
}

#[test]
fn scenario_b_crash_with_only_the_page_flushed() {
    let env = TestEnv::memory();
    with_pages(&env, 2, &[2]);
    let before = CrashImage::capture(env.memory_pages().unwrap());

    let mut txn = env.begin().unwrap();
    let p2 = env.allocate_page(&mut txn, PageType::Leaf).unwrap();
    // The page reached disk, the metadata page did not.
    let image = before.overlay(env.memory_pages().unwrap(), &[p2]);

    let env = env.crash_with(image.into_store().unwrap()).unwrap();
    assert_eq!(env.free_list().unwrap(), vec![p2]);
    assert_eq!(env.read_page(0).unwrap().free_head(), p2);
}

#[test]
fn aborted_extension_goes_on_the_free_list() {
    let env = TestEnv::memory();
    let before = CrashImage::capture(env.memory_pages().unwrap());
    let mut txn = env.begin().unwrap();
    let pgno = env.allocate_page(&mut txn, PageType::Internal).unwrap();
    assert_eq!(pgno, 1);

    // Only the metadata page was flushed: undo restores it, and the page
    // past the old end is handed to the free list.
    let image = before.overlay(env.memory_pages().unwrap(), &[0]);
    let env = env.crash_with(image.into_store().unwrap()).unwrap();
    assert_eq!(env.free_list().unwrap(), vec![pgno]);
    assert_eq!(env.read_page(0).unwrap().last_pgno(), pgno);
    assert!(env.recovery_report().limbo_resolved >= 1);

    let mut txn = env.begin().unwrap();
    assert_eq!(env.allocate_page(&mut txn, PageType::Leaf).unwrap(), pgno);
    env.commit(&mut txn).unwrap();
}

#[test]
fn committed_free_stays_free_and_aborted_free_is_undone() {
    let env = TestEnv::memory();
    let pages = with_pages(&env, 3, &[]);

    let mut kept = env.begin().unwrap();
    env.free_page(&mut kept, pages[0]).unwrap();
    env.commit(&mut kept).unwrap();

    let mut loser = env.begin().unwrap();
    env.insert_item(&mut loser, pages[1], 0, &Item::Data(b"y".to_vec())).unwrap();
    env.free_page(&mut loser, pages[1]).unwrap();
    let flushed = CrashImage::capture(env.memory_pages().unwrap());

    let env = env.crash_with(flushed.into_store().unwrap()).unwrap();
    assert_eq!(env.free_list().unwrap(), vec![pages[0]]);
    let page = env.read_page(pages[1]).unwrap();
    assert_eq!(page.page_type(), PageType::Leaf);
    assert_eq!(page.entries(), 0);
    assert_eq!(page.next_pgno(), PGNO_INVALID);
}

#[test]
fn sibling_links_commit_and_roll_back() {
    let env = TestEnv::memory();
    let pages = with_pages(&env, 3, &[]);
    let (left, mid, right) = (pages[0], pages[1], pages[2]);

    let mut txn = env.begin().unwrap();
    env.link_page(&mut txn, mid, left, right).unwrap();
    env.commit(&mut txn).unwrap();
    let env = env.restart();
    assert_eq!(env.read_page(left).unwrap().next_pgno(), mid);
    assert_eq!(env.read_page(right).unwrap().prev_pgno(), mid);

    let mut loser = env.begin().unwrap();
    env.unlink_page(&mut loser, mid).unwrap();
    assert_eq!(env.read_page(left).unwrap().next_pgno(), right);
    assert_eq!(env.read_page(mid).unwrap().prev_pgno(), PGNO_INVALID);

    let image = CrashImage::capture(env.memory_pages().unwrap());
    let env = env.crash_with(image.into_store().unwrap()).unwrap();
    let restored = env.read_page(mid).unwrap();
    assert_eq!((restored.prev_pgno(), restored.next_pgno()), (left, right));
    assert_eq!(env.read_page(left).unwrap().next_pgno(), mid);
    assert_eq!(env.read_page(right).unwrap().prev_pgno(), mid);
}
