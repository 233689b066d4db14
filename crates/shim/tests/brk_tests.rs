//! Integration tests for the heap break region.

mod common;

use std::sync::Arc;
use std::thread;

use common::{TestEnv, USER};
use graft_pal::{HostMemory, PalError, alloc_align_up, is_alloc_aligned};
use graft_shim::brk::{BRK_RANDOM_OFFSET_MAX, DEFAULT_BRK_MAX_SIZE};
use graft_shim::rlimit::{RLIM_INFINITY, Rlimit};
use graft_shim::syscall::{reset_brk_for_exec, sys_brk, sys_setrlimit};
use graft_shim::vma::{Bookkeeper, FixedMode, VmaFlags, VmaProt};
use graft_shim::{Brk, BrkReject, HeapRegion};
use linux_raw_sys::general::RLIMIT_DATA;

const HEAP: usize = 0x40_0000;

/// Check that the ledger and the platform agree with the region.
fn assert_consistent(env: &TestEnv, region: HeapRegion) {
    let committed_end = alloc_align_up(region.current);
    assert!(region.start <= region.current && region.current <= region.end);

    if committed_end > region.start {
        assert_eq!(env.host.committed_ranges(), vec![(region.start, committed_end)]);
    } else {
        assert!(env.host.committed_ranges().is_empty());
    }

    let mut expected_start = region.start;
    for vma in env
        .vmas
        .snapshot()
        .into_iter()
        .filter(|v| v.overlaps(region.start, region.end))
    {
        assert_eq!(vma.start, expected_start, "hole in heap window");
        assert_eq!(vma.comment, "heap");
        if vma.end <= committed_end {
            assert!(vma.is_mapped());
            assert_eq!(vma.prot, VmaProt::READ | VmaProt::WRITE);
        } else {
            assert!(vma.start >= committed_end);
            assert!(vma.flags.contains(VmaFlags::UNMAPPED));
        }
        expected_start = vma.end;
    }
    assert_eq!(expected_start, region.end);
}

#[test]
fn test_init_sets_data_rlimit() {
    let env = TestEnv::new();
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0x2345).unwrap();
    let region = brk.region();
    assert_eq!(region.max_size(), DEFAULT_BRK_MAX_SIZE);
    assert_eq!(
        env.ctx.rlimits.get_cur(RLIMIT_DATA),
        (DEFAULT_BRK_MAX_SIZE + 0x3000) as u64
    );
    assert_consistent(&env, region);
}

#[test]
fn test_syscall_scenario() {
    let env = TestEnv::with_max_size("0x4000");
    let brk = Brk::init(env.ctx.clone(), Some(0x1000), 0).unwrap();

    assert_eq!(sys_brk(&brk, 0x1000), Ok(0x1000));
    assert_eq!(sys_brk(&brk, 0x3500), Ok(0x3500));
    assert_consistent(&env, brk.region());
    assert_eq!(sys_brk(&brk, 0x1800), Ok(0x1800));
    assert_consistent(&env, brk.region());
    assert_eq!(sys_brk(&brk, 0x6000), Ok(0x1800));
    assert_eq!(sys_brk(&brk, 0), Ok(0x1800));
}

#[test]
fn test_out_of_window_requests_touch_nothing() {
    let env = TestEnv::with_max_size("0x10000");
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    brk.adjust(HEAP + 0x2000);

    let ledger = env.vmas.snapshot();
    let commits = env.host.commit_calls();
    let decommits = env.host.decommit_calls();

    for addr in [0, HEAP - 1, HEAP + 0x10001, usize::MAX] {
        assert_eq!(brk.adjust(addr), HEAP + 0x2000);
    }
    assert_eq!(brk.try_adjust(HEAP - 0x1000), Err(BrkReject::BelowWindow));
    assert_eq!(brk.try_adjust(usize::MAX), Err(BrkReject::AboveWindow));

    assert_eq!(env.vmas.snapshot(), ledger);
    assert_eq!(env.host.commit_calls(), commits);
    assert_eq!(env.host.decommit_calls(), decommits);
}

#[test]
fn test_grow_then_shrink_restores_state() {
    let env = TestEnv::with_max_size("0x10000");
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    let initial = env.vmas.snapshot();

    assert_eq!(brk.adjust(HEAP + 0x7123), HEAP + 0x7123);
    assert_eq!(env.host.committed_pages(), 8);
    assert_consistent(&env, brk.region());

    assert_eq!(brk.adjust(HEAP), HEAP);
    assert_eq!(env.host.committed_pages(), 0);
    assert_eq!(env.vmas.snapshot(), initial);
}

#[test]
fn test_repeated_request_is_idempotent() {
    let env = TestEnv::with_max_size("0x10000");
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    brk.adjust(HEAP + 0x1800);

    let ledger = env.vmas.snapshot();
    let calls = (env.host.commit_calls(), env.host.decommit_calls());
    for _ in 0..3 {
        assert_eq!(brk.adjust(HEAP + 0x1800), HEAP + 0x1800);
        assert_eq!(brk.adjust(brk.current()), HEAP + 0x1800);
    }
    assert_eq!(env.vmas.snapshot(), ledger);
    assert_eq!((env.host.commit_calls(), env.host.decommit_calls()), calls);
}

#[test]
fn test_setrlimit_caps_growth() {
    let env = TestEnv::with_max_size("0x10000");
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();

    assert_eq!(
        sys_setrlimit(&env.ctx.rlimits, RLIMIT_DATA, Rlimit::new(0x4000, RLIM_INFINITY)),
        Ok(0)
    );
    assert_eq!(brk.adjust(HEAP + 0x4000), HEAP + 0x4000);
    assert_eq!(brk.try_adjust(HEAP + 0x4001), Err(BrkReject::RlimitExceeded));
    assert_consistent(&env, brk.region());
    assert_eq!(brk.stats().rejections, 1);
}

#[test]
fn test_commit_failure_leaves_state_unchanged() {
    let env = TestEnv::builder()
        .max_size("0x10000")
        .host(HostMemory::with_page_limit(2))
        .build();
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();

    assert_eq!(brk.adjust(HEAP + 0x1000), HEAP + 0x1000);
    let before = brk.region();

    assert_eq!(
        brk.try_adjust(HEAP + 0x3000),
        Err(BrkReject::Commit(PalError::NoMemory))
    );
    assert_eq!(brk.region(), before);
    assert_consistent(&env, before);

    // Still room for one more page
    assert_eq!(brk.adjust(HEAP + 0x2000), HEAP + 0x2000);
    assert_consistent(&env, brk.region());
}

#[test]
fn test_bookkeeping_failure_rejects_growth() {
    let env = TestEnv::with_max_size("0x10000");
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();

    // Someone else is tearing down a mapping inside the window
    let token = env.vmas.munmap(HEAP + 0x3000, 0x1000, false).unwrap();
    assert!(matches!(
        brk.try_adjust(HEAP + 0x4000),
        Err(BrkReject::Bookkeeping(_))
    ));
    assert_eq!(brk.current(), HEAP);
    assert_eq!(env.host.commit_calls(), 0);

    env.vmas.remove_tmp_vma(token);
}

#[test]
fn test_concurrent_adjust_is_serialized() {
    let env = TestEnv::with_max_size("0x40000");
    let brk = Arc::new(Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap());

    let handles: Vec<_> = (0..8usize)
        .map(|t| {
            let brk = Arc::clone(&brk);
            thread::spawn(move || {
                for i in 0..200usize {
                    let offset = (t * 0x3717 + i * 0x1d3b) % 0x40000;
                    assert_eq!(brk.adjust(HEAP + offset), HEAP + offset);
                    let current = brk.current();
                    assert!((HEAP..=HEAP + 0x40000).contains(&current));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_consistent(&env, brk.region());
    let stats = brk.stats();
    assert_eq!(stats.rejections, 0);
    assert!(stats.peak_committed <= 0x40000);
}

#[test]
fn test_aslr_shifts_preferred_start() {
    let env = TestEnv::builder().aslr(0x00ab_cdef_1234_5678).build();
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    let start = brk.region().start;

    assert!(is_alloc_aligned(start));
    assert!(start >= HEAP && start < HEAP + BRK_RANDOM_OFFSET_MAX);
    assert!(USER.contains_range(start, DEFAULT_BRK_MAX_SIZE));
    assert_consistent(&env, brk.region());
}

#[test]
fn test_taken_start_falls_back_anywhere() {
    let env = TestEnv::new();
    env.vmas
        .mmap_fixed(HEAP, 0x1000, VmaProt::READ, VmaFlags::PRIVATE, FixedMode::NoReplace, "text")
        .unwrap();

    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    let region = brk.region();
    assert!(!(region.start..region.end).contains(&HEAP));
    assert!(USER.contains_range(region.start, region.max_size()));
    assert_eq!(env.vmas.find(HEAP).unwrap().comment, "text");
}

#[test]
fn test_reset_for_exec() {
    let env = TestEnv::with_max_size("0x10000");
    let mut slot = Some(Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap());
    if let Some(brk) = &slot {
        brk.adjust(HEAP + 0x5000);
    }

    reset_brk_for_exec(&mut slot);
    assert!(slot.is_none());
    assert_eq!(env.host.committed_pages(), 0);
    assert!(env.vmas.snapshot().is_empty());

    // The next image gets a fresh heap at the same spot
    let brk = Brk::init(env.ctx.clone(), Some(HEAP), 0).unwrap();
    assert_eq!(brk.current(), HEAP);
}
