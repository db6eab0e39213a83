use std::sync::Arc;

use crate::error::Error;
use crate::{Allocator, BufferOptions, HostAllocator, LruAllocator};

fn lru(capacity: Option<usize>) -> (LruAllocator, Arc<HostAllocator>) {
    let host = Arc::new(match capacity {
        Some(cap) => HostAllocator::with_capacity("TEST", cap),
        None => HostAllocator::new("TEST"),
    });
    (LruAllocator::new(Box::new(Arc::clone(&host))), host)
}

#[test]
fn test_zero_size_rejected() {
    let alloc = HostAllocator::new("TEST");
    assert!(matches!(alloc.alloc(0, &BufferOptions::default()), Err(Error::ZeroSizeAllocation { .. })));
}

#[test]
fn test_freed_handle_is_reused() {
    let (alloc, host) = lru(None);
    let opts = BufferOptions::default();
    let a = alloc.alloc(64, &opts).unwrap();
    let keep = a.clone();
    alloc.free(a, 64, &opts);
    assert_eq!(alloc.cached_bytes(), 64);

    let b = alloc.alloc(64, &opts).unwrap();
    assert_eq!(b, keep);
    assert_eq!(host.allocations(), 1);
    assert_eq!(alloc.cached_bytes(), 0);
}

#[test]
fn test_cache_keyed_by_size_and_options() {
    let (alloc, host) = lru(None);
    let plain = BufferOptions::default();
    let image = BufferOptions { image: true, ..Default::default() };
    let a = alloc.alloc(64, &plain).unwrap();
    alloc.free(a, 64, &plain);

    let _ = alloc.alloc(64, &image).unwrap();
    let _ = alloc.alloc(32, &plain).unwrap();
    assert_eq!(host.allocations(), 3);
    assert_eq!(alloc.cached_count(), 1);
}

#[test]
fn test_nolru_and_disabled_bypass_cache() {
    let (alloc, host) = lru(None);
    let nolru = BufferOptions { nolru: true, ..Default::default() };
    let a = alloc.alloc(16, &nolru).unwrap();
    alloc.free(a, 16, &nolru);
    assert_eq!(alloc.cached_count(), 0);

    alloc.set_enabled(false);
    let opts = BufferOptions::default();
    let b = alloc.alloc(16, &opts).unwrap();
    alloc.free(b, 16, &opts);
    assert_eq!(alloc.cached_count(), 0);
    assert_eq!(host.in_use(), 0);
}

#[test]
fn test_out_of_memory_evicts_and_retries() {
    let (alloc, host) = lru(Some(100));
    let opts = BufferOptions::default();
    let a = alloc.alloc(60, &opts).unwrap();
    alloc.free(a, 60, &opts);
    assert_eq!(alloc.cached_bytes(), 60);

    // 60 bytes are parked in the cache; 80 more only fit after eviction.
    let b = alloc.alloc(80, &opts).unwrap();
    assert_eq!(b.size(), 80);
    assert_eq!(alloc.cached_bytes(), 0);
    assert_eq!(host.in_use(), 80);
}

#[test]
fn test_out_of_memory_propagates_after_one_retry() {
    let (alloc, host) = lru(Some(100));
    let opts = BufferOptions::default();
    let _held = alloc.alloc(60, &opts).unwrap();
    assert!(matches!(alloc.alloc(80, &opts), Err(Error::OutOfMemory { size: 80, .. })));
}

#[test]
fn test_copy_roundtrip_through_offset_window() {
    let alloc = HostAllocator::new("TEST");
    let opts = BufferOptions::default();
    let raw = alloc.alloc(8, &opts).unwrap();
    alloc.copyin(&raw, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    let window = alloc.offset(&raw, 4, 2).unwrap();
    assert!(window.same_allocation(&raw));
    assert_ne!(window, raw);
    let mut out = [0u8; 4];
    alloc.copyout(&mut out, &window).unwrap();
    assert_eq!(out, [3, 4, 5, 6]);

    assert!(alloc.offset(&raw, 4, 6).is_err());
    assert!(matches!(alloc.copyin(&raw, &[0u8; 3]), Err(Error::SizeMismatch { expected: 8, actual: 3 })));
}

#[test]
fn test_pointer_is_stable_across_copies_and_handles() {
    let alloc = HostAllocator::new("TEST");
    let opts = BufferOptions::default();
    let raw = alloc.alloc(16, &opts).unwrap();
    let ptr = raw.as_ptr();

    alloc.copyin(&raw, &[7u8; 16]).unwrap();
    let window = alloc.offset(&raw, 8, 4).unwrap();
    let clone = raw.clone();
    assert_eq!(raw.as_ptr(), ptr);
    assert_eq!(clone.as_ptr(), ptr);
    assert_eq!(window.as_ptr(), ptr.wrapping_add(4));

    // the original handle can go; the window keeps the storage in place
    drop((raw, clone));
    // SAFETY: `window` keeps the allocation alive and nothing else touches it.
    unsafe { window.as_ptr().write(9) };
    let mut out = [0u8; 8];
    alloc.copyout(&mut out, &window).unwrap();
    assert_eq!(out, [9, 7, 7, 7, 7, 7, 7, 7]);
}
