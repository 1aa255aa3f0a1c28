//! End-to-end entry-point checks with the default configuration (shared
//! site arenas, no profiling). Needs Linux NUMA syscalls and sysfs; bails
//! out early on machines without them.

#[test]
fn routed_allocations_work_end_to_end() {
    if let Err(e) = tieralloc::init() {
        eprintln!("skipping: init failed: {e}");
        return;
    }

    unsafe {
        // Site 0 bypasses routing but must still allocate.
        let untagged = tieralloc::alloc(0, 64);
        assert!(!untagged.is_null());
        tieralloc::free(untagged);

        // A routed site gets memory out of its own arena.
        let size = 8 << 20;
        let p = tieralloc::alloc(7, size);
        assert!(!p.is_null());
        for off in (0..size).step_by(4096) {
            p.add(off).write(0x5a);
        }

        // Another site, another arena; both must coexist.
        let q = tieralloc::calloc(9, 1024, 8);
        assert!(!q.is_null());
        assert_eq!(q.read(), 0);

        // realloc conventions: null grows, zero frees.
        let r = tieralloc::realloc(7, std::ptr::null_mut(), 4096);
        assert!(!r.is_null());
        let r = tieralloc::realloc(7, r, 64 << 10);
        assert!(!r.is_null());
        assert!(tieralloc::realloc(7, r, 0).is_null());

        let mut aligned = std::ptr::null_mut();
        assert_eq!(tieralloc::posix_memalign(7, &mut aligned, 1 << 16, 4096), 0);
        assert!(!aligned.is_null());
        assert_eq!(aligned as usize % (1 << 16), 0);
        tieralloc::free(aligned);

        tieralloc::free(p);
        tieralloc::free(q);
    }

    // No profiler was configured, so there is no profile to read.
    assert!(tieralloc::current_profile().is_none());
}
