//! Process-unique resource identity.
//!
//! Every long-lived resource created by a [`Device`](crate::device::Device)
//! carries a cookie: a 64-bit value, unique for the lifetime of the Device,
//! used as a stand-in for pointer identity when a resource is referenced from
//! a hasher (pipeline fingerprints, descriptor set binding fingerprints,
//! framebuffer cache keys). Pointers get recycled by allocators; cookies
//! never do.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-unique (well: per-`Device`-unique) identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cookie(u64);

impl Cookie {
    /// Reserved value meaning "no cookie assigned yet".
    pub const NONE: Cookie = Cookie(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Monotonic allocator for [`Cookie`]s, one per `Device`.
///
/// Starts at 1 so that `Cookie::NONE` (0) is never handed out, matching the
/// "the value 0 is reserved" convention used for frame numbers and other
/// monotonic counters throughout this crate.
#[derive(Debug, Default)]
pub struct CookieAllocator {
    next: AtomicU64,
}

impl CookieAllocator {
    pub fn new() -> Self {
        CookieAllocator {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next cookie. Safe to call concurrently from any thread.
    pub fn next(&self) -> Cookie {
        Cookie(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_unique_and_increasing() {
        let alloc = CookieAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(a.get() < b.get());
        assert!(b.get() < c.get());
        assert_ne!(a, Cookie::NONE);
    }

    #[test]
    fn concurrent_allocation_never_collides() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let alloc = Arc::new(CookieAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| alloc.next().get()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for cookie in h.join().unwrap() {
                assert!(seen.insert(cookie), "duplicate cookie {cookie}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
