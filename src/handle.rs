//! Intrusively ref-counted handles with custom deleters.
//!
//! `Handle<T>` generalizes an `OwnedHandle` "drop bomb" pattern (a value
//! that panics if dropped without an explicit deleter call) into something
//! that runs its deleter
//! automatically, exactly once, when the last strong reference disappears.
//! The deleter does not destroy the underlying GPU object synchronously: it
//! pushes the raw handle (and its allocation record, for `Buffer`/`Image`)
//! onto the *current* frame's destroy list. The frame that eventually
//! cycles back to that slot is guaranteed, by the timeline watermark in
//! [`crate::frame_context::FrameContext`], to be past the point where the
//! GPU could still be using the object.
//!
//! There are no cycles in the resource graph this crate builds: an
//! `ImageView` borrows its `Image` through a plain [`Handle`] clone (keeping
//! it alive) rather than the other way around, so reference counting alone
//! is sufficient -- no weak back-edges are required anywhere except the
//! handle's own link back to the device, which is already a [`Weak`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cookie::Cookie;

/// Implemented by every resource type that can live behind a [`Handle`].
pub trait HasCookie {
    fn cookie(&self) -> Cookie;
}

type Deleter<T> = Box<dyn FnMut(T) + Send + Sync>;

struct Inner<T> {
    cookie: Cookie,
    value: ManuallyDrop<T>,
    /// Run when dropped by a thread that does not already hold the device
    /// lock (the common case).
    deleter: Option<Deleter<T>>,
    /// Run instead of `deleter` when `internal_sync` is set: used for
    /// handles whose last reference is known to drop from inside code that
    /// already holds the device lock (e.g. while walking a submission's
    /// resource list), so the `_nolock` bookkeeping path must be used to
    /// avoid a self-deadlock.
    nolock_deleter: Option<Deleter<T>>,
    internal_sync: AtomicBool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // SAFETY: `value` is only read here, exactly once, and `Inner` is
        // never used again after this point.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        let deleter = if self.internal_sync.load(Ordering::Acquire) {
            self.nolock_deleter.take().or_else(|| self.deleter.take())
        } else {
            self.deleter.take()
        };
        if let Some(mut deleter) = deleter {
            deleter(value);
        }
    }
}

/// A reference-counted handle to a device resource of type `T`.
///
/// Cloning is a cheap atomic increment; there is no deep copy. Equality and
/// hashing are by [`Cookie`], not by pointer or by value, so a handle can be
/// used as a hashmap key that survives the underlying `Arc` being
/// reallocated (it never is, but the invariant is cookie-based regardless,
/// matching how the pipeline and descriptor-set caches key on cookies).
pub struct Handle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Handle<T> {
    /// Builds a new handle. `deleter` is called with ownership of `value`
    /// when the last clone of the returned handle is dropped from a thread
    /// that does not already hold the device lock.
    pub fn new(cookie: Cookie, value: T, deleter: impl FnMut(T) + Send + Sync + 'static) -> Self {
        Handle {
            inner: Arc::new(Inner {
                cookie,
                value: ManuallyDrop::new(value),
                deleter: Some(Box::new(deleter)),
                nolock_deleter: None,
                internal_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Like [`Handle::new`], but also installs a `_nolock` deleter used
    /// instead of the regular one once [`Handle::mark_internal_sync`] is
    /// called.
    pub fn with_nolock_deleter(
        cookie: Cookie,
        value: T,
        deleter: impl FnMut(T) + Send + Sync + 'static,
        nolock_deleter: impl FnMut(T) + Send + Sync + 'static,
    ) -> Self {
        Handle {
            inner: Arc::new(Inner {
                cookie,
                value: ManuallyDrop::new(value),
                deleter: Some(Box::new(deleter)),
                nolock_deleter: Some(Box::new(nolock_deleter)),
                internal_sync: AtomicBool::new(false),
            }),
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.inner.cookie
    }

    /// Number of outstanding strong references, including this one.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Two handles refer to the same underlying resource iff they share the
    /// same backing allocation.
    pub fn ptr_eq(a: &Handle<T>, b: &Handle<T>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.cookie == other.inner.cookie
    }
}
impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.cookie.hash(state)
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cookie", &self.inner.cookie)
            .field("value", &*self.inner.value)
            .finish()
    }
}

/// Marks a handle whose deleter should run in the caller's already-locked
/// context. A crate-internal escape hatch used by the submission core when
/// it drops handles while holding the device lock.
pub(crate) fn mark_internal_sync<T>(handle: &Handle<T>) {
    handle.inner.internal_sync.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn deleter_runs_once_on_last_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let alloc = crate::cookie::CookieAllocator::new();
        {
            let count2 = count.clone();
            let h1 = Handle::new(alloc.next(), 42u32, move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            });
            let h2 = h1.clone();
            assert_eq!(h1.strong_count(), 2);
            drop(h1);
            assert_eq!(count.load(Ordering::SeqCst), 0);
            drop(h2);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equality_and_hash_are_cookie_based() {
        use std::collections::HashSet;
        let alloc = crate::cookie::CookieAllocator::new();
        let h1 = Handle::new(alloc.next(), 1u32, |_| {});
        let h2 = h1.clone();
        let h3 = Handle::new(alloc.next(), 1u32, |_| {});
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        let mut set = HashSet::new();
        set.insert(h1.clone());
        assert!(set.contains(&h2));
        assert!(!set.contains(&h3));
    }
}
