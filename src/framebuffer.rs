//! Framebuffer cache: `VkFramebuffer` objects are cheap to create but
//! pointless to recreate every frame, so they're kept in a temporal LRU
//! keyed by the compatible render pass hash and the cookies of the image
//! views bound to it.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk;
use fxhash::FxHasher;
use smallvec::SmallVec;

use crate::cookie::{Cookie, CookieAllocator};

/// Number of `begin_frame` calls a framebuffer can go unused before it's
/// evicted and destroyed.
const RETENTION_FRAMES: u32 = 8;

fn key(compatible_render_pass_hash: u64, view_cookies: &[Cookie]) -> u64 {
    let mut hasher = FxHasher::default();
    compatible_render_pass_hash.hash(&mut hasher);
    for cookie in view_cookies {
        cookie.hash(&mut hasher);
    }
    hasher.finish()
}

struct Entry {
    framebuffer: vk::Framebuffer,
    last_used_frame: u64,
}

#[derive(Default)]
pub struct FramebufferCache {
    by_key: HashMap<u64, Entry>,
    frame_counter: u64,
}

impl FramebufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a cached framebuffer for this combination, or builds one
    /// with `create` (expected to call `vkCreateFramebuffer`) and caches
    /// it. `create` is only invoked on a miss.
    pub fn get_or_create(
        &mut self,
        compatible_render_pass_hash: u64,
        view_cookies: &[Cookie],
        create: impl FnOnce() -> vk::Framebuffer,
    ) -> vk::Framebuffer {
        let k = key(compatible_render_pass_hash, view_cookies);
        let frame = self.frame_counter;
        match self.by_key.get_mut(&k) {
            Some(entry) => {
                entry.last_used_frame = frame;
                entry.framebuffer
            }
            None => {
                let framebuffer = create();
                self.by_key.insert(
                    k,
                    Entry {
                        framebuffer,
                        last_used_frame: frame,
                    },
                );
                framebuffer
            }
        }
    }

    /// Advances the aging clock and evicts entries unused for
    /// `RETENTION_FRAMES` consecutive calls, destroying their
    /// `VkFramebuffer`s. Called once per `Device::next_frame_context`.
    pub fn begin_frame(&mut self, device: &ash::Device) {
        self.frame_counter += 1;
        let frame = self.frame_counter;
        let mut stale: SmallVec<[u64; 8]> = SmallVec::new();
        for (k, entry) in self.by_key.iter() {
            if frame.saturating_sub(entry.last_used_frame) >= RETENTION_FRAMES as u64 {
                stale.push(*k);
            }
        }
        for k in stale {
            if let Some(entry) = self.by_key.remove(&k) {
                unsafe { device.destroy_framebuffer(entry.framebuffer, None) };
            }
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, entry) in self.by_key.drain() {
            unsafe { device.destroy_framebuffer(entry.framebuffer, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_lookup_with_same_key_does_not_recreate() {
        let mut cache = FramebufferCache::new();
        let alloc = CookieAllocator::new();
        let cookies = [alloc.next(), alloc.next()];
        let mut create_calls = 0;
        let fb1 = cache.get_or_create(42, &cookies, || {
            create_calls += 1;
            vk::Framebuffer::from_raw(7)
        });
        let fb2 = cache.get_or_create(42, &cookies, || {
            create_calls += 1;
            vk::Framebuffer::from_raw(9)
        });
        assert_eq!(fb1, fb2);
        assert_eq!(create_calls, 1);
    }

    #[test]
    fn different_view_cookies_produce_different_framebuffers() {
        let mut cache = FramebufferCache::new();
        let alloc = CookieAllocator::new();
        let a = cache.get_or_create(1, &[alloc.next()], || vk::Framebuffer::from_raw(1));
        let b = cache.get_or_create(1, &[alloc.next()], || vk::Framebuffer::from_raw(2));
        assert_ne!(a, b);
    }

    #[test]
    fn aging_logic_marks_unused_entries_stale_after_retention_window() {
        let mut cache = FramebufferCache::new();
        let alloc = CookieAllocator::new();
        let cookies = [alloc.next()];
        cache.get_or_create(1, &cookies, || vk::Framebuffer::from_raw(1));
        for _ in 0..RETENTION_FRAMES {
            cache.frame_counter += 1;
        }
        let frame = cache.frame_counter;
        let entry = cache.by_key.values().next().unwrap();
        assert!(frame.saturating_sub(entry.last_used_frame) >= RETENTION_FRAMES as u64);
    }
}
