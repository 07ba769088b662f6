//! Binary semaphore pool, plus the timeline semaphore wrapper used instead
//! when the driver supports `VK_KHR_timeline_semaphore`.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use super::ObjectPool;

/// Binary semaphores recycled unless externally held: a semaphore handed
/// out to satisfy `add_wait_semaphore` with a caller-owned handle is never
/// put in this pool, since the caller retains ownership.
pub struct SemaphorePool {
    pool: ObjectPool<vk::Semaphore>,
}

impl SemaphorePool {
    pub fn new() -> Self {
        SemaphorePool { pool: ObjectPool::new() }
    }

    pub fn acquire(&mut self, device: &ash::Device) -> vk::Semaphore {
        self.pool.acquire(|| {
            let create_info = vk::SemaphoreCreateInfo::default();
            unsafe { device.create_semaphore(&create_info, None) }.expect("vkCreateSemaphore failed")
        })
    }

    pub fn release(&mut self, semaphore: vk::Semaphore) {
        self.pool.release(semaphore);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pool
            .destroy_all(|s| unsafe { device.destroy_semaphore(s, None) });
    }
}

impl Default for SemaphorePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One timeline semaphore per queue, monotonically incremented on every
/// submission. Unlike binary semaphores, there is exactly one of these per
/// queue for the lifetime of the device -- nothing to pool.
pub struct TimelineSemaphore {
    raw: vk::Semaphore,
    next_value: AtomicU64,
}

impl TimelineSemaphore {
    pub fn new(device: &ash::Device) -> Self {
        let mut type_create_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_create_info);
        let raw = unsafe { device.create_semaphore(&create_info, None) }.expect("vkCreateSemaphore failed");
        TimelineSemaphore {
            raw,
            next_value: AtomicU64::new(1),
        }
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }

    /// Reserves the next signal value for a submission about to be built,
    /// without blocking. Safe to call concurrently; the queue's submission
    /// lock still serializes the actual `vkQueueSubmit` that signals it.
    pub fn reserve_next_value(&self) -> u64 {
        self.next_value.fetch_add(1, Ordering::Relaxed)
    }

    /// Last value reserved (not necessarily signaled yet).
    pub fn last_reserved_value(&self) -> u64 {
        self.next_value.load(Ordering::Relaxed) - 1
    }

    pub fn current_value(&self, device: &ash::Device) -> u64 {
        unsafe { device.get_semaphore_counter_value(self.raw) }.expect("vkGetSemaphoreCounterValue failed")
    }

    /// Blocks the calling thread until the timeline reaches `value`.
    pub fn wait(&self, device: &ash::Device, value: u64, timeout_ns: u64) -> bool {
        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        matches!(
            unsafe { device.wait_semaphores(&wait_info, timeout_ns) },
            Ok(())
        )
    }

    pub fn destroy(self, device: &ash::Device) {
        unsafe { device.destroy_semaphore(self.raw, None) };
    }
}
