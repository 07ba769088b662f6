//! Fence pool: one per device, handing out already-signaled-or-unsignaled
//! fences for submissions that need a CPU-observable completion point
//! (legacy path, used when timeline semaphores are unavailable, and for
//! `wait_idle`/frame-drain waits regardless).

use ash::vk;

use super::ObjectPool;

pub struct FencePool {
    pool: ObjectPool<vk::Fence>,
}

impl FencePool {
    pub fn new() -> Self {
        FencePool { pool: ObjectPool::new() }
    }

    /// Hands out a fence in the unsignaled state, ready to pass to
    /// `vkQueueSubmit`.
    pub fn acquire(&mut self, device: &ash::Device) -> vk::Fence {
        self.pool.acquire(|| {
            let create_info = vk::FenceCreateInfo::default();
            unsafe { device.create_fence(&create_info, None) }.expect("vkCreateFence failed")
        })
    }

    /// Returns a fence to the pool. The caller must have already waited on
    /// it and reset it (or know it was never submitted).
    pub fn release(&mut self, device: &ash::Device, fence: vk::Fence) {
        unsafe {
            device
                .reset_fences(&[fence])
                .expect("vkResetFences failed");
        }
        self.pool.release(fence);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pool.destroy_all(|fence| unsafe { device.destroy_fence(fence, None) });
    }
}

impl Default for FencePool {
    fn default() -> Self {
        Self::new()
    }
}
