//! Event pool: `VkEvent`s used for intra-command-buffer fine-grained
//! synchronization (set on one pipeline stage, waited on at another,
//! without a full pipeline barrier or leaving the queue).

use ash::vk;

use super::ObjectPool;

pub struct EventPool {
    pool: ObjectPool<vk::Event>,
}

impl EventPool {
    pub fn new() -> Self {
        EventPool { pool: ObjectPool::new() }
    }

    pub fn acquire(&mut self, device: &ash::Device) -> vk::Event {
        self.pool.acquire(|| {
            let create_info = vk::EventCreateInfo::default();
            unsafe { device.create_event(&create_info, None) }.expect("vkCreateEvent failed")
        })
    }

    /// Returns an event to the pool. The caller must reset it first if
    /// there is any chance it was set.
    pub fn release(&mut self, device: &ash::Device, event: vk::Event) {
        unsafe {
            let _ = device.reset_event(event);
        }
        self.pool.release(event);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pool.destroy_all(|e| unsafe { device.destroy_event(e, None) });
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new()
    }
}
