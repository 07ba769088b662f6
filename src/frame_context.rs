//! Per-frame context: the ring of deferred-destruction lists, command
//! pools, and timeline watermarks that make resource destruction safe
//! without ever blocking on the GPU mid-frame.
//!
//! A `Handle`'s deleter does not destroy its GPU object synchronously (see
//! [`crate::handle`]); it pushes the raw handle onto the *current*
//! `FrameContext`'s matching destroy list. `begin` drains the list for the
//! ring slot about to become current again, after confirming (via the
//! timeline watermark recorded when that slot was last active) that the
//! GPU is done with everything in it.

use ash::vk;
use smallvec::SmallVec;

use crate::memory::pool::BufferBlock;
use crate::memory::{AllocatedMemory, Allocator};
use crate::sync::fence::FencePool;
use crate::sync::semaphore::SemaphorePool;

/// Everything a dropped `Handle<T>` might push here. One list per
/// primitive GPU object kind; `Buffer`/`Image` additionally carry their
/// `AllocatedMemory` so it can be returned to the allocator in the same
/// pass.
#[derive(Default)]
pub struct DestroyLists {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub image_views: Vec<vk::ImageView>,
    pub buffer_views: Vec<vk::BufferView>,
    pub samplers: Vec<vk::Sampler>,
    pub images: Vec<(vk::Image, Option<AllocatedMemory>)>,
    pub buffers: Vec<(vk::Buffer, Option<AllocatedMemory>)>,
    pub shader_modules: Vec<vk::ShaderModule>,
    pub programs: Vec<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>, Vec<vk::Pipeline>)>,
    pub events: Vec<vk::Event>,
}

impl DestroyLists {
    /// Destroys every queued object and returns all memory to `allocator`.
    /// Must only be called once the watermark proves the GPU is done.
    pub fn drain(&mut self, device: &ash::Device, allocator: &Allocator) {
        for fb in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(fb, None) };
        }
        for v in self.image_views.drain(..) {
            unsafe { device.destroy_image_view(v, None) };
        }
        for v in self.buffer_views.drain(..) {
            unsafe { device.destroy_buffer_view(v, None) };
        }
        for s in self.samplers.drain(..) {
            unsafe { device.destroy_sampler(s, None) };
        }
        for (image, memory) in self.images.drain(..) {
            unsafe { device.destroy_image(image, None) };
            if let Some(memory) = memory {
                allocator.free_image(device, memory);
            }
        }
        for (buffer, memory) in self.buffers.drain(..) {
            unsafe { device.destroy_buffer(buffer, None) };
            if let Some(memory) = memory {
                allocator.free_buffer(device, memory);
            }
        }
        for m in self.shader_modules.drain(..) {
            unsafe { device.destroy_shader_module(m, None) };
        }
        for (pipeline_layout, set_layouts, pipelines) in self.programs.drain(..) {
            for p in pipelines {
                unsafe { device.destroy_pipeline(p, None) };
            }
            for l in set_layouts {
                unsafe { device.destroy_descriptor_set_layout(l, None) };
            }
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
        }
        for e in self.events.drain(..) {
            unsafe { device.destroy_event(e, None) };
        }
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
            && self.image_views.is_empty()
            && self.buffer_views.is_empty()
            && self.samplers.is_empty()
            && self.images.is_empty()
            && self.buffers.is_empty()
            && self.shader_modules.is_empty()
            && self.programs.is_empty()
            && self.events.is_empty()
    }
}

/// Fences and semaphores have pools of their own rather than being
/// destroyed outright: they're returned here for recycling once the ring
/// slot's GPU work is known complete.
#[derive(Default)]
pub struct RecycleLists {
    pub fences: SmallVec<[vk::Fence; 4]>,
    pub semaphores: SmallVec<[vk::Semaphore; 4]>,
}

/// Buffer blocks returned by a command buffer's transient pools once their
/// recording is known to be fully consumed by the GPU.
#[derive(Default)]
pub struct BufferBlockRecycle {
    pub vbo: Vec<BufferBlock>,
    pub ibo: Vec<BufferBlock>,
    pub ubo: Vec<BufferBlock>,
    pub staging: Vec<BufferBlock>,
}

/// One ring slot: everything that accumulates while this slot is the
/// "current" frame, plus the command pools recording against it (one per
/// thread index per queue family actually used).
pub struct FrameContext {
    pub destroy: DestroyLists,
    pub recycle: RecycleLists,
    pub buffer_blocks: BufferBlockRecycle,
    /// `command_pools[thread_index]` for each queue family this slot has
    /// recorded against; populated lazily on first `request_command_buffer`
    /// for that (thread, family) pair.
    pub command_pools: Vec<((usize, u32), vk::CommandPool)>,
    /// The timeline value each queue had reached the last time this slot
    /// was begun; `begin` waits for this to be reached (if still
    /// outstanding) before draining `destroy`.
    pub wait_values: Vec<(usize, u64)>,
    pub fence: Option<vk::Fence>,
}

impl Default for FrameContext {
    fn default() -> Self {
        FrameContext {
            destroy: DestroyLists::default(),
            recycle: RecycleLists::default(),
            buffer_blocks: BufferBlockRecycle::default(),
            command_pools: Vec::new(),
            wait_values: Vec::new(),
            fence: None,
        }
    }
}

impl FrameContext {
    pub fn command_pool(&mut self, device: &ash::Device, thread_index: usize, queue_family: u32) -> vk::CommandPool {
        if let Some((_, pool)) = self.command_pools.iter().find(|((t, f), _)| *t == thread_index && *f == queue_family) {
            return *pool;
        }
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&create_info, None) }.expect("vkCreateCommandPool failed");
        self.command_pools.push(((thread_index, queue_family), pool));
        pool
    }

    /// Waits on every recorded timeline checkpoint (if timelines are
    /// available) or the slot's fence, drains the destroy list, returns
    /// recycled buffer blocks to their pools, and resets every command
    /// pool for reuse. Called when this ring slot becomes the current
    /// frame again.
    pub fn begin(
        &mut self,
        device: &ash::Device,
        allocator: &Allocator,
        wait_timeline: impl Fn(usize, u64) -> bool,
        fence_pool: &mut FencePool,
        semaphore_pool: &mut SemaphorePool,
    ) {
        for &(queue_index, value) in &self.wait_values {
            if value > 0 {
                let _ = wait_timeline(queue_index, value);
            }
        }
        if let Some(fence) = self.fence.take() {
            unsafe {
                let _ = device.wait_for_fences(&[fence], true, u64::MAX);
            }
            fence_pool.release(device, fence);
        }

        self.destroy.drain(device, allocator);

        for fence in self.recycle.fences.drain(..) {
            fence_pool.release(device, fence);
        }
        for semaphore in self.recycle.semaphores.drain(..) {
            semaphore_pool.release(semaphore);
        }

        self.buffer_blocks.vbo.clear();
        self.buffer_blocks.ibo.clear();
        self.buffer_blocks.ubo.clear();
        self.buffer_blocks.staging.clear();

        for (_, pool) in &self.command_pools {
            unsafe { device.reset_command_pool(*pool, vk::CommandPoolResetFlags::empty()) }
                .expect("vkResetCommandPool failed");
        }
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &Allocator) {
        self.destroy.drain(device, allocator);
        for (_, pool) in self.command_pools.drain(..) {
            unsafe { device.destroy_command_pool(pool, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_destroy_lists_report_empty() {
        let lists = DestroyLists::default();
        assert!(lists.is_empty());
    }

    #[test]
    fn pushing_any_list_clears_is_empty() {
        let mut lists = DestroyLists::default();
        lists.samplers.push(vk::Sampler::null());
        assert!(!lists.is_empty());
    }
}
