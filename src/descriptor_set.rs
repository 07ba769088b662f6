//! Descriptor set allocator: one sub-allocator per distinct
//! `(DescriptorSetLayout, per-binding stage-visibility)` pair, each backed
//! by pools of 16 sets and a per-thread temporal hashmap keyed on the
//! binding-fingerprint hash computed by the command buffer recorder.
//!
//! Grounded on the same temporal-LRU shape as [`crate::framebuffer::FramebufferCache`],
//! generalized to two age buckets (instead of a single retention window)
//! and a bindless escape hatch that skips the cache outright.

use std::collections::HashMap;

use ash::vk;

use crate::program::ProgramLayout;
use crate::shader::MAX_DESCRIPTOR_SETS;

/// Sets allocated 16 at a time, matching the block granularity used for
/// similarly bursty small-object pools (command pools, pipeline caches).
const SETS_PER_POOL: u32 = 16;

/// A set kept in the cache ages out of bucket 0 into bucket 1 after one
/// `begin_frame` without being reused, and is freed after aging out of
/// bucket 1 -- i.e. unused for two consecutive frames.
const AGE_BUCKETS: usize = 2;

struct PoolBlock {
    pool: vk::DescriptorPool,
    allocated: u32,
}

struct CachedSet {
    set: vk::DescriptorSet,
    age: u8,
}

/// One allocator per `(set layout, stage-visibility)` combination the
/// program layer has ever produced.
pub struct SetAllocator {
    layout: vk::DescriptorSetLayout,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    bindless: bool,
    blocks: Vec<PoolBlock>,
    /// `fingerprint hash -> cached set`, empty and unused when `bindless`.
    cache: HashMap<u64, CachedSet>,
}

impl SetAllocator {
    pub fn new(layout: vk::DescriptorSetLayout, pool_sizes: Vec<vk::DescriptorPoolSize>, bindless: bool) -> Self {
        SetAllocator {
            layout,
            pool_sizes,
            bindless,
            blocks: Vec::new(),
            cache: HashMap::new(),
        }
    }

    fn push_block(&mut self, device: &ash::Device, max_sets: u32) -> vk::DescriptorPool {
        let mut flags = vk::DescriptorPoolCreateFlags::empty();
        if self.bindless {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&self.pool_sizes)
            .flags(flags);
        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }.expect("vkCreateDescriptorPool failed");
        self.blocks.push(PoolBlock { pool, allocated: 0 });
        pool
    }

    fn allocate_raw(&mut self, device: &ash::Device, variable_count: Option<u32>) -> vk::DescriptorSet {
        let pool = match self.blocks.last_mut() {
            Some(block) if block.allocated < SETS_PER_POOL => block.pool,
            _ => self.push_block(device, SETS_PER_POOL),
        };

        let layouts = [self.layout];
        let mut variable_counts = [variable_count.unwrap_or(0)];
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let mut variable_info;
        if variable_count.is_some() {
            variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
                .descriptor_counts(&variable_counts);
            alloc_info = alloc_info.push_next(&mut variable_info);
        }
        let _ = &mut variable_counts;

        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .unwrap_or_else(|_| {
                // pool genuinely exhausted (fragmentation) -- grow with a
                // fresh block and retry once.
                let pool = self.push_block(device, SETS_PER_POOL);
                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts);
                unsafe { device.allocate_descriptor_sets(&alloc_info) }.expect("vkAllocateDescriptorSets failed twice")
            });

        if let Some(block) = self.blocks.last_mut() {
            block.allocated += 1;
        }
        sets[0]
    }

    /// Fetches a cached set for `fingerprint`, or allocates and lets the
    /// caller populate a fresh one. Returns `(set, is_fresh)`: the caller
    /// only needs to issue `vkUpdateDescriptorSets` when `is_fresh` is
    /// true, since a cache hit means the bindings are already current.
    pub fn get_or_allocate(&mut self, device: &ash::Device, fingerprint: u64) -> (vk::DescriptorSet, bool) {
        assert!(!self.bindless, "bindless allocators do not use the fingerprint cache");
        if let Some(cached) = self.cache.get_mut(&fingerprint) {
            cached.age = 0;
            return (cached.set, false);
        }
        let set = self.allocate_raw(device, None);
        self.cache.insert(fingerprint, CachedSet { set, age: 0 });
        (set, true)
    }

    /// Bindless sets are never cached or reused: every request is fresh
    /// and variably sized, since the set's contents (a sparse bindless
    /// array) are managed by the caller directly, not by binding
    /// fingerprints.
    pub fn allocate_bindless(&mut self, device: &ash::Device, variable_count: u32) -> vk::DescriptorSet {
        assert!(self.bindless, "allocate_bindless called on a non-bindless allocator");
        self.allocate_raw(device, Some(variable_count))
    }

    /// Advances every cached set's age, evicting (but not yet freeing --
    /// the backing pool is reset wholesale, see `reclaim`) anything that's
    /// aged past the last bucket.
    fn begin_frame(&mut self) {
        if self.bindless {
            return;
        }
        self.cache.retain(|_, cached| {
            if (cached.age as usize) < AGE_BUCKETS {
                cached.age += 1;
                true
            } else {
                false
            }
        });
    }

    /// Resets every pool block, invalidating every outstanding
    /// `vk::DescriptorSet`. Only safe once the GPU is known to be done
    /// with every set this allocator has ever handed out (called from the
    /// destruction/recycle path of the frame context that owns this
    /// allocator's ring slot, not every frame).
    fn reclaim(&mut self, device: &ash::Device) {
        for block in &mut self.blocks {
            unsafe { device.reset_descriptor_pool(block.pool, vk::DescriptorPoolResetFlags::empty()) }
                .expect("vkResetDescriptorPool failed");
            block.allocated = 0;
        }
        self.cache.clear();
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for block in self.blocks.drain(..) {
            unsafe { device.destroy_descriptor_pool(block.pool, None) };
        }
        self.cache.clear();
    }
}

/// Registry of every [`SetAllocator`] that has ever been needed, keyed by
/// `(descriptor set layout, per-binding stage visibility)` so two programs
/// that happen to share a set layout but differ in which stages see which
/// binding don't collide in the same allocator (stage visibility affects
/// which pipeline stages a `vkUpdateDescriptorSets` write is legal from
/// under certain validation layers, so this crate keys on it defensively).
#[derive(Default)]
pub struct DescriptorSetAllocatorRegistry {
    allocators: HashMap<(vk::DescriptorSetLayout, [vk::ShaderStageFlags; 32]), SetAllocator>,
}

impl DescriptorSetAllocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        layout: vk::DescriptorSetLayout,
        stage_visibility: [vk::ShaderStageFlags; 32],
        pool_sizes: impl FnOnce() -> Vec<vk::DescriptorPoolSize>,
        bindless: bool,
    ) -> &mut SetAllocator {
        self.allocators
            .entry((layout, stage_visibility))
            .or_insert_with(|| SetAllocator::new(layout, pool_sizes(), bindless))
    }

    /// Ages every non-bindless allocator's cache by one frame. Called from
    /// `Device::next_frame_context`.
    pub fn begin_frame(&mut self) {
        for allocator in self.allocators.values_mut() {
            allocator.begin_frame();
        }
    }

    /// Resets the pools of every allocator whose frame-ring slot has come
    /// back around, invalidating their sets. The frame context identifies
    /// which allocators that is by virtue of owning one `begin_frame`
    /// call per ring slot; this registry itself does not track slots.
    pub fn reclaim_all(&mut self, device: &ash::Device) {
        for allocator in self.allocators.values_mut() {
            allocator.reclaim(device);
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, mut allocator) in self.allocators.drain() {
            allocator.destroy(device);
        }
    }
}

/// Derives `vkDescriptorPoolSize` counts for one pool block from a
/// program's combined layout, one entry per resource kind with any bound
/// bit for `set`.
pub fn pool_sizes_for_set(layout: &ProgramLayout, set: usize) -> Vec<vk::DescriptorPoolSize> {
    assert!(set < MAX_DESCRIPTOR_SETS);
    let combined = &layout.combined[set];
    let mut sizes = Vec::new();
    let kinds: &[(u32, vk::DescriptorType)] = &[
        (combined.sampled_image_mask, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
        (combined.storage_image_mask, vk::DescriptorType::STORAGE_IMAGE),
        (combined.uniform_buffer_mask, vk::DescriptorType::UNIFORM_BUFFER),
        (combined.storage_buffer_mask, vk::DescriptorType::STORAGE_BUFFER),
        (combined.sampled_buffer_mask, vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
        (combined.input_attachment_mask, vk::DescriptorType::INPUT_ATTACHMENT),
        (combined.sampler_mask, vk::DescriptorType::SAMPLER),
        (combined.separate_image_mask, vk::DescriptorType::SAMPLED_IMAGE),
    ];
    for &(mask, ty) in kinds {
        if mask == 0 {
            continue;
        }
        let count = mask.count_ones() * SETS_PER_POOL;
        sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::SetLayout;

    #[test]
    fn pool_sizes_scale_with_binding_count_and_pool_granularity() {
        let mut layout = ProgramLayout::default();
        layout.combined[0] = SetLayout {
            uniform_buffer_mask: 0b11,
            sampled_image_mask: 0b1,
            ..Default::default()
        };
        let sizes = pool_sizes_for_set(&layout, 0);
        let ubo = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(ubo.descriptor_count, 2 * SETS_PER_POOL);
        let sampled = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(sampled.descriptor_count, SETS_PER_POOL);
    }

    #[test]
    fn empty_set_layout_produces_no_pool_sizes() {
        let layout = ProgramLayout::default();
        assert!(pool_sizes_for_set(&layout, 0).is_empty());
    }
}
