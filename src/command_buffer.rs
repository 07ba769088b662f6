//! Command buffer recorder: dirty-tracked state setters over a raw
//! `VkCommandBuffer`, lazy pipeline construction from a fingerprint, and
//! the two-phase descriptor flush.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk;
use fxhash::FxHasher;
use smallvec::SmallVec;

use crate::descriptor_set::DescriptorSetAllocatorRegistry;
use crate::framebuffer::FramebufferCache;
use crate::handle::{HasCookie, Handle};
use crate::memory::pool::{BufferBlock, LinearBufferPool};
use crate::memory::Allocator;
use crate::program::Program;
use crate::render_pass::{self, HashMode, RenderPassCache, RenderPassInfo};
use crate::resources::buffer::Buffer;
use crate::resources::image_view::ImageView;
use crate::resources::sampler::Sampler;
use crate::shader::MAX_DESCRIPTOR_SETS;

bitflags::bitflags! {
    /// Which categories of bound state have changed since the last draw
    /// or dispatch and must be re-emitted before the next one.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct DirtyFlags: u8 {
        const STATIC_STATE        = 0b0000_0001;
        const PIPELINE             = 0b0000_0010;
        const VIEWPORT             = 0b0000_0100;
        const SCISSOR              = 0b0000_1000;
        const DEPTH_BIAS           = 0b0001_0000;
        const STENCIL_REFERENCE    = 0b0010_0000;
        const STATIC_VERTEX_LAYOUT = 0b0100_0000;
        const PUSH_CONSTANTS       = 0b1000_0000;
    }
}

/// Packed static pipeline state. Every field here participates in the
/// pipeline fingerprint; two command buffers with identical
/// `PipelineState` (and the same program/render-pass/subpass/vertex
/// layout/spec-constants) resolve to the same native pipeline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PipelineState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bias_enable: bool,
    pub stencil_test_enable: bool,
    pub stencil_front: vk::StencilOpState,
    pub stencil_back: vk::StencilOpState,
    pub blend_enable_mask: u32,
    pub primitive_restart_enable: bool,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
    pub sample_shading_enable: bool,
    pub conservative_raster_enable: bool,
    pub patch_control_points: u32,
}

impl Hash for PipelineState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.topology.as_raw().hash(state);
        self.polygon_mode.as_raw().hash(state);
        self.cull_mode.as_raw().hash(state);
        self.front_face.as_raw().hash(state);
        self.depth_test_enable.hash(state);
        self.depth_write_enable.hash(state);
        self.depth_compare_op.as_raw().hash(state);
        self.depth_bias_enable.hash(state);
        self.stencil_test_enable.hash(state);
        hash_stencil_op_state(&self.stencil_front, state);
        hash_stencil_op_state(&self.stencil_back, state);
        self.blend_enable_mask.hash(state);
        self.primitive_restart_enable.hash(state);
        self.alpha_to_coverage_enable.hash(state);
        self.alpha_to_one_enable.hash(state);
        self.sample_shading_enable.hash(state);
        self.conservative_raster_enable.hash(state);
        self.patch_control_points.hash(state);
    }
}

fn hash_stencil_op_state<H: Hasher>(s: &vk::StencilOpState, state: &mut H) {
    s.fail_op.as_raw().hash(state);
    s.pass_op.as_raw().hash(state);
    s.depth_fail_op.as_raw().hash(state);
    s.compare_op.as_raw().hash(state);
    s.compare_mask.hash(state);
    s.write_mask.hash(state);
    s.reference.hash(state);
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: vk::CompareOp::LESS,
            depth_bias_enable: false,
            stencil_test_enable: false,
            stencil_front: vk::StencilOpState::default(),
            stencil_back: vk::StencilOpState::default(),
            blend_enable_mask: 0,
            primitive_restart_enable: false,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
            sample_shading_enable: false,
            conservative_raster_enable: false,
            patch_control_points: 0,
        }
    }
}

/// One resource slot bound to a (set, binding) pair, fingerprinted by
/// cookie rather than by raw handle so a destroyed-and-recreated resource
/// at the same binding never aliases a stale descriptor set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
struct BoundResource {
    cookie: u64,
    secondary_cookie: u64,
    fp_aspect: bool,
    dynamic_offset: u32,
}

struct SetBindings {
    slots: [BoundResource; crate::shader::MAX_BINDINGS_PER_SET],
}

impl Default for SetBindings {
    fn default() -> Self {
        SetBindings {
            slots: [BoundResource::default(); crate::shader::MAX_BINDINGS_PER_SET],
        }
    }
}

/// The raw descriptor-write payload for one binding, kept alongside its
/// cookie-based [`BoundResource`] rather than folded into it: this carries
/// the actual `VkBuffer`/`VkImageView` needed to build a
/// `VkWriteDescriptorSet` at flush time, but must never participate in the
/// dirty/fingerprint comparison (two binds of the same cookie at a new raw
/// handle can't happen -- a cookie is only ever reissued for a genuinely
/// new resource).
#[derive(Clone, Copy)]
pub(crate) enum RawBinding {
    None,
    Buffer(vk::DescriptorBufferInfo, vk::DescriptorType),
    Image(vk::DescriptorImageInfo, vk::DescriptorType),
    TexelBufferView(vk::BufferView, vk::DescriptorType),
}

impl Default for RawBinding {
    fn default() -> Self {
        RawBinding::None
    }
}

/// Snapshot taken by `save_state`, compared against on `restore_state` to
/// derive which dirty bits need setting rather than blindly marking
/// everything dirty.
#[derive(Clone)]
pub struct CommandBufferSavedState {
    pipeline_state: PipelineState,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    push_constants: SmallVec<[u8; 128]>,
}

struct ActiveRenderPass {
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    subpass: u32,
    compatible_hash: u64,
    color_count: u32,
    current_contents: vk::SubpassContents,
}

/// A single-threaded recorder over one `VkCommandBuffer`. Not `Sync`: the
/// crate's concurrency contract is that a `CommandBuffer` is only ever
/// touched by the thread that requested it.
pub struct CommandBuffer {
    raw: vk::CommandBuffer,
    thread_index: usize,
    queue_family: u32,
    secondary: bool,

    dirty: DirtyFlags,
    dirty_sets: u32,
    dirty_sets_dynamic: u32,
    dirty_vbos: u32,

    pipeline_state: PipelineState,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    depth_bias_constant: f32,
    depth_bias_clamp: f32,
    depth_bias_slope: f32,
    push_constants: SmallVec<[u8; 128]>,
    vertex_attribute_mask: u32,
    vertex_attribute_binding: [u32; 32],
    vertex_attribute_format: [vk::Format; 32],
    vertex_attribute_offset: [u32; 32],
    vertex_binding_strides: [u32; 16],
    vertex_binding_rates: [vk::VertexInputRate; 16],
    spec_constants: SmallVec<[u32; 16]>,

    bound_program: Option<Handle<Program>>,
    sets: [SetBindings; MAX_DESCRIPTOR_SETS],
    raw_bindings: [[RawBinding; crate::shader::MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
    allocated_sets: [Option<vk::DescriptorSet>; MAX_DESCRIPTOR_SETS],

    active_render_pass: Option<ActiveRenderPass>,

    vbo_pool: LinearBufferPool,
    ibo_pool: LinearBufferPool,
    ubo_pool: LinearBufferPool,
    staging_pool: LinearBufferPool,
    /// Uniform allocations below the allocator's alignment requirement are
    /// padded up to this size so a later dynamic-offset rebind is always
    /// safe relative to the bound range.
    ubo_spill_size: u64,
}

impl CommandBuffer {
    pub fn new(
        raw: vk::CommandBuffer,
        thread_index: usize,
        queue_family: u32,
        secondary: bool,
        ubo_spill_size: u64,
    ) -> Self {
        CommandBuffer {
            raw,
            thread_index,
            queue_family,
            secondary,
            dirty: DirtyFlags::empty(),
            dirty_sets: 0,
            dirty_sets_dynamic: 0,
            dirty_vbos: 0,
            pipeline_state: PipelineState::default(),
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
            depth_bias_constant: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope: 0.0,
            push_constants: SmallVec::new(),
            vertex_attribute_mask: 0,
            vertex_attribute_binding: [0; 32],
            vertex_attribute_format: [vk::Format::UNDEFINED; 32],
            vertex_attribute_offset: [0; 32],
            vertex_binding_strides: [0; 16],
            vertex_binding_rates: [vk::VertexInputRate::VERTEX; 16],
            spec_constants: SmallVec::new(),
            bound_program: None,
            sets: Default::default(),
            raw_bindings: Default::default(),
            allocated_sets: [None; MAX_DESCRIPTOR_SETS],
            active_render_pass: None,
            vbo_pool: LinearBufferPool::new(vk::BufferUsageFlags::VERTEX_BUFFER, crate::memory::MemoryDomain::Host, 1 << 20),
            ibo_pool: LinearBufferPool::new(vk::BufferUsageFlags::INDEX_BUFFER, crate::memory::MemoryDomain::Host, 1 << 20),
            ubo_pool: LinearBufferPool::new(vk::BufferUsageFlags::UNIFORM_BUFFER, crate::memory::MemoryDomain::Host, 1 << 18),
            staging_pool: LinearBufferPool::new(vk::BufferUsageFlags::TRANSFER_SRC, crate::memory::MemoryDomain::Host, 1 << 22),
            ubo_spill_size,
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    // ---- state setters --------------------------------------------------

    pub fn set_program(&mut self, program: Handle<Program>) {
        self.bound_program = Some(program);
        self.dirty.insert(DirtyFlags::PIPELINE);
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        if self.viewport != viewport {
            self.viewport = viewport;
            self.dirty.insert(DirtyFlags::VIEWPORT);
        }
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        if self.scissor != scissor {
            self.scissor = scissor;
            self.dirty.insert(DirtyFlags::SCISSOR);
        }
    }

    pub fn set_depth_test(&mut self, enable: bool, write: bool, compare_op: vk::CompareOp) {
        if self.pipeline_state.depth_test_enable != enable
            || self.pipeline_state.depth_write_enable != write
            || self.pipeline_state.depth_compare_op != compare_op
        {
            self.pipeline_state.depth_test_enable = enable;
            self.pipeline_state.depth_write_enable = write;
            self.pipeline_state.depth_compare_op = compare_op;
            self.dirty.insert(DirtyFlags::STATIC_STATE | DirtyFlags::PIPELINE);
        }
    }

    pub fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) {
        if self.pipeline_state.cull_mode != cull_mode || self.pipeline_state.front_face != front_face {
            self.pipeline_state.cull_mode = cull_mode;
            self.pipeline_state.front_face = front_face;
            self.dirty.insert(DirtyFlags::STATIC_STATE | DirtyFlags::PIPELINE);
        }
    }

    pub fn set_topology(&mut self, topology: vk::PrimitiveTopology) {
        if self.pipeline_state.topology != topology {
            self.pipeline_state.topology = topology;
            self.dirty.insert(DirtyFlags::STATIC_STATE | DirtyFlags::PIPELINE);
        }
    }

    pub fn set_blend_enable(&mut self, attachment: u32, enable: bool) {
        let bit = 1u32 << attachment;
        let was = self.pipeline_state.blend_enable_mask & bit != 0;
        if was != enable {
            self.pipeline_state.blend_enable_mask ^= bit;
            self.dirty.insert(DirtyFlags::STATIC_STATE | DirtyFlags::PIPELINE);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_vertex_attribute(&mut self, location: u32, binding: u32, format: vk::Format, offset: u32, stride: u32, rate: vk::VertexInputRate) {
        self.vertex_attribute_mask |= 1 << location;
        self.vertex_attribute_binding[location as usize] = binding;
        self.vertex_attribute_format[location as usize] = format;
        self.vertex_attribute_offset[location as usize] = offset;
        self.vertex_binding_strides[binding as usize] = stride;
        self.vertex_binding_rates[binding as usize] = rate;
        self.dirty.insert(DirtyFlags::STATIC_VERTEX_LAYOUT | DirtyFlags::PIPELINE);
    }

    pub fn set_push_constants(&mut self, data: &[u8]) {
        self.push_constants = SmallVec::from_slice(data);
        self.dirty.insert(DirtyFlags::PUSH_CONSTANTS);
    }

    pub fn set_spec_constants(&mut self, words: &[u32]) {
        self.spec_constants = SmallVec::from_slice(words);
        self.dirty.insert(DirtyFlags::PIPELINE);
    }

    pub fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32) {
        if self.depth_bias_constant != constant || self.depth_bias_clamp != clamp || self.depth_bias_slope != slope {
            self.depth_bias_constant = constant;
            self.depth_bias_clamp = clamp;
            self.depth_bias_slope = slope;
            self.dirty.insert(DirtyFlags::DEPTH_BIAS);
        }
    }

    pub fn set_stencil_reference(&mut self, front: u32, back: u32) {
        if self.pipeline_state.stencil_front.reference != front || self.pipeline_state.stencil_back.reference != back {
            self.pipeline_state.stencil_front.reference = front;
            self.pipeline_state.stencil_back.reference = back;
            self.dirty.insert(DirtyFlags::STENCIL_REFERENCE);
        }
    }

    // ---- accessors for the device-side flush path --------------------------

    pub(crate) fn pipeline_state(&self) -> &PipelineState {
        &self.pipeline_state
    }

    pub(crate) fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    pub(crate) fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    pub(crate) fn depth_bias(&self) -> (f32, f32, f32) {
        (self.depth_bias_constant, self.depth_bias_clamp, self.depth_bias_slope)
    }

    pub(crate) fn stencil_reference(&self) -> u32 {
        self.pipeline_state.stencil_front.reference
    }

    pub(crate) fn push_constants(&self) -> &[u8] {
        &self.push_constants
    }

    pub(crate) fn spec_constants(&self) -> &[u32] {
        &self.spec_constants
    }

    /// Builds the `VkVertexInputBindingDescription`/`VkVertexInputAttributeDescription`
    /// arrays implied by every `set_vertex_attribute` call since the layout
    /// was last changed, for feeding a graphics pipeline's vertex input
    /// state at build time.
    pub(crate) fn vertex_input_state(&self) -> (SmallVec<[vk::VertexInputBindingDescription; 8]>, SmallVec<[vk::VertexInputAttributeDescription; 16]>) {
        let mut bindings: SmallVec<[vk::VertexInputBindingDescription; 8]> = SmallVec::new();
        let mut seen_bindings = [false; 16];
        let mut attributes: SmallVec<[vk::VertexInputAttributeDescription; 16]> = SmallVec::new();
        for location in 0..32u32 {
            if self.vertex_attribute_mask & (1 << location) == 0 {
                continue;
            }
            let binding = self.vertex_attribute_binding[location as usize];
            if !seen_bindings[binding as usize] {
                seen_bindings[binding as usize] = true;
                bindings.push(vk::VertexInputBindingDescription {
                    binding,
                    stride: self.vertex_binding_strides[binding as usize],
                    input_rate: self.vertex_binding_rates[binding as usize],
                });
            }
            attributes.push(vk::VertexInputAttributeDescription {
                location,
                binding,
                format: self.vertex_attribute_format[location as usize],
                offset: self.vertex_attribute_offset[location as usize],
            });
        }
        (bindings, attributes)
    }

    // ---- resource binders ------------------------------------------------

    fn bind_resource(&mut self, set: u32, binding: u32, resource: BoundResource) {
        let slot = &mut self.sets[set as usize].slots[binding as usize];
        if *slot != resource {
            *slot = resource;
            self.dirty_sets |= 1 << set;
        }
    }

    pub fn set_uniform_buffer(&mut self, set: u32, binding: u32, buffer: &Buffer, offset: u32, range: u32) {
        let resource = BoundResource {
            cookie: buffer.cookie().get(),
            secondary_cookie: 0,
            fp_aspect: false,
            dynamic_offset: offset,
        };
        self.raw_bindings[set as usize][binding as usize] = RawBinding::Buffer(
            vk::DescriptorBufferInfo {
                buffer: buffer.raw(),
                offset: 0,
                range: range as u64,
            },
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        );
        let slot = &mut self.sets[set as usize].slots[binding as usize];
        if slot.cookie != resource.cookie || slot.secondary_cookie != resource.secondary_cookie {
            *slot = resource;
            self.dirty_sets |= 1 << set;
        } else if slot.dynamic_offset != resource.dynamic_offset {
            slot.dynamic_offset = resource.dynamic_offset;
            self.dirty_sets_dynamic |= 1 << set;
        }
    }

    pub fn set_storage_buffer(&mut self, set: u32, binding: u32, buffer: &Buffer) {
        self.raw_bindings[set as usize][binding as usize] = RawBinding::Buffer(
            vk::DescriptorBufferInfo {
                buffer: buffer.raw(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
            vk::DescriptorType::STORAGE_BUFFER,
        );
        self.bind_resource(
            set,
            binding,
            BoundResource {
                cookie: buffer.cookie().get(),
                ..Default::default()
            },
        );
    }

    pub fn set_sampled_texture(&mut self, set: u32, binding: u32, view: &ImageView, sampler: &Sampler, fp_aspect: bool) {
        self.raw_bindings[set as usize][binding as usize] = RawBinding::Image(
            vk::DescriptorImageInfo {
                sampler: sampler.raw(),
                image_view: view.default_view(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        );
        self.bind_resource(
            set,
            binding,
            BoundResource {
                cookie: view.cookie().get(),
                secondary_cookie: sampler.cookie().get(),
                fp_aspect,
                dynamic_offset: 0,
            },
        );
    }

    pub fn set_storage_image(&mut self, set: u32, binding: u32, view: &ImageView) {
        self.raw_bindings[set as usize][binding as usize] = RawBinding::Image(
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view.default_view(),
                image_layout: vk::ImageLayout::GENERAL,
            },
            vk::DescriptorType::STORAGE_IMAGE,
        );
        self.bind_resource(
            set,
            binding,
            BoundResource {
                cookie: view.cookie().get(),
                ..Default::default()
            },
        );
    }

    pub fn set_sampled_buffer(&mut self, set: u32, binding: u32, view: &crate::resources::buffer_view::BufferView) {
        self.raw_bindings[set as usize][binding as usize] =
            RawBinding::TexelBufferView(view.raw(), vk::DescriptorType::UNIFORM_TEXEL_BUFFER);
        self.bind_resource(
            set,
            binding,
            BoundResource {
                cookie: view.cookie().get(),
                ..Default::default()
            },
        );
    }

    pub fn set_input_attachment(&mut self, set: u32, binding: u32, view: &ImageView) {
        self.raw_bindings[set as usize][binding as usize] = RawBinding::Image(
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view.default_view(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            vk::DescriptorType::INPUT_ATTACHMENT,
        );
        self.bind_resource(
            set,
            binding,
            BoundResource {
                cookie: view.cookie().get(),
                ..Default::default()
            },
        );
    }

    pub fn set_buffer_view(&mut self, set: u32, binding: u32, view: &crate::resources::buffer_view::BufferView) {
        self.set_sampled_buffer(set, binding, view);
    }

    pub(crate) fn raw_binding(&self, set: u32, binding: u32) -> RawBinding {
        self.raw_bindings[set as usize][binding as usize]
    }

    // ---- transient allocators --------------------------------------------

    pub fn allocate_vertex_data(&mut self, device: &ash::Device, allocator: &Allocator, size: u64) -> Result<BufferBlock, crate::error::DeviceError> {
        self.dirty_vbos |= 1;
        self.vbo_pool.allocate(device, allocator, size, 4)
    }

    pub fn allocate_index_data(&mut self, device: &ash::Device, allocator: &Allocator, size: u64) -> Result<BufferBlock, crate::error::DeviceError> {
        self.ibo_pool.allocate(device, allocator, size, 4)
    }

    pub fn allocate_uniform_data(&mut self, device: &ash::Device, allocator: &Allocator, size: u64, alignment: u64) -> Result<BufferBlock, crate::error::DeviceError> {
        let padded = size.max(self.ubo_spill_size);
        self.ubo_pool.allocate(device, allocator, padded, alignment)
    }

    pub fn allocate_staging_data(&mut self, device: &ash::Device, allocator: &Allocator, size: u64) -> Result<BufferBlock, crate::error::DeviceError> {
        self.staging_pool.allocate(device, allocator, size, 16)
    }

    pub fn recycle_transient_pools(&mut self) {
        self.vbo_pool.recycle();
        self.ibo_pool.recycle();
        self.ubo_pool.recycle();
        self.staging_pool.recycle();
    }

    pub fn destroy_transient_pools(&mut self, device: &ash::Device, allocator: &Allocator) {
        self.vbo_pool.destroy(device, allocator);
        self.ibo_pool.destroy(device, allocator);
        self.ubo_pool.destroy(device, allocator);
        self.staging_pool.destroy(device, allocator);
    }

    // ---- pipeline fingerprint ---------------------------------------------

    /// Composes the 64-bit pipeline fingerprint from every piece of state
    /// the native pipeline object depends on. Two recordings that reach
    /// the same fingerprint are guaranteed (barring a hash collision, not
    /// defended against here any more than the rest of this crate's
    /// cookie-based hashing is) to want the identical `VkPipeline`.
    pub fn pipeline_fingerprint(&self, program: &Program, render_pass_hash: u64, subpass: u32) -> u64 {
        let mut hasher = FxHasher::default();
        self.pipeline_state.hash(&mut hasher);
        program.stage_identity_hash().hash(&mut hasher);
        render_pass_hash.hash(&mut hasher);
        subpass.hash(&mut hasher);
        self.vertex_attribute_mask.hash(&mut hasher);
        self.vertex_binding_strides.hash(&mut hasher);
        for rate in &self.vertex_binding_rates {
            (*rate).as_raw().hash(&mut hasher);
        }
        self.spec_constants.hash(&mut hasher);
        if self.pipeline_state.blend_enable_mask != 0 {
            // blend constants only participate in the fingerprint when at
            // least one attachment actually blends.
            0xBEEFu32.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn get_or_build_pipeline(&self, program: &Program, render_pass_hash: u64, subpass: u32, build: impl FnOnce() -> vk::Pipeline) -> vk::Pipeline {
        let fingerprint = self.pipeline_fingerprint(program, render_pass_hash, subpass);
        program.get_or_build_pipeline(fingerprint, build)
    }

    // ---- descriptor flush --------------------------------------------------

    fn set_fingerprint(&self, set: u32) -> u64 {
        let mut hasher = FxHasher::default();
        for slot in &self.sets[set as usize].slots {
            slot.cookie.hash(&mut hasher);
            slot.secondary_cookie.hash(&mut hasher);
            slot.fp_aspect.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Returns `(set_update_mask, dynamic_update_mask)` per the two-phase
    /// flush rule, and clears both dirty masks. `device.rs` drives the
    /// actual allocator lookups and `vkCmdBindDescriptorSets` calls using
    /// these masks and `set_fingerprint`.
    pub fn take_descriptor_dirty_masks(&mut self, program_descriptor_set_mask: u32) -> (u32, u32) {
        let set_update = program_descriptor_set_mask & self.dirty_sets;
        let dynamic_update = program_descriptor_set_mask & self.dirty_sets_dynamic & !set_update;
        self.dirty_sets = 0;
        self.dirty_sets_dynamic = 0;
        (set_update, dynamic_update)
    }

    pub fn set_fingerprint_for_flush(&self, set: u32) -> u64 {
        self.set_fingerprint(set)
    }

    pub fn dynamic_offsets(&self, set: u32, mask: u32) -> SmallVec<[u32; 8]> {
        let mut offsets = SmallVec::new();
        for binding in 0..crate::shader::MAX_BINDINGS_PER_SET {
            if mask & (1 << binding) != 0 {
                offsets.push(self.sets[set as usize].slots[binding].dynamic_offset);
            }
        }
        offsets
    }

    pub fn record_allocated_set(&mut self, set: u32, handle: vk::DescriptorSet) {
        self.allocated_sets[set as usize] = Some(handle);
    }

    pub fn allocated_set(&self, set: u32) -> Option<vk::DescriptorSet> {
        self.allocated_sets[set as usize]
    }

    // ---- save / restore -----------------------------------------------------

    pub fn save_state(&self) -> CommandBufferSavedState {
        CommandBufferSavedState {
            pipeline_state: self.pipeline_state,
            viewport: self.viewport,
            scissor: self.scissor,
            push_constants: self.push_constants.clone(),
        }
    }

    pub fn restore_state(&mut self, saved: &CommandBufferSavedState) {
        if self.pipeline_state != saved.pipeline_state {
            self.pipeline_state = saved.pipeline_state;
            self.dirty.insert(DirtyFlags::STATIC_STATE | DirtyFlags::PIPELINE);
        }
        if self.viewport != saved.viewport {
            self.viewport = saved.viewport;
            self.dirty.insert(DirtyFlags::VIEWPORT);
        }
        if self.scissor != saved.scissor {
            self.scissor = saved.scissor;
            self.dirty.insert(DirtyFlags::SCISSOR);
        }
        if self.push_constants != saved.push_constants {
            self.push_constants = saved.push_constants.clone();
            self.dirty.insert(DirtyFlags::PUSH_CONSTANTS);
        }
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn clear_dirty(&mut self, mask: DirtyFlags) {
        self.dirty.remove(mask);
    }

    // ---- render pass lifecycle -----------------------------------------------

    /// Begins a render pass: fetches (or builds) the compatible framebuffer
    /// and real `VkRenderPass`, clips the initial viewport/scissor to the
    /// framebuffer extent, and issues `vkCmdBeginRenderPass`.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_render_pass(
        &mut self,
        device: &ash::Device,
        render_pass_cache: &mut RenderPassCache,
        framebuffer_cache: &mut FramebufferCache,
        info: &RenderPassInfo,
        view_cookies: &[crate::cookie::Cookie],
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
        build_render_pass: impl FnOnce() -> vk::RenderPass,
        build_framebuffer: impl FnOnce(vk::RenderPass) -> vk::Framebuffer,
    ) {
        let compatible_hash = render_pass::hash(info, HashMode::Compatible);
        let full_hash = render_pass::hash(info, HashMode::Full);

        let render_pass = match render_pass_cache.get(full_hash) {
            Some(rp) => rp,
            None => {
                let rp = build_render_pass();
                render_pass_cache.insert(full_hash, rp);
                rp
            }
        };

        let framebuffer = framebuffer_cache.get_or_create(compatible_hash, view_cookies, || build_framebuffer(render_pass));

        self.viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        self.scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(self.scissor)
            .clear_values(clear_values);

        unsafe { device.cmd_begin_render_pass(self.raw, &render_pass_begin, contents) };
        let _ = attachments; // consumed by imageless-framebuffer variants, unused by the baked-view path.

        self.active_render_pass = Some(ActiveRenderPass {
            render_pass,
            framebuffer,
            subpass: 0,
            compatible_hash,
            color_count: info.color.len() as u32,
            current_contents: contents,
        });
        self.dirty = DirtyFlags::all();
        self.dirty_sets = 0;
        self.dirty_sets_dynamic = 0;
    }

    pub fn next_subpass(&mut self, device: &ash::Device, contents: vk::SubpassContents) {
        let active = self.active_render_pass.as_mut().expect("next_subpass outside a render pass");
        unsafe { device.cmd_next_subpass(self.raw, contents) };
        active.subpass += 1;
        active.current_contents = contents;
        self.dirty.insert(DirtyFlags::PIPELINE);
    }

    pub fn end_render_pass(&mut self, device: &ash::Device) {
        assert!(self.active_render_pass.is_some(), "end_render_pass outside a render pass");
        unsafe { device.cmd_end_render_pass(self.raw) };
        self.active_render_pass = None;
    }

    pub fn current_render_pass_hash(&self) -> Option<u64> {
        self.active_render_pass.as_ref().map(|a| a.compatible_hash)
    }

    pub fn current_subpass(&self) -> Option<u32> {
        self.active_render_pass.as_ref().map(|a| a.subpass)
    }

    /// `(render_pass, subpass, color_attachment_count)` for the active
    /// render pass, or `None` outside of one -- everything a graphics
    /// pipeline build needs beyond the program and recorder-side state.
    pub(crate) fn active_render_pass_info(&self) -> Option<(vk::RenderPass, u32, u32)> {
        self.active_render_pass.as_ref().map(|a| (a.render_pass, a.subpass, a.color_count))
    }

    /// Must be `SECONDARY_COMMAND_BUFFERS` on the primary for
    /// `request_secondary` to be valid to submit against it.
    pub fn current_contents(&self) -> Option<vk::SubpassContents> {
        self.active_render_pass.as_ref().map(|a| a.current_contents)
    }

    // ---- draw / dispatch -----------------------------------------------------
    //
    // These assume the caller has already driven the dirty-state flush (see
    // `Device::flush_render_state`/`Device::flush_compute_state`, which own
    // pipeline/descriptor-set binding since they alone can build a pipeline
    // or allocate a descriptor set). Everything here is a direct `vkCmd*`
    // pass-through.

    pub fn bind_vertex_buffer(&self, device: &ash::Device, binding: u32, buffer: vk::Buffer, offset: u64) {
        unsafe { device.cmd_bind_vertex_buffers(self.raw, binding, &[buffer], &[offset]) };
    }

    pub fn bind_index_buffer(&self, device: &ash::Device, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe { device.cmd_bind_index_buffer(self.raw, buffer, offset, index_type) };
    }

    pub fn draw(&self, device: &ash::Device, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe { device.cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance) };
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &self,
        device: &ash::Device,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe { device.cmd_draw_indexed(self.raw, index_count, instance_count, first_index, vertex_offset, first_instance) };
    }

    pub fn draw_indirect(&self, device: &ash::Device, buffer: vk::Buffer, offset: u64, draw_count: u32, stride: u32) {
        unsafe { device.cmd_draw_indirect(self.raw, buffer, offset, draw_count, stride) };
    }

    pub fn draw_indexed_indirect(&self, device: &ash::Device, buffer: vk::Buffer, offset: u64, draw_count: u32, stride: u32) {
        unsafe { device.cmd_draw_indexed_indirect(self.raw, buffer, offset, draw_count, stride) };
    }

    pub fn dispatch(&self, device: &ash::Device, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe { device.cmd_dispatch(self.raw, group_count_x, group_count_y, group_count_z) };
    }

    pub fn dispatch_indirect(&self, device: &ash::Device, buffer: vk::Buffer, offset: u64) {
        unsafe { device.cmd_dispatch_indirect(self.raw, buffer, offset) };
    }

    // ---- barriers --------------------------------------------------------------
    //
    // Thin wrappers over `vkCmdPipelineBarrier`; the device facade's
    // cross-queue upload paths are the main caller, but these are public
    // since application code doing its own synchronization
    // (e.g. a compute-to-graphics storage-image hazard) needs them directly.

    pub fn full_barrier(&self, device: &ash::Device) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            device.cmd_pipeline_barrier(
                self.raw,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub fn pixel_barrier(&self, device: &ash::Device) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::COLOR_ATTACHMENT_READ);
        unsafe {
            device.cmd_pipeline_barrier(
                self.raw,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::BY_REGION,
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub fn memory_barrier(
        &self,
        device: &ash::Device,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            device.cmd_pipeline_barrier(self.raw, src_stage, dst_stage, vk::DependencyFlags::empty(), &[barrier], &[], &[]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn buffer_barrier(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_queue_family: u32,
        dst_queue_family: u32,
    ) {
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(src_queue_family)
            .dst_queue_family_index(dst_queue_family)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe {
            device.cmd_pipeline_barrier(self.raw, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[barrier], &[]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn image_barrier(
        &self,
        device: &ash::Device,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_queue_family: u32,
        dst_queue_family: u32,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(src_queue_family)
            .dst_queue_family_index(dst_queue_family)
            .image(image)
            .subresource_range(subresource_range);
        unsafe {
            device.cmd_pipeline_barrier(self.raw, src_stage, dst_stage, vk::DependencyFlags::empty(), &[], &[], &[barrier]);
        }
    }

    pub fn set_event(&self, device: &ash::Device, event: vk::Event, stage: vk::PipelineStageFlags) {
        unsafe { device.cmd_set_event(self.raw, event, stage) };
    }

    pub fn reset_event(&self, device: &ash::Device, event: vk::Event, stage: vk::PipelineStageFlags) {
        unsafe { device.cmd_reset_event(self.raw, event, stage) };
    }

    #[allow(clippy::too_many_arguments)]
    pub fn wait_events(
        &self,
        device: &ash::Device,
        events: &[vk::Event],
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            device.cmd_wait_events(self.raw, events, src_stage, dst_stage, memory_barriers, buffer_barriers, image_barriers);
        }
    }

    // ---- transfer ops ------------------------------------------------------------

    pub fn fill_buffer(&self, device: &ash::Device, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        unsafe { device.cmd_fill_buffer(self.raw, buffer, offset, size, data) };
    }

    pub fn copy_buffer(&self, device: &ash::Device, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { device.cmd_copy_buffer(self.raw, src, dst, regions) };
    }

    pub fn copy_image(
        &self,
        device: &ash::Device,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe { device.cmd_copy_image(self.raw, src, src_layout, dst, dst_layout, regions) };
    }

    pub fn copy_buffer_to_image(
        &self,
        device: &ash::Device,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { device.cmd_copy_buffer_to_image(self.raw, src, dst, dst_layout, regions) };
    }

    pub fn copy_image_to_buffer(
        &self,
        device: &ash::Device,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { device.cmd_copy_image_to_buffer(self.raw, src, src_layout, dst, regions) };
    }

    pub fn blit_image(
        &self,
        device: &ash::Device,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe { device.cmd_blit_image(self.raw, src, src_layout, dst, dst_layout, regions, filter) };
    }

    pub fn clear_color_image(&self, device: &ash::Device, image: vk::Image, layout: vk::ImageLayout, color: vk::ClearColorValue, ranges: &[vk::ImageSubresourceRange]) {
        unsafe { device.cmd_clear_color_image(self.raw, image, layout, &color, ranges) };
    }

    /// Prepares an image for a transfer-queue upload: transitions every mip
    /// level from `UNDEFINED` to `TRANSFER_DST_OPTIMAL` in one barrier. Used
    /// ahead of `copy_buffer_to_image` in the cross-queue upload path.
    pub fn prepare_for_transfer_write(&self, device: &ash::Device, image: vk::Image, aspect_mask: vk::ImageAspectFlags, mip_levels: u32, array_layers: u32) {
        let range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: array_layers,
        };
        self.image_barrier(
            device,
            image,
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
        );
    }

    /// Generates mips 1..`mip_levels` from mip 0 via chained
    /// `vkCmdBlitImage` calls on the graphics queue, each halving the
    /// previous mip's extent; rounds down to a minimum of 1 texel per side.
    /// Every level ends in `final_layout`. Must run on a queue whose family
    /// supports `VK_QUEUE_GRAPHICS_BIT` (blits with linear filtering are not
    /// guaranteed on transfer-only queues).
    #[allow(clippy::too_many_arguments)]
    pub fn generate_mipmaps(
        &self,
        device: &ash::Device,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        base_extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        final_layout: vk::ImageLayout,
    ) {
        if mip_levels <= 1 {
            self.image_barrier(
                device,
                image,
                vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: array_layers,
                },
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                final_layout,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            );
            return;
        }

        let mut mip_width = base_extent.width as i32;
        let mut mip_height = base_extent.height as i32;
        let single_level = |level: u32| vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: array_layers,
        };

        for mip in 1..mip_levels {
            self.image_barrier(
                device,
                image,
                single_level(mip - 1),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            );

            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: mip - 1,
                    base_array_layer: 0,
                    layer_count: array_layers,
                },
                src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: mip_width, y: mip_height, z: 1 }],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count: array_layers,
                },
                dst_offsets: [vk::Offset3D::default(), vk::Offset3D { x: next_width, y: next_height, z: 1 }],
            };
            self.blit_image(
                device,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            self.image_barrier(
                device,
                image,
                single_level(mip - 1),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                final_layout,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            );

            mip_width = next_width;
            mip_height = next_height;
        }

        self.image_barrier(
            device,
            image,
            single_level(mip_levels - 1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            final_layout,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::QUEUE_FAMILY_IGNORED,
            vk::QUEUE_FAMILY_IGNORED,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb() -> CommandBuffer {
        CommandBuffer::new(vk::CommandBuffer::null(), 0, 0, false, 256)
    }

    #[test]
    fn viewport_change_marks_only_viewport_dirty() {
        let mut c = cb();
        c.clear_dirty(DirtyFlags::all());
        c.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        assert_eq!(c.dirty(), DirtyFlags::VIEWPORT);
    }

    #[test]
    fn repeated_uniform_buffer_bind_with_same_cookie_only_dirties_dynamic_mask() {
        let mut c = cb();
        let alloc = crate::cookie::CookieAllocator::new();
        let buffer_cookie = alloc.next();
        let fake_buffer_slot = BoundResource {
            cookie: buffer_cookie.get(),
            secondary_cookie: 0,
            fp_aspect: false,
            dynamic_offset: 0,
        };
        c.sets[0].slots[0] = fake_buffer_slot;
        c.dirty_sets = 0;
        c.dirty_sets_dynamic = 0;

        // simulate a second bind to the same buffer at a new offset without
        // going through Buffer (no live device needed for this assertion)
        let slot = &mut c.sets[0].slots[0];
        if slot.dynamic_offset != 64 {
            slot.dynamic_offset = 64;
            c.dirty_sets_dynamic |= 1;
        }

        assert_eq!(c.dirty_sets, 0);
        assert_eq!(c.dirty_sets_dynamic, 1);
    }

    #[test]
    fn descriptor_flush_masks_are_mutually_exclusive() {
        let mut c = cb();
        c.dirty_sets = 0b101;
        c.dirty_sets_dynamic = 0b110;
        let (set_update, dynamic_update) = c.take_descriptor_dirty_masks(0b111);
        assert_eq!(set_update, 0b101);
        assert_eq!(dynamic_update, 0b010);
        assert_eq!(c.dirty_sets, 0);
        assert_eq!(c.dirty_sets_dynamic, 0);
    }

    #[test]
    fn save_restore_round_trip_produces_no_dirty_bits() {
        let mut c = cb();
        c.set_viewport(vk::Viewport {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        let saved = c.save_state();
        c.clear_dirty(DirtyFlags::all());
        c.restore_state(&saved);
        assert_eq!(c.dirty(), DirtyFlags::empty());
    }

    #[test]
    fn fingerprint_changes_when_vertex_attribute_mask_changes() {
        let mut program_shaders = std::collections::HashMap::new();
        let _ = &mut program_shaders;
        // pipeline_fingerprint needs a Program; exercised at the integration
        // level (see tests/scenarios.rs). Here we only check the pure
        // vertex_attribute_mask/hash interplay via a local hasher.
        let mut c = cb();
        let before = c.vertex_attribute_mask;
        c.set_vertex_attribute(2, 0, vk::Format::R32G32B32_SFLOAT, 0, 12, vk::VertexInputRate::VERTEX);
        assert_ne!(before, c.vertex_attribute_mask);
    }
}
