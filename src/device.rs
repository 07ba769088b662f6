//! Device facade: the single entry point the rest of the crate is driven
//! through. Owns every cache and pool described elsewhere in this crate,
//! and is the only place that dereferences raw Vulkan handles alongside
//! the frame-ring and deferred-destruction bookkeeping that makes
//! `Handle<T>` dropping safe.
//!
//! Lock discipline: `caches` is one coarse lock covering the render-pass,
//! framebuffer, attachment and descriptor-set-allocator caches plus the
//! sync object pools -- every path that touches one of these already
//! expects to block briefly on a cache miss, so splitting them apart would
//! only add lock-ordering hazards for no real concurrency gain. `queues`
//! is a separate, finer lock: submission must not block on a frame's
//! resource caches warming up.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ash::vk;
use smallvec::SmallVec;

use crate::attachment_cache::{AttachmentCache, AttachmentShape};
use crate::command_buffer::{CommandBuffer, RawBinding};
use crate::cookie::{Cookie, CookieAllocator};
use crate::descriptor_set::{pool_sizes_for_set, DescriptorSetAllocatorRegistry};
use crate::error::DeviceError;
use crate::format::Format;
use crate::frame_context::FrameContext;
use crate::framebuffer::FramebufferCache;
use crate::handle::{HasCookie, Handle};
use crate::instance::{PhysicalDeviceInfo, Queues};
use crate::memory::{Allocator, MemoryDomain};
use crate::program::{Program, ProgramLayout};
use crate::queue::QueueState;
use crate::render_pass::{self, DerivedRenderPass, HashMode, RenderPassCache, RenderPassInfo};
use crate::resources::buffer::{Buffer, BufferCreateInfo, BufferMiscFlags};
use crate::resources::buffer_view::BufferView;
use crate::resources::image::{Image, ImageCreateInfo, ImageMiscFlags, ViewFormats};
use crate::resources::SharingMode;
use crate::resources::image_view::{ImageView, ImageViewCreateInfo, ViewKind};
use crate::resources::sampler::{Sampler, SamplerCreateInfo};
use crate::shader::{Shader, MAX_DESCRIPTOR_SETS};
use crate::swapchain::Swapchain;
use crate::sync::event::EventPool;
use crate::sync::fence::FencePool;
use crate::sync::semaphore::SemaphorePool;

/// Every shader module this crate builds is compiled with a single
/// conventional entry point name, matching the reflection pass in
/// `shader.rs` (which never looks at `OpEntryPoint`'s name operand, only its
/// execution model).
const SHADER_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Depth formats tried in order when the host asks for "the" default depth
/// format rather than naming one explicitly, most-compact first.
const DEFAULT_DEPTH_CANDIDATES: &[Format] = &[Format::D32Sfloat, Format::D16Unorm];
const DEFAULT_DEPTH_STENCIL_CANDIDATES: &[Format] = &[Format::D24UnormS8Uint, Format::D32SfloatS8Uint];

/// How many frame-ring slots to keep. Matches the common double/triple
/// buffering choice; configurable via [`Device::init_frame_contexts`]
/// rather than fixed, since some hosts want more slack against GPU stalls.
const DEFAULT_FRAME_CONTEXTS: usize = 2;

const GRAPHICS: usize = 0;
const COMPUTE: usize = 1;
const TRANSFER: usize = 2;

/// Shared state every deferred-destroy deleter needs to reach, independent
/// of the `Device` it came from -- a deleter runs from whatever thread
/// drops the last `Handle`, which does not have `&Device` in scope.
struct DeferredState {
    device: ash::Device,
    allocator: Arc<Allocator>,
    frame_contexts: Mutex<Vec<FrameContext>>,
    current_frame: AtomicU64,
}

impl DeferredState {
    /// Pushes onto the destroy list of the ring slot that is current right
    /// now, per the deleter contract in [`crate::handle`].
    fn push(&self, f: impl FnOnce(&mut crate::frame_context::DestroyLists)) {
        let mut contexts = self.frame_contexts.lock().unwrap();
        if contexts.is_empty() {
            contexts.push(FrameContext::default());
        }
        let idx = (self.current_frame.load(Ordering::SeqCst) as usize) % contexts.len();
        f(&mut contexts[idx].destroy);
    }
}

struct Caches {
    render_pass: RenderPassCache,
    framebuffer: FramebufferCache,
    attachment: AttachmentCache,
    descriptor_sets: DescriptorSetAllocatorRegistry,
    fences: FencePool,
    semaphores: SemaphorePool,
    events: EventPool,
}

/// The `Device` owns the raw Vulkan handles plus every cache and pool
/// described throughout this crate. Resource-creation deleters reach
/// `allocator`/`frame_contexts`/`current_frame` through a small
/// independently-owned [`DeferredState`] rather than a back-reference to
/// `Device` itself, since a deleter can run long after the `Device` that
/// created its resource has otherwise gone out of scope on the calling
/// thread's stack.
pub struct Device {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: PhysicalDeviceInfo,
    deferred: Arc<DeferredState>,
    queues: Mutex<[QueueState; 3]>,
    cookies: CookieAllocator,
    caches: Mutex<Caches>,
    /// Count of command-buffer handles currently outstanding: incremented by
    /// every `request_command_buffer[_for_thread]` call, decremented when
    /// that buffer reaches `submit`. `wait_idle` and `next_frame_context`'s
    /// drain step block on this reaching zero before proceeding, per the
    /// frame-drain contract; `frame_drain_condvar` is notified every time
    /// the count drops to zero.
    frame_drain_count: Mutex<u64>,
    frame_drain_condvar: Condvar,
    pipeline_cache: Mutex<vk::PipelineCache>,
    thread_count: usize,
    swapchain: Mutex<Option<Swapchain>>,
    swapchain_views: Mutex<Vec<vk::ImageView>>,
    /// Set by `set_queue_lock` when the graphics `VkQueue` is shared with
    /// another API (e.g. a windowing/XR runtime driving its own submits
    /// against the same queue handle) -- acquired around this crate's own
    /// `vkQueueSubmit`/`vkQueuePresentKHR` calls so the two callers don't
    /// race on the same queue.
    external_queue_lock: Mutex<Option<Arc<Mutex<()>>>>,
}

impl Device {
    pub fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        raw: ash::Device,
        physical_device: PhysicalDeviceInfo,
        queues: Queues,
        thread_count: usize,
    ) -> Self {
        let use_timeline = physical_device.has_timeline_semaphores;
        let queue_states = [
            QueueState::new(&raw, queues.graphics, use_timeline),
            QueueState::new(&raw, queues.compute, use_timeline),
            QueueState::new(&raw, queues.transfer, use_timeline),
        ];
        let allocator = Arc::new(Allocator::new(&instance, physical_device.physical_device, false));

        Device {
            entry,
            instance,
            physical_device,
            deferred: Arc::new(DeferredState {
                device: raw,
                allocator,
                frame_contexts: Mutex::new(Vec::new()),
                current_frame: AtomicU64::new(0),
            }),
            queues: Mutex::new(queue_states),
            cookies: CookieAllocator::new(),
            caches: Mutex::new(Caches {
                render_pass: RenderPassCache::new(),
                framebuffer: FramebufferCache::new(),
                attachment: AttachmentCache::new(),
                descriptor_sets: DescriptorSetAllocatorRegistry::new(),
                fences: FencePool::new(),
                semaphores: SemaphorePool::new(),
                events: EventPool::new(),
            }),
            frame_drain_count: Mutex::new(0),
            frame_drain_condvar: Condvar::new(),
            pipeline_cache: Mutex::new(vk::PipelineCache::null()),
            thread_count: thread_count.max(1),
            swapchain: Mutex::new(None),
            swapchain_views: Mutex::new(Vec::new()),
            external_queue_lock: Mutex::new(None),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.deferred.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn physical_device_info(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn allocator(&self) -> &Allocator {
        &self.deferred.allocator
    }

    fn queue_index_for_family(&self, family: u32) -> usize {
        let queues = self.queues.lock().unwrap();
        [GRAPHICS, COMPUTE, TRANSFER]
            .into_iter()
            .find(|&i| queues[i].family_index() == family)
            .unwrap_or(GRAPHICS)
    }

    // ---- frame-drain counter ------------------------------------------------

    fn mark_command_buffer_outstanding(&self) {
        *self.frame_drain_count.lock().unwrap() += 1;
    }

    /// Called once a command buffer has been handed to `submit`, whether or
    /// not the submission itself succeeded -- the handle is no longer
    /// outstanding either way. Notifies any drain waiter once the count
    /// reaches zero.
    fn mark_command_buffer_submitted(&self) {
        let mut count = self.frame_drain_count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.frame_drain_condvar.notify_all();
        }
    }

    /// Blocks until every command buffer handed out via
    /// `request_command_buffer[_for_thread]` has reached `submit`. Safe to
    /// call with nothing outstanding -- the predicate is already true and
    /// the wait returns immediately, unlike a bare `Condvar::wait`.
    fn wait_for_drain(&self) {
        let guard = self.frame_drain_count.lock().unwrap();
        let _ = self
            .frame_drain_condvar
            .wait_while(guard, |count| *count != 0)
            .unwrap();
    }

    // ---- frame context lifecycle -------------------------------------------

    /// Allocates `count` ring slots. Must be called once, before the first
    /// `next_frame_context`.
    pub fn init_frame_contexts(&self, count: usize) {
        let count = count.max(1);
        let mut contexts = self.deferred.frame_contexts.lock().unwrap();
        contexts.clear();
        contexts.extend((0..count).map(|_| FrameContext::default()));
    }

    fn frame_context_count(&self) -> usize {
        let contexts = self.deferred.frame_contexts.lock().unwrap();
        if contexts.is_empty() {
            DEFAULT_FRAME_CONTEXTS
        } else {
            contexts.len()
        }
    }

    /// 5-step pacing procedure: picks the ring slot about to become
    /// current, waits on its recorded timeline checkpoints/fence, drains
    /// its destroy/recycle lists, resets its command pools, and ages the
    /// framebuffer/attachment/descriptor caches by one frame.
    pub fn next_frame_context(&self) {
        // Step 1: drain the frame counter -- wait until every command
        // buffer handed out against the outgoing frame has been submitted.
        self.wait_for_drain();

        let slot_count = self.frame_context_count();
        let frame = self.deferred.current_frame.fetch_add(1, Ordering::SeqCst) + 1;
        let slot_index = (frame as usize) % slot_count;

        let watermarks: [u64; 3] = {
            let queues = self.queues.lock().unwrap();
            [
                queues[GRAPHICS].frame_watermark(),
                queues[COMPUTE].frame_watermark(),
                queues[TRANSFER].frame_watermark(),
            ]
        };

        {
            let mut contexts = self.deferred.frame_contexts.lock().unwrap();
            if contexts.is_empty() {
                contexts.extend((0..slot_count).map(|_| FrameContext::default()));
            }
            let mut caches = self.caches.lock().unwrap();
            let Caches { fences, semaphores, .. } = &mut *caches;
            contexts[slot_index].begin(
                &self.deferred.device,
                &self.deferred.allocator,
                |queue_index, value| watermarks[queue_index] >= value,
                fences,
                semaphores,
            );
            caches.framebuffer.begin_frame(&self.deferred.device);
            caches.attachment.begin_frame();
            caches.descriptor_sets.begin_frame();
        }
    }

    /// Blocks the calling thread until every command buffer currently
    /// outstanding has been submitted -- i.e. until the frame-drain
    /// condition `next_frame_context`'s first step waits on is satisfied.
    /// Safe to call on its own, with no following `next_frame_context`:
    /// unlike a bare `Condvar::wait`, this returns immediately if nothing is
    /// outstanding rather than blocking for a notification that will never
    /// come.
    pub fn end_frame_context(&self) {
        self.wait_for_drain();
    }

    /// Blocks until every queue is idle. Drains outstanding command buffers
    /// first, same as `next_frame_context`, then the only other place
    /// besides a ring-slot reuse wait that this crate blocks.
    pub fn wait_idle(&self) -> bool {
        self.wait_for_drain();
        unsafe { self.deferred.device.device_wait_idle() }
            .map_err(|_| DeviceError::DeviceLost.log())
            .is_ok()
    }

    // ---- resource creation --------------------------------------------------
    //
    // None of these return a `Result` to the host: per the propagation
    // policy in `error.rs`, a failed creation logs one line and returns
    // `None`. `DeviceError` is only threaded internally, between the point
    // of detection and that log call.

    pub fn create_shader(&self, stage: vk::ShaderStageFlags, code: &[u32]) -> Option<Handle<Shader>> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let raw = unsafe { self.deferred.device.create_shader_module(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateShaderModule failed").log())
            .ok()?;
        let cookie = self.cookies.next();
        let shader = Shader::new(cookie, raw, stage, code);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, shader, move |_shader: Shader| {
            deferred.push(|lists| lists.shader_modules.push(raw));
        }))
    }

    /// A graphics program is any `create_program` call whose stage set is
    /// vertex/fragment (plus optional tessellation/geometry) rather than a
    /// lone compute shader; this is just a naming convenience over
    /// `create_program`.
    pub fn create_graphics_program(&self, shaders: &[Handle<Shader>]) -> Option<Handle<Program>> {
        self.create_program(shaders)
    }

    /// A one-shader `create_program` call, named for the compute-only case.
    pub fn create_compute_program(&self, shader: Handle<Shader>) -> Option<Handle<Program>> {
        self.create_program(std::slice::from_ref(&shader))
    }

    pub fn create_program(&self, shaders: &[Handle<Shader>]) -> Option<Handle<Program>> {
        let pairs: Vec<(vk::ShaderStageFlags, &crate::shader::ResourceLayout)> =
            shaders.iter().map(|s| (s.stage(), s.layout())).collect();
        let layout = match ProgramLayout::merge(&pairs) {
            Some(l) => l,
            None => {
                DeviceError::UnsupportedFeature("incompatible shader stage resource layouts").log();
                return None;
            }
        };

        let mut descriptor_set_layouts = Vec::new();
        for set in 0..MAX_DESCRIPTOR_SETS {
            if layout.descriptor_set_mask & (1 << set) == 0 {
                continue;
            }
            let combined = &layout.combined[set];
            let used = combined.any_used_mask();
            let bindless = layout.bindless_set_mask & (1 << set) != 0;
            let mut bindings = Vec::new();
            let mut binding_flags = Vec::new();
            for binding in 0..crate::shader::MAX_BINDINGS_PER_SET {
                if used & (1 << binding) == 0 {
                    continue;
                }
                let descriptor_type = descriptor_type_for(combined, binding);
                let is_unsized = combined.array_sizes[binding] == crate::shader::UNSIZED_ARRAY;
                let count = match combined.array_sizes[binding] {
                    crate::shader::UNSIZED_ARRAY => 1, // real count supplied at allocation time for bindless sets
                    0 => 1,
                    n => n as u32,
                };
                bindings.push(
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(binding as u32)
                        .descriptor_type(descriptor_type)
                        .descriptor_count(count)
                        .stage_flags(layout.stage_visibility[set][binding]),
                );
                binding_flags.push(if is_unsized {
                    vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                } else {
                    vk::DescriptorBindingFlags::empty()
                });
            }

            let set_layout = if bindless {
                let mut flags_info =
                    vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
                let create_info = vk::DescriptorSetLayoutCreateInfo::default()
                    .bindings(&bindings)
                    .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                    .push_next(&mut flags_info);
                unsafe { self.deferred.device.create_descriptor_set_layout(&create_info, None) }
            } else {
                let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
                unsafe { self.deferred.device.create_descriptor_set_layout(&create_info, None) }
            }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateDescriptorSetLayout failed").log())
            .ok()?;
            descriptor_set_layouts.push(set_layout);
        }

        let push_constant_ranges = if layout.push_constant_range.size > 0 {
            vec![layout.push_constant_range]
        } else {
            Vec::new()
        };
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&descriptor_set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = unsafe {
            self.deferred
                .device
                .create_pipeline_layout(&pipeline_layout_info, None)
        }
        .map_err(|_| DeviceError::UnsupportedFeature("vkCreatePipelineLayout failed").log())
        .ok()?;

        let mut shader_map = std::collections::HashMap::new();
        for shader in shaders {
            shader_map.insert(shader.stage(), shader.clone());
        }

        let cookie = self.cookies.next();
        let program = Program::new(cookie, shader_map, layout, pipeline_layout, descriptor_set_layouts);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, program, move |program: Program| {
            let parts = program.into_raw_parts();
            deferred.push(|lists| lists.programs.push(parts));
        }))
    }

    pub fn create_buffer(&self, info: &BufferCreateInfo) -> Option<Handle<Buffer>> {
        let usage = info.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let (sharing_mode, families) = info.sharing.to_vk();
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);
        let raw = unsafe { self.deferred.device.create_buffer(&create_info, None) }
            .map_err(|_| DeviceError::AllocationFailed { size: info.size }.log())
            .ok()?;
        let memory = match self
            .allocator()
            .allocate_buffer(&self.deferred.device, raw, info.domain, false)
        {
            Ok(m) => m,
            Err(_) => {
                unsafe { self.deferred.device.destroy_buffer(raw, None) };
                return None;
            }
        };
        let wants_upload = info.initial.is_some() || info.misc.contains(BufferMiscFlags::ZERO_INITIALIZE);
        match memory.mapped_ptr() {
            Some(ptr) => match info.initial {
                Some(initial) => {
                    debug_assert!(initial.len() as u64 <= info.size);
                    unsafe { std::ptr::copy_nonoverlapping(initial.as_ptr(), ptr.as_ptr(), initial.len()) };
                }
                None if info.misc.contains(BufferMiscFlags::ZERO_INITIALIZE) => {
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0u8, info.size as usize) };
                }
                None => {}
            },
            None if wants_upload => {
                if !self.upload_buffer_initial(raw, info.size, usage, &info.sharing, info.initial) {
                    unsafe { self.deferred.device.destroy_buffer(raw, None) };
                    self.allocator().free_buffer(&self.deferred.device, memory);
                    return None;
                }
            }
            None => {}
        }
        let cookie = self.cookies.next();
        let buffer = Buffer::new(cookie, raw, memory, info);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, buffer, move |buffer: Buffer| {
            let (raw, memory) = buffer.into_raw_parts();
            deferred.push(|lists| lists.buffers.push((raw, Some(memory))));
        }))
    }

    /// Stages `initial` (or zero, if `None`) into a device-local buffer via
    /// a temporary host-visible staging buffer and a transfer-queue copy.
    /// When the buffer's owning family differs from the transfer queue
    /// (`EXCLUSIVE` sharing), the release barrier's completion is handed to
    /// the acquire-barrier submission via a semaphore rather than a CPU-side
    /// fence wait between the two, so the transfer and owner queues can
    /// overlap; only the chain's last hop blocks the calling thread, so the
    /// staging buffer can be freed once this call returns. `CONCURRENT`
    /// sharing has no second hop of its own -- instead it hands a wait
    /// semaphore to each other sharing queue's *next* submission, per
    /// `submit_visible`.
    fn upload_buffer_initial(
        &self,
        target: vk::Buffer,
        size: u64,
        usage: vk::BufferUsageFlags,
        sharing: &SharingMode,
        initial: Option<&[u8]>,
    ) -> bool {
        let transfer_family = {
            let queues = self.queues.lock().unwrap();
            queues[TRANSFER].family_index()
        };

        let staging_create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let Ok(staging_raw) = (unsafe { self.deferred.device.create_buffer(&staging_create_info, None) }) else {
            return false;
        };
        let staging_memory = match self.allocator().allocate_buffer(&self.deferred.device, staging_raw, MemoryDomain::Host, false) {
            Ok(m) => m,
            Err(_) => {
                unsafe { self.deferred.device.destroy_buffer(staging_raw, None) };
                return false;
            }
        };
        if let Some(ptr) = staging_memory.mapped_ptr() {
            match initial {
                Some(data) => {
                    debug_assert!(data.len() as u64 <= size);
                    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
                }
                None => unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0u8, size as usize) },
            }
        }

        let owner = sharing.owner();
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        let handoff_families = self.concurrent_handoff_families(sharing, transfer_family);

        let ok = match owner {
            Some(owner_family) if owner_family != transfer_family => {
                let (dst_stage, dst_access) = buffer_usage_stage_access(usage);
                let (copied, signals) = self.submit_one_off_chained(transfer_family, None, 1, false, |cb| {
                    cb.copy_buffer(&self.deferred.device, staging_raw, target, &[region]);
                    cb.buffer_barrier(
                        &self.deferred.device,
                        target,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::empty(),
                        transfer_family,
                        owner_family,
                    );
                });
                let handoff = signals.first().copied();
                let acquired = copied
                    && self
                        .submit_one_off_chained(
                            owner_family,
                            handoff.map(|s| (s, vk::PipelineStageFlags::TOP_OF_PIPE)),
                            0,
                            true,
                            |cb| {
                                cb.buffer_barrier(
                                    &self.deferred.device,
                                    target,
                                    vk::PipelineStageFlags::TOP_OF_PIPE,
                                    dst_stage,
                                    vk::AccessFlags::empty(),
                                    dst_access,
                                    transfer_family,
                                    owner_family,
                                );
                            },
                        )
                        .0;
                if let Some(semaphore) = handoff {
                    let mut caches = self.caches.lock().unwrap();
                    caches.semaphores.release(semaphore);
                }
                acquired
            }
            _ => {
                // Same-queue EXCLUSIVE, or CONCURRENT: one hop. CONCURRENT
                // additionally hands a wait semaphore to each other sharing
                // queue's next submission instead of an ownership barrier.
                let (dst_stage, _) = buffer_usage_stage_access(usage);
                let (copied, signals) =
                    self.submit_one_off_chained(transfer_family, None, handoff_families.len(), true, |cb| {
                        cb.copy_buffer(&self.deferred.device, staging_raw, target, &[region]);
                        cb.memory_barrier(
                            &self.deferred.device,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::empty(),
                        );
                    });
                if copied {
                    for (&family, &semaphore) in handoff_families.iter().zip(signals.iter()) {
                        self.add_wait_semaphore(family, semaphore, dst_stage, None);
                    }
                }
                copied
            }
        };

        unsafe { self.deferred.device.destroy_buffer(staging_raw, None) };
        self.allocator().free_buffer(&self.deferred.device, staging_memory);
        ok
    }

    /// Drives an image's initial upload across every combination of sharing
    /// mode, mip generation, and owning queue: stages `initial` into a
    /// host-visible buffer, copies it onto the base mip level, optionally
    /// chains mip blits on the graphics queue, and emits whatever
    /// queue-family ownership transfer the sharing mode and final owner
    /// call for. Each hop past the first hands its completion to the next
    /// via a semaphore (`queue::add_signal_semaphore` on the producing
    /// submission, `Device::add_wait_semaphore`/`submit_one_off_chained`'s
    /// `wait_on` on the consuming one) rather than a CPU-side fence wait --
    /// only the chain's last hop blocks the calling thread, so the transfer,
    /// graphics, and owner queues can overlap instead of serializing
    /// through this thread. `CONCURRENT` sharing hands a wait semaphore to
    /// each other sharing queue's next submission instead of an ownership
    /// barrier, per `submit_visible`'s up-to-two-semaphore rule.
    fn upload_image_initial(&self, target: vk::Image, info: &ImageCreateInfo, initial: &[u8]) -> bool {
        let (transfer_family, graphics_family) = {
            let queues = self.queues.lock().unwrap();
            (queues[TRANSFER].family_index(), queues[GRAPHICS].family_index())
        };
        let generate_mips = info.misc.contains(ImageMiscFlags::GENERATE_MIPS);
        let aspect_mask = info.format.to_vk_aspect_mask();
        let owner = info.sharing.owner();
        let (possible_stages, possible_access) = crate::resources::image::derive_compatible_masks(info.usage, info.format);
        let initial_layout = default_initial_layout(info.usage);
        let same_queue = transfer_family == graphics_family;

        let staging_create_info = vk::BufferCreateInfo::default()
            .size(initial.len() as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let Ok(staging_raw) = (unsafe { self.deferred.device.create_buffer(&staging_create_info, None) }) else {
            return false;
        };
        let staging_memory = match self.allocator().allocate_buffer(&self.deferred.device, staging_raw, MemoryDomain::Host, false) {
            Ok(m) => m,
            Err(_) => {
                unsafe { self.deferred.device.destroy_buffer(staging_raw, None) };
                return false;
            }
        };
        if let Some(ptr) = staging_memory.mapped_ptr() {
            unsafe { std::ptr::copy_nonoverlapping(initial.as_ptr(), ptr.as_ptr(), initial.len()) };
        }

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: info.array_layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: info.extent,
        };

        // Releases any chain-internal handoff semaphore: safe once the
        // chain's final hop has been fence-waited, since both its signal
        // and its wait are then known complete.
        let release = |semaphore: Option<vk::Semaphore>| {
            if let Some(semaphore) = semaphore {
                let mut caches = self.caches.lock().unwrap();
                caches.semaphores.release(semaphore);
            }
        };

        let ok = match owner {
            None if !generate_mips => {
                let handoff_families = self.concurrent_handoff_families(&info.sharing, transfer_family);
                let (copied, signals) =
                    self.submit_one_off_chained(transfer_family, None, handoff_families.len(), true, |cb| {
                        cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                        cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                        cb.image_barrier(
                            &self.deferred.device,
                            target,
                            full_range(aspect_mask, info.mip_levels, info.array_layers),
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            initial_layout,
                            vk::PipelineStageFlags::TRANSFER,
                            possible_stages,
                            vk::AccessFlags::TRANSFER_WRITE,
                            possible_access,
                            vk::QUEUE_FAMILY_IGNORED,
                            vk::QUEUE_FAMILY_IGNORED,
                        );
                    });
                if copied {
                    for (&family, &semaphore) in handoff_families.iter().zip(signals.iter()) {
                        self.add_wait_semaphore(family, semaphore, possible_stages, None);
                    }
                }
                copied
            }
            None if same_queue => self.submit_one_off(transfer_family, |cb| {
                cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                cb.generate_mipmaps(&self.deferred.device, target, aspect_mask, info.extent, info.mip_levels, info.array_layers, initial_layout);
            }),
            None => {
                let (copied, signals) = self.submit_one_off_chained(transfer_family, None, 1, false, |cb| {
                    cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                    cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                });
                let handoff = signals.first().copied();
                let handoff_families = self.concurrent_handoff_families(&info.sharing, graphics_family);
                let (mipped, final_signals) = if copied {
                    self.submit_one_off_chained(
                        graphics_family,
                        handoff.map(|s| (s, vk::PipelineStageFlags::TRANSFER)),
                        handoff_families.len(),
                        true,
                        |cb| {
                            cb.generate_mipmaps(&self.deferred.device, target, aspect_mask, info.extent, info.mip_levels, info.array_layers, initial_layout);
                        },
                    )
                } else {
                    (false, SmallVec::new())
                };
                release(handoff);
                if mipped {
                    for (&family, &semaphore) in handoff_families.iter().zip(final_signals.iter()) {
                        self.add_wait_semaphore(family, semaphore, possible_stages, None);
                    }
                }
                mipped
            }
            Some(owner_family) if !generate_mips && same_queue => self.submit_one_off(transfer_family, |cb| {
                cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                cb.image_barrier(
                    &self.deferred.device,
                    target,
                    full_range(aspect_mask, info.mip_levels, info.array_layers),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    initial_layout,
                    vk::PipelineStageFlags::TRANSFER,
                    possible_stages,
                    vk::AccessFlags::TRANSFER_WRITE,
                    possible_access,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                );
                let _ = owner_family;
            }),
            Some(owner_family) if !generate_mips => {
                let (copied, signals) = self.submit_one_off_chained(transfer_family, None, 1, false, |cb| {
                    cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                    cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                    cb.image_barrier(
                        &self.deferred.device,
                        target,
                        full_range(aspect_mask, info.mip_levels, info.array_layers),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::empty(),
                        transfer_family,
                        owner_family,
                    );
                });
                let handoff = signals.first().copied();
                let acquired = copied
                    && self
                        .submit_one_off_chained(
                            owner_family,
                            handoff.map(|s| (s, vk::PipelineStageFlags::TOP_OF_PIPE)),
                            0,
                            true,
                            |cb| {
                                cb.image_barrier(
                                    &self.deferred.device,
                                    target,
                                    full_range(aspect_mask, info.mip_levels, info.array_layers),
                                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                    initial_layout,
                                    vk::PipelineStageFlags::TOP_OF_PIPE,
                                    possible_stages,
                                    vk::AccessFlags::empty(),
                                    possible_access,
                                    transfer_family,
                                    owner_family,
                                );
                            },
                        )
                        .0;
                release(handoff);
                acquired
            }
            Some(owner_family) if owner_family == graphics_family && same_queue => self.submit_one_off(graphics_family, |cb| {
                cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                cb.generate_mipmaps(&self.deferred.device, target, aspect_mask, info.extent, info.mip_levels, info.array_layers, initial_layout);
            }),
            Some(owner_family) if owner_family == graphics_family => {
                let (copied, signals) = self.submit_one_off_chained(transfer_family, None, 1, false, |cb| {
                    cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                    cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                    cb.image_barrier(
                        &self.deferred.device,
                        target,
                        single_level(aspect_mask, 0, info.array_layers),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::empty(),
                        transfer_family,
                        graphics_family,
                    );
                });
                let handoff = signals.first().copied();
                let acquired = copied
                    && self
                        .submit_one_off_chained(
                            graphics_family,
                            handoff.map(|s| (s, vk::PipelineStageFlags::TRANSFER)),
                            0,
                            true,
                            |cb| {
                                cb.image_barrier(
                                    &self.deferred.device,
                                    target,
                                    single_level(aspect_mask, 0, info.array_layers),
                                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                    vk::PipelineStageFlags::TOP_OF_PIPE,
                                    vk::PipelineStageFlags::TRANSFER,
                                    vk::AccessFlags::empty(),
                                    vk::AccessFlags::TRANSFER_WRITE,
                                    transfer_family,
                                    graphics_family,
                                );
                                cb.generate_mipmaps(&self.deferred.device, target, aspect_mask, info.extent, info.mip_levels, info.array_layers, initial_layout);
                            },
                        )
                        .0;
                release(handoff);
                acquired
            }
            Some(owner_family) => {
                // Steady-state owner is neither the transfer nor the
                // graphics queue: transfer copies, graphics chains the
                // mips, then a second ownership transfer hands the image
                // to its real owner -- three hops, each handed to the next
                // by semaphore rather than a blocking wait.
                let (copied, copy_signals) = self.submit_one_off_chained(transfer_family, None, if same_queue { 0 } else { 1 }, false, |cb| {
                    cb.prepare_for_transfer_write(&self.deferred.device, target, aspect_mask, info.mip_levels, info.array_layers);
                    cb.copy_buffer_to_image(&self.deferred.device, staging_raw, target, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
                    if !same_queue {
                        cb.image_barrier(
                            &self.deferred.device,
                            target,
                            single_level(aspect_mask, 0, info.array_layers),
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::empty(),
                            transfer_family,
                            graphics_family,
                        );
                    }
                });
                let copy_handoff = copy_signals.first().copied();
                let (chained, chain_signals) = if copied {
                    self.submit_one_off_chained(
                        graphics_family,
                        copy_handoff.map(|s| (s, vk::PipelineStageFlags::TRANSFER)),
                        1,
                        false,
                        |cb| {
                            if !same_queue {
                                cb.image_barrier(
                                    &self.deferred.device,
                                    target,
                                    single_level(aspect_mask, 0, info.array_layers),
                                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                    vk::PipelineStageFlags::TOP_OF_PIPE,
                                    vk::PipelineStageFlags::TRANSFER,
                                    vk::AccessFlags::empty(),
                                    vk::AccessFlags::TRANSFER_WRITE,
                                    transfer_family,
                                    graphics_family,
                                );
                            }
                            cb.generate_mipmaps(
                                &self.deferred.device,
                                target,
                                aspect_mask,
                                info.extent,
                                info.mip_levels,
                                info.array_layers,
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            );
                            cb.image_barrier(
                                &self.deferred.device,
                                target,
                                full_range(aspect_mask, info.mip_levels, info.array_layers),
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                                vk::PipelineStageFlags::TRANSFER,
                                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                                vk::AccessFlags::TRANSFER_READ,
                                vk::AccessFlags::empty(),
                                graphics_family,
                                owner_family,
                            );
                        },
                    )
                } else {
                    (false, SmallVec::new())
                };
                release(copy_handoff);
                let chain_handoff = chain_signals.first().copied();
                let acquired = chained
                    && self
                        .submit_one_off_chained(
                            owner_family,
                            chain_handoff.map(|s| (s, vk::PipelineStageFlags::TOP_OF_PIPE)),
                            0,
                            true,
                            |cb| {
                                cb.image_barrier(
                                    &self.deferred.device,
                                    target,
                                    full_range(aspect_mask, info.mip_levels, info.array_layers),
                                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                                    initial_layout,
                                    vk::PipelineStageFlags::TOP_OF_PIPE,
                                    possible_stages,
                                    vk::AccessFlags::empty(),
                                    possible_access,
                                    graphics_family,
                                    owner_family,
                                );
                            },
                        )
                        .0;
                release(chain_handoff);
                acquired
            }
        };

        unsafe { self.deferred.device.destroy_buffer(staging_raw, None) };
        self.allocator().free_buffer(&self.deferred.device, staging_memory);
        ok
    }

    /// Creates a device-local image. `initial`, when given, is the
    /// tightly-packed base mip level (row-major, no padding) staged via a
    /// transfer-queue copy, a graphics-queue mip chain if
    /// [`ImageMiscFlags::GENERATE_MIPS`] is set,
    /// and whatever queue-family release/acquire barrier pair the sharing
    /// mode and steady-state owner require. Levels beyond the base are left
    /// undefined unless `GENERATE_MIPS` produces them. `None` leaves the
    /// whole image `VK_IMAGE_LAYOUT_UNDEFINED`, same as any other low-level
    /// graphics API -- populating it is then the caller's job, via a
    /// transfer-queue upload recorded on a borrowed command buffer or a
    /// render pass.
    pub fn create_image(&self, info: ImageCreateInfo, initial: Option<&[u8]>) -> Option<Handle<Image>> {
        let (sharing_mode, families) = info.sharing.to_vk();
        let mut create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format.to_vk())
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        use crate::resources::image::ViewFormats;
        if !matches!(info.view_formats, ViewFormats::Identity) {
            create_info = create_info.flags(vk::ImageCreateFlags::MUTABLE_FORMAT);
        }
        let format_list: Vec<vk::Format>;
        let mut format_list_info;
        if let ViewFormats::Custom(formats) = &info.view_formats {
            format_list = formats.iter().map(|f| f.to_vk()).collect();
            format_list_info = vk::ImageFormatListCreateInfo::default().view_formats(&format_list);
            create_info = create_info.push_next(&mut format_list_info);
        }

        let raw = unsafe { self.deferred.device.create_image(&create_info, None) }
            .map_err(|_| DeviceError::AllocationFailed { size: 0 }.log())
            .ok()?;
        let memory = match self
            .allocator()
            .allocate_image(&self.deferred.device, raw, MemoryDomain::Device, false)
        {
            Ok(m) => m,
            Err(_) => {
                unsafe { self.deferred.device.destroy_image(raw, None) };
                return None;
            }
        };
        if let Some(data) = initial {
            if !self.upload_image_initial(raw, &info, data) {
                unsafe { self.deferred.device.destroy_image(raw, None) };
                self.allocator().free_image(&self.deferred.device, memory);
                return None;
            }
        }
        let cookie = self.cookies.next();
        let image = Image::new(cookie, raw, Some(memory), info);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, image, move |image: Image| {
            let (raw, memory) = image.into_raw_parts();
            deferred.push(|lists| lists.images.push((raw, memory)));
        }))
    }

    /// Creates a `LINEAR`-tiled, host-visible image for direct CPU writes
    /// via [`Device::map_linear_host_image`] -- readback targets and tiny
    /// dynamically-updated textures that don't warrant a staging buffer.
    /// Forces `LINEAR` tiling and `PREINITIALIZED` initial layout;
    /// `info.sharing`/`info.misc` are otherwise honored, but `GENERATE_MIPS`
    /// is meaningless here (linear images only support a single mip level
    /// on essentially every driver) and is ignored.
    pub fn create_linear_host_image(&self, mut info: ImageCreateInfo) -> Option<Handle<Image>> {
        info.mip_levels = 1;
        let (sharing_mode, families) = info.sharing.to_vk();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format.to_vk())
            .extent(info.extent)
            .mip_levels(1)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(info.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);
        let raw = unsafe { self.deferred.device.create_image(&create_info, None) }
            .map_err(|_| DeviceError::AllocationFailed { size: 0 }.log())
            .ok()?;
        let memory = match self
            .allocator()
            .allocate_image(&self.deferred.device, raw, MemoryDomain::Host, false)
        {
            Ok(m) => m,
            Err(_) => {
                unsafe { self.deferred.device.destroy_image(raw, None) };
                return None;
            }
        };
        let cookie = self.cookies.next();
        let image = Image::new(cookie, raw, Some(memory), info);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, image, move |image: Image| {
            let (raw, memory) = image.into_raw_parts();
            deferred.push(|lists| lists.images.push((raw, memory)));
        }))
    }

    /// Host pointer into a [`Device::create_linear_host_image`]'s mapped
    /// allocation, at the driver-reported row pitch for `plane` (almost
    /// always `0` for a non-planar format). `None` for an image that isn't
    /// host-visible (i.e. wasn't created by `create_linear_host_image`).
    pub fn map_linear_host_image(&self, image: &Image) -> Option<(std::ptr::NonNull<u8>, vk::SubresourceLayout)> {
        let ptr = image.memory()?.mapped_ptr()?;
        let subresource = vk::ImageSubresource {
            aspect_mask: image.format().to_vk_aspect_mask(),
            mip_level: 0,
            array_layer: 0,
        };
        let layout = unsafe { self.deferred.device.get_image_subresource_layout(image.raw(), subresource) };
        Some((ptr, layout))
    }

    /// Like [`Device::map_linear_host_image`], but first waits for the
    /// device to go idle -- for hosts that write a linear image outside any
    /// frame and need the GPU's last read of it (if any) to have completed
    /// before touching the mapping, without threading a timeline wait
    /// through this call.
    pub fn map_linear_host_image_and_sync(&self, image: &Image) -> Option<(std::ptr::NonNull<u8>, vk::SubresourceLayout)> {
        self.wait_idle();
        self.map_linear_host_image(image)
    }

    pub fn create_sampler(&self, info: SamplerCreateInfo) -> Option<Handle<Sampler>> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode_u)
            .address_mode_v(info.address_mode_v)
            .address_mode_w(info.address_mode_w)
            .mip_lod_bias(info.mip_lod_bias.into_inner())
            .anisotropy_enable(info.anisotropy_enable)
            .max_anisotropy(info.max_anisotropy.into_inner())
            .compare_enable(info.compare_enable)
            .compare_op(info.compare_op)
            .min_lod(info.min_lod.into_inner())
            .max_lod(info.max_lod.into_inner())
            .border_color(info.border_color)
            .unnormalized_coordinates(info.unnormalized_coordinates);
        let raw = unsafe { self.deferred.device.create_sampler(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateSampler failed").log())
            .ok()?;
        let cookie = self.cookies.next();
        let sampler = Sampler::new(cookie, raw, info);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, sampler, move |_s: Sampler| {
            deferred.push(|lists| lists.samplers.push(raw));
        }))
    }

    pub fn create_image_view(&self, image: Handle<Image>, info: ImageViewCreateInfo) -> Option<Handle<ImageView>> {
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: image.format().to_vk_aspect_mask(),
            base_mip_level: info.base_mip_level,
            level_count: info.mip_level_count,
            base_array_layer: info.base_array_layer,
            layer_count: info.array_layer_count,
        };
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image.raw())
            .view_type(info.view_type)
            .format(image.format().to_vk())
            .subresource_range(subresource_range);
        let raw = unsafe { self.deferred.device.create_image_view(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFormat(image.format()).log())
            .ok()?;
        let cookie = self.cookies.next();
        let view = ImageView::new(cookie, image, info, raw);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, view, move |view: ImageView| {
            let views = view.all_views();
            deferred.push(|lists| lists.image_views.extend(views));
        }))
    }

    /// Lazily builds (and memoizes on the view itself) the `VkImageView`
    /// variant requested by `kind` -- used when the command buffer recorder
    /// needs, say, a depth-only view of a combined depth/stencil image that
    /// nobody asked for at creation time. Falls back to the default view on
    /// a driver failure rather than returning `None`, since a caller
    /// already holds a live `ImageView` and a null `vk::ImageView` would be
    /// a worse failure mode than briefly binding the wrong aspect.
    pub fn image_view_variant(&self, view: &mut ImageView, kind: ViewKind) -> vk::ImageView {
        if let Some(existing) = view.existing_view(kind) {
            return existing;
        }
        let format = view.image().format();
        let aspect = view.aspect_mask_for(kind, format);
        let mut vk_aspect = vk::ImageAspectFlags::empty();
        if aspect.contains(crate::format::ImageAspectFlags::COLOR) {
            vk_aspect |= vk::ImageAspectFlags::COLOR;
        }
        if aspect.contains(crate::format::ImageAspectFlags::DEPTH) {
            vk_aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if aspect.contains(crate::format::ImageAspectFlags::STENCIL) {
            vk_aspect |= vk::ImageAspectFlags::STENCIL;
        }
        let reinterpret_format = match kind {
            ViewKind::UnormReinterpret | ViewKind::SrgbReinterpret => {
                format.srgb_counterpart().unwrap_or(format).to_vk()
            }
            _ => format.to_vk(),
        };
        let (base_layer, layer_count) = match kind {
            ViewKind::RenderTargetLayer(layer) => (layer, 1),
            _ => (view.base_array_layer(), view.array_layer_count()),
        };
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk_aspect,
            base_mip_level: view.base_mip_level(),
            level_count: view.mip_level_count(),
            base_array_layer: base_layer,
            layer_count,
        };
        let create_info = vk::ImageViewCreateInfo::default()
            .image(view.image().raw())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(reinterpret_format)
            .subresource_range(subresource_range);
        let raw = match unsafe { self.deferred.device.create_image_view(&create_info, None) } {
            Ok(v) => v,
            Err(_) => {
                DeviceError::UnsupportedFormat(format).log();
                return view.default_view();
            }
        };
        view.store_view(kind, raw);
        raw
    }

    pub fn create_buffer_view(
        &self,
        buffer: Handle<Buffer>,
        format: Format,
        offset: u64,
        range: u64,
    ) -> Option<Handle<BufferView>> {
        let create_info = vk::BufferViewCreateInfo::default()
            .buffer(buffer.raw())
            .format(format.to_vk())
            .offset(offset)
            .range(range);
        let raw = unsafe { self.deferred.device.create_buffer_view(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFormat(format).log())
            .ok()?;
        let cookie = self.cookies.next();
        let view = BufferView::new(cookie, buffer, raw, format, offset, range);
        let deferred = self.deferred.clone();
        Some(Handle::new(cookie, view, move |_v: BufferView| {
            deferred.push(|lists| lists.buffer_views.push(raw));
        }))
    }

    // ---- render pass / framebuffer synthesis --------------------------------

    /// Turns a [`DerivedRenderPass`] into a real `VkRenderPass`. Each
    /// subpass's attachment reference lists are built here (rather than in
    /// `render_pass::derive`) because `vk::SubpassDescription` borrows them
    /// and `derive` only produces the index lists, not the native structs.
    fn build_render_pass(&self, derived: &DerivedRenderPass) -> vk::RenderPass {
        struct SubpassRefs {
            color: Vec<vk::AttachmentReference>,
            resolve: Vec<vk::AttachmentReference>,
            input: Vec<vk::AttachmentReference>,
            depth_stencil: Option<vk::AttachmentReference>,
        }

        let current_layout = |attachment: u32| -> vk::ImageLayout { derived.attachments[attachment as usize].final_layout };

        let refs: Vec<SubpassRefs> = derived
            .subpasses
            .iter()
            .map(|subpass| SubpassRefs {
                color: subpass
                    .color_attachments
                    .iter()
                    .map(|&a| vk::AttachmentReference {
                        attachment: a,
                        layout: current_layout(a),
                    })
                    .collect(),
                resolve: subpass
                    .resolve_attachments
                    .iter()
                    .map(|&a| vk::AttachmentReference {
                        attachment: a,
                        layout: current_layout(a),
                    })
                    .collect(),
                input: subpass
                    .input_attachments
                    .iter()
                    .map(|&a| vk::AttachmentReference {
                        attachment: a,
                        layout: current_layout(a),
                    })
                    .collect(),
                depth_stencil: subpass.depth_stencil_attachment.map(|a| vk::AttachmentReference {
                    attachment: a,
                    layout: current_layout(a),
                }),
            })
            .collect();

        let subpass_descriptions: Vec<vk::SubpassDescription> = refs
            .iter()
            .map(|r| {
                let mut desc = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&r.color)
                    .input_attachments(&r.input);
                if !r.resolve.is_empty() {
                    desc = desc.resolve_attachments(&r.resolve);
                }
                if let Some(ds) = &r.depth_stencil {
                    desc = desc.depth_stencil_attachment(ds);
                }
                desc
            })
            .collect();

        let mut create_info = vk::RenderPassCreateInfo::default()
            .attachments(&derived.attachments)
            .subpasses(&subpass_descriptions)
            .dependencies(&derived.dependencies);

        let view_masks: SmallVec<[u32; 4]>;
        let mut multiview_info;
        if derived.multiview_mask != 0 {
            view_masks = derived.subpasses.iter().map(|_| derived.multiview_mask).collect();
            multiview_info = vk::RenderPassMultiviewCreateInfo::default()
                .view_masks(&view_masks)
                .correlation_masks(std::slice::from_ref(&derived.multiview_mask));
            create_info = create_info.push_next(&mut multiview_info);
        }

        unsafe { self.deferred.device.create_render_pass(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateRenderPass failed").log())
            .unwrap_or(vk::RenderPass::null())
    }

    fn build_framebuffer(&self, render_pass: vk::RenderPass, attachments: &[vk::ImageView], extent: vk::Extent2D, layers: u32) -> vk::Framebuffer {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);
        unsafe { self.deferred.device.create_framebuffer(&create_info, None) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkCreateFramebuffer failed").log())
            .unwrap_or(vk::Framebuffer::null())
    }

    /// Drives `CommandBuffer::begin_render_pass`, supplying the
    /// `build_render_pass`/`build_framebuffer` closures from this device's
    /// caches. `layers` matches `info.num_layers`.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_render_pass(
        &self,
        cb: &mut CommandBuffer,
        info: &RenderPassInfo,
        view_cookies: &[Cookie],
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let mut caches = self.caches.lock().unwrap();
        let Caches {
            render_pass: render_pass_cache,
            framebuffer: framebuffer_cache,
            ..
        } = &mut *caches;
        let derived = render_pass::derive(info);
        let layers = info.num_layers.max(1);
        cb.begin_render_pass(
            &self.deferred.device,
            render_pass_cache,
            framebuffer_cache,
            info,
            view_cookies,
            attachments,
            extent,
            clear_values,
            contents,
            || self.build_render_pass(&derived),
            |rp| self.build_framebuffer(rp, attachments, extent, layers),
        );
    }

    /// Returns (and lazily builds) the `VkRenderPass` a single-color
    /// (plus optional depth/stencil) swapchain-style render pass hashes to,
    /// so hosts rendering directly to the swapchain don't need to assemble
    /// a full [`RenderPassInfo`] themselves every frame.
    pub fn get_swapchain_render_pass(&self, color_format: Format, depth_format: Option<Format>, samples: vk::SampleCountFlags) -> vk::RenderPass {
        let mut color = SmallVec::new();
        color.push(render_pass::ColorAttachment {
            format: color_format,
            samples,
            transient: false,
            swapchain: true,
        });
        let depth_stencil = depth_format.map(|format| render_pass::DepthStencilAttachment {
            format,
            samples,
            transient: false,
            read_only: false,
        });
        let attachment_count = 1 + depth_stencil.is_some() as u32;
        let info = RenderPassInfo {
            color,
            depth_stencil,
            clear_mask: (1 << attachment_count) - 1,
            load_mask: 0,
            store_mask: 1,
            multiview_mask: 0,
            base_layer: 0,
            num_layers: 1,
            subpasses: SmallVec::new(),
        };

        let full_hash = render_pass::hash(&info, HashMode::Full);
        let mut caches = self.caches.lock().unwrap();
        if let Some(rp) = caches.render_pass.get(full_hash) {
            return rp;
        }
        let derived = render_pass::derive(&info);
        let rp = self.build_render_pass(&derived);
        caches.render_pass.insert(full_hash, rp);
        rp
    }

    // ---- transient attachments ------------------------------------------------

    /// Checks out a transient (render-pass-scoped) backing image matching
    /// `shape`, recycling one from the pool when a same-shaped slot is free.
    pub fn get_transient_attachment(&self, shape: AttachmentShape) -> Option<(Cookie, vk::Image)> {
        let mut caches = self.caches.lock().unwrap();
        let cookie = caches
            .attachment
            .acquire(&self.deferred.device, &self.deferred.allocator, shape)
            .ok()?;
        let raw = caches.attachment.get(shape, cookie)?.raw();
        Some((cookie, raw))
    }

    // ---- swapchain -------------------------------------------------------------

    /// Creates (or recreates, handing the old handle to the driver for a
    /// flicker-free transition) the swapchain, and builds a default 2D
    /// color view for every presentable image.
    #[allow(clippy::too_many_arguments)]
    pub fn init_swapchain(
        &self,
        surface: vk::SurfaceKHR,
        format: Format,
        color_space: vk::ColorSpaceKHR,
        extent: vk::Extent2D,
        image_count: u32,
        present_mode: vk::PresentModeKHR,
        pre_transform: vk::SurfaceTransformFlagsKHR,
        composite_alpha: vk::CompositeAlphaFlagsKHR,
    ) -> bool {
        let mut slot = self.swapchain.lock().unwrap();
        let old_raw = slot.as_ref().map(|s| s.raw()).unwrap_or(vk::SwapchainKHR::null());
        let new_swapchain = match Swapchain::create(
            &self.instance,
            &self.deferred.device,
            surface,
            format,
            color_space,
            extent,
            image_count,
            present_mode,
            pre_transform,
            composite_alpha,
            old_raw,
            &self.cookies,
        ) {
            Ok(s) => s,
            Err(_) => return false,
        };

        let mut old_views = self.swapchain_views.lock().unwrap();
        for view in old_views.drain(..) {
            unsafe { self.deferred.device.destroy_image_view(view, None) };
        }
        for index in 0..new_swapchain.image_count() {
            let image = new_swapchain.image(index);
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image.raw())
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.to_vk())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { self.deferred.device.create_image_view(&create_info, None) } {
                Ok(view) => old_views.push(view),
                Err(_) => {
                    DeviceError::UnsupportedFormat(format).log();
                    return false;
                }
            }
        }
        drop(old_views);

        if let Some(mut old) = slot.take() {
            old.destroy(&self.deferred.device);
        }
        *slot = Some(new_swapchain);
        true
    }

    /// Wraps a swapchain this process does not own the lifetime of --
    /// compositor- or XR-runtime-vended -- skipping `vkCreateSwapchainKHR`
    /// entirely. The caller remains responsible for destroying `raw` once
    /// this device is done with it; `init_swapchain`'s own destroy path is
    /// never invoked for a swapchain installed this way.
    pub fn init_external_swapchain(&self, raw: vk::SwapchainKHR, images: &[vk::Image], format: Format, extent: vk::Extent2D) -> bool {
        let loader = ash::khr::swapchain::Device::new(&self.instance, &self.deferred.device);
        let wrapped = Swapchain::from_external(loader, raw, images, format, extent, &self.cookies);

        let mut old_views = self.swapchain_views.lock().unwrap();
        for view in old_views.drain(..) {
            unsafe { self.deferred.device.destroy_image_view(view, None) };
        }
        for &image in images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.to_vk())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { self.deferred.device.create_image_view(&create_info, None) } {
                Ok(view) => old_views.push(view),
                Err(_) => {
                    DeviceError::UnsupportedFormat(format).log();
                    return false;
                }
            }
        }
        drop(old_views);

        *self.swapchain.lock().unwrap() = Some(wrapped);
        true
    }

    pub fn get_swapchain_view(&self, index: u32) -> Option<vk::ImageView> {
        self.swapchain_views.lock().unwrap().get(index as usize).copied()
    }

    pub fn swapchain_format(&self) -> Option<Format> {
        self.swapchain.lock().unwrap().as_ref().map(|s| s.format())
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.lock().unwrap().as_ref().map(|s| s.extent())
    }

    pub fn acquire_next_image(&self, acquire_semaphore: vk::Semaphore, timeout_ns: u64) -> Option<u32> {
        self.swapchain
            .lock()
            .unwrap()
            .as_mut()?
            .acquire_next_image(acquire_semaphore, timeout_ns)
    }

    /// Presents the currently acquired swapchain image on the graphics
    /// queue, honoring `set_queue_lock` if the host registered one.
    pub fn present(&self, wait_semaphore: vk::Semaphore) -> bool {
        let queue = {
            let queues = self.queues.lock().unwrap();
            queues[GRAPHICS].raw_queue()
        };
        let external = self.external_queue_lock.lock().unwrap().clone();
        let _guard = external.as_ref().map(|l| l.lock().unwrap_or_else(|e| e.into_inner()));
        let mut slot = self.swapchain.lock().unwrap();
        match slot.as_mut() {
            Some(s) => s.present(queue, wait_semaphore),
            None => false,
        }
    }

    /// Registers an external lock this device's own `vkQueueSubmit`/
    /// `vkQueuePresentKHR` calls on the graphics queue acquire before
    /// issuing, for hosts that share the same `VkQueue` with another API.
    /// Pass `None` to go back to no external synchronization.
    pub fn set_queue_lock(&self, lock: Option<Arc<Mutex<()>>>) {
        *self.external_queue_lock.lock().unwrap() = lock;
    }

    // ---- format queries --------------------------------------------------------

    fn format_supports_optimal(&self, format: Format, features: vk::FormatFeatureFlags) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device.physical_device, format.to_vk())
        };
        props.optimal_tiling_features.contains(features)
    }

    pub fn image_format_is_supported(&self, format: Format, usage: vk::ImageUsageFlags) -> bool {
        let mut features = vk::FormatFeatureFlags::empty();
        if usage.contains(vk::ImageUsageFlags::SAMPLED) {
            features |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
        }
        if usage.contains(vk::ImageUsageFlags::STORAGE) {
            features |= vk::FormatFeatureFlags::STORAGE_IMAGE;
        }
        if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
        }
        if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            features |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        self.format_supports_optimal(format, features)
    }

    /// First depth-only format (smallest first) this device supports as a
    /// depth/stencil attachment.
    pub fn get_default_depth_format(&self) -> Option<Format> {
        DEFAULT_DEPTH_CANDIDATES
            .iter()
            .copied()
            .find(|&f| self.format_supports_optimal(f, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
    }

    /// First combined depth/stencil format this device supports.
    pub fn get_default_depth_stencil_format(&self) -> Option<Format> {
        DEFAULT_DEPTH_STENCIL_CANDIDATES
            .iter()
            .copied()
            .find(|&f| self.format_supports_optimal(f, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
    }

    // ---- host mapping --------------------------------------------------------

    pub fn map_host_buffer(&self, buffer: &Buffer) -> Option<std::ptr::NonNull<u8>> {
        buffer.host_pointer()
    }

    // ---- command buffer requests --------------------------------------------

    pub fn request_command_buffer_for_thread(&self, thread_index: usize, queue_family: u32) -> Option<CommandBuffer> {
        if thread_index >= self.thread_count {
            DeviceError::UnsupportedFeature("thread index out of range").log();
            return None;
        }
        let mut contexts = self.deferred.frame_contexts.lock().unwrap();
        if contexts.is_empty() {
            contexts.push(FrameContext::default());
        }
        let slot_index = (self.deferred.current_frame.load(Ordering::SeqCst) as usize) % contexts.len();
        let pool = contexts[slot_index].command_pool(&self.deferred.device, thread_index, queue_family);
        drop(contexts);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.deferred.device.allocate_command_buffers(&alloc_info) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkAllocateCommandBuffers failed").log())
            .ok()?;
        let raw = buffers[0];
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.deferred.device.begin_command_buffer(raw, &begin_info) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkBeginCommandBuffer failed").log())
            .ok()?;

        let ubo_spill_size = self.physical_device.min_uniform_buffer_offset_alignment().max(256);
        self.mark_command_buffer_outstanding();
        Some(CommandBuffer::new(raw, thread_index, queue_family, false, ubo_spill_size))
    }

    pub fn request_command_buffer(&self, queue_family: u32) -> Option<CommandBuffer> {
        self.request_command_buffer_for_thread(0, queue_family)
    }

    pub fn add_wait_semaphore(&self, queue_family: u32, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags, value: Option<u64>) {
        let idx = self.queue_index_for_family(queue_family);
        let mut queues = self.queues.lock().unwrap();
        queues[idx].add_wait_semaphore(semaphore, stage, value);
    }

    // ---- descriptor flush -----------------------------------------------------

    /// Drives the two-phase descriptor flush for `cb` against `program`:
    /// allocates or reuses a cached descriptor set for every dirty set,
    /// issues `vkUpdateDescriptorSets` only on a fresh allocation, and
    /// records the dynamic offsets that belong with each dirty set. Returns
    /// `(set, descriptor_set, dynamic_offsets)` triples ready for
    /// `vkCmdBindDescriptorSets`; batching contiguous sets into one call is
    /// left to the caller.
    pub fn flush_descriptor_sets(&self, cb: &mut CommandBuffer, program: &Program) -> Vec<(u32, vk::DescriptorSet, Vec<u32>)> {
        let (set_update_mask, dynamic_update_mask) = cb.take_descriptor_dirty_masks(program.layout().descriptor_set_mask);
        let mut binds = Vec::new();
        let descriptor_set_layouts = program.descriptor_set_layouts();
        let mut layout_index = 0usize;

        let mut caches = self.caches.lock().unwrap();

        for set in 0..MAX_DESCRIPTOR_SETS as u32 {
            if program.layout().descriptor_set_mask & (1 << set) == 0 {
                continue;
            }
            let vk_layout = descriptor_set_layouts[layout_index];
            layout_index += 1;

            let needs_set_update = set_update_mask & (1 << set) != 0;
            let needs_dynamic_only = dynamic_update_mask & (1 << set) != 0;
            if !needs_set_update && !needs_dynamic_only {
                continue;
            }

            let bindless = program.layout().bindless_set_mask & (1 << set) != 0;
            let stage_visibility = program.layout().stage_visibility[set as usize];
            let layout_ref = program.layout();
            let allocator = caches
                .descriptor_sets
                .get_or_create(vk_layout, stage_visibility, || pool_sizes_for_set(layout_ref, set as usize), bindless);

            let fingerprint = cb.set_fingerprint_for_flush(set);
            let (descriptor_set, is_fresh) = allocator.get_or_allocate(&self.deferred.device, fingerprint);

            if is_fresh {
                self.write_descriptor_set(descriptor_set, set, &program.layout().combined[set as usize], cb);
            }
            cb.record_allocated_set(set, descriptor_set);

            let dynamic_mask = program.layout().combined[set as usize].uniform_buffer_mask;
            let offsets = cb.dynamic_offsets(set, dynamic_mask).into_vec();
            binds.push((set, descriptor_set, offsets));
        }

        binds
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, set_index: u32, layout: &crate::shader::SetLayout, cb: &CommandBuffer) {
        let used = layout.any_used_mask();
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        let mut writes: Vec<(u32, vk::DescriptorType, Option<usize>, Option<usize>)> = Vec::new();

        for binding in 0..crate::shader::MAX_BINDINGS_PER_SET as u32 {
            if used & (1 << binding) == 0 {
                continue;
            }
            match cb.raw_binding(set_index, binding) {
                RawBinding::None => continue,
                RawBinding::Buffer(info, ty) => {
                    buffer_infos.push(info);
                    writes.push((binding, ty, Some(buffer_infos.len() - 1), None));
                }
                RawBinding::Image(info, ty) => {
                    image_infos.push(info);
                    writes.push((binding, ty, None, Some(image_infos.len() - 1)));
                }
            }
        }

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|&(binding, ty, buf_idx, img_idx)| {
                let mut write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1);
                if let Some(i) = buf_idx {
                    write = write.buffer_info(std::slice::from_ref(&buffer_infos[i]));
                }
                if let Some(i) = img_idx {
                    write = write.image_info(std::slice::from_ref(&image_infos[i]));
                }
                write
            })
            .collect();

        if !descriptor_writes.is_empty() {
            unsafe { self.deferred.device.update_descriptor_sets(&descriptor_writes, &[]) };
        }
    }

    // ---- submission -----------------------------------------------------------

    /// Ends recording on `cb` and batches it onto the queue matching
    /// `queue_family`. `touches_swapchain` feeds the WSI acquire/release
    /// bookkeeping in [`crate::queue`].
    pub fn submit(&self, cb: CommandBuffer, queue_family: u32, touches_swapchain: bool) -> bool {
        let ended = unsafe { self.deferred.device.end_command_buffer(cb.raw()) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkEndCommandBuffer failed").log())
            .is_ok();
        self.mark_command_buffer_submitted();
        if !ended {
            return false;
        }
        let idx = self.queue_index_for_family(queue_family);
        let mut queues = self.queues.lock().unwrap();
        queues[idx].push_command_buffer(cb.raw(), touches_swapchain);
        true
    }

    /// Flushes every queue, transfer first, per the 7-step submission
    /// procedure, and records the resulting fence/timeline watermarks
    /// against the active frame context so `next_frame_context` knows what
    /// to wait on before this ring slot is reused. A queue with nothing
    /// recorded still submits an empty batch; `vkQueueSubmit` with zero
    /// command buffers is well-defined and keeps this path simple.
    pub fn flush_frame(&self, wsi_acquire: Option<vk::Semaphore>) -> bool {
        let mut caches = self.caches.lock().unwrap();
        let fence = caches.fences.acquire(&self.deferred.device);
        let mut queues = self.queues.lock().unwrap();

        if let Some(acquire) = wsi_acquire {
            queues[GRAPHICS].set_wsi_acquire(acquire);
        }

        let mut ok = true;
        ok &= queues[TRANSFER]
            .submit(&self.deferred.device, &mut caches.semaphores, vk::Fence::null(), |pool, dev| pool.acquire(dev))
            .is_ok();
        ok &= queues[COMPUTE]
            .submit(&self.deferred.device, &mut caches.semaphores, vk::Fence::null(), |pool, dev| pool.acquire(dev))
            .is_ok();
        ok &= queues[GRAPHICS]
            .submit(&self.deferred.device, &mut caches.semaphores, fence, |pool, dev| pool.acquire(dev))
            .is_ok();

        let watermarks = [
            (GRAPHICS, queues[GRAPHICS].frame_watermark()),
            (COMPUTE, queues[COMPUTE].frame_watermark()),
            (TRANSFER, queues[TRANSFER].frame_watermark()),
        ];

        let mut contexts = self.deferred.frame_contexts.lock().unwrap();
        if !contexts.is_empty() {
            let idx = (self.deferred.current_frame.load(Ordering::SeqCst) as usize) % contexts.len();
            contexts[idx].fence = Some(fence);
            contexts[idx].wait_values = watermarks.to_vec();
        }

        ok
    }

    /// Submits an empty batch on `queue_family`, carrying only whatever
    /// explicit wait/signal semaphores have been queued via
    /// `add_wait_semaphore` -- used to insert a cross-queue ownership
    /// handoff with no actual work attached.
    pub fn submit_empty(&self, queue_family: u32) -> bool {
        let idx = self.queue_index_for_family(queue_family);
        let mut caches = self.caches.lock().unwrap();
        let mut queues = self.queues.lock().unwrap();
        queues[idx]
            .submit(&self.deferred.device, &mut caches.semaphores, vk::Fence::null(), |pool, dev| pool.acquire(dev))
            .is_ok()
    }

    // ---- pipeline cache ------------------------------------------------------

    /// Initializes the pipeline cache from a previously saved blob, but
    /// only if its header's device UUID matches this device's -- a blob
    /// from a different GPU/driver is otherwise silently discarded rather
    /// than rejected outright, matching `VkPipelineCacheCreateInfo`'s own
    /// "garbage initial data is a cache miss, not an error" contract.
    pub fn init_pipeline_cache(&self, data: Option<&[u8]>) -> bool {
        let valid_uuid = data
            .map(|d| d.len() > 16 && d[..16] == self.physical_device.pipeline_cache_uuid())
            .unwrap_or(false);
        let initial_data: &[u8] = if valid_uuid { data.unwrap() } else { &[] };
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        let cache = match unsafe { self.deferred.device.create_pipeline_cache(&create_info, None) } {
            Ok(c) => c,
            Err(_) => {
                DeviceError::UnsupportedFeature("vkCreatePipelineCache failed").log();
                return false;
            }
        };
        let mut slot = self.pipeline_cache.lock().unwrap();
        if *slot != vk::PipelineCache::null() {
            unsafe { self.deferred.device.destroy_pipeline_cache(*slot, None) };
        }
        *slot = cache;
        true
    }

    pub fn get_pipeline_cache_data(&self) -> Option<Vec<u8>> {
        let slot = self.pipeline_cache.lock().unwrap();
        unsafe { self.deferred.device.get_pipeline_cache_data(*slot) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkGetPipelineCacheData failed").log())
            .ok()
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        *self.pipeline_cache.lock().unwrap()
    }

    // ---- secondary command buffers ---------------------------------------------

    /// Allocates a secondary command buffer inheriting `primary`'s active
    /// render pass, so recording can fan out across threads within one
    /// subpass. `primary` must currently be inside a render pass begun with
    /// `VK_SUBPASS_CONTENTS_SECONDARY_COMMAND_BUFFERS`.
    pub fn request_secondary(&self, thread_index: usize, primary: &CommandBuffer) -> Option<CommandBuffer> {
        let (render_pass, subpass, _) = primary.active_render_pass_info()?;
        if thread_index >= self.thread_count {
            DeviceError::UnsupportedFeature("thread index out of range").log();
            return None;
        }
        let mut contexts = self.deferred.frame_contexts.lock().unwrap();
        if contexts.is_empty() {
            contexts.push(FrameContext::default());
        }
        let slot_index = (self.deferred.current_frame.load(Ordering::SeqCst) as usize) % contexts.len();
        let pool = contexts[slot_index].command_pool(&self.deferred.device, thread_index, primary.queue_family());
        drop(contexts);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.deferred.device.allocate_command_buffers(&alloc_info) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkAllocateCommandBuffers failed").log())
            .ok()?;
        let raw = buffers[0];

        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(render_pass)
            .subpass(subpass);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .inheritance_info(&inheritance);
        unsafe { self.deferred.device.begin_command_buffer(raw, &begin_info) }
            .map_err(|_| DeviceError::UnsupportedFeature("vkBeginCommandBuffer failed").log())
            .ok()?;

        let ubo_spill_size = self.physical_device.min_uniform_buffer_offset_alignment().max(256);
        Some(CommandBuffer::new(raw, thread_index, primary.queue_family(), true, ubo_spill_size))
    }

    /// Records `secondaries`' command buffers into `primary` via
    /// `vkCmdExecuteCommands`. Each must have been produced by
    /// `request_secondary` against `primary` and already ended.
    pub fn execute_secondaries(&self, primary: &CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.deferred.device.cmd_execute_commands(primary.raw(), secondaries) };
    }

    // ---- pipeline build / state flush -------------------------------------------

    /// Assembles and creates the `VkPipeline` for `cb`'s current static
    /// state against `program`, inside the render pass/subpass `cb` is
    /// currently recording. Only ever called from behind
    /// `Program::get_or_build_pipeline`'s memoization lock (via
    /// `CommandBuffer::get_or_build_pipeline`), so a cache hit never reaches
    /// here.
    fn build_graphics_pipeline(&self, program: &Program, cb: &CommandBuffer, render_pass: vk::RenderPass, subpass: u32, color_count: u32) -> vk::Pipeline {
        let state = cb.pipeline_state();

        let mut stage_entries: SmallVec<[(vk::ShaderStageFlags, vk::ShaderModule); 6]> = SmallVec::new();
        for (&stage, shader) in program.shaders() {
            stage_entries.push((stage, shader.raw()));
        }
        let mut spec_entries: Vec<vk::SpecializationMapEntry> = Vec::new();
        let spec_data = cb.spec_constants();
        for (i, _) in spec_data.iter().enumerate() {
            spec_entries.push(vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * 4) as u32,
                size: 4,
            });
        }
        let spec_bytes: &[u8] = bytemuck_cast_u32_slice(spec_data);
        let spec_info = vk::SpecializationInfo::default().map_entries(&spec_entries).data(spec_bytes);

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_entries
            .iter()
            .map(|&(stage, module)| {
                let mut info = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(SHADER_ENTRY_POINT);
                if !spec_entries.is_empty() {
                    info = info.specialization_info(&spec_info);
                }
                info
            })
            .collect();

        let (bindings, attributes) = cb.vertex_input_state();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.topology)
            .primitive_restart_enable(state.primitive_restart_enable);

        let viewports = [cb.viewport()];
        let scissors = [cb.scissor()];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .depth_bias_enable(state.depth_bias_enable)
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(state.sample_shading_enable)
            .alpha_to_coverage_enable(state.alpha_to_coverage_enable)
            .alpha_to_one_enable(state.alpha_to_one_enable);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test_enable)
            .depth_write_enable(state.depth_write_enable)
            .depth_compare_op(state.depth_compare_op)
            .stencil_test_enable(state.stencil_test_enable)
            .front(state.stencil_front)
            .back(state.stencil_back);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..color_count)
            .map(|i| {
                let enable = state.blend_enable_mask & (1 << i) != 0;
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(enable)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::DEPTH_BIAS,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(program.pipeline_layout())
            .render_pass(render_pass)
            .subpass(subpass);

        let cache = *self.pipeline_cache.lock().unwrap();
        let pipelines = unsafe {
            self.deferred
                .device
                .create_graphics_pipelines(cache, &[create_info], None)
        }
        .map_err(|(_, _)| DeviceError::UnsupportedFeature("vkCreateGraphicsPipelines failed").log());
        match pipelines {
            Ok(p) => p[0],
            Err(_) => vk::Pipeline::null(),
        }
    }

    fn build_compute_pipeline(&self, program: &Program) -> vk::Pipeline {
        let Some(shader) = program.shader(vk::ShaderStageFlags::COMPUTE) else {
            DeviceError::UnsupportedFeature("compute pipeline requested from a program with no compute stage").log();
            return vk::Pipeline::null();
        };
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.raw())
            .name(SHADER_ENTRY_POINT);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(program.pipeline_layout());
        let cache = *self.pipeline_cache.lock().unwrap();
        let pipelines = unsafe {
            self.deferred
                .device
                .create_compute_pipelines(cache, &[create_info], None)
        }
        .map_err(|(_, _)| DeviceError::UnsupportedFeature("vkCreateComputePipelines failed").log());
        match pipelines {
            Ok(p) => p[0],
            Err(_) => vk::Pipeline::null(),
        }
    }

    /// Drives the full per-draw flush: descriptor sets, pipeline
    /// build-or-reuse, and every dynamic-state `vkCmd*` the dirty mask
    /// still owes since the last flush. Must be called with `cb` inside an
    /// active render pass and a program already bound via
    /// `CommandBuffer::set_program`.
    pub fn flush_render_state(&self, cb: &mut CommandBuffer, program: &Handle<Program>) -> bool {
        let Some((render_pass, subpass, color_count)) = cb.active_render_pass_info() else {
            DeviceError::UnsupportedFeature("flush_render_state outside a render pass").log();
            return false;
        };
        let compatible_hash = cb.current_render_pass_hash().unwrap_or(0);

        let binds = self.flush_descriptor_sets(cb, program);
        self.bind_contiguous_descriptor_sets(cb, program.pipeline_layout(), vk::PipelineBindPoint::GRAPHICS, &binds);

        if cb.dirty().contains(crate::command_buffer::DirtyFlags::PIPELINE) {
            let pipeline = cb.get_or_build_pipeline(program, compatible_hash, subpass, || {
                self.build_graphics_pipeline(program, cb, render_pass, subpass, color_count)
            });
            unsafe {
                self.deferred
                    .device
                    .cmd_bind_pipeline(cb.raw(), vk::PipelineBindPoint::GRAPHICS, pipeline)
            };
        }

        self.flush_dynamic_state(cb, program.pipeline_layout());
        true
    }

    /// Compute analogue of `flush_render_state`: no render pass, no vertex
    /// layout, no dynamic viewport/scissor/depth-bias/stencil state -- just
    /// descriptor sets, pipeline, and push constants.
    pub fn flush_compute_state(&self, cb: &mut CommandBuffer, program: &Handle<Program>) -> bool {
        let binds = self.flush_descriptor_sets(cb, program);
        self.bind_contiguous_descriptor_sets(cb, program.pipeline_layout(), vk::PipelineBindPoint::COMPUTE, &binds);

        if cb.dirty().contains(crate::command_buffer::DirtyFlags::PIPELINE) {
            let pipeline = cb.get_or_build_pipeline(program, 0, 0, || self.build_compute_pipeline(program));
            unsafe {
                self.deferred
                    .device
                    .cmd_bind_pipeline(cb.raw(), vk::PipelineBindPoint::COMPUTE, pipeline)
            };
        }

        if cb.dirty().contains(crate::command_buffer::DirtyFlags::PUSH_CONSTANTS) {
            let data = cb.push_constants();
            if !data.is_empty() {
                unsafe {
                    self.deferred.device.cmd_push_constants(
                        cb.raw(),
                        program.pipeline_layout(),
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        data,
                    )
                };
            }
        }
        cb.clear_dirty(
            crate::command_buffer::DirtyFlags::PIPELINE | crate::command_buffer::DirtyFlags::PUSH_CONSTANTS,
        );
        true
    }

    fn bind_contiguous_descriptor_sets(
        &self,
        cb: &CommandBuffer,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        binds: &[(u32, vk::DescriptorSet, Vec<u32>)],
    ) {
        let mut i = 0;
        while i < binds.len() {
            let start_set = binds[i].0;
            let mut sets = vec![binds[i].1];
            let mut offsets = binds[i].2.clone();
            let mut j = i + 1;
            while j < binds.len() && binds[j].0 == binds[j - 1].0 + 1 {
                sets.push(binds[j].1);
                offsets.extend(binds[j].2.iter().copied());
                j += 1;
            }
            unsafe {
                self.deferred
                    .device
                    .cmd_bind_descriptor_sets(cb.raw(), bind_point, layout, start_set, &sets, &offsets)
            };
            i = j;
        }
    }

    fn flush_dynamic_state(&self, cb: &mut CommandBuffer, pipeline_layout: vk::PipelineLayout) {
        use crate::command_buffer::DirtyFlags;
        if cb.dirty().contains(DirtyFlags::VIEWPORT) {
            unsafe { self.deferred.device.cmd_set_viewport(cb.raw(), 0, &[cb.viewport()]) };
        }
        if cb.dirty().contains(DirtyFlags::SCISSOR) {
            unsafe { self.deferred.device.cmd_set_scissor(cb.raw(), 0, &[cb.scissor()]) };
        }
        if cb.dirty().contains(DirtyFlags::DEPTH_BIAS) {
            let (constant, clamp, slope) = cb.depth_bias();
            unsafe { self.deferred.device.cmd_set_depth_bias(cb.raw(), constant, clamp, slope) };
        }
        if cb.dirty().contains(DirtyFlags::STENCIL_REFERENCE) {
            let reference = cb.stencil_reference();
            unsafe {
                self.deferred
                    .device
                    .cmd_set_stencil_reference(cb.raw(), vk::StencilFaceFlags::FRONT_AND_BACK, reference)
            };
        }
        if cb.dirty().contains(DirtyFlags::PUSH_CONSTANTS) {
            let data = cb.push_constants();
            if !data.is_empty() {
                unsafe {
                    self.deferred.device.cmd_push_constants(
                        cb.raw(),
                        pipeline_layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        data,
                    )
                };
            }
        }
        cb.clear_dirty(
            DirtyFlags::VIEWPORT
                | DirtyFlags::SCISSOR
                | DirtyFlags::DEPTH_BIAS
                | DirtyFlags::STENCIL_REFERENCE
                | DirtyFlags::PIPELINE
                | DirtyFlags::PUSH_CONSTANTS
                | DirtyFlags::STATIC_STATE
                | DirtyFlags::STATIC_VERTEX_LAYOUT,
        );
    }

    // ---- internal one-off submission --------------------------------------------

    /// Records and immediately submits-and-waits a short command buffer on
    /// `queue_family` -- staging copies, ownership barriers, mip blits, with
    /// no cross-queue handoff. A thin call-site convenience over
    /// `submit_one_off_chained` for the single-hop uploads (same-queue
    /// EXCLUSIVE, or a `CONCURRENT` copy with no further hop of our own).
    fn submit_one_off(&self, queue_family: u32, record: impl FnOnce(&mut CommandBuffer)) -> bool {
        self.submit_one_off_chained(queue_family, None, 0, true, record).0
    }

    /// One hop of a cross-queue upload chain (component L: transfer copy,
    /// queue-family release/acquire barriers, graphics-queue mip chain).
    ///
    /// If `wait_on` names a semaphore, this hop's submission waits on it at
    /// the given stage before running -- the handoff from whatever earlier
    /// hop produced it. If `signal_count` is nonzero, that many binary
    /// semaphores are acquired from the pool, wired onto this submission via
    /// [`crate::queue::QueueState::add_signal_semaphore`], and returned so
    /// later hops (or, for a `CONCURRENT` resource, the *other* queues that
    /// share it per [`crate::queue::visible_wait_count`]) can wait on them in
    /// turn instead of the calling thread blocking on a fence between every
    /// hop.
    ///
    /// `wait_for_fence` should be `true` only for a chain's last hop: that is
    /// the one point the caller needs a definite, synchronous
    /// success/failure so it can safely free the staging buffer and return.
    /// Earlier hops return as soon as their batch is queued, so the
    /// transfer and graphics/owner queues can overlap instead of the CPU
    /// stalling between each barrier.
    fn submit_one_off_chained(
        &self,
        queue_family: u32,
        wait_on: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal_count: usize,
        wait_for_fence: bool,
        record: impl FnOnce(&mut CommandBuffer),
    ) -> (bool, SmallVec<[vk::Semaphore; 2]>) {
        let Some(mut cb) = self.request_command_buffer(queue_family) else {
            return (false, SmallVec::new());
        };
        record(&mut cb);
        if !self.submit(cb, queue_family, false) {
            return (false, SmallVec::new());
        }
        let idx = self.queue_index_for_family(queue_family);

        let fence = if wait_for_fence {
            let mut caches = self.caches.lock().unwrap();
            caches.fences.acquire(&self.deferred.device)
        } else {
            vk::Fence::null()
        };
        let signals: SmallVec<[vk::Semaphore; 2]> = if signal_count > 0 {
            let mut caches = self.caches.lock().unwrap();
            (0..signal_count)
                .map(|_| caches.semaphores.acquire(&self.deferred.device))
                .collect()
        } else {
            SmallVec::new()
        };

        {
            let mut queues = self.queues.lock().unwrap();
            if let Some((semaphore, stage)) = wait_on {
                queues[idx].add_wait_semaphore(semaphore, stage, None);
            }
            for &semaphore in &signals {
                queues[idx].add_signal_semaphore(semaphore, None);
            }
        }

        let submitted = {
            let mut queues = self.queues.lock().unwrap();
            let mut caches = self.caches.lock().unwrap();
            queues[idx]
                .submit(&self.deferred.device, &mut caches.semaphores, fence, |pool, dev| pool.acquire(dev))
                .is_ok()
        };

        if wait_for_fence {
            if submitted {
                unsafe { self.deferred.device.wait_for_fences(&[fence], true, u64::MAX) }.ok();
            }
            let mut caches = self.caches.lock().unwrap();
            caches.fences.release(&self.deferred.device, fence);
        }

        (submitted, signals)
    }

    /// The queue-role indices (besides `exclude_family`'s own role) that a
    /// `CONCURRENT`-shared resource's upload needs to hand a wait semaphore
    /// to, per the `submit_visible` rule in [`crate::queue::visible_wait_count`]:
    /// up to two, one per other queue family actually sharing the resource.
    /// `Exclusive` sharing never produces any -- that path uses the
    /// queue-family release/acquire barrier pair instead.
    fn concurrent_handoff_families(&self, sharing: &SharingMode, exclude_family: u32) -> SmallVec<[u32; 2]> {
        let SharingMode::Concurrent(families) = sharing else {
            return SmallVec::new();
        };
        let exclude_idx = self.queue_index_for_family(exclude_family);
        let mut seen_idxs: SmallVec<[usize; 4]> = SmallVec::new();
        let mut result: SmallVec<[u32; 2]> = SmallVec::new();
        for &family in families {
            let idx = self.queue_index_for_family(family);
            if idx == exclude_idx || seen_idxs.contains(&idx) {
                continue;
            }
            seen_idxs.push(idx);
            result.push(family);
        }
        let cap = crate::queue::visible_wait_count(families.len());
        result.truncate(cap);
        result
    }
}

/// Casts a `&[u32]` to its raw byte representation for a
/// `VkSpecializationInfo`'s data blob, without requiring the `bytemuck`
/// dependency for what is otherwise a one-line reinterpretation of an
/// already-`Copy`, already-POD slice.
fn bytemuck_cast_u32_slice(words: &[u32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, std::mem::size_of_val(words)) }
}

/// Possible pipeline stages/access a buffer's usage mask could be touched
/// by, for sizing a queue-family-ownership-acquire barrier's destination
/// scope. Mirrors `resources::image::derive_compatible_masks`'s per-usage-bit
/// accumulation, for buffers instead of images.
fn buffer_usage_stage_access(usage: vk::BufferUsageFlags) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();

    if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
        access |= vk::AccessFlags::INDEX_READ;
    }
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::UNIFORM_READ;
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
        stages |= vk::PipelineStageFlags::DRAW_INDIRECT;
        access |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }

    if stages.is_empty() {
        (vk::PipelineStageFlags::ALL_COMMANDS, vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
    } else {
        (stages, access)
    }
}

/// The layout an image's initial upload should leave it in, derived from
/// its usage mask the same way `PipelineState`'s barrier-scope derivation
/// works for steady-state access. Storage images settle on `GENERAL`
/// (matching their `LayoutFamily`); everything else prefers whichever
/// `Optimal` layout its primary declared usage implies.
fn default_initial_layout(usage: vk::ImageUsageFlags) -> vk::ImageLayout {
    if usage.contains(vk::ImageUsageFlags::STORAGE) {
        vk::ImageLayout::GENERAL
    } else if usage.contains(vk::ImageUsageFlags::SAMPLED) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    }
}

fn full_range(aspect_mask: vk::ImageAspectFlags, mip_levels: u32, array_layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count: array_layers,
    }
}

fn single_level(aspect_mask: vk::ImageAspectFlags, level: u32, array_layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: level,
        level_count: 1,
        base_array_layer: 0,
        layer_count: array_layers,
    }
}

fn descriptor_type_for(set: &crate::shader::SetLayout, binding: usize) -> vk::DescriptorType {
    let bit = 1u32 << binding;
    if set.uniform_buffer_mask & bit != 0 {
        // every uniform buffer binding is bound through a per-frame linear
        // pool with a dynamic offset (see `CommandBuffer::set_uniform_buffer`),
        // so the matching descriptor type is always the dynamic variant.
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
    } else if set.storage_buffer_mask & bit != 0 {
        vk::DescriptorType::STORAGE_BUFFER
    } else if set.sampled_image_mask & bit != 0 {
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
    } else if set.storage_image_mask & bit != 0 {
        vk::DescriptorType::STORAGE_IMAGE
    } else if set.sampled_buffer_mask & bit != 0 {
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER
    } else if set.input_attachment_mask & bit != 0 {
        vk::DescriptorType::INPUT_ATTACHMENT
    } else if set.sampler_mask & bit != 0 {
        vk::DescriptorType::SAMPLER
    } else {
        vk::DescriptorType::SAMPLED_IMAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_type_prefers_uniform_buffer_over_other_kinds_when_both_bits_set() {
        let mut set = crate::shader::SetLayout::default();
        set.uniform_buffer_mask = 1;
        set.sampled_image_mask = 1;
        assert_eq!(descriptor_type_for(&set, 0), vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
    }

    #[test]
    fn program_uniform_buffer_bindings_are_always_dynamic_offset_candidates() {
        let mut layout = ProgramLayout::default();
        layout.combined[0].uniform_buffer_mask = 0b101;
        layout.combined[0].storage_buffer_mask = 0b010;
        let shaders = std::collections::HashMap::new();
        let program = Program::new(Cookie::NONE, shaders, layout, vk::PipelineLayout::null(), Vec::new());
        assert_eq!(program.layout().combined[0].uniform_buffer_mask, 0b101);
    }
}
