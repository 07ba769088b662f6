//! Memory allocator interface.
//!
//! The core does not implement a suballocator itself; it consumes one,
//! treating it strictly as an external collaborator (a VMA-like black box)
//! reachable only through `allocate_buffer`, `allocate_image`, `map`,
//! `unmap`, and `free_*`. That collaborator is `gpu-alloc`, driven through
//! its `gpu-alloc-ash` Vulkan binding. Nothing outside this module imports
//! `gpu_alloc` directly.

pub mod pool;

use std::sync::Mutex;

use ash::vk;
use gpu_alloc::{GpuAllocator, MemoryBlock, Request, UsageFlags};
use gpu_alloc_ash::AshMemoryDevice;

use crate::error::DeviceError;

/// Where a resource's backing memory should live, matching the domains a
/// `Buffer` or `Image` create-info can request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryDomain {
    /// Device-local, not host-visible. Uploads go through a staging buffer.
    Device,
    /// Host-visible, not necessarily coherent or fast for the GPU to read.
    Host,
    /// Host-visible and host-cached: fast to read back, slower for the GPU.
    HostCached,
    /// Host-visible memory that is also device-local (resizable BAR /
    /// smart-access-memory style heaps), used to skip staging entirely.
    LinkedDeviceHost,
}

impl MemoryDomain {
    fn usage_flags(self) -> UsageFlags {
        match self {
            MemoryDomain::Device => UsageFlags::FAST_DEVICE_ACCESS,
            MemoryDomain::Host => UsageFlags::HOST_ACCESS,
            MemoryDomain::HostCached => UsageFlags::HOST_ACCESS | UsageFlags::DOWNLOAD,
            MemoryDomain::LinkedDeviceHost => {
                UsageFlags::HOST_ACCESS | UsageFlags::FAST_DEVICE_ACCESS | UsageFlags::UPLOAD
            }
        }
    }

    /// Host-visible domains are persistently mapped for the lifetime of the
    /// allocation, per the Buffer invariant: "if `domain` is host-visible,
    /// the allocation is persistently mapped".
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryDomain::Device)
    }
}

/// A suballocation returned by the allocator, plus the persistent host
/// pointer if the domain is host-visible.
pub struct AllocatedMemory {
    block: MemoryBlock<vk::DeviceMemory>,
    mapped_ptr: Option<std::ptr::NonNull<u8>>,
}

// SAFETY: `AllocatedMemory` is only ever accessed while the owning
// `Allocator`'s mutex-guarded `GpuAllocator` is locked, or through the
// pointer fields, which are only dereferenced by the thread that holds the
// corresponding resource's exclusive access (mapping is never aliased).
unsafe impl Send for AllocatedMemory {}
unsafe impl Sync for AllocatedMemory {}

impl AllocatedMemory {
    pub fn memory(&self) -> vk::DeviceMemory {
        *self.block.memory()
    }

    pub fn offset(&self) -> u64 {
        self.block.offset()
    }

    pub fn size(&self) -> u64 {
        self.block.size()
    }

    /// Host pointer to the start of this allocation's mapped range, if the
    /// domain is host-visible. `None` for `Device`-domain allocations.
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.mapped_ptr
    }
}

/// Thin wrapper over a `gpu_alloc::GpuAllocator` bound to one Vulkan device.
/// One instance lives on the Device facade and is shared (behind its own
/// lock) by every resource-creation path and by the per-frame linear pools
/// in [`pool`].
pub struct Allocator {
    inner: Mutex<GpuAllocator<vk::DeviceMemory>>,
}

impl Allocator {
    /// Builds an allocator from the physical device's memory properties.
    /// `buffer_device_address` should reflect whether the
    /// `bufferDeviceAddress` feature was enabled at device creation.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Self {
        let props = unsafe {
            gpu_alloc_ash::device_properties(instance, vk::API_VERSION_1_1, physical_device)
        }
        .expect("failed to query device properties for allocator");
        let mut props = props;
        props.buffer_device_address = buffer_device_address;
        let config = gpu_alloc::Config::i_am_prototyping();
        Allocator {
            inner: Mutex::new(GpuAllocator::new(config, props)),
        }
    }

    /// Allocates and binds memory for `buffer`, already created with
    /// `vkCreateBuffer`. Returns `None` (caller logs `AllocationFailed`) on
    /// failure; no partial state survives.
    pub fn allocate_buffer(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
        domain: MemoryDomain,
        dedicated: bool,
    ) -> Result<AllocatedMemory, DeviceError> {
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let block = self.alloc_raw(device, requirements, domain, dedicated)?;
        let bind_result = unsafe { device.bind_buffer_memory(buffer, *block.memory(), block.offset()) };
        let mut block = match bind_result {
            Ok(()) => block,
            Err(_) => {
                self.dealloc_raw(device, block);
                return Err(DeviceError::AllocationFailed {
                    size: requirements.size,
                }
                .log());
            }
        };
        let mapped_ptr = self.map_if_host_visible(device, &mut block, domain);
        Ok(AllocatedMemory { block, mapped_ptr })
    }

    /// Allocates and binds memory for `image`, already created with
    /// `vkCreateImage`.
    pub fn allocate_image(
        &self,
        device: &ash::Device,
        image: vk::Image,
        domain: MemoryDomain,
        dedicated: bool,
    ) -> Result<AllocatedMemory, DeviceError> {
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let block = self.alloc_raw(device, requirements, domain, dedicated)?;
        let bind_result = unsafe { device.bind_image_memory(image, *block.memory(), block.offset()) };
        let mut block = match bind_result {
            Ok(()) => block,
            Err(_) => {
                self.dealloc_raw(device, block);
                return Err(DeviceError::AllocationFailed {
                    size: requirements.size,
                }
                .log());
            }
        };
        let mapped_ptr = self.map_if_host_visible(device, &mut block, domain);
        Ok(AllocatedMemory { block, mapped_ptr })
    }

    fn alloc_raw(
        &self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        domain: MemoryDomain,
        dedicated: bool,
    ) -> Result<MemoryBlock<vk::DeviceMemory>, DeviceError> {
        let mut usage = domain.usage_flags();
        if dedicated {
            usage |= UsageFlags::DEVICE_ADDRESS;
        }
        let request = Request {
            size: requirements.size,
            align_mask: requirements.alignment - 1,
            usage,
            memory_types: requirements.memory_type_bits,
        };
        let mut inner = self.inner.lock().unwrap();
        unsafe { inner.alloc(AshMemoryDevice::wrap(device), request) }.map_err(|_| {
            DeviceError::AllocationFailed {
                size: requirements.size,
            }
            .log()
        })
    }

    fn map_if_host_visible(
        &self,
        device: &ash::Device,
        block: &mut MemoryBlock<vk::DeviceMemory>,
        domain: MemoryDomain,
    ) -> Option<std::ptr::NonNull<u8>> {
        if !domain.is_host_visible() {
            return None;
        }
        let size = block.size();
        unsafe { block.map(AshMemoryDevice::wrap(device), 0, size as usize) }.ok()
    }

    fn dealloc_raw(&self, device: &ash::Device, block: MemoryBlock<vk::DeviceMemory>) {
        let mut inner = self.inner.lock().unwrap();
        unsafe { inner.dealloc(AshMemoryDevice::wrap(device), block) };
    }

    /// Returns a buffer's memory to the allocator. Called from the per-frame
    /// destroy list, never synchronously from the resource's own drop.
    pub fn free_buffer(&self, device: &ash::Device, memory: AllocatedMemory) {
        self.dealloc_raw(device, memory.block);
    }

    /// Returns an image's memory to the allocator.
    pub fn free_image(&self, device: &ash::Device, memory: AllocatedMemory) {
        self.dealloc_raw(device, memory.block);
    }

    /// Explicit unmap for callers about to transfer an allocation's memory
    /// to a context that wants it unmapped (rare; most host-visible memory
    /// stays mapped for its whole lifetime per the Buffer invariant).
    pub fn unmap(&self, device: &ash::Device, memory: &mut AllocatedMemory) {
        if memory.mapped_ptr.take().is_some() {
            unsafe { memory.block.unmap(AshMemoryDevice::wrap(device)) };
        }
    }
}
