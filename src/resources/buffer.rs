//! Buffer wrapper.

use ash::vk;

use crate::cookie::Cookie;
use crate::handle::HasCookie;
use crate::memory::{AllocatedMemory, MemoryDomain};

use super::SharingMode;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct BufferMiscFlags: u32 {
        /// The buffer is zero-initialized at creation if no `initial` bytes
        /// were supplied, rather than left with driver-undefined contents.
        const ZERO_INITIALIZE = 0b01;
        /// Backs a descriptor-indexing bindless binding; affects which
        /// usage bits and alignment requirements the creator must satisfy.
        const BINDLESS = 0b10;
    }
}

/// Create-info for [`Buffer`], matching the inputs to the creation
/// procedure: domain, size, usage mask, sharing mode and owners, misc
/// flags, and the optional initial payload.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo<'a> {
    pub domain: MemoryDomain,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub sharing: SharingMode,
    pub misc: BufferMiscFlags,
    pub initial: Option<&'a [u8]>,
}

/// Raw buffer handle + allocation record + create-info.
///
/// Invariant: if `domain` is host-visible, `memory` is persistently mapped
/// (`host_pointer()` returns `Some`); if `Device`, it is never mapped and
/// any zero-initialization or upload already completed by the time this
/// value exists (see the cross-queue choreography in the device facade's
/// `create_buffer`).
pub struct Buffer {
    cookie: Cookie,
    raw: vk::Buffer,
    memory: AllocatedMemory,
    domain: MemoryDomain,
    size: u64,
    usage: vk::BufferUsageFlags,
    sharing: SharingMode,
    misc: BufferMiscFlags,
}

impl Buffer {
    /// Assembled by the device facade once the raw buffer has been created
    /// and bound; never constructed directly by callers.
    pub(crate) fn new(
        cookie: Cookie,
        raw: vk::Buffer,
        memory: AllocatedMemory,
        info: &BufferCreateInfo,
    ) -> Self {
        Buffer {
            cookie,
            raw,
            memory,
            domain: info.domain,
            size: info.size,
            usage: info.usage,
            sharing: info.sharing.clone(),
            misc: info.misc,
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn sharing(&self) -> &SharingMode {
        &self.sharing
    }

    pub fn misc(&self) -> BufferMiscFlags {
        self.misc
    }

    /// Persistent host pointer to the start of this buffer's memory, for
    /// host-visible domains. `None` for `Device`-domain buffers.
    pub fn host_pointer(&self) -> Option<std::ptr::NonNull<u8>> {
        self.memory.mapped_ptr()
    }

    pub fn memory(&self) -> &AllocatedMemory {
        &self.memory
    }

    /// Consumes the wrapper, handing back the raw handle and allocation so
    /// the owning device can destroy the buffer and return the memory to
    /// the allocator. Only called from a deferred-destroy deleter.
    pub(crate) fn into_raw_parts(self) -> (vk::Buffer, AllocatedMemory) {
        (self.raw, self.memory)
    }
}

impl HasCookie for Buffer {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("cookie", &self.cookie)
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("domain", &self.domain)
            .finish()
    }
}
