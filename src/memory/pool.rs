//! Per-frame buffer suballocation pools.
//!
//! Backs transient vertex/index/uniform/staging allocations made while
//! recording a frame. Each pool only ever appends: allocation carves a new
//! range out of the current block's tail, and `recycle` (called once a
//! frame, when that pool's ring slot is reused) resets every block's write
//! pointer to zero rather than freeing anything. Blocks themselves are
//! freed only when the pool itself is dropped.
//!
//! Grounded on the block-carving behavior of the older linear memory pool,
//! generalized one level up: that pool suballocated raw `VkDeviceMemory`
//! ranges directly, whereas this one carves ranges out of whole `VkBuffer`
//! blocks (themselves allocated through [`super::Allocator`]), since every
//! caller of this pool wants a buffer range, never bare device memory.

use std::ptr::NonNull;

use ash::vk;

use super::{Allocator, AllocatedMemory, MemoryDomain};
use crate::error::DeviceError;

/// One linear-allocated range, ready to be bound as a vertex/index/uniform
/// buffer view or used as a staging source. `offset` is relative to
/// `buffer`, already aligned per the request.
#[derive(Clone, Copy, Debug)]
pub struct BufferBlock {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    /// Persistent host pointer into this range, valid for host-visible
    /// pools (uniform/staging), `None` for device-local ones.
    pub host_pointer: Option<NonNull<u8>>,
}

// SAFETY: the pointer is only ever dereferenced by whichever thread holds
// the `BufferBlock` value; the pool never hands out overlapping ranges.
unsafe impl Send for BufferBlock {}

struct Block {
    buffer: vk::Buffer,
    memory: AllocatedMemory,
    front: u64,
}

/// Carves `16`-byte-aligned linear allocations out of `block_size`-byte
/// buffer blocks, all created with the same `usage` and `domain`.
pub struct LinearBufferPool {
    usage: vk::BufferUsageFlags,
    domain: MemoryDomain,
    block_size: u64,
    blocks: Vec<Block>,
}

/// Minimum alignment applied to every suballocation regardless of the
/// caller's requested alignment, matching the power-of-two spacing used
/// between mip levels and other structured uploads throughout this crate.
pub const MIN_ALIGNMENT: u64 = 16;

impl LinearBufferPool {
    pub fn new(usage: vk::BufferUsageFlags, domain: MemoryDomain, block_size: u64) -> Self {
        LinearBufferPool {
            usage,
            domain,
            block_size,
            blocks: Vec::new(),
        }
    }

    fn push_block(&mut self, device: &ash::Device, allocator: &Allocator, size: u64) -> Result<(), DeviceError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None) }
            .map_err(|_| DeviceError::AllocationFailed { size }.log())?;
        let memory = match allocator.allocate_buffer(device, buffer, self.domain, false) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        self.blocks.push(Block {
            buffer,
            memory,
            front: 0,
        });
        Ok(())
    }

    /// Suballocates `size` bytes at an offset that is a multiple of
    /// `max(alignment, MIN_ALIGNMENT)`. Grows the pool with a new block if
    /// the request doesn't fit the current block's tail, or if `size`
    /// itself exceeds the configured block size (the block then grows to
    /// fit exactly that one oversized allocation -- the "spill" case).
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        allocator: &Allocator,
        size: u64,
        alignment: u64,
    ) -> Result<BufferBlock, DeviceError> {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let alignment = alignment.max(MIN_ALIGNMENT);

        if let Some(block) = self.blocks.last_mut() {
            let aligned = align_up(block.front, alignment);
            if aligned + size <= block.memory.size() {
                block.front = aligned + size;
                return Ok(Self::block_range(block, aligned, size));
            }
        }

        let spill_size = self.block_size.max(size);
        self.push_block(device, allocator, spill_size)?;
        let block = self.blocks.last_mut().unwrap();
        block.front = size;
        Ok(Self::block_range(block, 0, size))
    }

    fn block_range(block: &Block, offset: u64, size: u64) -> BufferBlock {
        let host_pointer = block.memory.mapped_ptr().map(|base| {
            // SAFETY: `offset` is within `block.memory.size()`, checked by
            // the caller before this is reached.
            unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
        });
        BufferBlock {
            buffer: block.buffer,
            offset,
            size,
            host_pointer,
        }
    }

    /// Resets every block's write pointer to the start, without freeing
    /// any block. Called once per frame, when this pool's ring slot
    /// becomes the current frame again and the frame context has already
    /// confirmed (via timeline watermark or fence wait) that the GPU is
    /// done reading the previous contents.
    pub fn recycle(&mut self) {
        for block in &mut self.blocks {
            block.front = 0;
        }
    }

    /// Destroys every block's buffer and returns its memory to `allocator`.
    /// Only safe to call once the GPU is known to be done with every block.
    pub fn destroy(&mut self, device: &ash::Device, allocator: &Allocator) {
        for block in self.blocks.drain(..) {
            unsafe { device.destroy_buffer(block.buffer, None) };
            allocator.free_buffer(device, block.memory);
        }
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 256), 256);
    }

    #[test]
    fn min_alignment_is_respected_by_allocate_math() {
        // allocate() always widens the caller's alignment up to
        // MIN_ALIGNMENT, so even a byte-granular request lands on a
        // 16-byte boundary; exercised indirectly since allocate() needs a
        // live ash::Device, so this checks the building block it relies on.
        assert_eq!(align_up(3, 1u64.max(MIN_ALIGNMENT)), 16);
    }
}
