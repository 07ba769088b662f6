//! Transient attachment cache: physical backing images for render targets
//! that never leave render-pass scope (MSAA color, resolve, depth/stencil
//! scratch) get recycled by shape instead of allocated fresh every frame.
//!
//! Grounded on the block-recycling shape of [`crate::memory::pool::LinearBufferPool`]:
//! same idea (a pool keyed by request shape, `recycle`/`destroy` instead of
//! per-allocation free), carrying whole images instead of buffer ranges.

use std::collections::HashMap;

use ash::vk;

use crate::cookie::{Cookie, CookieAllocator};
use crate::error::DeviceError;
use crate::format::Format;
use crate::handle::HasCookie;
use crate::memory::{Allocator, MemoryDomain};
use crate::resources::image::{Image, ImageCreateInfo, ImageMiscFlags, ViewFormats};
use crate::resources::SharingMode;

/// Shape key for a transient attachment. Two requests with the same key
/// are always satisfied by the same pool of backing images, regardless of
/// which render pass or subpass asked for them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AttachmentShape {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
}

struct Slot {
    image: Image,
    /// `true` while checked out to a render pass this frame; returned to
    /// the free list on the next `begin_frame`.
    in_use: bool,
}

/// Pool of same-shaped transient images, recycled frame to frame.
#[derive(Default)]
pub struct AttachmentCache {
    pools: HashMap<AttachmentShape, Vec<Slot>>,
    cookies: CookieAllocator,
}

impl AttachmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cookie and raw handle of a transient image matching
    /// `shape`, reusing a free slot if one exists, or creating one via
    /// `allocator`. The returned cookie identifies the slot for a matching
    /// `release` call once the render pass using it has been recorded.
    pub fn acquire(
        &mut self,
        device: &ash::Device,
        allocator: &Allocator,
        shape: AttachmentShape,
    ) -> Result<Cookie, DeviceError> {
        let pool = self.pools.entry(shape).or_default();

        if let Some(slot) = pool.iter_mut().find(|s| !s.in_use) {
            slot.in_use = true;
            return Ok(slot.image.cookie());
        }

        let info = ImageCreateInfo {
            format: shape.format,
            extent: vk::Extent3D {
                width: shape.width,
                height: shape.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: shape.layers,
            samples: shape.samples,
            image_type: vk::ImageType::TYPE_2D,
            usage: shape.usage,
            sharing: SharingMode::Exclusive(0),
            view_formats: ViewFormats::Identity,
            misc: ImageMiscFlags::TRANSIENT,
        };

        let create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format.to_vk())
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(info.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { device.create_image(&create_info, None) }
            .map_err(|_| DeviceError::AllocationFailed { size: 0 }.log())?;

        let memory = match allocator.allocate_image(device, raw, MemoryDomain::Device, false) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_image(raw, None) };
                return Err(e);
            }
        };

        let cookie = self.cookies.next();
        let image = Image::new(cookie, raw, Some(memory), info);

        let pool = self.pools.entry(shape).or_default();
        pool.push(Slot { image, in_use: true });

        Ok(cookie)
    }

    /// Looks up the image backing a previously acquired cookie.
    pub fn get(&self, shape: AttachmentShape, cookie: Cookie) -> Option<&Image> {
        self.pools
            .get(&shape)?
            .iter()
            .find(|s| s.image.cookie() == cookie)
            .map(|s| &s.image)
    }

    /// Marks every checked-out slot free again. Called once per frame
    /// context, after the render passes that used them have been
    /// submitted.
    pub fn begin_frame(&mut self) {
        for pool in self.pools.values_mut() {
            for slot in pool.iter_mut() {
                slot.in_use = false;
            }
        }
    }

    /// Destroys every backing image and returns its memory to `allocator`.
    /// Only safe to call once the GPU is known to be done with all of them.
    pub fn destroy(&mut self, device: &ash::Device, allocator: &Allocator) {
        for (_, pool) in self.pools.drain() {
            for slot in pool {
                let (raw, memory) = slot.image.into_raw_parts();
                unsafe { device.destroy_image(raw, None) };
                if let Some(memory) = memory {
                    allocator.free_image(device, memory);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_with_different_formats_hash_differently() {
        let a = AttachmentShape {
            width: 1920,
            height: 1080,
            layers: 1,
            format: Format::R8G8B8A8Unorm,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        };
        let b = AttachmentShape { format: Format::R8G8B8A8Srgb, ..a };
        assert_ne!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.len(), 2);
    }
}
