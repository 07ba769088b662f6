//! The closed subset of `VkFormat` that the rest of the core needs to reason
//! about: enough to derive aspect masks for barriers, pick load/store ops,
//! and size staging buffers. Not a general-purpose format library.

use ash::vk;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct ImageAspectFlags: u32 {
        const COLOR   = 0b001;
        const DEPTH   = 0b010;
        const STENCIL = 0b100;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Format {
    Undefined,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16Sfloat,
    R16G16B16A16Sfloat,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    R16Uint,
    R32Uint,
    D16Unorm,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
    Bc1RgbaUnorm,
    Bc3Unorm,
    Bc7Unorm,
}

impl Format {
    /// Size in bytes of one texel for non-block formats; for block formats,
    /// size in bytes of one block (4x4 texels).
    pub fn texel_or_block_size(self) -> u32 {
        use Format::*;
        match self {
            Undefined => 0,
            R8Unorm => 1,
            R8G8Unorm => 2,
            R8G8B8A8Unorm | R8G8B8A8Srgb | B8G8R8A8Unorm | B8G8R8A8Srgb => 4,
            R16G16Sfloat => 4,
            R16G16B16A16Sfloat => 8,
            R32Sfloat => 4,
            R32G32Sfloat => 8,
            R32G32B32Sfloat => 12,
            R32G32B32A32Sfloat => 16,
            R16Uint => 2,
            R32Uint => 4,
            D16Unorm => 2,
            D32Sfloat => 4,
            D24UnormS8Uint => 4,
            D32SfloatS8Uint => 8,
            Bc1RgbaUnorm => 8,
            Bc3Unorm | Bc7Unorm => 16,
        }
    }

    pub fn is_block_compressed(self) -> bool {
        matches!(self, Format::Bc1RgbaUnorm | Format::Bc3Unorm | Format::Bc7Unorm)
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Sfloat | Format::D24UnormS8Uint | Format::D32SfloatS8Uint
        )
    }

    pub fn is_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32SfloatS8Uint)
    }

    pub fn is_depth_stencil(self) -> bool {
        self.is_depth() || self.is_stencil()
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::R8G8B8A8Srgb | Format::B8G8R8A8Srgb)
    }

    /// The unorm/srgb counterpart of this format, used to synthesize the
    /// reinterpret views an `ImageView` can hold.
    pub fn srgb_counterpart(self) -> Option<Format> {
        match self {
            Format::R8G8B8A8Unorm => Some(Format::R8G8B8A8Srgb),
            Format::R8G8B8A8Srgb => Some(Format::R8G8B8A8Unorm),
            Format::B8G8R8A8Unorm => Some(Format::B8G8R8A8Srgb),
            Format::B8G8R8A8Srgb => Some(Format::B8G8R8A8Unorm),
            _ => None,
        }
    }

    pub fn aspect_mask(self) -> ImageAspectFlags {
        if self.is_depth() && self.is_stencil() {
            ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL
        } else if self.is_depth() {
            ImageAspectFlags::DEPTH
        } else if self.is_stencil() {
            ImageAspectFlags::STENCIL
        } else {
            ImageAspectFlags::COLOR
        }
    }

    pub fn to_vk(self) -> vk::Format {
        use Format::*;
        match self {
            Undefined => vk::Format::UNDEFINED,
            R8Unorm => vk::Format::R8_UNORM,
            R8G8Unorm => vk::Format::R8G8_UNORM,
            R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
            B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
            R16G16Sfloat => vk::Format::R16G16_SFLOAT,
            R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
            R32Sfloat => vk::Format::R32_SFLOAT,
            R32G32Sfloat => vk::Format::R32G32_SFLOAT,
            R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
            R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
            R16Uint => vk::Format::R16_UINT,
            R32Uint => vk::Format::R32_UINT,
            D16Unorm => vk::Format::D16_UNORM,
            D32Sfloat => vk::Format::D32_SFLOAT,
            D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
            Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
            Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
            Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
        }
    }

    pub fn to_vk_aspect_mask(self) -> vk::ImageAspectFlags {
        let mine = self.aspect_mask();
        let mut out = vk::ImageAspectFlags::empty();
        if mine.contains(ImageAspectFlags::COLOR) {
            out |= vk::ImageAspectFlags::COLOR;
        }
        if mine.contains(ImageAspectFlags::DEPTH) {
            out |= vk::ImageAspectFlags::DEPTH;
        }
        if mine.contains(ImageAspectFlags::STENCIL) {
            out |= vk::ImageAspectFlags::STENCIL;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_stencil_aspect_masks() {
        assert_eq!(Format::D32Sfloat.aspect_mask(), ImageAspectFlags::DEPTH);
        assert_eq!(
            Format::D24UnormS8Uint.aspect_mask(),
            ImageAspectFlags::DEPTH | ImageAspectFlags::STENCIL
        );
        assert_eq!(Format::R8G8B8A8Unorm.aspect_mask(), ImageAspectFlags::COLOR);
    }

    #[test]
    fn srgb_round_trip() {
        let srgb = Format::R8G8B8A8Unorm.srgb_counterpart().unwrap();
        assert!(srgb.is_srgb());
        assert_eq!(srgb.srgb_counterpart().unwrap(), Format::R8G8B8A8Unorm);
    }
}
