//! Image wrapper.

use ash::vk;

use crate::cookie::Cookie;
use crate::format::Format;
use crate::handle::HasCookie;
use crate::memory::{AllocatedMemory, MemoryDomain};

use super::SharingMode;

/// Which layout policy an image's barriers should assume.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutFamily {
    /// The driver-preferred layout per access kind (`COLOR_ATTACHMENT_OPTIMAL`,
    /// `SHADER_READ_ONLY_OPTIMAL`, ...). The common case.
    Optimal,
    /// One layout (`GENERAL`) for every access, trading transition barriers
    /// for simplicity; used for images read and written within the same
    /// pass (UAV-style storage images) or images shared across many APIs.
    General,
}

/// How this image was requested to compute its allowed reinterpretation
/// formats, mirroring the `view_formats` create-info option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ViewFormats {
    /// No format reinterpretation: the image is created without the
    /// mutable-format flag.
    Identity,
    /// The unorm/srgb counterpart of the base format is allowed; sets the
    /// mutable-format flag with no explicit format list.
    Compatible,
    /// An explicit format list describing every allowed reinterpretation;
    /// attaches a `VkImageFormatListCreateInfo`.
    Custom(Vec<Format>),
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct ImageMiscFlags: u32 {
        /// Never touched by a barrier outside of render-pass scope; used by
        /// the transient attachment cache for MSAA/resolve targets that
        /// never leave a subpass.
        const TRANSIENT = 0b001;
        /// Only the base level is staged at creation; remaining mips are
        /// produced by chained blits on the graphics queue.
        const GENERATE_MIPS = 0b010;
    }
}

/// Create-info for [`Image`].
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    pub format: Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub image_type: vk::ImageType,
    pub usage: vk::ImageUsageFlags,
    pub sharing: SharingMode,
    pub view_formats: ViewFormats,
    pub misc: ImageMiscFlags,
}

/// Raw image handle + allocation + create-info.
///
/// Invariant: a `Transient` image ([`ImageMiscFlags::TRANSIENT`]) is never
/// touched by a pipeline barrier outside of render-pass scope -- the
/// command buffer recorder asserts this when building subpass transitions.
pub struct Image {
    cookie: Cookie,
    raw: vk::Image,
    /// `None` for swapchain-owned images, which do not own memory.
    memory: Option<AllocatedMemory>,
    info: ImageCreateInfo,
    layout_family: LayoutFamily,
    is_swapchain_owned: bool,
    /// Non-`UNDEFINED` iff this image is swapchain-owned and has been
    /// acquired at least once.
    swapchain_layout: vk::ImageLayout,
    /// Compatible pipeline-stage/access masks observed from `usage`, used
    /// to seed the first barrier an image participates in without having
    /// to re-derive them from the usage mask every time.
    compatible_stages: vk::PipelineStageFlags,
    compatible_access: vk::AccessFlags,
}

impl Image {
    pub(crate) fn new(cookie: Cookie, raw: vk::Image, memory: Option<AllocatedMemory>, info: ImageCreateInfo) -> Self {
        let layout_family = if info.usage.contains(vk::ImageUsageFlags::STORAGE) {
            LayoutFamily::General
        } else {
            LayoutFamily::Optimal
        };
        let (compatible_stages, compatible_access) = derive_compatible_masks(info.usage, info.format);
        Image {
            cookie,
            raw,
            memory,
            info,
            layout_family,
            is_swapchain_owned: false,
            swapchain_layout: vk::ImageLayout::UNDEFINED,
            compatible_stages,
            compatible_access,
        }
    }

    /// Builds the non-owning wrapper for a swapchain-provided image: no
    /// allocation, and `swapchain_layout` starts at `UNDEFINED` until the
    /// first acquire.
    pub(crate) fn from_swapchain(cookie: Cookie, raw: vk::Image, info: ImageCreateInfo) -> Self {
        let mut image = Image::new(cookie, raw, None, info);
        image.is_swapchain_owned = true;
        image
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn format(&self) -> Format {
        self.info.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.info.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.info.array_layers
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.info.samples
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.info.usage
    }

    pub fn sharing(&self) -> &SharingMode {
        &self.info.sharing
    }

    pub fn misc(&self) -> ImageMiscFlags {
        self.info.misc
    }

    pub fn is_transient(&self) -> bool {
        self.info.misc.contains(ImageMiscFlags::TRANSIENT)
    }

    pub fn layout_family(&self) -> LayoutFamily {
        self.layout_family
    }

    pub fn is_swapchain_owned(&self) -> bool {
        self.is_swapchain_owned
    }

    pub fn swapchain_layout(&self) -> vk::ImageLayout {
        self.swapchain_layout
    }

    pub(crate) fn set_swapchain_layout(&mut self, layout: vk::ImageLayout) {
        self.swapchain_layout = layout;
    }

    pub fn compatible_stages(&self) -> vk::PipelineStageFlags {
        self.compatible_stages
    }

    pub fn compatible_access(&self) -> vk::AccessFlags {
        self.compatible_access
    }

    pub fn memory(&self) -> Option<&AllocatedMemory> {
        self.memory.as_ref()
    }

    pub(crate) fn into_raw_parts(self) -> (vk::Image, Option<AllocatedMemory>) {
        (self.raw, self.memory)
    }
}

impl HasCookie for Image {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("cookie", &self.cookie)
            .field("raw", &self.raw)
            .field("format", &self.info.format)
            .field("extent", &self.info.extent)
            .finish()
    }
}

pub(crate) fn derive_compatible_masks(usage: vk::ImageUsageFlags, format: Format) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();

    if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        access |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) || format.is_depth_stencil() {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if usage.contains(vk::ImageUsageFlags::SAMPLED) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }
    if usage.contains(vk::ImageUsageFlags::STORAGE) {
        stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        access |= vk::AccessFlags::TRANSFER_READ;
    }
    if usage.contains(vk::ImageUsageFlags::TRANSFER_DST) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }

    (stages, access)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_usage_picks_general_layout_family() {
        let info = ImageCreateInfo {
            format: Format::R8G8B8A8Unorm,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::STORAGE,
            sharing: SharingMode::Exclusive(0),
            view_formats: ViewFormats::Identity,
            misc: ImageMiscFlags::empty(),
        };
        let image = Image::new(Cookie::NONE, vk::Image::null(), None, info);
        assert_eq!(image.layout_family(), LayoutFamily::General);
    }

    #[test]
    fn sampled_color_attachment_derives_both_mask_families() {
        let info = ImageCreateInfo {
            format: Format::R8G8B8A8Unorm,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            image_type: vk::ImageType::TYPE_2D,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            sharing: SharingMode::Exclusive(0),
            view_formats: ViewFormats::Identity,
            misc: ImageMiscFlags::empty(),
        };
        let image = Image::new(Cookie::NONE, vk::Image::null(), None, info);
        assert!(image
            .compatible_access()
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert!(image.compatible_access().contains(vk::AccessFlags::SHADER_READ));
    }
}
