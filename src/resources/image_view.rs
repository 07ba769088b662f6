//! Image view wrapper: holds up to five distinct `VkImageView` objects over
//! the same image, built lazily as each is actually requested.

use ash::vk;

use crate::cookie::Cookie;
use crate::format::{Format, ImageAspectFlags};
use crate::handle::{HasCookie, Handle};

use super::Image;

/// Which of an `ImageView`'s view variants the caller wants. The variant
/// actually bound at sampler-bind time depends on the integer-vs-float
/// nature of the shader's sampler, which the command buffer recorder
/// resolves from the program's reflected `ResourceLayout`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ViewKind {
    /// All aspects the format has (color, or depth+stencil together).
    Default,
    /// Depth-only aspect of a combined depth/stencil format.
    DepthOnly,
    /// Stencil-only aspect of a combined depth/stencil format.
    StencilOnly,
    /// Reinterprets a srgb format's bytes as unorm.
    UnormReinterpret,
    /// Reinterprets a unorm format's bytes as srgb.
    SrgbReinterpret,
    /// A single-layer render-target view, for attaching one array layer
    /// (or cubemap face) as a framebuffer attachment.
    RenderTargetLayer(u32),
}

#[derive(Clone, Debug)]
pub struct ImageViewCreateInfo {
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub view_type: vk::ImageViewType,
}

/// Refers back to its [`Image`] through a [`Handle`] clone, keeping it
/// alive; the view never outlives the image it was built from. Views for
/// variants nobody has asked for yet are simply absent from `views` --
/// they are created on first request and memoized here afterward.
pub struct ImageView {
    cookie: Cookie,
    image: Handle<Image>,
    info: ImageViewCreateInfo,
    default_view: vk::ImageView,
    depth_only_view: Option<vk::ImageView>,
    stencil_only_view: Option<vk::ImageView>,
    unorm_reinterpret_view: Option<vk::ImageView>,
    srgb_reinterpret_view: Option<vk::ImageView>,
    render_target_layer_views: Vec<Option<vk::ImageView>>,
}

impl ImageView {
    pub(crate) fn new(
        cookie: Cookie,
        image: Handle<Image>,
        info: ImageViewCreateInfo,
        default_view: vk::ImageView,
    ) -> Self {
        let layer_count = info.array_layer_count as usize;
        ImageView {
            cookie,
            image,
            info,
            default_view,
            depth_only_view: None,
            stencil_only_view: None,
            unorm_reinterpret_view: None,
            srgb_reinterpret_view: None,
            render_target_layer_views: vec![None; layer_count],
        }
    }

    pub fn image(&self) -> &Handle<Image> {
        &self.image
    }

    pub fn default_view(&self) -> vk::ImageView {
        self.default_view
    }

    pub fn base_mip_level(&self) -> u32 {
        self.info.base_mip_level
    }

    pub fn mip_level_count(&self) -> u32 {
        self.info.mip_level_count
    }

    pub fn base_array_layer(&self) -> u32 {
        self.info.base_array_layer
    }

    pub fn array_layer_count(&self) -> u32 {
        self.info.array_layer_count
    }

    /// Aspect mask for the requested view variant, given the image's
    /// format. `DepthOnly`/`StencilOnly` are only meaningful for combined
    /// depth-stencil formats; requesting them on anything else is a
    /// caller error the command buffer recorder never makes.
    pub fn aspect_mask_for(&self, kind: ViewKind, format: Format) -> ImageAspectFlags {
        match kind {
            ViewKind::DepthOnly => ImageAspectFlags::DEPTH,
            ViewKind::StencilOnly => ImageAspectFlags::STENCIL,
            _ => format.aspect_mask(),
        }
    }

    /// Looks up an already-built view for `kind`, if any. Building a
    /// missing one is the device facade's job (it owns the `ash::Device`
    /// needed to call `vkCreateImageView`); this method is the memoization
    /// read-side only.
    pub fn existing_view(&self, kind: ViewKind) -> Option<vk::ImageView> {
        match kind {
            ViewKind::Default => Some(self.default_view),
            ViewKind::DepthOnly => self.depth_only_view,
            ViewKind::StencilOnly => self.stencil_only_view,
            ViewKind::UnormReinterpret => self.unorm_reinterpret_view,
            ViewKind::SrgbReinterpret => self.srgb_reinterpret_view,
            ViewKind::RenderTargetLayer(layer) => {
                self.render_target_layer_views.get(layer as usize).copied().flatten()
            }
        }
    }

    pub(crate) fn store_view(&mut self, kind: ViewKind, view: vk::ImageView) {
        match kind {
            ViewKind::Default => self.default_view = view,
            ViewKind::DepthOnly => self.depth_only_view = Some(view),
            ViewKind::StencilOnly => self.stencil_only_view = Some(view),
            ViewKind::UnormReinterpret => self.unorm_reinterpret_view = Some(view),
            ViewKind::SrgbReinterpret => self.srgb_reinterpret_view = Some(view),
            ViewKind::RenderTargetLayer(layer) => {
                if let Some(slot) = self.render_target_layer_views.get_mut(layer as usize) {
                    *slot = Some(view);
                }
            }
        }
    }

    /// Every view object currently built, for deferred destruction.
    pub(crate) fn all_views(&self) -> Vec<vk::ImageView> {
        let mut views = vec![self.default_view];
        views.extend(self.depth_only_view);
        views.extend(self.stencil_only_view);
        views.extend(self.unorm_reinterpret_view);
        views.extend(self.srgb_reinterpret_view);
        views.extend(self.render_target_layer_views.iter().flatten().copied());
        views
    }
}

impl HasCookie for ImageView {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}
