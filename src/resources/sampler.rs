//! Sampler wrapper.

use ash::vk;

use crate::cookie::Cookie;
use crate::handle::HasCookie;

/// Hashable create-info for a sampler. Mirrors `VkSamplerCreateInfo` minus
/// the fields this crate never varies (`flags`, `pNext`).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SamplerCreateInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: ordered_float::NotNan<f32>,
    pub anisotropy_enable: bool,
    pub max_anisotropy: ordered_float::NotNan<f32>,
    pub compare_enable: bool,
    pub compare_op: vk::CompareOp,
    pub min_lod: ordered_float::NotNan<f32>,
    pub max_lod: ordered_float::NotNan<f32>,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Eq for SamplerCreateInfo {}

impl std::hash::Hash for SamplerCreateInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_mode_u.hash(state);
        self.address_mode_v.hash(state);
        self.address_mode_w.hash(state);
        self.mip_lod_bias.hash(state);
        self.anisotropy_enable.hash(state);
        self.max_anisotropy.hash(state);
        self.compare_enable.hash(state);
        self.compare_op.hash(state);
        self.min_lod.hash(state);
        self.max_lod.hash(state);
        self.border_color.hash(state);
        self.unnormalized_coordinates.hash(state);
    }
}

pub struct Sampler {
    cookie: Cookie,
    raw: vk::Sampler,
    info: SamplerCreateInfo,
}

impl Sampler {
    pub(crate) fn new(cookie: Cookie, raw: vk::Sampler, info: SamplerCreateInfo) -> Self {
        Sampler { cookie, raw, info }
    }

    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }

    pub fn info(&self) -> &SamplerCreateInfo {
        &self.info
    }
}

impl HasCookie for Sampler {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}
