//! Render pass synthesis: deriving a `VkRenderPass` (attachments, subpass
//! dependencies, layouts) from a high-level [`RenderPassInfo`], with
//! temporal caching of the resulting native objects.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use ash::vk;
use fxhash::FxHasher;
use smallvec::SmallVec;

use crate::format::Format;
use crate::resources::image::ImageMiscFlags;

bitflags::bitflags! {
    /// Per-attachment operation bits, indexed by attachment slot (color
    /// attachments first, then the depth/stencil attachment if present).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct AttachmentOpFlags: u32 {
        const NONE = 0;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ColorAttachment {
    pub format: Format,
    pub samples: vk::SampleCountFlags,
    pub transient: bool,
    pub swapchain: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthStencilAttachment {
    pub format: Format,
    pub samples: vk::SampleCountFlags,
    pub transient: bool,
    /// Depth written as well as tested, vs. read-only (e.g. a depth
    /// pre-pass feeding a later sampling pass).
    pub read_only: bool,
}

/// Which attachments a subpass touches and in what role. Indices are into
/// the render pass's flattened `[color..., depth_stencil?]` attachment
/// list.
#[derive(Clone, Debug, Default)]
pub struct SubpassInfo {
    pub color_attachments: SmallVec<[u32; 8]>,
    pub resolve_attachments: SmallVec<[u32; 8]>,
    pub input_attachments: SmallVec<[u32; 8]>,
    pub depth_stencil_attachment: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct RenderPassInfo {
    pub color: SmallVec<[ColorAttachment; 8]>,
    pub depth_stencil: Option<DepthStencilAttachment>,
    /// Bit `i` set iff attachment `i` should be cleared at pass start.
    pub clear_mask: u32,
    /// Bit `i` set iff attachment `i`'s prior contents should be loaded.
    pub load_mask: u32,
    /// Bit `i` set iff attachment `i`'s contents should be stored at pass
    /// end.
    pub store_mask: u32,
    pub multiview_mask: u32,
    pub base_layer: u32,
    pub num_layers: u32,
    pub subpasses: SmallVec<[SubpassInfo; 4]>,
}

impl RenderPassInfo {
    fn attachment_count(&self) -> usize {
        self.color.len() + self.depth_stencil.is_some() as usize
    }

    fn depth_stencil_index(&self) -> Option<u32> {
        self.depth_stencil.as_ref().map(|_| self.color.len() as u32)
    }

    /// If the caller left `subpasses` empty, synthesize a single default
    /// subpass writing every color attachment and read-writing the depth
    /// attachment, if present.
    fn effective_subpasses(&self) -> SmallVec<[SubpassInfo; 4]> {
        if !self.subpasses.is_empty() {
            return self.subpasses.clone();
        }
        let mut subpass = SubpassInfo::default();
        subpass.color_attachments = (0..self.color.len() as u32).collect();
        subpass.depth_stencil_attachment = self.depth_stencil_index();
        let mut subpasses = SmallVec::new();
        subpasses.push(subpass);
        subpasses
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DepthMode {
    ReadWrite,
    ReadOnly,
}

/// Tracks, per attachment, the layout it's currently in as subpasses are
/// walked in order -- used both to emit the `VkAttachmentDescription`'s
/// `initialLayout` (the first observed layout) and to synthesize
/// dependencies at each layout change.
struct LayoutTracker {
    current: Vec<vk::ImageLayout>,
    first_use_subpass: Vec<Option<u32>>,
    last_use_subpass: Vec<Option<u32>>,
}

impl LayoutTracker {
    fn new(count: usize, initial: vk::ImageLayout) -> Self {
        LayoutTracker {
            current: vec![initial; count],
            first_use_subpass: vec![None; count],
            last_use_subpass: vec![None; count],
        }
    }
}

/// The derived, ready-to-create-or-hash shape of a render pass: attachment
/// descriptions, subpass descriptions (as index lists; native structs are
/// assembled at creation time since they borrow from these vectors),
/// and dependencies.
pub struct DerivedRenderPass {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: SmallVec<[SubpassInfo; 4]>,
    pub dependencies: Vec<vk::SubpassDependency>,
    pub multiview_mask: u32,
    pub color_count: u32,
    pub has_depth_stencil: bool,
}

/// Derives attachment descriptions, subpass layouts, and dependencies from
/// `info`, per the rules in this crate's render-pass synthesis contract:
/// transient attachments force `UNDEFINED`/`DONT_CARE` unless overridden by
/// the load/store masks; swapchain attachments force `PRESENT_SRC_KHR` as
/// their final layout (and, if loaded, their initial layout too) and pick
/// up an implicit bottom-of-pipe external dependency; attachments that
/// double as a same-subpass input get `GENERAL` and a self-dependency.
pub fn derive(info: &RenderPassInfo) -> DerivedRenderPass {
    let count = info.attachment_count();
    let depth_index = info.depth_stencil_index();
    let subpasses = info.effective_subpasses();

    let mut attachments = Vec::with_capacity(count);
    let mut tracker = LayoutTracker::new(count, vk::ImageLayout::UNDEFINED);

    for i in 0..count {
        let bit = 1u32 << i;
        let clear = info.clear_mask & bit != 0;
        let load = info.load_mask & bit != 0;
        let store = info.store_mask & bit != 0;

        let (format, samples, transient, swapchain) = if let Some(&di) = depth_index.as_ref().filter(|&&di| di as usize == i) {
            let _ = di;
            let ds = info.depth_stencil.unwrap();
            (ds.format, ds.samples, ds.transient, false)
        } else {
            let c = info.color[i];
            (c.format, c.samples, c.transient, c.swapchain)
        };

        let load_op = if clear {
            vk::AttachmentLoadOp::CLEAR
        } else if load {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        let mut store_op = if store {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        };

        let mut initial_layout = vk::ImageLayout::UNDEFINED;
        let mut final_layout = vk::ImageLayout::UNDEFINED; // filled in after the subpass walk, below

        if transient {
            initial_layout = vk::ImageLayout::UNDEFINED;
            if !store {
                store_op = vk::AttachmentStoreOp::DONT_CARE;
            }
        }
        if swapchain {
            final_layout = vk::ImageLayout::PRESENT_SRC_KHR;
            initial_layout = if load {
                vk::ImageLayout::PRESENT_SRC_KHR
            } else {
                vk::ImageLayout::UNDEFINED
            };
        }

        tracker.current[i] = initial_layout;

        attachments.push(
            vk::AttachmentDescription::default()
                .format(format.to_vk())
                .samples(samples)
                .load_op(load_op)
                .store_op(store_op)
                .stencil_load_op(load_op)
                .stencil_store_op(store_op)
                .initial_layout(initial_layout)
                .final_layout(final_layout),
        );
    }

    let mut dependencies = Vec::new();

    for (subpass_index, subpass) in subpasses.iter().enumerate() {
        let subpass_index = subpass_index as u32;

        let mut self_dependency = false;

        for &ci in &subpass.color_attachments {
            let is_also_input = subpass.input_attachments.contains(&ci);
            let layout = if is_also_input {
                self_dependency = true;
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            transition(&mut attachments, &mut tracker, &mut dependencies, ci, layout, subpass_index);
        }
        for &ri in &subpass.resolve_attachments {
            transition(
                &mut attachments,
                &mut tracker,
                &mut dependencies,
                ri,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                subpass_index,
            );
        }
        if let Some(di) = subpass.depth_stencil_attachment {
            let is_also_input = subpass.input_attachments.contains(&di);
            let mode = if info.depth_stencil.map(|d| d.read_only).unwrap_or(false) {
                DepthMode::ReadOnly
            } else {
                DepthMode::ReadWrite
            };
            let layout = if is_also_input {
                self_dependency = true;
                vk::ImageLayout::GENERAL
            } else {
                match mode {
                    DepthMode::ReadWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    DepthMode::ReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                }
            };
            transition(&mut attachments, &mut tracker, &mut dependencies, di, layout, subpass_index);
        }
        for &ii in &subpass.input_attachments {
            let is_color_or_depth = subpass.color_attachments.contains(&ii) || subpass.depth_stencil_attachment == Some(ii);
            if is_color_or_depth {
                continue; // already transitioned to GENERAL above as a self-dependency.
            }
            let target = if tracker.current[ii as usize] == vk::ImageLayout::GENERAL {
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            };
            transition(&mut attachments, &mut tracker, &mut dependencies, ii, target, subpass_index);
        }

        if self_dependency {
            dependencies.push(
                vk::SubpassDependency::default()
                    .src_subpass(subpass_index)
                    .dst_subpass(subpass_index)
                    .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                    .dst_access_mask(vk::AccessFlags::INPUT_ATTACHMENT_READ)
                    .dependency_flags(vk::DependencyFlags::BY_REGION),
            );
        }
        if subpass_index > 0 {
            dependencies.push(
                vk::SubpassDependency::default()
                    .src_subpass(subpass_index - 1)
                    .dst_subpass(subpass_index)
                    .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::COLOR_ATTACHMENT_READ)
                    .dependency_flags(vk::DependencyFlags::BY_REGION),
            );
        }
    }

    // Fix up final layouts: swapchain attachments were pinned above;
    // everything else's final layout is whatever it was last transitioned
    // to by the subpass walk.
    for i in 0..count {
        let is_depth_stencil = depth_index.map(|di| di as usize == i).unwrap_or(false);
        let is_swapchain = !is_depth_stencil && info.color[i].swapchain;
        if !is_swapchain {
            attachments[i].final_layout = tracker.current[i];
        }

        // Swapchain attachments pick up the implicit bottom-of-pipe
        // external dependency for their first-use transition.
        if is_swapchain {
            if let Some(first_use) = tracker.first_use_subpass[i] {
                dependencies.push(
                    vk::SubpassDependency::default()
                        .src_subpass(vk::SUBPASS_EXTERNAL)
                        .dst_subpass(first_use)
                        .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                        .src_access_mask(vk::AccessFlags::empty())
                        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                        .dependency_flags(vk::DependencyFlags::empty()),
                );
            }
        }
    }

    let color_count = info.color.len() as u32;
    let has_depth_stencil = info.depth_stencil.is_some();

    DerivedRenderPass {
        attachments,
        subpasses,
        dependencies,
        multiview_mask: info.multiview_mask,
        color_count,
        has_depth_stencil,
    }
}

fn transition(
    attachments: &mut [vk::AttachmentDescription],
    tracker: &mut LayoutTracker,
    dependencies: &mut Vec<vk::SubpassDependency>,
    attachment: u32,
    new_layout: vk::ImageLayout,
    subpass_index: u32,
) {
    let i = attachment as usize;
    if tracker.first_use_subpass[i].is_none() {
        tracker.first_use_subpass[i] = Some(subpass_index);
        if attachments[i].initial_layout == vk::ImageLayout::UNDEFINED && new_layout != vk::ImageLayout::UNDEFINED {
            // first use establishes the attachment's working layout; an
            // external dependency covers UNDEFINED -> new_layout implicitly
            // via subpass dependency src/dst masks, so nothing to push here
            // unless the attachment is swapchain-owned (handled by caller).
        }
    }
    tracker.current[i] = new_layout;
    tracker.last_use_subpass[i] = Some(subpass_index);
}

/// Which parts of a `RenderPassInfo` feed the hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashMode {
    /// Format + subpass structure only, for pipeline compatibility.
    Compatible,
    /// Everything, for the actual `VkRenderPass` cache key.
    Full,
}

pub fn hash(info: &RenderPassInfo, mode: HashMode) -> u64 {
    let mut hasher = FxHasher::default();
    for c in &info.color {
        c.format.hash(&mut hasher);
        c.samples.as_raw().hash(&mut hasher);
        c.transient.hash(&mut hasher);
        c.swapchain.hash(&mut hasher);
    }
    if let Some(ds) = &info.depth_stencil {
        ds.format.hash(&mut hasher);
        ds.samples.as_raw().hash(&mut hasher);
        ds.transient.hash(&mut hasher);
    }
    for subpass in info.effective_subpasses() {
        subpass.color_attachments.hash(&mut hasher);
        subpass.resolve_attachments.hash(&mut hasher);
        subpass.input_attachments.hash(&mut hasher);
        subpass.depth_stencil_attachment.hash(&mut hasher);
    }
    info.multiview_mask.hash(&mut hasher);

    if mode == HashMode::Full {
        info.clear_mask.hash(&mut hasher);
        info.load_mask.hash(&mut hasher);
        info.store_mask.hash(&mut hasher);
        info.base_layer.hash(&mut hasher);
        info.num_layers.hash(&mut hasher);
    }

    hasher.finish()
}

/// Temporal cache of real `VkRenderPass` objects, keyed by full hash.
/// Render passes are cheap relative to framebuffers (far fewer distinct
/// ones ever exist) so this cache never evicts; it only grows for the
/// lifetime of the device.
#[derive(Default)]
pub struct RenderPassCache {
    by_hash: HashMap<u64, vk::RenderPass>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: u64) -> Option<vk::RenderPass> {
        self.by_hash.get(&hash).copied()
    }

    pub fn insert(&mut self, hash: u64, render_pass: vk::RenderPass) {
        self.by_hash.insert(hash, render_pass);
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, rp) in self.by_hash.drain() {
            unsafe { device.destroy_render_pass(rp, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_info(transient: bool, swapchain: bool) -> RenderPassInfo {
        RenderPassInfo {
            color: SmallVec::from_vec(vec![ColorAttachment {
                format: Format::R8G8B8A8Unorm,
                samples: vk::SampleCountFlags::TYPE_1,
                transient,
                swapchain,
            }]),
            depth_stencil: None,
            clear_mask: 1,
            load_mask: 0,
            store_mask: 1,
            multiview_mask: 0,
            base_layer: 0,
            num_layers: 1,
            subpasses: SmallVec::new(),
        }
    }

    #[test]
    fn compatible_hash_ignores_clear_mask() {
        let a = simple_info(false, false);
        let mut b = a.clone();
        b.clear_mask = 0;
        assert_eq!(hash(&a, HashMode::Compatible), hash(&b, HashMode::Compatible));
        assert_ne!(hash(&a, HashMode::Full), hash(&b, HashMode::Full));
    }

    #[test]
    fn swapchain_attachment_forces_present_src_final_layout() {
        let info = simple_info(false, true);
        let derived = derive(&info);
        assert_eq!(derived.attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn transient_without_store_bit_is_dont_care() {
        let mut info = simple_info(true, false);
        info.store_mask = 0;
        let derived = derive(&info);
        assert_eq!(derived.attachments[0].store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn self_referencing_input_attachment_gets_general_layout_and_dependency() {
        let mut info = simple_info(false, false);
        let mut subpass = SubpassInfo::default();
        subpass.color_attachments.push(0);
        subpass.input_attachments.push(0);
        info.subpasses.push(subpass);
        let derived = derive(&info);
        assert!(derived
            .dependencies
            .iter()
            .any(|d| d.src_subpass == 0 && d.dst_subpass == 0));
    }
}
