//! Program & ProgramLayout: the set-union of a fixed map of shader stages,
//! plus the pipeline-handle cache hung off of it.

use std::collections::HashMap;
use std::sync::Mutex;

use ash::vk;

use crate::cookie::Cookie;
use crate::handle::{HasCookie, Handle};
use crate::shader::{ResourceLayout, Shader, MAX_DESCRIPTOR_SETS};

/// The set-union of every stage's [`ResourceLayout`], with consistency
/// assertions on array size and bindless-ness already checked by the time
/// this exists (`ProgramLayout::merge` is the only constructor).
#[derive(Clone, Debug, Default)]
pub struct ProgramLayout {
    /// Bit `s` set iff descriptor set `s` is used by any stage.
    pub descriptor_set_mask: u32,
    /// Per (set, binding), the `vk::ShaderStageFlags` of every stage that
    /// references it -- drives `VkDescriptorSetLayoutBinding::stageFlags`.
    pub stage_visibility: [[vk::ShaderStageFlags; crate::shader::MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
    pub combined: [crate::shader::SetLayout; MAX_DESCRIPTOR_SETS],
    pub push_constant_range: vk::PushConstantRange,
    pub spec_constant_mask: u32,
    pub bindless_set_mask: u32,
}

impl ProgramLayout {
    /// Merges the per-stage layouts of `shaders` into one `ProgramLayout`.
    /// Returns `None` if two stages disagree on the array size of a shared
    /// binding (a precondition violation the device facade turns into an
    /// `UnsupportedFeature` error).
    pub fn merge(shaders: &[(vk::ShaderStageFlags, &ResourceLayout)]) -> Option<ProgramLayout> {
        let mut layout = ProgramLayout::default();
        let mut push_constant_size = 0u32;

        for (stage, resource_layout) in shaders {
            for (a, b) in shaders {
                if a == stage {
                    continue;
                }
                if !resource_layout.is_compatible_with(b) {
                    return None;
                }
            }

            layout.descriptor_set_mask |= resource_layout.set_mask;
            layout.bindless_set_mask |= resource_layout.bindless_set_mask;
            layout.spec_constant_mask |= resource_layout.spec_constant_mask;
            push_constant_size = push_constant_size.max(resource_layout.push_constant_size);

            for set in 0..MAX_DESCRIPTOR_SETS {
                let src = &resource_layout.sets[set];
                let dst = &mut layout.combined[set];
                dst.sampled_image_mask |= src.sampled_image_mask;
                dst.storage_image_mask |= src.storage_image_mask;
                dst.uniform_buffer_mask |= src.uniform_buffer_mask;
                dst.storage_buffer_mask |= src.storage_buffer_mask;
                dst.sampled_buffer_mask |= src.sampled_buffer_mask;
                dst.input_attachment_mask |= src.input_attachment_mask;
                dst.sampler_mask |= src.sampler_mask;
                dst.separate_image_mask |= src.separate_image_mask;
                dst.fp_aspect_mask |= src.fp_aspect_mask;

                let used = src.any_used_mask();
                for binding in 0..crate::shader::MAX_BINDINGS_PER_SET {
                    if used & (1 << binding) != 0 {
                        if dst.array_sizes[binding] == 0 {
                            dst.array_sizes[binding] = src.array_sizes[binding];
                        }
                        layout.stage_visibility[set][binding] |= *stage;
                    }
                }
            }
        }

        layout.push_constant_range = vk::PushConstantRange {
            stage_flags: shaders.iter().fold(vk::ShaderStageFlags::empty(), |acc, (s, _)| acc | *s),
            offset: 0,
            size: push_constant_size,
        };

        Some(layout)
    }
}

/// Fixed map `ShaderStage → Shader`, plus the derived [`ProgramLayout`] and
/// a memoized `pipeline-hash → pipeline-handle` map. Any pipeline variant
/// built for any command buffer against this program is cached here, so a
/// second command buffer requesting the same dirty-state combination never
/// re-calls `vkCreateGraphicsPipelines`.
pub struct Program {
    cookie: Cookie,
    shaders: HashMap<vk::ShaderStageFlags, Handle<Shader>>,
    layout: ProgramLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pipelines: Mutex<HashMap<u64, vk::Pipeline>>,
}

impl Program {
    pub(crate) fn new(
        cookie: Cookie,
        shaders: HashMap<vk::ShaderStageFlags, Handle<Shader>>,
        layout: ProgramLayout,
        pipeline_layout: vk::PipelineLayout,
        descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    ) -> Self {
        Program {
            cookie,
            shaders,
            layout,
            pipeline_layout,
            descriptor_set_layouts,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn shader(&self, stage: vk::ShaderStageFlags) -> Option<&Handle<Shader>> {
        self.shaders.get(&stage)
    }

    pub fn shaders(&self) -> impl Iterator<Item = (&vk::ShaderStageFlags, &Handle<Shader>)> {
        self.shaders.iter()
    }

    pub fn layout(&self) -> &ProgramLayout {
        &self.layout
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn descriptor_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.descriptor_set_layouts
    }

    /// Combined hash of this program's shader stage hashes, used as the
    /// stage-identity component of a pipeline hash.
    pub fn stage_identity_hash(&self) -> u64 {
        let mut stages: Vec<_> = self.shaders.iter().collect();
        stages.sort_by_key(|(stage, _)| stage.as_raw());
        let mut hasher = fxhash::FxHasher::default();
        use std::hash::Hasher;
        for (stage, shader) in stages {
            hasher.write_u32(stage.as_raw());
            hasher.write_u64(shader.hash());
        }
        hasher.finish()
    }

    /// Looks up a memoized pipeline for `pipeline_hash`, or inserts one
    /// built by `build`. `build` is only called while the lock is held by
    /// this call, so two threads racing to build the same pipeline never
    /// both succeed -- the second sees the first's cached result instead.
    pub fn get_or_build_pipeline(
        &self,
        pipeline_hash: u64,
        build: impl FnOnce() -> vk::Pipeline,
    ) -> vk::Pipeline {
        let mut pipelines = self.pipelines.lock().unwrap();
        *pipelines.entry(pipeline_hash).or_insert_with(build)
    }

    pub(crate) fn into_raw_parts(
        self,
    ) -> (
        vk::PipelineLayout,
        Vec<vk::DescriptorSetLayout>,
        Vec<vk::Pipeline>,
    ) {
        let pipelines = self.pipelines.into_inner().unwrap().into_values().collect();
        (self.pipeline_layout, self.descriptor_set_layouts, pipelines)
    }
}

impl HasCookie for Program {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::SetLayout;

    #[test]
    fn merge_unions_stage_visibility() {
        let mut vs_layout = ResourceLayout::default();
        vs_layout.set_mask = 1;
        vs_layout.sets[0] = SetLayout {
            uniform_buffer_mask: 1,
            array_sizes: {
                let mut a = [0u16; crate::shader::MAX_BINDINGS_PER_SET];
                a[0] = 1;
                a
            },
            ..Default::default()
        };
        let mut fs_layout = ResourceLayout::default();
        fs_layout.set_mask = 1;
        fs_layout.sets[0] = SetLayout {
            uniform_buffer_mask: 1,
            sampled_image_mask: 1 << 1,
            array_sizes: {
                let mut a = [0u16; crate::shader::MAX_BINDINGS_PER_SET];
                a[0] = 1;
                a[1] = 1;
                a
            },
            ..Default::default()
        };

        let merged = ProgramLayout::merge(&[
            (vk::ShaderStageFlags::VERTEX, &vs_layout),
            (vk::ShaderStageFlags::FRAGMENT, &fs_layout),
        ])
        .unwrap();

        assert_eq!(merged.descriptor_set_mask, 1);
        assert!(merged.stage_visibility[0][0].contains(vk::ShaderStageFlags::VERTEX));
        assert!(merged.stage_visibility[0][0].contains(vk::ShaderStageFlags::FRAGMENT));
        assert!(merged.stage_visibility[0][1].contains(vk::ShaderStageFlags::FRAGMENT));
        assert!(!merged.stage_visibility[0][1].contains(vk::ShaderStageFlags::VERTEX));
    }

    #[test]
    fn merge_rejects_mismatched_array_sizes() {
        let mut a = ResourceLayout::default();
        a.set_mask = 1;
        a.sets[0].sampled_image_mask = 1;
        a.sets[0].array_sizes[0] = 1;
        let mut b = ResourceLayout::default();
        b.set_mask = 1;
        b.sets[0].sampled_image_mask = 1;
        b.sets[0].array_sizes[0] = 8;

        let merged = ProgramLayout::merge(&[
            (vk::ShaderStageFlags::VERTEX, &a),
            (vk::ShaderStageFlags::FRAGMENT, &b),
        ]);
        assert!(merged.is_none());
    }
}
