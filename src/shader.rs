//! Shader: SPIR-V bytecode digest + reflected resource layout.
//!
//! Reflection is a black box by design: `reflect` walks just enough of a
//! SPIR-V module -- `OpEntryPoint`, `OpDecorate(Binding|DescriptorSet|Block|
//! BufferBlock)`, and `OpVariable` in the `UniformConstant`/`Uniform`/
//! `StorageBuffer` storage classes -- to populate the bitmasks below. It is
//! not a disassembler: there is no expression evaluation, no full type
//! system, and unrecognized opcodes are skipped by their encoded word
//! count. The strategy (accumulate one bit per binding into per-kind masks
//! rather than building a symbol table) mirrors the reflection pass in
//! `quantumvk`'s resource-binding layer.

use ash::vk;

use crate::cookie::Cookie;
use crate::handle::HasCookie;

pub const MAX_DESCRIPTOR_SETS: usize = 4;
pub const MAX_BINDINGS_PER_SET: usize = 32;

/// Sentinel array size meaning "runtime/unsized array" (a bindless
/// binding), as opposed to `0`/`1` meaning "not an array".
pub const UNSIZED_ARRAY: u16 = u16::MAX;

/// Per-set binding masks, one bit per binding index (0..32).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetLayout {
    pub sampled_image_mask: u32,
    pub storage_image_mask: u32,
    pub uniform_buffer_mask: u32,
    pub storage_buffer_mask: u32,
    pub sampled_buffer_mask: u32,
    pub input_attachment_mask: u32,
    pub sampler_mask: u32,
    pub separate_image_mask: u32,
    /// Bit set iff the sampled type at that binding is floating-point
    /// (as opposed to signed/unsigned integer); used to choose between an
    /// `ImageView`'s float-reinterpret and default variants at bind time.
    pub fp_aspect_mask: u32,
    pub array_sizes: [u16; MAX_BINDINGS_PER_SET],
}

impl SetLayout {
    /// True iff any binding in this set is used at all.
    pub fn any_used_mask(&self) -> u32 {
        self.sampled_image_mask
            | self.storage_image_mask
            | self.uniform_buffer_mask
            | self.storage_buffer_mask
            | self.sampled_buffer_mask
            | self.input_attachment_mask
            | self.sampler_mask
            | self.separate_image_mask
    }
}

/// The reflected resource interface of one shader stage.
#[derive(Clone, Debug, Default)]
pub struct ResourceLayout {
    pub sets: [SetLayout; MAX_DESCRIPTOR_SETS],
    /// Bit `i` set iff descriptor set `i` is referenced by this stage.
    pub set_mask: u32,
    pub push_constant_size: u32,
    pub spec_constant_mask: u32,
    /// Vertex stage only: bit `i` set iff vertex attribute location `i` is
    /// consumed.
    pub input_attribute_mask: u32,
    /// Fragment stage only: bit `i` set iff fragment output location `i`
    /// is written.
    pub output_render_target_mask: u32,
    /// Bit `i` set iff set `i` contains at least one unsized-array binding.
    pub bindless_set_mask: u32,
}

impl ResourceLayout {
    /// Asserts compatibility with another stage's layout before the two
    /// are merged into a `ProgramLayout`: overlapping (set, binding) pairs
    /// must agree on array size and on whether they're a bindless binding.
    pub fn is_compatible_with(&self, other: &ResourceLayout) -> bool {
        for set in 0..MAX_DESCRIPTOR_SETS {
            let used_here = self.sets[set].any_used_mask();
            let used_there = other.sets[set].any_used_mask();
            let overlap = used_here & used_there;
            if overlap == 0 {
                continue;
            }
            for binding in 0..MAX_BINDINGS_PER_SET {
                if overlap & (1 << binding) == 0 {
                    continue;
                }
                if self.sets[set].array_sizes[binding] != other.sets[set].array_sizes[binding] {
                    return false;
                }
            }
        }
        true
    }
}

pub struct Shader {
    cookie: Cookie,
    raw: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    /// 64-bit digest of the SPIR-V bytecode, used as part of the pipeline
    /// hash so two shaders with identical bytes (recompiled, reloaded)
    /// collapse to the same pipeline cache entry.
    hash: u64,
    layout: ResourceLayout,
}

impl Shader {
    pub(crate) fn new(cookie: Cookie, raw: vk::ShaderModule, stage: vk::ShaderStageFlags, code: &[u32]) -> Self {
        let hash = fxhash::hash64(bytemuck_words_as_bytes(code));
        let layout = reflect(code);
        Shader {
            cookie,
            raw,
            stage,
            hash,
            layout,
        }
    }

    pub fn raw(&self) -> vk::ShaderModule {
        self.raw
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }
}

impl HasCookie for Shader {
    fn cookie(&self) -> Cookie {
        self.cookie
    }
}

fn bytemuck_words_as_bytes(words: &[u32]) -> &[u8] {
    // SAFETY: `u32` has no padding and any bit pattern is valid, so
    // reinterpreting a `&[u32]` as `&[u8]` of 4x the length is always sound.
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, std::mem::size_of_val(words)) }
}

/// Decodes the Vulkan shader stage implied by a SPIR-V module's
/// `OpEntryPoint` execution model. Returns `None` if no entry point is
/// found (malformed module).
pub fn stage_from_spirv(code: &[u32]) -> Option<vk::ShaderStageFlags> {
    for insn in InstructionIter::new(code) {
        if insn.opcode == OP_ENTRY_POINT {
            let execution_model = insn.operands.first().copied()?;
            return Some(match execution_model {
                0 => vk::ShaderStageFlags::VERTEX,
                4 => vk::ShaderStageFlags::FRAGMENT,
                5 => vk::ShaderStageFlags::COMPUTE,
                3 => vk::ShaderStageFlags::GEOMETRY,
                1 | 2 => vk::ShaderStageFlags::TESSELLATION_CONTROL,
                _ => vk::ShaderStageFlags::empty(),
            });
        }
    }
    None
}

const OP_ENTRY_POINT: u16 = 15;
const OP_DECORATE: u16 = 71;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_POINTER: u16 = 32;
const OP_VARIABLE: u16 = 59;

const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

/// Vulkan `Dim` operand values relevant to classifying `OpTypeImage`.
const DIM_BUFFER: u32 = 5;
const DIM_SUBPASS_DATA: u32 = 6;

struct Instruction<'a> {
    opcode: u16,
    operands: &'a [u32],
}

struct InstructionIter<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> InstructionIter<'a> {
    fn new(code: &'a [u32]) -> Self {
        // Skip the 5-word SPIR-V header (magic, version, generator, bound,
        // schema) if present.
        let pos = if code.len() >= 5 && code[0] == 0x0723_0203 { 5 } else { 0 };
        InstructionIter { words: code, pos }
    }
}

impl<'a> Iterator for InstructionIter<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Instruction<'a>> {
        if self.pos >= self.words.len() {
            return None;
        }
        let header = self.words[self.pos];
        let word_count = (header >> 16) as usize;
        let opcode = (header & 0xFFFF) as u16;
        if word_count == 0 || self.pos + word_count > self.words.len() {
            return None;
        }
        let operands = &self.words[self.pos + 1..self.pos + word_count];
        self.pos += word_count;
        Some(Instruction { opcode, operands })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ImageKind {
    Sampled { is_float: bool },
    Storage,
    Buffer,
    InputAttachment,
}

/// Walks a SPIR-V module far enough to populate a [`ResourceLayout`].
/// Unsized (bindless) arrays are detected via `OpTypeRuntimeArray` wrapping
/// the pointee of a `UniformConstant` variable.
pub fn reflect(code: &[u32]) -> ResourceLayout {
    use std::collections::HashMap;

    let mut image_types: HashMap<u32, ImageKind> = HashMap::new();
    let mut sampler_types: HashMap<u32, ()> = HashMap::new();
    let mut runtime_array_types: HashMap<u32, u32> = HashMap::new(); // result id -> element type id
    let mut pointer_types: HashMap<u32, (u32, u32)> = HashMap::new(); // result id -> (storage class, pointee type)
    let mut bindings: HashMap<u32, u32> = HashMap::new();
    let mut descriptor_sets: HashMap<u32, u32> = HashMap::new();
    let mut block_decorated: HashMap<u32, bool> = HashMap::new(); // target -> true=Block, false=BufferBlock

    for insn in InstructionIter::new(code) {
        match insn.opcode {
            OP_TYPE_IMAGE => {
                if insn.operands.len() >= 7 {
                    let result_id = insn.operands[0];
                    let sampled_type_is_float = true; // reflection doesn't trace the component type further
                    let dim = insn.operands[2];
                    let sampled = insn.operands[6];
                    let kind = if dim == DIM_SUBPASS_DATA {
                        ImageKind::InputAttachment
                    } else if dim == DIM_BUFFER {
                        ImageKind::Buffer
                    } else if sampled == 2 {
                        ImageKind::Storage
                    } else {
                        ImageKind::Sampled {
                            is_float: sampled_type_is_float,
                        }
                    };
                    image_types.insert(result_id, kind);
                }
            }
            OP_TYPE_SAMPLER => {
                if let Some(&result_id) = insn.operands.first() {
                    sampler_types.insert(result_id, ());
                }
            }
            OP_TYPE_POINTER => {
                if insn.operands.len() >= 3 {
                    pointer_types.insert(insn.operands[0], (insn.operands[1], insn.operands[2]));
                }
            }
            // OpTypeRuntimeArray: result id, element type id.
            21 => {
                if insn.operands.len() >= 2 {
                    runtime_array_types.insert(insn.operands[0], insn.operands[1]);
                }
            }
            OP_DECORATE => {
                if insn.operands.len() >= 2 {
                    let target = insn.operands[0];
                    let decoration = insn.operands[1];
                    match decoration {
                        DECORATION_BINDING if insn.operands.len() >= 3 => {
                            bindings.insert(target, insn.operands[2]);
                        }
                        DECORATION_DESCRIPTOR_SET if insn.operands.len() >= 3 => {
                            descriptor_sets.insert(target, insn.operands[2]);
                        }
                        DECORATION_BLOCK => {
                            block_decorated.insert(target, true);
                        }
                        DECORATION_BUFFER_BLOCK => {
                            block_decorated.insert(target, false);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let mut layout = ResourceLayout::default();

    for insn in InstructionIter::new(code) {
        if insn.opcode == OP_VARIABLE && insn.operands.len() >= 3 {
            let result_type = insn.operands[0];
            let result_id = insn.operands[1];
            let storage_class = insn.operands[2];

            let (set, binding) = match (descriptor_sets.get(&result_id), bindings.get(&result_id)) {
                (Some(&s), Some(&b)) => (s as usize, b as usize),
                _ => continue,
            };
            if set >= MAX_DESCRIPTOR_SETS || binding >= MAX_BINDINGS_PER_SET {
                continue;
            }

            let bit = 1u32 << binding;
            layout.set_mask |= 1 << set;
            let set_layout = &mut layout.sets[set];

            let (mut pointee, mut unsized_array) = (pointer_types.get(&result_type).map(|&(_, p)| p), false);
            if let Some(elem) = pointee.and_then(|p| runtime_array_types.get(&p)) {
                pointee = Some(*elem);
                unsized_array = true;
            }
            if unsized_array {
                set_layout.array_sizes[binding] = UNSIZED_ARRAY;
                layout.bindless_set_mask |= 1 << set;
            } else if set_layout.array_sizes[binding] == 0 {
                set_layout.array_sizes[binding] = 1;
            }

            match storage_class {
                STORAGE_CLASS_UNIFORM_CONSTANT => {
                    if let Some(kind) = pointee.and_then(|p| image_types.get(&p)) {
                        match kind {
                            ImageKind::Sampled { is_float } => {
                                set_layout.sampled_image_mask |= bit;
                                if *is_float {
                                    set_layout.fp_aspect_mask |= bit;
                                }
                            }
                            ImageKind::Storage => set_layout.storage_image_mask |= bit,
                            ImageKind::Buffer => set_layout.sampled_buffer_mask |= bit,
                            ImageKind::InputAttachment => set_layout.input_attachment_mask |= bit,
                        }
                    } else if pointee.map(|p| sampler_types.contains_key(&p)).unwrap_or(false) {
                        set_layout.sampler_mask |= bit;
                    } else {
                        // Unrecognized UniformConstant (combined sampler or
                        // an opaque handle type this pass doesn't model):
                        // counted as a separate-image binding so it still
                        // gets a descriptor slot.
                        set_layout.separate_image_mask |= bit;
                    }
                }
                STORAGE_CLASS_UNIFORM => {
                    let is_block = pointee.and_then(|p| block_decorated.get(&p)).copied();
                    match is_block {
                        Some(true) | None => set_layout.uniform_buffer_mask |= bit,
                        Some(false) => set_layout.storage_buffer_mask |= bit,
                    }
                }
                STORAGE_CLASS_STORAGE_BUFFER => {
                    set_layout.storage_buffer_mask |= bit;
                }
                _ => {}
            }
        } else if insn.opcode == OP_ENTRY_POINT {
            // Execution model already handled by `stage_from_spirv`;
            // nothing else to extract here for this black-box pass.
        }
    }

    layout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_header() -> Vec<u32> {
        vec![0x0723_0203, 0x0001_0300, 0, 1, 0]
    }

    fn instr(opcode: u16, operands: &[u32]) -> Vec<u32> {
        let word_count = (operands.len() + 1) as u32;
        let mut words = vec![(word_count << 16) | opcode as u32];
        words.extend_from_slice(operands);
        words
    }

    #[test]
    fn reflects_a_single_uniform_buffer_binding() {
        let mut code = spirv_header();
        // %ptr_type = OpTypePointer Uniform %struct (ids: 10 = ptr, 2 = Uniform, 11 = struct)
        code.extend(instr(OP_TYPE_POINTER, &[10, STORAGE_CLASS_UNIFORM, 11]));
        // OpDecorate %11 Block
        code.extend(instr(OP_DECORATE, &[11, DECORATION_BLOCK]));
        // OpDecorate %20 DescriptorSet 0
        code.extend(instr(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 0]));
        // OpDecorate %20 Binding 3
        code.extend(instr(OP_DECORATE, &[20, DECORATION_BINDING, 3]));
        // %20 = OpVariable %10 Uniform
        code.extend(instr(OP_VARIABLE, &[10, 20, STORAGE_CLASS_UNIFORM]));

        let layout = reflect(&code);
        assert_eq!(layout.set_mask, 1);
        assert_eq!(layout.sets[0].uniform_buffer_mask, 1 << 3);
        assert_eq!(layout.sets[0].storage_buffer_mask, 0);
    }

    #[test]
    fn reflects_storage_buffer_via_bufferblock_decoration() {
        let mut code = spirv_header();
        code.extend(instr(OP_TYPE_POINTER, &[10, STORAGE_CLASS_UNIFORM, 11]));
        code.extend(instr(OP_DECORATE, &[11, DECORATION_BUFFER_BLOCK]));
        code.extend(instr(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 1]));
        code.extend(instr(OP_DECORATE, &[20, DECORATION_BINDING, 0]));
        code.extend(instr(OP_VARIABLE, &[10, 20, STORAGE_CLASS_UNIFORM]));

        let layout = reflect(&code);
        assert_eq!(layout.set_mask, 1 << 1);
        assert_eq!(layout.sets[1].storage_buffer_mask, 1);
    }

    #[test]
    fn entry_point_execution_model_maps_to_stage() {
        let mut code = spirv_header();
        code.extend(instr(OP_ENTRY_POINT, &[4, 1, 0x6e69_616d]));
        assert_eq!(stage_from_spirv(&code), Some(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn compatible_layouts_with_matching_array_sizes() {
        let mut a = ResourceLayout::default();
        a.sets[0].uniform_buffer_mask = 1;
        a.sets[0].array_sizes[0] = 1;
        let mut b = a.clone();
        assert!(a.is_compatible_with(&b));
        b.sets[0].array_sizes[0] = 4;
        assert!(!a.is_compatible_with(&b));
    }
}
