//! Resource wrappers: `Buffer`, `Image`, `ImageView`, `Sampler`, `BufferView`.
//!
//! Each wraps a raw handle, an allocation record (where applicable), and
//! just enough metadata -- format, usage, layout family, access mask,
//! queue-ownership mode -- for the command buffer recorder and the
//! render-pass synthesizer to make decisions without re-querying the
//! driver. None of these types destroy anything on `Drop`; dropping the
//! last [`crate::handle::Handle`] referencing one enqueues it on the
//! current frame's destroy list instead (see [`crate::frame_context`]).

pub mod buffer;
pub mod buffer_view;
pub mod image;
pub mod image_view;
pub mod sampler;

pub use buffer::Buffer;
pub use buffer_view::BufferView;
pub use image::Image;
pub use image_view::ImageView;
pub use sampler::Sampler;

use smallvec::SmallVec;

/// How a resource's underlying `VkBuffer`/`VkImage` is shared across queue
/// families.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SharingMode {
    /// Owned by exactly one queue family at a time -- the one named here.
    /// Transferring ownership to another family requires the explicit
    /// release/acquire barrier pair before the new owner may touch the
    /// resource.
    Exclusive(u32),
    /// Owned concurrently by the listed queue families; no ownership
    /// barriers are needed, at some cost to driver-side cache coherency.
    Concurrent(SmallVec<[u32; 4]>),
}

impl SharingMode {
    pub fn to_vk(&self) -> (ash::vk::SharingMode, &[u32]) {
        match self {
            SharingMode::Exclusive(_) => (ash::vk::SharingMode::EXCLUSIVE, &[]),
            SharingMode::Concurrent(families) => (ash::vk::SharingMode::CONCURRENT, families.as_slice()),
        }
    }

    /// The queue family that currently owns the resource under `Exclusive`
    /// sharing, or `None` under `Concurrent` (where ownership doesn't apply).
    pub fn owner(&self) -> Option<u32> {
        match self {
            SharingMode::Exclusive(family) => Some(*family),
            SharingMode::Concurrent(_) => None,
        }
    }

    /// Builds a `Concurrent` sharing mode from a caller's declared owner
    /// set, deduplicating and dropping to `Exclusive` if only one family is
    /// named -- `CONCURRENT` with a single family is meaningless and some
    /// validation layers reject it.
    pub fn from_owners(owners: &[u32]) -> SharingMode {
        let mut families: SmallVec<[u32; 4]> = owners.iter().copied().collect();
        families.sort_unstable();
        families.dedup();
        if families.len() <= 1 {
            SharingMode::Exclusive(families.first().copied().unwrap_or(0))
        } else {
            SharingMode::Concurrent(families)
        }
    }
}
