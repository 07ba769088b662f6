//! A low-level, explicit graphics device abstraction over Vulkan: command
//! buffer recording with dirty-tracked state, per-frame deferred
//! destruction, cross-queue resource creation and submission, and
//! render-pass/framebuffer synthesis from attachment descriptions alone.
//!
//! Nothing here is returned to the host as a `Result` past the point of
//! creation: see [`error`] for the logging-based failure policy every
//! fallible operation follows.

pub mod attachment_cache;
pub mod command_buffer;
pub mod cookie;
pub mod descriptor_set;
pub mod device;
pub mod error;
pub mod format;
pub mod frame_context;
pub mod framebuffer;
pub mod handle;
pub mod instance;
pub mod memory;
pub mod program;
pub mod queue;
pub mod render_pass;
pub mod resources;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use cookie::{Cookie, CookieAllocator};
pub use device::Device;
pub use error::DeviceError;
pub use format::Format;
pub use handle::{HasCookie, Handle};
pub use instance::{create_instance_and_device, create_instance_and_device_with_surface, PhysicalDeviceInfo, QueueInfo, Queues};
pub use swapchain::Swapchain;
