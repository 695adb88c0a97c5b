// Backend module - Vulkan abstraction layer
//
// Design: thin wrappers around ash with explicit lifetimes and a narrow
// protocol seam for the frame loop.

pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod upload;

pub use device::DeviceContext;
pub use error::{RenderError, RenderResult};
pub use swapchain::Swapchain;
