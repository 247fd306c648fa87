pub mod buffer_resource;
pub mod command_buffer;
pub mod device_context;
pub mod error;
pub mod fence;
pub mod gpu;
pub mod image_resource;
pub mod memory;
pub mod queue;
pub mod shader_library;
pub mod swapchain;
pub mod upload_iterator;
pub mod vk_instance;

pub use error::{Error, Result};
