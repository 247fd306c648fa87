pub mod config;
pub mod context;
pub mod descriptor_heap;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod mesh;
pub mod pipeline;
pub mod presenter;
pub mod renderer;
pub mod resource_manager;
pub mod root_signature;
pub mod sampling;
pub mod scene;
pub mod scene_layout;
pub mod shader_table;
pub mod texture;

pub use ash::vk;
pub use error::{Error, Result};
