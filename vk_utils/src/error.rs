use std::path::PathBuf;

use ash::vk::{MemoryPropertyFlags, QueueFlags};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("vulkan loader unavailable: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("no memory type in {type_bits:#b} supports {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: MemoryPropertyFlags,
    },

    #[error("no queue family supports {0:?}")]
    NoQueueFamily(QueueFlags),

    #[error("queue family {0} cannot present to the surface")]
    PresentUnsupported(u32),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SPIR-V blob {0} is not a whole number of words")]
    MisalignedSpirv(PathBuf),

    #[error("record of {size} bytes does not fit stride {stride}")]
    RecordTooLarge { size: usize, stride: usize },

    #[error("record {index} lies outside a mapped range of {capacity} bytes")]
    RecordOutOfRange { index: usize, capacity: usize },

    #[error("buffer is not host visible")]
    NotHostVisible,
}

pub type Result<T> = std::result::Result<T, Error>;
