use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] vk_utils::Error),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("malformed PLY file: {0}")]
    Ply(String),

    #[error("descriptor heap exhausted ({capacity} descriptors)")]
    DescriptorHeapExhausted { capacity: u32 },

    #[error("invalid state object: {0}")]
    StateObject(String),

    #[error("shader export {0} not found in the pipeline")]
    ExportNotFound(String),

    #[error("no device supports hardware ray tracing")]
    UnsupportedDevice,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
