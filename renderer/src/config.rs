use std::path::PathBuf;

/// Environment variable that overrides `RendererConfig::asset_root`.
pub const ASSET_ROOT_VAR: &str = "PATHTRACER_ASSETS";

/// Sample budget after which the film is presented without new dispatches.
pub const MAX_SAMPLES: u32 = 2048;

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub max_samples: u32,
    /// Swap chain images in flight.
    pub frame_count: u32,
    pub max_recursion_depth: u32,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub descriptor_heap_capacity: u32,
    /// SPIR-V library holding every ray tracing entry point, relative to `asset_root` unless absolute.
    pub shader_library: PathBuf,
    pub asset_root: PathBuf,
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let asset_root = std::env::var_os(ASSET_ROOT_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("assets"));
        Self {
            width: 1024,
            height: 576,
            max_samples: MAX_SAMPLES,
            frame_count: 2,
            max_recursion_depth: 2,
            max_payload_size: 4 * std::mem::size_of::<f32>() as u32,
            max_attribute_size: 2 * std::mem::size_of::<f32>() as u32,
            descriptor_heap_capacity: 64,
            shader_library: PathBuf::from("shaders/pathtracer.spv"),
            asset_root,
            validation: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    /// Resolves `path` against the asset root.
    pub fn asset(&self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        if path.is_absolute() {
            path
        } else {
            self.asset_root.join(path)
        }
    }

    pub fn shader_library_path(&self) -> PathBuf {
        self.asset(self.shader_library.clone())
    }
}
