use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;

use ash::vk::{ShaderModule, ShaderModuleCreateInfo, ShaderStageFlags};
use byteorder::{NativeEndian, ReadBytesExt};

use crate::device_context::DeviceContext;
use crate::{Error, Result};

/// Reads a SPIR-V binary. The file must hold a whole number of 32-bit words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let io_error = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut bytes))
        .map_err(io_error)?;
    if bytes.len() % 4 != 0 {
        return Err(Error::MisalignedSpirv(path.to_path_buf()));
    }

    let mut words = vec![0; bytes.len() / 4];
    std::io::Cursor::new(bytes)
        .read_u32_into::<NativeEndian>(&mut words)
        .map_err(io_error)?;
    Ok(words)
}

/// One exported entry point of a library.
#[derive(Clone, Debug)]
pub struct ShaderExport {
    pub name: String,
    pub entry_point: CString,
    pub stage: ShaderStageFlags,
}

/// A single shader module holding several named entry points.
pub struct ShaderLibrary {
    device: Rc<DeviceContext>,
    module: ShaderModule,
    exports: Vec<ShaderExport>,
}

impl ShaderLibrary {
    pub fn new(device: Rc<DeviceContext>, code: &[u32]) -> Result<Self> {
        let info = ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { device.vk_device().create_shader_module(&info, None)? };
        Ok(Self {
            device,
            module,
            exports: Vec::new(),
        })
    }

    pub fn from_file(device: Rc<DeviceContext>, path: &Path) -> Result<Self> {
        let code = load_spirv(path)?;
        Self::new(device, &code)
    }

    /// Declares an entry point under `name`. Entry point names that contain an interior
    /// nul are truncated at it.
    pub fn export(&mut self, name: &str, stage: ShaderStageFlags) {
        let entry_point = CString::new(name).unwrap_or_default();
        self.exports.push(ShaderExport {
            name: name.to_string(),
            entry_point,
            stage,
        });
    }

    pub fn module(&self) -> ShaderModule {
        self.module
    }

    pub fn exports(&self) -> &[ShaderExport] {
        &self.exports
    }

    pub fn get(&self, name: &str) -> Option<&ShaderExport> {
        self.exports.iter().find(|export| export.name == name)
    }
}

impl Drop for ShaderLibrary {
    fn drop(&mut self) {
        unsafe { self.device.vk_device().destroy_shader_module(self.module, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_whole_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let words: [u32; 3] = [0x0723_0203, 0x0001_0000, 42];
        for word in words {
            file.write_all(&word.to_ne_bytes()).unwrap();
        }
        assert_eq!(load_spirv(file.path()).unwrap(), words.to_vec());
    }

    #[test]
    fn rejects_partial_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        assert!(matches!(
            load_spirv(file.path()),
            Err(Error::MisalignedSpirv(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.spv"));
    }
}
