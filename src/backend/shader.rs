// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. This module turns a file path or
// an in-memory blob into a shader module owned by the caller.

use ash::vk;
use std::borrow::Cow;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Device;
use crate::error::{RenderError, RenderResult, VkResultExt};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Where shader byte-code comes from.
#[derive(Debug, Clone)]
pub enum ShaderSource<'a> {
    Path(PathBuf),
    Bytes { name: &'a str, code: &'a [u8] },
}

impl<'a> ShaderSource<'a> {
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    fn name(&self) -> Cow<'_, str> {
        match self {
            Self::Path(path) => path.to_string_lossy(),
            Self::Bytes { name, .. } => Cow::Borrowed(*name),
        }
    }

    fn bytes(&self) -> RenderResult<Cow<'a, [u8]>> {
        match self {
            Self::Path(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|source| RenderError::ShaderIo {
                    path: path.clone(),
                    source,
                }),
            Self::Bytes { code, .. } => Ok(Cow::Borrowed(*code)),
        }
    }
}

/// Decode SPIR-V words, rejecting empty or malformed blobs.
pub fn read_shader_code(name: &str, bytes: &[u8]) -> RenderResult<Vec<u32>> {
    if bytes.is_empty() {
        return Err(RenderError::EmptyShader {
            name: name.to_string(),
        });
    }

    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| {
        RenderError::InvalidShader {
            name: name.to_string(),
            source,
        }
    })?;

    // read_spv already normalised endianness
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(RenderError::InvalidShader {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, "missing SPIR-V magic number"),
        });
    }
    Ok(words)
}

/// A shader module, destroyed on drop. Only needed until the pipeline exists.
pub struct ShaderModule {
    module: vk::ShaderModule,
    device: Arc<Device>,
}

impl ShaderModule {
    pub fn load(device: Arc<Device>, source: &ShaderSource<'_>) -> RenderResult<Self> {
        let name = source.name();
        let bytes = source.bytes()?;
        let code = read_shader_code(&name, &bytes)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.ash_device().create_shader_module(&create_info, None) }
            .vk_context("vkCreateShaderModule")?;

        log::debug!("Loaded shader '{}' ({} words)", name, code.len());
        Ok(Self { module, device })
    }

    pub fn raw(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device
                .ash_device()
                .destroy_shader_module(self.module, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_little_endian_words() {
        let bytes = spirv(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = read_shader_code("tri.vert", &bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn empty_blob_is_rejected() {
        let err = read_shader_code("tri.frag", &[]).unwrap_err();
        assert!(matches!(err, RenderError::EmptyShader { ref name } if name == "tri.frag"));
    }

    #[test]
    fn unaligned_blob_is_invalid() {
        let mut bytes = spirv(&[SPIRV_MAGIC, 0]);
        bytes.push(0xff);
        let err = read_shader_code("tri.vert", &bytes).unwrap_err();
        assert!(matches!(err, RenderError::InvalidShader { .. }));
    }

    #[test]
    fn text_file_is_not_spirv() {
        let err = read_shader_code("tri.vert", b"#version 450\n\0\0\0").unwrap_err();
        assert!(matches!(err, RenderError::InvalidShader { .. }));
    }

    #[test]
    fn embedded_bytes_need_no_io() {
        let blob = spirv(&[SPIRV_MAGIC, 7]);
        let source = ShaderSource::Bytes {
            name: "embedded.frag",
            code: &blob,
        };

        assert_eq!(source.name(), "embedded.frag");
        let bytes = source.bytes().unwrap();
        assert_eq!(read_shader_code(&source.name(), &bytes).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn missing_file_reports_path() {
        let source = ShaderSource::path("shaders/does-not-exist.spv");
        let err = source.bytes().unwrap_err();
        match err {
            RenderError::ShaderIo { path, source } => {
                assert_eq!(path, PathBuf::from("shaders/does-not-exist.spv"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn file_source_reads_bytes() {
        let path = std::env::temp_dir()
            .join(format!("tri-renderer-shader-{}.spv", std::process::id()));
        std::fs::write(&path, spirv(&[SPIRV_MAGIC, 0x0001_0000])).unwrap();

        let source = ShaderSource::path(&path);
        let bytes = source.bytes().unwrap();
        let words = read_shader_code(&source.name(), &bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);

        std::fs::remove_file(&path).unwrap();
    }
}
