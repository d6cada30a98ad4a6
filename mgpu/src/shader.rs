use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a multiple of 4")]
    InvalidLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// The pipeline stage a SPIR-V entry point is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// An owned `VkShaderModule` built from a precompiled SPIR-V blob.
///
/// The blob arrives as opaque bytes from whatever loaded it off disk; this
/// crate performs no shader compilation.
pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `spirv_bytes` must have a length that is a multiple of 4. If the
    /// bytes are not already aligned to `u32`, they are copied internally.
    pub fn new(device: &Arc<Device>, spirv_bytes: &[u8]) -> Result<Self, CreateShaderModuleError> {
        if !spirv_bytes.len().is_multiple_of(4) {
            return Err(CreateShaderModuleError::InvalidLength(spirv_bytes.len()));
        }

        // Reinterpret bytes as u32 words. If the slice is already
        // u32-aligned we borrow it directly; otherwise we copy into a
        // temporary Vec. SPIR-V is defined as little-endian, so the copy
        // path uses from_le_bytes; the borrow path is only reached on
        // little-endian targets where native and SPIR-V byte order match.
        //
        //SAFETY: u32 has no invalid bit patterns and the length was verified
        //to be a multiple of 4, so the reinterpretation is sound
        let (prefix, aligned_words, _suffix) = unsafe { spirv_bytes.align_to::<u32>() };
        let owned;
        let code: &[u32] = if prefix.is_empty() {
            aligned_words
        } else {
            owned = spirv_bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect::<Vec<u32>>();
            &owned
        };

        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        //SAFETY: create_info contains valid SPIR-V code words
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;
        tracing::info!("Created shader module {:?}", handle);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Create an [`EntryPoint`] view into this module for the given entry
    /// point name and shader stage.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        //SAFETY: handle was created from parent; pipelines built from this
        //module hold no reference to it after pipeline creation returns
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A borrow-view pairing a [`ShaderModule`] with a specific entry point name
/// and pipeline stage.
///
/// Created via [`ShaderModule::entry_point`]. The lifetime ties this view to
/// the module so stage create infos derived from it cannot dangle.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// Build a `VkPipelineShaderStageCreateInfo` referencing this entry
    /// point. The returned struct borrows from `self`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_maps_to_vk_flags() {
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::Vertex),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::Fragment),
            vk::ShaderStageFlags::FRAGMENT
        );
    }
}
