use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::mesh::{TimeUniform, Vertex};
use crate::render_pass::RenderPass;
use crate::shader::EntryPoint;

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Vulkan error creating descriptor set layout: {0}")]
    DescriptorSetLayoutCreation(vk::Result),

    #[error("Vulkan error creating pipeline layout: {0}")]
    LayoutCreation(vk::Result),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    PipelineCreation(vk::Result),
}

/// The immutable graphics pipeline plus the layouts it was built with.
///
/// Fixed state applied during construction:
/// - Vertex input: one binding of [`Vertex`] (position + color)
/// - Input assembly: `TRIANGLE_LIST`
/// - Viewport/scissor: one static rectangle matching the requested extent
/// - Rasterization: fill, back-face culling, clockwise front faces,
///   line width 1.0
/// - Multisample: single sample
/// - Color blend: straight alpha
///   (`src*srcAlpha + dst*(1-srcAlpha)`, alpha `1*src + 0*dst`),
///   full RGBA write mask
///
/// The descriptor set layout (binding 0, uniform buffer, vertex+fragment)
/// is owned here and shared with the renderer for set allocation. Nothing
/// in this object can change after construction; a resize requires tearing
/// the whole state down and rebuilding it.
pub struct PipelineState {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl PipelineState {
    /// Build the pipeline from the given shader stages, compatible with
    /// `render_pass` and sized for `extent`.
    pub fn new(
        device: &Arc<Device>,
        stages: &[EntryPoint<'_>],
        render_pass: &RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self, CreatePipelineError> {
        if stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }

        let uniform_binding = TimeUniform::layout_binding();
        let set_layout_create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(std::slice::from_ref(&uniform_binding));
        //SAFETY: create_info only references stack data valid for this call
        let descriptor_set_layout =
            unsafe { device.create_raw_descriptor_set_layout(&set_layout_create_info) }
                .map_err(CreatePipelineError::DescriptorSetLayoutCreation)?;

        let layout_create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&descriptor_set_layout));
        //SAFETY: the referenced set layout was just created from this device
        let layout = match unsafe { device.create_raw_pipeline_layout(&layout_create_info) } {
            Ok(layout) => layout,
            Err(e) => {
                //SAFETY: the set layout was created above and nothing uses it
                unsafe { device.destroy_raw_descriptor_set_layout(descriptor_set_layout) };
                return Err(CreatePipelineError::LayoutCreation(e));
            }
        };

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = stages
            .iter()
            .map(|ep| ep.as_pipeline_stage_create_info())
            .collect();

        let vertex_binding = Vertex::binding_description();
        let vertex_attributes = Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(std::slice::from_ref(&vertex_binding))
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport = vk::Viewport::default()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D::default()
            .offset(vk::Offset2D::default())
            .extent(extent);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&viewport))
            .scissors(std::slice::from_ref(&scissor));

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&color_blend_attachment));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .layout(layout)
            .render_pass(render_pass.raw_handle())
            .subpass(0);

        //SAFETY: create_info references valid shader stages, a valid
        //pipeline layout, and a valid render pass, all derived from device
        //and valid for the duration of this call
        let handle = match unsafe { device.create_raw_graphics_pipeline(&create_info) } {
            Ok(handle) => handle,
            Err(e) => {
                //SAFETY: layout and set layout were created above; nothing
                //else references them
                unsafe { device.destroy_raw_pipeline_layout(layout) };
                //SAFETY: same as above
                unsafe { device.destroy_raw_descriptor_set_layout(descriptor_set_layout) };
                return Err(CreatePipelineError::PipelineCreation(e));
            }
        };
        tracing::info!("Created graphics pipeline {:?}", handle);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
            descriptor_set_layout,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn raw_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    pub fn get_parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        //SAFETY: handle was created from parent; all in-flight GPU work
        //referencing it has completed (owner sequences drops after idle)
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
        //SAFETY: layout was created from parent; the pipeline using it was
        //destroyed just above
        unsafe { self.parent.destroy_raw_pipeline_layout(self.layout) };
        //SAFETY: the set layout was created from parent; the pipeline layout
        //referencing it was destroyed just above
        unsafe {
            self.parent
                .destroy_raw_descriptor_set_layout(self.descriptor_set_layout)
        };
    }
}
