// Concrete renderer
//
// Owns every GPU object, implements the FrameDriver seam over ash, and
// performs swapchain recreation. All resources are destroyed in reverse
// order of creation, on recreation and on drop, after a device-idle wait.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::frame::{
    AcquireOutcome, FrameDriver, FrameOutcome, FrameScheduler, PresentOutcome,
};
use crate::backend::pipeline;
use crate::backend::shader::load_shader_module;
use crate::backend::sync::FrameSlot;
use crate::backend::texture::{upload_texture, DeviceImage};
use crate::backend::upload::{upload_buffer, DeviceBuffer};
use crate::backend::{DeviceContext, RenderError, Swapchain};
use crate::config::Config;
use crate::geometry::{UniformBufferObject, QUAD_INDICES, QUAD_VERTICES};

const VERT_SHADER_PATH: &str = "shaders/vert.spv";
const FRAG_SHADER_PATH: &str = "shaders/frag.spv";
const TEXTURE_PATH: &str = "textures/base_color.png";

/// Window surface handle, destroyed after the swapchain but before the
/// instance (the context `Arc` keeps the instance alive until then).
struct SurfaceHandle {
    surface: vk::SurfaceKHR,
    loader: khr::Surface,
    _device: Arc<DeviceContext>,
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

/// All rendering state.
///
/// Field order matters: the swapchain is declared before the surface so it
/// drops first, and everything holding an `Arc<DeviceContext>` drops before
/// the context itself tears down the device and instance.
pub struct Renderer {
    scheduler: FrameScheduler,
    clear_color: [f32; 4],
    start_time: Instant,
    index_count: u32,

    // Per-image resources, rebuilt on every recreation
    command_buffers: Vec<vk::CommandBuffer>,
    framebuffers: Vec<vk::Framebuffer>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    descriptor_pool: vk::DescriptorPool,
    uniform_buffers: Vec<DeviceBuffer>,

    // Format/extent-dependent objects, rebuilt on every recreation
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,

    // Long-lived objects
    descriptor_set_layout: vk::DescriptorSetLayout,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
    swapchain: Swapchain,
    vertex_buffer: DeviceBuffer,
    index_buffer: DeviceBuffer,
    _texture: DeviceImage,
    slots: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    surface: SurfaceHandle,
    device: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing renderer...");

        let entry = unsafe { ash::Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let instance =
            DeviceContext::create_instance(&entry, &config.window.title, display_handle)?;
        let surface_loader = khr::Surface::new(&entry, &instance);
        let raw_surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        let device = DeviceContext::new(entry, instance, raw_surface, &surface_loader)?;
        let surface = SurfaceHandle {
            surface: raw_surface,
            loader: surface_loader,
            _device: device.clone(),
        };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface.surface,
            &surface.loader,
            size.width,
            size.height,
            None,
        )?;

        let vert_module = load_shader_module(&device, Path::new(VERT_SHADER_PATH))?;
        let frag_module = load_shader_module(&device, Path::new(FRAG_SHADER_PATH))?;
        let descriptor_set_layout = pipeline::create_descriptor_set_layout(&device)?;

        // Static geometry and the texture asset go up through staging once.
        let vertex_buffer = upload_buffer(
            &device,
            command_pool,
            &QUAD_VERTICES,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = upload_buffer(
            &device,
            command_pool,
            &QUAD_INDICES,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let texture_pixels = image::open(TEXTURE_PATH)
            .with_context(|| format!("Failed to decode texture {TEXTURE_PATH}"))?
            .to_rgba8();
        let (texture_width, texture_height) = texture_pixels.dimensions();
        let texture = upload_texture(
            &device,
            command_pool,
            &texture_pixels,
            texture_width,
            texture_height,
        )?;

        let slots = (0..config.graphics.max_frames_in_flight)
            .map(|_| FrameSlot::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut renderer = Self {
            scheduler: FrameScheduler::new(config.graphics.max_frames_in_flight),
            clear_color: config.graphics.clear_color,
            start_time: Instant::now(),
            index_count: QUAD_INDICES.len() as u32,
            command_buffers: Vec::new(),
            framebuffers: Vec::new(),
            descriptor_sets: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            uniform_buffers: Vec::new(),
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            descriptor_set_layout,
            vert_module,
            frag_module,
            swapchain,
            vertex_buffer,
            index_buffer,
            _texture: texture,
            slots,
            command_pool,
            surface,
            device,
        };
        renderer.build_chain_objects()?;

        log::info!("Renderer initialized");
        Ok(renderer)
    }

    /// Record an externally observed window resize; the scheduler consumes
    /// it at the next present.
    pub fn note_resize(&mut self) {
        self.scheduler.request_resize();
    }

    /// True while the chain is stale and must be recreated before rendering.
    pub fn needs_rebuild(&self) -> bool {
        self.scheduler.needs_rebuild()
    }

    pub fn wait_idle(&self) {
        let _ = self.device.wait_idle();
    }

    /// Drive one iteration of the frame protocol.
    pub fn draw_frame(&mut self) -> Result<FrameOutcome> {
        let mut scheduler = self.scheduler;
        let outcome = scheduler.run_frame(self);
        self.scheduler = scheduler;
        outcome.context("Frame submission failed")
    }

    /// Tear down and rebuild everything that depends on the chain's format
    /// or extent, against the new framebuffer size. The caller guarantees
    /// the size is non-zero.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_chain_dependents();

        let chain = Swapchain::new(
            self.device.clone(),
            self.surface.surface,
            &self.surface.loader,
            width,
            height,
            Some(&self.swapchain),
        )?;
        // The old chain is handed to the driver via old_swapchain above and
        // can be destroyed now.
        let old = std::mem::replace(&mut self.swapchain, chain);
        drop(old);

        self.build_chain_objects()?;
        self.scheduler.rebuilt();
        Ok(())
    }

    /// Build render pass, pipeline, framebuffers, per-image uniform buffers,
    /// descriptor sets, and pre-recorded command buffers for the current
    /// chain.
    fn build_chain_objects(&mut self) -> Result<()> {
        let format = self.swapchain.format.format;
        let extent = self.swapchain.extent;
        let image_views = self.swapchain.image_views.clone();
        let image_count = self.swapchain.image_count();

        self.render_pass = pipeline::create_render_pass(&self.device, format)?;
        let (graphics_pipeline, pipeline_layout) = pipeline::create_graphics_pipeline(
            &self.device,
            self.render_pass,
            extent,
            self.descriptor_set_layout,
            self.vert_module,
            self.frag_module,
        )?;
        self.pipeline = graphics_pipeline;
        self.pipeline_layout = pipeline_layout;
        self.framebuffers =
            pipeline::create_framebuffers(&self.device, &image_views, self.render_pass, extent)?;

        self.uniform_buffers = (0..image_count)
            .map(|_| {
                DeviceBuffer::new(
                    self.device.clone(),
                    size_of::<UniformBufferObject>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.descriptor_pool = pipeline::create_descriptor_pool(&self.device, image_count as u32)?;
        self.descriptor_sets = pipeline::create_descriptor_sets(
            &self.device,
            self.descriptor_pool,
            self.descriptor_set_layout,
            &self.uniform_buffers,
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(image_count as u32);
        self.command_buffers =
            unsafe { self.device.device.allocate_command_buffers(&alloc_info)? };
        self.record_command_buffers()?;

        log::info!("Built {} pre-recorded command buffers", image_count);
        Ok(())
    }

    /// Pre-record the fixed draw sequence for every swapchain image.
    fn record_command_buffers(&self) -> Result<()> {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];

        for (image_index, &cmd) in self.command_buffers.iter().enumerate() {
            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                self.device.device.begin_command_buffer(cmd, &begin_info)?;

                let render_pass_begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.render_pass)
                    .framebuffer(self.framebuffers[image_index])
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: self.swapchain.extent,
                    })
                    .clear_values(&clear_values);

                self.device.device.cmd_begin_render_pass(
                    cmd,
                    &render_pass_begin,
                    vk::SubpassContents::INLINE,
                );
                self.device.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline,
                );
                self.device.device.cmd_bind_vertex_buffers(
                    cmd,
                    0,
                    &[self.vertex_buffer.buffer],
                    &[0],
                );
                self.device.device.cmd_bind_index_buffer(
                    cmd,
                    self.index_buffer.buffer,
                    0,
                    vk::IndexType::UINT16,
                );
                self.device.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_sets[image_index]],
                    &[],
                );
                self.device
                    .device
                    .cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
                self.device.device.cmd_end_render_pass(cmd);
                self.device.device.end_command_buffer(cmd)?;
            }
        }
        Ok(())
    }

    /// Destroy everything [`build_chain_objects`](Self::build_chain_objects)
    /// created, in reverse-creation order. Callable with nothing built.
    fn destroy_chain_dependents(&mut self) {
        unsafe {
            if !self.command_buffers.is_empty() {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
                self.command_buffers.clear();
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                // Also returns the sets.
                self.device
                    .device
                    .destroy_descriptor_pool(self.descriptor_pool, None);
                self.descriptor_pool = vk::DescriptorPool::null();
            }
            self.descriptor_sets.clear();
            self.uniform_buffers.clear();
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                self.device.device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device
                    .device
                    .destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.render_pass != vk::RenderPass::null() {
                self.device.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
    }
}

impl FrameDriver for Renderer {
    type Error = RenderError;

    fn wait_slot_fence(&mut self, slot: usize) -> Result<(), RenderError> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.slots[slot].in_flight], true, u64::MAX)?;
        }
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, RenderError> {
        self.swapchain
            .acquire_next_image(self.slots[slot].image_available)
    }

    fn write_uniforms(&mut self, image_index: u32) -> Result<(), RenderError> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let extent = self.swapchain.extent;
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let ubo = UniformBufferObject::spinning(elapsed, aspect);
        self.uniform_buffers[image_index as usize].write_bytes(bytemuck::bytes_of(&ubo))
    }

    fn reset_slot_fence(&mut self, slot: usize) -> Result<(), RenderError> {
        unsafe {
            self.device
                .device
                .reset_fences(&[self.slots[slot].in_flight])?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<(), RenderError> {
        let sync = &self.slots[slot];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[image_index as usize]];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome, RenderError> {
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[self.slots[slot].render_finished],
        )
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer...");
        let _ = self.device.wait_idle();

        self.destroy_chain_dependents();
        unsafe {
            self.device
                .device
                .destroy_shader_module(self.vert_module, None);
            self.device
                .device
                .destroy_shader_module(self.frag_module, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
        // Buffers, texture, sync slots, swapchain, and surface drop in
        // field order; the device context goes last.
    }
}
