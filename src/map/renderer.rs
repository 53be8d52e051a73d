//! wgpu pipelines and draw recording for the map

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::composer::Frame;

/// Dynamic uniform-buffer offsets must be 256-byte aligned, so the per-draw
/// uniform struct is padded out to exactly that stride.
pub const UNIFORM_STRIDE: u64 = 256;

/// Per-draw uniform data: the model→clip matrix and a premultiplied color.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FillUniform {
    pub model_clip: [[f32; 4]; 4],
    pub color: [f32; 4],
    _padding: [f32; 44],
}

impl FillUniform {
    pub fn new(model_clip: Mat4, color: [f32; 4]) -> Self {
        Self {
            model_clip: model_clip.to_cols_array_2d(),
            color,
            _padding: [0.0; 44],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct BackgroundUniform {
    color: [f32; 4],
}

/// Records buffer uploads for the current frame. Writes are staged on the
/// queue and land on the GPU when the frame's command buffer is submitted.
pub struct ResourceUpdateBatch<'a> {
    queue: &'a wgpu::Queue,
}

impl<'a> ResourceUpdateBatch<'a> {
    pub fn new(queue: &'a wgpu::Queue) -> Self {
        Self { queue }
    }

    pub fn upload_static_buffer(&mut self, buffer: &wgpu::Buffer, data: &[u8]) {
        if !data.is_empty() {
            self.queue.write_buffer(buffer, 0, data);
        }
    }

    pub fn update_dynamic_buffer(&mut self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        if !data.is_empty() {
            self.queue.write_buffer(buffer, offset, data);
        }
    }
}

/// Map renderer: a fullscreen background pipeline and the fill pipeline
/// drawing tile features with per-draw dynamic uniform offsets.
pub struct MapRenderer {
    fill_pipeline: wgpu::RenderPipeline,
    fill_bind_group_layout: wgpu::BindGroupLayout,
    fill_bind_group: Option<wgpu::BindGroup>,
    uniform_buffer: Option<wgpu::Buffer>,
    uniform_capacity: u32,

    background_pipeline: wgpu::RenderPipeline,
    background_bind_group: wgpu::BindGroup,
    background_buffer: wgpu::Buffer,
}

impl MapRenderer {
    pub fn new(device: &wgpu::Device, texture_format: wgpu::TextureFormat) -> Self {
        let (background_pipeline, background_bind_group, background_buffer) =
            Self::create_background(device, texture_format);
        let (fill_pipeline, fill_bind_group_layout) = Self::create_fill(device, texture_format);

        Self {
            fill_pipeline,
            fill_bind_group_layout,
            fill_bind_group: None,
            uniform_buffer: None,
            uniform_capacity: 0,
            background_pipeline,
            background_bind_group,
            background_buffer,
        }
    }

    fn create_background(
        device: &wgpu::Device,
        texture_format: wgpu::TextureFormat,
    ) -> (wgpu::RenderPipeline, wgpu::BindGroup, wgpu::Buffer) {
        let shader = device.create_shader_module(wgpu::include_wgsl!("../shader/background.wgsl"));

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Background Uniform Buffer"),
            size: std::mem::size_of::<BackgroundUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Background Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(
                        std::mem::size_of::<BackgroundUniform>() as u64,
                    ),
                },
                count: None,
            }],
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Background Bind Group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Background Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Background Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: texture_format,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        (pipeline, bind_group, buffer)
    }

    fn create_fill(
        device: &wgpu::Device,
        texture_format: wgpu::TextureFormat,
    ) -> (wgpu::RenderPipeline, wgpu::BindGroupLayout) {
        let shader = device.create_shader_module(wgpu::include_wgsl!("../shader/fill.wgsl"));

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fill Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(UNIFORM_STRIDE),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fill Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        // One 2D float position per vertex, tightly packed.
        const VERTEX_ATTRIBS: [wgpu::VertexAttribute; 1] =
            wgpu::vertex_attr_array![0 => Float32x2];

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Fill Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: 8,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &VERTEX_ATTRIBS,
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: texture_format,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        (pipeline, bind_group_layout)
    }

    /// Upload the frame's uniform data, growing the dynamic uniform buffer
    /// if this frame draws more features than any before it.
    pub fn prepare(
        &mut self,
        device: &wgpu::Device,
        batch: &mut ResourceUpdateBatch<'_>,
        frame: &Frame,
    ) {
        if let Some(color) = frame.background {
            let uniform = BackgroundUniform {
                color: color.premultiplied(1.0),
            };
            batch.update_dynamic_buffer(&self.background_buffer, 0, bytemuck::bytes_of(&uniform));
        }

        let needed = frame.uniforms.len() as u32;
        if needed == 0 {
            return;
        }

        if self.uniform_buffer.is_none() || needed > self.uniform_capacity {
            let capacity = needed.next_power_of_two().max(64);
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Fill Uniform Buffer"),
                size: capacity as u64 * UNIFORM_STRIDE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.fill_bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Fill Bind Group"),
                layout: &self.fill_bind_group_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(UNIFORM_STRIDE),
                    }),
                }],
            }));
            self.uniform_buffer = Some(buffer);
            self.uniform_capacity = capacity;
        }

        if let Some(buffer) = &self.uniform_buffer {
            batch.update_dynamic_buffer(buffer, 0, bytemuck::cast_slice(&frame.uniforms));
        }
    }

    /// Record the frame: the background quad first, then one indexed draw per
    /// surviving feature, in style-sheet order.
    pub fn record<'a>(
        &'a self,
        render_pass: &mut wgpu::RenderPass<'a>,
        frame: &'a Frame,
        px_width: u32,
        px_height: u32,
    ) {
        render_pass.set_viewport(0.0, 0.0, px_width as f32, px_height as f32, 0.0, 1.0);
        render_pass.set_scissor_rect(0, 0, px_width, px_height);

        if frame.background.is_some() {
            render_pass.set_pipeline(&self.background_pipeline);
            render_pass.set_bind_group(0, &self.background_bind_group, &[]);
            render_pass.draw(0..4, 0..1);
        }

        let Some(bind_group) = &self.fill_bind_group else {
            return;
        };
        if frame.draws.is_empty() {
            return;
        }

        render_pass.set_pipeline(&self.fill_pipeline);
        for draw in &frame.draws {
            let offset = draw.uniform_index * UNIFORM_STRIDE as u32;
            render_pass.set_bind_group(0, bind_group, &[offset]);
            render_pass.set_vertex_buffer(0, draw.tile.vertex_buffer.slice(draw.vtx_byte_offset..));
            render_pass.set_index_buffer(
                draw.tile.index_buffer.slice(draw.idx_byte_offset..),
                wgpu::IndexFormat::Uint32,
            );
            render_pass.draw_indexed(0..draw.idx_count, 0, 0..1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_struct_matches_dynamic_stride() {
        assert_eq!(std::mem::size_of::<FillUniform>() as u64, UNIFORM_STRIDE);
    }

    #[test]
    fn test_uniform_layout() {
        let uniform = FillUniform::new(Mat4::IDENTITY, [0.1, 0.2, 0.3, 1.0]);
        let bytes = bytemuck::bytes_of(&uniform);
        assert_eq!(bytes.len(), 256);
        // The color sits right after the 64-byte matrix.
        let color: [f32; 4] = *bytemuck::from_bytes(&bytes[64..80]);
        assert_eq!(color, [0.1, 0.2, 0.3, 1.0]);
    }
}
