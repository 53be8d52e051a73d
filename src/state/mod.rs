use std::sync::Arc;

use anyhow::Context as _;
use egui::{Context, FullOutput, TopBottomPanel};
use egui_wgpu::{Renderer, RendererOptions, ScreenDescriptor};
use wgpu::{
    Backends, ExperimentalFeatures, Features, Instance, InstanceDescriptor, MemoryHints,
    SurfaceError, TextureFormat, Trace,
};
use winit::window::Window;

use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use crate::map::cache::TileCache;
use crate::map::loader::TileLoader;
use crate::map::MapSystem;
use crate::style::StyleSheet;

const TILE_SOURCE: &str = "maptiler_planet";
const DEFAULT_STYLE: &str = include_str!("../../assets/style.json");

/// Degrees per press of the rotation keys.
const ROTATE_STEP_DEG: f64 = 15.0;

// This will store the state of our viewer
pub struct State {
    pub window: Arc<Window>,
    pub surface: wgpu::Surface<'static>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
    pub is_surface_configured: bool,
    resize_request: Option<PhysicalSize<u32>>,
    ui_renderer: Renderer,
    pub egui_ctx: Context,
    egui_state: egui_winit::State,
    draw_egui: bool,

    // Map system
    map_system: MapSystem,

    // Mouse state for panning
    mouse_pressed: bool,
    last_mouse_pos: Option<(f32, f32)>,
}

impl State {
    pub async fn new(window: Arc<Window>, api_key: String) -> anyhow::Result<Self> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let surface: wgpu::Surface<'_> = instance.create_surface(window.clone())?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Main Device"),
                required_features: Features::empty(),
                required_limits: wgpu::Limits::default(),
                experimental_features: ExperimentalFeatures::disabled(),
                memory_hints: MemoryHints::Performance,
                trace: Trace::Off,
            })
            .await?;

        let cap: wgpu::SurfaceCapabilities = surface.get_capabilities(&adapter);

        let texture_format = cap
            .formats
            .iter()
            .find(|format| {
                **format == TextureFormat::Rgba8Unorm || **format == TextureFormat::Bgra8Unorm
            })
            .copied()
            .unwrap_or(cap.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: texture_format,
            width: window.inner_size().width,
            height: window.inner_size().height,
            present_mode: cap.present_modes[0],
            alpha_mode: cap.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        let ui_renderer = Renderer::new(
            &device,
            texture_format,
            RendererOptions {
                msaa_samples: 0,
                depth_stencil_format: None,
                dithering: false,
                predictable_texture_filtering: false,
            },
        );
        let egui_ctx = Context::default();

        let egui_state = egui_winit::State::new(
            egui_ctx.clone(),
            egui_ctx.viewport_id(),
            window.as_ref(),
            egui_ctx.native_pixels_per_point(),
            window.theme(),
            None,
        );

        let style = StyleSheet::from_json_str(DEFAULT_STYLE)
            .context("Failed to parse the bundled style sheet")?;

        let cache = TileCache::in_user_cache_dir(TILE_SOURCE)
            .context("No per-user cache directory on this platform")?;
        let worker_count = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1);
        let tile_loader = Arc::new(TileLoader::new(api_key, cache, worker_count));

        // Redraw whenever a tile finishes loading or fails.
        {
            let window = window.clone();
            tile_loader.on_tile_loaded(move |_success, _coord| {
                window.request_redraw();
            });
        }

        // Create map system
        let map_system = MapSystem::new(
            &device,
            texture_format,
            window.inner_size().width,
            window.inner_size().height,
            style,
            tile_loader,
        );

        Ok(Self {
            window,
            surface,
            device,
            queue,
            config,
            is_surface_configured: false,
            resize_request: None,
            ui_renderer,
            egui_ctx,
            egui_state,
            draw_egui: true,
            map_system,
            mouse_pressed: false,
            last_mouse_pos: None,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            if !self.is_surface_configured {
                self.apply_size(width, height);
                self.is_surface_configured = true;
            } else {
                self.resize_request = Some(PhysicalSize::new(width, height));
            }
        }
    }

    fn apply_size(&mut self, width: u32, height: u32) {
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        self.map_system.resize(width, height);
    }

    pub fn handle_input(&mut self, event: &WindowEvent) -> bool {
        let response = self
            .egui_state
            .on_window_event(self.window.as_ref(), event);
        self.draw_egui = response.repaint;

        // If egui consumed it, don't process map input
        if response.consumed {
            return true;
        }

        // Handle map-specific input
        match event {
            WindowEvent::MouseInput { state, button, .. } => {
                if *button == MouseButton::Left {
                    self.mouse_pressed = *state == ElementState::Pressed;
                    if !self.mouse_pressed {
                        self.last_mouse_pos = None;
                    }
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                let (x, y) = (position.x as f32, position.y as f32);

                if self.mouse_pressed {
                    if let Some((last_x, last_y)) = self.last_mouse_pos {
                        let dx = x - last_x;
                        let dy = y - last_y;
                        self.map_system.pan(dx, dy);
                    }
                    self.last_mouse_pos = Some((x, y));
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let zoom_delta = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y as f64 * 0.5,
                    MouseScrollDelta::PixelDelta(pos) => pos.y * 0.01,
                };
                self.map_system.zoom(zoom_delta);
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key_code),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key_code {
                KeyCode::KeyQ => self.map_system.rotate(-ROTATE_STEP_DEG),
                KeyCode::KeyE => self.map_system.rotate(ROTATE_STEP_DEG),
                _ => {}
            },
            _ => {}
        }

        response.consumed
    }

    pub fn update(&mut self) {
        // Update map system
        self.map_system.update(&self.device, &self.queue);
    }

    fn draw_egui(&mut self) -> FullOutput {
        let input = self.egui_state.take_egui_input(self.window.as_ref());
        let context = self.egui_ctx.clone();
        context.run(input, |ctx| {
            self.egui(ctx);
        })
    }

    fn egui(&mut self, ctx: &Context) {
        let viewport = &self.map_system.viewport;
        let zoom = viewport.zoom;
        let center = (viewport.center_x, viewport.center_y);
        let rotation = viewport.rotation_deg;
        let stats = self.map_system.loader_stats();
        let style_name = self.map_system.style_name().to_string();

        TopBottomPanel::top("menu").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(format!(
                    "{} | Zoom: {:.1} | Center: ({:.4}, {:.4}) | Rotation: {:.0}°",
                    style_name, zoom, center.0, center.1, rotation
                ));
                ui.separator();
                ui.label(format!("Tiles: {} ready", stats.ready));
                if stats.pending + stats.ready_for_upload > 0 {
                    ui.separator();
                    ui.label(format!(
                        "Loading: {}",
                        stats.pending + stats.ready_for_upload
                    ));
                }
                if stats.failed > 0 {
                    ui.separator();
                    ui.label(format!("Failed: {}", stats.failed));
                }
            });
        });
    }

    pub fn render(&mut self) -> Result<(), SurfaceError> {
        self.window.request_redraw();

        if !self.is_surface_configured {
            return Ok(());
        }

        if let Some(PhysicalSize { width, height }) = self.resize_request.take() {
            self.apply_size(width, height)
        }

        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(_) => {
                self.surface.configure(&self.device, &self.config);
                self.surface.get_current_texture()?
            }
        };

        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

        {
            let output = self.draw_egui();
            let FullOutput {
                platform_output,
                textures_delta,
                shapes,
                pixels_per_point,
                .. // viewport is ignored
            } = output;

            self.egui_state
                .handle_platform_output(self.window.as_ref(), platform_output);

            for (id, delta) in textures_delta.set {
                self.ui_renderer
                    .update_texture(&self.device, &self.queue, id, &delta);
            }
            let primitives = self.egui_ctx.tessellate(shapes, pixels_per_point);
            let descriptor = ScreenDescriptor {
                size_in_pixels: [self.config.width, self.config.height],
                pixels_per_point,
            };
            self.ui_renderer.update_buffers(
                &self.device,
                &self.queue,
                &mut encoder,
                &primitives,
                &descriptor,
            );

            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.8,
                            g: 0.85,
                            b: 0.9,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            self.map_system.render(&mut render_pass);
            let mut render_pass = render_pass.forget_lifetime();
            if self.draw_egui {
                self.ui_renderer
                    .render(&mut render_pass, &primitives, &descriptor);
            }
            for id in textures_delta.free {
                self.ui_renderer.free_texture(&id);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        frame.present();

        Ok(())
    }
}
