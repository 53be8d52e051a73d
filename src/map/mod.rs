//! Map system: tile pipeline, style resolution and frame rendering

pub mod cache;
pub mod composer;
pub mod geometry;
pub mod loader;
pub mod mvt;
pub mod renderer;
pub mod tile;
pub mod viewport;

use std::sync::Arc;

use composer::Frame;
use loader::{LoaderStats, TileLoader, UploadResult};
use renderer::{MapRenderer, ResourceUpdateBatch};
use viewport::Viewport;

use crate::style::StyleSheet;

/// Integrated map system driven once per frame from the render thread.
pub struct MapSystem {
    pub viewport: Viewport,
    tile_loader: Arc<TileLoader>,
    renderer: MapRenderer,
    style: StyleSheet,
    frame: Option<Frame>,
    /// Staging memory of the most recent upload pass. Held here so it
    /// outlives the submission of the frame that recorded the uploads.
    _staging: UploadResult,
}

impl MapSystem {
    pub fn new(
        device: &wgpu::Device,
        texture_format: wgpu::TextureFormat,
        viewport_width: u32,
        viewport_height: u32,
        style: StyleSheet,
        tile_loader: Arc<TileLoader>,
    ) -> Self {
        Self {
            viewport: Viewport::new(viewport_width, viewport_height),
            tile_loader,
            renderer: MapRenderer::new(device, texture_format),
            style,
            frame: None,
            _staging: UploadResult::default(),
        }
    }

    /// Update the map system (call each frame, before [`Self::render`]).
    ///
    /// Uploads freshly decoded tiles first so the composed frame can draw
    /// them, then walks the style sheet into this frame's draw list.
    pub fn update(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        let mut batch = ResourceUpdateBatch::new(queue);

        self._staging = self.tile_loader.upload_pending(device, &mut batch);

        let frame = composer::compose(&self.viewport, &self.style, &self.tile_loader);
        self.renderer.prepare(device, &mut batch, &frame);
        self.frame = Some(frame);
    }

    /// Record the composed frame into the render pass.
    pub fn render<'a>(&'a self, render_pass: &mut wgpu::RenderPass<'a>) {
        if let Some(frame) = &self.frame {
            self.renderer.record(
                render_pass,
                frame,
                self.viewport.px_width,
                self.viewport.px_height,
            );
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport.set_size(width, height);
    }

    pub fn pan(&mut self, dx: f32, dy: f32) {
        self.viewport.pan(dx, dy);
    }

    pub fn zoom(&mut self, delta: f64) {
        self.viewport.zoom_by(delta);
    }

    pub fn rotate(&mut self, delta_deg: f64) {
        self.viewport.rotate_by(delta_deg);
    }

    pub fn loader_stats(&self) -> LoaderStats {
        self.tile_loader.stats()
    }

    pub fn style_name(&self) -> &str {
        &self.style.name
    }
}
