//! Viewport state: panning, zooming and rotation

/// Deepest viewport zoom the controls allow.
pub const MAX_VIEWPORT_ZOOM: f64 = 16.0;

/// The visible window onto the world map.
///
/// The center lives in world-normalized coordinates: the unit square with
/// (0, 0) at the top-left of the world and y growing downward. The zoom is
/// real-valued; the visible world shrinks by 2^zoom.
pub struct Viewport {
    pub px_width: u32,
    pub px_height: u32,
    pub center_x: f64,
    pub center_y: f64,
    pub zoom: f64,
    /// Rotation around the viewport center, degrees in [0, 360).
    pub rotation_deg: f64,
}

impl Viewport {
    pub fn new(px_width: u32, px_height: u32) -> Self {
        Self {
            px_width,
            px_height,
            center_x: 0.5,
            center_y: 0.5,
            zoom: 0.0,
            rotation_deg: 0.0,
        }
    }

    pub fn set_size(&mut self, px_width: u32, px_height: u32) {
        self.px_width = px_width;
        self.px_height = px_height;
    }

    pub fn aspect(&self) -> f64 {
        if self.px_height == 0 {
            1.0
        } else {
            self.px_width as f64 / self.px_height as f64
        }
    }

    /// Pan by a pixel delta, keeping the point under the cursor fixed.
    pub fn pan(&mut self, dx_pixels: f32, dy_pixels: f32) {
        let scale = 1.0 / 2f64.powf(self.zoom);
        let mut dx = dx_pixels as f64 * scale;
        let mut dy = dy_pixels as f64 * scale;

        // The shorter viewport axis spans less of the world; stretch the
        // delta on that axis so the drag tracks the cursor.
        let aspect = self.aspect();
        if self.px_width < self.px_height {
            dx *= aspect;
        } else if self.px_width > self.px_height {
            dy /= aspect;
        }

        if self.px_width > 0 {
            self.center_x = (self.center_x - dx / self.px_width as f64).clamp(0.0, 1.0);
        }
        if self.px_height > 0 {
            self.center_y = (self.center_y - dy / self.px_height as f64).clamp(0.0, 1.0);
        }
    }

    pub fn zoom_by(&mut self, delta: f64) {
        self.zoom = (self.zoom + delta).clamp(0.0, MAX_VIEWPORT_ZOOM);
    }

    pub fn rotate_by(&mut self, delta_deg: f64) {
        self.rotation_deg = (self.rotation_deg + delta_deg).rem_euclid(360.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_moves_center() {
        let mut vp = Viewport::new(800, 800);
        // At zoom 0 a full-width drag crosses the whole world.
        vp.pan(400.0, 0.0);
        assert!((vp.center_x - 0.0).abs() < 1e-9);
        assert_eq!(vp.center_y, 0.5);
    }

    #[test]
    fn test_pan_scales_with_zoom() {
        let mut vp = Viewport::new(800, 800);
        vp.zoom = 1.0;
        vp.pan(400.0, 0.0);
        assert!((vp.center_x - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_center_clamped_to_world() {
        let mut vp = Viewport::new(800, 800);
        vp.pan(-10_000.0, 10_000.0);
        assert_eq!(vp.center_x, 1.0);
        assert_eq!(vp.center_y, 0.0);
    }

    #[test]
    fn test_zoom_clamped() {
        let mut vp = Viewport::new(800, 600);
        vp.zoom_by(-3.0);
        assert_eq!(vp.zoom, 0.0);
        vp.zoom_by(99.0);
        assert_eq!(vp.zoom, MAX_VIEWPORT_ZOOM);
    }

    #[test]
    fn test_rotation_wraps() {
        let mut vp = Viewport::new(800, 600);
        vp.rotate_by(-30.0);
        assert_eq!(vp.rotation_deg, 330.0);
        vp.rotate_by(45.0);
        assert_eq!(vp.rotation_deg, 15.0);
    }
}
