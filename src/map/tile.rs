//! Tile coordinate system and conversions
//! The world is a unit square [0,1]² (y down); at zoom z it splits into a
//! 2^z × 2^z grid of tiles.

use std::fmt;

/// Maximum zoom level the tile source serves.
pub const MAX_TILE_ZOOM: u8 = 16;

/// Unique identifier for a map tile
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at this zoom level
    pub fn tiles_per_axis(&self) -> u32 {
        1 << self.z // 2^z
    }

    /// Whether x and y fall inside the grid for this zoom level
    pub fn is_valid(&self) -> bool {
        self.z <= MAX_TILE_ZOOM && self.x < self.tiles_per_axis() && self.y < self.tiles_per_axis()
    }

    /// Top-left corner of this tile in world-normalized coordinates
    pub fn world_origin(&self) -> (f64, f64) {
        let n = self.tiles_per_axis() as f64;
        (self.x as f64 / n, self.y as f64 / n)
    }

    /// Side length of this tile in world-normalized coordinates
    pub fn world_size(&self) -> f64 {
        1.0 / self.tiles_per_axis() as f64
    }

    /// Build the MapTiler tile URL
    pub fn to_tile_url(&self, api_key: &str) -> String {
        format!(
            "https://api.maptiler.com/tiles/v3/{}/{}/{}.pbf?key={}",
            self.z, self.x, self.y, api_key
        )
    }

    /// Cache file name for this tile
    pub fn to_file_name(&self) -> String {
        format!("z{}x{}y{}.mvt", self.z, self.x, self.y)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.z, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        // Zoom dominates, then x, then y.
        assert!(TileCoord::new(0, 0, 0) < TileCoord::new(1, 0, 0));
        assert!(TileCoord::new(1, 0, 1) < TileCoord::new(1, 1, 0));
        assert!(TileCoord::new(2, 3, 1) < TileCoord::new(2, 3, 2));
    }

    #[test]
    fn test_world_origin() {
        let (x, y) = TileCoord::new(1, 1, 0).world_origin();
        assert_eq!(x, 0.5);
        assert_eq!(y, 0.0);
        assert_eq!(TileCoord::new(2, 0, 0).world_size(), 0.25);
    }

    #[test]
    fn test_tile_url() {
        let url = TileCoord::new(3, 4, 5).to_tile_url("abc123");
        assert_eq!(url, "https://api.maptiler.com/tiles/v3/3/4/5.pbf?key=abc123");
    }

    #[test]
    fn test_validity() {
        assert!(TileCoord::new(0, 0, 0).is_valid());
        assert!(!TileCoord::new(2, 4, 0).is_valid());
        assert!(!TileCoord::new(17, 0, 0).is_valid());
    }
}
