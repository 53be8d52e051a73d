//! Per-frame composition: visible-tile selection, transforms and draw list

use std::sync::Arc;

use glam::{DMat4, DVec3, Mat4};

use crate::style::{LayerKind, StyleSheet};
use crate::style::color::Color;

use super::loader::{ReadyTile, TileLoader};
use super::mvt::GeomType;
use super::renderer::FillUniform;
use super::tile::TileCoord;
use super::viewport::Viewport;

/// Deepest tile level fetched and triangulated.
pub const MAX_MAP_ZOOM: i32 = 15;

/// wgpu clip space is y-up with depth in [0, 1]; the matrices here produce
/// OpenGL-style depth, so remap z.
const CLIP_CORRECTION: DMat4 = DMat4::from_cols_array(&[
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 0.5, 0.0, //
    0.0, 0.0, 0.5, 1.0,
]);

/// Integer tile level for a real-valued viewport zoom.
pub fn map_zoom(vp_zoom: f64) -> u8 {
    (vp_zoom.round() as i64).clamp(0, MAX_MAP_ZOOM as i64) as u8
}

/// The integer grid cells of the 2^mapZoom grid intersecting the viewport
/// rectangle, clamped to the world.
pub fn visible_tiles(viewport: &Viewport) -> Vec<TileCoord> {
    let zoom = map_zoom(viewport.zoom);
    let grid = 1i64 << zoom;

    let aspect = viewport.aspect();
    let half_width = 2f64.powf(-viewport.zoom) * aspect.min(1.0) / 2.0;
    let half_height = 2f64.powf(-viewport.zoom) * (1.0 / aspect).min(1.0) / 2.0;

    let clamp = |cell: f64| (cell.floor() as i64).clamp(0, grid - 1);
    let min_x = clamp((viewport.center_x - half_width) * grid as f64);
    let max_x = clamp((viewport.center_x + half_width) * grid as f64);
    let min_y = clamp((viewport.center_y - half_height) * grid as f64);
    let max_y = clamp((viewport.center_y + half_height) * grid as f64);

    let mut tiles = Vec::new();
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            tiles.push(TileCoord::new(zoom, x as u32, y as u32));
        }
    }
    tiles
}

/// Transform from one tile's local coordinates ([0, extent]²) to clip space.
///
/// Tile-local coordinates normalize into the tile's world-normalized cell,
/// recenter on the viewport, flip into y-up, rotate, scale by the world
/// scale 2^zoom doubled to span NDC, correct for aspect, and finally apply
/// the per-feature screen-pixel translation and the backend depth remap.
pub fn model_clip_matrix(
    viewport: &Viewport,
    coord: TileCoord,
    extent: u32,
    translate_px: [f64; 2],
) -> Mat4 {
    let tile_size = coord.world_size();
    let (origin_x, origin_y) = coord.world_origin();

    let aspect = viewport.aspect();
    let (aspect_x, aspect_y) = if aspect >= 1.0 {
        (1.0, aspect)
    } else {
        (1.0 / aspect, 1.0)
    };

    let world_scale = 2f64.powf(viewport.zoom) * 2.0;
    let local_scale = tile_size / extent.max(1) as f64;

    let matrix = DMat4::from_scale(DVec3::new(aspect_x, aspect_y, 1.0))
        * DMat4::from_scale(DVec3::new(world_scale, world_scale, 1.0))
        * DMat4::from_rotation_z(viewport.rotation_deg.to_radians())
        * DMat4::from_scale(DVec3::new(1.0, -1.0, 1.0))
        * DMat4::from_translation(DVec3::new(
            origin_x - viewport.center_x,
            origin_y - viewport.center_y,
            0.0,
        ))
        * DMat4::from_scale(DVec3::new(local_scale, local_scale, 1.0));

    let ndc_translate = DMat4::from_translation(DVec3::new(
        2.0 * translate_px[0] / viewport.px_width.max(1) as f64,
        -2.0 * translate_px[1] / viewport.px_height.max(1) as f64,
        0.0,
    ));

    (CLIP_CORRECTION * ndc_translate * matrix).as_mat4()
}

/// One indexed draw into a tile's buffers.
pub struct DrawCommand {
    pub tile: Arc<ReadyTile>,
    pub vtx_byte_offset: u64,
    pub idx_byte_offset: u64,
    pub idx_count: u32,
    pub uniform_index: u32,
}

/// Everything the renderer needs to record one frame. Draw commands keep
/// their tiles alive for the duration of the pass.
pub struct Frame {
    pub background: Option<Color>,
    pub uniforms: Vec<FillUniform>,
    pub draws: Vec<DrawCommand>,
}

/// Walk the style sheet against the currently visible, ready tiles and
/// assemble the frame's draw list in style-sheet order.
pub fn compose(viewport: &Viewport, style: &StyleSheet, loader: &TileLoader) -> Frame {
    let zoom = map_zoom(viewport.zoom) as i32;
    let visible = visible_tiles(viewport);
    let ready = loader.request_tiles(&visible);

    let mut frame = Frame {
        background: style.background_color(zoom),
        uniforms: Vec::new(),
        draws: Vec::new(),
    };

    for layer_style in &style.layers {
        let LayerKind::Fill(fill) = &layer_style.kind else {
            continue;
        };
        if !layer_style.common.shown_at(zoom) {
            continue;
        }

        for coord in &visible {
            let Some(tile) = ready.tiles.get(coord) else {
                continue;
            };
            let Some(tile_layer) = tile
                .layers
                .iter()
                .find(|layer| layer.name == layer_style.common.source_layer)
            else {
                continue;
            };

            for feature in &tile_layer.features {
                if !layer_style.common.feature_passes_filter(
                    GeomType::Polygon,
                    &feature.metadata,
                    zoom,
                    viewport.zoom,
                ) {
                    continue;
                }

                let color =
                    fill.fill_color(GeomType::Polygon, &feature.metadata, zoom, viewport.zoom);
                let opacity =
                    fill.fill_opacity(GeomType::Polygon, &feature.metadata, zoom, viewport.zoom);
                let translate =
                    fill.fill_translate(GeomType::Polygon, &feature.metadata, zoom, viewport.zoom);

                let matrix = model_clip_matrix(viewport, *coord, tile_layer.extent, translate);

                let uniform_index = frame.uniforms.len() as u32;
                frame
                    .uniforms
                    .push(FillUniform::new(matrix, color.premultiplied(opacity as f32)));
                frame.draws.push(DrawCommand {
                    tile: Arc::clone(tile),
                    vtx_byte_offset: feature.vtx_byte_offset,
                    idx_byte_offset: feature.idx_byte_offset,
                    idx_count: feature.idx_count,
                    uniform_index,
                });
            }
        }
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport(px_width: u32, px_height: u32, zoom: f64) -> Viewport {
        let mut vp = Viewport::new(px_width, px_height);
        vp.zoom = zoom;
        vp
    }

    #[test]
    fn test_map_zoom_rounds_and_clamps() {
        assert_eq!(map_zoom(0.0), 0);
        assert_eq!(map_zoom(3.4), 3);
        assert_eq!(map_zoom(3.6), 4);
        assert_eq!(map_zoom(99.0), 15);
    }

    #[test]
    fn test_visible_tiles_at_origin() {
        // Square viewport over the whole world sees the single zoom-0 tile.
        let tiles = visible_tiles(&viewport(512, 512, 0.0));
        assert_eq!(tiles, vec![TileCoord::new(0, 0, 0)]);
    }

    #[test]
    fn test_four_corners_at_zoom_one() {
        let tiles = visible_tiles(&viewport(512, 512, 1.0));
        let expected = [
            TileCoord::new(1, 0, 0),
            TileCoord::new(1, 1, 0),
            TileCoord::new(1, 0, 1),
            TileCoord::new(1, 1, 1),
        ];
        assert_eq!(tiles.len(), 4);
        for coord in expected {
            assert!(tiles.contains(&coord), "missing {coord}");
        }
    }

    #[test]
    fn test_wide_viewport_sees_more_columns() {
        // Twice as wide as tall at zoom 1: the viewport rectangle straddles
        // both columns but only the top row.
        let mut vp = viewport(1024, 512, 1.0);
        vp.center_y = 0.25;
        let tiles = visible_tiles(&vp);
        let columns: std::collections::HashSet<u32> = tiles.iter().map(|t| t.x).collect();
        assert_eq!(columns.len(), 2);
        assert!(tiles.iter().all(|t| t.y == 0));
    }

    #[test]
    fn test_visible_tiles_clamped_at_world_edge() {
        let mut vp = viewport(512, 512, 1.0);
        vp.center_x = 0.0;
        vp.center_y = 0.0;
        for tile in visible_tiles(&vp) {
            assert!(tile.is_valid(), "out-of-world tile {tile}");
        }
    }

    #[test]
    fn test_world_center_maps_to_ndc_origin() {
        // The center of the zoom-0 tile under the default viewport lands at
        // the middle of clip space.
        let vp = viewport(512, 512, 0.0);
        let matrix = model_clip_matrix(&vp, TileCoord::new(0, 0, 0), 4096, [0.0, 0.0]);
        let center = matrix * glam::Vec4::new(2048.0, 2048.0, 0.0, 1.0);
        assert!(center.x.abs() < 1e-5);
        assert!(center.y.abs() < 1e-5);

        // The tile's top-left corner is the world's top-left: NDC (-1, 1).
        let corner = matrix * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((corner.x + 1.0).abs() < 1e-5);
        assert!((corner.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rotation_turns_the_world() {
        let mut vp = viewport(512, 512, 0.0);
        vp.rotation_deg = 90.0;
        let matrix = model_clip_matrix(&vp, TileCoord::new(0, 0, 0), 4096, [0.0, 0.0]);
        // A point right of center rotates onto the vertical axis.
        let rotated = matrix * glam::Vec4::new(3072.0, 2048.0, 0.0, 1.0);
        assert!(rotated.x.abs() < 1e-4);
        assert!(rotated.y.abs() > 0.1);
    }

    #[test]
    fn test_translate_shifts_in_pixels() {
        let vp = viewport(512, 512, 0.0);
        let plain = model_clip_matrix(&vp, TileCoord::new(0, 0, 0), 4096, [0.0, 0.0]);
        let shifted = model_clip_matrix(&vp, TileCoord::new(0, 0, 0), 4096, [256.0, 0.0]);
        let p = plain * glam::Vec4::new(2048.0, 2048.0, 0.0, 1.0);
        let q = shifted * glam::Vec4::new(2048.0, 2048.0, 0.0, 1.0);
        // 256 px over a 512 px viewport is half the NDC range.
        assert!((q.x - p.x - 1.0).abs() < 1e-5);
    }
}
