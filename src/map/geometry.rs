//! Vector-tile geometry decoding and polygon triangulation
//!
//! A feature's geometry arrives as a stream of command integers: the low
//! three bits select the command, the remaining bits are a repeat count.
//! Coordinates are zig-zag encoded deltas applied to a persistent pen.

use lyon::math::point;
use lyon::path::Path;
use lyon::tessellation::{
    BuffersBuilder, FillOptions, FillRule, FillTessellator, FillVertex, VertexBuffers,
};
use thiserror::Error;

const MOVE_TO: u32 = 1;
const LINE_TO: u32 = 2;
const CLOSE_PATH: u32 = 7;

/// Failure while decoding or triangulating one feature's geometry.
/// The caller drops the feature and continues with the rest of the tile.
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("unknown geometry command id {0}")]
    UnknownCommand(u32),
    #[error("move-to/line-to command with zero repeat count")]
    ZeroCount,
    #[error("command operands overrun the geometry stream")]
    StreamOverrun,
    #[error("triangulation failed: {0}")]
    Tessellation(String),
    #[error("polygon triangulated to an empty mesh")]
    EmptyMesh,
}

/// Triangulated interior of one polygon feature, in tile-local coordinates.
/// Indices are local to this mesh's vertex list.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonMesh {
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

pub fn decode_zig_zag(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// One boundary ring of the polygon. Rings are treated as closed whether or
/// not the stream carried an explicit close-path.
#[derive(Debug, Clone, PartialEq)]
struct Ring {
    points: Vec<(f32, f32)>,
}

/// Walk the command stream into boundary rings.
fn decode_rings(geometry: &[u32]) -> Result<Vec<Ring>, GeometryError> {
    let mut rings: Vec<Ring> = Vec::new();
    let mut current: Vec<(f32, f32)> = Vec::new();
    let mut pen = (0i32, 0i32);
    let mut cursor = 0usize;

    while cursor < geometry.len() {
        let command = geometry[cursor];
        let id = command & 0x7;
        let count = (command >> 3) as usize;

        if id != MOVE_TO && id != LINE_TO && id != CLOSE_PATH {
            return Err(GeometryError::UnknownCommand(id));
        }
        if id != CLOSE_PATH && count == 0 {
            return Err(GeometryError::ZeroCount);
        }

        // A ring that starts with anything but move-to begins at the origin.
        if current.is_empty() && id != MOVE_TO {
            current.push((0.0, 0.0));
        }

        match id {
            CLOSE_PATH => {
                if !current.is_empty() {
                    rings.push(Ring {
                        points: std::mem::take(&mut current),
                    });
                }
                cursor += 1;
            }
            _ => {
                let operands = count * 2;
                if cursor + 1 + operands > geometry.len() {
                    return Err(GeometryError::StreamOverrun);
                }
                for pair in 0..count {
                    let at = cursor + 1 + pair * 2;
                    pen.0 += decode_zig_zag(geometry[at]);
                    pen.1 += decode_zig_zag(geometry[at + 1]);

                    if id == MOVE_TO && !current.is_empty() {
                        // Move-to starts a new ring; the previous one is
                        // implicitly closed.
                        rings.push(Ring {
                            points: std::mem::take(&mut current),
                        });
                    }
                    current.push((pen.0 as f32, pen.1 as f32));
                }
                cursor += 1 + operands;
            }
        }
    }

    if !current.is_empty() {
        rings.push(Ring { points: current });
    }

    Ok(rings)
}

/// Decoder for polygon features. Owns the tessellator so that repeated
/// decodes on the same worker thread reuse its internal allocations.
pub struct GeometryDecoder {
    tessellator: FillTessellator,
}

impl GeometryDecoder {
    pub fn new() -> Self {
        Self {
            tessellator: FillTessellator::new(),
        }
    }

    /// Decode one feature's command stream and triangulate its interior.
    ///
    /// The non-zero fill rule matches the winding convention of vector-tile
    /// polygons: exterior rings wind one way, holes the other, so holes and
    /// the outside fall out of the filled region.
    pub fn decode(&mut self, geometry: &[u32]) -> Result<PolygonMesh, GeometryError> {
        let rings = decode_rings(geometry)?;

        let mut builder = Path::builder();
        for ring in &rings {
            let mut points = ring.points.iter();
            let Some(&(x, y)) = points.next() else {
                continue;
            };
            builder.begin(point(x, y));
            for &(x, y) in points {
                builder.line_to(point(x, y));
            }
            builder.end(true);
        }
        let path = builder.build();

        let mut buffers: VertexBuffers<[f32; 2], u32> = VertexBuffers::new();
        self.tessellator
            .tessellate_path(
                &path,
                &FillOptions::default().with_fill_rule(FillRule::NonZero),
                &mut BuffersBuilder::new(&mut buffers, |vertex: FillVertex| {
                    vertex.position().to_array()
                }),
            )
            .map_err(|err| GeometryError::Tessellation(format!("{err:?}")))?;

        if buffers.vertices.is_empty() || buffers.indices.is_empty() {
            return Err(GeometryError::EmptyMesh);
        }

        Ok(PolygonMesh {
            vertices: buffers.vertices,
            indices: buffers.indices,
        })
    }
}

impl Default for GeometryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zig_zag() {
        assert_eq!(decode_zig_zag(0), 0);
        assert_eq!(decode_zig_zag(1), -1);
        assert_eq!(decode_zig_zag(2), 1);
        assert_eq!(decode_zig_zag(50), 25);
        assert_eq!(decode_zig_zag(34), 17);
    }

    #[test]
    fn test_command_walk() {
        // move-to(25, 17); line-to(0, 5), line-to(5, 0); close-path.
        let rings = decode_rings(&[9, 50, 34, 18, 0, 10, 10, 0, 15]).unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(
            rings[0].points,
            vec![(25.0, 17.0), (25.0, 22.0), (30.0, 22.0)]
        );
    }

    #[test]
    fn test_implicit_origin() {
        // First command is a line-to, so the ring starts at the origin.
        let rings = decode_rings(&[10, 0, 10]).unwrap();
        assert_eq!(rings[0].points, vec![(0.0, 0.0), (0.0, 5.0)]);
    }

    #[test]
    fn test_invalid_streams() {
        assert!(matches!(
            decode_rings(&[3]),
            Err(GeometryError::UnknownCommand(3))
        ));
        assert!(matches!(
            decode_rings(&[9, 0, 0, 2]),
            Err(GeometryError::ZeroCount)
        ));
        assert!(matches!(
            decode_rings(&[9, 50]),
            Err(GeometryError::StreamOverrun)
        ));
    }

    #[test]
    fn test_degenerate_polygon_fails() {
        // Two points make no area; the decoder must report failure so the
        // caller can drop the feature.
        let mut decoder = GeometryDecoder::new();
        let result = decoder.decode(&[9, 50, 34, 10, 0, 10, 15]);
        assert!(matches!(result, Err(GeometryError::EmptyMesh)));
    }

    #[test]
    fn test_square_triangulates() {
        // 10x10 square: move-to(0,0); line-to(10,0),(0,10),(-10,0); close.
        let stream = [9, 0, 0, 26, 20, 0, 0, 20, 19, 0, 15];
        let mut decoder = GeometryDecoder::new();
        let mesh = decoder.decode(&stream).unwrap();
        assert!(!mesh.vertices.is_empty());
        assert!(!mesh.indices.is_empty());
        assert_eq!(mesh.indices.len() % 3, 0);
        for &index in &mesh.indices {
            assert!((index as usize) < mesh.vertices.len());
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let stream = [9, 0, 0, 26, 20, 0, 0, 20, 19, 0, 15];
        let mut decoder = GeometryDecoder::new();
        let first = decoder.decode(&stream).unwrap();
        let second = decoder.decode(&stream).unwrap();
        assert_eq!(first.vertices.len(), second.vertices.len());
        assert_eq!(first.indices.len(), second.indices.len());
    }
}
