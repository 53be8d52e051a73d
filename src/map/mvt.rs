//! Vector-tile wire format and decoding
//!
//! See <https://github.com/mapbox/vector-tile-spec/tree/master/2.1>.

use std::collections::HashMap;

use prost::{Enumeration, Message};
use thiserror::Error;

use super::geometry::GeometryDecoder;

/// Bytes per vertex in the staged buffers (two f32 components).
pub const VERTEX_STRIDE: usize = 8;
/// Bytes per index in the staged buffers (u32).
pub const INDEX_STRIDE: usize = 4;

/// Vector tile data.
#[derive(Clone, PartialEq, Message)]
pub struct Tile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<Layer>,
}

/// Tile layer.
#[derive(Clone, PartialEq, Message)]
pub struct Layer {
    /// Vector tile specification version used by this layer.
    #[prost(uint32, required, tag = "15", default = "1")]
    pub version: u32,
    /// Unique layer identifier.
    #[prost(string, required, tag = "1")]
    pub name: String,
    /// The features in this layer.
    #[prost(message, repeated, tag = "2")]
    pub features: Vec<Feature>,
    /// Tag keys used by the layer's features.
    #[prost(string, repeated, tag = "3")]
    pub keys: Vec<String>,
    /// Tag values used by the layer's features.
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<Value>,
    /// Inclusive width and height of the layer's coordinate system.
    #[prost(uint32, tag = "5", default = "4096")]
    pub extent: u32,
}

/// Layer feature.
#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(uint64, optional, tag = "1", default = "0")]
    pub id: Option<u64>,
    /// Consecutive pairs of key and value indices into the parent layer's
    /// `keys`/`values` tables.
    #[prost(uint32, repeated, tag = "2")]
    pub tags: Vec<u32>,
    #[prost(enumeration = "GeomType", optional, tag = "3", default = "Unknown")]
    pub r#type: Option<i32>,
    /// Stream of geometry commands and parameters.
    #[prost(uint32, repeated, tag = "4")]
    pub geometry: Vec<u32>,
}

/// Types of geometry for a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum GeomType {
    Unknown = 0,
    Point = 1,
    Linestring = 2,
    Polygon = 3,
}

impl GeomType {
    /// Name used by the `$type` pseudo-property in style expressions.
    pub fn type_name(&self) -> &'static str {
        match self {
            GeomType::Point => "Point",
            GeomType::Linestring => "LineString",
            GeomType::Polygon => "Polygon",
            GeomType::Unknown => "Unknown",
        }
    }
}

/// Feature tag value. Exactly one field is present in a valid message.
#[derive(Clone, PartialEq, Message)]
pub struct Value {
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub float_value: Option<f32>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "4")]
    pub int_value: Option<i64>,
    #[prost(uint64, optional, tag = "5")]
    pub uint_value: Option<u64>,
    #[prost(sint64, optional, tag = "6")]
    pub sint_value: Option<i64>,
    #[prost(bool, optional, tag = "7")]
    pub bool_value: Option<bool>,
}

/// A decoded metadata value attached to a feature.
#[derive(Clone, Debug, PartialEq)]
pub enum MetaValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    F32(f32),
    String(String),
}

/// Failure decoding a whole tile. Per-feature problems (bad metadata values,
/// untriangulatable geometry) drop the feature instead.
#[derive(Debug, Error)]
pub enum TileDecodeError {
    #[error("malformed tile protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("feature tag stream has odd length")]
    OddTagCount,
}

#[derive(Debug, Error)]
enum MetadataError {
    #[error("tag index out of range of the layer tables")]
    BadIndex,
    #[error("value message has no populated field")]
    EmptyValue,
}

/// One feature's slice into the tile's flat buffers, plus its metadata.
#[derive(Debug, Clone)]
pub struct StagedFeature {
    /// Byte offset of this feature's first vertex in the tile vertex buffer.
    pub vtx_byte_offset: u64,
    /// Byte offset of this feature's first index in the tile index buffer.
    pub idx_byte_offset: u64,
    /// Number of indices to draw for this feature.
    pub idx_count: u32,
    pub metadata: HashMap<String, MetaValue>,
}

#[derive(Debug, Clone)]
pub struct StagedLayer {
    pub name: String,
    pub extent: u32,
    pub features: Vec<StagedFeature>,
}

/// A fully decoded tile awaiting GPU upload: flat vertex/index buffers and
/// the layer/feature table slicing into them.
#[derive(Debug, Clone, Default)]
pub struct StagedTile {
    pub layers: Vec<StagedLayer>,
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

/// Decode a wire-format tile into staged buffers.
///
/// Only polygon features are materialized. Features whose metadata or
/// geometry cannot be decoded are dropped; the rest of the tile is kept.
pub fn decode_tile(
    bytes: &[u8],
    decoder: &mut GeometryDecoder,
) -> Result<StagedTile, TileDecodeError> {
    let tile = Tile::decode(bytes)?;

    let mut staged = StagedTile::default();
    for layer in &tile.layers {
        let mut out_layer = StagedLayer {
            name: layer.name.clone(),
            extent: layer.extent,
            features: Vec::new(),
        };

        for feature in &layer.features {
            if feature.r#type() != GeomType::Polygon {
                continue;
            }
            if feature.tags.len() % 2 != 0 {
                return Err(TileDecodeError::OddTagCount);
            }

            let metadata = match feature_metadata(&feature.tags, &layer.keys, &layer.values) {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::debug!("dropping feature in layer {:?}: {err}", layer.name);
                    continue;
                }
            };

            let vtx_byte_offset = (staged.vertices.len() * VERTEX_STRIDE) as u64;
            let idx_byte_offset = (staged.indices.len() * INDEX_STRIDE) as u64;

            let mesh = match decoder.decode(&feature.geometry) {
                Ok(mesh) => mesh,
                Err(err) => {
                    log::debug!("dropping feature in layer {:?}: {err}", layer.name);
                    continue;
                }
            };

            let idx_count = mesh.indices.len() as u32;
            staged.vertices.extend_from_slice(&mesh.vertices);
            staged.indices.extend_from_slice(&mesh.indices);

            out_layer.features.push(StagedFeature {
                vtx_byte_offset,
                idx_byte_offset,
                idx_count,
                metadata,
            });
        }

        staged.layers.push(out_layer);
    }

    Ok(staged)
}

fn feature_metadata(
    tags: &[u32],
    keys: &[String],
    values: &[Value],
) -> Result<HashMap<String, MetaValue>, MetadataError> {
    let mut metadata = HashMap::new();
    for tag in tags.chunks(2) {
        let key = keys
            .get(tag[0] as usize)
            .ok_or(MetadataError::BadIndex)?;
        let value = values
            .get(tag[1] as usize)
            .ok_or(MetadataError::BadIndex)?;
        metadata.insert(key.clone(), decode_value(value)?);
    }
    Ok(metadata)
}

fn decode_value(value: &Value) -> Result<MetaValue, MetadataError> {
    if let Some(s) = &value.string_value {
        Ok(MetaValue::String(s.clone()))
    } else if let Some(f) = value.float_value {
        Ok(MetaValue::F32(f))
    } else if let Some(d) = value.double_value {
        Ok(MetaValue::F64(d))
    } else if let Some(i) = value.int_value {
        Ok(MetaValue::I64(i))
    } else if let Some(u) = value.uint_value {
        Ok(MetaValue::U64(u))
    } else if let Some(s) = value.sint_value {
        Ok(MetaValue::I64(s))
    } else if let Some(b) = value.bool_value {
        Ok(MetaValue::Bool(b))
    } else {
        Err(MetadataError::EmptyValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 10x10 square: move-to(0,0); line-to(10,0),(0,10),(-10,0); close.
    const SQUARE: &[u32] = &[9, 0, 0, 26, 20, 0, 0, 20, 19, 0, 15];
    // Two points, no area.
    const DEGENERATE: &[u32] = &[9, 50, 34, 10, 0, 10, 15];

    fn string_value(s: &str) -> Value {
        Value {
            string_value: Some(s.to_string()),
            ..Default::default()
        }
    }

    fn polygon_feature(tags: Vec<u32>, geometry: &[u32]) -> Feature {
        Feature {
            id: Some(1),
            tags,
            r#type: Some(GeomType::Polygon as i32),
            geometry: geometry.to_vec(),
        }
    }

    fn layer_with(features: Vec<Feature>) -> Layer {
        Layer {
            version: 2,
            name: "water".to_string(),
            features,
            keys: vec!["class".to_string()],
            values: vec![string_value("ocean")],
            extent: 4096,
        }
    }

    fn encode(tile: &Tile) -> Vec<u8> {
        tile.encode_to_vec()
    }

    #[test]
    fn test_decode_polygon_feature() {
        let tile = Tile {
            layers: vec![layer_with(vec![polygon_feature(vec![0, 0], SQUARE)])],
        };
        let staged = decode_tile(&encode(&tile), &mut GeometryDecoder::new()).unwrap();

        assert_eq!(staged.layers.len(), 1);
        assert_eq!(staged.layers[0].name, "water");
        assert_eq!(staged.layers[0].extent, 4096);
        let feature = &staged.layers[0].features[0];
        assert_eq!(feature.vtx_byte_offset, 0);
        assert_eq!(feature.idx_byte_offset, 0);
        assert!(feature.idx_count > 0);
        assert_eq!(
            feature.metadata.get("class"),
            Some(&MetaValue::String("ocean".to_string()))
        );
    }

    #[test]
    fn test_feature_slices_are_aligned() {
        let tile = Tile {
            layers: vec![layer_with(vec![
                polygon_feature(vec![0, 0], SQUARE),
                polygon_feature(vec![0, 0], SQUARE),
            ])],
        };
        let staged = decode_tile(&encode(&tile), &mut GeometryDecoder::new()).unwrap();

        let index_buffer_size = (staged.indices.len() * INDEX_STRIDE) as u64;
        for feature in &staged.layers[0].features {
            assert_eq!(feature.vtx_byte_offset % 8, 0);
            assert_eq!(feature.idx_byte_offset % 4, 0);
            assert!(
                feature.idx_byte_offset + 4 * feature.idx_count as u64 <= index_buffer_size
            );
        }
        // The second feature starts where the first one ended.
        assert!(staged.layers[0].features[1].vtx_byte_offset > 0);
    }

    #[test]
    fn test_non_polygon_features_skipped() {
        let mut feature = polygon_feature(vec![0, 0], SQUARE);
        feature.r#type = Some(GeomType::Linestring as i32);
        let tile = Tile {
            layers: vec![layer_with(vec![feature])],
        };
        let staged = decode_tile(&encode(&tile), &mut GeometryDecoder::new()).unwrap();
        assert!(staged.layers[0].features.is_empty());
        assert!(staged.vertices.is_empty());
    }

    #[test]
    fn test_odd_tag_count_fails_tile() {
        let tile = Tile {
            layers: vec![layer_with(vec![polygon_feature(vec![0], SQUARE)])],
        };
        let result = decode_tile(&encode(&tile), &mut GeometryDecoder::new());
        assert!(matches!(result, Err(TileDecodeError::OddTagCount)));
    }

    #[test]
    fn test_bad_metadata_drops_feature() {
        // Tag indices point past the layer tables.
        let tile = Tile {
            layers: vec![layer_with(vec![
                polygon_feature(vec![7, 7], SQUARE),
                polygon_feature(vec![0, 0], SQUARE),
            ])],
        };
        let staged = decode_tile(&encode(&tile), &mut GeometryDecoder::new()).unwrap();
        assert_eq!(staged.layers[0].features.len(), 1);
    }

    #[test]
    fn test_degenerate_geometry_drops_feature() {
        let tile = Tile {
            layers: vec![layer_with(vec![
                polygon_feature(vec![0, 0], DEGENERATE),
                polygon_feature(vec![0, 0], SQUARE),
            ])],
        };
        let staged = decode_tile(&encode(&tile), &mut GeometryDecoder::new()).unwrap();
        // The degenerate feature is gone, the square survives at offset 0.
        assert_eq!(staged.layers[0].features.len(), 1);
        assert_eq!(staged.layers[0].features[0].vtx_byte_offset, 0);
    }

    #[test]
    fn test_garbage_bytes_fail() {
        let result = decode_tile(&[0xff, 0xff, 0xff], &mut GeometryDecoder::new());
        assert!(matches!(result, Err(TileDecodeError::Protobuf(_))));
    }
}
