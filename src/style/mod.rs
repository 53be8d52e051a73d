//! Declarative style sheet model
//!
//! A style document is JSON: `{ id, version, name, layers: [...] }`. Each
//! layer selects features (source-layer plus an optional filter expression)
//! and assigns paint. Only `background` and `fill` layers render; every
//! other layer type is parsed but skipped.

pub mod color;
pub mod expression;

use std::collections::HashMap;

use serde_json::Value as Json;
use thiserror::Error;

use crate::map::mvt::{GeomType, MetaValue};

use color::{parse_color, Color, ColorParseError};
use expression::{evaluate, Value};

#[derive(Debug, Error)]
pub enum StyleError {
    #[error("style document is not a JSON object")]
    NotAnObject,
    #[error("layer entry is not a JSON object")]
    LayerNotAnObject,
    #[error("missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("key {0:?} holds a value of the wrong kind")]
    WrongKind(&'static str),
    #[error("unrecognized visibility {0:?}")]
    BadVisibility(String),
    #[error(transparent)]
    BadColor(#[from] ColorParseError),
    #[error("style document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A paint property in one of its three shapes: a literal, zoom stops, or an
/// expression resolved per feature at query time.
#[derive(Debug, Clone)]
pub enum PaintProperty<T> {
    Constant(T),
    Stops(Vec<(f64, T)>),
    Expression(Json),
}

/// Step-down stop resolution: the value of the last stop strictly below the
/// zoom, clamped to the first and last stops.
pub fn stop_output<T: Clone>(stops: &[(f64, T)], zoom: f64) -> Option<T> {
    let first = stops.first()?;
    if zoom <= first.0 {
        return Some(first.1.clone());
    }
    for (i, stop) in stops.iter().enumerate() {
        if zoom <= stop.0 {
            return Some(stops[i - 1].1.clone());
        }
    }
    stops.last().map(|stop| stop.1.clone())
}

/// Header shared by every layer style variant.
#[derive(Debug, Clone)]
pub struct LayerCommon {
    pub id: String,
    pub source: String,
    pub source_layer: String,
    pub min_zoom: i32,
    pub max_zoom: i32,
    pub visible: bool,
    pub filter: Option<Json>,
}

impl LayerCommon {
    /// Whether this layer renders at the given map zoom.
    pub fn shown_at(&self, map_zoom: i32) -> bool {
        self.visible && map_zoom >= self.min_zoom && map_zoom < self.max_zoom
    }

    /// Run the layer filter against one feature. Missing filter shows the
    /// feature; an evaluation error or non-boolean result hides it.
    pub fn feature_passes_filter(
        &self,
        geom_type: GeomType,
        metadata: &HashMap<String, MetaValue>,
        map_zoom: i32,
        vp_zoom: f64,
    ) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match evaluate(filter, geom_type, metadata, map_zoom, vp_zoom) {
            Ok(Value::Bool(show)) => show,
            Ok(_) | Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LayerKind {
    Background { color: PaintProperty<Color> },
    Fill(FillPaint),
    NotImplemented,
}

#[derive(Debug, Clone, Default)]
pub struct FillPaint {
    pub color: Option<PaintProperty<Color>>,
    pub opacity: Option<PaintProperty<f64>>,
    pub outline_color: Option<PaintProperty<Color>>,
    pub translate: Option<PaintProperty<[f64; 2]>>,
}

impl FillPaint {
    /// Fill color for one feature; opaque black when absent or unresolvable.
    pub fn fill_color(
        &self,
        geom_type: GeomType,
        metadata: &HashMap<String, MetaValue>,
        map_zoom: i32,
        vp_zoom: f64,
    ) -> Color {
        match &self.color {
            None => Color::BLACK,
            Some(PaintProperty::Constant(color)) => *color,
            Some(PaintProperty::Stops(stops)) => {
                stop_output(stops, map_zoom as f64).unwrap_or(Color::BLACK)
            }
            Some(PaintProperty::Expression(expr)) => {
                match evaluate(expr, geom_type, metadata, map_zoom, vp_zoom) {
                    Ok(Value::Color(color)) => color,
                    Ok(Value::Str(s)) => parse_color(&s).unwrap_or(Color::BLACK),
                    Ok(_) | Err(_) => Color::BLACK,
                }
            }
        }
    }

    /// Fill opacity for one feature; 1.0 when absent or unresolvable.
    pub fn fill_opacity(
        &self,
        geom_type: GeomType,
        metadata: &HashMap<String, MetaValue>,
        map_zoom: i32,
        vp_zoom: f64,
    ) -> f64 {
        match &self.opacity {
            None => 1.0,
            Some(PaintProperty::Constant(opacity)) => *opacity,
            Some(PaintProperty::Stops(stops)) => {
                stop_output(stops, map_zoom as f64).unwrap_or(1.0)
            }
            Some(PaintProperty::Expression(expr)) => {
                match evaluate(expr, geom_type, metadata, map_zoom, vp_zoom) {
                    Ok(value) => value.as_f64().unwrap_or(1.0),
                    Err(_) => 1.0,
                }
            }
        }
    }

    /// Fill translation in screen pixels; (0, 0) when absent or unresolvable.
    pub fn fill_translate(
        &self,
        geom_type: GeomType,
        metadata: &HashMap<String, MetaValue>,
        map_zoom: i32,
        vp_zoom: f64,
    ) -> [f64; 2] {
        match &self.translate {
            None => [0.0, 0.0],
            Some(PaintProperty::Constant(translate)) => *translate,
            Some(PaintProperty::Stops(stops)) => {
                stop_output(stops, map_zoom as f64).unwrap_or([0.0, 0.0])
            }
            Some(PaintProperty::Expression(expr)) => {
                match evaluate(expr, geom_type, metadata, map_zoom, vp_zoom) {
                    Ok(Value::Vec2(translate)) => translate,
                    Ok(_) | Err(_) => [0.0, 0.0],
                }
            }
        }
    }
}

pub struct LayerStyle {
    pub common: LayerCommon,
    pub kind: LayerKind,
}

/// A parsed style document. Owns its layer styles for its lifetime.
pub struct StyleSheet {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub layers: Vec<LayerStyle>,
}

impl StyleSheet {
    pub fn from_json_str(input: &str) -> Result<Self, StyleError> {
        let document: Json = serde_json::from_str(input)?;
        Self::from_json(&document)
    }

    pub fn from_json(document: &Json) -> Result<Self, StyleError> {
        let object = document.as_object().ok_or(StyleError::NotAnObject)?;

        let mut layers = Vec::new();
        if let Some(layer_list) = object.get("layers") {
            let layer_list = layer_list.as_array().ok_or(StyleError::WrongKind("layers"))?;
            for entry in layer_list {
                layers.push(parse_layer(entry)?);
            }
        }

        Ok(StyleSheet {
            id: string_or_default(object.get("id")),
            version: object.get("version").and_then(Json::as_i64).unwrap_or(0),
            name: string_or_default(object.get("name")),
            layers,
        })
    }

    /// Background color at the given zoom, from the first background layer.
    pub fn background_color(&self, map_zoom: i32) -> Option<Color> {
        self.layers.iter().find_map(|layer| match &layer.kind {
            LayerKind::Background { color } => match color {
                PaintProperty::Constant(color) => Some(*color),
                PaintProperty::Stops(stops) => stop_output(stops, map_zoom as f64),
                PaintProperty::Expression(_) => None,
            },
            _ => None,
        })
    }
}

fn string_or_default(value: Option<&Json>) -> String {
    value
        .and_then(Json::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn parse_layer(entry: &Json) -> Result<LayerStyle, StyleError> {
    let object = entry.as_object().ok_or(StyleError::LayerNotAnObject)?;

    let layer_type = object
        .get("type")
        .ok_or(StyleError::MissingKey("type"))?
        .as_str()
        .ok_or(StyleError::WrongKind("type"))?;

    let visible = match object.get("layout") {
        None => true,
        Some(layout) => {
            let layout = layout.as_object().ok_or(StyleError::WrongKind("layout"))?;
            match layout.get("visibility") {
                None => true,
                Some(visibility) => {
                    let visibility =
                        visibility.as_str().ok_or(StyleError::WrongKind("visibility"))?;
                    match visibility {
                        "visible" => true,
                        "none" => false,
                        other => return Err(StyleError::BadVisibility(other.to_string())),
                    }
                }
            }
        }
    };

    let common = LayerCommon {
        id: string_or_default(object.get("id")),
        source: string_or_default(object.get("source")),
        source_layer: string_or_default(object.get("source-layer")),
        min_zoom: object.get("minzoom").and_then(Json::as_i64).unwrap_or(0) as i32,
        max_zoom: object.get("maxzoom").and_then(Json::as_i64).unwrap_or(24) as i32,
        visible,
        filter: object.get("filter").cloned(),
    };

    let kind = match layer_type {
        "background" => parse_background(object)?,
        "fill" => parse_fill(object)?,
        _ => LayerKind::NotImplemented,
    };

    Ok(LayerStyle { common, kind })
}

fn parse_background(object: &serde_json::Map<String, Json>) -> Result<LayerKind, StyleError> {
    let paint = object
        .get("paint")
        .ok_or(StyleError::MissingKey("paint"))?
        .as_object()
        .ok_or(StyleError::WrongKind("paint"))?;
    let color_json = paint
        .get("background-color")
        .ok_or(StyleError::MissingKey("background-color"))?;

    let color = match color_json {
        Json::String(color) => PaintProperty::Constant(parse_color(color)?),
        Json::Object(_) => PaintProperty::Stops(parse_color_stops(color_json)?),
        _ => return Err(StyleError::WrongKind("background-color")),
    };

    Ok(LayerKind::Background { color })
}

fn parse_fill(object: &serde_json::Map<String, Json>) -> Result<LayerKind, StyleError> {
    let mut fill = FillPaint::default();
    let Some(paint) = object.get("paint") else {
        return Ok(LayerKind::Fill(fill));
    };
    let paint = paint.as_object().ok_or(StyleError::WrongKind("paint"))?;

    if let Some(value) = paint.get("fill-color") {
        fill.color = Some(parse_color_property(value, "fill-color")?);
    }
    if let Some(value) = paint.get("fill-outline-color") {
        fill.outline_color = Some(parse_color_property(value, "fill-outline-color")?);
    }
    if let Some(value) = paint.get("fill-opacity") {
        fill.opacity = Some(parse_number_property(value, "fill-opacity")?);
    }
    if let Some(value) = paint.get("fill-translate") {
        fill.translate = Some(parse_translate_property(value)?);
    }

    Ok(LayerKind::Fill(fill))
}

fn parse_color_property(
    value: &Json,
    key: &'static str,
) -> Result<PaintProperty<Color>, StyleError> {
    match value {
        Json::String(color) => Ok(PaintProperty::Constant(parse_color(color)?)),
        Json::Object(_) => Ok(PaintProperty::Stops(parse_color_stops(value)?)),
        Json::Array(_) => Ok(PaintProperty::Expression(value.clone())),
        _ => Err(StyleError::WrongKind(key)),
    }
}

fn parse_number_property(
    value: &Json,
    key: &'static str,
) -> Result<PaintProperty<f64>, StyleError> {
    match value {
        Json::Number(_) => Ok(PaintProperty::Constant(
            value.as_f64().ok_or(StyleError::WrongKind(key))?,
        )),
        Json::Object(_) => {
            let stops = parse_stops(value, |output| {
                output.as_f64().ok_or(StyleError::WrongKind(key))
            })?;
            Ok(PaintProperty::Stops(stops))
        }
        Json::Array(_) => Ok(PaintProperty::Expression(value.clone())),
        _ => Err(StyleError::WrongKind(key)),
    }
}

fn parse_translate_property(value: &Json) -> Result<PaintProperty<[f64; 2]>, StyleError> {
    match value {
        // A two-number array is the literal; any other array is an expression.
        Json::Array(items) if items.len() == 2 && items.iter().all(Json::is_number) => {
            Ok(PaintProperty::Constant(parse_vec2(value)?))
        }
        Json::Array(_) => Ok(PaintProperty::Expression(value.clone())),
        Json::Object(_) => {
            let stops = parse_stops(value, parse_vec2)?;
            Ok(PaintProperty::Stops(stops))
        }
        _ => Err(StyleError::WrongKind("fill-translate")),
    }
}

fn parse_vec2(value: &Json) -> Result<[f64; 2], StyleError> {
    let items = value.as_array().ok_or(StyleError::WrongKind("fill-translate"))?;
    if items.len() != 2 {
        return Err(StyleError::WrongKind("fill-translate"));
    }
    let x = items[0].as_f64().ok_or(StyleError::WrongKind("fill-translate"))?;
    let y = items[1].as_f64().ok_or(StyleError::WrongKind("fill-translate"))?;
    Ok([x, y])
}

fn parse_color_stops(value: &Json) -> Result<Vec<(f64, Color)>, StyleError> {
    parse_stops(value, |output| {
        let color = output.as_str().ok_or(StyleError::WrongKind("stops"))?;
        Ok(parse_color(color)?)
    })
}

/// Parse a `{ stops: [[zoom, value], ...] }` object.
fn parse_stops<T>(
    value: &Json,
    mut parse_output: impl FnMut(&Json) -> Result<T, StyleError>,
) -> Result<Vec<(f64, T)>, StyleError> {
    let object = value.as_object().ok_or(StyleError::WrongKind("stops"))?;
    let stop_list = object
        .get("stops")
        .ok_or(StyleError::MissingKey("stops"))?
        .as_array()
        .ok_or(StyleError::WrongKind("stops"))?;

    let mut stops = Vec::with_capacity(stop_list.len());
    for stop in stop_list {
        let pair = stop.as_array().ok_or(StyleError::WrongKind("stops"))?;
        if pair.len() != 2 {
            return Err(StyleError::WrongKind("stops"));
        }
        let zoom = pair[0].as_f64().ok_or(StyleError::WrongKind("stops"))?;
        stops.push((zoom, parse_output(&pair[1])?));
    }
    Ok(stops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sheet(layers: Json) -> StyleSheet {
        let document = json!({
            "id": "basic",
            "version": 8,
            "name": "Basic",
            "layers": layers,
        });
        StyleSheet::from_json(&document).unwrap()
    }

    #[test]
    fn test_parse_header_defaults() {
        let sheet = sheet(json!([{
            "id": "water",
            "type": "fill",
            "source": "maptiler_planet",
            "source-layer": "water",
        }]));
        assert_eq!(sheet.id, "basic");
        assert_eq!(sheet.version, 8);
        let layer = &sheet.layers[0];
        assert_eq!(layer.common.source_layer, "water");
        assert_eq!(layer.common.min_zoom, 0);
        assert_eq!(layer.common.max_zoom, 24);
        assert!(layer.common.visible);
        assert!(layer.common.filter.is_none());
        assert!(layer.common.shown_at(0));
        assert!(!layer.common.shown_at(24));
    }

    #[test]
    fn test_visibility() {
        let sheet = sheet(json!([{
            "id": "hidden", "type": "fill",
            "layout": { "visibility": "none" },
        }]));
        assert!(!sheet.layers[0].common.visible);

        let result = StyleSheet::from_json(&json!({
            "layers": [{ "id": "x", "type": "fill", "layout": { "visibility": "hidden" } }],
        }));
        assert!(matches!(result, Err(StyleError::BadVisibility(_))));
    }

    #[test]
    fn test_missing_type_is_fatal() {
        let result = StyleSheet::from_json(&json!({ "layers": [{ "id": "x" }] }));
        assert!(matches!(result, Err(StyleError::MissingKey("type"))));
    }

    #[test]
    fn test_unknown_type_is_not_implemented() {
        let sheet = sheet(json!([{ "id": "roads", "type": "line" }]));
        assert!(matches!(sheet.layers[0].kind, LayerKind::NotImplemented));
    }

    #[test]
    fn test_background_stops_step_down() {
        let sheet = sheet(json!([{
            "id": "bg", "type": "background",
            "paint": { "background-color": { "stops": [[0, "#000000"], [10, "#ffffff"]] } },
        }]));
        // Up to and including the upper stop the lower stop's value applies.
        let color = sheet.background_color(5).unwrap();
        assert_eq!(color, Color::rgba(0.0, 0.0, 0.0, 1.0));
        let color = sheet.background_color(10).unwrap();
        assert_eq!(color, Color::rgba(0.0, 0.0, 0.0, 1.0));
        let color = sheet.background_color(11).unwrap();
        assert_eq!(color, Color::rgba(1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_stop_output_clamps() {
        let stops = vec![(2.0, 10), (4.0, 20), (8.0, 30)];
        assert_eq!(stop_output(&stops, 0.0), Some(10));
        assert_eq!(stop_output(&stops, 3.0), Some(10));
        assert_eq!(stop_output(&stops, 5.0), Some(20));
        assert_eq!(stop_output(&stops, 9.0), Some(30));
    }

    #[test]
    fn test_fill_paint_shapes() {
        let sheet = sheet(json!([{
            "id": "landuse", "type": "fill",
            "paint": {
                "fill-color": { "stops": [[0, "#112233"], [10, "#445566"]] },
                "fill-opacity": 0.7,
                "fill-outline-color": "#000000",
                "fill-translate": [2.0, -3.0],
            },
        }]));
        let LayerKind::Fill(fill) = &sheet.layers[0].kind else {
            panic!("expected a fill layer");
        };
        assert!(matches!(fill.color, Some(PaintProperty::Stops(_))));
        assert!(matches!(fill.opacity, Some(PaintProperty::Constant(o)) if o == 0.7));
        assert!(matches!(fill.outline_color, Some(PaintProperty::Constant(_))));
        assert!(
            matches!(fill.translate, Some(PaintProperty::Constant(t)) if t == [2.0, -3.0])
        );
    }

    #[test]
    fn test_fill_expression_property() {
        let sheet = sheet(json!([{
            "id": "landcover", "type": "fill",
            "paint": {
                "fill-color": ["match", ["get", "class"], "wood", "#224422", "#888888"],
            },
        }]));
        let LayerKind::Fill(fill) = &sheet.layers[0].kind else {
            panic!("expected a fill layer");
        };
        assert!(matches!(fill.color, Some(PaintProperty::Expression(_))));

        let metadata: HashMap<String, MetaValue> =
            [("class".to_string(), MetaValue::String("wood".to_string()))].into();
        let color = fill.fill_color(GeomType::Polygon, &metadata, 5, 5.0);
        assert_eq!(color, parse_color("#224422").unwrap());
    }

    #[test]
    fn test_fill_defaults_on_error() {
        let fill = FillPaint {
            // A shape error at evaluation time falls back to the defaults.
            opacity: Some(PaintProperty::Expression(json!(["bogus"]))),
            ..Default::default()
        };
        let metadata = HashMap::new();
        assert_eq!(fill.fill_opacity(GeomType::Polygon, &metadata, 0, 0.0), 1.0);
        assert_eq!(fill.fill_color(GeomType::Polygon, &metadata, 0, 0.0), Color::BLACK);
        assert_eq!(
            fill.fill_translate(GeomType::Polygon, &metadata, 0, 0.0),
            [0.0, 0.0]
        );
    }

    #[test]
    fn test_bad_color_is_fatal() {
        let result = StyleSheet::from_json(&json!({
            "layers": [{
                "id": "bg", "type": "background",
                "paint": { "background-color": "definitely-not-a-color" },
            }],
        }));
        assert!(matches!(result, Err(StyleError::BadColor(_))));
    }

    #[test]
    fn test_filter_hides_on_error() {
        let common = LayerCommon {
            id: String::new(),
            source: String::new(),
            source_layer: String::new(),
            min_zoom: 0,
            max_zoom: 24,
            visible: true,
            filter: Some(json!(["bogus-op", 1])),
        };
        assert!(!common.feature_passes_filter(GeomType::Polygon, &HashMap::new(), 0, 0.0));
    }
}
