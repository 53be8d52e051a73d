//! Color parsing for style documents
//!
//! `hsl()`/`hsla()` are handled directly because the style sheets this viewer
//! targets express almost every color that way; all other forms (hex, named,
//! `rgb()`) go through the CSS color parser.

use thiserror::Error;

/// Straight-alpha RGBA color, components in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Premultiplied RGBA with an extra opacity factor, as the fill pipeline
    /// consumes it.
    pub fn premultiplied(&self, opacity: f32) -> [f32; 4] {
        let a = (self.a * opacity).clamp(0.0, 1.0);
        [self.r * a, self.g * a, self.b * a, a]
    }
}

#[derive(Debug, Error)]
#[error("unparsable color string {0:?}")]
pub struct ColorParseError(pub String);

/// Parse a style-sheet color string.
pub fn parse_color(input: &str) -> Result<Color, ColorParseError> {
    // The hsl notation in the wild is sloppy about whitespace.
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    if let Some(inner) = compact
        .strip_prefix("hsl(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return parse_hsl(inner, false).ok_or_else(|| ColorParseError(input.to_string()));
    }
    if let Some(inner) = compact
        .strip_prefix("hsla(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return parse_hsl(inner, true).ok_or_else(|| ColorParseError(input.to_string()));
    }

    let parsed = csscolorparser::parse(input).map_err(|_| ColorParseError(input.to_string()))?;
    let [r, g, b, a] = parsed.to_array();
    Ok(Color::rgba(r, g, b, a))
}

/// Parse the inside of `hsl(...)`/`hsla(...)`: hue normalized against 360
/// degrees, saturation and lightness against 100, alpha as written.
fn parse_hsl(inner: &str, with_alpha: bool) -> Option<Color> {
    let parts: Vec<&str> = inner.split(',').collect();
    if parts.len() != if with_alpha { 4 } else { 3 } {
        return None;
    }

    let hue = parts[0].parse::<f32>().ok()? / 360.0;
    let saturation = parts[1].strip_suffix('%')?.parse::<f32>().ok()? / 100.0;
    let lightness = parts[2].strip_suffix('%')?.parse::<f32>().ok()? / 100.0;
    let alpha = if with_alpha {
        parts[3].parse::<f32>().ok()?
    } else {
        1.0
    };

    let (r, g, b) = hsl_to_rgb(hue.rem_euclid(1.0), saturation.clamp(0.0, 1.0), lightness.clamp(0.0, 1.0));
    Some(Color::rgba(r, g, b, alpha.clamp(0.0, 1.0)))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_hsl() {
        let color = parse_color("hsl(120, 50%, 50%)").unwrap();
        assert!(close(color.r, 0.25));
        assert!(close(color.g, 0.75));
        assert!(close(color.b, 0.25));
        assert!(close(color.a, 1.0));
    }

    #[test]
    fn test_hsla() {
        let color = parse_color("hsla(0,100%,50%,0.5)").unwrap();
        assert!(close(color.r, 1.0));
        assert!(close(color.g, 0.0));
        assert!(close(color.a, 0.5));
    }

    #[test]
    fn test_hex_and_named() {
        let red = parse_color("#ff0000").unwrap();
        assert!(close(red.r, 1.0) && close(red.g, 0.0) && close(red.b, 0.0));
        let white = parse_color("white").unwrap();
        assert!(close(white.r, 1.0) && close(white.g, 1.0) && close(white.b, 1.0));
    }

    #[test]
    fn test_invalid() {
        assert!(parse_color("not-a-color").is_err());
        assert!(parse_color("hsl(1,2,3)").is_err()); // missing % signs
    }

    #[test]
    fn test_premultiplied() {
        let color = Color::rgba(1.0, 0.5, 0.0, 1.0);
        assert_eq!(color.premultiplied(0.5), [0.5, 0.25, 0.0, 0.5]);
    }
}
