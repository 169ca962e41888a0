//! Colour parsing and the canonical token representation.
//!
//! Colour tokens are stored and compared as a space-separated HSL triple,
//! `H S% L%`, with ` / A` appended when the colour is not opaque. Numbers
//! carry at most one decimal (alpha at most two) and drop a trailing `.0`.
//! Anything that does not parse as a colour compares by its
//! whitespace-collapsed literal text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsla {
    /// Degrees, `[0, 360)`.
    pub h: f64,
    /// Percent, `[0, 100]`.
    pub s: f64,
    /// Percent, `[0, 100]`.
    pub l: f64,
    /// `[0, 1]`.
    pub a: f64,
}

impl Hsla {
    fn from_rgb(r: f64, g: f64, b: f64, a: f64) -> Self {
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let l = (max + min) / 2.0;
        let delta = max - min;
        if delta == 0.0 {
            return Hsla {
                h: 0.0,
                s: 0.0,
                l: l * 100.0,
                a,
            };
        }
        let s = delta / (1.0 - (2.0 * l - 1.0).abs());
        let h = if max == r {
            60.0 * (((g - b) / delta).rem_euclid(6.0))
        } else if max == g {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };
        Hsla {
            h,
            s: s * 100.0,
            l: l * 100.0,
            a,
        }
    }
}

impl fmt::Display for Hsla {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hue = round_to(self.h.rem_euclid(360.0), 1);
        if hue >= 360.0 {
            hue = 0.0;
        }
        write!(
            f,
            "{} {}% {}%",
            trim_number(hue, 1),
            trim_number(self.s.clamp(0.0, 100.0), 1),
            trim_number(self.l.clamp(0.0, 100.0), 1)
        )?;
        let alpha = round_to(self.a.clamp(0.0, 1.0), 2);
        if alpha < 1.0 {
            write!(f, " / {}", trim_number(alpha, 2))?;
        }
        Ok(())
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn trim_number(value: f64, decimals: i32) -> String {
    let rounded = round_to(value, decimals);
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    let text = format!("{rounded:.prec$}", prec = decimals as usize);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

/// The canonical text for a token value.
pub fn canonical_value(input: &str) -> String {
    match parse_color(input) {
        Some(color) => color.to_string(),
        None => collapse_whitespace(input),
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse any supported colour notation.
pub fn parse_color(input: &str) -> Option<Hsla> {
    let value = input.trim().to_ascii_lowercase();
    if let Some(hex) = value.strip_prefix('#') {
        return parse_hex(hex);
    }
    if let Some(args) = function_args(&value, &["rgba", "rgb"]) {
        return parse_rgb(args);
    }
    if let Some(args) = function_args(&value, &["hsla", "hsl"]) {
        return parse_hsl(args, false);
    }
    if let Some(color) = named(&value) {
        return Some(color);
    }
    parse_hsl(&value, true)
}

fn function_args<'a>(value: &'a str, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        value
            .strip_prefix(name)?
            .trim_start()
            .strip_prefix('(')?
            .strip_suffix(')')
    })
}

fn parse_hex(hex: &str) -> Option<Hsla> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let digits: Vec<u8> = match hex.len() {
        3 | 4 => hex
            .chars()
            .map(|c| u8::from_str_radix(&format!("{c}{c}"), 16).ok())
            .collect::<Option<_>>()?,
        6 | 8 => (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<_>>()?,
        _ => return None,
    };
    let channel = |i: usize| f64::from(digits[i]) / 255.0;
    let alpha = if digits.len() == 4 { channel(3) } else { 1.0 };
    Some(Hsla::from_rgb(channel(0), channel(1), channel(2), alpha))
}

/// Split `a, b, c[, d]` or `a b c[ / d]`.
fn split_args(args: &str) -> Option<(Vec<&str>, Option<&str>)> {
    if args.contains(',') {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        return match parts.len() {
            3 => Some((parts, None)),
            4 => Some((parts[..3].to_vec(), Some(parts[3]))),
            _ => None,
        };
    }
    let (channels, alpha) = match args.split_once('/') {
        Some((channels, alpha)) => (channels, Some(alpha.trim())),
        None => (args, None),
    };
    let parts: Vec<&str> = channels.split_whitespace().collect();
    (parts.len() == 3).then_some((parts, alpha))
}

fn parse_alpha(raw: Option<&str>) -> Option<f64> {
    match raw {
        None => Some(1.0),
        Some(raw) => match raw.strip_suffix('%') {
            Some(percent) => percent.trim().parse::<f64>().ok().map(|p| p / 100.0),
            None => raw.parse::<f64>().ok(),
        },
    }
    .filter(|a| (0.0..=1.0).contains(a))
}

fn parse_rgb(args: &str) -> Option<Hsla> {
    let (channels, alpha) = split_args(args)?;
    let mut rgb = [0.0; 3];
    for (slot, raw) in rgb.iter_mut().zip(&channels) {
        let value = match raw.strip_suffix('%') {
            Some(percent) => percent.parse::<f64>().ok()? / 100.0,
            None => raw.parse::<f64>().ok()? / 255.0,
        };
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        *slot = value;
    }
    Some(Hsla::from_rgb(rgb[0], rgb[1], rgb[2], parse_alpha(alpha)?))
}

/// `hsl()` arguments, or a bare `H S% L%` triple when `bare` is set.
fn parse_hsl(args: &str, bare: bool) -> Option<Hsla> {
    if bare && args.contains(',') {
        return None;
    }
    let (channels, alpha) = split_args(args)?;
    let hue = channels[0].strip_suffix("deg").unwrap_or(channels[0]);
    let h = hue.parse::<f64>().ok()?;
    let s = channels[1].strip_suffix('%')?.parse::<f64>().ok()?;
    let l = channels[2].strip_suffix('%')?.parse::<f64>().ok()?;
    if !(0.0..=100.0).contains(&s) || !(0.0..=100.0).contains(&l) {
        return None;
    }
    Some(Hsla {
        h,
        s,
        l,
        a: parse_alpha(alpha)?,
    })
}

fn named(value: &str) -> Option<Hsla> {
    let hex = match value {
        "black" => "000000",
        "silver" => "c0c0c0",
        "gray" | "grey" => "808080",
        "white" => "ffffff",
        "maroon" => "800000",
        "red" => "ff0000",
        "purple" => "800080",
        "fuchsia" | "magenta" => "ff00ff",
        "green" => "008000",
        "lime" => "00ff00",
        "olive" => "808000",
        "yellow" => "ffff00",
        "navy" => "000080",
        "blue" => "0000ff",
        "teal" => "008080",
        "aqua" | "cyan" => "00ffff",
        "orange" => "ffa500",
        "transparent" => "00000000",
        _ => return None,
    };
    parse_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_colours_share_one_representation() {
        let red = "0 100% 50%";
        for input in [
            "#f00",
            "#ff0000",
            "#FF0000FF",
            "rgb(255, 0, 0)",
            "rgb(255 0 0)",
            "rgba(255,0,0,1)",
            "rgb(100% 0% 0%)",
            "hsl(0, 100%, 50%)",
            "hsl(360deg 100% 50%)",
            "0 100% 50%",
            "red",
        ] {
            assert_eq!(canonical_value(input), red, "{input}");
        }
    }

    #[test]
    fn translucent_colours_keep_alpha() {
        assert_eq!(canonical_value("rgba(0, 0, 0, 0.5)"), "0 0% 0% / 0.5");
        assert_eq!(canonical_value("#00000080"), "0 0% 0% / 0.5");
        assert_eq!(canonical_value("hsl(210 40% 96.1% / 50%)"), "210 40% 96.1% / 0.5");
        assert_eq!(canonical_value("transparent"), "0 0% 0% / 0");
    }

    #[test]
    fn decimals_are_trimmed() {
        assert_eq!(canonical_value("222.2 84.0% 4.9%"), "222.2 84% 4.9%");
        assert_eq!(canonical_value("#0f172a"), "222.2 47.4% 11.2%");
        assert_eq!(canonical_value("#ffffff"), "0 0% 100%");
    }

    #[test]
    fn non_colours_compare_literally() {
        assert_eq!(canonical_value("  0.5rem "), "0.5rem");
        assert_eq!(canonical_value("Inter,   sans-serif"), "Inter, sans-serif");
        assert_eq!(canonical_value("10px 20px 5px"), "10px 20px 5px");
        assert!(parse_color("#ggg").is_none());
        assert!(parse_color("rgb(300, 0, 0)").is_none());
    }
}
