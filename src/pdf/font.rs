//! Metrics for the standard Helvetica font, and WinAnsi text encoding.
//!
//! Overlay text uses one of the 14 standard fonts so that we never need to
//! embed font data. Widths are in thousandths of an em.

/// Resource name we give the overlay font.
pub const FONT_RESOURCE: &str = "F1";

/// Base font for the overlay.
pub const BASE_FONT: &str = "Helvetica";

/// Font size at which we measure words before scaling to fit.
pub const REFERENCE_FONT_SIZE: f64 = 15.0;

/// Width of anything we don't have a specific metric for.
const DEFAULT_WIDTH: u16 = 556;

/// Helvetica widths for WinAnsi codes 32..=126.
#[rustfmt::skip]
const ASCII_WIDTHS: [u16; 95] = [
    // space ! " # $ % & ' ( ) * + , - . /
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    // 0-9
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556,
    // : ; < = > ? @
    278, 278, 584, 584, 584, 556, 1015,
    // A-Z
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833,
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611,
    // [ \ ] ^ _ `
    278, 278, 278, 469, 556, 333,
    // a-z
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833,
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500,
    // { | } ~
    334, 260, 334, 584,
];

/// Width of one WinAnsi-encoded byte.
fn char_width(code: u8) -> u16 {
    match code {
        32..=126 => ASCII_WIDTHS[usize::from(code - 32)],
        // Curly quotes, bullet, em dash, ellipsis, per mille.
        0x91 | 0x92 | 0x82 => 222,
        0x93 | 0x94 | 0x84 => 333,
        0x95 => 350,
        0x97 | 0x85 | 0x89 => 1000,
        0xA0 => 278,
        _ => DEFAULT_WIDTH,
    }
}

/// The WinAnsi code for a character, if it has one.
fn win_ansi_code(c: char) -> Option<u8> {
    let code = match c {
        ' '..='~' => c as u8,
        '\u{A0}'..='\u{FF}' => c as u32 as u8,
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8A,
        '‹' => 0x8B,
        'Œ' => 0x8C,
        'Ž' => 0x8E,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9A,
        '›' => 0x9B,
        'œ' => 0x9C,
        'ž' => 0x9E,
        'Ÿ' => 0x9F,
        _ => return None,
    };
    Some(code)
}

/// Encode text for a WinAnsi font, replacing anything unrepresentable with
/// `?`.
pub fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| win_ansi_code(c).unwrap_or(b'?'))
        .collect()
}

/// Width of encoded text at `font_size`, in points.
pub fn text_width(encoded: &[u8], font_size: f64) -> f64 {
    let units = encoded
        .iter()
        .map(|&code| u32::from(char_width(code)))
        .sum::<u32>();
    f64::from(units) * font_size / 1000.0
}

/// The integer font size at which `encoded` is as wide as `target_width`
/// without exceeding it, but never less than 1. Returns `None` for text with
/// no width.
pub fn font_size_for_width(encoded: &[u8], target_width: f64) -> Option<u32> {
    let reference_width = text_width(encoded, REFERENCE_FONT_SIZE);
    if reference_width <= 0.0 {
        return None;
    }
    let size = (REFERENCE_FONT_SIZE * target_width / reference_width).floor();
    Some(if size < 1.0 { 1 } else { size as u32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_win_ansi() {
        assert_eq!(encode_win_ansi("Café €5"), b"Caf\xe9 \x805".to_vec());
        assert_eq!(encode_win_ansi("日本"), b"??".to_vec());
        assert_eq!(encode_win_ansi("“quoted”"), b"\x93quoted\x94".to_vec());
    }

    #[test]
    fn measures_text() {
        // H = 722, i = 222
        assert!((text_width(b"Hi", 10.0) - 9.44).abs() < 1e-9);
        assert_eq!(text_width(b"", 12.0), 0.0);
    }

    #[test]
    fn fitted_size_reproduces_box_width() {
        for (word, box_width) in [("Invoice", 612.0), ("a", 37.5), ("WWWWW", 200.0), ("1,234.56", 61.0)] {
            let encoded = encode_win_ansi(word);
            let size = font_size_for_width(&encoded, box_width).unwrap();
            assert!(text_width(&encoded, f64::from(size)) <= box_width, "{word}");
            assert!(text_width(&encoded, f64::from(size + 1)) > box_width, "{word}");
        }
    }

    #[test]
    fn tiny_boxes_get_minimum_size() {
        assert_eq!(font_size_for_width(b"supercalifragilistic", 0.5), Some(1));
        assert_eq!(font_size_for_width(b"", 100.0), None);
    }
}
