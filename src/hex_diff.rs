/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::fmt::Write;

pub const DEFAULT_ROW_WIDTH: usize = 16;

/// bold yellow
pub const HIGHLIGHT_START: &str = "\x1b[1;33m";
pub const HIGHLIGHT_END: &str = "\x1b[0m";

/// Side-by-side hex comparison of two buffers.
///
/// Rows that are identical on both sides collapse into a single ` ...` line.
/// Differing rows show the offset, the actual bytes and the expected bytes,
/// with every byte that differs from (or is missing on) the other side
/// highlighted. Bytes past the end of the shorter buffer are left blank.
pub fn hex_compare(actual: &[u8], expected: &[u8], row_width: usize) -> String {
    let row_width = row_width.max(1);
    let rows = actual.len().max(expected.len()).div_ceil(row_width);

    let mut comparison = String::new();
    let _ = writeln!(
        comparison,
        "          {:<width$}expected ({}):",
        format!("output ({}):", actual.len()),
        expected.len(),
        width = row_width * 2 + 3
    );

    let mut prev_is_dots = false;
    for row in 0..rows {
        let a_row = row_slice(actual, row, row_width);
        let e_row = row_slice(expected, row, row_width);

        if a_row == e_row {
            if !prev_is_dots {
                comparison.push_str(" ...\n");
                prev_is_dots = true;
            }
        } else {
            let _ = write!(comparison, "{:8}: ", row * row_width);
            render_row(&mut comparison, a_row, e_row, row_width);
            comparison.push_str("  ");
            render_row(&mut comparison, e_row, a_row, row_width);
            comparison.push('\n');
            prev_is_dots = false;
        }
    }

    comparison.push('\n');
    comparison
}

fn row_slice(data: &[u8], row: usize, row_width: usize) -> &[u8] {
    let start = (row * row_width).min(data.len());
    let end = (start + row_width).min(data.len());
    &data[start..end]
}

fn render_row(out: &mut String, to_print: &[u8], to_compare: &[u8], row_width: usize) {
    for i in 0..row_width {
        // gap in the middle of even width rows
        if row_width % 2 == 0 && i == row_width / 2 {
            out.push(' ');
        }

        match to_print.get(i) {
            Some(b) if to_compare.get(i) != Some(b) => {
                let _ = write!(out, "{}{:02x}{}", HIGHLIGHT_START, b, HIGHLIGHT_END);
            }
            Some(b) => {
                let _ = write!(out, "{:02x}", b);
            }
            None => out.push_str("  "),
        }
    }
}

#[cfg(test)]
fn highlighted(s: &str) -> usize {
    s.matches(HIGHLIGHT_START).count()
}

#[test]
fn identical_buffers_have_no_highlight() {
    let data: Vec<u8> = (0..100).collect();
    let r = hex_compare(&data, &data, DEFAULT_ROW_WIDTH);

    assert_eq!(highlighted(&r), 0);
    // all 7 rows collapse into one marker
    assert_eq!(r.matches(" ...").count(), 1);
    assert!(r.starts_with("          output (100):"));
    assert!(r.contains("expected (100):"));
}

#[test]
fn single_difference_is_highlighted_on_both_sides() {
    let expected: Vec<u8> = (0..64).collect();
    let mut actual = expected.clone();
    actual[37] = 0xff;

    let r = hex_compare(&actual, &expected, DEFAULT_ROW_WIDTH);

    let lines: Vec<&str> = r.lines().collect();
    // header, dots, row 32, dots and the closing blank line
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[1], " ...");
    assert!(lines[2].starts_with("      32: "));
    assert_eq!(lines[3], " ...");

    assert_eq!(highlighted(lines[2]), 2);
    assert!(lines[2].contains(&format!("{}ff{}", HIGHLIGHT_START, HIGHLIGHT_END)));
    assert!(lines[2].contains(&format!("{}25{}", HIGHLIGHT_START, HIGHLIGHT_END)));
}

#[test]
fn row_layout() {
    let r = hex_compare(&[0x00, 0x01], &[0x00, 0x02], 4);
    let line = r.lines().nth(1).unwrap();

    let hl = |s: &str| format!("{}{}{}", HIGHLIGHT_START, s, HIGHLIGHT_END);
    assert_eq!(
        line,
        format!("       0: 00{}       00{}     ", hl("01"), hl("02"))
    );
}

#[test]
fn unequal_lengths_render_blanks() {
    let expected = b"0123456789abcdefXYZ";
    let actual = b"0123456789abcdef";

    let r = hex_compare(actual, expected, DEFAULT_ROW_WIDTH);
    let lines: Vec<&str> = r.lines().collect();

    assert_eq!(lines[1], " ...");
    assert!(lines[2].starts_with("      16: "));
    // only the three bytes missing from the output are highlighted
    assert_eq!(highlighted(lines[2]), 3);

    // and nothing to compare against at all
    let r = hex_compare(b"", b"abc", DEFAULT_ROW_WIDTH);
    assert_eq!(highlighted(&r), 3);
    let r = hex_compare(b"", b"", DEFAULT_ROW_WIDTH);
    assert_eq!(r, format!("          {:<35}expected (0):\n\n", "output (0):"));
}
