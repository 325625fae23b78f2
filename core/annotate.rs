// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Pixel-level overlay drawing: tracked boxes, the configured line, and
//! a small text readout of the running counts, burned directly into the
//! RGB buffer before JPEG encoding. No font-rendering dependency: digits
//! are drawn from a hand-written 3x5 bitmap font.

use crate::geometry::{BBox, Point};
use crate::track::Track;
use image::RgbImage;

pub const BOX_COLOR: [u8; 3] = [255, 60, 60];
pub const LINE_COLOR: [u8; 3] = [60, 220, 60];
pub const TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// Draws every track's bounding box, the configured line, and an
/// `entry/exit/net` readout onto `img` in place.
pub fn annotate(
    img: &mut RgbImage,
    tracks: &[Track],
    line: (Point, Point),
    entry_count: u64,
    exit_count: u64,
) {
    for t in tracks {
        draw_rect(img, t.last_bbox, BOX_COLOR);
    }
    draw_line(img, line.0, line.1, LINE_COLOR);
    let net = entry_count as i64 - exit_count as i64;
    let text = format!("IN:{entry_count} OUT:{exit_count} NET:{net}");
    draw_text(img, 4, 4, &text, TEXT_COLOR);
}

fn put_pixel_checked(img: &mut RgbImage, x: i64, y: i64, color: [u8; 3]) {
    if x < 0 || y < 0 {
        return;
    }
    let (x, y) = (x as u32, y as u32);
    if x < img.width() && y < img.height() {
        img.put_pixel(x, y, image::Rgb(color));
    }
}

fn draw_rect(img: &mut RgbImage, bbox: BBox, color: [u8; 3]) {
    for x in bbox.x1..=bbox.x2 {
        put_pixel_checked(img, x as i64, bbox.y1 as i64, color);
        put_pixel_checked(img, x as i64, bbox.y2 as i64, color);
    }
    for y in bbox.y1..=bbox.y2 {
        put_pixel_checked(img, bbox.x1 as i64, y as i64, color);
        put_pixel_checked(img, bbox.x2 as i64, y as i64, color);
    }
}

/// Bresenham's line algorithm, the same one used to draw the virtual
/// line on every published frame.
fn draw_line(img: &mut RgbImage, p1: Point, p2: Point, color: [u8; 3]) {
    let (mut x0, mut y0) = (p1.x.round() as i64, p1.y.round() as i64);
    let (x1, y1) = (p2.x.round() as i64, p2.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put_pixel_checked(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// A 3 (wide) x 5 (tall) bitmap font covering the characters the status
/// overlay needs: digits, `:`, space, `I`, `N`, `O`, `U`, `T`, `-`.
fn glyph(c: char) -> [[bool; 3]; 5] {
    const OFF: bool = false;
    const ON: bool = true;
    match c {
        '0' => [
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
        ],
        '1' => [
            [OFF, ON, OFF],
            [ON, ON, OFF],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
            [ON, ON, ON],
        ],
        '2' => [
            [ON, ON, ON],
            [OFF, OFF, ON],
            [ON, ON, ON],
            [ON, OFF, OFF],
            [ON, ON, ON],
        ],
        '3' => [
            [ON, ON, ON],
            [OFF, OFF, ON],
            [OFF, ON, ON],
            [OFF, OFF, ON],
            [ON, ON, ON],
        ],
        '4' => [
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
            [OFF, OFF, ON],
            [OFF, OFF, ON],
        ],
        '5' => [
            [ON, ON, ON],
            [ON, OFF, OFF],
            [ON, ON, ON],
            [OFF, OFF, ON],
            [ON, ON, ON],
        ],
        '6' => [
            [ON, ON, ON],
            [ON, OFF, OFF],
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
        ],
        '7' => [
            [ON, ON, ON],
            [OFF, OFF, ON],
            [OFF, OFF, ON],
            [OFF, OFF, ON],
            [OFF, OFF, ON],
        ],
        '8' => [
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
        ],
        '9' => [
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
            [OFF, OFF, ON],
            [ON, ON, ON],
        ],
        ':' => [
            [OFF, OFF, OFF],
            [OFF, ON, OFF],
            [OFF, OFF, OFF],
            [OFF, ON, OFF],
            [OFF, OFF, OFF],
        ],
        '-' => [
            [OFF, OFF, OFF],
            [OFF, OFF, OFF],
            [ON, ON, ON],
            [OFF, OFF, OFF],
            [OFF, OFF, OFF],
        ],
        'I' => [
            [ON, ON, ON],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
            [ON, ON, ON],
        ],
        'N' => [
            [ON, OFF, ON],
            [ON, ON, ON],
            [ON, ON, ON],
            [ON, ON, ON],
            [ON, OFF, ON],
        ],
        'O' => [
            [ON, ON, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
        ],
        'U' => [
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, OFF, ON],
            [ON, ON, ON],
        ],
        'T' => [
            [ON, ON, ON],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
            [OFF, ON, OFF],
        ],
        'E' => [
            [ON, ON, ON],
            [ON, OFF, OFF],
            [ON, ON, OFF],
            [ON, OFF, OFF],
            [ON, ON, ON],
        ],
        _ => [[OFF; 3]; 5],
    }
}

fn draw_text(img: &mut RgbImage, x0: u32, y0: u32, text: &str, color: [u8; 3]) {
    let mut x = x0 as i64;
    for c in text.chars() {
        if c == ' ' {
            x += 4;
            continue;
        }
        let bits = glyph(c.to_ascii_uppercase());
        for (row, cols) in bits.iter().enumerate() {
            for (col, &on) in cols.iter().enumerate() {
                if on {
                    put_pixel_checked(img, x + col as i64, y0 as i64 + row as i64, color);
                }
            }
        }
        x += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackId;
    use std::collections::VecDeque;

    #[test]
    fn draw_rect_stays_within_bounds() {
        let mut img = RgbImage::new(20, 20);
        let bbox = BBox::new(5, 5, 15, 15).unwrap();
        draw_rect(&mut img, bbox, BOX_COLOR);
        assert_eq!(*img.get_pixel(5, 5), image::Rgb(BOX_COLOR));
        assert_eq!(*img.get_pixel(15, 15), image::Rgb(BOX_COLOR));
        assert_eq!(*img.get_pixel(10, 10), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn draw_line_out_of_bounds_does_not_panic() {
        let mut img = RgbImage::new(10, 10);
        draw_line(&mut img, Point { x: -5.0, y: -5.0 }, Point { x: 20.0, y: 20.0 }, LINE_COLOR);
    }

    #[test]
    fn annotate_draws_tracks_and_counts_without_panicking() {
        let mut img = RgbImage::new(50, 50);
        let track = Track {
            id: TrackId(1),
            last_bbox: BBox::new(1, 1, 10, 10).unwrap(),
            last_frame_seen: 0,
            class_id: 0,
            confidence: 0.9,
            center_history: VecDeque::new(),
            misses: 0,
        };
        annotate(
            &mut img,
            &[track],
            (Point { x: 25.0, y: 0.0 }, Point { x: 25.0, y: 50.0 }),
            3,
            1,
        );
        // Line color should appear somewhere along the configured column.
        assert!((0..50).any(|y| *img.get_pixel(25, y) == image::Rgb(LINE_COLOR)));
    }
}
