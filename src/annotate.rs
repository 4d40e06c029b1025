use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;

use crate::image_state::TaggedImage;
use crate::point::{Point, PointLabel};

/// Marker extent in pixels (tip to tip).
pub const MARKER_SIZE: i32 = 20;
/// Stroke width of marker lines.
pub const MARKER_THICKNESS: i32 = 5;

pub const FOREGROUND_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const BACKGROUND_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerShape {
    TiltedCross,
    TriangleUp,
}

/// ラベルごとの固定スタイル
pub const fn marker_style(label: PointLabel) -> (MarkerShape, Rgb<u8>) {
    match label {
        PointLabel::Foreground => (MarkerShape::TriangleUp, FOREGROUND_COLOR),
        PointLabel::Background => (MarkerShape::TiltedCross, BACKGROUND_COLOR),
    }
}

/// Draws every point onto a display-order copy of `clean`.
pub fn render<'a, I>(clean: &TaggedImage, points: I) -> RgbImage
where
    I: IntoIterator<Item = &'a Point>,
{
    render_display(clean.to_display(), points)
}

/// Same as [`render`] for a buffer that is already in display order.
pub fn render_display<'a, I>(mut canvas: RgbImage, points: I) -> RgbImage
where
    I: IntoIterator<Item = &'a Point>,
{
    for point in points {
        draw_marker(&mut canvas, point);
    }
    canvas
}

/// Draws a single marker in place. Parts outside the canvas are clipped.
pub fn draw_marker(canvas: &mut RgbImage, point: &Point) {
    let (shape, color) = marker_style(point.label);
    let (x, y) = (point.x, point.y);
    let half = MARKER_SIZE / 2;

    // キャンバスに掛からないマーカーは描かない
    let reach = i64::from(MARKER_SIZE);
    let (width, height) = (i64::from(canvas.width()), i64::from(canvas.height()));
    if i64::from(x) < -reach || i64::from(y) < -reach || i64::from(x) >= width + reach || i64::from(y) >= height + reach {
        return;
    }

    let (left, right) = (x.saturating_sub(half), x.saturating_add(half));
    let (top, bottom) = (y.saturating_sub(half), y.saturating_add(half));

    let segments: &[((i32, i32), (i32, i32))] = match shape {
        MarkerShape::TiltedCross => &[
            ((left, bottom), (right, top)),
            ((right, bottom), (left, top)),
        ],
        MarkerShape::TriangleUp => &[
            ((left, bottom), (right, bottom)),
            ((right, bottom), (x, top)),
            ((x, top), (left, bottom)),
        ],
    };

    for &(start, end) in segments {
        draw_thick_line_mut(canvas, start, end, MARKER_THICKNESS, color);
    }
}

/// Line with round caps, stamped as discs along the segment.
fn draw_thick_line_mut(
    canvas: &mut RgbImage,
    start: (i32, i32),
    end: (i32, i32),
    thickness: i32,
    color: Rgb<u8>,
) {
    let radius = (thickness / 2).max(0);
    let (dx, dy) = (end.0 - start.0, end.1 - start.1);
    let steps = dx.abs().max(dy.abs()).max(1);

    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        let cx = start.0 as f32 + dx as f32 * t;
        let cy = start.1 as f32 + dy as f32 * t;
        draw_filled_circle_mut(canvas, (cx.round() as i32, cy.round() as i32), radius, color);
    }
}
