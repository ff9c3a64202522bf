// src/render.rs - Skeleton overlay drawing onto a mirrored 2D surface
use image::{Rgba, RgbaImage};
use resvg::tiny_skia::{self, FillRule, LineCap, Paint, PathBuilder, Pixmap, Stroke, Transform};
use serde::{Deserialize, Serialize};

use crate::keypoints::{Keypoint, KeypointStore, Point};
use crate::skeleton;

/// Horizontal part of the affine transform applied to every draw call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawTransform {
    pub scale_x: f32,
    pub translate_x: f32,
}

impl DrawTransform {
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            translate_x: 0.0,
        }
    }

    /// Flip about the vertical centerline: translate by `width`, then scale x by -1.
    pub fn mirror(width: f32) -> Self {
        Self {
            scale_x: -1.0,
            translate_x: width,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(self.translate_x + self.scale_x * p.x, p.y)
    }

    fn to_skia(self) -> Transform {
        Transform::from_row(self.scale_x, 0.0, 0.0, 1.0, self.translate_x, 0.0)
    }
}

/// A 2D drawing target. Coordinates are given in frame space and mapped
/// through `transform` by the surface.
pub trait Surface {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn clear(&mut self);
    fn stroke_line(&mut self, from: Point, to: Point, width: f32, color: Rgba<u8>, transform: DrawTransform);
    fn fill_circle(&mut self, center: Point, radius: f32, color: Rgba<u8>, transform: DrawTransform);
    /// Unpremultiplied copy of the current contents.
    fn snapshot(&self) -> RgbaImage;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderStyle {
    pub bone_color: [u8; 4],
    pub bone_width: f32,
    pub point_color: [u8; 4],
    pub point_radius: f32,
    /// Multiplier for keypoint coordinates when video and canvas sizes differ.
    pub point_scale: f32,
    pub mirrored: bool,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            bone_color: [255, 0, 0, 255],
            bone_width: 8.0,
            point_color: [255, 0, 0, 255],
            point_radius: 3.0,
            point_scale: 1.0,
            mirrored: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameRenderer {
    style: RenderStyle,
}

impl FrameRenderer {
    pub fn new(style: RenderStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &RenderStyle {
        &self.style
    }

    fn transform_for(&self, surface: &dyn Surface) -> DrawTransform {
        if self.style.mirrored {
            DrawTransform::mirror(surface.width() as f32)
        } else {
            DrawTransform::identity()
        }
    }

    /// Draws every bone whose endpoints are both present in `store`.
    /// Returns the number of bones drawn.
    pub fn draw_skeleton(&self, store: &KeypointStore, surface: &mut dyn Surface) -> usize {
        let transform = self.transform_for(surface);
        let color = Rgba(self.style.bone_color);
        let mut drawn = 0;

        for bone in skeleton::bones() {
            let (Some(from), Some(to)) = (store.get(bone.from), store.get(bone.to)) else {
                continue;
            };
            if !is_finite(from) || !is_finite(to) {
                continue;
            }
            surface.stroke_line(from, to, self.style.bone_width, color, transform);
            drawn += 1;
        }
        drawn
    }

    /// Draws a dot at each keypoint scoring above `min_score`.
    /// Returns the number of dots drawn.
    pub fn draw_points(&self, raw: &[Keypoint], min_score: f32, surface: &mut dyn Surface) -> usize {
        let transform = self.transform_for(surface);
        let color = Rgba(self.style.point_color);
        let scale = self.style.point_scale;
        let mut drawn = 0;

        for kp in raw {
            if !(kp.score > min_score) {
                continue;
            }
            let center = Point::new(kp.x * scale, kp.y * scale);
            if !is_finite(center) {
                continue;
            }
            surface.fill_circle(center, self.style.point_radius, color, transform);
            drawn += 1;
        }
        drawn
    }
}

fn is_finite(p: Point) -> bool {
    p.x.is_finite() && p.y.is_finite()
}

/// Raster canvas the overlay is drawn into.
pub struct PixmapSurface {
    pixmap: Pixmap,
}

impl PixmapSurface {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Pixmap::new(width, height).map(|pixmap| Self { pixmap })
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    fn paint(color: Rgba<u8>) -> Paint<'static> {
        let mut paint = Paint::default();
        let [r, g, b, a] = color.0;
        paint.set_color_rgba8(r, g, b, a);
        paint.anti_alias = true;
        paint
    }
}

impl Surface for PixmapSurface {
    fn width(&self) -> u32 {
        self.pixmap.width()
    }

    fn height(&self) -> u32 {
        self.pixmap.height()
    }

    fn clear(&mut self) {
        self.pixmap.fill(tiny_skia::Color::TRANSPARENT);
    }

    fn stroke_line(&mut self, from: Point, to: Point, width: f32, color: Rgba<u8>, transform: DrawTransform) {
        let mut pb = PathBuilder::new();
        pb.move_to(from.x, from.y);
        pb.line_to(to.x, to.y);
        // Degenerate (zero-length) segments produce no path.
        let Some(path) = pb.finish() else {
            return;
        };
        let stroke = Stroke {
            width,
            line_cap: LineCap::Butt,
            ..Stroke::default()
        };
        self.pixmap
            .stroke_path(&path, &Self::paint(color), &stroke, transform.to_skia(), None);
    }

    fn fill_circle(&mut self, center: Point, radius: f32, color: Rgba<u8>, transform: DrawTransform) {
        let Some(path) = PathBuilder::from_circle(center.x, center.y, radius) else {
            return;
        };
        self.pixmap.fill_path(
            &path,
            &Self::paint(color),
            FillRule::Winding,
            transform.to_skia(),
            None,
        );
    }

    fn snapshot(&self) -> RgbaImage {
        let mut image = RgbaImage::new(self.width(), self.height());
        for (dst, src) in image.pixels_mut().zip(self.pixmap.pixels()) {
            let c = src.demultiply();
            *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
        }
        image
    }
}
