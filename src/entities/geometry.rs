//! Viewport geometry used by the visibility tracker.

use serde::{Deserialize, Serialize};

/// Opaque handle to a host view (DOM node, widget id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewRef(pub u64);

/// Axis-aligned rectangle in viewport coordinates (y grows downwards).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Overlapping region, or None when the rects only touch or are disjoint.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Fraction of `self` covered by `viewport`, in [0, 1].
    pub fn visible_ratio(&self, viewport: &Rect) -> f32 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        let covered = self.intersection(viewport).map(|r| r.area()).unwrap_or(0.0);
        (covered / area).clamp(0.0, 1.0) as f32
    }

    /// Vertical gap to `viewport` along the scroll axis (0 when overlapping).
    pub fn vertical_distance(&self, viewport: &Rect) -> f64 {
        if self.bottom() <= viewport.y {
            viewport.y - self.bottom()
        } else if self.y >= viewport.bottom() {
            self.y - viewport.bottom()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_ratio_partial() {
        let viewport = Rect::new(0.0, 0.0, 400.0, 800.0);
        let half_in = Rect::new(0.0, 600.0, 400.0, 400.0);
        assert!((half_in.visible_ratio(&viewport) - 0.5).abs() < 1e-6);
        assert_eq!(half_in.vertical_distance(&viewport), 0.0);
    }

    #[test]
    fn test_distance_above_and_below() {
        let viewport = Rect::new(0.0, 0.0, 400.0, 800.0);
        let below = Rect::new(0.0, 1000.0, 400.0, 300.0);
        let above = Rect::new(0.0, -700.0, 400.0, 300.0);
        assert_eq!(below.vertical_distance(&viewport), 200.0);
        assert_eq!(above.vertical_distance(&viewport), 400.0);
        assert_eq!(below.visible_ratio(&viewport), 0.0);
    }

    #[test]
    fn test_zero_area_rect() {
        let viewport = Rect::new(0.0, 0.0, 400.0, 800.0);
        let empty = Rect::new(0.0, 10.0, 0.0, 0.0);
        assert_eq!(empty.visible_ratio(&viewport), 0.0);
    }
}
