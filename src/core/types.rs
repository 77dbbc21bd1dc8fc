// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Geometry and color primitives shared by every renderer component
//!
//! Rectangles are half-open: `left..right` by `top..bottom`, in pixels.

use serde::{Deserialize, Serialize};

/// Integer rectangle (half-open)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle anchored at the origin
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// Whether `other` lies entirely inside `self`
    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Overlap of two rectangles (empty if disjoint)
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Smallest rectangle covering both inputs
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::new(
            self.left.min(other.left),
            self.top.min(other.top),
            self.right.max(other.right),
            self.bottom.max(other.bottom),
        )
    }

    /// Multiply every edge by an integer scale factor
    pub fn scale(&self, factor: u32) -> Rect {
        let f = factor as i32;
        Rect::new(self.left * f, self.top * f, self.right * f, self.bottom * f)
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    pub fn to_f(&self) -> RectF {
        RectF::new(
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        )
    }
}

/// Floating point rectangle, used for texture coordinates and stretch targets
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Normalized `0..1` rectangle covering a whole texture
    pub const fn unit() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Divide by a texture size, producing normalized coordinates
    pub fn normalize(&self, width: u32, height: u32) -> RectF {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        RectF::new(self.left / w, self.top / h, self.right / w, self.bottom / h)
    }

    /// Round outwards to the enclosing integer rectangle
    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.left.floor() as i32,
            self.top.floor() as i32,
            self.right.ceil() as i32,
            self.bottom.ceil() as i32,
        )
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Normalized RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Decode a packed `0xAABBGGRR` value
    pub fn from_rgba8(packed: u32) -> Self {
        let ch = |shift: u32| ((packed >> shift) & 0xFF) as f32 / 255.0;
        Self::new(ch(0), ch(8), ch(16), ch(24))
    }

    /// Encode as `0xAABBGGRR`, rounding each channel to 8 bits
    pub fn to_rgba8(&self) -> u32 {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
        q(self.r) | (q(self.g) << 8) | (q(self.b) << 16) | (q(self.a) << 24)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_containment() {
        let area = Rect::new(0, 0, 64, 64);
        assert!(area.contains(&Rect::new(0, 0, 64, 64)));
        assert!(area.contains(&Rect::new(8, 8, 16, 16)));
        assert!(!area.contains(&Rect::new(-1, 0, 16, 16)));
        assert!(!area.contains(&Rect::new(0, 0, 65, 16)));
    }

    #[test]
    fn test_rect_intersect_and_union() {
        let a = Rect::new(0, 0, 32, 32);
        let b = Rect::new(16, 16, 48, 48);
        assert_eq!(a.intersect(&b), Rect::new(16, 16, 32, 32));
        assert_eq!(a.union(&b), Rect::new(0, 0, 48, 48));
        assert!(!a.intersects(&Rect::new(32, 0, 40, 8)));
        assert_eq!(Rect::default().union(&a), a);
    }

    #[test]
    fn test_color_packing() {
        let c = Color::from_rgba8(0x80FF_0010);
        assert_eq!(c.to_rgba8(), 0x80FF_0010);
        assert_eq!(Color::BLACK.to_rgba8(), 0xFF00_0000);
    }
}
