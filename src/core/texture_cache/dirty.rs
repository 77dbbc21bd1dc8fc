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

//! Dirty region tracking
//!
//! A target's dirty area is kept as a list of pairwise disjoint rectangles
//! so that a region is written back at most once.

use crate::core::types::Rect;

/// Parts of `a` not covered by `b`, as at most four disjoint rectangles
pub fn subtract_rect(a: &Rect, b: &Rect) -> Vec<Rect> {
    let cut = a.intersect(b);
    if cut.is_empty() {
        return if a.is_empty() { Vec::new() } else { vec![*a] };
    }
    let pieces = [
        // Full-width bands above and below the cut
        Rect::new(a.left, a.top, a.right, cut.top),
        Rect::new(a.left, cut.bottom, a.right, a.bottom),
        // Left and right of the cut, within its rows
        Rect::new(a.left, cut.top, cut.left, cut.bottom),
        Rect::new(cut.right, cut.top, a.right, cut.bottom),
    ];
    pieces.into_iter().filter(|r| !r.is_empty()).collect()
}

/// Disjoint set of dirty rectangles in native target pixels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyRects {
    rects: Vec<Rect>,
}

impl DirtyRects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Add `rect`, keeping the set disjoint
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces.iter().flat_map(|p| subtract_rect(p, existing)).collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Remove `rect` from the set
    pub fn subtract(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        self.rects = self.rects.iter().flat_map(|r| subtract_rect(r, rect)).collect();
    }

    /// Dirty pieces clipped to `area`
    pub fn within(&self, area: &Rect) -> Vec<Rect> {
        self.rects
            .iter()
            .map(|r| r.intersect(area))
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Smallest rectangle covering every dirty piece
    pub fn bounding(&self) -> Rect {
        self.rects.iter().fold(Rect::default(), |acc, r| acc.union(r))
    }

    /// Dirty pixel count
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| r.width() as i64 * r.height() as i64)
            .sum()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract_center_leaves_four_pieces() {
        let pieces = subtract_rect(&Rect::new(0, 0, 10, 10), &Rect::new(2, 2, 8, 8));
        assert_eq!(pieces.len(), 4);
        let area: i32 = pieces.iter().map(|r| r.width() * r.height()).sum();
        assert_eq!(area, 100 - 36);
        for (i, a) in pieces.iter().enumerate() {
            for b in &pieces[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_subtract_disjoint_and_covering() {
        let a = Rect::new(0, 0, 4, 4);
        assert_eq!(subtract_rect(&a, &Rect::new(8, 8, 9, 9)), vec![a]);
        assert!(subtract_rect(&a, &Rect::new(-1, -1, 5, 5)).is_empty());
    }

    #[test]
    fn test_overlapping_adds_stay_disjoint() {
        let mut dirty = DirtyRects::new();
        dirty.add(Rect::new(0, 0, 16, 16));
        dirty.add(Rect::new(8, 8, 24, 24));
        dirty.add(Rect::new(2, 2, 4, 4));
        assert_eq!(dirty.area(), 256 + 256 - 64);
        assert_eq!(dirty.bounding(), Rect::new(0, 0, 24, 24));
        let rects = dirty.rects();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_subtract_clears_region() {
        let mut dirty = DirtyRects::new();
        dirty.add(Rect::new(0, 0, 32, 32));
        dirty.subtract(&Rect::new(0, 0, 32, 16));
        assert_eq!(dirty.bounding(), Rect::new(0, 16, 32, 32));
        assert_eq!(dirty.within(&Rect::new(0, 0, 8, 20)), vec![Rect::new(0, 16, 8, 20)]);
        dirty.subtract(&Rect::new(0, 0, 64, 64));
        assert!(dirty.is_empty());
    }
}
