// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Pixel geometry shared by the tracker and the line-crossing counter:
//! bounding boxes, IoU, centroids, and the CCW orientation test used to
//! decide whether two segments strictly intersect.

use base::{err, Error};

/// An axis-aligned bounding box in pixel coordinates, `x1 < x2` and `y1 < y2`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Self, Error> {
        if x1 >= x2 || y1 >= y2 {
            return Err(err!(
                InvalidInput,
                "bbox ({x1},{y1})-({x2},{y2}) is not well-formed (need x1<x2, y1<y2)"
            ));
        }
        Ok(BBox { x1, y1, x2, y2 })
    }

    pub fn area(&self) -> i64 {
        i64::from(self.x2 - self.x1) * i64::from(self.y2 - self.y1)
    }

    /// Intersection-over-union of `self` and `other`, in `[0, 1]`.
    pub fn iou(&self, other: &BBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix1 >= ix2 || iy1 >= iy2 {
            return 0.0;
        }
        let inter = i64::from(ix2 - ix1) * i64::from(iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    /// The centroid of the box, used as the tracked point for line crossing.
    pub fn center(&self) -> Point {
        Point {
            x: f64::from(self.x1 + self.x2) / 2.0,
            y: f64::from(self.y1 + self.y2) / 2.0,
        }
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn sub(self, other: Point) -> Point {
        Point {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn dot(self, other: Point) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Rotates the vector 90 degrees; used to get a line's normal.
    pub fn rot90(self) -> Point {
        Point {
            x: -self.y,
            y: self.x,
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Standard CCW orientation test: positive if `a,b,c` turn counterclockwise,
/// negative if clockwise, zero if colinear.
pub fn ccw(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Returns true iff segment `p1->p2` strictly intersects segment `q1->q2`.
/// Colinear and touching-at-an-endpoint configurations are not an
/// intersection, matching the spec's "strict intersection" crossing test.
pub fn segments_strictly_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = ccw(q1, q2, p1);
    let d2 = ccw(q1, q2, p2);
    let d3 = ccw(p1, p2, q1);
    let d4 = ccw(p1, p2, q2);
    d1 * d2 < 0.0 && d3 * d4 < 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_rejects_degenerate_coords() {
        assert!(BBox::new(5, 5, 5, 10).is_err());
        assert!(BBox::new(0, 0, 10, 10).is_ok());
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(0, 0, 10, 10).unwrap();
        assert!((b.iou(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0, 0, 10, 10).unwrap();
        let b = BBox::new(100, 100, 110, 110).unwrap();
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BBox::new(0, 0, 10, 10).unwrap();
        let b = BBox::new(5, 0, 15, 10).unwrap();
        // intersection 5x10=50, union 100+100-50=150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-9);
    }

    #[test]
    fn crossing_segments_intersect() {
        let p1 = Point { x: 0.0, y: 5.0 };
        let p2 = Point { x: 10.0, y: 5.0 };
        let l1 = Point { x: 5.0, y: 0.0 };
        let l2 = Point { x: 5.0, y: 10.0 };
        assert!(segments_strictly_intersect(p1, p2, l1, l2));
    }

    #[test]
    fn tangent_segment_does_not_intersect() {
        // p2 lands exactly on the line; this is not a strict crossing.
        let p1 = Point { x: 0.0, y: 5.0 };
        let p2 = Point { x: 5.0, y: 5.0 };
        let l1 = Point { x: 5.0, y: 0.0 };
        let l2 = Point { x: 5.0, y: 10.0 };
        assert!(!segments_strictly_intersect(p1, p2, l1, l2));
    }

    #[test]
    fn parallel_segments_do_not_intersect() {
        let p1 = Point { x: 0.0, y: 0.0 };
        let p2 = Point { x: 10.0, y: 0.0 };
        let l1 = Point { x: 0.0, y: 5.0 };
        let l2 = Point { x: 10.0, y: 5.0 };
        assert!(!segments_strictly_intersect(p1, p2, l1, l2));
    }
}
