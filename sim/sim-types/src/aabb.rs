//! Axis-aligned bounding boxes and the simple volumes queried against them.

use nalgebra::{Isometry3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding box (AABB).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aabb {
    /// Minimum corner of the bounding box.
    pub min: Point3<f64>,
    /// Maximum corner of the bounding box.
    pub max: Point3<f64>,
}

impl Aabb {
    /// Create a new AABB from minimum and maximum corners.
    #[must_use]
    pub const fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// An inverted box that contains nothing and grows on the first
    /// [`Aabb::encapsulate`].
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(-f64::MAX, -f64::MAX, -f64::MAX),
        }
    }

    /// Create an AABB centered at a point with the given half-extents.
    #[must_use]
    pub fn from_center(center: Point3<f64>, half_extents: Vector3<f64>) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// True if `min <= max` on every axis.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Check if this AABB overlaps with another AABB.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Check if `other` lies entirely inside this box.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    /// Check if a point lies inside (or on the boundary of) this box.
    #[must_use]
    pub fn contains_point(&self, point: &Point3<f64>) -> bool {
        point.x >= self.min.x
            && point.y >= self.min.y
            && point.z >= self.min.z
            && point.x <= self.max.x
            && point.y <= self.max.y
            && point.z <= self.max.z
    }

    /// Grow this box to include `other`.
    pub fn encapsulate(&mut self, other: &Self) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    /// Union of two boxes.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Expand this AABB by a margin on all sides.
    #[must_use]
    pub fn expanded(&self, margin: f64) -> Self {
        let m = Vector3::new(margin, margin, margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        Point3::from((self.min.coords + self.max.coords) * 0.5)
    }

    /// Half extents of the box.
    #[must_use]
    pub fn half_extents(&self) -> Vector3<f64> {
        (self.max - self.min) * 0.5
    }

    /// Get the extent (size) along a specific axis.
    #[must_use]
    pub fn extent(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.max.x - self.min.x,
            Axis::Y => self.max.y - self.min.y,
            Axis::Z => self.max.z - self.min.z,
        }
    }

    /// The axis along which the box is widest.
    #[must_use]
    pub fn longest_axis(&self) -> Axis {
        let (x, y, z) = (
            self.extent(Axis::X),
            self.extent(Axis::Y),
            self.extent(Axis::Z),
        );
        if x >= y && x >= z {
            Axis::X
        } else if y >= z {
            Axis::Y
        } else {
            Axis::Z
        }
    }

    /// Surface area, used as a cheap quality metric.
    #[must_use]
    pub fn surface_area(&self) -> f64 {
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Squared distance from `point` to the closest point of the box.
    #[must_use]
    pub fn distance_squared_to_point(&self, point: &Point3<f64>) -> f64 {
        let closest = point.sup(&self.min).inf(&self.max);
        (point - closest).norm_squared()
    }

    /// Slab test for a ray `origin + fraction * direction`.
    ///
    /// Returns the fraction at which the ray enters the box, `0.0` if it starts
    /// inside, or `None` when it misses.
    #[must_use]
    pub fn ray_entry_fraction(
        &self,
        origin: &Point3<f64>,
        direction: &Vector3<f64>,
    ) -> Option<f64> {
        let mut t_min = f64::NEG_INFINITY;
        let mut t_max = f64::INFINITY;

        for i in 0..3 {
            let o = origin[i];
            let d = direction[i];
            if d.abs() < 1.0e-20 {
                if o < self.min[i] || o > self.max[i] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t1 = (self.min[i] - o) * inv;
            let mut t2 = (self.max[i] - o) * inv;
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
            }
            t_min = t_min.max(t1);
            t_max = t_max.min(t2);
            if t_min > t_max {
                return None;
            }
        }

        if t_max < 0.0 {
            None
        } else {
            Some(t_min.max(0.0))
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::new(Point3::origin(), Point3::origin())
    }
}

/// Coordinate axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// X-axis.
    X,
    /// Y-axis.
    Y,
    /// Z-axis.
    Z,
}

impl Axis {
    /// Get all three axes.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::X, Self::Y, Self::Z]
    }

    /// Component index of this axis.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }
}

/// A box with an arbitrary orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedBox {
    /// Transform from box space to world space.
    pub orientation: Isometry3<f64>,
    /// Half extents in box space.
    pub half_extents: Vector3<f64>,
}

impl OrientedBox {
    /// Create an oriented box.
    #[must_use]
    pub const fn new(orientation: Isometry3<f64>, half_extents: Vector3<f64>) -> Self {
        Self {
            orientation,
            half_extents,
        }
    }

    /// Separating axis test against an axis-aligned box (15 axes).
    #[must_use]
    pub fn overlaps(&self, aabb: &Aabb) -> bool {
        let rot = self.orientation.rotation.to_rotation_matrix();
        let r = rot.matrix();
        let a_center = aabb.center();
        let a_half = aabb.half_extents();
        let b_half = self.half_extents;
        let t = Vector3::from(self.orientation.translation.vector) - a_center.coords;

        // |R| with an epsilon so parallel edges do not produce a zero axis.
        let abs_r = r.map(|v| v.abs() + 1.0e-12);

        for i in 0..3 {
            let ra = a_half[i];
            let rb = b_half.dot(&abs_r.row(i).transpose());
            if t[i].abs() > ra + rb {
                return false;
            }
        }

        for j in 0..3 {
            let ra = a_half.dot(&abs_r.column(j));
            let rb = b_half[j];
            if t.dot(&r.column(j)).abs() > ra + rb {
                return false;
            }
        }

        for i in 0..3 {
            let i1 = (i + 1) % 3;
            let i2 = (i + 2) % 3;
            for j in 0..3 {
                let j1 = (j + 1) % 3;
                let j2 = (j + 2) % 3;
                let ra = a_half[i1] * abs_r[(i2, j)] + a_half[i2] * abs_r[(i1, j)];
                let rb = b_half[j1] * abs_r[(i, j2)] + b_half[j2] * abs_r[(i, j1)];
                let dist = (t[i2] * r[(i1, j)] - t[i1] * r[(i2, j)]).abs();
                if dist > ra + rb {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn unit_box() -> Aabb {
        Aabb::new(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn test_overlap_and_contain() {
        let a = unit_box();
        let b = Aabb::from_center(Point3::new(1.5, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
        let c = Aabb::from_center(Point3::new(5.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.contains(&Aabb::from_center(Point3::origin(), Vector3::new(0.5, 0.5, 0.5))));
        assert!(a.contains_point(&Point3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_invalid_encapsulate() {
        let mut bounds = Aabb::invalid();
        assert!(!bounds.is_valid());

        bounds.encapsulate(&unit_box());
        assert!(bounds.is_valid());
        assert_eq!(bounds, unit_box());
    }

    #[test]
    fn test_longest_axis() {
        let b = Aabb::new(Point3::origin(), Point3::new(1.0, 4.0, 2.0));
        assert_eq!(b.longest_axis(), Axis::Y);
        assert_relative_eq!(b.surface_area(), 2.0 * (4.0 + 8.0 + 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_ray_entry_fraction() {
        let b = unit_box();
        let hit = b.ray_entry_fraction(&Point3::new(-5.0, 0.0, 0.0), &Vector3::new(10.0, 0.0, 0.0));
        assert_relative_eq!(hit.unwrap(), 0.4, epsilon = 1e-12);

        let inside = b.ray_entry_fraction(&Point3::origin(), &Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(inside, Some(0.0));

        let miss =
            b.ray_entry_fraction(&Point3::new(-5.0, 3.0, 0.0), &Vector3::new(10.0, 0.0, 0.0));
        assert!(miss.is_none());

        let behind =
            b.ray_entry_fraction(&Point3::new(5.0, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0));
        assert!(behind.is_none());
    }

    #[test]
    fn test_point_distance() {
        let b = unit_box();
        assert_eq!(b.distance_squared_to_point(&Point3::origin()), 0.0);
        assert_relative_eq!(
            b.distance_squared_to_point(&Point3::new(3.0, 0.0, 0.0)),
            4.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_oriented_box_overlap() {
        let b = unit_box();
        let rotated = OrientedBox::new(
            Isometry3::from_parts(
                Vector3::new(2.2, 0.0, 0.0).into(),
                UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_4),
            ),
            Vector3::new(1.0, 1.0, 1.0),
        );
        // Corner of the rotated box reaches 2.2 - sqrt(2) ≈ 0.79 < 1.
        assert!(rotated.overlaps(&b));

        let far = OrientedBox::new(
            Isometry3::translation(2.6, 0.0, 0.0),
            Vector3::new(0.5, 0.5, 0.5),
        );
        assert!(!far.overlaps(&b));
    }
}
