use core::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use serde::{Deserialize, Serialize};




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}




/**
 * A 3D vector of double precision components
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}




// ============================================================================
impl Vec3 {

    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn splat(v: f64) -> Self {
        Self::new(v, v, v)
    }

    pub fn unit(axis: Axis) -> Self {
        let mut v = Self::ZERO;
        v.set(axis, 1.0);
        v
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    pub fn dot(&self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn norm(&self) -> f64 {
        self.dot(*self).sqrt()
    }

    /**
     * Return this vector scaled to unit length, or the zero vector if it has
     * zero length.
     */
    pub fn normalize(&self) -> Vec3 {
        let n = self.norm();
        if n > 0.0 {
            *self / n
        } else {
            Vec3::ZERO
        }
    }

    pub fn component_mul(&self, other: Vec3) -> Vec3 {
        Vec3::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    pub fn min(&self, other: Vec3) -> Vec3 {
        Vec3::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    pub fn max(&self, other: Vec3) -> Vec3 {
        Vec3::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, s: f64) -> Vec3 {
        Vec3::new(self.x / s, self.y / s, self.z / s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, o: Vec3) {
        *self = *self + o
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, o: Vec3) {
        *self = *self - o
    }
}




/**
 * An axis-aligned box. Containment is half-open, `[lower, upper)`, so that
 * boxes which share a face never both contain a point on that face.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Vec3,
    pub upper: Vec3,
}




// ============================================================================
impl Bounds {

    pub fn new(lower: Vec3, upper: Vec3) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        Axis::ALL
            .iter()
            .all(|&a| self.lower.get(a) <= p.get(a) && p.get(a) < self.upper.get(a))
    }

    /**
     * Like `contains`, but the upper faces are closed. Used for the outermost
     * boxes of a domain, where there is no neighbor to claim the face.
     */
    pub fn contains_closed(&self, p: Vec3) -> bool {
        Axis::ALL
            .iter()
            .all(|&a| self.lower.get(a) <= p.get(a) && p.get(a) <= self.upper.get(a))
    }

    pub fn extent(&self) -> Vec3 {
        self.upper - self.lower
    }

    pub fn center(&self) -> Vec3 {
        (self.lower + self.upper) * 0.5
    }

    pub fn volume(&self) -> f64 {
        let e = self.extent();
        e.x.max(0.0) * e.y.max(0.0) * e.z.max(0.0)
    }

    /**
     * Expand this box by the given distance on every face.
     */
    pub fn extend_all(&self, delta: f64) -> Self {
        Self::new(self.lower - Vec3::splat(delta), self.upper + Vec3::splat(delta))
    }

    /**
     * Return the volume shared with another box (zero if they only touch).
     */
    pub fn overlap_volume(&self, other: &Bounds) -> f64 {
        Bounds::new(self.lower.max(other.lower), self.upper.min(other.upper)).volume()
    }
}




/**
 * The body frame of a rigid particle: three orthonormal direction vectors in
 * the global frame, one for each of the particle's principal axes.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub axes: [Vec3; 3],
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            axes: [Vec3::unit(Axis::X), Vec3::unit(Axis::Y), Vec3::unit(Axis::Z)],
        }
    }
}




// ============================================================================
impl Orientation {

    /**
     * Transform a vector given in the body frame into the global frame.
     */
    pub fn local_to_global(&self, v: Vec3) -> Vec3 {
        self.axes[0] * v.x + self.axes[1] * v.y + self.axes[2] * v.z
    }

    /**
     * Transform a vector given in the global frame into the body frame.
     */
    pub fn global_to_local(&self, v: Vec3) -> Vec3 {
        Vec3::new(self.axes[0].dot(v), self.axes[1].dot(v), self.axes[2].dot(v))
    }

    /**
     * Rotate the frame by the rotation vector `theta` (axis times angle),
     * then re-orthonormalize to keep round-off from accumulating.
     */
    pub fn rotate(&self, theta: Vec3) -> Self {
        let angle = theta.norm();
        if angle == 0.0 {
            return *self;
        }
        let k = theta / angle;
        let (s, c) = angle.sin_cos();
        let rodrigues = |v: Vec3| v * c + k.cross(v) * s + k * (k.dot(v) * (1.0 - c));

        let a = rodrigues(self.axes[0]).normalize();
        let b = rodrigues(self.axes[1]);
        let b = (b - a * a.dot(b)).normalize();
        let c = a.cross(b);
        Self { axes: [a, b, c] }
    }
}




/**
 * An ellipsoid described by its three semi-axis lengths, measured along the
 * body axes of the particle that carries it.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}




// ============================================================================
impl Ellipsoid {

    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    pub fn sphere(r: f64) -> Self {
        Self::new(r, r, r)
    }

    pub fn max_radius(&self) -> f64 {
        self.a.max(self.b).max(self.c)
    }

    pub fn min_radius(&self) -> f64 {
        self.a.min(self.b).min(self.c)
    }

    pub fn volume(&self) -> f64 {
        4.0 / 3.0 * std::f64::consts::PI * self.a * self.b * self.c
    }

    /**
     * Principal moments of inertia for a solid ellipsoid of the given mass.
     */
    pub fn principal_inertia(&self, mass: f64) -> Vec3 {
        let (a2, b2, c2) = (self.a * self.a, self.b * self.b, self.c * self.c);
        Vec3::new(b2 + c2, a2 + c2, a2 + b2) * (mass / 5.0)
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.a * factor, self.b * factor, self.c * factor)
    }

    /**
     * Distance from the center to the surface along the unit direction `d`,
     * which is given in the body frame.
     */
    pub fn radial_distance(&self, d: Vec3) -> f64 {
        let q = (d.x / self.a).powi(2) + (d.y / self.b).powi(2) + (d.z / self.c).powi(2);
        1.0 / q.sqrt()
    }

    /**
     * Support function: the largest projection of any surface point onto the
     * unit direction `d` (body frame).
     */
    pub fn support_distance(&self, d: Vec3) -> f64 {
        ((self.a * d.x).powi(2) + (self.b * d.y).powi(2) + (self.c * d.z).powi(2)).sqrt()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn half_open_bounds_do_not_share_a_face() {
        let left = Bounds::new(Vec3::ZERO, Vec3::new(0.5, 1.0, 1.0));
        let right = Bounds::new(Vec3::new(0.5, 0.0, 0.0), Vec3::splat(1.0));
        let p = Vec3::new(0.5, 0.5, 0.5);
        assert!(!left.contains(p));
        assert!(right.contains(p));
        assert_eq!(left.overlap_volume(&right), 0.0);
    }

    #[test]
    fn local_global_transforms_are_inverse() {
        let frame = Orientation::default().rotate(Vec3::new(0.3, -0.2, 0.9));
        let v = Vec3::new(1.0, 2.0, 3.0);
        let w = frame.global_to_local(frame.local_to_global(v));
        assert_relative_eq!(w.x, v.x, epsilon = 1e-12);
        assert_relative_eq!(w.y, v.y, epsilon = 1e-12);
        assert_relative_eq!(w.z, v.z, epsilon = 1e-12);
    }

    #[test]
    fn rotation_keeps_frame_orthonormal() {
        let frame = Orientation::default().rotate(Vec3::new(1.0, 1.0, 0.0));
        for i in 0..3 {
            assert_relative_eq!(frame.axes[i].norm(), 1.0, epsilon = 1e-12);
            for j in 0..i {
                assert_relative_eq!(frame.axes[i].dot(frame.axes[j]), 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn ellipsoid_distances_match_semi_axes() {
        let e = Ellipsoid::new(3.0, 2.0, 1.0);
        assert_relative_eq!(e.radial_distance(Vec3::unit(Axis::X)), 3.0);
        assert_relative_eq!(e.radial_distance(Vec3::unit(Axis::Z)), 1.0);
        assert_relative_eq!(e.support_distance(Vec3::unit(Axis::Y)), 2.0);
    }
}
