use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use glam::DVec2;
use serde::{Deserialize, Serialize};

///Coordinate in micrometers. All planning geometry is integer so that set
///operations stay deterministic regardless of evaluation order.
pub type Coord = i64;

///Convert millimeters to micrometer coordinates.
pub fn from_mm(v: f64) -> Coord {
    (v * 1000.0).round() as Coord
}

///Convert micrometer coordinates to millimeters.
pub fn to_mm(v: Coord) -> f64 {
    v as f64 / 1000.0
}

///A 2D point with 64-bit micrometer coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: Coord,
    pub y: Coord,
}

impl Point {
    pub const fn new(x: Coord, y: Coord) -> Self {
        Point { x, y }
    }

    ///Squared length of the vector from the origin.
    pub fn vsize2(self) -> i64 {
        self.x * self.x + self.y * self.y
    }

    ///Length of the vector from the origin, rounded to the nearest micron.
    pub fn vsize(self) -> i64 {
        (self.vsize2() as f64).sqrt().round() as i64
    }

    ///Length of the vector in millimeters.
    pub fn vsize_mm(self) -> f64 {
        (self.vsize2() as f64).sqrt() / 1000.0
    }

    pub fn dot(self, other: Point) -> i64 {
        self.x * other.x + self.y * other.y
    }

    ///Z component of the 3D cross product; twice the signed area of the
    ///triangle spanned with the origin.
    pub fn cross(self, other: Point) -> i64 {
        self.x * other.y - self.y * other.x
    }

    ///Rotate a quarter turn counter-clockwise.
    pub fn turned_ccw(self) -> Point {
        Point::new(-self.y, self.x)
    }

    ///Scale the vector to the requested length. A zero vector stays zero.
    pub fn with_length(self, len: Coord) -> Point {
        let size = self.vsize();
        if size == 0 {
            return self;
        }
        Point::new(self.x * len / size, self.y * len / size)
    }

    pub fn as_dvec2(self) -> DVec2 {
        DVec2::new(self.x as f64, self.y as f64)
    }

    pub fn from_dvec2(v: DVec2) -> Point {
        Point::new(v.x.round() as Coord, v.y.round() as Coord)
    }

    ///Point on the segment self..other at parameter `t` in [0, 1].
    pub fn lerp(self, other: Point, t: f64) -> Point {
        Point::from_dvec2(self.as_dvec2() + (other.as_dvec2() - self.as_dvec2()) * t)
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<i64> for Point {
    type Output = Point;
    fn mul(self, rhs: i64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<i64> for Point {
    type Output = Point;
    fn div(self, rhs: i64) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl SubAssign for Point {
    fn sub_assign(&mut self, rhs: Point) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

///A 3D point; `z` is an absolute height or an offset depending on context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct Point3 {
    pub x: Coord,
    pub y: Coord,
    pub z: Coord,
}

impl Point3 {
    pub const fn new(x: Coord, y: Coord, z: Coord) -> Self {
        Point3 { x, y, z }
    }

    pub fn from_xy(p: Point) -> Self {
        Point3::new(p.x, p.y, 0)
    }

    pub fn xy(self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn vsize(self) -> i64 {
        ((self.x * self.x + self.y * self.y + self.z * self.z) as f64)
            .sqrt()
            .round() as i64
    }
}

impl Add for Point3 {
    type Output = Point3;
    fn add(self, rhs: Point3) -> Point3 {
        Point3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point3 {
    type Output = Point3;
    fn sub(self, rhs: Point3) -> Point3 {
        Point3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

///Rotation that maps an arbitrary direction onto the positive X axis.
///Used by the combing walk to reason about crossings in a single scanline.
#[derive(Clone, Copy, Debug)]
pub struct RotationMatrix {
    cos: f64,
    sin: f64,
}

impl RotationMatrix {
    pub fn aligning(direction: Point) -> Self {
        let len = (direction.vsize2() as f64).sqrt();
        if len == 0.0 {
            return RotationMatrix { cos: 1.0, sin: 0.0 };
        }
        RotationMatrix {
            cos: direction.x as f64 / len,
            sin: direction.y as f64 / len,
        }
    }

    pub fn apply(&self, p: Point) -> Point {
        let x = p.x as f64 * self.cos + p.y as f64 * self.sin;
        let y = p.y as f64 * self.cos - p.x as f64 * self.sin;
        Point::new(x.round() as Coord, y.round() as Coord)
    }

    pub fn unapply(&self, p: Point) -> Point {
        let x = p.x as f64 * self.cos - p.y as f64 * self.sin;
        let y = p.y as f64 * self.cos + p.x as f64 * self.sin;
        Point::new(x.round() as Coord, y.round() as Coord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_aligns_direction_with_x() {
        let dir = Point::new(3000, 4000);
        let matrix = RotationMatrix::aligning(dir);
        let rotated = matrix.apply(dir);
        assert_eq!(rotated.y, 0);
        assert_eq!(rotated.x, 5000);
    }

    #[test]
    fn rotation_round_trips() {
        let matrix = RotationMatrix::aligning(Point::new(-200, 700));
        let p = Point::new(12345, -6789);
        let back = matrix.unapply(matrix.apply(p));
        assert!((back - p).vsize() <= 2);
    }

    #[test]
    fn with_length_scales() {
        let p = Point::new(300, 400);
        assert_eq!(p.with_length(1000), Point::new(600, 800));
    }
}
