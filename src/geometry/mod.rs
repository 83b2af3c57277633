//!Integer 2D geometry primitives shared by the planner: micrometer points,
//!rings, regions and the clipping operations defined on them.

mod extrusion;
mod grid;
mod point;
mod polygon;
pub mod polygon_operations;

pub use extrusion::{ExtrusionJunction, ExtrusionLine};
pub use grid::SparsePointGrid;
pub use point::{from_mm, to_mm, Coord, Point, Point3, RotationMatrix};
pub use polygon::{Aabb, BorderRelation, Polygon, Polyline, Shape};
pub use polygon_operations::PolygonOperations;

///Angle at `b` between the incoming direction a->b and outgoing b->c,
///measured counter-clockwise on the left side, in radians within [0, 2π).
pub fn angle_left(a: Point, b: Point, c: Point) -> f64 {
    let incoming = (b - a).as_dvec2();
    let outgoing = (c - b).as_dvec2();
    let angle = std::f64::consts::PI - incoming.angle_to(outgoing);
    if angle < 0.0 {
        angle + 2.0 * std::f64::consts::PI
    } else {
        angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_has_pi_angle() {
        let angle = angle_left(Point::new(0, 0), Point::new(1_000, 0), Point::new(2_000, 0));
        assert!((angle - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn left_turn_is_less_than_pi() {
        // Left (counter-clockwise) turn: the left-side angle shrinks.
        let angle = angle_left(Point::new(0, 0), Point::new(1_000, 0), Point::new(1_000, 1_000));
        assert!(angle < std::f64::consts::PI);
    }
}
