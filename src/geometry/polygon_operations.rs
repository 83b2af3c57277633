use geo::{Coord as GeoCoord, LineString, MultiPolygon, Polygon as GeoPolygon};
use geo_clipper::{Clipper, EndType, JoinType};

use super::point::{Coord, Point};
use super::polygon::{Polygon, Shape};

///Boolean set operations and offsetting on integer regions.
///
///The heavy lifting is done by the Clipper bindings, which scale to integers
///internally. Micrometer coordinates are passed through as `f64` with a unit
///scale factor, so every value the clipper sees is an exact integer and the
///results are deterministic regardless of operand order.
pub trait PolygonOperations {
    fn union_with(&self, other: &Shape) -> Shape;
    fn difference_with(&self, other: &Shape) -> Shape;
    fn intersection_with(&self, other: &Shape) -> Shape;

    ///Positive deltas grow the region, negative deltas shrink it.
    fn offset_from(&self, delta: Coord) -> Shape;

    ///Union of the region with itself; resolves self-intersections and
    ///normalizes ring orientations.
    fn unioned(&self) -> Shape;
}

const CLIPPER_SCALE: f64 = 1.0;
const MITER_LIMIT: f64 = 1.2;

impl PolygonOperations for Shape {
    fn union_with(&self, other: &Shape) -> Shape {
        if self.is_empty() {
            return other.unioned();
        }
        if other.is_empty() {
            return self.unioned();
        }
        from_geo(shape_to_geo(self).union(&shape_to_geo(other), CLIPPER_SCALE))
    }

    fn difference_with(&self, other: &Shape) -> Shape {
        if self.is_empty() || other.is_empty() {
            return self.clone();
        }
        from_geo(shape_to_geo(self).difference(&shape_to_geo(other), CLIPPER_SCALE))
    }

    fn intersection_with(&self, other: &Shape) -> Shape {
        if self.is_empty() || other.is_empty() {
            return Shape::default();
        }
        from_geo(shape_to_geo(self).intersection(&shape_to_geo(other), CLIPPER_SCALE))
    }

    fn offset_from(&self, delta: Coord) -> Shape {
        if self.is_empty() || delta == 0 {
            return self.clone();
        }
        from_geo(shape_to_geo(self).offset(
            delta as f64,
            JoinType::Miter(MITER_LIMIT),
            EndType::ClosedPolygon,
            CLIPPER_SCALE,
        ))
    }

    fn unioned(&self) -> Shape {
        if self.is_empty() {
            return Shape::default();
        }
        let empty = MultiPolygon::<f64>(vec![]);
        from_geo(shape_to_geo(self).union(&empty, CLIPPER_SCALE))
    }
}

///Build a structured multi-polygon from a flat ring set. Holes (clockwise
///rings) are attached to the smallest counter-clockwise ring that contains
///their first vertex; orphaned holes are dropped.
fn shape_to_geo(shape: &Shape) -> MultiPolygon<f64> {
    let mut rings: Vec<&Polygon> = shape.iter().filter(|p| p.len() >= 3).collect();
    rings.sort_by_key(|p| std::cmp::Reverse(p.signed_area2().abs()));

    let mut outers: Vec<(GeoPolygon<f64>, &Polygon)> = vec![];
    for ring in rings {
        if ring.is_ccw() {
            outers.push((GeoPolygon::new(ring_to_linestring(ring), vec![]), ring));
        } else {
            let first = ring.points()[0];
            if let Some((outer, _)) = outers
                .iter_mut()
                .rev()
                .find(|(_, owner)| owner.inside(first, true))
            {
                outer.interiors_push(ring_to_linestring(ring));
            } else {
                log::debug!("dropping hole ring that is not contained in any contour");
            }
        }
    }

    MultiPolygon(outers.into_iter().map(|(poly, _)| poly).collect())
}

fn ring_to_linestring(ring: &Polygon) -> LineString<f64> {
    LineString::from_iter(ring.iter().map(|p| GeoCoord {
        x: p.x as f64,
        y: p.y as f64,
    }))
}

fn from_geo(multi: MultiPolygon<f64>) -> Shape {
    let mut shape = Shape::default();
    for polygon in multi {
        push_ring(&mut shape, polygon.exterior(), true);
        for interior in polygon.interiors() {
            push_ring(&mut shape, interior, false);
        }
    }
    shape
}

fn push_ring(shape: &mut Shape, ring: &LineString<f64>, outer: bool) {
    let mut points: Vec<Point> = ring
        .coords()
        .map(|c| Point::new(c.x.round() as Coord, c.y.round() as Coord))
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() < 3 {
        return;
    }
    let mut polygon = Polygon::new(points);
    if polygon.is_ccw() != outer {
        polygon.reverse();
    }
    shape.push(polygon);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(origin: Point, size: Coord) -> Polygon {
        Polygon::new(vec![
            origin,
            origin + Point::new(size, 0),
            origin + Point::new(size, size),
            origin + Point::new(0, size),
        ])
    }

    #[test]
    fn union_merges_overlapping_squares() {
        let a = Shape::from_polygon(square(Point::new(0, 0), 10_000));
        let b = Shape::from_polygon(square(Point::new(5_000, 0), 10_000));
        let merged = a.union_with(&b);
        assert_eq!(merged.len(), 1);
        let area: f64 = merged.iter().map(Polygon::area_mm2).sum();
        assert!((area - 150.0).abs() < 0.5);
    }

    #[test]
    fn difference_carves_hole() {
        let outer = Shape::from_polygon(square(Point::new(0, 0), 10_000));
        let inner = Shape::from_polygon(square(Point::new(3_000, 3_000), 4_000));
        let carved = outer.difference_with(&inner);
        assert_eq!(carved.len(), 2);
        assert!(!carved.inside(Point::new(5_000, 5_000), false));
        assert!(carved.inside(Point::new(1_000, 1_000), false));
    }

    #[test]
    fn inset_shrinks_square() {
        let shape = Shape::from_polygon(square(Point::new(0, 0), 10_000));
        let inset = shape.offset_from(-1_000);
        assert_eq!(inset.len(), 1);
        let area: f64 = inset.iter().map(Polygon::area_mm2).sum();
        assert!((area - 64.0).abs() < 0.5);
    }

    #[test]
    fn union_is_operand_order_independent() {
        let a = Shape::from_polygon(square(Point::new(0, 0), 10_000));
        let b = Shape::from_polygon(square(Point::new(2_000, 2_000), 10_000));
        let ab = a.union_with(&b);
        let ba = b.union_with(&a);
        let area_ab: f64 = ab.iter().map(Polygon::area_mm2).sum();
        let area_ba: f64 = ba.iter().map(Polygon::area_mm2).sum();
        assert!((area_ab - area_ba).abs() < 1e-6);
    }
}
