use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::point::{Coord, Point};

///Where a point lies relative to a polygon boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorderRelation {
    Inside,
    OnBorder,
    Outside,
}

///A closed ring of points. The edge from the last point back to the first is
///implicit. Outer contours are counter-clockwise, holes are clockwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Polygon { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    pub fn push(&mut self, p: Point) {
        self.points.push(p);
    }

    ///Vertex lookup with wrap-around indexing.
    pub fn at(&self, idx: usize) -> Point {
        self.points[idx % self.points.len()]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    ///Twice the signed area in µm². Positive for counter-clockwise rings.
    pub fn signed_area2(&self) -> i128 {
        self.points
            .iter()
            .circular_tuple_windows::<(_, _)>()
            .map(|(p, q)| (p.x as i128) * (q.y as i128) - (q.x as i128) * (p.y as i128))
            .sum()
    }

    ///Signed area in mm².
    pub fn area_mm2(&self) -> f64 {
        self.signed_area2() as f64 / 2.0 / 1_000_000.0
    }

    pub fn is_ccw(&self) -> bool {
        self.signed_area2() > 0
    }

    ///Perimeter length in µm, including the closing edge.
    pub fn length(&self) -> Coord {
        if self.points.len() < 2 {
            return 0;
        }
        self.points
            .iter()
            .circular_tuple_windows::<(_, _)>()
            .map(|(p, q)| (*q - *p).vsize())
            .sum()
    }

    pub fn centroid_approx(&self) -> Point {
        if self.points.is_empty() {
            return Point::default();
        }
        let mut x = 0i128;
        let mut y = 0i128;
        for p in &self.points {
            x += p.x as i128;
            y += p.y as i128;
        }
        let n = self.points.len() as i128;
        Point::new((x / n) as Coord, (y / n) as Coord)
    }

    pub fn locate(&self, p: Point) -> BorderRelation {
        let mut inside = false;
        for (i, &a) in self.points.iter().enumerate() {
            let b = self.at(i + 1);
            if on_segment(p, a, b) {
                return BorderRelation::OnBorder;
            }
            if (a.y > p.y) != (b.y > p.y) {
                // Exact crossing x of the edge with the horizontal ray through p.
                let x_num = (a.x as i128) * ((b.y - p.y) as i128)
                    + (b.x as i128) * ((p.y - a.y) as i128);
                let denom = (b.y - a.y) as i128;
                let lhs = x_num * denom.signum();
                let rhs = (p.x as i128) * denom.abs();
                if lhs > rhs {
                    inside = !inside;
                }
            }
        }
        if inside {
            BorderRelation::Inside
        } else {
            BorderRelation::Outside
        }
    }

    ///Point-in-polygon test; `border_counts` decides the on-border policy.
    pub fn inside(&self, p: Point, border_counts: bool) -> bool {
        match self.locate(p) {
            BorderRelation::Inside => true,
            BorderRelation::OnBorder => border_counts,
            BorderRelation::Outside => false,
        }
    }

    ///Convert the ring to an open polyline by repeating the first point.
    pub fn to_polyline(&self) -> Polyline {
        let mut points = self.points.clone();
        if let Some(&first) = points.first() {
            points.push(first);
        }
        Polyline::new(points)
    }
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let ab = b - a;
    let ap = p - a;
    if (ab.x as i128) * (ap.y as i128) != (ab.y as i128) * (ap.x as i128) {
        return false;
    }
    let dot = ab.dot(ap);
    dot >= 0 && dot <= ab.vsize2()
}

///An open sequence of points.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<Point>,
}

impl Polyline {
    pub fn new(points: Vec<Point>) -> Self {
        Polyline { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn push(&mut self, p: Point) {
        self.points.push(p);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn front(&self) -> Option<Point> {
        self.points.first().copied()
    }

    pub fn back(&self) -> Option<Point> {
        self.points.last().copied()
    }

    ///Total length in µm, endpoints open.
    pub fn length(&self) -> Coord {
        self.points
            .windows(2)
            .map(|w| (w[1] - w[0]).vsize())
            .sum()
    }

    ///Close the polyline into a polygon, dropping a duplicated endpoint.
    pub fn to_polygon(&self) -> Polygon {
        let mut points = self.points.clone();
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        Polygon::new(points)
    }
}

///Integer axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point,
    pub max: Point,
}

impl Default for Aabb {
    fn default() -> Self {
        Aabb {
            min: Point::new(i64::MAX, i64::MAX),
            max: Point::new(i64::MIN, i64::MIN),
        }
    }
}

impl Aabb {
    pub fn include(&mut self, p: Point) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    pub fn is_initialized(&self) -> bool {
        self.min.x <= self.max.x
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

///A region of the plane: a flat set of rings where orientation carries hole
///semantics. Point membership is even-odd over all rings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    polygons: Vec<Polygon>,
}

impl Shape {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Shape { polygons }
    }

    pub fn from_polygon(polygon: Polygon) -> Self {
        Shape {
            polygons: vec![polygon],
        }
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn polygons_mut(&mut self) -> &mut Vec<Polygon> {
        &mut self.polygons
    }

    pub fn push(&mut self, polygon: Polygon) {
        self.polygons.push(polygon);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Polygon> {
        self.polygons.iter()
    }

    pub fn total_length(&self) -> Coord {
        self.polygons.iter().map(Polygon::length).sum()
    }

    pub fn bounding_box(&self) -> Aabb {
        let mut aabb = Aabb::default();
        for polygon in &self.polygons {
            for &p in polygon.iter() {
                aabb.include(p);
            }
        }
        aabb
    }

    pub fn inside(&self, p: Point, border_counts: bool) -> bool {
        let mut crossings = 0;
        for polygon in &self.polygons {
            match polygon.locate(p) {
                BorderRelation::OnBorder => return border_counts,
                BorderRelation::Inside => crossings += 1,
                BorderRelation::Outside => {}
            }
        }
        crossings % 2 == 1
    }

    ///Whether the open segment p0..p1 properly crosses any ring edge.
    pub fn collides_with_segment(&self, p0: Point, p1: Point) -> bool {
        for polygon in &self.polygons {
            for (i, &a) in polygon.iter().enumerate() {
                let b = polygon.at(i + 1);
                if segments_cross(p0, p1, a, b) {
                    return true;
                }
            }
        }
        false
    }

    ///Split the segment p0..p1 against the region and return the parts that
    ///lie inside, ordered from p0 to p1.
    pub fn cut_segment(&self, p0: Point, p1: Point) -> Vec<(Point, Point)> {
        let mut params = vec![0.0, 1.0];
        for polygon in &self.polygons {
            for (i, &a) in polygon.iter().enumerate() {
                let b = polygon.at(i + 1);
                if let Some(t) = crossing_parameter(p0, p1, a, b) {
                    params.push(t);
                }
            }
        }
        params.sort_by(|a, b| a.partial_cmp(b).expect("crossing parameters are finite"));
        params.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

        let mut result = vec![];
        for w in params.windows(2) {
            let mid = p0.lerp(p1, (w[0] + w[1]) / 2.0);
            if self.inside(mid, true) {
                let start = p0.lerp(p1, w[0]);
                let end = p0.lerp(p1, w[1]);
                if start != end {
                    result.push((start, end));
                }
            }
        }
        result
    }

    ///The closest point on any ring edge, or None for an empty region.
    pub fn closest_point_on_boundary(&self, p: Point) -> Option<Point> {
        let mut best: Option<(i64, Point)> = None;
        for polygon in &self.polygons {
            for (i, &a) in polygon.iter().enumerate() {
                let b = polygon.at(i + 1);
                let q = closest_on_segment(p, a, b);
                let dist2 = (q - p).vsize2();
                if best.map(|(d, _)| dist2 < d).unwrap_or(true) {
                    best = Some((dist2, q));
                }
            }
        }
        best.map(|(_, q)| q)
    }
}

impl FromIterator<Polygon> for Shape {
    fn from_iter<I: IntoIterator<Item = Polygon>>(iter: I) -> Self {
        Shape {
            polygons: iter.into_iter().collect(),
        }
    }
}

fn side(p: Point, a: Point, b: Point) -> i128 {
    ((b.x - a.x) as i128) * ((p.y - a.y) as i128) - ((b.y - a.y) as i128) * ((p.x - a.x) as i128)
}

///Proper crossing test; shared endpoints do not count as a collision.
fn segments_cross(p0: Point, p1: Point, a: Point, b: Point) -> bool {
    let d1 = side(a, p0, p1);
    let d2 = side(b, p0, p1);
    let d3 = side(p0, a, b);
    let d4 = side(p1, a, b);
    (d1 > 0) != (d2 > 0) && d1 != 0 && d2 != 0 && (d3 > 0) != (d4 > 0) && d3 != 0 && d4 != 0
}

///Parameter t along p0..p1 where it crosses edge a..b, if it does.
fn crossing_parameter(p0: Point, p1: Point, a: Point, b: Point) -> Option<f64> {
    let r = p1 - p0;
    let s = b - a;
    let denom = (r.x as i128) * (s.y as i128) - (r.y as i128) * (s.x as i128);
    if denom == 0 {
        return None;
    }
    let qp = a - p0;
    let t_num = (qp.x as i128) * (s.y as i128) - (qp.y as i128) * (s.x as i128);
    let u_num = (qp.x as i128) * (r.y as i128) - (qp.y as i128) * (r.x as i128);
    let t = t_num as f64 / denom as f64;
    let u = u_num as f64 / denom as f64;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(t)
    } else {
        None
    }
}

fn closest_on_segment(p: Point, a: Point, b: Point) -> Point {
    let ab = b - a;
    let len2 = ab.vsize2();
    if len2 == 0 {
        return a;
    }
    let t = (ab.dot(p - a) as f64 / len2 as f64).clamp(0.0, 1.0);
    a.lerp(b, t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(size: Coord) -> Polygon {
        Polygon::new(vec![
            Point::new(0, 0),
            Point::new(size, 0),
            Point::new(size, size),
            Point::new(0, size),
        ])
    }

    #[test]
    fn square_orientation_and_area() {
        let poly = square(10_000);
        assert!(poly.is_ccw());
        assert!((poly.area_mm2() - 100.0).abs() < 1e-9);
        assert_eq!(poly.length(), 40_000);
    }

    #[test]
    fn point_location() {
        let poly = square(10_000);
        assert_eq!(poly.locate(Point::new(5_000, 5_000)), BorderRelation::Inside);
        assert_eq!(poly.locate(Point::new(15_000, 5_000)), BorderRelation::Outside);
        assert_eq!(poly.locate(Point::new(0, 5_000)), BorderRelation::OnBorder);
    }

    #[test]
    fn shape_with_hole_uses_even_odd() {
        let mut hole = Polygon::new(vec![
            Point::new(2_000, 2_000),
            Point::new(8_000, 2_000),
            Point::new(8_000, 8_000),
            Point::new(2_000, 8_000),
        ]);
        hole.reverse();
        let shape = Shape::new(vec![square(10_000), hole]);
        assert!(!shape.inside(Point::new(5_000, 5_000), false));
        assert!(shape.inside(Point::new(1_000, 1_000), false));
    }

    #[test]
    fn cut_segment_keeps_interior_parts() {
        let shape = Shape::from_polygon(square(10_000));
        let parts = shape.cut_segment(Point::new(-5_000, 5_000), Point::new(15_000, 5_000));
        assert_eq!(parts.len(), 1);
        let (start, end) = parts[0];
        assert_eq!(start, Point::new(0, 5_000));
        assert_eq!(end, Point::new(10_000, 5_000));
    }

    #[test]
    fn segment_collision() {
        let shape = Shape::from_polygon(square(10_000));
        assert!(shape.collides_with_segment(Point::new(-1_000, 5_000), Point::new(5_000, 5_000)));
        assert!(!shape.collides_with_segment(Point::new(1_000, 1_000), Point::new(9_000, 9_000)));
    }
}
