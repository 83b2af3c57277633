//!Collision-avoiding travel routing. A travel from A to B is checked
//!against a boundary region; when the straight line would leave it, the
//!route walks around the boundary corners instead, so the nozzle never
//!crosses a printed outline and no retraction is needed.

use crate::geometry::{Coord, Point, RotationMatrix, Shape};

///Outcome of a combing attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum CombResult {
    ///The straight move stays inside; no via points needed.
    Direct,
    ///Route through the given interior via points.
    Path(Vec<Point>),
    ///Start and destination are in different parts; the caller must
    ///retract, optionally z-hop, and travel straight.
    Fail,
}

///Travels shorter than this are never worth routing.
const SHORT_TRAVEL: Coord = 1_500;
///Clearance kept from crossing points when walking a boundary, µm.
const CROSSING_CLEARANCE: Coord = 200;
///Offset applied to boundary vertices on the walk, µm.
const WALK_OFFSET: Coord = 200;
///A point must be this close to the boundary to be moved inside, µm.
const MOVE_INSIDE_RANGE: Coord = 2_000;

pub struct Comb<'a> {
    preferred_boundary: &'a Shape,
    minimum_boundary: &'a Shape,
    move_inside_distance: Coord,
}

impl<'a> Comb<'a> {
    pub fn new(
        preferred_boundary: &'a Shape,
        minimum_boundary: &'a Shape,
        move_inside_distance: Coord,
    ) -> Self {
        Comb {
            preferred_boundary,
            minimum_boundary,
            move_inside_distance,
        }
    }

    pub fn inside_preferred(&self, p: Point) -> bool {
        self.preferred_boundary.inside(p, true)
    }

    ///Route from `start` to `end`, trying the preferred boundary first and
    ///falling back to the minimum boundary.
    pub fn calc(&self, start: Point, end: Point) -> CombResult {
        match try_comb(self.preferred_boundary, self.move_inside_distance, start, end) {
            Some(points) if points.is_empty() => CombResult::Direct,
            Some(points) => CombResult::Path(points),
            None => match try_comb(self.minimum_boundary, self.move_inside_distance, start, end) {
                Some(points) if points.is_empty() => CombResult::Direct,
                Some(points) => CombResult::Path(points),
                None => CombResult::Fail,
            },
        }
    }
}

///Move a point that lies outside the boundary to just inside it, if the
///boundary is within range.
pub fn move_inside(boundary: &Shape, p: Point, distance: Coord) -> Option<Point> {
    let mut best_dist2 = MOVE_INSIDE_RANGE * MOVE_INSIDE_RANGE;
    let mut result = None;
    for polygon in boundary.iter() {
        if polygon.is_empty() {
            continue;
        }
        for (i, &p1) in polygon.iter().enumerate() {
            let p0 = polygon.at(i + polygon.len() - 1);
            let edge = p1 - p0;
            let edge_length = edge.vsize();
            if edge_length == 0 {
                continue;
            }
            let lo = 10.min(edge_length);
            let hi = (edge_length - 10).max(lo);
            let dist_on_line = (edge.dot(p - p0) / edge_length).clamp(lo, hi);
            let q = p0 + edge * dist_on_line / edge_length;
            let dist2 = (q - p).vsize2();
            if dist2 < best_dist2 {
                best_dist2 = dist2;
                result = Some(q + edge.with_length(distance).turned_ccw());
            }
        }
    }
    result
}

///One comb attempt within a single boundary. `Some(vec![])` means the
///straight move is fine; `None` means this boundary cannot route the move.
fn try_comb(boundary: &Shape, move_inside_distance: Coord, start: Point, end: Point) -> Option<Vec<Point>> {
    if boundary.is_empty() {
        return None;
    }
    if (end - start).vsize() < SHORT_TRAVEL {
        return Some(vec![]);
    }

    let mut start = start;
    let mut end = end;
    let mut comb_points = vec![];
    let mut add_endpoint = false;

    if !boundary.inside(start, true) {
        start = move_inside(boundary, start, move_inside_distance)?;
        comb_points.push(start);
    }
    if !boundary.inside(end, true) {
        end = move_inside(boundary, end, move_inside_distance)?;
        add_endpoint = true;
    }

    if !boundary.collides_with_segment(start, end) && !add_endpoint && comb_points.is_empty() {
        return Some(vec![]);
    }

    let matrix = RotationMatrix::aligning(end - start);
    let sp = matrix.apply(start);
    let ep = matrix.apply(end);

    // For every boundary ring, the first and last crossing of the scanline
    // between start and end.
    let mut min_x = vec![i64::MAX; boundary.len()];
    let mut max_x = vec![i64::MIN; boundary.len()];
    let mut min_idx = vec![0usize; boundary.len()];
    let mut max_idx = vec![0usize; boundary.len()];
    for (n, polygon) in boundary.iter().enumerate() {
        if polygon.is_empty() {
            continue;
        }
        let mut p0 = matrix.apply(polygon.at(polygon.len() - 1));
        for (i, &raw) in polygon.iter().enumerate() {
            let p1 = matrix.apply(raw);
            if (p0.y > sp.y && p1.y < sp.y) || (p1.y > sp.y && p0.y < sp.y) {
                let x = p0.x + (p1.x - p0.x) * (sp.y - p0.y) / (p1.y - p0.y);
                if x >= sp.x && x <= ep.x {
                    if x < min_x[n] {
                        min_x[n] = x;
                        min_idx[n] = i;
                    }
                    if x > max_x[n] {
                        max_x[n] = x;
                        max_idx[n] = i;
                    }
                }
            }
            p0 = p1;
        }
    }

    // Walk through the crossed rings from start to end, inserting the ring
    // vertices of the shorter side around each obstacle.
    let mut point_list: Vec<Point> = vec![];
    let mut x = sp.x;
    loop {
        let mut best: Option<usize> = None;
        for n in 0..boundary.len() {
            if min_x[n] != i64::MAX && min_x[n] > x {
                if best.map(|b| min_x[n] < min_x[b]).unwrap_or(true) {
                    best = Some(n);
                }
            }
        }
        let Some(n) = best else { break };
        let polygon = &boundary.polygons()[n];
        let size = polygon.len() as isize;

        point_list.push(matrix.unapply(Point::new(min_x[n] - CROSSING_CLEARANCE, sp.y)));
        let forward = ((min_idx[n] as isize - max_idx[n] as isize).rem_euclid(size))
            > ((max_idx[n] as isize - min_idx[n] as isize).rem_euclid(size));
        if forward {
            let mut i = min_idx[n] as isize;
            while i != max_idx[n] as isize {
                point_list.push(boundary_point_with_offset(polygon, i as usize));
                i = (i + 1).rem_euclid(size);
            }
        } else {
            let mut i = (min_idx[n] as isize - 1).rem_euclid(size);
            let stop = (max_idx[n] as isize - 1).rem_euclid(size);
            while i != stop {
                point_list.push(boundary_point_with_offset(polygon, i as usize));
                i = (i - 1).rem_euclid(size);
            }
        }
        point_list.push(matrix.unapply(Point::new(max_x[n] + CROSSING_CLEARANCE, sp.y)));

        x = max_x[n];
    }
    point_list.push(end);

    // Drop every via point that the previous kept point can reach directly;
    // this smooths the walk and removes unneeded corners.
    let mut p0 = start;
    for i in 1..point_list.len() {
        if boundary.collides_with_segment(p0, point_list[i]) {
            if boundary.collides_with_segment(p0, point_list[i - 1]) {
                return None;
            }
            p0 = point_list[i - 1];
            comb_points.push(p0);
        }
    }
    if add_endpoint {
        comb_points.push(end);
    }
    Some(comb_points)
}

///A ring vertex nudged inward along its angular bisector, so the comb path
///keeps clearance from the wall.
fn boundary_point_with_offset(polygon: &crate::geometry::Polygon, idx: usize) -> Point {
    let size = polygon.len();
    let p0 = polygon.at((idx + size - 1) % size);
    let p1 = polygon.at(idx);
    let p2 = polygon.at((idx + 1) % size);

    let off0 = (p1 - p0).with_length(1_000).turned_ccw();
    let off1 = (p2 - p1).with_length(1_000).turned_ccw();
    p1 + (off0 + off1).with_length(WALK_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;

    fn rect(x0: Coord, y0: Coord, x1: Coord, y1: Coord) -> Polygon {
        Polygon::new(vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ])
    }

    #[test]
    fn straight_move_inside_is_direct() {
        let boundary = Shape::from_polygon(rect(0, 0, 50_000, 50_000));
        let comb = Comb::new(&boundary, &boundary, 100);
        let result = comb.calc(Point::new(5_000, 5_000), Point::new(45_000, 45_000));
        assert_eq!(result, CombResult::Direct);
    }

    #[test]
    fn route_walks_around_a_hole() {
        // A square with a center hole; travelling straight across must comb
        // around the hole with at least one via point.
        let mut hole = rect(20_000, 10_000, 30_000, 40_000);
        hole.reverse();
        let boundary = Shape::new(vec![rect(0, 0, 50_000, 50_000), hole]);
        let comb = Comb::new(&boundary, &boundary, 100);
        match comb.calc(Point::new(5_000, 25_000), Point::new(45_000, 25_000)) {
            CombResult::Path(points) => {
                assert!(!points.is_empty());
                for p in &points {
                    assert!(boundary.inside(*p, true), "via point {p:?} left the boundary");
                }
            }
            other => panic!("expected a combed path, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_parts_fail() {
        let boundary = Shape::new(vec![rect(0, 0, 10_000, 10_000), rect(40_000, 0, 50_000, 10_000)]);
        let comb = Comb::new(&boundary, &boundary, 100);
        let result = comb.calc(Point::new(5_000, 5_000), Point::new(45_000, 5_000));
        assert_eq!(result, CombResult::Fail);
    }

    #[test]
    fn empty_boundary_fails() {
        let empty = Shape::default();
        let comb = Comb::new(&empty, &empty, 100);
        assert_eq!(
            comb.calc(Point::new(0, 0), Point::new(10_000, 0)),
            CombResult::Fail
        );
    }
}
