//!Choosing the order in which closed contours and open lines are printed,
//!which vertex each closed contour starts from (the seam), and in which
//!direction each path runs.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::Rng;

use crate::comb::{Comb, CombResult};
use crate::geometry::{
    Coord, ExtrusionLine, Point, Polygon, Polyline, Shape, SparsePointGrid,
};
use crate::settings::{SeamCornerPref, SeamType, ZSeamConfig};

///Endpoints of open polylines closer together than this are considered
///coincident, closing the polyline into a polygon, µm.
const COINCIDENT_POINT_DISTANCE: Coord = 10;
///Bucket grid radius for finding paths that continue at the current
///position, µm.
const SNAP_RADIUS: Coord = 10;
///Above this path count, combing distances are approximated instead of
///computed.
const COMBING_APPROXIMATION_THRESHOLD: usize = 100;

///Read access to the vertices of any orderable path type.
pub trait PathAdapter {
    fn len(&self) -> usize;
    fn vertex(&self, idx: usize) -> Point;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PathAdapter for Polygon {
    fn len(&self) -> usize {
        Polygon::len(self)
    }
    fn vertex(&self, idx: usize) -> Point {
        self.at(idx)
    }
}

impl PathAdapter for Polyline {
    fn len(&self) -> usize {
        Polyline::len(self)
    }
    fn vertex(&self, idx: usize) -> Point {
        self.points()[idx]
    }
}

impl PathAdapter for ExtrusionLine {
    fn len(&self) -> usize {
        ExtrusionLine::len(self)
    }
    fn vertex(&self, idx: usize) -> Point {
        self.junction(idx).p
    }
}

impl<T: PathAdapter + ?Sized> PathAdapter for &T {
    fn len(&self) -> usize {
        (**self).len()
    }
    fn vertex(&self, idx: usize) -> Point {
        (**self).vertex(idx)
    }
}

///One path with its ordering decisions filled in by `optimize`.
#[derive(Clone, Debug)]
pub struct OrderedPath<P> {
    pub path: P,
    pub is_closed: bool,
    ///The vertex to start printing from.
    pub start_vertex: usize,
    ///Print the path in reverse vertex order.
    pub backwards: bool,
    ///The index at which the path was added, for mapping constraints.
    pub insertion_index: usize,
}

impl<P: PathAdapter> OrderedPath<P> {
    ///The position printing this path begins at.
    pub fn start_position(&self) -> Point {
        self.path.vertex(self.start_vertex)
    }

    ///The position the head ends at after printing this path.
    pub fn end_position(&self) -> Point {
        if self.is_closed {
            self.path.vertex(self.start_vertex)
        } else if self.start_vertex == 0 {
            self.path.vertex(self.path.len() - 1)
        } else {
            self.path.vertex(0)
        }
    }
}

///Orders paths by greedy nearest-neighbor selection under partial-order
///constraints, picking seam vertices along the way.
pub struct PathOrderOptimizer<'a, P: PathAdapter> {
    pub start_point: Point,
    pub seam_config: ZSeamConfig,
    combing_boundary: Option<&'a Shape>,
    detect_loops: bool,
    reverse_direction: bool,
    ///Pairs of insertion indices; the first path must print before the second.
    order_requirements: HashSet<(usize, usize)>,
    pub paths: Vec<OrderedPath<P>>,
}

impl<'a, P: PathAdapter> PathOrderOptimizer<'a, P> {
    pub fn new(start_point: Point, seam_config: ZSeamConfig) -> Self {
        PathOrderOptimizer {
            start_point,
            seam_config,
            combing_boundary: None,
            detect_loops: false,
            reverse_direction: false,
            order_requirements: HashSet::new(),
            paths: vec![],
        }
    }

    pub fn with_combing_boundary(mut self, boundary: &'a Shape) -> Self {
        if !boundary.is_empty() {
            self.combing_boundary = Some(boundary);
        }
        self
    }

    pub fn with_detect_loops(mut self) -> Self {
        self.detect_loops = true;
        self
    }

    pub fn with_reverse_direction(mut self, reverse: bool) -> Self {
        self.reverse_direction = reverse;
        self
    }

    pub fn with_order_requirements(mut self, requirements: HashSet<(usize, usize)>) -> Self {
        self.order_requirements = requirements;
        self
    }

    pub fn add_polygon(&mut self, polygon: P) {
        let insertion_index = self.paths.len();
        self.paths.push(OrderedPath {
            path: polygon,
            is_closed: true,
            start_vertex: 0,
            backwards: false,
            insertion_index,
        });
    }

    pub fn add_polyline(&mut self, polyline: P) {
        let insertion_index = self.paths.len();
        self.paths.push(OrderedPath {
            path: polyline,
            is_closed: false,
            start_vertex: 0,
            backwards: false,
            insertion_index,
        });
    }

    ///Reorder the paths and fill in their start vertices and directions.
    pub fn optimize(&mut self) {
        if self.paths.is_empty() {
            return;
        }

        if self.detect_loops {
            for path in &mut self.paths {
                if !path.is_closed && path.path.len() >= 3 {
                    let head = path.path.vertex(0);
                    let tail = path.path.vertex(path.path.len() - 1);
                    if (tail - head).vsize2() < COINCIDENT_POINT_DISTANCE * COINCIDENT_POINT_DISTANCE {
                        path.is_closed = true;
                    }
                }
            }
        }

        // Endpoints (and all vertices of closed paths) go into a bucket grid
        // so paths continuing at the current position are found first.
        let mut bucket_grid = SparsePointGrid::new(SNAP_RADIUS.max(1));
        for (i, path) in self.paths.iter().enumerate() {
            if path.path.is_empty() {
                continue;
            }
            if path.is_closed {
                for idx in 0..path.path.len() {
                    bucket_grid.insert(path.path.vertex(idx), i);
                }
            } else {
                bucket_grid.insert(path.path.vertex(0), i);
                bucket_grid.insert(path.path.vertex(path.path.len() - 1), i);
            }
        }

        // For these seam modes the seam does not depend on the current
        // position, so it can be computed once up front.
        let precompute_start = matches!(
            self.seam_config.seam_type,
            SeamType::Random | SeamType::UserSpecified | SeamType::SharpestCorner
        );
        if precompute_start {
            let target = self.seam_config.pos;
            for i in 0..self.paths.len() {
                if self.paths[i].is_closed && !self.paths[i].path.is_empty() {
                    self.paths[i].start_vertex = self.find_start_location(i, target);
                }
            }
        }

        let mut blocked = vec![0usize; self.paths.len()];
        let mut is_blocking: Vec<Vec<usize>> = vec![vec![]; self.paths.len()];
        for &(before, after) in &self.order_requirements {
            if before >= self.paths.len() || after >= self.paths.len() {
                log::debug!("dropping order requirement ({before}, {after}) outside the path set");
                continue;
            }
            blocked[after] += 1;
            is_blocking[before].push(after);
        }

        let mut picked = vec![false; self.paths.len()];
        let mut current_position = self.start_point;
        let mut optimized_order: Vec<usize> = Vec::with_capacity(self.paths.len());

        while optimized_order.len() < self.paths.len() {
            let nearby = bucket_grid.nearby_values(current_position, SNAP_RADIUS);
            let mut available: Vec<usize> = nearby
                .into_iter()
                .filter(|&i| !picked[i] && blocked[i] == 0)
                .collect();
            if available.is_empty() {
                available = (0..self.paths.len())
                    .filter(|&i| !picked[i] && blocked[i] == 0)
                    .collect();
            }
            if available.is_empty() {
                // Cyclic constraints would hang the loop; print the rest in
                // insertion order instead.
                log::warn!("order constraints form a cycle; falling back to insertion order");
                available = (0..self.paths.len()).filter(|&i| !picked[i]).collect();
            }

            let mut best_candidate = available[0];
            let mut best_distance2 = i64::MAX;
            for &candidate in &available {
                if self.paths[candidate].path.is_empty() {
                    continue;
                }
                if !self.paths[candidate].is_closed || !precompute_start {
                    let start_vertex = self.find_start_location(candidate, current_position);
                    let path = &mut self.paths[candidate];
                    path.start_vertex = start_vertex;
                    if !path.is_closed {
                        path.backwards = start_vertex > 0;
                    }
                }
                let candidate_position =
                    self.paths[candidate].path.vertex(self.paths[candidate].start_vertex);
                let mut distance2 = direct_distance2(current_position, candidate_position);
                if distance2 < best_distance2 && self.combing_boundary.is_some() {
                    // Only pay for a combing computation when the direct
                    // distance could still win.
                    distance2 = self.combing_distance2(current_position, candidate_position);
                }
                if distance2 < best_distance2 {
                    best_candidate = candidate;
                    best_distance2 = distance2;
                }
            }

            picked[best_candidate] = true;
            optimized_order.push(best_candidate);
            for &unblocked in &is_blocking[best_candidate] {
                blocked[unblocked] = blocked[unblocked].saturating_sub(1);
            }
            if !self.paths[best_candidate].path.is_empty() {
                current_position = self.paths[best_candidate].end_position();
            }
        }

        let mut reordered: Vec<OrderedPath<P>> = Vec::with_capacity(self.paths.len());
        let mut taken: Vec<Option<OrderedPath<P>>> =
            std::mem::take(&mut self.paths).into_iter().map(Some).collect();
        for index in optimized_order {
            reordered.push(taken[index].take().expect("each path is picked exactly once"));
        }

        if self.reverse_direction {
            reordered.reverse();
            for path in &mut reordered {
                path.backwards = !path.backwards;
                if !path.is_closed && path.path.len() > 0 {
                    path.start_vertex = path.path.len() - 1 - path.start_vertex;
                }
            }
        }
        self.paths = reordered;
    }

    ///The vertex to start the path from: for polylines the endpoint nearest
    ///to `target`, for polygons the seam vertex.
    fn find_start_location(&self, path_idx: usize, target: Point) -> usize {
        let path = &self.paths[path_idx];
        if !path.is_closed {
            let front = path.path.vertex(0);
            let back = path.path.vertex(path.path.len() - 1);
            let back_distance = if self.combing_boundary.is_some() {
                self.combing_distance2(back, target)
            } else {
                direct_distance2(back, target)
            };
            let front_distance = if self.combing_boundary.is_some() {
                self.combing_distance2(front, target)
            } else {
                direct_distance2(front, target)
            };
            return if back_distance < front_distance {
                path.path.len() - 1
            } else {
                0
            };
        }

        if self.seam_config.seam_type == SeamType::Random {
            return rand::thread_rng().gen_range(0..path.path.len());
        }

        let mut best_i = 0;
        let mut best_score = f64::INFINITY;
        for i in 0..path.path.len() {
            let here = path.path.vertex(i);
            let distance = if self.combing_boundary.is_some() {
                self.combing_distance2(here, target)
            } else {
                direct_distance2(here, target)
            };
            // For sharpest-corner seams the corner alone decides.
            let score_distance = if self.seam_config.seam_type == SeamType::SharpestCorner
                && self.seam_config.corner_pref != SeamCornerPref::None
            {
                0.0
            } else {
                distance as f64 / 1_000_000.0
            };

            // Negative corner angles are concave, positive are convex.
            let corner_angle = corner_angle(&path.path, i);

            // Allow the seam to shift to find a good corner, except for
            // user-specified seams which must stay close to the target.
            let corner_shift = if self.seam_config.seam_type != SeamType::UserSpecified {
                10_000.0
            } else {
                0.0
            };
            let mut score = match self.seam_config.corner_pref {
                SeamCornerPref::Inner => {
                    let mut score = score_distance;
                    if corner_angle < 0.0 {
                        score -= (-corner_angle + 1.0) * corner_shift;
                    }
                    score
                }
                SeamCornerPref::Outer => {
                    let mut score = score_distance;
                    if corner_angle > 0.0 {
                        score -= (corner_angle + 1.0) * corner_shift;
                    }
                    score
                }
                SeamCornerPref::Any => score_distance - corner_angle.abs() * corner_shift,
                SeamCornerPref::None => score_distance,
                SeamCornerPref::Weighted => {
                    let mut score_corner = corner_angle.abs() * corner_shift;
                    if corner_angle < 0.0 {
                        score_corner *= 2.0;
                    }
                    score_distance - score_corner
                }
            };

            // A user-specified seam must be the nearest vertex that matches
            // the corner filter; mismatches only win when nothing matches.
            if self.seam_config.seam_type == SeamType::UserSpecified
                && ((self.seam_config.corner_pref == SeamCornerPref::Inner && corner_angle >= 0.0)
                    || (self.seam_config.corner_pref == SeamCornerPref::Outer
                        && corner_angle <= 0.0))
            {
                score += 1_000.0;
            }

            if score < best_score {
                best_score = score;
                best_i = i;
            }
        }
        best_i % path.path.len()
    }

    fn combing_distance2(&self, a: Point, b: Point) -> i64 {
        let Some(boundary) = self.combing_boundary else {
            return direct_distance2(a, b);
        };
        if !boundary.collides_with_segment(a, b) {
            return direct_distance2(a, b);
        }
        if self.paths.len() > COMBING_APPROXIMATION_THRESHOLD {
            // With this many paths the combing computation is too expensive;
            // penalize boundary-crossing travels by a constant factor of 5.
            return direct_distance2(a, b).saturating_mul(25);
        }
        let comb = Comb::new(boundary, boundary, 0);
        match comb.calc(a, b) {
            CombResult::Direct => direct_distance2(a, b),
            CombResult::Path(points) => {
                let mut sum = 0i64;
                let mut last = a;
                for p in points.into_iter().chain(std::iter::once(b)) {
                    sum += (p - last).vsize();
                    last = p;
                }
                sum.saturating_mul(sum)
            }
            CombResult::Fail => direct_distance2(a, b).saturating_mul(25),
        }
    }
}

fn direct_distance2(a: Point, b: Point) -> i64 {
    (a - b).vsize2()
}

///The corner sharpness at vertex `i`, in [-1, 1]. Negative values are
///concave corners, positive values convex.
///
///High-resolution contours spread a sharp corner over many nearly-collinear
///vertices, so the angles of all neighbors within `ANGLE_QUERY_DISTANCE` are
///accumulated, weighted down with distance, and the whole cluster scores as
///one corner.
pub fn corner_angle<P: PathAdapter>(path: &P, i: usize) -> f64 {
    const ANGLE_QUERY_DISTANCE: Coord = 100;
    const FALL_OFF_STRENGTH: f64 = 0.5;
    const MIN_EDGE_LENGTH2: i64 = 10 * 10;

    let size = path.len();
    if size < 3 {
        return 0.0;
    }

    // The neighbor search must terminate even when all vertices coincide, so
    // every walk gives up after a full lap.
    let find_previous = |start: isize, from: Point| -> Option<(isize, Point)> {
        let mut idx = start;
        for _ in 0..size {
            idx -= 1;
            let p = path.vertex(idx.rem_euclid(size as isize) as usize);
            if (from - p).vsize2() >= MIN_EDGE_LENGTH2 {
                return Some((idx, p));
            }
        }
        None
    };
    let find_next = |start: isize, from: Point| -> Option<(isize, Point)> {
        let mut idx = start;
        for _ in 0..size {
            idx += 1;
            let p = path.vertex(idx.rem_euclid(size as isize) as usize);
            if (from - p).vsize2() >= MIN_EDGE_LENGTH2 {
                return Some((idx, p));
            }
        }
        None
    };

    ///Signed turn at `here`: positive turning left, negative turning right.
    fn turn(previous: Point, here: Point, next: Point) -> f64 {
        let incoming = (here - previous).as_dvec2();
        let outgoing = (next - here).as_dvec2();
        if incoming.length_squared() == 0.0 || outgoing.length_squared() == 0.0 {
            return 0.0;
        }
        incoming.angle_to(outgoing)
    }

    let here = path.vertex(i % size);
    let Some((prev_idx, previous)) = find_previous(i as isize, here) else {
        return 0.0;
    };
    let Some((next_idx, next)) = find_next(i as isize, here) else {
        return 0.0;
    };

    let mut total = turn(previous, here, next);

    // Preceding neighbors.
    {
        let mut next_p = here;
        let mut here_p = previous;
        let mut idx = prev_idx;
        let mut distance_to_query = (here_p - next_p).vsize();
        let mut steps = 0;
        while distance_to_query < ANGLE_QUERY_DISTANCE && steps < size {
            let Some((prev2_idx, previous_p)) = find_previous(idx, here_p) else {
                break;
            };
            let weight =
                1.0 - (distance_to_query as f64 / ANGLE_QUERY_DISTANCE as f64).powf(FALL_OFF_STRENGTH);
            total += turn(previous_p, here_p, next_p) * weight;
            distance_to_query += (previous_p - here_p).vsize();
            next_p = here_p;
            here_p = previous_p;
            idx = prev2_idx;
            steps += 1;
        }
    }

    // Following neighbors.
    {
        let mut previous_p = here;
        let mut here_p = next;
        let mut idx = next_idx;
        let mut distance_to_query = (here_p - previous_p).vsize();
        let mut steps = 0;
        while distance_to_query < ANGLE_QUERY_DISTANCE && steps < size {
            let Some((next2_idx, next_p)) = find_next(idx, here_p) else {
                break;
            };
            let weight =
                1.0 - (distance_to_query as f64 / ANGLE_QUERY_DISTANCE as f64).powf(FALL_OFF_STRENGTH);
            total += turn(previous_p, here_p, next_p) * weight;
            distance_to_query += (next_p - here_p).vsize();
            previous_p = here_p;
            here_p = next_p;
            idx = next2_idx;
            steps += 1;
        }
    }

    (total / std::f64::consts::PI).clamp(-1.0, 1.0)
}

///Close the order relation under transitivity: with (a, b) and (b, c)
///present, (a, c) is added. Nothing unreachable in the original relation is
///introduced.
pub fn make_order_transitive(order_requirements: &HashSet<(usize, usize)>) -> HashSet<(usize, usize)> {
    if order_requirements.is_empty() {
        return order_requirements.clone();
    }
    let mut order_mapping: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to) in order_requirements {
        order_mapping.entry(from).or_default().push(to);
    }
    let mut transitive_order = order_requirements.clone();
    for &(from, to) in order_requirements {
        let mut queue = VecDeque::new();
        queue.push_back(to);
        let mut seen = HashSet::new();
        while let Some(start) = queue.pop_front() {
            if !seen.insert(start) {
                continue;
            }
            if let Some(nexts) = order_mapping.get(&start) {
                for &next_to in nexts {
                    queue.push_back(next_to);
                    transitive_order.insert((from, next_to));
                }
            }
        }
    }
    transitive_order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::from_mm;

    fn square(size: Coord) -> Polygon {
        Polygon::new(vec![
            Point::new(0, 0),
            Point::new(size, 0),
            Point::new(size, size),
            Point::new(0, size),
        ])
    }

    fn notched_square() -> Polygon {
        // A 10 mm square with a sharp V cut into its top edge; the apex
        // points into the polygon, making it the only concave corner.
        Polygon::new(vec![
            Point::new(0, 0),
            Point::new(10_000, 0),
            Point::new(10_000, 10_000),
            Point::new(6_000, 10_000),
            Point::new(5_000, 4_000),
            Point::new(4_000, 10_000),
            Point::new(0, 10_000),
        ])
    }

    #[test]
    fn corner_angle_sign_convention() {
        let poly = notched_square();
        // Plain square corner of a CCW ring: convex, positive.
        assert!(corner_angle(&poly, 1) > 0.0);
        // The notch apex: concave, negative.
        assert!(corner_angle(&poly, 4) < 0.0);
    }

    #[test]
    fn corner_angle_terminates_on_degenerate_ring() {
        let poly = Polygon::new(vec![Point::new(5, 5); 8]);
        assert_eq!(corner_angle(&poly, 3), 0.0);
    }

    #[test]
    fn sharpest_corner_inner_finds_notch_apex() {
        let poly = notched_square();
        let config = ZSeamConfig {
            seam_type: SeamType::SharpestCorner,
            pos: Point::default(),
            corner_pref: SeamCornerPref::Inner,
        };
        let mut optimizer = PathOrderOptimizer::new(Point::default(), config);
        optimizer.add_polygon(&poly);
        optimizer.optimize();
        assert_eq!(optimizer.paths[0].start_vertex, 4);
    }

    #[test]
    fn seam_choice_is_deterministic() {
        let poly = notched_square();
        let config = ZSeamConfig {
            seam_type: SeamType::SharpestCorner,
            pos: Point::default(),
            corner_pref: SeamCornerPref::Any,
        };
        let mut reference = None;
        for _ in 0..5 {
            let mut optimizer = PathOrderOptimizer::new(Point::new(123, 456), config);
            optimizer.add_polygon(&poly);
            optimizer.optimize();
            let vertex = optimizer.paths[0].start_vertex;
            match reference {
                None => reference = Some(vertex),
                Some(expected) => assert_eq!(vertex, expected),
            }
        }
    }

    #[test]
    fn order_constraints_override_geometry() {
        // Four squares laid out so the greedy order would differ; the chain
        // of constraints forces insertion order.
        let squares: Vec<Polygon> = (0..4)
            .map(|i| {
                let offset = from_mm(30.0) * (3 - i);
                Polygon::new(
                    square(5_000)
                        .iter()
                        .map(|p| *p + Point::new(offset, 0))
                        .collect(),
                )
            })
            .collect();
        let mut requirements = HashSet::new();
        requirements.insert((0, 1));
        requirements.insert((1, 2));
        requirements.insert((2, 3));
        let mut optimizer = PathOrderOptimizer::new(Point::default(), ZSeamConfig::default())
            .with_order_requirements(requirements);
        for poly in &squares {
            optimizer.add_polygon(poly);
        }
        optimizer.optimize();
        let order: Vec<usize> = optimizer.paths.iter().map(|p| p.insertion_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn greedy_picks_nearest_without_constraints() {
        let near = square(5_000);
        let far = Polygon::new(
            square(5_000)
                .iter()
                .map(|p| *p + Point::new(from_mm(100.0), 0))
                .collect(),
        );
        let mut optimizer = PathOrderOptimizer::new(Point::default(), ZSeamConfig::default());
        optimizer.add_polygon(&far);
        optimizer.add_polygon(&near);
        optimizer.optimize();
        assert_eq!(optimizer.paths[0].insertion_index, 1);
    }

    #[test]
    fn polyline_starts_from_nearest_endpoint() {
        let line = Polyline::new(vec![
            Point::new(0, 0),
            Point::new(10_000, 0),
            Point::new(20_000, 0),
        ]);
        let mut optimizer =
            PathOrderOptimizer::new(Point::new(21_000, 0), ZSeamConfig::default());
        optimizer.add_polyline(&line);
        optimizer.optimize();
        assert_eq!(optimizer.paths[0].start_vertex, 2);
        assert!(optimizer.paths[0].backwards);
    }

    #[test]
    fn detect_loops_closes_coincident_polylines() {
        let line = Polyline::new(vec![
            Point::new(0, 0),
            Point::new(10_000, 0),
            Point::new(10_000, 10_000),
            Point::new(0, 10_000),
            Point::new(0, 5),
        ]);
        let mut optimizer = PathOrderOptimizer::new(Point::default(), ZSeamConfig::default())
            .with_detect_loops();
        optimizer.add_polyline(&line);
        optimizer.optimize();
        assert!(optimizer.paths[0].is_closed);
    }

    #[test]
    fn reverse_direction_flips_order_and_direction() {
        let a = square(5_000);
        let b = Polygon::new(
            square(5_000)
                .iter()
                .map(|p| *p + Point::new(20_000, 0))
                .collect(),
        );
        let mut optimizer = PathOrderOptimizer::new(Point::default(), ZSeamConfig::default())
            .with_reverse_direction(true);
        optimizer.add_polygon(&a);
        optimizer.add_polygon(&b);
        optimizer.optimize();
        assert_eq!(optimizer.paths[0].insertion_index, 1);
        assert!(optimizer.paths[0].backwards);
    }

    #[test]
    fn transitive_closure_adds_only_reachable_pairs() {
        let mut input = HashSet::new();
        input.insert((0, 1));
        input.insert((1, 2));
        let closed = make_order_transitive(&input);
        assert!(closed.contains(&(0, 1)));
        assert!(closed.contains(&(1, 2)));
        assert!(closed.contains(&(0, 2)));
        assert_eq!(closed.len(), 3);
    }
}
