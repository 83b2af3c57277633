use serde::{Deserialize, Serialize};

use super::point::{Coord, Point};

///One vertex of a variable-width toolpath, carrying its own line width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtrusionJunction {
    pub p: Point,
    ///Line width at this junction, µm.
    pub w: Coord,
    ///Index of the perimeter this junction belongs to.
    pub perimeter_index: usize,
}

impl ExtrusionJunction {
    pub fn new(p: Point, w: Coord, perimeter_index: usize) -> Self {
        ExtrusionJunction {
            p,
            w,
            perimeter_index,
        }
    }
}

///A wall toolpath produced by the variable-width wall generator.
///
///`inset_idx` counts outward-to-inward, 0 being the outermost wall. Odd
///walls are single gap-filler lines running down the middle of a gap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionLine {
    pub inset_idx: usize,
    ///A gap filler line rather than a regular wall.
    pub is_odd: bool,
    ///Whether the line closes back on its first junction.
    pub is_closed: bool,
    pub junctions: Vec<ExtrusionJunction>,
}

impl ExtrusionLine {
    pub fn new(inset_idx: usize, is_odd: bool, is_closed: bool) -> Self {
        ExtrusionLine {
            inset_idx,
            is_odd,
            is_closed,
            junctions: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.junctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.junctions.is_empty()
    }

    pub fn junction(&self, idx: usize) -> &ExtrusionJunction {
        &self.junctions[idx % self.junctions.len()]
    }

    ///Total length, including the closing segment for closed lines, µm.
    pub fn length(&self) -> Coord {
        if self.junctions.len() < 2 {
            return 0;
        }
        let mut total: Coord = self
            .junctions
            .windows(2)
            .map(|w| (w[1].p - w[0].p).vsize())
            .sum();
        if self.is_closed {
            total += (self.junctions[0].p
                - self.junctions[self.junctions.len() - 1].p)
                .vsize();
        }
        total
    }

    ///The widest junction of the line, µm.
    pub fn max_width(&self) -> Coord {
        self.junctions.iter().map(|j| j.w).max().unwrap_or(0)
    }

    ///Build a plain polygon from the junction positions (closed lines only).
    pub fn to_polygon(&self) -> super::polygon::Polygon {
        super::polygon::Polygon::new(self.junctions.iter().map(|j| j.p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_line_length_includes_closing_edge() {
        let mut line = ExtrusionLine::new(0, false, true);
        line.junctions = vec![
            ExtrusionJunction::new(Point::new(0, 0), 400, 0),
            ExtrusionJunction::new(Point::new(10_000, 0), 400, 0),
            ExtrusionJunction::new(Point::new(10_000, 10_000), 400, 0),
            ExtrusionJunction::new(Point::new(0, 10_000), 400, 0),
        ];
        assert_eq!(line.length(), 40_000);
        line.is_closed = false;
        assert_eq!(line.length(), 30_000);
    }
}
