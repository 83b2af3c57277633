use std::collections::HashMap;

use super::point::{Coord, Point};

///A sparse bucket grid over 2D points, used to find path endpoints near a
///location without scanning every path.
#[derive(Debug)]
pub struct SparsePointGrid<T> {
    cell_size: Coord,
    cells: HashMap<(i64, i64), Vec<(Point, T)>>,
}

impl<T: Copy> SparsePointGrid<T> {
    pub fn new(cell_size: Coord) -> Self {
        SparsePointGrid {
            cell_size: cell_size.max(1),
            cells: HashMap::new(),
        }
    }

    fn cell_of(&self, p: Point) -> (i64, i64) {
        (p.x.div_euclid(self.cell_size), p.y.div_euclid(self.cell_size))
    }

    pub fn insert(&mut self, p: Point, value: T) {
        let cell = self.cell_of(p);
        self.cells.entry(cell).or_default().push((p, value));
    }

    ///All values whose point lies within `radius` of `query`.
    pub fn nearby_values(&self, query: Point, radius: Coord) -> Vec<T> {
        let mut result = vec![];
        let min = self.cell_of(query - Point::new(radius, radius));
        let max = self.cell_of(query + Point::new(radius, radius));
        let radius2 = radius * radius;
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                if let Some(entries) = self.cells.get(&(cx, cy)) {
                    for (p, value) in entries {
                        if (*p - query).vsize2() <= radius2 {
                            result.push(*value);
                        }
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_points_within_radius() {
        let mut grid = SparsePointGrid::new(1_000);
        grid.insert(Point::new(0, 0), 0usize);
        grid.insert(Point::new(500, 0), 1usize);
        grid.insert(Point::new(5_000, 0), 2usize);

        let mut near = grid.nearby_values(Point::new(100, 0), 1_000);
        near.sort();
        assert_eq!(near, vec![0, 1]);
    }

    #[test]
    fn negative_coordinates_bucket_correctly() {
        let mut grid = SparsePointGrid::new(1_000);
        grid.insert(Point::new(-100, -100), 7usize);
        assert_eq!(grid.nearby_values(Point::new(-150, -150), 200), vec![7]);
    }
}
