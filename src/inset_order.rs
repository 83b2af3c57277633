//!Partial ordering of wall toolpaths: which insets must print before which,
//!either per connected region or globally per inset index. The resulting
//!pairs feed the path-order optimizer as constraints.

use std::collections::HashSet;

use crate::geometry::ExtrusionLine;

///Whether a closed even wall encloses the representative point of another
///wall line.
fn encloses(outer: &ExtrusionLine, inner: &ExtrusionLine) -> bool {
    if !outer.is_closed || outer.is_empty() || inner.is_empty() {
        return false;
    }
    let representative = inner.junctions[0].p;
    outer.to_polygon().inside(representative, true)
}

///Order constraints between walls of neighboring insets within the same
///region. Each pair means the first wall must be printed before the second.
///
///`outer_to_inner` decides whether the outer wall of each adjacent pair goes
///first; gap-filler (odd) walls always follow the even walls enclosing them.
pub fn get_region_order(walls: &[ExtrusionLine], outer_to_inner: bool) -> HashSet<(usize, usize)> {
    let mut order = HashSet::new();
    for (i, outer) in walls.iter().enumerate() {
        if outer.is_odd {
            continue;
        }
        for (j, inner) in walls.iter().enumerate() {
            if i == j {
                continue;
            }
            if inner.is_odd {
                // Gap fillers print after the even wall that encloses them.
                if encloses(outer, inner) {
                    order.insert((i, j));
                }
                continue;
            }
            if inner.inset_idx == outer.inset_idx + 1 && encloses(outer, inner) {
                if outer_to_inner {
                    order.insert((i, j));
                } else {
                    order.insert((j, i));
                }
            }
        }
    }
    order
}

///Order constraints collected globally by inset index: every wall of inset
///`k` relates to every wall of inset `k + 1`, regardless of region.
pub fn get_inset_order(walls: &[ExtrusionLine], outer_to_inner: bool) -> HashSet<(usize, usize)> {
    let mut order = HashSet::new();
    let max_inset = walls.iter().map(|w| w.inset_idx).max().unwrap_or(0);
    for inset in 0..max_inset {
        for (i, outer) in walls.iter().enumerate() {
            if outer.is_odd || outer.inset_idx != inset {
                continue;
            }
            for (j, inner) in walls.iter().enumerate() {
                if inner.is_odd || inner.inset_idx != inset + 1 {
                    continue;
                }
                if outer_to_inner {
                    order.insert((i, j));
                } else {
                    order.insert((j, i));
                }
            }
        }
    }
    // Odd walls follow all even walls of their own inset.
    for (j, odd) in walls.iter().enumerate() {
        if !odd.is_odd {
            continue;
        }
        for (i, even) in walls.iter().enumerate() {
            if !even.is_odd && even.inset_idx == odd.inset_idx {
                order.insert((i, j));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ExtrusionJunction, Point};
    use crate::path_order::make_order_transitive;

    fn ring(inset_idx: usize, margin: i64) -> ExtrusionLine {
        let mut line = ExtrusionLine::new(inset_idx, false, true);
        let size = 10_000 - margin;
        line.junctions = vec![
            ExtrusionJunction::new(Point::new(margin, margin), 400, inset_idx),
            ExtrusionJunction::new(Point::new(size, margin), 400, inset_idx),
            ExtrusionJunction::new(Point::new(size, size), 400, inset_idx),
            ExtrusionJunction::new(Point::new(margin, size), 400, inset_idx),
        ];
        line
    }

    fn gap_filler(inset_idx: usize) -> ExtrusionLine {
        let mut line = ExtrusionLine::new(inset_idx, true, false);
        line.junctions = vec![
            ExtrusionJunction::new(Point::new(4_000, 5_000), 200, inset_idx),
            ExtrusionJunction::new(Point::new(6_000, 5_000), 200, inset_idx),
        ];
        line
    }

    #[test]
    fn region_order_outer_first() {
        let walls = vec![ring(0, 200), ring(1, 600)];
        let order = get_region_order(&walls, true);
        assert!(order.contains(&(0, 1)));
        assert!(!order.contains(&(1, 0)));
    }

    #[test]
    fn region_order_inner_first() {
        let walls = vec![ring(0, 200), ring(1, 600)];
        let order = get_region_order(&walls, false);
        assert!(order.contains(&(1, 0)));
    }

    #[test]
    fn odd_walls_follow_enclosing_even_walls() {
        let walls = vec![ring(0, 200), ring(1, 600), gap_filler(1)];
        for outer_to_inner in [true, false] {
            let order = get_region_order(&walls, outer_to_inner);
            assert!(order.contains(&(0, 2)));
            assert!(order.contains(&(1, 2)));
        }
    }

    #[test]
    fn inset_order_relates_consecutive_insets() {
        let walls = vec![ring(0, 200), ring(1, 600), ring(2, 1_000)];
        let order = get_inset_order(&walls, true);
        assert!(order.contains(&(0, 1)));
        assert!(order.contains(&(1, 2)));
        assert!(!order.contains(&(0, 2)));

        let transitive = make_order_transitive(&order);
        assert!(transitive.contains(&(0, 2)));
    }

    #[test]
    fn separate_regions_are_unrelated() {
        let mut far_ring = ring(1, 600);
        for junction in &mut far_ring.junctions {
            junction.p = junction.p + Point::new(100_000, 0);
        }
        let walls = vec![ring(0, 200), far_ring];
        let order = get_region_order(&walls, true);
        assert!(order.is_empty());
    }
}
