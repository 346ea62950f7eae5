use serde::Deserialize;

use crate::Point;

/// A walkable line segment of a map's terrain.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Foothold {
    pub id: u16,
    pub p1: Point,
    pub p2: Point,
}

impl Foothold {
    /// The segment's y at `x`, if the segment spans `x` horizontally.
    /// Vertical walls report their topmost endpoint, so only a point at
    /// or above the wall's top can land on it.
    pub fn y_at(&self, x: i16) -> Option<i16> {
        let (lo, hi) = if self.p1.x <= self.p2.x {
            (self.p1.x, self.p2.x)
        } else {
            (self.p2.x, self.p1.x)
        };
        if x < lo || x > hi {
            return None;
        }

        if self.p1.x == self.p2.x {
            return Some(self.p1.y.min(self.p2.y));
        }

        let dy = i32::from(self.p2.y) - i32::from(self.p1.y);
        let dx = i32::from(self.p2.x) - i32::from(self.p1.x);
        let y = i32::from(self.p1.y) + dy * (i32::from(x) - i32::from(self.p1.x)) / dx;
        Some(y as i16)
    }
}

/// Immutable spatial index over a map's footholds, built once at load and
/// shared by reference across threads.
///
/// Queries partition on x so a lookup only scans the footholds whose
/// horizontal extent covers the query column.
#[derive(Debug, Default)]
pub struct FootholdTree {
    footholds: Vec<Foothold>,
    // Column starts (sorted) and, per column, indices of spanning footholds.
    columns: Vec<(i16, Vec<u32>)>,
}

const COLUMN_WIDTH: i16 = 128;

impl FootholdTree {
    pub fn new(footholds: Vec<Foothold>) -> Self {
        let mut columns: Vec<(i16, Vec<u32>)> = Vec::new();
        if !footholds.is_empty() {
            let min_x = footholds.iter().map(|f| f.p1.x.min(f.p2.x)).min().unwrap();
            let max_x = footholds.iter().map(|f| f.p1.x.max(f.p2.x)).max().unwrap();
            let mut start = min_x;
            while start <= max_x {
                let end = start.saturating_add(COLUMN_WIDTH);
                let members = footholds
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| {
                        let lo = f.p1.x.min(f.p2.x);
                        let hi = f.p1.x.max(f.p2.x);
                        hi >= start && lo < end
                    })
                    .map(|(i, _)| i as u32)
                    .collect();
                columns.push((start, members));
                if end == i16::MAX {
                    break;
                }
                start = end;
            }
        }

        Self { footholds, columns }
    }

    /// The nearest foothold strictly below `p` (remember: y grows down, so
    /// "below" means `y_at(p.x) >= p.y`).
    pub fn find_below(&self, p: Point) -> Option<&Foothold> {
        let column = match self.columns.binary_search_by_key(&p.x, |(start, _)| *start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };

        let mut best: Option<(&Foothold, i16)> = None;
        for &i in &self.columns[column].1 {
            let fh = &self.footholds[i as usize];
            if let Some(y) = fh.y_at(p.x) {
                if y >= p.y && best.map_or(true, |(_, best_y)| y < best_y) {
                    best = Some((fh, y));
                }
            }
        }

        best.map(|(fh, _)| fh)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tree() -> FootholdTree {
        FootholdTree::new(vec![
            Foothold {
                id: 1,
                p1: Point::new(-100, 100),
                p2: Point::new(100, 100),
            },
            Foothold {
                id: 2,
                p1: Point::new(-100, 300),
                p2: Point::new(100, 500),
            },
            Foothold {
                id: 3,
                p1: Point::new(200, 50),
                p2: Point::new(200, 250),
            },
        ])
    }

    #[test]
    fn picks_the_nearest_foothold_below() {
        let tree = tree();
        assert_eq!(tree.find_below(Point::new(0, 0)).unwrap().id, 1);
        assert_eq!(tree.find_below(Point::new(0, 150)).unwrap().id, 2);
        assert!(tree.find_below(Point::new(0, 600)).is_none());
    }

    #[test]
    fn interpolates_along_the_segment() {
        let tree = tree();
        let fh = tree.find_below(Point::new(50, 200)).unwrap();
        assert_eq!(fh.id, 2);
        assert_eq!(fh.y_at(50), Some(450));
    }

    #[test]
    fn vertical_foothold_snaps_to_its_top() {
        let tree = tree();
        // At or above the wall's top endpoint: land on the top.
        let fh = tree.find_below(Point::new(200, 40)).unwrap();
        assert_eq!(fh.id, 3);
        assert_eq!(fh.y_at(200), Some(50));

        // Already past the top: the wall cannot catch the point.
        assert!(tree.find_below(Point::new(200, 60)).is_none());
    }

    #[test]
    fn find_below_is_idempotent() {
        let tree = tree();
        let a = tree.find_below(Point::new(10, 10)).map(|f| f.id);
        let b = tree.find_below(Point::new(10, 10)).map(|f| f.id);
        assert_eq!(a, b);
    }
}
