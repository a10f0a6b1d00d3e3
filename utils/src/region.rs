// Region tracking helpers
//
// Damage, bounding shapes and the clip-ignore calculations all
// operate on sets of axis-aligned rectangles.
//
// Austin Shafer - 2024

/// A rectangular region
///
/// This can be used to track input regions,
/// damage boxes, etc. It is determinined by
/// the corders of a rectangle:
///   r_pos:  the upper left corner's position on the desktop
///   r_size: the distance from the left to the lower right
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Rect<T> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }
}

impl Rect<i32> {
    /// right edge, exclusive
    pub fn x2(&self) -> i32 {
        self.r_pos.0 + self.r_size.0
    }
    /// bottom edge, exclusive
    pub fn y2(&self) -> i32 {
        self.r_pos.1 + self.r_size.1
    }

    pub fn is_empty(&self) -> bool {
        self.r_size.0 <= 0 || self.r_size.1 <= 0
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.r_pos.0 && y >= self.r_pos.1 && x < self.x2() && y < self.y2()
    }

    /// Do these two rects overlap at all
    pub fn intersects(&self, other: &Rect<i32>) -> bool {
        self.r_pos.0 < other.x2()
            && other.r_pos.0 < self.x2()
            && self.r_pos.1 < other.y2()
            && other.r_pos.1 < self.y2()
    }

    /// The overlapping portion of two rects, if any
    pub fn intersection(&self, other: &Rect<i32>) -> Option<Rect<i32>> {
        let x1 = self.r_pos.0.max(other.r_pos.0);
        let y1 = self.r_pos.1.max(other.r_pos.1);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x1 < x2 && y1 < y2 {
            return Some(Rect::new(x1, y1, x2 - x1, y2 - y1));
        }
        return None;
    }

    /// Is `other` completely inside this rect
    pub fn contains_rect(&self, other: &Rect<i32>) -> bool {
        other.r_pos.0 >= self.r_pos.0
            && other.r_pos.1 >= self.r_pos.1
            && other.x2() <= self.x2()
            && other.y2() <= self.y2()
    }

    /// Remove `clip` from this rect
    ///
    /// Returns the (up to four) fragments of self not covered by clip.
    /// The fragments are disjoint.
    fn subtract(&self, clip: &Rect<i32>) -> Vec<Rect<i32>> {
        let hole = match self.intersection(clip) {
            Some(h) => h,
            // no overlap, nothing removed
            None => return vec![*self],
        };

        let mut ret = Vec::new();
        // band above the hole
        if hole.r_pos.1 > self.r_pos.1 {
            ret.push(Rect::new(
                self.r_pos.0,
                self.r_pos.1,
                self.r_size.0,
                hole.r_pos.1 - self.r_pos.1,
            ));
        }
        // band below the hole
        if hole.y2() < self.y2() {
            ret.push(Rect::new(
                self.r_pos.0,
                hole.y2(),
                self.r_size.0,
                self.y2() - hole.y2(),
            ));
        }
        // left sliver beside the hole
        if hole.r_pos.0 > self.r_pos.0 {
            ret.push(Rect::new(
                self.r_pos.0,
                hole.r_pos.1,
                hole.r_pos.0 - self.r_pos.0,
                hole.r_size.1,
            ));
        }
        // right sliver beside the hole
        if hole.x2() < self.x2() {
            ret.push(Rect::new(
                hole.x2(),
                hole.r_pos.1,
                self.x2() - hole.x2(),
                hole.r_size.1,
            ));
        }
        return ret;
    }
}

/// A set of disjoint rectangles
///
/// This is the 2D area type used for damage accumulation, window
/// bounding shapes, and the region that cannot be seen through the
/// windows above (`reg_ignore`). The rects held are always pairwise
/// disjoint, so area calculations are simple sums.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    reg_rects: Vec<Rect<i32>>,
}

impl Region {
    pub fn new() -> Region {
        Region {
            reg_rects: Vec::new(),
        }
    }

    pub fn from_rect(rect: Rect<i32>) -> Region {
        let mut ret = Region::new();
        ret.add_rect(rect);
        return ret;
    }

    pub fn is_empty(&self) -> bool {
        self.reg_rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.reg_rects.clear();
    }

    pub fn rects(&self) -> &[Rect<i32>] {
        self.reg_rects.as_slice()
    }

    /// Union a single rect into this region
    ///
    /// Only the parts of `rect` not already covered are added, which
    /// keeps the disjointness invariant.
    pub fn add_rect(&mut self, rect: Rect<i32>) {
        if rect.is_empty() {
            return;
        }

        let mut frags = vec![rect];
        for r in self.reg_rects.iter() {
            let mut next = Vec::new();
            for f in frags.iter() {
                next.extend(f.subtract(r));
            }
            frags = next;
            if frags.is_empty() {
                return;
            }
        }
        self.reg_rects.extend(frags);
    }

    /// Union another region into this one
    pub fn union(&mut self, other: &Region) {
        for r in other.reg_rects.iter() {
            self.add_rect(*r);
        }
    }

    /// The overlap of two regions
    pub fn intersect(&self, other: &Region) -> Region {
        let mut ret = Region::new();
        // intersections of two disjoint sets are themselves disjoint,
        // so these can be pushed directly
        for a in self.reg_rects.iter() {
            for b in other.reg_rects.iter() {
                if let Some(i) = a.intersection(b) {
                    ret.reg_rects.push(i);
                }
            }
        }
        return ret;
    }

    /// This region with `other` removed
    pub fn subtract(&self, other: &Region) -> Region {
        let mut ret = Region::new();
        for a in self.reg_rects.iter() {
            let mut frags = vec![*a];
            for b in other.reg_rects.iter() {
                let mut next = Vec::new();
                for f in frags.iter() {
                    next.extend(f.subtract(b));
                }
                frags = next;
                if frags.is_empty() {
                    break;
                }
            }
            ret.reg_rects.extend(frags);
        }
        return ret;
    }

    /// Move every rect in the region by (dx, dy)
    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in self.reg_rects.iter_mut() {
            r.r_pos.0 += dx;
            r.r_pos.1 += dy;
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.reg_rects.iter().any(|r| r.contains_point(x, y))
    }

    /// The bounding box of the whole region
    pub fn extents(&self) -> Option<Rect<i32>> {
        let first = self.reg_rects.first()?;
        let mut x1 = first.r_pos.0;
        let mut y1 = first.r_pos.1;
        let mut x2 = first.x2();
        let mut y2 = first.y2();

        for r in self.reg_rects.iter().skip(1) {
            x1 = x1.min(r.r_pos.0);
            y1 = y1.min(r.r_pos.1);
            x2 = x2.max(r.x2());
            y2 = y2.max(r.y2());
        }
        return Some(Rect::new(x1, y1, x2 - x1, y2 - y1));
    }

    /// Total covered area in pixels
    pub fn area(&self) -> u64 {
        self.reg_rects
            .iter()
            .map(|r| r.r_size.0 as u64 * r.r_size.1 as u64)
            .sum()
    }

    /// Does this region cover every pixel of `rect`
    pub fn covers_rect(&self, rect: &Rect<i32>) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut frags = vec![*rect];
        for r in self.reg_rects.iter() {
            let mut next = Vec::new();
            for f in frags.iter() {
                next.extend(f.subtract(r));
            }
            frags = next;
            if frags.is_empty() {
                return true;
            }
        }
        return false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_subtract_produces_frame() {
        let outer = Rect::new(0, 0, 100, 100);
        let inner = Rect::new(25, 25, 50, 50);

        let frags = outer.subtract(&inner);
        let total: i32 = frags.iter().map(|r| r.r_size.0 * r.r_size.1).sum();
        assert_eq!(total, 100 * 100 - 50 * 50);

        // fragments must not overlap each other or the hole
        for (i, a) in frags.iter().enumerate() {
            assert!(!a.intersects(&inner));
            for b in frags.iter().skip(i + 1) {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn region_union_is_disjoint() {
        let mut reg = Region::new();
        reg.add_rect(Rect::new(0, 0, 10, 10));
        reg.add_rect(Rect::new(5, 5, 10, 10));
        // 100 + 100 - 25 overlap
        assert_eq!(reg.area(), 175);

        // re-adding covered area changes nothing
        reg.add_rect(Rect::new(0, 0, 10, 10));
        assert_eq!(reg.area(), 175);
    }

    #[test]
    fn region_subtract_and_intersect() {
        let a = Region::from_rect(Rect::new(0, 0, 20, 20));
        let b = Region::from_rect(Rect::new(10, 0, 20, 20));

        let inter = a.intersect(&b);
        assert_eq!(inter.area(), 10 * 20);

        let diff = a.subtract(&b);
        assert_eq!(diff.area(), 10 * 20);
        assert!(!diff.contains_point(15, 5));
        assert!(diff.contains_point(5, 5));
    }

    #[test]
    fn region_covers() {
        let mut reg = Region::new();
        reg.add_rect(Rect::new(0, 0, 10, 20));
        reg.add_rect(Rect::new(10, 0, 10, 20));
        assert!(reg.covers_rect(&Rect::new(0, 0, 20, 20)));
        assert!(!reg.covers_rect(&Rect::new(0, 0, 21, 20)));
    }
}
