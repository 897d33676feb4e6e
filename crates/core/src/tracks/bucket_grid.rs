//! Coarse 2-D spatial index over slot-map keys.
//!
//! The plane is cut into square buckets of `1 << bits` pixels. Each bucket
//! heads a doubly linked list threaded through per-key link slots, so
//! insertion and removal are O(1) given the key. Coordinates outside the
//! grid are clamped into the border buckets.

use slotmap::{Key, SecondaryMap};

#[derive(Clone, Copy, Debug)]
struct Link<K> {
    prev: Option<K>,
    next: Option<K>,
    bucket: usize,
    u: f32,
    v: f32,
}

#[derive(Clone, Debug)]
pub struct BucketGrid<K: Key> {
    bits: u32,
    max_u: usize,
    max_v: usize,
    heads: Vec<Option<K>>,
    links: SecondaryMap<K, Link<K>>,
}

fn last_bucket(extent: u32, bits: u32) -> usize {
    let size = 1u64 << bits;
    (((extent as u64 + size - 1) >> bits) as usize).saturating_sub(1)
}

impl<K: Key> BucketGrid<K> {
    pub fn new(width: u32, height: u32, bits: u32) -> Self {
        let max_u = last_bucket(width, bits);
        let max_v = last_bucket(height, bits);
        Self {
            bits,
            max_u,
            max_v,
            heads: vec![None; (max_u + 1) * (max_v + 1)],
            links: SecondaryMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.links.contains_key(key)
    }

    /// Position the key was inserted or last moved at.
    pub fn position(&self, key: K) -> Option<(f32, f32)> {
        self.links.get(key).map(|l| (l.u, l.v))
    }

    /// Number of bucket columns and rows.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.max_u + 1, self.max_v + 1)
    }

    fn cell(&self, coord: f32, max: usize) -> usize {
        let c = coord as i64;
        if c < 0 {
            0
        } else {
            ((c as u64 >> self.bits) as usize).min(max)
        }
    }

    /// Bucket index of `(u, v)` after clamping into the grid.
    pub fn bucket_of(&self, u: f32, v: f32) -> usize {
        self.cell(v, self.max_v) * (self.max_u + 1) + self.cell(u, self.max_u)
    }

    /// Links `key` at the head of its bucket.
    ///
    /// # Panics
    /// If `key` is already in the grid.
    pub fn insert(&mut self, key: K, u: f32, v: f32) {
        assert!(!self.links.contains_key(key), "point is already in the grid");
        let bucket = self.bucket_of(u, v);
        let head = self.heads[bucket];
        if let Some(h) = head {
            if let Some(link) = self.links.get_mut(h) {
                link.prev = Some(key);
            }
        }
        self.links.insert(
            key,
            Link {
                prev: None,
                next: head,
                bucket,
                u,
                v,
            },
        );
        self.heads[bucket] = Some(key);
    }

    /// Unlinks `key`. Returns false if it was not in the grid.
    pub fn remove(&mut self, key: K) -> bool {
        let Some(link) = self.links.remove(key) else {
            return false;
        };
        match link.prev {
            Some(p) => {
                if let Some(prev) = self.links.get_mut(p) {
                    prev.next = link.next;
                }
            }
            None => self.heads[link.bucket] = link.next,
        }
        if let Some(n) = link.next {
            if let Some(next) = self.links.get_mut(n) {
                next.prev = link.prev;
            }
        }
        true
    }

    /// Moves `key` to `(u, v)`, relinking it only when its bucket changes.
    pub fn move_to(&mut self, key: K, u: f32, v: f32) -> bool {
        let bucket = self.bucket_of(u, v);
        let Some(link) = self.links.get_mut(key) else {
            return false;
        };
        if bucket == link.bucket {
            link.u = u;
            link.v = v;
            return true;
        }
        self.remove(key);
        self.insert(key, u, v);
        true
    }

    /// Every key in the buckets covering `[u-r, u+r] x [v-r, v+r]`.
    ///
    /// This is a bounding-box approximation: callers needing an exact disk
    /// filter the result by distance. The returned list is a snapshot, so
    /// the grid may be mutated while walking it.
    pub fn search(&self, u: f32, v: f32, r: f32) -> Vec<K> {
        let ub = self.cell((u - r).floor(), self.max_u);
        let ue = self.cell((u + r).ceil(), self.max_u);
        let vb = self.cell((v - r).floor(), self.max_v);
        let ve = self.cell((v + r).ceil(), self.max_v);
        let mut found = Vec::new();
        for j in vb..=ve {
            for i in ub..=ue {
                self.collect_bucket(j * (self.max_u + 1) + i, &mut found);
            }
        }
        found
    }

    /// Every key, bucket by bucket.
    pub fn keys(&self) -> Vec<K> {
        let mut found = Vec::with_capacity(self.len());
        for bucket in 0..self.heads.len() {
            self.collect_bucket(bucket, &mut found);
        }
        found
    }

    fn collect_bucket(&self, bucket: usize, found: &mut Vec<K>) {
        let mut cursor = self.heads[bucket];
        while let Some(key) = cursor {
            found.push(key);
            cursor = self.links.get(key).and_then(|l| l.next);
        }
    }

    /// Nearest key strictly closer than `max_dist`, with its squared distance.
    pub fn closest_point(&self, u: f32, v: f32, max_dist: f32) -> Option<(K, f32)> {
        let mut best = None;
        let mut best_d2 = max_dist * max_dist;
        for key in self.search(u, v, max_dist) {
            let Some(link) = self.links.get(key) else {
                continue;
            };
            let du = u - link.u;
            let dv = v - link.v;
            let d2 = du * du + dv * dv;
            if d2 < best_d2 {
                best_d2 = d2;
                best = Some((key, d2));
            }
        }
        best
    }

    pub fn clear(&mut self) {
        self.heads.iter_mut().for_each(|h| *h = None);
        self.links.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::{DefaultKey, SlotMap};

    fn keys(n: usize) -> Vec<DefaultKey> {
        let mut map: SlotMap<DefaultKey, ()> = SlotMap::new();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_grid_dimensions_round_up() {
        let grid: BucketGrid<DefaultKey> = BucketGrid::new(100, 33, 4);
        assert_eq!(grid.dimensions(), (7, 3));
    }

    #[test]
    fn test_out_of_range_points_clamp_to_border() {
        let grid: BucketGrid<DefaultKey> = BucketGrid::new(64, 64, 4);
        assert_eq!(grid.bucket_of(-5.0, -5.0), 0);
        assert_eq!(grid.bucket_of(1000.0, 1000.0), 15);
        assert_eq!(grid.bucket_of(17.0, 0.0), 1);
        assert_eq!(grid.bucket_of(0.0, 17.0), 4);
    }

    #[test]
    fn test_search_is_bounding_box() {
        let k = keys(3);
        let mut grid = BucketGrid::new(128, 128, 4);
        grid.insert(k[0], 10.0, 10.0);
        grid.insert(k[1], 30.0, 30.0);
        grid.insert(k[2], 100.0, 100.0);

        let mut near = grid.search(10.0, 10.0, 5.0);
        near.sort();
        assert_eq!(near, vec![k[0]]);

        // Corner of the box lies outside the disk but inside the buckets.
        let mut wide = grid.search(12.0, 12.0, 16.0);
        wide.sort();
        assert_eq!(wide, vec![k[0], k[1]]);
    }

    #[test]
    fn test_remove_from_middle_of_bucket() {
        let k = keys(3);
        let mut grid = BucketGrid::new(64, 64, 4);
        for key in &k {
            grid.insert(*key, 1.0, 1.0);
        }
        assert_eq!(grid.search(1.0, 1.0, 0.0), vec![k[2], k[1], k[0]]);
        assert!(grid.remove(k[1]));
        assert!(!grid.remove(k[1]));
        assert_eq!(grid.search(1.0, 1.0, 0.0), vec![k[2], k[0]]);
        assert!(grid.remove(k[2]));
        assert_eq!(grid.keys(), vec![k[0]]);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_closest_point_is_strict() {
        let k = keys(2);
        let mut grid = BucketGrid::new(64, 64, 4);
        grid.insert(k[0], 10.0, 10.0);
        grid.insert(k[1], 13.0, 10.0);
        assert_eq!(grid.closest_point(12.0, 10.0, 5.0).map(|(k, _)| k), Some(k[1]));
        assert_eq!(grid.closest_point(7.0, 10.0, 3.0), None);
        let (key, d2) = grid.closest_point(7.0, 10.0, 3.5).unwrap();
        assert_eq!(key, k[0]);
        approx::assert_relative_eq!(d2, 9.0);
    }

    #[test]
    fn test_move_relinks_across_buckets() {
        let k = keys(1);
        let mut grid = BucketGrid::new(64, 64, 4);
        grid.insert(k[0], 1.0, 1.0);
        assert!(grid.move_to(k[0], 2.0, 2.0));
        assert_eq!(grid.search(1.0, 1.0, 0.0), vec![k[0]]);
        assert!(grid.move_to(k[0], 50.0, 50.0));
        assert!(grid.search(1.0, 1.0, 0.0).is_empty());
        assert_eq!(grid.position(k[0]), Some((50.0, 50.0)));
    }

    #[test]
    #[should_panic(expected = "already in the grid")]
    fn test_double_insert_panics() {
        let k = keys(1);
        let mut grid = BucketGrid::new(64, 64, 4);
        grid.insert(k[0], 1.0, 1.0);
        grid.insert(k[0], 2.0, 2.0);
    }
}
