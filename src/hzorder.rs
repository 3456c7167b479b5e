//! HZ addressing and block geometry
//!
//! ```text
//!        ZADDRESS   HZADDRESS
//!         V0101
//!  H=0     0000           0
//!  H=1     1000           1
//!  H=2     x100          1x
//!  H=3     xx10         1xx
//!  H=4     xxx1        1xxx
//! ```
//!
//! A z-address keeps bitmask position `j` at bit `maxh - j`. The hz-address of a
//! point at level `H` is a leading one followed by its first `H - 1` z bits, so
//! levels are stored coarse to fine and `blockid = hz >> bitsperblock`.

use crate::bitmask::Bitmask;
use crate::geometry::{BoxNi, LogicSamples, PointNi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HzOrder {
    bitmask: Bitmask,
    maxh: u32,
}

impl HzOrder {
    pub fn new(bitmask: &Bitmask) -> Self {
        Self {
            bitmask: bitmask.clone(),
            maxh: bitmask.max_resolution(),
        }
    }

    pub fn bitmask(&self) -> &Bitmask {
        &self.bitmask
    }

    pub fn max_resolution(&self) -> u32 {
        self.maxh
    }

    pub fn pdim(&self) -> usize {
        self.bitmask.pdim()
    }

    /// Point -> z-address
    pub fn interleave(&self, p: &PointNi) -> u64 {
        let mut p = p.clone();
        let mut z = 0u64;
        let mut pos = self.maxh;
        let mut shift = 0u32;
        while pos >= 1 && p.0.iter().any(|&v| v != 0) {
            let axis = self.bitmask.axis(pos);
            z |= ((p[axis] & 1) as u64) << shift;
            p[axis] >>= 1;
            shift += 1;
            pos -= 1;
        }
        z
    }

    /// z-address -> point
    pub fn deinterleave(&self, mut z: u64) -> PointNi {
        let mut p = PointNi::zeros(self.pdim());
        let mut seen = vec![0u32; self.pdim()];
        let mut pos = self.maxh;
        while z != 0 && pos >= 1 {
            let axis = self.bitmask.axis(pos);
            if z & 1 != 0 {
                p[axis] |= 1i64 << seen[axis];
            }
            seen[axis] += 1;
            z >>= 1;
            pos -= 1;
        }
        p
    }

    pub fn z_to_hz(&self, mut z: u64) -> u64 {
        z |= 1u64 << self.maxh;
        while z & 1 == 0 {
            z >>= 1;
        }
        z >> 1
    }

    pub fn hz_to_z(&self, hz: u64) -> u64 {
        let last = 1u64 << self.maxh;
        let mut hz = (hz << 1) | 1;
        while hz & last == 0 {
            hz <<= 1;
        }
        hz & (last - 1)
    }

    pub fn address(&self, p: &PointNi) -> u64 {
        self.z_to_hz(self.interleave(p))
    }

    pub fn point(&self, hz: u64) -> PointNi {
        self.deinterleave(self.hz_to_z(hz))
    }

    /// Number of significant bits of an hz-address, i.e. its level
    pub fn address_resolution(hz: u64) -> u32 {
        64 - hz.leading_zeros()
    }

    fn pow2_delta(&self, from: u32, to: u32) -> PointNi {
        PointNi(
            (0..self.pdim())
                .map(|d| 1i64 << self.bitmask.count(d, from, to))
                .collect(),
        )
    }

    /// Spacing of the samples of all levels `<= h`
    pub fn level_delta(&self, h: u32) -> PointNi {
        self.pow2_delta(h + 1, self.maxh)
    }

    /// Samples of all levels `<= h` inside `logic_box`
    pub fn level_samples(&self, logic_box: &BoxNi, h: u32) -> LogicSamples {
        let bounds = logic_box.intersection(&self.bitmask.pow2_box());
        LogicSamples::aligned(&bounds, self.level_delta(h))
    }

    /// Level of the samples stored in `blockid` (block 0 holds levels `0..=bitsperblock`)
    pub fn block_level(blockid: u64, bitsperblock: u32) -> u32 {
        if blockid == 0 {
            bitsperblock
        } else {
            bitsperblock + Self::address_resolution(blockid)
        }
    }

    /// The lattice of samples stored in a block. Valid for both layouts: in
    /// row-major the block buffer is this lattice; in hz-order sample `i`
    /// is the point at `blockid << bitsperblock + i`.
    pub fn block_samples(&self, blockid: u64, bitsperblock: u32) -> LogicSamples {
        let bpb = bitsperblock.min(self.maxh);
        if blockid == 0 {
            let delta = self.pow2_delta(bpb + 1, self.maxh);
            let nsamples = self.pow2_delta(1, bpb);
            return LogicSamples::from_origin(PointNi::zeros(self.pdim()), &nsamples, delta);
        }
        let h = Self::block_level(blockid, bpb);
        let delta = self.pow2_delta(h, self.maxh);
        let nsamples = self.pow2_delta(h - bpb, h - 1);
        let p0 = self.point(blockid << bpb);
        LogicSamples::from_origin(p0, &nsamples, delta)
    }

    /// Index of `p` inside an hz-ordered block buffer
    pub fn hz_index_in_block(&self, p: &PointNi, blockid: u64, bitsperblock: u32) -> u64 {
        self.address(p) - (blockid << bitsperblock)
    }

    /// Blocks holding samples of levels in `(from_exclusive, to_inclusive]`
    /// that intersect `logic_box`, coarse to fine
    pub fn blocks_for_box(
        &self,
        logic_box: &BoxNi,
        bitsperblock: u32,
        from_exclusive: Option<u32>,
        to_inclusive: u32,
    ) -> Vec<u64> {
        let bpb = bitsperblock.min(self.maxh);
        let to = to_inclusive.min(self.maxh);
        let bounds = logic_box.intersection(&self.bitmask.pow2_box());
        let mut ret = Vec::new();
        if !bounds.is_full_dim() {
            return ret;
        }

        let first_level = match from_exclusive {
            None => {
                ret.push(0);
                bpb + 1
            }
            Some(cur) if cur < bpb => {
                ret.push(0);
                bpb + 1
            }
            Some(cur) => cur + 1,
        };

        for h in first_level..=to {
            // cells of the block grid are fixed by positions [1, h-bpb-1]
            let cell = self.pow2_delta(h - bpb, self.maxh);
            let level_p1 = if h == 0 {
                PointNi::zeros(self.pdim())
            } else {
                self.deinterleave(1u64 << (self.maxh - h))
            };

            let lo: Vec<i64> = (0..self.pdim()).map(|d| bounds.p1[d] / cell[d]).collect();
            let hi: Vec<i64> = (0..self.pdim())
                .map(|d| (bounds.p2[d] - 1) / cell[d])
                .collect();

            let mut c = lo.clone();
            'cells: loop {
                let corner = PointNi((0..self.pdim()).map(|d| c[d] * cell[d]).collect());
                let blockid = self.address(&corner.add(&level_p1)) >> bpb;
                if self.block_samples(blockid, bpb).clip(&bounds).is_valid() {
                    ret.push(blockid);
                }

                let mut d = 0;
                loop {
                    if d == self.pdim() {
                        break 'cells;
                    }
                    c[d] += 1;
                    if c[d] <= hi[d] {
                        break;
                    }
                    c[d] = lo[d];
                    d += 1;
                }
            }
        }
        ret.sort_unstable();
        ret.dedup();
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hz(pattern: &str) -> HzOrder {
        HzOrder::new(&Bitmask::parse(pattern).unwrap())
    }

    fn p(v: &[i64]) -> PointNi {
        PointNi(v.to_vec())
    }

    #[test]
    fn test_interleave() {
        let h = hz("V0101");
        assert_eq!(h.interleave(&p(&[0, 0])), 0);
        assert_eq!(h.interleave(&p(&[1, 0])), 2);
        assert_eq!(h.interleave(&p(&[2, 0])), 8);
        assert_eq!(h.interleave(&p(&[0, 1])), 1);
        assert_eq!(h.interleave(&p(&[3, 3])), 15);
        assert_eq!(h.interleave(&p(&[2, 3])), 13);
        for z in 0..16 {
            assert_eq!(h.interleave(&h.deinterleave(z)), z);
        }
    }

    #[test]
    fn test_hz_roundtrip_and_levels() {
        let h = hz("V0101");
        assert_eq!(h.address(&p(&[0, 0])), 0);
        assert_eq!(h.address(&p(&[2, 0])), 1);
        assert_eq!(h.address(&p(&[0, 2])), 2);
        assert_eq!(h.address(&p(&[2, 2])), 3);
        let mut seen = std::collections::HashSet::new();
        for y in 0..4 {
            for x in 0..4 {
                let a = h.address(&p(&[x, y]));
                assert!(a < 16);
                assert!(seen.insert(a));
                assert_eq!(h.point(a), p(&[x, y]));
            }
        }
        assert_eq!(HzOrder::address_resolution(0), 0);
        assert_eq!(HzOrder::address_resolution(1), 1);
        assert_eq!(HzOrder::address_resolution(15), 4);
    }

    #[test]
    fn test_block_samples_cover_all_points() {
        let h = hz("V010101");
        let bpb = 2;
        let mut covered = std::collections::HashSet::new();
        for blockid in 0..(1u64 << (6 - bpb)) {
            let s = h.block_samples(blockid, bpb);
            assert_eq!(s.nsamples().product(), 1 << bpb);
            for i in 0..(1u64 << bpb) {
                let q = h.point((blockid << bpb) + i);
                assert!(s.contains(&q), "block {} misses {:?}", blockid, q);
                assert!(covered.insert(q));
            }
        }
        assert_eq!(covered.len(), 64);
    }

    #[test]
    fn test_blocks_for_box() {
        let h = hz("V010101");
        let bpb = 2;
        let all = BoxNi::from_dims(&p(&[8, 8]));
        let blocks = h.blocks_for_box(&all, bpb, None, 6);
        assert_eq!(blocks, (0..16).collect::<Vec<u64>>());

        // only the finest level
        let fine = h.blocks_for_box(&all, bpb, Some(5), 6);
        assert_eq!(fine, (8..16).collect::<Vec<u64>>());

        // a corner touches fewer blocks
        let corner = BoxNi::new(p(&[0, 0]), p(&[2, 2]));
        let some = h.blocks_for_box(&corner, bpb, None, 6);
        assert!(some.len() < 16);
        for b in &some {
            assert!(h.block_samples(*b, bpb).clip(&corner).is_valid());
        }
        for b in 0..16u64 {
            if !some.contains(&b) {
                assert!(!h.block_samples(b, bpb).clip(&corner).is_valid());
            }
        }
    }

    #[test]
    fn test_level_delta() {
        let h = hz("V0101");
        assert_eq!(h.level_delta(4), p(&[1, 1]));
        assert_eq!(h.level_delta(2), p(&[2, 2]));
        assert_eq!(h.level_delta(0), p(&[4, 4]));
        let s = h.level_samples(&BoxNi::from_dims(&p(&[4, 4])), 3);
        assert_eq!(s.nsamples(), p(&[4, 2]));
    }
}
