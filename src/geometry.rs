//! Integer points, boxes, sample lattices and homogeneous transforms

use crate::error::{IdxError, Result};
use ndarray::{arr2, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Integer point with up to `pdim` coordinates
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointNi(pub Vec<i64>);

impl PointNi {
    pub fn zeros(pdim: usize) -> Self {
        Self(vec![0; pdim])
    }

    pub fn ones(pdim: usize) -> Self {
        Self(vec![1; pdim])
    }

    pub fn pdim(&self) -> usize {
        self.0.len()
    }

    pub fn add(&self, other: &PointNi) -> PointNi {
        PointNi(self.0.iter().zip(&other.0).map(|(a, b)| a + b).collect())
    }

    pub fn sub(&self, other: &PointNi) -> PointNi {
        PointNi(self.0.iter().zip(&other.0).map(|(a, b)| a - b).collect())
    }

    pub fn mul(&self, other: &PointNi) -> PointNi {
        PointNi(self.0.iter().zip(&other.0).map(|(a, b)| a * b).collect())
    }

    /// Number of samples of a grid with these dimensions
    pub fn product(&self) -> u64 {
        self.0.iter().map(|&v| v.max(0) as u64).product()
    }

    /// Row-major strides, dimension 0 fastest
    pub fn stride(&self) -> Vec<u64> {
        let mut stride = Vec::with_capacity(self.pdim());
        let mut acc = 1u64;
        for &d in &self.0 {
            stride.push(acc);
            acc *= d.max(0) as u64;
        }
        stride
    }

    /// Homogeneous 3D coordinates (missing axes are zero)
    pub fn to_point3(&self) -> [f64; 3] {
        let mut ret = [0.0; 3];
        for (i, v) in self.0.iter().take(3).enumerate() {
            ret[i] = *v as f64;
        }
        ret
    }
}

impl Index<usize> for PointNi {
    type Output = i64;
    fn index(&self, index: usize) -> &i64 {
        &self.0[index]
    }
}

impl IndexMut<usize> for PointNi {
    fn index_mut(&mut self, index: usize) -> &mut i64 {
        &mut self.0[index]
    }
}

impl fmt::Display for PointNi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&s.join(" "))
    }
}

/// Half-open integer box `[p1, p2)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxNi {
    pub p1: PointNi,
    pub p2: PointNi,
}

impl BoxNi {
    pub fn new(p1: PointNi, p2: PointNi) -> Self {
        Self { p1, p2 }
    }

    /// `[0, dims)`
    pub fn from_dims(dims: &PointNi) -> Self {
        Self::new(PointNi::zeros(dims.pdim()), dims.clone())
    }

    pub fn pdim(&self) -> usize {
        self.p1.pdim()
    }

    pub fn size(&self) -> PointNi {
        self.p2.sub(&self.p1)
    }

    /// Every axis has positive extent
    pub fn is_full_dim(&self) -> bool {
        self.pdim() > 0 && self.p1.0.iter().zip(&self.p2.0).all(|(a, b)| a < b)
    }

    pub fn intersection(&self, other: &BoxNi) -> BoxNi {
        BoxNi::new(
            PointNi(self.p1.0.iter().zip(&other.p1.0).map(|(a, b)| *a.max(b)).collect()),
            PointNi(self.p2.0.iter().zip(&other.p2.0).map(|(a, b)| *a.min(b)).collect()),
        )
    }

    pub fn intersects(&self, other: &BoxNi) -> bool {
        self.intersection(other).is_full_dim()
    }

    pub fn contains_point(&self, p: &PointNi) -> bool {
        (0..self.pdim()).all(|d| p[d] >= self.p1[d] && p[d] < self.p2[d])
    }

    pub fn contains_box(&self, other: &BoxNi) -> bool {
        (0..self.pdim()).all(|d| other.p1[d] >= self.p1[d] && other.p2[d] <= self.p2[d])
    }

    pub fn translate(&self, offset: &PointNi) -> BoxNi {
        BoxNi::new(self.p1.add(offset), self.p2.add(offset))
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoxNi) -> BoxNi {
        BoxNi::new(
            PointNi(self.p1.0.iter().zip(&other.p1.0).map(|(a, b)| *a.min(b)).collect()),
            PointNi(self.p2.0.iter().zip(&other.p2.0).map(|(a, b)| *a.max(b)).collect()),
        )
    }

    pub fn volume(&self) -> f64 {
        self.size().0.iter().map(|&v| v.max(0) as f64).product()
    }

    pub fn center(&self) -> [f64; 3] {
        let mut ret = [0.0; 3];
        for d in 0..self.pdim().min(3) {
            ret[d] = 0.5 * (self.p1[d] + self.p2[d]) as f64;
        }
        ret
    }

    /// `x1 x2 y1 y2 ...` with inclusive upper bounds, as in `.idx` files
    pub fn to_old_format_string(&self) -> String {
        (0..self.pdim())
            .map(|d| format!("{} {}", self.p1[d], self.p2[d] - 1))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parse_old_format(pdim: usize, s: &str) -> Result<Self> {
        let values: Vec<i64> = s
            .split_whitespace()
            .map(|v| v.parse::<i64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| IdxError::InvalidFormat(format!("invalid box '{}'", s)))?;

        if values.len() < 2 * pdim {
            return Err(IdxError::InvalidFormat(format!("invalid box '{}'", s)));
        }

        let mut p1 = PointNi::zeros(pdim);
        let mut p2 = PointNi::zeros(pdim);
        for d in 0..pdim {
            p1[d] = values[2 * d];
            p2[d] = values[2 * d + 1] + 1;
        }
        Ok(BoxNi::new(p1, p2))
    }
}

/// A regular lattice of samples `p1 + k * delta` inside `[p1, p2)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicSamples {
    pub logic_box: BoxNi,
    pub delta: PointNi,
}

fn align_right(value: i64, origin: i64, delta: i64) -> i64 {
    let r = (value - origin).rem_euclid(delta);
    if r == 0 {
        value
    } else {
        value + (delta - r)
    }
}

impl LogicSamples {
    /// Lattice starting exactly at `p1` with `nsamples` per axis
    pub fn from_origin(p1: PointNi, nsamples: &PointNi, delta: PointNi) -> Self {
        let p2 = p1.add(&nsamples.mul(&delta));
        Self {
            logic_box: BoxNi::new(p1, p2),
            delta,
        }
    }

    /// Samples of the origin-aligned lattice `k * delta` that fall in `bounds`
    pub fn aligned(bounds: &BoxNi, delta: PointNi) -> Self {
        let pdim = bounds.pdim();
        let mut p1 = PointNi::zeros(pdim);
        let mut nsamples = PointNi::zeros(pdim);
        for d in 0..pdim {
            p1[d] = align_right(bounds.p1[d], 0, delta[d]);
            let extent = bounds.p2[d] - p1[d];
            nsamples[d] = if extent > 0 {
                (extent + delta[d] - 1) / delta[d]
            } else {
                0
            };
        }
        Self::from_origin(p1, &nsamples, delta)
    }

    pub fn pdim(&self) -> usize {
        self.delta.pdim()
    }

    pub fn nsamples(&self) -> PointNi {
        let size = self.logic_box.size();
        PointNi(
            (0..self.pdim())
                .map(|d| (size[d] / self.delta[d]).max(0))
                .collect(),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.nsamples().0.iter().all(|&n| n > 0)
    }

    pub fn contains(&self, p: &PointNi) -> bool {
        (0..self.pdim()).all(|d| {
            let off = p[d] - self.logic_box.p1[d];
            off >= 0 && p[d] < self.logic_box.p2[d] && off % self.delta[d] == 0
        })
    }

    pub fn pixel_to_logic(&self, pixel: &PointNi) -> PointNi {
        self.logic_box.p1.add(&pixel.mul(&self.delta))
    }

    /// Only meaningful for points on the lattice
    pub fn logic_to_pixel(&self, p: &PointNi) -> PointNi {
        PointNi(
            (0..self.pdim())
                .map(|d| (p[d] - self.logic_box.p1[d]).div_euclid(self.delta[d]))
                .collect(),
        )
    }

    /// Row-major offset of a lattice point, `None` outside
    pub fn offset_of(&self, p: &PointNi) -> Option<usize> {
        if !self.contains(p) {
            return None;
        }
        let pixel = self.logic_to_pixel(p);
        let stride = self.nsamples().stride();
        Some(
            (0..self.pdim())
                .map(|d| pixel[d] as u64 * stride[d])
                .sum::<u64>() as usize,
        )
    }

    /// Restrict to the lattice points inside `bounds`
    pub fn clip(&self, bounds: &BoxNi) -> LogicSamples {
        let pdim = self.pdim();
        let mut p1 = PointNi::zeros(pdim);
        let mut nsamples = PointNi::zeros(pdim);
        for d in 0..pdim {
            let lo = bounds.p1[d].max(self.logic_box.p1[d]);
            let hi = bounds.p2[d].min(self.logic_box.p2[d]);
            p1[d] = align_right(lo, self.logic_box.p1[d], self.delta[d]);
            nsamples[d] = if hi > p1[d] {
                (hi - p1[d] + self.delta[d] - 1) / self.delta[d]
            } else {
                0
            };
        }
        LogicSamples::from_origin(p1, &nsamples, self.delta.clone())
    }

    /// pixel -> logic as a homogeneous transform
    pub fn pixel_to_logic_matrix(&self) -> Matrix {
        let p1 = self.logic_box.p1.to_point3();
        let mut scale = [1.0; 3];
        for d in 0..self.pdim().min(3) {
            scale[d] = self.delta[d] as f64;
        }
        Matrix::translate(p1).dot(&Matrix::scale(scale))
    }
}

/// 4x4 homogeneous transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Matrix(Array2<f64>);

impl TryFrom<Vec<f64>> for Matrix {
    type Error = String;

    fn try_from(values: Vec<f64>) -> std::result::Result<Self, Self::Error> {
        Matrix::from_row_major(&values).ok_or_else(|| "matrix needs 16 values".to_string())
    }
}

impl From<Matrix> for Vec<f64> {
    fn from(m: Matrix) -> Vec<f64> {
        m.0.iter().copied().collect()
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl Matrix {
    pub fn identity() -> Self {
        Self(Array2::eye(4))
    }

    pub fn from_row_major(values: &[f64]) -> Option<Self> {
        if values.len() != 16 {
            return None;
        }
        Array2::from_shape_vec((4, 4), values.to_vec()).ok().map(Self)
    }

    pub fn translate(t: [f64; 3]) -> Self {
        Self(arr2(&[
            [1.0, 0.0, 0.0, t[0]],
            [0.0, 1.0, 0.0, t[1]],
            [0.0, 0.0, 1.0, t[2]],
            [0.0, 0.0, 0.0, 1.0],
        ]))
    }

    pub fn scale(s: [f64; 3]) -> Self {
        Self(arr2(&[
            [s[0], 0.0, 0.0, 0.0],
            [0.0, s[1], 0.0, 0.0],
            [0.0, 0.0, s[2], 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]))
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.0[[row, col]]
    }

    pub fn dot(&self, other: &Matrix) -> Matrix {
        Matrix(self.0.dot(&other.0))
    }

    pub fn is_identity(&self) -> bool {
        self.0 == Array2::<f64>::eye(4)
    }

    /// Gauss-Jordan inversion with partial pivoting
    pub fn invert(&self) -> Option<Matrix> {
        let mut a = self.0.clone();
        let mut inv: Array2<f64> = Array2::eye(4);

        for col in 0..4 {
            let pivot = (col..4)
                .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
                .unwrap_or(col);

            if a[[pivot, col]].abs() < 1e-12 {
                return None;
            }

            if pivot != col {
                for k in 0..4 {
                    a.swap([pivot, k], [col, k]);
                    inv.swap([pivot, k], [col, k]);
                }
            }

            let div = a[[col, col]];
            for k in 0..4 {
                a[[col, k]] /= div;
                inv[[col, k]] /= div;
            }

            for row in 0..4 {
                if row == col {
                    continue;
                }
                let factor = a[[row, col]];
                if factor == 0.0 {
                    continue;
                }
                for k in 0..4 {
                    a[[row, k]] -= factor * a[[col, k]];
                    inv[[row, k]] -= factor * inv[[col, k]];
                }
            }
        }

        Some(Matrix(inv))
    }

    /// Apply to a point, with perspective divide
    pub fn transform(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        let x = m[[0, 0]] * p[0] + m[[0, 1]] * p[1] + m[[0, 2]] * p[2] + m[[0, 3]];
        let y = m[[1, 0]] * p[0] + m[[1, 1]] * p[1] + m[[1, 2]] * p[2] + m[[1, 3]];
        let z = m[[2, 0]] * p[0] + m[[2, 1]] * p[1] + m[[2, 2]] * p[2] + m[[2, 3]];
        let w = m[[3, 0]] * p[0] + m[[3, 1]] * p[1] + m[[3, 2]] * p[2] + m[[3, 3]];
        if w == 0.0 || w == 1.0 {
            [x, y, z]
        } else {
            [x / w, y / w, z / w]
        }
    }

    /// Axis-aligned bounding box of a transformed integer box
    pub fn transform_box(&self, b: &BoxNi) -> BoxNi {
        let pdim = b.pdim();
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        let ncorners = 1usize << pdim.min(3);
        for corner in 0..ncorners {
            let mut p = [0.0; 3];
            for d in 0..pdim.min(3) {
                p[d] = if corner & (1 << d) != 0 {
                    b.p2[d] as f64
                } else {
                    b.p1[d] as f64
                };
            }
            let q = self.transform(p);
            for d in 0..3 {
                lo[d] = lo[d].min(q[d]);
                hi[d] = hi[d].max(q[d]);
            }
        }
        let mut p1 = PointNi::zeros(pdim);
        let mut p2 = PointNi::zeros(pdim);
        for d in 0..pdim.min(3) {
            p1[d] = lo[d].floor() as i64;
            p2[d] = hi[d].ceil() as i64;
        }
        BoxNi::new(p1, p2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(v: &[i64]) -> PointNi {
        PointNi(v.to_vec())
    }

    #[test]
    fn test_box_ops() {
        let a = BoxNi::new(p(&[0, 0]), p(&[10, 10]));
        let b = BoxNi::new(p(&[5, 8]), p(&[20, 20]));
        assert_eq!(a.intersection(&b), BoxNi::new(p(&[5, 8]), p(&[10, 10])));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&BoxNi::new(p(&[10, 0]), p(&[12, 5]))));
        assert_eq!(a.union(&b), BoxNi::new(p(&[0, 0]), p(&[20, 20])));
        assert_eq!(a.to_old_format_string(), "0 9 0 9");
        assert_eq!(BoxNi::parse_old_format(2, "0 9 0 9").unwrap(), a);
    }

    #[test]
    fn test_aligned_samples() {
        let s = LogicSamples::aligned(&BoxNi::new(p(&[1, 0]), p(&[8, 5])), p(&[2, 4]));
        assert_eq!(s.logic_box.p1, p(&[2, 0]));
        assert_eq!(s.nsamples(), p(&[3, 2]));
        assert!(s.contains(&p(&[6, 4])));
        assert!(!s.contains(&p(&[5, 4])));
        assert_eq!(s.offset_of(&p(&[4, 4])), Some(4));
    }

    #[test]
    fn test_clip_keeps_lattice() {
        let s = LogicSamples::from_origin(p(&[1, 0]), &p(&[4, 4]), p(&[2, 2]));
        let c = s.clip(&BoxNi::new(p(&[2, 0]), p(&[6, 3])));
        assert_eq!(c.logic_box.p1, p(&[3, 0]));
        assert_eq!(c.nsamples(), p(&[2, 2]));
    }

    #[test]
    fn test_matrix_invert() {
        let m = Matrix::translate([3.0, -2.0, 0.0]).dot(&Matrix::scale([2.0, 4.0, 1.0]));
        let inv = m.invert().unwrap();
        assert!(m.dot(&inv).is_identity() || {
            let q = m.dot(&inv).transform([5.0, 7.0, 0.0]);
            (q[0] - 5.0).abs() < 1e-9 && (q[1] - 7.0).abs() < 1e-9
        });
        let q = inv.transform(m.transform([1.0, 1.0, 0.0]));
        assert!((q[0] - 1.0).abs() < 1e-9 && (q[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_matrix_serde() {
        let m = Matrix::translate([1.0, 2.0, 3.0]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Matrix = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
