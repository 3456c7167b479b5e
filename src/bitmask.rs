//! Bit-interleaving patterns (`V0101...`) describing how coordinates are split across levels

use crate::error::{IdxError, Result};
use crate::geometry::{BoxNi, PointNi};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on the expanded length of a `{..}*` repeating pattern. Levels
/// are addressed with `u64`, so at most `MAX_BITMASK_LEN - 1` are usable.
pub const MAX_BITMASK_LEN: usize = 64;

/// Parsed bitmask. Position 0 is the leading `V`; positions `1..=max_resolution`
/// name the axis refined at that level, most significant first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bitmask {
    pattern: String,
    exploded: Vec<u8>,
    max_resolution: u32,
    pdim: usize,
    pow2_dims: PointNi,
}

impl TryFrom<String> for Bitmask {
    type Error = IdxError;

    fn try_from(s: String) -> Result<Self> {
        Bitmask::parse(&s)
    }
}

impl From<Bitmask> for String {
    fn from(b: Bitmask) -> String {
        b.pattern
    }
}

fn digits(s: &str, pattern: &str) -> Result<Vec<u8>> {
    s.bytes()
        .map(|c| {
            if c.is_ascii_digit() {
                Ok(c - b'0')
            } else {
                Err(IdxError::InvalidFormat(format!("invalid bitmask '{}'", pattern)))
            }
        })
        .collect()
}

impl Bitmask {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if !pattern.starts_with('V') {
            return Err(IdxError::InvalidFormat(format!(
                "bitmask '{}' must start with V",
                pattern
            )));
        }

        let (regular, repeat) = match pattern.find('{') {
            Some(a) => {
                if !pattern.ends_with("}*") {
                    return Err(IdxError::InvalidFormat(format!(
                        "invalid bitmask '{}'",
                        pattern
                    )));
                }
                (&pattern[1..a], &pattern[a + 1..pattern.len() - 2])
            }
            None => (&pattern[1..], ""),
        };

        let regular = digits(regular, pattern)?;
        let repeat = digits(repeat, pattern)?;
        if regular.len() >= MAX_BITMASK_LEN {
            return Err(IdxError::InvalidFormat(format!(
                "bitmask '{}' has {} levels, at most {} fit a 64-bit address",
                pattern,
                regular.len(),
                MAX_BITMASK_LEN - 1
            )));
        }

        let mut exploded = Vec::with_capacity(MAX_BITMASK_LEN);
        exploded.push(0u8);
        exploded.extend_from_slice(&regular);

        let pdim = regular
            .iter()
            .chain(repeat.iter())
            .map(|&b| b as usize + 1)
            .max()
            .unwrap_or(0);

        let mut pow2_dims = PointNi::ones(pdim);
        for &b in &regular {
            pow2_dims[b as usize] <<= 1;
        }

        if !repeat.is_empty() {
            let mut i = 0;
            while exploded.len() < MAX_BITMASK_LEN {
                exploded.push(repeat[i % repeat.len()]);
                i += 1;
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            exploded,
            max_resolution: regular.len() as u32,
            pdim,
            pow2_dims,
        })
    }

    /// Guess a pattern for `dims`, refining the largest axes first so the
    /// coarse levels become regular as soon as possible
    pub fn guess(dims: &PointNi) -> Self {
        let pdim = dims.pdim();
        let mut pow2: Vec<i64> = dims
            .0
            .iter()
            .map(|&d| (d.max(1) as u64).next_power_of_two() as i64)
            .collect();

        let mut ret = String::new();
        while pow2.iter().any(|&d| d > 1) {
            for d in (0..pdim).rev() {
                if pow2[d] > 1 {
                    ret.push((b'0' + d as u8) as char);
                    pow2[d] >>= 1;
                }
            }
        }
        let pattern: String = std::iter::once('V').chain(ret.chars().rev()).collect();

        // parse cannot fail on a pattern built from digits
        let mut bitmask = Self::parse(&pattern).unwrap_or_else(|_| Self::empty());
        if bitmask.pdim < pdim {
            bitmask.pdim = pdim;
            let mut p = PointNi::ones(pdim);
            for d in 0..bitmask.pow2_dims.pdim() {
                p[d] = bitmask.pow2_dims[d];
            }
            bitmask.pow2_dims = p;
        }
        bitmask
    }

    fn empty() -> Self {
        Self {
            pattern: "V".to_string(),
            exploded: vec![0],
            max_resolution: 0,
            pdim: 0,
            pow2_dims: PointNi::zeros(0),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn max_resolution(&self) -> u32 {
        self.max_resolution
    }

    pub fn pdim(&self) -> usize {
        self.pdim
    }

    /// `2^(occurrences of each axis)`
    pub fn pow2_dims(&self) -> &PointNi {
        &self.pow2_dims
    }

    pub fn pow2_box(&self) -> BoxNi {
        BoxNi::from_dims(&self.pow2_dims)
    }

    /// Axis refined at position `j` (`1..=max_resolution`)
    pub fn axis(&self, j: u32) -> usize {
        self.exploded[j as usize] as usize
    }

    /// Occurrences of `axis` in positions `[from, to]`
    pub fn count(&self, axis: usize, from: u32, to: u32) -> u32 {
        if from > to {
            return 0;
        }
        (from..=to.min(self.max_resolution))
            .filter(|&j| self.axis(j) == axis)
            .count() as u32
    }

    pub fn is_valid(&self) -> bool {
        self.pdim > 0 && self.max_resolution > 0
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}
