//! Sample buffers, lattice merges, perspective resampling and blending

use crate::error::{IdxError, Result};
use crate::geometry::{LogicSamples, Matrix, PointNi};
use crate::hzorder::HzOrder;
use crate::types::{Aborted, DType, DataType, Layout};
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

macro_rules! scalar_get {
    ($t:ty, $bytes:expr) => {{
        const N: usize = std::mem::size_of::<$t>();
        let mut raw = [0u8; N];
        raw.copy_from_slice(&$bytes[..N]);
        <$t>::from_ne_bytes(raw).to_f64().unwrap_or(0.0)
    }};
}

macro_rules! scalar_set {
    ($t:ty, $value:expr, $out:expr) => {{
        let value: f64 = $value;
        let v: $t = <$t as NumCast>::from(value).unwrap_or(if value > 0.0 {
            <$t>::MAX
        } else {
            <$t>::MIN
        });
        $out[..std::mem::size_of::<$t>()].copy_from_slice(&v.to_ne_bytes());
    }};
}

fn read_scalar(data_type: DataType, bytes: &[u8]) -> f64 {
    match data_type {
        DataType::U8 => scalar_get!(u8, bytes),
        DataType::U16 => scalar_get!(u16, bytes),
        DataType::U32 => scalar_get!(u32, bytes),
        DataType::U64 => scalar_get!(u64, bytes),
        DataType::I8 => scalar_get!(i8, bytes),
        DataType::I16 => scalar_get!(i16, bytes),
        DataType::I32 => scalar_get!(i32, bytes),
        DataType::I64 => scalar_get!(i64, bytes),
        DataType::F32 => scalar_get!(f32, bytes),
        DataType::F64 => scalar_get!(f64, bytes),
    }
}

fn write_scalar(data_type: DataType, value: f64, out: &mut [u8]) {
    let value = if data_type.is_float() {
        value
    } else {
        value.round()
    };
    match data_type {
        DataType::U8 => scalar_set!(u8, value, out),
        DataType::U16 => scalar_set!(u16, value, out),
        DataType::U32 => scalar_set!(u32, value, out),
        DataType::U64 => scalar_set!(u64, value, out),
        DataType::I8 => scalar_set!(i8, value, out),
        DataType::I16 => scalar_set!(i16, value, out),
        DataType::I32 => scalar_set!(i32, value, out),
        DataType::I64 => scalar_set!(i64, value, out),
        DataType::F32 => scalar_set!(f32, value, out),
        DataType::F64 => scalar_set!(f64, value, out),
    }
}

/// A dense buffer of samples
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub dims: PointNi,
    pub dtype: DType,
    pub layout: Layout,
    pub data: Vec<u8>,
    /// 255 where a sample holds data, 0 where nothing contributed
    pub alpha: Option<Vec<u8>>,
}

impl Array {
    /// Zero-filled row-major buffer
    pub fn new(dims: PointNi, dtype: DType) -> Self {
        let len = dtype.byte_size(dims.product());
        Self {
            dims,
            dtype,
            layout: Layout::RowMajor,
            data: vec![0u8; len],
            alpha: None,
        }
    }

    /// Buffer with every component set to `value`
    pub fn filled(dims: PointNi, dtype: DType, value: f64) -> Self {
        let mut ret = Self::new(dims, dtype);
        if value != 0.0 {
            ret.fill(value);
        }
        ret
    }

    pub fn from_bytes(dims: PointNi, dtype: DType, layout: Layout, data: Vec<u8>) -> Result<Self> {
        let expected = dtype.byte_size(dims.product());
        if data.len() != expected {
            return Err(IdxError::DTypeMismatch(format!(
                "{} bytes for {} samples of {} (expected {})",
                data.len(),
                dims.product(),
                dtype,
                expected
            )));
        }
        Ok(Self {
            dims,
            dtype,
            layout,
            data,
            alpha: None,
        })
    }

    pub fn nsamples(&self) -> u64 {
        self.dims.product()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn fill(&mut self, value: f64) {
        let width = self.dtype.data_type.size_in_bytes();
        let mut one = vec![0u8; width];
        write_scalar(self.dtype.data_type, value, &mut one);
        for chunk in self.data.chunks_exact_mut(width) {
            chunk.copy_from_slice(&one);
        }
    }

    pub fn get(&self, index: usize, component: usize) -> f64 {
        let width = self.dtype.data_type.size_in_bytes();
        let at = index * self.dtype.sample_size() + component * width;
        read_scalar(self.dtype.data_type, &self.data[at..at + width])
    }

    pub fn set(&mut self, index: usize, component: usize, value: f64) {
        let width = self.dtype.data_type.size_in_bytes();
        let at = index * self.dtype.sample_size() + component * width;
        write_scalar(self.dtype.data_type, value, &mut self.data[at..at + width]);
    }

    pub fn sample_bytes(&self, index: usize) -> &[u8] {
        let s = self.dtype.sample_size();
        &self.data[index * s..(index + 1) * s]
    }

    pub fn copy_sample(&mut self, dst_index: usize, src: &Array, src_index: usize) {
        let s = self.dtype.sample_size();
        self.data[dst_index * s..(dst_index + 1) * s].copy_from_slice(src.sample_bytes(src_index));
    }

    pub fn alpha_at(&self, index: usize) -> u8 {
        self.alpha.as_ref().map(|a| a[index]).unwrap_or(255)
    }

    /// Swap 4-byte words from big-endian to host order
    pub fn swap_float32_from_big_endian(&mut self) {
        for chunk in self.data.chunks_exact_mut(4) {
            let v = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
    }
}

fn row_major_index(pixel: &PointNi, stride: &[u64]) -> usize {
    pixel
        .0
        .iter()
        .zip(stride)
        .map(|(&p, &s)| p as u64 * s)
        .sum::<u64>() as usize
}

/// Visit every pixel of a `dims` grid in row-major order
fn for_each_pixel(dims: &PointNi, mut f: impl FnMut(usize, &PointNi) -> Result<()>) -> Result<()> {
    if dims.0.iter().any(|&d| d <= 0) {
        return Ok(());
    }
    let pdim = dims.pdim();
    let mut pixel = PointNi::zeros(pdim);
    let mut index = 0usize;
    loop {
        f(index, &pixel)?;
        index += 1;
        let mut d = 0;
        loop {
            if d == pdim {
                return Ok(());
            }
            pixel[d] += 1;
            if pixel[d] < dims[d] {
                break;
            }
            pixel[d] = 0;
            d += 1;
        }
    }
}

/// Copy every sample of `src` that also lies on the `dst` lattice.
/// Both buffers must be row-major. Returns false when nothing overlapped.
pub fn insert_samples(
    dst: &mut Array,
    dst_samples: &LogicSamples,
    src: &Array,
    src_samples: &LogicSamples,
    aborted: &Aborted,
) -> Result<bool> {
    if dst.dtype != src.dtype {
        return Err(IdxError::DTypeMismatch(format!(
            "cannot insert {} samples into {}",
            src.dtype, dst.dtype
        )));
    }
    if dst.layout != Layout::RowMajor || src.layout != Layout::RowMajor {
        return Err(IdxError::InvalidQuery(
            "insert_samples needs row-major buffers".to_string(),
        ));
    }

    let clipped = src_samples.clip(&dst_samples.logic_box);
    if !clipped.is_valid() {
        return Ok(false);
    }

    let src_stride = src_samples.nsamples().stride();
    let dst_stride = dst_samples.nsamples().stride();
    let mut any = false;
    for_each_pixel(&clipped.nsamples(), |_, pixel| {
        let p = clipped.pixel_to_logic(pixel);
        if !dst_samples.contains(&p) {
            return Ok(());
        }
        aborted.check()?;
        let si = row_major_index(&src_samples.logic_to_pixel(&p), &src_stride);
        let di = row_major_index(&dst_samples.logic_to_pixel(&p), &dst_stride);
        dst.copy_sample(di, src, si);
        if let (Some(alpha), Some(src_alpha)) = (dst.alpha.as_mut(), src.alpha.as_ref()) {
            alpha[di] = src_alpha[si];
        }
        any = true;
        Ok(())
    })?;
    Ok(any)
}

/// Reorder an hz-ordered block into its row-major lattice
pub fn block_to_row_major(
    block: &Array,
    hzorder: &HzOrder,
    blockid: u64,
    bitsperblock: u32,
) -> Result<Array> {
    if block.layout == Layout::RowMajor {
        return Ok(block.clone());
    }
    let samples = hzorder.block_samples(blockid, bitsperblock);
    let mut ret = Array::new(samples.nsamples(), block.dtype);
    let base = blockid << bitsperblock;
    for i in 0..block.nsamples() {
        let p = hzorder.point(base + i);
        let di = samples.offset_of(&p).ok_or_else(|| {
            IdxError::Decode(format!("sample {} of block {} is outside its lattice", i, blockid))
        })?;
        ret.copy_sample(di, block, i as usize);
    }
    Ok(ret)
}

/// Reorder a row-major block lattice into hz order
pub fn block_to_hz_order(
    block: &Array,
    hzorder: &HzOrder,
    blockid: u64,
    bitsperblock: u32,
) -> Result<Array> {
    if block.layout == Layout::HzOrder {
        return Ok(block.clone());
    }
    let samples = hzorder.block_samples(blockid, bitsperblock);
    let mut ret = Array::new(samples.nsamples(), block.dtype);
    ret.layout = Layout::HzOrder;
    let base = blockid << bitsperblock;
    for i in 0..block.nsamples() {
        let p = hzorder.point(base + i);
        let si = samples.offset_of(&p).ok_or_else(|| {
            IdxError::Encode(format!("sample {} of block {} is outside its lattice", i, blockid))
        })?;
        ret.copy_sample(i as usize, block, si);
    }
    Ok(ret)
}

/// Resample `src` into a `dst_dims` grid. `src_to_dst` maps src pixels to dst
/// pixels; each dst pixel takes the src sample at the floor of the inverse
/// mapping. The result carries an alpha mask of the covered pixels.
pub fn warp_perspective(
    dst_dims: &PointNi,
    src_to_dst: &Matrix,
    src: &Array,
    aborted: &Aborted,
) -> Result<Array> {
    let inverse = src_to_dst.invert().ok_or_else(|| {
        IdxError::InvalidQuery("warp transformation is not invertible".to_string())
    })?;
    let mut dst = Array::new(dst_dims.clone(), src.dtype);
    let mut alpha = vec![0u8; dst_dims.product() as usize];

    let src_stride = src.dims.stride();
    let pdim = dst_dims.pdim().min(3);
    for_each_pixel(dst_dims, |di, pixel| {
        if di % 4096 == 0 {
            aborted.check()?;
        }
        let q = inverse.transform(pixel.to_point3());
        let mut sp = PointNi::zeros(src.dims.pdim());
        for d in 0..pdim {
            let v = (q[d] + 1e-9).floor() as i64;
            if v < 0 || v >= src.dims[d] {
                return Ok(());
            }
            sp[d] = v;
        }
        let si = row_major_index(&sp, &src_stride);
        if src.alpha_at(si) == 0 {
            return Ok(());
        }
        dst.copy_sample(di, src, si);
        alpha[di] = 255;
        Ok(())
    })?;

    dst.alpha = Some(alpha);
    Ok(dst)
}

/// How overlapping children are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Last contributor wins
    #[default]
    NoBlend,
    /// Mean of the contributors
    Average,
    /// Contributor with the nearest centroid
    Voronoi,
}

/// Accumulates warped child buffers into one parent buffer
#[derive(Debug)]
pub struct BlendBuffers {
    mode: BlendMode,
    default_value: f64,
    aborted: Aborted,
    result: Option<Array>,
    sum: Vec<f64>,
    count: Vec<u32>,
    best_distance: Vec<f64>,
}

impl BlendBuffers {
    pub fn new(mode: BlendMode, aborted: Aborted) -> Self {
        Self {
            mode,
            default_value: 0.0,
            aborted,
            result: None,
            sum: Vec::new(),
            count: Vec::new(),
            best_distance: Vec::new(),
        }
    }

    /// Value of the pixels no child covers
    pub fn with_default_value(mut self, value: f64) -> Self {
        self.default_value = value;
        self
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    /// Add one child. `pixel_to_logic` maps parent pixels to parent logic
    /// coordinates; `centroid` is the child center in parent logic space.
    pub fn add_arg(&mut self, arg: &Array, pixel_to_logic: &Matrix, centroid: [f64; 3]) -> Result<()> {
        self.aborted.check()?;

        let n = arg.nsamples() as usize;
        let result = match &mut self.result {
            Some(r) => {
                if r.dims != arg.dims || r.dtype != arg.dtype {
                    return Err(IdxError::DTypeMismatch(format!(
                        "cannot blend {} {} with {} {}",
                        arg.dims, arg.dtype, r.dims, r.dtype
                    )));
                }
                r
            }
            None => {
                let mut r = Array::filled(arg.dims.clone(), arg.dtype, self.default_value);
                r.alpha = Some(vec![0u8; n]);
                self.sum = vec![0.0; n * arg.dtype.ncomponents];
                self.count = vec![0; n];
                self.best_distance = vec![f64::INFINITY; n];
                self.result.insert(r)
            }
        };

        let ncomponents = arg.dtype.ncomponents;
        let dims = arg.dims.clone();
        let mode = self.mode;
        let aborted = &self.aborted;
        let sum = &mut self.sum;
        let count = &mut self.count;
        let best_distance = &mut self.best_distance;

        for_each_pixel(&dims, |i, pixel| {
            if i % 4096 == 0 {
                aborted.check()?;
            }
            if arg.alpha_at(i) == 0 {
                return Ok(());
            }
            match mode {
                BlendMode::NoBlend => result.copy_sample(i, arg, i),
                BlendMode::Average => {
                    for c in 0..ncomponents {
                        sum[i * ncomponents + c] += arg.get(i, c);
                    }
                }
                BlendMode::Voronoi => {
                    let logic = pixel_to_logic.transform(pixel.to_point3());
                    let distance: f64 = (0..3).map(|d| (logic[d] - centroid[d]).powi(2)).sum();
                    if distance < best_distance[i] {
                        best_distance[i] = distance;
                        result.copy_sample(i, arg, i);
                    }
                }
            }
            count[i] += 1;
            if let Some(alpha) = result.alpha.as_mut() {
                alpha[i] = 255;
            }
            Ok(())
        })
    }

    /// Parent buffer, `None` when no child was added
    pub fn finish(mut self) -> Option<Array> {
        let mut result = self.result.take()?;
        if self.mode == BlendMode::Average {
            let ncomponents = result.dtype.ncomponents;
            for (i, &count) in self.count.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                for c in 0..ncomponents {
                    result.set(i, c, self.sum[i * ncomponents + c] / count as f64);
                }
            }
        }
        Some(result)
    }
}
