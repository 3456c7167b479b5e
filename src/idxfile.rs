//! `.idx` dataset descriptor

use crate::bitmask::{Bitmask, MAX_BITMASK_LEN};
use crate::error::{IdxError, Result};
use crate::filename;
use crate::geometry::{BoxNi, PointNi};
use crate::hzorder::HzOrder;
use crate::types::{DType, Field, Layout, Timesteps};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version written for new datasets
pub const DEFAULT_VERSION: u32 = 6;

/// Target uncompressed file size used when guessing `blocksperfile`
const TARGET_UNCOMPRESSED_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// Descriptor of an on-disk multiresolution dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdxFile {
    /// 0 means "not decided yet", replaced by [`DEFAULT_VERSION`] on validation
    pub version: u32,
    pub bitmask: Option<Bitmask>,
    pub logic_box: BoxNi,
    /// 0 means guess
    pub bitsperblock: u32,
    /// -1 stores every block in one file, 0 means guess
    pub blocksperfile: i64,
    pub block_interleaving: u32,
    pub filename_template: String,
    pub time_template: String,
    pub fields: Vec<Field>,
    pub timesteps: Timesteps,
}

impl Default for IdxFile {
    fn default() -> Self {
        Self {
            version: 0,
            bitmask: None,
            logic_box: BoxNi::new(PointNi::default(), PointNi::default()),
            bitsperblock: 0,
            blocksperfile: 0,
            block_interleaving: 0,
            filename_template: String::new(),
            time_template: String::new(),
            fields: Vec::new(),
            timesteps: Timesteps::single(0.0),
        }
    }
}

impl IdxFile {
    pub fn new(logic_box: BoxNi, fields: Vec<Field>) -> Self {
        Self {
            logic_box,
            fields,
            ..Default::default()
        }
    }

    pub fn with_bitmask(mut self, bitmask: Bitmask) -> Self {
        self.bitmask = Some(bitmask);
        self
    }

    pub fn with_bitsperblock(mut self, bitsperblock: u32) -> Self {
        self.bitsperblock = bitsperblock;
        self
    }

    pub fn with_blocksperfile(mut self, blocksperfile: i64) -> Self {
        self.blocksperfile = blocksperfile;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_filename_template(mut self, template: impl Into<String>) -> Self {
        self.filename_template = template.into();
        self
    }

    /// Fill in guessed values and reject inconsistent descriptors
    pub fn validate(&mut self, url: &str) -> Result<()> {
        if self.version == 0 {
            self.version = DEFAULT_VERSION;
        }
        if !(1..=6).contains(&self.version) {
            return Err(IdxError::UnsupportedVersion(self.version));
        }

        if !self.logic_box.is_full_dim() {
            return Err(IdxError::Configuration(format!(
                "wrong box '{}'",
                self.logic_box.to_old_format_string()
            )));
        }

        let bitmask = match self.bitmask.take() {
            Some(b) => b,
            None => Bitmask::guess(&self.logic_box.p2),
        };
        if !bitmask.is_valid() || bitmask.pdim() != self.logic_box.pdim() {
            return Err(IdxError::Configuration(format!(
                "invalid bitmask '{}'",
                bitmask
            )));
        }
        let maxh = bitmask.max_resolution();
        if maxh as usize >= MAX_BITMASK_LEN {
            return Err(IdxError::InvalidFormat(format!(
                "bitmask '{}' has {} levels, at most {} fit a 64-bit address",
                bitmask,
                maxh,
                MAX_BITMASK_LEN - 1
            )));
        }
        self.bitmask = Some(bitmask);

        if self.bitsperblock == 0 {
            self.bitsperblock = maxh.min(16);
        }
        if self.bitsperblock > maxh {
            tracing::warn!(
                bitsperblock = self.bitsperblock,
                max_resolution = maxh,
                "bitsperblock is greater than max resolution, clamping"
            );
            self.bitsperblock = maxh;
        }

        let totblocks = self.total_blocks() as i64;
        if self.blocksperfile == -1 {
            self.blocksperfile = totblocks;
        } else if self.blocksperfile == 0 {
            let overall_blockdim: u64 = self
                .fields
                .iter()
                .map(|f| f.dtype.byte_size(1u64 << self.bitsperblock) as u64)
                .sum();
            let guess = TARGET_UNCOMPRESSED_FILE_SIZE / overall_blockdim.max(1);
            self.blocksperfile = (guess as i64).clamp(1, totblocks.max(1));
        }
        if self.blocksperfile <= 0 {
            return Err(IdxError::Configuration(format!(
                "wrong blocksperfile {}",
                self.blocksperfile
            )));
        }

        if self.fields.is_empty() {
            return Err(IdxError::Configuration("no fields".to_string()));
        }
        for (index, field) in self.fields.iter_mut().enumerate() {
            field.index = index;
            if !field.is_valid() {
                return Err(IdxError::Configuration(format!(
                    "wrong field '{}'",
                    field.name
                )));
            }
        }

        if self.filename_template.is_empty() {
            self.filename_template =
                filename::guess_filename_template(url, maxh, self.bitsperblock);
        }
        filename::validate_template(&self.filename_template, self.version)?;
        if !self.time_template.is_empty() {
            filename::validate_time_template(&self.time_template)?;
        }

        Ok(())
    }

    pub fn bitmask(&self) -> Result<&Bitmask> {
        self.bitmask
            .as_ref()
            .ok_or_else(|| IdxError::Configuration("descriptor has no bitmask".to_string()))
    }

    pub fn hzorder(&self) -> Result<HzOrder> {
        Ok(HzOrder::new(self.bitmask()?))
    }

    pub fn max_resolution(&self) -> u32 {
        self.bitmask.as_ref().map(|b| b.max_resolution()).unwrap_or(0)
    }

    pub fn pdim(&self) -> usize {
        self.logic_box.pdim()
    }

    pub fn total_blocks(&self) -> u64 {
        let maxh = self.max_resolution();
        1u64 << maxh.saturating_sub(self.bitsperblock)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn default_field(&self) -> Option<&Field> {
        self.fields.first()
    }

    fn interleave_step(&self) -> u64 {
        self.block_interleaving.max(1) as u64
    }

    pub fn block_position_in_file(&self, blockid: u64) -> u64 {
        (blockid / self.interleave_step()) % self.blocksperfile.max(1) as u64
    }

    pub fn first_block_in_file(&self, blockid: u64) -> i64 {
        blockid as i64 - (self.interleave_step() * self.block_position_in_file(blockid)) as i64
    }

    /// Parse the text format
    pub fn parse(content: &str) -> Result<Self> {
        let mut map: HashMap<String, String> = HashMap::new();
        let mut key: Option<String> = None;
        let mut value = String::new();

        for line in content.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('(') {
                if let Some(k) = key.take() {
                    map.insert(k, value.trim().to_string());
                }
                key = Some(line.to_string());
                value.clear();
            } else {
                value.push(' ');
                value.push_str(line);
            }
        }
        if let Some(k) = key {
            map.insert(k, value.trim().to_string());
        }

        let get = |k: &str| map.get(k).map(|s| s.as_str());
        let int = |k: &str| -> Result<i64> {
            match get(k) {
                None | Some("") => Ok(0),
                Some(v) => v
                    .parse::<i64>()
                    .map_err(|_| IdxError::InvalidFormat(format!("invalid {} '{}'", k, v))),
            }
        };

        let version = int("(version)")?;
        if !(1..=6).contains(&version) {
            return Err(IdxError::UnsupportedVersion(version.max(0) as u32));
        }

        let bitmask = Bitmask::parse(get("(bits)").unwrap_or_default())?;
        let logic_box = BoxNi::parse_old_format(bitmask.pdim(), get("(box)").unwrap_or_default())?;

        let fields = match get("(fields)") {
            Some(v) => parse_fields(v)?,
            None => Vec::new(),
        };

        let block_interleaving = if map.contains_key("(interleave block)") {
            int("(interleave block)")?
        } else {
            int("(interleave)")?
        };

        let mut idxfile = IdxFile {
            version: version as u32,
            bitmask: Some(bitmask),
            logic_box,
            bitsperblock: int("(bitsperblock)")?.max(0) as u32,
            blocksperfile: int("(blocksperfile)")?,
            block_interleaving: block_interleaving.max(0) as u32,
            filename_template: get("(filename_template)").unwrap_or_default().to_string(),
            time_template: String::new(),
            fields,
            timesteps: Timesteps::single(0.0),
        };

        if let Some(time) = get("(time)") {
            idxfile.parse_time(time)?;
        }

        Ok(idxfile)
    }

    fn parse_time(&mut self, value: &str) -> Result<()> {
        let bad = || IdxError::InvalidFormat(format!("idx (time) is wrong: '{}'", value));
        let v: Vec<&str> = value.split_whitespace().collect();
        if v.len() < 2 {
            return Err(bad());
        }
        self.timesteps = Timesteps::default();

        if v[0] == "*" {
            if v.len() != 3 || v[1] != "*" {
                return Err(bad());
            }
            self.timesteps = Timesteps::star();
            self.time_template = v[2].to_string();
        } else if let Ok(from) = v[0].parse::<f64>() {
            if v.len() != 3 {
                return Err(bad());
            }
            let to: f64 = v[1].parse().map_err(|_| bad())?;
            self.timesteps.add_range(from, to, 1.0);
            self.time_template = v[2].to_string();
        } else {
            self.time_template = v[0].to_string();
            for range in &v[1..] {
                let inner = range
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(bad)?;
                let parts: Vec<f64> = inner
                    .split(',')
                    .map(|s| s.trim().parse::<f64>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| bad())?;
                let from = parts.first().copied().unwrap_or(0.0);
                let to = parts.get(1).copied().unwrap_or(from);
                let step = parts.get(2).copied().unwrap_or(1.0);
                self.timesteps.add_range(from, to, step);
            }
        }
        Ok(())
    }

    /// Serialize to the text format
    pub fn to_old_format_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("(version)\n{}\n", self.version));
        out.push_str(&format!(
            "(box)\n{}\n",
            self.logic_box.to_old_format_string()
        ));

        out.push_str("(fields)\n");
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push_str("+ ");
            }
            out.push_str(&format!("{} {} ", field.name, field.dtype));
            if !field.default_compression.is_empty() {
                if self.version < 6 {
                    out.push_str("compressed ");
                } else {
                    out.push_str(&format!(
                        "default_compression({}) ",
                        field.default_compression
                    ));
                }
            }
            let format = match field.default_layout {
                Layout::RowMajor => 1,
                Layout::HzOrder => 0,
            };
            out.push_str(&format!(
                "format({}) default_value({})\n",
                format, field.default_value
            ));
        }

        if let Some(bitmask) = &self.bitmask {
            out.push_str(&format!("(bits)\n{}\n", bitmask));
        }
        out.push_str(&format!("(bitsperblock)\n{}\n", self.bitsperblock));
        out.push_str(&format!("(blocksperfile)\n{}\n", self.blocksperfile));
        out.push_str(&format!("(interleave block)\n{}\n", self.block_interleaving));

        if !self.time_template.is_empty() {
            let t = &self.timesteps;
            if t.star {
                out.push_str(&format!("(time)\n* * {}\n", self.time_template));
            } else if t.ranges.len() == 1 && t.ranges[0].2 == 1.0 {
                out.push_str(&format!(
                    "(time)\n{} {} {}\n",
                    t.ranges[0].0, t.ranges[0].1, self.time_template
                ));
            } else {
                out.push_str(&format!("(time)\n{} ", self.time_template));
                for (a, b, step) in &t.ranges {
                    out.push_str(&format!("({},{},{}) ", a, b, step));
                }
                out.push('\n');
            }
        }

        out.push_str(&format!(
            "(filename_template)\n{}\n",
            self.filename_template
        ));
        out
    }
}

fn round_bracket_argument(s: &str, name: &str) -> Option<String> {
    let start = s.find(&format!("{}(", name))? + name.len() + 1;
    let end = s[start..].find(')')? + start;
    Some(s[start..end].trim().to_string())
}

/// `name dtype [compressed | default_compression(x)] format(0|1) default_value(v)` joined by `+`
fn parse_fields(content: &str) -> Result<Vec<Field>> {
    let mut entries = Vec::new();
    let mut nopen = 0i32;
    let mut last = String::new();
    for ch in content.chars() {
        if ch == '+' && nopen == 0 {
            if !last.trim().is_empty() {
                entries.push(last.trim().to_string());
            }
            last.clear();
            continue;
        }
        match ch {
            '(' | '[' | '{' => nopen += 1,
            ')' | ']' | '}' => nopen -= 1,
            _ => {}
        }
        last.push(ch);
    }
    if !last.trim().is_empty() {
        entries.push(last.trim().to_string());
    }

    entries
        .iter()
        .map(|entry| {
            let mut tokens = entry.split_whitespace();
            let name = tokens
                .next()
                .ok_or_else(|| IdxError::InvalidFormat(format!("invalid field '{}'", entry)))?;
            let dtype = DType::parse(tokens.next().unwrap_or_default())?;

            let compression = round_bracket_argument(entry, "default_compression")
                .or_else(|| round_bracket_argument(entry, "compressed"))
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| {
                    if entry.contains("compressed") {
                        "zip".to_string()
                    } else {
                        String::new()
                    }
                });

            let layout = round_bracket_argument(entry, "default_layout")
                .or_else(|| round_bracket_argument(entry, "format"))
                .unwrap_or_default();
            let layout = match layout.as_str() {
                "rowmajor" | "1" => Layout::RowMajor,
                "" | "hzorder" | "0" => Layout::HzOrder,
                other => {
                    tracing::warn!(layout = other, field = name, "unknown field layout, using hzorder");
                    Layout::HzOrder
                }
            };

            let default_value = round_bracket_argument(entry, "default_value")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);

            Ok(Field::new(name, dtype)
                .with_compression(compression)
                .with_layout(layout)
                .with_default_value(default_value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    const SAMPLE: &str = "(version)
6
(box)
0 511 0 511
(fields)
data uint8[3] default_compression(zip) format(0) default_value(0)
+ mask float32 format(1)
(bits)
V010101010101010101
(bitsperblock)
16
(blocksperfile)
8
(interleave block)
0
(time)
0 10 time%04d/
(filename_template)
./visus/%04x.bin
";

    #[test]
    fn test_parse() {
        let mut idx = IdxFile::parse(SAMPLE).unwrap();
        idx.validate("/data/visus.idx").unwrap();
        assert_eq!(idx.version, 6);
        assert_eq!(idx.max_resolution(), 18);
        assert_eq!(idx.logic_box.p2, PointNi(vec![512, 512]));
        assert_eq!(idx.fields.len(), 2);
        assert_eq!(idx.fields[0].dtype, DType::new(DataType::U8, 3));
        assert_eq!(idx.fields[0].default_compression, "zip");
        assert_eq!(idx.fields[1].default_layout, Layout::RowMajor);
        assert_eq!(idx.fields[1].index, 1);
        assert_eq!(idx.time_template, "time%04d/");
        assert!(idx.timesteps.contains(7.0));
        assert_eq!(idx.total_blocks(), 4);
    }

    #[test]
    fn test_text_round_trip() {
        let mut idx = IdxFile::parse(SAMPLE).unwrap();
        idx.validate("/data/visus.idx").unwrap();
        let again = IdxFile::parse(&idx.to_old_format_string()).unwrap();
        assert_eq!(again.fields, idx.fields.iter().cloned().map(|mut f| {
            f.index = 0;
            f
        }).collect::<Vec<_>>());
        assert_eq!(again.bitmask, idx.bitmask);
        assert_eq!(again.timesteps, idx.timesteps);
        assert_eq!(again.filename_template, idx.filename_template);
    }

    #[test]
    fn test_time_formats() {
        let mut idx = IdxFile::default();
        idx.parse_time("* * t%d/").unwrap();
        assert!(idx.timesteps.star);
        idx.parse_time("t%d/ (0,4,2) (10,12)").unwrap();
        assert!(idx.timesteps.contains(2.0));
        assert!(idx.timesteps.contains(11.0));
        assert!(!idx.timesteps.contains(3.0));
        assert!(idx.parse_time("* t%d/").is_err());
    }

    #[test]
    fn test_validate_guesses() {
        let field = Field::new("data", DType::scalar(DataType::F32));
        let mut idx = IdxFile::new(BoxNi::from_dims(&PointNi(vec![1000, 500])), vec![field]);
        idx.validate("/tmp/volume.idx").unwrap();
        assert_eq!(idx.version, 6);
        assert_eq!(idx.bitmask().unwrap().pow2_dims(), &PointNi(vec![1024, 512]));
        assert_eq!(idx.bitsperblock, 16);
        assert_eq!(idx.blocksperfile, 8);
        assert_eq!(idx.filename_template, "./volume/%04x.bin");
    }

    #[test]
    fn test_validate_rejects() {
        let field = Field::new("data", DType::scalar(DataType::U8));
        let mut idx = IdxFile::new(BoxNi::from_dims(&PointNi(vec![16])), vec![field.clone()])
            .with_filename_template("./x/%x.bin");
        assert!(matches!(
            idx.validate("/tmp/x.idx"),
            Err(IdxError::Configuration(_))
        ));

        let mut idx = IdxFile::new(BoxNi::from_dims(&PointNi(vec![16])), vec![]);
        assert!(idx.validate("/tmp/x.idx").is_err());

        let mut idx = IdxFile::new(BoxNi::from_dims(&PointNi(vec![16])), vec![field])
            .with_blocksperfile(-1)
            .with_bitsperblock(2);
        idx.validate("/tmp/x.idx").unwrap();
        assert_eq!(idx.blocksperfile, 4);
    }

    #[test]
    fn test_oversized_bitmask_rejected() {
        let text = SAMPLE.replace("V010101010101010101", &format!("V{}", "01".repeat(32)));
        assert!(matches!(IdxFile::parse(&text), Err(IdxError::InvalidFormat(_))));

        // no 64-bit HZ address covers 2^80 samples
        let field = Field::new("data", DType::scalar(DataType::U8));
        let dims = PointNi(vec![1 << 40, 1 << 40]);
        let mut idx = IdxFile::new(BoxNi::from_dims(&dims), vec![field]);
        assert!(idx.validate("/tmp/huge.idx").is_err());
        assert!(idx.hzorder().is_err());
    }

    #[test]
    fn test_block_position_in_file() {
        let field = Field::new("data", DType::scalar(DataType::U8));
        let mut idx = IdxFile::new(BoxNi::from_dims(&PointNi(vec![1024])), vec![field])
            .with_bitsperblock(6)
            .with_blocksperfile(4);
        idx.validate("/tmp/x.idx").unwrap();
        assert_eq!(idx.block_position_in_file(5), 1);
        assert_eq!(idx.first_block_in_file(5), 4);
        assert_eq!(idx.first_block_in_file(3), 0);
    }
}
