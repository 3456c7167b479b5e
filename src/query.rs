//! Block and region queries and the resolution state machine

use crate::array::Array;
use crate::error::{IdxError, Result};
use crate::geometry::{BoxNi, LogicSamples};
use crate::hzorder::HzOrder;
use crate::multi::DownQuery;
use crate::types::{Aborted, Field};
use std::collections::BTreeMap;
use std::fmt;

/// Read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Read,
    Write,
}

/// A request for exactly one block
#[derive(Debug, Clone)]
pub struct BlockQuery {
    pub field: Field,
    pub time: f64,
    pub blockid: u64,
    pub start_address: u64,
    pub end_address: u64,
    pub aborted: Aborted,
    /// Payload for writes
    pub buffer: Option<Array>,
}

impl BlockQuery {
    pub fn new(field: Field, time: f64, blockid: u64, bitsperblock: u32, aborted: Aborted) -> Self {
        let start_address = blockid << bitsperblock;
        Self {
            field,
            time,
            blockid,
            start_address,
            end_address: start_address + (1u64 << bitsperblock),
            aborted,
            buffer: None,
        }
    }

    pub fn with_buffer(mut self, buffer: Array) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn bitsperblock(&self) -> u32 {
        (self.end_address - self.start_address).trailing_zeros()
    }

    pub fn samples_count(&self) -> u64 {
        self.end_address - self.start_address
    }

    pub fn logic_samples(&self, hzorder: &HzOrder) -> LogicSamples {
        hzorder.block_samples(self.blockid, self.bitsperblock())
    }
}

/// How intermediate resolutions are chosen between start and end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progression {
    /// One dimension's worth of levels per step
    #[default]
    Guess,
    /// Only the end resolutions
    None,
    Step(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Created,
    Running,
    Completed,
    Failed(String),
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Completed | QueryStatus::Failed(_))
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Created => write!(f, "created"),
            QueryStatus::Running => write!(f, "running"),
            QueryStatus::Completed => write!(f, "completed"),
            QueryStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A region query refined level by level
#[derive(Debug, Clone)]
pub struct BoxQuery {
    pub mode: QueryMode,
    pub logic_box: BoxNi,
    pub field: Field,
    pub time: f64,
    pub start_resolution: u32,
    /// Empty means the dataset's max resolution
    pub end_resolutions: Vec<u32>,
    pub progression: Progression,
    pub aborted: Aborted,
    /// Result for reads, payload for writes
    pub buffer: Option<Array>,
    /// Lattice of `buffer`
    pub samples: Option<LogicSamples>,
    status: QueryStatus,
    schedule: Vec<u32>,
    cursor: usize,
    cur_resolution: Option<u32>,
    pub(crate) down_queries: BTreeMap<String, DownQuery>,
}

impl BoxQuery {
    pub fn new(mode: QueryMode, logic_box: BoxNi, field: Field, time: f64, aborted: Aborted) -> Self {
        Self {
            mode,
            logic_box,
            field,
            time,
            start_resolution: 0,
            end_resolutions: Vec::new(),
            progression: Progression::Guess,
            aborted,
            buffer: None,
            samples: None,
            status: QueryStatus::Created,
            schedule: Vec::new(),
            cursor: 0,
            cur_resolution: None,
            down_queries: BTreeMap::new(),
        }
    }

    pub fn read(logic_box: BoxNi, field: Field, time: f64) -> Self {
        Self::new(QueryMode::Read, logic_box, field, time, Aborted::new())
    }

    pub fn write(logic_box: BoxNi, field: Field, time: f64, buffer: Array) -> Self {
        let mut ret = Self::new(QueryMode::Write, logic_box, field, time, Aborted::new());
        ret.buffer = Some(buffer);
        ret.progression = Progression::None;
        ret
    }

    pub fn with_resolution_range(mut self, start: u32, end: u32) -> Self {
        self.start_resolution = start;
        self.end_resolutions = vec![end];
        self
    }

    pub fn with_end_resolutions(mut self, end_resolutions: Vec<u32>) -> Self {
        self.end_resolutions = end_resolutions;
        self
    }

    pub fn with_progression(mut self, progression: Progression) -> Self {
        self.progression = progression;
        self
    }

    pub fn with_aborted(mut self, aborted: Aborted) -> Self {
        self.aborted = aborted;
        self
    }

    pub fn status(&self) -> &QueryStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == QueryStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        self.status == QueryStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, QueryStatus::Failed(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            QueryStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Last resolution fully computed into `buffer`
    pub fn cur_resolution(&self) -> Option<u32> {
        self.cur_resolution
    }

    /// Resolution the next execute targets
    pub fn end_resolution(&self) -> Option<u32> {
        if self.status != QueryStatus::Running {
            return None;
        }
        self.schedule.get(self.cursor).copied()
    }

    pub fn schedule(&self) -> &[u32] {
        &self.schedule
    }

    pub fn can_execute(&self) -> bool {
        match self.end_resolution() {
            Some(end) => self.cur_resolution.map_or(true, |cur| cur < end),
            None => false,
        }
    }

    pub fn can_advance(&self) -> bool {
        self.end_resolution().is_some() && self.cur_resolution == self.end_resolution()
    }

    /// `from_exclusive` bound for the blocks of the next execute
    pub(crate) fn read_from_exclusive(&self) -> Option<u32> {
        match self.cur_resolution {
            Some(cur) => Some(cur),
            None => self.start_resolution.checked_sub(1),
        }
    }

    /// Moves a created query to Running. Failures are recorded in the status.
    pub(crate) fn start(&mut self, max_resolution: u32, pdim: usize) {
        if self.status != QueryStatus::Created {
            return;
        }
        match self.build_schedule(max_resolution, pdim) {
            Ok(schedule) => {
                self.schedule = schedule;
                self.cursor = 0;
                self.cur_resolution = None;
                self.status = QueryStatus::Running;
            }
            Err(e) => self.fail(&e),
        }
    }

    fn build_schedule(&self, max_resolution: u32, pdim: usize) -> Result<Vec<u32>> {
        self.aborted.check()?;
        if !self.field.is_valid() {
            return Err(IdxError::InvalidQuery("field not valid".to_string()));
        }
        if !self.logic_box.is_full_dim() {
            return Err(IdxError::InvalidQuery(format!(
                "logic box {} is empty",
                self.logic_box.to_old_format_string()
            )));
        }
        if self.mode == QueryMode::Write && self.buffer.is_none() {
            return Err(IdxError::InvalidQuery("write buffer not set".to_string()));
        }

        let mut ends = if self.end_resolutions.is_empty() {
            vec![max_resolution]
        } else {
            self.end_resolutions.clone()
        };
        if let Some(&bad) = ends.iter().find(|&&h| h > max_resolution) {
            return Err(IdxError::InvalidQuery(format!(
                "wrong end resolution {} (max {})",
                bad, max_resolution
            )));
        }
        ends.sort_unstable();
        ends.dedup();

        if self.start_resolution > 0 && (ends.len() != 1 || ends[0] < self.start_resolution) {
            return Err(IdxError::InvalidQuery(format!(
                "wrong start resolution {}",
                self.start_resolution
            )));
        }

        let step = match self.progression {
            Progression::None => return Ok(ends),
            Progression::Guess => pdim.max(1) as u32,
            Progression::Step(n) => n.max(1),
        };

        let mut schedule = Vec::new();
        let mut h = self.start_resolution;
        for end in ends {
            while h < end {
                schedule.push(h);
                h += step;
            }
            schedule.push(end);
            h = end + step;
        }
        Ok(schedule)
    }

    /// Record a successful execute of the current level
    pub(crate) fn set_current_level_ready(&mut self) {
        if let Some(end) = self.end_resolution() {
            self.cur_resolution = Some(end);
        }
    }

    pub(crate) fn fail(&mut self, error: &IdxError) {
        if self.status.is_terminal() {
            return;
        }
        let reason = if error.is_aborted() || self.aborted.is_set() {
            "aborted".to_string()
        } else {
            error.to_string()
        };
        self.cursor = self.schedule.len();
        self.status = QueryStatus::Failed(reason);
    }

    /// Step to the next level. Returns false when the query is finished.
    /// Previously fetched samples are carried into the new buffer.
    pub(crate) fn step(&mut self, max_resolution: u32, hzorder: Option<&HzOrder>) -> bool {
        if !self.can_advance() {
            return false;
        }
        if self.cursor + 1 >= self.schedule.len() {
            self.cursor = self.schedule.len();
            self.status = QueryStatus::Completed;
            return false;
        }
        if let Err(e) = self.aborted.check() {
            self.fail(&e);
            return false;
        }
        self.cursor += 1;

        if self.mode == QueryMode::Write {
            return true;
        }

        let previous = self.buffer.take().zip(self.samples.take());
        let (Some(hzorder), Some((prev_buffer, prev_samples))) = (hzorder, previous) else {
            return true;
        };
        let next = self.end_resolution().unwrap_or(max_resolution);
        let samples = hzorder.level_samples(&self.logic_box, next);
        let mut buffer = Array::filled(samples.nsamples(), self.field.dtype, self.field.default_value);
        match crate::array::insert_samples(&mut buffer, &samples, &prev_buffer, &prev_samples, &self.aborted) {
            Ok(_) => {
                self.buffer = Some(buffer);
                self.samples = Some(samples);
                true
            }
            Err(e) => {
                self.fail(&e);
                false
            }
        }
    }

    /// Make sure `buffer` matches the lattice of the current end resolution
    pub(crate) fn allocate_buffer(&mut self, hzorder: &HzOrder) -> Result<()> {
        let end = self
            .end_resolution()
            .ok_or_else(|| IdxError::InvalidQuery(format!("query is {}", self.status)))?;
        let samples = hzorder.level_samples(&self.logic_box, end);
        if !samples.is_valid() {
            return Err(IdxError::InvalidQuery(format!(
                "no samples of level {} inside {}",
                end,
                self.logic_box.to_old_format_string()
            )));
        }
        let keep = matches!((&self.buffer, &self.samples), (Some(b), Some(s)) if *s == samples && b.dims == samples.nsamples());
        if !keep {
            if self.mode == QueryMode::Write {
                let buffer = self
                    .buffer
                    .as_ref()
                    .ok_or_else(|| IdxError::InvalidQuery("write buffer not set".to_string()))?;
                if buffer.dims != samples.nsamples() || buffer.dtype != self.field.dtype {
                    return Err(IdxError::DTypeMismatch(format!(
                        "write buffer is {} {}, level {} needs {} {}",
                        buffer.dims,
                        buffer.dtype,
                        end,
                        samples.nsamples(),
                        self.field.dtype
                    )));
                }
            } else {
                self.buffer = Some(Array::filled(
                    samples.nsamples(),
                    self.field.dtype,
                    self.field.default_value,
                ));
            }
            self.samples = Some(samples);
        }
        Ok(())
    }

    /// Move a computed result in from a child or remote source
    pub(crate) fn set_result(&mut self, buffer: Array, samples: LogicSamples) {
        self.buffer = Some(buffer);
        self.samples = Some(samples);
        self.set_current_level_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::Bitmask;
    use crate::geometry::PointNi;
    use crate::types::{DType, DataType};

    fn query() -> BoxQuery {
        let field = Field::new("data", DType::scalar(DataType::U8));
        BoxQuery::read(BoxNi::from_dims(&PointNi(vec![4, 4])), field, 0.0)
    }

    #[test]
    fn test_block_query_range() {
        let field = Field::new("data", DType::scalar(DataType::U8));
        let q = BlockQuery::new(field, 0.0, 3, 6, Aborted::new());
        assert_eq!(q.start_address, 192);
        assert_eq!(q.end_address, 256);
        assert_eq!(q.samples_count(), 64);
        assert_eq!(q.bitsperblock(), 6);
    }

    #[test]
    fn test_guess_schedule() {
        let mut q = query();
        q.start(4, 2);
        assert_eq!(q.schedule(), &[0, 2, 4]);
        assert!(q.is_running());
        assert!(q.can_execute());
        assert!(!q.can_advance());
    }

    #[test]
    fn test_other_schedules() {
        let mut q = query().with_end_resolutions(vec![4, 2]).with_progression(Progression::None);
        q.start(4, 2);
        assert_eq!(q.schedule(), &[2, 4]);

        let mut q = query().with_progression(Progression::Step(3));
        q.start(4, 2);
        assert_eq!(q.schedule(), &[0, 3, 4]);

        let mut q = query().with_resolution_range(3, 3);
        q.start(4, 2);
        assert_eq!(q.schedule(), &[3]);
        assert_eq!(q.read_from_exclusive(), Some(2));
    }

    #[test]
    fn test_begin_failures() {
        let mut q = query().with_end_resolutions(vec![9]);
        q.start(4, 2);
        assert!(q.is_failed());
        assert!(q.error_message().unwrap().contains("wrong end resolution"));

        let mut q = query();
        q.aborted.abort();
        q.start(4, 2);
        assert_eq!(q.error_message(), Some("aborted"));
    }

    #[test]
    fn test_lifecycle_carries_samples() {
        let hz = HzOrder::new(&Bitmask::parse("V0101").unwrap());
        let mut q = query();
        q.start(4, 2);

        q.allocate_buffer(&hz).unwrap();
        assert_eq!(q.buffer.as_ref().unwrap().dims, PointNi(vec![1, 1]));
        q.buffer.as_mut().unwrap().set(0, 0, 42.0);
        q.set_current_level_ready();
        assert_eq!(q.cur_resolution(), Some(0));

        assert!(q.step(4, Some(&hz)));
        assert_eq!(q.end_resolution(), Some(2));
        let buffer = q.buffer.as_ref().unwrap();
        assert_eq!(buffer.dims, PointNi(vec![2, 2]));
        assert_eq!(buffer.get(0, 0), 42.0);

        q.set_current_level_ready();
        assert!(q.step(4, Some(&hz)));
        q.set_current_level_ready();
        assert!(!q.step(4, Some(&hz)));
        assert!(q.is_completed());

        // terminal queries ignore further transitions
        q.fail(&IdxError::Aborted);
        assert!(q.is_completed());
    }
}
