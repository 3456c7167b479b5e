//! Heterogeneous composition: independent children warped into one parent
//! logic space and blended
//!
//! A parent field is a blend expression naming the children it reads:
//! `voronoi()`, `averageBlend(a.data, b)`, `noBlend()` or a single input
//! `a.data`. Empty argument lists read the default field of every child.
//! Each child contributes through a down query whose result is resampled
//! onto the parent lattice before blending.

use crate::access::{Access, AccessInfo, IoMode, IoSession};
use crate::array::{insert_samples, warp_perspective, Array, BlendBuffers, BlendMode};
use crate::config::{AccessConfig, EnvOverrides};
use crate::dataset::Dataset;
use crate::error::{IdxError, Result};
use crate::geometry::{BoxNi, LogicSamples, Matrix};
use crate::hzorder::HzOrder;
use crate::idxfile::IdxFile;
use crate::lock::WriteLockGuard;
use crate::query::{BlockQuery, BoxQuery, Progression, QueryMode};
use crate::types::{Aborted, Field, Timesteps};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Children queried at the same time by one parent query
pub const FANOUT_CONCURRENCY: usize = 3;

/// Fields listed when a descriptor does not declare any
pub const DEFAULT_BLEND_FIELDS: [&str; 3] = ["voronoi()", "averageBlend()", "noBlend()"];

/// A named child and its placement in the parent logic space
#[derive(Debug, Clone)]
pub struct MultiChild {
    pub name: String,
    pub dataset: Arc<Dataset>,
    pub logic_to_parent: Matrix,
}

/// `child.field`, or the child's default field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlendInput {
    pub child: String,
    pub field: Option<String>,
}

impl BlendInput {
    fn parse(arg: &str) -> Result<Self> {
        let arg = arg.trim().trim_matches(|c| c == '\'' || c == '"');
        if arg.is_empty() {
            return Err(IdxError::Configuration("empty blend input".to_string()));
        }
        Ok(match arg.split_once('.') {
            Some((child, field)) => Self {
                child: child.to_string(),
                field: Some(field.to_string()),
            },
            None => Self {
                child: arg.to_string(),
                field: None,
            },
        })
    }
}

/// A parsed parent field expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlendField {
    pub mode: BlendMode,
    /// Empty means every child
    pub inputs: Vec<BlendInput>,
}

impl BlendField {
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        let expr = expr.strip_prefix("output=").unwrap_or(expr).trim();

        let Some((function, rest)) = expr.split_once('(') else {
            return Ok(Self {
                mode: BlendMode::NoBlend,
                inputs: vec![BlendInput::parse(expr)?],
            });
        };
        let args = rest.strip_suffix(')').ok_or_else(|| {
            IdxError::Configuration(format!("unbalanced blend expression '{}'", expression))
        })?;
        let mode = match function.trim() {
            "voronoi" | "voronoiBlend" => BlendMode::Voronoi,
            "averageBlend" => BlendMode::Average,
            "noBlend" => BlendMode::NoBlend,
            other => {
                return Err(IdxError::Configuration(format!(
                    "unknown blend function '{}'",
                    other
                )))
            }
        };
        let inputs = args
            .split(',')
            .filter(|a| !a.trim().is_empty())
            .map(BlendInput::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mode, inputs })
    }
}

/// The part of a parent query served by one child
#[derive(Debug, Clone)]
pub struct DownQuery {
    child: String,
    index: usize,
    pub query: BoxQuery,
    delta_h: i32,
    same_logic_space: bool,
    child_max_resolution: u32,
    logic_to_parent: Matrix,
    /// Child center in parent logic coordinates
    centroid: [f64; 3],
    /// Result resampled onto the parent lattice it was computed for
    warped: Option<(LogicSamples, Array)>,
}

impl DownQuery {
    pub fn child(&self) -> &str {
        &self.child
    }

    pub fn delta_h(&self) -> i32 {
        self.delta_h
    }

    pub fn centroid(&self) -> [f64; 3] {
        self.centroid
    }

    /// Resampled contribution, `None` when the child is excluded
    pub fn warped(&self) -> Option<&Array> {
        self.warped.as_ref().map(|(_, buffer)| buffer)
    }

    /// Child resolution matching a parent resolution
    fn target_resolution(&self, parent_resolution: u32) -> u32 {
        if self.same_logic_space {
            return parent_resolution.min(self.child_max_resolution);
        }
        (parent_resolution as i64 + self.delta_h as i64).clamp(0, self.child_max_resolution as i64) as u32
    }
}

/// Children blended into one logical dataset
#[derive(Debug)]
pub struct MultiDataset {
    children: Vec<MultiChild>,
    idxfile: IdxFile,
    hzorder: HzOrder,
}

impl MultiDataset {
    /// `logic_box` defaults to the union of the mapped child boxes,
    /// `fields` to the blend functions plus one field per child field.
    pub fn new(
        children: Vec<MultiChild>,
        logic_box: Option<BoxNi>,
        fields: Vec<String>,
        url: &str,
    ) -> Result<Self> {
        let first = children
            .first()
            .ok_or_else(|| IdxError::Configuration("multi dataset without children".to_string()))?;
        let pdim = first.dataset.pdim();

        let mut mapped_union: Option<BoxNi> = None;
        for (i, child) in children.iter().enumerate() {
            if children[..i].iter().any(|c| c.name == child.name) {
                return Err(IdxError::Configuration(format!("duplicate child '{}'", child.name)));
            }
            if child.dataset.pdim() != pdim {
                return Err(IdxError::Configuration(format!(
                    "child '{}' has {} dimensions, expected {}",
                    child.name,
                    child.dataset.pdim(),
                    pdim
                )));
            }
            if child.logic_to_parent.invert().is_none() {
                return Err(IdxError::Configuration(format!(
                    "transform of child '{}' is not invertible",
                    child.name
                )));
            }
            let mapped = child.logic_to_parent.transform_box(child.dataset.logic_box());
            mapped_union = Some(match mapped_union {
                Some(b) => b.union(&mapped),
                None => mapped,
            });
        }
        let logic_box = match (logic_box, mapped_union) {
            (Some(b), _) | (None, Some(b)) => b,
            (None, None) => first.dataset.logic_box().clone(),
        };
        if logic_box.p1.0.iter().any(|&v| v < 0) {
            return Err(IdxError::Configuration(format!(
                "multi dataset box {} has negative coordinates",
                logic_box.to_old_format_string()
            )));
        }

        let mut timesteps = Timesteps::default();
        for child in &children {
            let t = child.dataset.timesteps();
            timesteps.star |= t.star;
            for range in &t.ranges {
                if !timesteps.ranges.contains(range) {
                    timesteps.ranges.push(*range);
                }
            }
        }

        let hzorder = first.dataset.hzorder().clone();
        let mut ret = Self {
            idxfile: IdxFile::default(),
            hzorder,
            children,
        };

        let expressions: Vec<String> = if fields.is_empty() {
            let mut ret_fields: Vec<String> = DEFAULT_BLEND_FIELDS.iter().map(|s| s.to_string()).collect();
            for child in &ret.children {
                for field in child.dataset.fields() {
                    ret_fields.push(format!("{}.{}", child.name, field.name));
                }
            }
            ret_fields
        } else {
            fields
        };
        let fields = expressions
            .iter()
            .map(|e| ret.field_for_expression(e))
            .collect::<Result<Vec<_>>>()?;

        let mut idxfile = IdxFile::new(logic_box, fields)
            .with_bitsperblock(ret.children[0].dataset.bitsperblock());
        idxfile.timesteps = timesteps;
        if ret.children.len() == 1 {
            idxfile.time_template = ret.children[0].dataset.idxfile().time_template.clone();
        }
        idxfile.validate(url)?;
        ret.hzorder = idxfile.hzorder()?;
        ret.idxfile = idxfile;

        debug!(
            children = ret.children.len(),
            logic_box = %ret.idxfile.logic_box.to_old_format_string(),
            "multi dataset composed"
        );
        Ok(ret)
    }

    pub fn idxfile(&self) -> &IdxFile {
        &self.idxfile
    }

    pub fn children(&self) -> &[MultiChild] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&MultiChild> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Children and fields a blend expression reads, in blend order
    pub fn resolve_inputs(&self, blend: &BlendField) -> Result<Vec<(usize, Field)>> {
        if blend.inputs.is_empty() {
            return self
                .children
                .iter()
                .enumerate()
                .map(|(index, child)| {
                    let field = child.dataset.default_field().cloned().ok_or_else(|| {
                        IdxError::Configuration(format!("child '{}' has no fields", child.name))
                    })?;
                    Ok((index, field))
                })
                .collect();
        }
        blend
            .inputs
            .iter()
            .map(|input| {
                let index = self
                    .children
                    .iter()
                    .position(|c| c.name == input.child)
                    .ok_or_else(|| IdxError::Configuration(format!("unknown child '{}'", input.child)))?;
                let dataset = &self.children[index].dataset;
                let field = match &input.field {
                    Some(name) => dataset.field(name)?,
                    None => dataset.default_field().cloned().ok_or_else(|| {
                        IdxError::Configuration(format!("child '{}' has no fields", input.child))
                    })?,
                };
                Ok((index, field))
            })
            .collect()
    }

    /// Parent field for a blend expression, typed after its inputs
    pub fn field_for_expression(&self, expression: &str) -> Result<Field> {
        let blend = BlendField::parse(expression)?;
        let inputs = self.resolve_inputs(&blend)?;
        let (_, first) = inputs
            .first()
            .ok_or_else(|| IdxError::Configuration(format!("'{}' reads no child", expression)))?;
        if let Some((_, other)) = inputs.iter().find(|(_, f)| f.dtype != first.dtype) {
            return Err(IdxError::DTypeMismatch(format!(
                "'{}' blends {} with {}",
                expression, first.dtype, other.dtype
            )));
        }
        Ok(Field::new(expression, first.dtype).with_default_value(first.default_value))
    }

    fn same_logic_space(&self, child: &MultiChild) -> bool {
        child.logic_to_parent.is_identity()
            && child.dataset.logic_box() == &self.idxfile.logic_box
            && child.dataset.bitmask() == self.hzorder.bitmask()
    }

    /// `None` when the child does not overlap the parent query
    fn create_down_query(&self, index: usize, field: Field, parent: &BoxQuery) -> Option<DownQuery> {
        let child = &self.children[index];
        let dataset = &child.dataset;
        let mapped = child.logic_to_parent.transform_box(dataset.logic_box());
        if !mapped.intersects(&parent.logic_box) {
            return None;
        }

        let same_logic_space = self.same_logic_space(child);
        let (logic_box, delta_h) = if same_logic_space {
            (parent.logic_box.clone(), 0)
        } else {
            let to_child = child.logic_to_parent.invert()?;
            let logic_box = to_child
                .transform_box(&parent.logic_box.intersection(&mapped))
                .intersection(dataset.logic_box());
            let ratio = self.idxfile.logic_box.volume() / mapped.volume().max(1.0);
            (logic_box, -(ratio.log2() as i32))
        };
        if !logic_box.is_full_dim() {
            return None;
        }

        let mut down = DownQuery {
            child: child.name.clone(),
            index,
            query: BoxQuery::new(
                QueryMode::Read,
                logic_box,
                field,
                parent.time,
                parent.aborted.clone(),
            )
            .with_progression(Progression::None),
            delta_h,
            same_logic_space,
            child_max_resolution: dataset.max_resolution(),
            logic_to_parent: child.logic_to_parent.clone(),
            centroid: child.logic_to_parent.transform(dataset.logic_box().center()),
            warped: None,
        };

        let mut ends: Vec<u32> = parent.schedule().iter().map(|&h| down.target_resolution(h)).collect();
        ends.sort_unstable();
        ends.dedup();
        if parent.start_resolution > 0 && ends.len() == 1 {
            down.query.start_resolution = down.target_resolution(parent.start_resolution).min(ends[0]);
        }
        down.query.end_resolutions = ends;

        if !dataset.begin_query(&mut down.query) {
            info!(
                child = %child.name,
                reason = down.query.error_message().unwrap_or_default(),
                "child ignored"
            );
        }
        Some(down)
    }

    /// Bring every down query level with the parent's current level
    pub(crate) fn advance_down_queries(&self, query: &mut BoxQuery) {
        let Some(end) = query.end_resolution() else {
            return;
        };
        for down in query.down_queries.values_mut() {
            self.catch_up(down, end);
        }
    }

    fn catch_up(&self, down: &mut DownQuery, parent_resolution: u32) {
        let target = down.target_resolution(parent_resolution);
        let dataset = &self.children[down.index].dataset;
        while down.query.can_advance() && down.query.end_resolution().map_or(false, |h| h < target) {
            if !dataset.advance_query(&mut down.query) {
                break;
            }
        }
    }
}

struct MultiInner {
    multi: Arc<MultiDataset>,
    config: AccessConfig,
    concurrency: usize,
    /// child accesses keyed `child/field`
    down: Mutex<HashMap<String, Arc<dyn Access>>>,
}

impl MultiInner {
    fn down_access(&self, child: &MultiChild, field: &Field) -> Result<Arc<dyn Access>> {
        let key = format!("{}/{}", child.name, field.name);
        let mut down = self.down.lock();
        if let Some(access) = down.get(&key) {
            return Ok(Arc::clone(access));
        }
        let access = child.dataset.create_access(&self.config.child(&child.name))?;
        down.insert(key, Arc::clone(&access));
        Ok(access)
    }

    async fn execute(&self, query: &mut BoxQuery) -> Result<()> {
        query.aborted.check()?;
        let multi = &self.multi;
        let end = query
            .end_resolution()
            .ok_or_else(|| IdxError::InvalidQuery(format!("query is {}", query.status())))?;
        let samples = multi.hzorder.level_samples(&query.logic_box, end);
        if !samples.is_valid() {
            return Err(IdxError::InvalidQuery(format!(
                "no samples of level {} inside {}",
                end,
                query.logic_box.to_old_format_string()
            )));
        }

        let blend = BlendField::parse(&query.field.name)?;
        let mut keys = Vec::new();
        for (index, field) in multi.resolve_inputs(&blend)? {
            let key = format!("{}/{}", multi.children[index].name, field.name);
            if !query.down_queries.contains_key(&key) {
                match multi.create_down_query(index, field, query) {
                    Some(down) => {
                        query.down_queries.insert(key.clone(), down);
                    }
                    None => continue,
                }
            }
            keys.push(key);
        }

        let aborted = query.aborted.clone();
        let mut tasks: Vec<BoxFuture<'_, Result<()>>> = Vec::with_capacity(keys.len());
        for (key, down) in query.down_queries.iter_mut() {
            if keys.contains(key) {
                tasks.push(self.run_down_query(down, &samples, end, &aborted).boxed());
            }
        }
        let results: Vec<Result<()>> = stream::iter(tasks)
            .buffered(self.concurrency.max(1))
            .collect()
            .await;

        // partial data does not survive a cancellation
        aborted.check()?;
        for result in results {
            result?;
        }

        let mut blend_buffers = BlendBuffers::new(blend.mode, aborted.clone())
            .with_default_value(query.field.default_value);
        let pixel_to_logic = samples.pixel_to_logic_matrix();
        let mut contributors = 0;
        for key in &keys {
            if let Some((_, warped)) = query.down_queries.get(key).and_then(|d| d.warped.as_ref()) {
                blend_buffers.add_arg(warped, &pixel_to_logic, query.down_queries[key].centroid)?;
                contributors += 1;
            }
        }
        let result = blend_buffers
            .finish()
            .ok_or_else(|| IdxError::NoContribution(query.field.name.clone()))?;
        debug!(field = %query.field.name, level = end, contributors, "children blended");
        query.set_result(result, samples);
        Ok(())
    }

    /// Only cancellation is an error; any other failure excludes the child
    async fn run_down_query(
        &self,
        down: &mut DownQuery,
        samples: &LogicSamples,
        parent_resolution: u32,
        aborted: &Aborted,
    ) -> Result<()> {
        aborted.check()?;
        if down.query.is_failed() {
            return Ok(());
        }
        let child = &self.multi.children[down.index];
        self.multi.catch_up(down, parent_resolution);

        if down.query.can_execute() {
            down.warped = None;
            let access = match self.down_access(child, &down.query.field) {
                Ok(access) => access,
                Err(e) => {
                    warn!(child = %child.name, error = %e, "cannot create child access");
                    down.query.fail(&e);
                    return Ok(());
                }
            };
            if !child.dataset.execute_query(&access, &mut down.query).await {
                aborted.check()?;
                debug!(
                    child = %child.name,
                    reason = down.query.error_message().unwrap_or_default(),
                    "child excluded"
                );
                return Ok(());
            }
        }

        if matches!(&down.warped, Some((cached, _)) if cached == samples) {
            return Ok(());
        }
        let (Some(buffer), Some(child_samples)) = (&down.query.buffer, &down.query.samples) else {
            return Ok(());
        };
        let Some(logic_to_pixel) = samples.pixel_to_logic_matrix().invert() else {
            return Ok(());
        };
        let src_to_dst = logic_to_pixel
            .dot(&down.logic_to_parent)
            .dot(&child_samples.pixel_to_logic_matrix());
        match warp_perspective(&samples.nsamples(), &src_to_dst, buffer, aborted) {
            Ok(warped) => down.warped = Some((samples.clone(), warped)),
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) => {
                warn!(child = %child.name, error = %e, "cannot resample child");
                down.warped = None;
            }
        }
        Ok(())
    }

    /// A parent block is the parent box query over its lattice
    async fn read_block(&self, query: BlockQuery) -> Result<Array> {
        let hzorder = &self.multi.hzorder;
        let bitsperblock = query.bitsperblock();
        let block_samples = hzorder.block_samples(query.blockid, bitsperblock);
        let level = HzOrder::block_level(query.blockid, bitsperblock).min(hzorder.max_resolution());

        let mut box_query = BoxQuery::new(
            QueryMode::Read,
            block_samples.logic_box.clone(),
            query.field.clone(),
            query.time,
            query.aborted.clone(),
        )
        .with_end_resolutions(vec![level])
        .with_progression(Progression::None);
        box_query.start(hzorder.max_resolution(), hzorder.pdim());
        if let Some(reason) = box_query.error_message() {
            return Err(IdxError::InvalidQuery(reason.to_string()));
        }
        self.execute(&mut box_query).await?;

        let mut block = Array::filled(
            block_samples.nsamples(),
            query.field.dtype,
            query.field.default_value,
        );
        if let (Some(buffer), Some(samples)) = (&box_query.buffer, &box_query.samples) {
            insert_samples(&mut block, &block_samples, buffer, samples, &query.aborted)?;
        }
        Ok(block)
    }
}

/// Read-only access blending the children of a multi dataset
pub struct MultiAccess {
    info: AccessInfo,
    session: IoSession,
    inner: Arc<MultiInner>,
}

impl std::fmt::Debug for MultiAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiAccess")
            .field("info", &self.info)
            .field("concurrency", &self.inner.concurrency)
            .finish()
    }
}

impl MultiAccess {
    pub fn new(multi: Arc<MultiDataset>, config: &AccessConfig, env: &EnvOverrides) -> Self {
        let disable_async = env.disable_async.unwrap_or(config.is_async_disabled());
        let info = AccessInfo {
            name: config.name_or("MultiAccess").to_string(),
            can_read: config.can_read(),
            can_write: false,
            bitsperblock: multi.idxfile.bitsperblock,
        };
        Self {
            info,
            session: IoSession::default(),
            inner: Arc::new(MultiInner {
                multi,
                config: config.clone(),
                concurrency: if disable_async { 0 } else { FANOUT_CONCURRENCY },
                down: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Children queried at once, 0 when they run one after the other
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Compute the current level of a parent region query
    pub async fn execute(&self, query: &mut BoxQuery) -> Result<()> {
        self.inner.execute(query).await
    }
}

#[async_trait]
impl Access for MultiAccess {
    fn info(&self) -> &AccessInfo {
        &self.info
    }

    fn io_mode(&self) -> Option<IoMode> {
        self.session.mode()
    }

    async fn begin_io(&self, mode: IoMode) -> Result<()> {
        self.session.begin(&self.info, mode)
    }

    async fn end_io(&self) -> Result<()> {
        let opened: Vec<Arc<dyn Access>> = self.inner.down.lock().values().cloned().collect();
        let mut result = Ok(());
        for access in opened {
            if access.io_mode().is_some() {
                let closed = access.end_io().await;
                if result.is_ok() {
                    result = closed;
                }
            }
        }
        self.session.end();
        result
    }

    fn read_block(&self, query: BlockQuery) -> BoxFuture<'static, Result<Array>> {
        if let Err(e) = self.session.require(&self.info, None) {
            return future::ready(Err(e)).boxed();
        }
        let inner = Arc::clone(&self.inner);
        async move { inner.read_block(query).await }.boxed()
    }

    async fn write_block(&self, _query: BlockQuery) -> Result<()> {
        Err(IdxError::Unsupported("multi datasets are read only".to_string()))
    }

    async fn acquire_write_lock(&self, _query: &BlockQuery) -> Result<Option<WriteLockGuard>> {
        Ok(None)
    }

    fn filename(&self, _field: &Field, _time: f64, _blockid: u64) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetContext;
    use crate::geometry::PointNi;
    use crate::types::{DType, DataType};
    use tempfile::TempDir;

    #[test]
    fn test_parse_blend_fields() {
        let f = BlendField::parse("voronoi()").unwrap();
        assert_eq!(f.mode, BlendMode::Voronoi);
        assert!(f.inputs.is_empty());

        let f = BlendField::parse("output=averageBlend(a.data, 'b')").unwrap();
        assert_eq!(f.mode, BlendMode::Average);
        assert_eq!(
            f.inputs,
            vec![
                BlendInput {
                    child: "a".to_string(),
                    field: Some("data".to_string())
                },
                BlendInput {
                    child: "b".to_string(),
                    field: None
                },
            ]
        );

        let f = BlendField::parse("a.data").unwrap();
        assert_eq!(f.mode, BlendMode::NoBlend);
        assert_eq!(f.inputs.len(), 1);

        assert!(BlendField::parse("median(a)").is_err());
        assert!(BlendField::parse("noBlend(a").is_err());
    }

    async fn child(dir: &TempDir, name: &str, value: f64, timesteps: Option<Timesteps>) -> Arc<Dataset> {
        let field = Field::new("data", DType::scalar(DataType::U8));
        let mut idxfile = IdxFile::new(BoxNi::from_dims(&PointNi(vec![8, 8])), vec![field]);
        if let Some(t) = timesteps {
            idxfile.timesteps = t;
        }
        let dataset = Dataset::create(
            dir.path().join(format!("{}.idx", name)),
            idxfile,
            DatasetContext::new(EnvOverrides::default()),
        )
        .await
        .unwrap();
        let access = dataset.create_access(&AccessConfig::default()).unwrap();
        let data = Array::filled(PointNi(vec![8, 8]), DType::scalar(DataType::U8), value);
        dataset
            .write_box(&access, dataset.logic_box().clone(), "data", data)
            .await
            .unwrap();
        dataset
    }

    fn compose(children: Vec<(Arc<Dataset>, &str, Matrix)>) -> Dataset {
        let children = children
            .into_iter()
            .map(|(dataset, name, logic_to_parent)| MultiChild {
                name: name.to_string(),
                dataset,
                logic_to_parent,
            })
            .collect();
        let multi = MultiDataset::new(children, None, Vec::new(), "multi.midx").unwrap();
        Dataset::from_multi("multi.midx", multi, DatasetContext::new(EnvOverrides::default())).unwrap()
    }

    async fn read_full(dataset: &Dataset, field: &str) -> Result<Array> {
        let access = dataset.create_access(&AccessConfig::default()).unwrap();
        let (buffer, _) = dataset
            .read_box(&access, dataset.logic_box().clone(), field, None)
            .await?;
        Ok(buffer)
    }

    #[tokio::test]
    async fn test_side_by_side_children() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 10.0, None).await;
        let b = child(&dir, "b", 20.0, None).await;
        let dataset = compose(vec![
            (a, "a", Matrix::identity()),
            (b, "b", Matrix::translate([8.0, 0.0, 0.0])),
        ]);
        assert_eq!(dataset.logic_box(), &BoxNi::from_dims(&PointNi(vec![16, 8])));
        assert_eq!(dataset.default_field().unwrap().name, "voronoi()");
        assert!(dataset.fields().iter().any(|f| f.name == "b.data"));

        let buffer = read_full(&dataset, "averageBlend()").await.unwrap();
        assert_eq!(buffer.dims, PointNi(vec![16, 8]));
        for y in 0..8 {
            for x in 0..16 {
                let expected = if x < 8 { 10.0 } else { 20.0 };
                assert_eq!(buffer.get(y * 16 + x, 0), expected);
            }
        }

        let only_b = read_full(&dataset, "b.data").await.unwrap();
        assert_eq!(only_b.get(0, 0), 0.0);
        assert_eq!(only_b.alpha_at(0), 0);
        assert_eq!(only_b.get(15, 0), 20.0);
    }

    #[tokio::test]
    async fn test_overlapping_children_blend_modes() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 10.0, None).await;
        let b = child(&dir, "b", 30.0, None).await;
        let dataset = compose(vec![(a, "a", Matrix::identity()), (b, "b", Matrix::identity())]);

        assert_eq!(read_full(&dataset, "averageBlend()").await.unwrap().get(5, 0), 20.0);
        assert_eq!(read_full(&dataset, "noBlend()").await.unwrap().get(5, 0), 30.0);
        assert_eq!(read_full(&dataset, "noBlend(b, a)").await.unwrap().get(5, 0), 10.0);
        // equal centroids: the first child keeps the sample
        assert_eq!(read_full(&dataset, "voronoi()").await.unwrap().get(5, 0), 10.0);
    }

    #[tokio::test]
    async fn test_missing_timestep_excludes_child() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 10.0, None).await;
        let mut later = Timesteps::single(0.0);
        later.add_range(1.0, 1.0, 1.0);
        let b = child(&dir, "b", 30.0, Some(later)).await;
        let dataset = compose(vec![(a, "a", Matrix::identity()), (b, "b", Matrix::identity())]);
        let access = dataset.create_access(&AccessConfig::default().with_disable_async(true)).unwrap();

        let mut query = dataset
            .create_box_query(dataset.logic_box().clone(), "averageBlend()", QueryMode::Read)
            .unwrap()
            .with_progression(Progression::None);
        query.time = 1.0;
        assert!(dataset.begin_query(&mut query));
        assert!(dataset.execute_query(&access, &mut query).await);
        assert!(query.down_queries["a/data"].query.is_failed());
        assert!(query.down_queries["b/data"].warped().is_some());

        // without a time template both timesteps share the block files
        assert_eq!(query.buffer.as_ref().unwrap().get(0, 0), 30.0);
    }

    /// Child access that cancels the parent query once its session ends
    struct AbortOnEndIo {
        inner: Arc<dyn Access>,
        aborted: Aborted,
    }

    #[async_trait]
    impl Access for AbortOnEndIo {
        fn info(&self) -> &AccessInfo {
            self.inner.info()
        }

        fn io_mode(&self) -> Option<IoMode> {
            self.inner.io_mode()
        }

        async fn begin_io(&self, mode: IoMode) -> Result<()> {
            self.inner.begin_io(mode).await
        }

        async fn end_io(&self) -> Result<()> {
            let result = self.inner.end_io().await;
            self.aborted.abort();
            result
        }

        fn read_block(&self, query: BlockQuery) -> BoxFuture<'static, Result<Array>> {
            self.inner.read_block(query)
        }

        async fn write_block(&self, query: BlockQuery) -> Result<()> {
            self.inner.write_block(query).await
        }

        async fn acquire_write_lock(&self, query: &BlockQuery) -> Result<Option<WriteLockGuard>> {
            self.inner.acquire_write_lock(query).await
        }

        fn filename(&self, field: &Field, time: f64, blockid: u64) -> Option<String> {
            self.inner.filename(field, time, blockid)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// The first child completes, then the abort lands before blending
    #[tokio::test]
    async fn test_abort_between_children_blends_nothing() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 10.0, None).await;
        let b = child(&dir, "b", 30.0, None).await;
        let c = child(&dir, "c", 50.0, None).await;
        let dataset = compose(vec![
            (a, "a", Matrix::identity()),
            (b, "b", Matrix::identity()),
            (c, "c", Matrix::identity()),
        ]);
        let access = dataset
            .create_access(&AccessConfig::default().with_disable_async(true))
            .unwrap();
        let multi_access = access.as_any().downcast_ref::<MultiAccess>().unwrap();
        assert_eq!(multi_access.concurrency(), 0);

        let aborted = Aborted::new();
        let inner = &multi_access.inner;
        for child in &inner.multi.children {
            let child_access = child.dataset.create_access(&AccessConfig::default()).unwrap();
            let wrapped: Arc<dyn Access> = Arc::new(AbortOnEndIo {
                inner: child_access,
                aborted: aborted.clone(),
            });
            inner.down.lock().insert(format!("{}/data", child.name), wrapped);
        }

        let mut query = dataset
            .create_box_query(dataset.logic_box().clone(), "averageBlend()", QueryMode::Read)
            .unwrap()
            .with_progression(Progression::None)
            .with_aborted(aborted.clone());
        assert!(dataset.begin_query(&mut query));
        assert!(!dataset.execute_query(&access, &mut query).await);

        assert!(query.is_failed());
        assert_eq!(query.error_message(), Some("aborted"));
        assert!(query.buffer.is_none());
        assert_eq!(query.down_queries.len(), 3);
        let finished = query
            .down_queries
            .values()
            .filter(|down| down.query.cur_resolution().is_some())
            .count();
        assert_eq!(finished, 1);
        assert!(query.down_queries.values().all(|down| down.warped().is_none()));
    }

    #[tokio::test]
    async fn test_no_contribution_fails() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 10.0, None).await;
        let b = child(&dir, "b", 20.0, None).await;
        let dataset = compose(vec![
            (a, "a", Matrix::identity()),
            (b, "b", Matrix::translate([8.0, 0.0, 0.0])),
        ]);
        let access = dataset.create_access(&AccessConfig::default()).unwrap();
        let mut query = dataset
            .create_box_query(
                BoxNi::new(PointNi(vec![0, 0]), PointNi(vec![4, 4])),
                "b.data",
                QueryMode::Read,
            )
            .unwrap();
        assert!(dataset.begin_query(&mut query));
        assert!(!dataset.execute_query(&access, &mut query).await);
        assert!(query.error_message().unwrap().contains("no child dataset contributed"));
    }

    #[tokio::test]
    async fn test_read_block_through_box_query() {
        let dir = TempDir::new().unwrap();
        let a = child(&dir, "a", 42.0, None).await;
        let dataset = compose(vec![(a, "a", Matrix::identity())]);
        let access = dataset.create_access(&AccessConfig::default()).unwrap();
        assert_eq!(access.as_any().downcast_ref::<MultiAccess>().unwrap().concurrency(), FANOUT_CONCURRENCY);

        let field = dataset.field("a.data").unwrap();
        let block = dataset
            .read_block(
                &access,
                BlockQuery::new(field, 0.0, 0, dataset.bitsperblock(), Aborted::new()),
            )
            .await
            .unwrap();
        assert!((0..block.nsamples() as usize).all(|i| block.get(i, 0) == 42.0));
        assert!(dataset
            .create_access(&AccessConfig::default())
            .unwrap()
            .write_block(BlockQuery::new(
                dataset.field("a.data").unwrap(),
                0.0,
                0,
                dataset.bitsperblock(),
                Aborted::new()
            ))
            .await
            .is_err());
    }
}
