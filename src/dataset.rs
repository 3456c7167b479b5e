//! Datasets: the `.idx` descriptor plus the way its blocks are reached
//!
//! A dataset is opened once from a URL and then hands out accesses and
//! drives region queries through their resolution levels:
//!
//! ```rust,ignore
//! let dataset = Dataset::open("/data/visus.idx").await?;
//! let access = dataset.create_access(&AccessConfig::default())?;
//! let mut query = dataset.create_box_query(logic_box, "data", QueryMode::Read)?;
//! dataset.begin_query(&mut query);
//! while dataset.execute_query(&access, &mut query).await {
//!     // query.buffer holds the current level
//!     if !dataset.advance_query(&mut query) {
//!         break;
//!     }
//! }
//! ```

use crate::access::{Access, IoMode};
use crate::array::{block_to_hz_order, block_to_row_major, insert_samples, Array};
use crate::bitmask::Bitmask;
use crate::codec::CodecRegistry;
use crate::config::{AccessConfig, EnvOverrides};
use crate::disk_access::DiskAccess;
use crate::error::{IdxError, Result};
use crate::filename::resolve_aliases;
use crate::geometry::{BoxNi, LogicSamples, Matrix, PointNi};
use crate::hzorder::HzOrder;
use crate::idxfile::IdxFile;
use crate::io::{load_text_document, save_text_document};
use crate::lock::WriteLockTable;
use crate::mosaic::{MosaicAccess, MosaicDataset, MosaicTile};
use crate::multi::{MultiAccess, MultiChild, MultiDataset};
use crate::query::{BlockQuery, BoxQuery, Progression, QueryMode};
use crate::types::{Field, Layout, Timesteps};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators shared by every dataset of a process
#[derive(Debug, Clone)]
pub struct DatasetContext {
    pub codecs: Arc<CodecRegistry>,
    pub write_locks: Arc<WriteLockTable>,
    pub env: EnvOverrides,
}

impl DatasetContext {
    pub fn new(env: EnvOverrides) -> Self {
        Self {
            codecs: Arc::new(CodecRegistry::default()),
            write_locks: WriteLockTable::new(env.verbose.unwrap_or(false)),
            env,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }
}

impl Default for DatasetContext {
    fn default() -> Self {
        Self::new(EnvOverrides::from_env())
    }
}

/// A tile of a `.midx` mosaic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicChildDescriptor {
    pub name: String,
    pub url: String,
    pub offset: Vec<i64>,
}

/// A child of a `.midx` multi dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChildDescriptor {
    pub name: String,
    pub url: String,
    /// Child logic space to parent logic space, 16 values row-major
    #[serde(default)]
    pub transform: Matrix,
}

/// JSON content of a `.midx` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CompositeDescriptor {
    Mosaic {
        children: Vec<MosaicChildDescriptor>,
    },
    Multi {
        children: Vec<MultiChildDescriptor>,
        /// Blend expressions, defaults are generated when empty
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
        /// Explicit parent box in `.idx` notation
        #[serde(default, rename = "box", skip_serializing_if = "Option::is_none")]
        logic_box: Option<String>,
    },
}

impl CompositeDescriptor {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// How the blocks of a dataset are produced
#[derive(Debug, Clone)]
pub enum DatasetKind {
    /// Block files on disk
    Idx,
    Mosaic(Arc<MosaicDataset>),
    Multi(Arc<MultiDataset>),
}

/// An opened dataset
#[derive(Debug)]
pub struct Dataset {
    url: String,
    idxfile: Arc<IdxFile>,
    hzorder: HzOrder,
    kind: DatasetKind,
    context: DatasetContext,
}

impl Dataset {
    /// Wrap an in-memory descriptor. `url` anchors relative templates.
    pub fn new(url: &str, mut idxfile: IdxFile, context: DatasetContext) -> Result<Self> {
        idxfile.validate(url)?;
        Self::with_kind(url, idxfile, DatasetKind::Idx, context)
    }

    fn with_kind(url: &str, idxfile: IdxFile, kind: DatasetKind, context: DatasetContext) -> Result<Self> {
        let hzorder = idxfile.hzorder()?;
        Ok(Self {
            url: url.to_string(),
            idxfile: Arc::new(idxfile),
            hzorder,
            kind,
            context,
        })
    }

    pub fn from_mosaic(url: &str, mosaic: MosaicDataset, context: DatasetContext) -> Result<Self> {
        let idxfile = mosaic.idxfile().clone();
        Self::with_kind(url, idxfile, DatasetKind::Mosaic(Arc::new(mosaic)), context)
    }

    pub fn from_multi(url: &str, multi: MultiDataset, context: DatasetContext) -> Result<Self> {
        let idxfile = multi.idxfile().clone();
        Self::with_kind(url, idxfile, DatasetKind::Multi(Arc::new(multi)), context)
    }

    pub async fn open(url: &str) -> Result<Arc<Dataset>> {
        Self::open_with(url, DatasetContext::default()).await
    }

    /// Open a `.idx` descriptor or a `.midx` composite. Children of a
    /// composite are opened with the same context.
    pub fn open_with(url: &str, context: DatasetContext) -> BoxFuture<'static, Result<Arc<Dataset>>> {
        let url = url.to_string();
        async move {
            let content = load_text_document(&url).await?;
            let dataset = if url.ends_with(".midx") {
                Self::open_composite(&url, &content, context).await?
            } else {
                let idxfile = IdxFile::parse(&content)?;
                Self::new(&url, idxfile, context)?
            };
            info!(
                url = %url,
                kind = dataset.kind_name(),
                max_resolution = dataset.max_resolution(),
                "dataset opened"
            );
            Ok(Arc::new(dataset))
        }
        .boxed()
    }

    async fn open_composite(url: &str, content: &str, context: DatasetContext) -> Result<Dataset> {
        match CompositeDescriptor::from_json(content)? {
            CompositeDescriptor::Mosaic { children } => {
                let mut tiles = Vec::with_capacity(children.len());
                for child in children {
                    let child_url = resolve_aliases(&child.url, url);
                    let dataset = Self::open_with(&child_url, context.clone()).await?;
                    tiles.push(MosaicTile {
                        name: child.name,
                        offset: PointNi(child.offset),
                        dataset,
                    });
                }
                let mosaic = MosaicDataset::new(tiles, url)?;
                Self::from_mosaic(url, mosaic, context)
            }
            CompositeDescriptor::Multi {
                children,
                fields,
                logic_box,
            } => {
                let mut multi_children = Vec::with_capacity(children.len());
                for child in children {
                    let child_url = resolve_aliases(&child.url, url);
                    let dataset = Self::open_with(&child_url, context.clone()).await?;
                    multi_children.push(MultiChild {
                        name: child.name,
                        dataset,
                        logic_to_parent: child.transform,
                    });
                }
                let pdim = multi_children
                    .first()
                    .map(|c| c.dataset.pdim())
                    .unwrap_or_default();
                let logic_box = logic_box
                    .map(|b| BoxNi::parse_old_format(pdim, &b))
                    .transpose()?;
                let multi = MultiDataset::new(multi_children, logic_box, fields, url)?;
                Self::from_multi(url, multi, context)
            }
        }
    }

    /// Validate `idxfile`, write it at `path` and open it
    pub async fn create(
        path: impl AsRef<Path>,
        mut idxfile: IdxFile,
        context: DatasetContext,
    ) -> Result<Arc<Dataset>> {
        let path = path.as_ref();
        let url = path.to_string_lossy().into_owned();
        idxfile.validate(&url)?;
        save_text_document(path, &idxfile.to_old_format_string()).await?;
        debug!(url = %url, "dataset created");
        Ok(Arc::new(Self::new(&url, idxfile, context)?))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn idxfile(&self) -> &IdxFile {
        &self.idxfile
    }

    pub fn kind(&self) -> &DatasetKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DatasetKind::Idx => "idx",
            DatasetKind::Mosaic(_) => "mosaic",
            DatasetKind::Multi(_) => "multi",
        }
    }

    pub fn context(&self) -> &DatasetContext {
        &self.context
    }

    pub fn hzorder(&self) -> &HzOrder {
        &self.hzorder
    }

    pub fn bitmask(&self) -> &Bitmask {
        self.hzorder.bitmask()
    }

    pub fn logic_box(&self) -> &BoxNi {
        &self.idxfile.logic_box
    }

    pub fn max_resolution(&self) -> u32 {
        self.hzorder.max_resolution()
    }

    pub fn pdim(&self) -> usize {
        self.hzorder.pdim()
    }

    pub fn bitsperblock(&self) -> u32 {
        self.idxfile.bitsperblock
    }

    pub fn timesteps(&self) -> &Timesteps {
        &self.idxfile.timesteps
    }

    pub fn fields(&self) -> &[Field] {
        &self.idxfile.fields
    }

    pub fn default_field(&self) -> Option<&Field> {
        self.idxfile.default_field()
    }

    /// Field by name. Multi datasets also accept blend expressions
    /// that are not listed among their fields.
    pub fn field(&self, name: &str) -> Result<Field> {
        if let Some(field) = self.idxfile.field(name) {
            return Ok(field.clone());
        }
        match &self.kind {
            DatasetKind::Multi(multi) => multi.field_for_expression(name),
            _ => Err(IdxError::InvalidQuery(format!("no field '{}'", name))),
        }
    }

    pub fn create_access(&self, config: &AccessConfig) -> Result<Arc<dyn Access>> {
        let env = &self.context.env;
        Ok(match &self.kind {
            DatasetKind::Idx => Arc::new(DiskAccess::new(
                Arc::clone(&self.idxfile),
                &self.url,
                config,
                env,
                Arc::clone(&self.context.codecs),
                Arc::clone(&self.context.write_locks),
            )?),
            DatasetKind::Mosaic(mosaic) => Arc::new(MosaicAccess::new(Arc::clone(mosaic), config)),
            DatasetKind::Multi(multi) => Arc::new(MultiAccess::new(Arc::clone(multi), config, env)),
        })
    }

    /// Query over `logic_box` at the default time
    pub fn create_box_query(&self, logic_box: BoxNi, field: &str, mode: QueryMode) -> Result<BoxQuery> {
        let field = self.field(field)?;
        let mut query = BoxQuery::new(
            mode,
            logic_box,
            field,
            self.timesteps().default_time(),
            Default::default(),
        );
        if mode == QueryMode::Write {
            query.progression = Progression::None;
        }
        Ok(query)
    }

    /// Created -> Running. Returns false when the query failed to start.
    pub fn begin_query(&self, query: &mut BoxQuery) -> bool {
        if query.status().is_terminal() || query.is_running() {
            return query.is_running();
        }
        if query.mode == QueryMode::Write && !matches!(self.kind, DatasetKind::Idx) {
            query.fail(&IdxError::Unsupported(format!(
                "{} datasets cannot be written",
                self.kind_name()
            )));
            return false;
        }
        if !self.timesteps().contains(query.time) {
            info!(time = query.time, url = %self.url, "missing timestep");
            query.fail(&IdxError::InvalidQuery(format!("missing timestep {}", query.time)));
            return false;
        }
        query.start(self.max_resolution(), self.pdim());
        query.is_running()
    }

    /// Compute the current level of a running query. On failure the query
    /// moves to Failed and false is returned.
    pub fn execute_query<'a>(
        &'a self,
        access: &'a Arc<dyn Access>,
        query: &'a mut BoxQuery,
    ) -> BoxFuture<'a, bool> {
        async move {
            if !query.can_execute() {
                return false;
            }
            let result = match &self.kind {
                DatasetKind::Multi(_) => match access.as_any().downcast_ref::<MultiAccess>() {
                    Some(multi) => multi.execute(query).await,
                    None => Err(IdxError::Unsupported(format!(
                        "{} cannot serve composite queries",
                        access.info().name
                    ))),
                },
                _ => self.execute_blocks(access, query).await,
            };
            match result {
                Ok(()) => {
                    query.set_current_level_ready();
                    true
                }
                Err(e) => {
                    debug!(error = %e, "query failed");
                    query.fail(&e);
                    false
                }
            }
        }
        .boxed()
    }

    /// Move to the next level, carrying the fetched samples. Composite
    /// children follow their parent.
    pub fn advance_query(&self, query: &mut BoxQuery) -> bool {
        if !query.step(self.max_resolution(), Some(&self.hzorder)) {
            return false;
        }
        if let DatasetKind::Multi(multi) = &self.kind {
            multi.advance_down_queries(query);
        }
        true
    }

    async fn execute_blocks(&self, access: &Arc<dyn Access>, query: &mut BoxQuery) -> Result<()> {
        query.aborted.check()?;
        query.allocate_buffer(&self.hzorder)?;
        let end = query
            .end_resolution()
            .ok_or_else(|| IdxError::InvalidQuery(format!("query is {}", query.status())))?;
        let bitsperblock = access.info().bitsperblock;
        let blocks = self.hzorder.blocks_for_box(
            &query.logic_box,
            bitsperblock,
            query.read_from_exclusive(),
            end,
        );

        let mode = match query.mode {
            QueryMode::Read => IoMode::Read,
            QueryMode::Write => IoMode::Write,
        };
        let opened = match access.io_mode() {
            None => {
                access.begin_io(mode).await?;
                true
            }
            Some(open) if open == mode => false,
            Some(open) => {
                return Err(IdxError::InvalidQuery(format!(
                    "{} has a {:?} session open",
                    access.info().name,
                    open
                )))
            }
        };

        let result = match query.mode {
            QueryMode::Read => self.read_blocks(access, query, &blocks, bitsperblock).await,
            QueryMode::Write => self.write_blocks(access, query, &blocks, bitsperblock).await,
        };

        if opened {
            let closed = access.end_io().await;
            return result.and(closed);
        }
        result
    }

    async fn read_blocks(
        &self,
        access: &Arc<dyn Access>,
        query: &mut BoxQuery,
        blocks: &[u64],
        bitsperblock: u32,
    ) -> Result<()> {
        // every read is issued before the first one is awaited
        let pending: Vec<_> = blocks
            .iter()
            .map(|&blockid| {
                let block = BlockQuery::new(
                    query.field.clone(),
                    query.time,
                    blockid,
                    bitsperblock,
                    query.aborted.clone(),
                );
                (blockid, access.read_block(block))
            })
            .collect();

        let (Some(buffer), Some(samples)) = (query.buffer.as_mut(), query.samples.as_ref()) else {
            return Err(IdxError::InvalidQuery("query buffer not allocated".to_string()));
        };

        for (blockid, read) in pending {
            let read = read
                .await
                .and_then(|block| block_to_row_major(&block, &self.hzorder, blockid, bitsperblock));
            let Some(block) = skip_unreadable(read, blockid)? else {
                continue;
            };
            let block_samples = self.hzorder.block_samples(blockid, bitsperblock);
            insert_samples(buffer, samples, &block, &block_samples, &query.aborted)?;
        }
        Ok(())
    }

    /// Read-modify-write of every touched block under its file lease
    async fn write_blocks(
        &self,
        access: &Arc<dyn Access>,
        query: &mut BoxQuery,
        blocks: &[u64],
        bitsperblock: u32,
    ) -> Result<()> {
        let (Some(buffer), Some(samples)) = (query.buffer.as_ref(), query.samples.as_ref()) else {
            return Err(IdxError::InvalidQuery("write buffer not set".to_string()));
        };
        let field = &query.field;

        for &blockid in blocks {
            query.aborted.check()?;
            let block_query = BlockQuery::new(
                field.clone(),
                query.time,
                blockid,
                bitsperblock,
                query.aborted.clone(),
            );
            let _lease = access.acquire_write_lock(&block_query).await?;

            let block_samples = self.hzorder.block_samples(blockid, bitsperblock);
            let existing = access
                .read_block(block_query.clone())
                .await
                .and_then(|block| block_to_row_major(&block, &self.hzorder, blockid, bitsperblock));
            let mut block = match skip_unreadable(existing, blockid)? {
                Some(block) => block,
                None => Array::filled(block_samples.nsamples(), field.dtype, field.default_value),
            };

            if !insert_samples(&mut block, &block_samples, buffer, samples, &query.aborted)? {
                continue;
            }
            if field.default_layout == Layout::HzOrder {
                block = block_to_hz_order(&block, &self.hzorder, blockid, bitsperblock)?;
            }
            access.write_block(block_query.with_buffer(block)).await?;
        }
        Ok(())
    }

    /// Read one block inside its own session unless one is open
    pub async fn read_block(&self, access: &Arc<dyn Access>, query: BlockQuery) -> Result<Array> {
        let opened = access.io_mode().is_none();
        if opened {
            access.begin_io(IoMode::Read).await?;
        }
        let result = access.read_block(query).await;
        if opened {
            let closed = access.end_io().await;
            return closed.and(result);
        }
        result
    }

    /// Write one block inside its own session unless one is open
    pub async fn write_block(&self, access: &Arc<dyn Access>, query: BlockQuery) -> Result<()> {
        let opened = access.io_mode().is_none();
        if opened {
            access.begin_io(IoMode::Write).await?;
        }
        let result = access.write_block(query).await;
        if opened {
            let closed = access.end_io().await;
            return result.and(closed);
        }
        result
    }

    /// Samples of `logic_box` at `resolution` (max resolution when `None`)
    pub async fn read_box(
        &self,
        access: &Arc<dyn Access>,
        logic_box: BoxNi,
        field: &str,
        resolution: Option<u32>,
    ) -> Result<(Array, LogicSamples)> {
        let mut query = self
            .create_box_query(logic_box, field, QueryMode::Read)?
            .with_progression(Progression::None);
        if let Some(h) = resolution {
            query.end_resolutions = vec![h];
        }
        self.run_to_completion(access, &mut query).await?;
        match (query.buffer, query.samples) {
            (Some(buffer), Some(samples)) => Ok((buffer, samples)),
            _ => Err(IdxError::InvalidQuery("query produced no samples".to_string())),
        }
    }

    /// Store `buffer` as the full-resolution samples of `logic_box`
    pub async fn write_box(
        &self,
        access: &Arc<dyn Access>,
        logic_box: BoxNi,
        field: &str,
        buffer: Array,
    ) -> Result<()> {
        let mut query = self.create_box_query(logic_box, field, QueryMode::Write)?;
        query.buffer = Some(buffer);
        self.run_to_completion(access, &mut query).await
    }

    async fn run_to_completion(&self, access: &Arc<dyn Access>, query: &mut BoxQuery) -> Result<()> {
        if self.begin_query(query) {
            while self.execute_query(access, query).await {
                if !self.advance_query(query) {
                    break;
                }
            }
        }
        match query.error_message() {
            Some(reason) if reason == "aborted" => Err(IdxError::Aborted),
            Some(reason) => Err(IdxError::InvalidQuery(reason.to_string())),
            None => Ok(()),
        }
    }
}

/// A block that cannot be read is a hole in the result. Only a cancellation
/// stops the query.
fn skip_unreadable(read: Result<Array>, blockid: u64) -> Result<Option<Array>> {
    match read {
        Ok(block) => Ok(Some(block)),
        Err(e) if e.is_aborted() => Err(e),
        Err(e) if e.is_unavailable() => {
            debug!(blockid, error = %e, "block not available");
            Ok(None)
        }
        Err(e) => {
            warn!(blockid, error = %e, "unreadable block treated as missing");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, DataType};
    use tempfile::TempDir;

    fn context() -> DatasetContext {
        DatasetContext::new(EnvOverrides::default())
    }

    fn ramp(dims: &PointNi) -> Array {
        let mut buffer = Array::new(dims.clone(), DType::scalar(DataType::U8));
        for i in 0..buffer.nsamples() as usize {
            buffer.set(i, 0, (i % 251) as f64);
        }
        buffer
    }

    async fn create_2d(dir: &TempDir, layout: Layout) -> Arc<Dataset> {
        let field = Field::new("data", DType::scalar(DataType::U8))
            .with_compression("zip")
            .with_layout(layout);
        let idxfile = IdxFile::new(BoxNi::from_dims(&PointNi(vec![16, 16])), vec![field])
            .with_bitsperblock(4)
            .with_blocksperfile(8);
        Dataset::create(dir.path().join("visus.idx"), idxfile, context())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_box() {
        let dir = TempDir::new().unwrap();
        for layout in [Layout::HzOrder, Layout::RowMajor] {
            let dataset = create_2d(&dir, layout).await;
            let access = dataset.create_access(&AccessConfig::default()).unwrap();
            let full = BoxNi::from_dims(&PointNi(vec![16, 16]));
            let data = ramp(&PointNi(vec![16, 16]));

            dataset.write_box(&access, full.clone(), "data", data.clone()).await.unwrap();
            let (read, samples) = dataset.read_box(&access, full, "data", None).await.unwrap();
            assert_eq!(samples.nsamples(), PointNi(vec![16, 16]));
            assert_eq!(read.as_bytes(), data.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_reopen_and_read_subregion() {
        let dir = TempDir::new().unwrap();
        let dataset = create_2d(&dir, Layout::HzOrder).await;
        let access = dataset.create_access(&AccessConfig::default()).unwrap();
        let data = ramp(&PointNi(vec![16, 16]));
        dataset
            .write_box(&access, BoxNi::from_dims(&PointNi(vec![16, 16])), "data", data.clone())
            .await
            .unwrap();

        let reopened = Dataset::open_with(dataset.url(), context()).await.unwrap();
        let access = reopened
            .create_access(&AccessConfig::read_only().with_disable_async(true))
            .unwrap();
        let region = BoxNi::new(PointNi(vec![4, 8]), PointNi(vec![8, 12]));
        let (read, _) = reopened.read_box(&access, region, "data", None).await.unwrap();
        assert_eq!(read.dims, PointNi(vec![4, 4]));
        for y in 0..4 {
            for x in 0..4 {
                let expected = data.get((8 + y) * 16 + 4 + x, 0);
                assert_eq!(read.get(y * 4 + x, 0), expected);
            }
        }
    }

    #[tokio::test]
    async fn test_missing_blocks_read_default_value() {
        let dir = TempDir::new().unwrap();
        let field = Field::new("data", DType::scalar(DataType::F32)).with_default_value(7.0);
        let idxfile = IdxFile::new(BoxNi::from_dims(&PointNi(vec![8, 8])), vec![field]);
        let dataset = Dataset::create(dir.path().join("empty.idx"), idxfile, context())
            .await
            .unwrap();
        let access = dataset.create_access(&AccessConfig::read_only()).unwrap();
        let (read, _) = dataset
            .read_box(&access, BoxNi::from_dims(&PointNi(vec![8, 8])), "data", Some(4))
            .await
            .unwrap();
        assert_eq!(read.dims, PointNi(vec![4, 4]));
        assert!((0..16).all(|i| read.get(i, 0) == 7.0));
    }

    #[tokio::test]
    async fn test_begin_rejects_unknown_time() {
        let dir = TempDir::new().unwrap();
        let dataset = create_2d(&dir, Layout::HzOrder).await;
        let mut query = dataset
            .create_box_query(BoxNi::from_dims(&PointNi(vec![16, 16])), "data", QueryMode::Read)
            .unwrap();
        query.time = 42.0;
        assert!(!dataset.begin_query(&mut query));
        assert!(query.error_message().unwrap().contains("missing timestep"));
        assert!(dataset.field("nope").is_err());
    }

    #[test]
    fn test_composite_descriptor_json() {
        let descriptor = CompositeDescriptor::from_json(
            r#"{"kind":"multi","box":"0 31 0 15",
                "children":[{"name":"a","url":"./a.idx"},
                            {"name":"b","url":"./b.idx",
                             "transform":[1,0,0,16, 0,1,0,0, 0,0,1,0, 0,0,0,1]}]}"#,
        )
        .unwrap();
        match &descriptor {
            CompositeDescriptor::Multi {
                children,
                fields,
                logic_box,
            } => {
                assert_eq!(children.len(), 2);
                assert!(children[0].transform.is_identity());
                assert_eq!(children[1].transform.transform([0.0, 0.0, 0.0]), [16.0, 0.0, 0.0]);
                assert!(fields.is_empty());
                assert_eq!(logic_box.as_deref(), Some("0 31 0 15"));
            }
            other => panic!("unexpected descriptor {:?}", other),
        }
        let json = descriptor.to_json().unwrap();
        assert_eq!(CompositeDescriptor::from_json(&json).unwrap(), descriptor);
    }
}
