//! Homogeneous tiling: `.idx` children sharing one addressing grid
//!
//! The parent bitmask is the bits selecting a tile followed by the child
//! bitmask, so every fine parent block lives inside exactly one tile and
//! maps onto one child block. Coarse parent blocks (the first
//! `2^nbits` ones) straddle tiles and are composed from a reduced
//! resolution query against every child.

use crate::access::{Access, AccessInfo, IoMode, IoSession};
use crate::array::{insert_samples, Array};
use crate::bitmask::Bitmask;
use crate::config::AccessConfig;
use crate::dataset::{Dataset, DatasetKind};
use crate::error::{IdxError, Result};
use crate::geometry::{BoxNi, LogicSamples, PointNi};
use crate::hzorder::HzOrder;
use crate::idxfile::IdxFile;
use crate::lock::WriteLockGuard;
use crate::query::{BlockQuery, BoxQuery, Progression, QueryMode};
use crate::types::Field;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One child of a mosaic, placed at an integer offset
#[derive(Debug, Clone)]
pub struct MosaicTile {
    pub name: String,
    pub offset: PointNi,
    pub dataset: Arc<Dataset>,
}

#[derive(Debug)]
pub struct MosaicDataset {
    tiles: Vec<MosaicTile>,
    /// tile grid coordinates -> index into `tiles`
    grid: HashMap<Vec<i64>, usize>,
    tile_dims: PointNi,
    nbits: u32,
    hzorder: HzOrder,
    child_hzorder: HzOrder,
    idxfile: IdxFile,
}

impl MosaicDataset {
    /// Every tile must be an `.idx` dataset with the same bitmask,
    /// bitsperblock and fields, at an offset multiple of its pow2 dims.
    pub fn new(tiles: Vec<MosaicTile>, url: &str) -> Result<Self> {
        let first = tiles
            .first()
            .ok_or_else(|| IdxError::Configuration("mosaic without tiles".to_string()))?;
        let reference = first.dataset.idxfile().clone();
        let child_bitmask = first.dataset.bitmask().clone();
        let tile_dims = child_bitmask.pow2_dims().clone();
        let pdim = child_bitmask.pdim();

        let mut grid = HashMap::new();
        let mut logic_box: Option<BoxNi> = None;
        for (index, tile) in tiles.iter().enumerate() {
            if !matches!(tile.dataset.kind(), DatasetKind::Idx) {
                return Err(IdxError::Configuration(format!(
                    "mosaic tile '{}' is not an idx dataset",
                    tile.name
                )));
            }
            let idxfile = tile.dataset.idxfile();
            let same_fields = idxfile.fields.len() == reference.fields.len()
                && idxfile
                    .fields
                    .iter()
                    .zip(&reference.fields)
                    .all(|(a, b)| a.name == b.name && a.dtype == b.dtype);
            if tile.dataset.bitmask() != &child_bitmask
                || idxfile.bitsperblock != reference.bitsperblock
                || !same_fields
            {
                return Err(IdxError::Configuration(format!(
                    "mosaic tile '{}' does not match the first tile",
                    tile.name
                )));
            }
            if tile.offset.pdim() != pdim {
                return Err(IdxError::Configuration(format!(
                    "offset {} of tile '{}' has the wrong dimension",
                    tile.offset, tile.name
                )));
            }

            let mut cell = Vec::with_capacity(pdim);
            for d in 0..pdim {
                let (offset, size) = (tile.offset[d], tile_dims[d]);
                if offset < 0 || offset % size != 0 {
                    return Err(IdxError::Configuration(format!(
                        "offset {} of tile '{}' is not aligned to {}",
                        tile.offset, tile.name, tile_dims
                    )));
                }
                cell.push(offset / size);
            }
            if grid.insert(cell, index).is_some() {
                return Err(IdxError::Configuration(format!(
                    "tile '{}' overlaps another tile",
                    tile.name
                )));
            }

            let placed = idxfile.logic_box.translate(&tile.offset);
            logic_box = Some(match logic_box {
                Some(b) => b.union(&placed),
                None => placed,
            });
        }
        let logic_box = logic_box.unwrap_or_else(|| reference.logic_box.clone());

        let parent_dims = Bitmask::guess(&logic_box.p2).pow2_dims().clone();
        let tiles_per_axis = PointNi(
            (0..pdim)
                .map(|d| (parent_dims[d] / tile_dims[d]).max(1))
                .collect(),
        );
        let pattern = format!(
            "{}{}",
            Bitmask::guess(&tiles_per_axis).pattern(),
            &child_bitmask.pattern()[1..]
        );
        let bitmask = Bitmask::parse(&pattern)?;

        let mut idxfile = IdxFile::new(logic_box, reference.fields.clone())
            .with_bitmask(bitmask)
            .with_bitsperblock(reference.bitsperblock);
        idxfile.timesteps = reference.timesteps.clone();
        idxfile.time_template = reference.time_template.clone();
        idxfile.validate(url)?;

        let hzorder = idxfile.hzorder()?;
        let child_hzorder = HzOrder::new(&child_bitmask);
        let nbits = hzorder.max_resolution() - child_hzorder.max_resolution();
        debug!(
            tiles = tiles.len(),
            bitmask = %hzorder.bitmask(),
            nbits,
            "mosaic composed"
        );

        Ok(Self {
            tiles,
            grid,
            tile_dims,
            nbits,
            hzorder,
            child_hzorder,
            idxfile,
        })
    }

    pub fn idxfile(&self) -> &IdxFile {
        &self.idxfile
    }

    pub fn tiles(&self) -> &[MosaicTile] {
        &self.tiles
    }

    /// Bits of the parent address that select a tile
    pub fn nbits(&self) -> u32 {
        self.nbits
    }

    /// Tile holding a parent point and the point in tile coordinates
    pub fn locate(&self, p: &PointNi) -> Option<(usize, PointNi)> {
        let cell: Vec<i64> = (0..p.pdim()).map(|d| p[d].div_euclid(self.tile_dims[d])).collect();
        let index = *self.grid.get(&cell)?;
        Some((index, p.sub(&self.tiles[index].offset)))
    }

    /// Blocks from here on lie inside a single tile
    fn first_single_tile_block(&self) -> u64 {
        1u64 << self.nbits
    }

    /// The child block a fine parent block maps onto
    fn child_block(&self, blockid: u64, bitsperblock: u32) -> Option<(usize, u64)> {
        let p1 = self.hzorder.point(blockid << bitsperblock);
        let (index, local) = self.locate(&p1)?;
        Some((index, self.child_hzorder.address(&local) >> bitsperblock))
    }

    fn tile_field(&self, index: usize, field: &Field) -> Result<Field> {
        let tile = &self.tiles[index];
        tile.dataset.idxfile().field(&field.name).cloned().ok_or_else(|| {
            IdxError::InvalidQuery(format!("tile '{}' has no field '{}'", tile.name, field.name))
        })
    }
}

/// Lazily created accesses of the tiles
struct TileAccesses {
    mosaic: Arc<MosaicDataset>,
    config: AccessConfig,
    open: Mutex<HashMap<usize, Arc<dyn Access>>>,
}

impl TileAccesses {
    /// Tiles get a non-threaded access so thousands of them stay cheap
    fn access(&self, index: usize) -> Result<Arc<dyn Access>> {
        let mut open = self.open.lock();
        if let Some(access) = open.get(&index) {
            return Ok(Arc::clone(access));
        }
        let tile = &self.mosaic.tiles[index];
        let config = self.config.child(&tile.name).with_disable_async(true);
        let access = tile.dataset.create_access(&config)?;
        open.insert(index, Arc::clone(&access));
        Ok(access)
    }

    fn opened(&self) -> Vec<Arc<dyn Access>> {
        self.open.lock().values().cloned().collect()
    }

    async fn read_block(&self, query: BlockQuery) -> Result<Array> {
        query.aborted.check()?;
        let bitsperblock = query.bitsperblock();
        if query.blockid < self.mosaic.first_single_tile_block() {
            return self.read_coarse_block(query).await;
        }

        let (index, child_blockid) = self
            .mosaic
            .child_block(query.blockid, bitsperblock)
            .ok_or(IdxError::NotStored {
                blockid: query.blockid,
                offset: 0,
                size: 0,
            })?;
        let field = self.mosaic.tile_field(index, &query.field)?;
        let access = self.access(index)?;
        if access.io_mode() != Some(IoMode::Read) {
            access.begin_io(IoMode::Read).await?;
        }
        let child_query = BlockQuery::new(
            field,
            query.time,
            child_blockid,
            bitsperblock,
            query.aborted.clone(),
        );
        access.read_block(child_query).await
    }

    /// Compose a block spanning several tiles from a box query per tile.
    /// The result is row-major on the block lattice.
    async fn read_coarse_block(&self, query: BlockQuery) -> Result<Array> {
        let started = Instant::now();
        let mosaic = &self.mosaic;
        let bitsperblock = query.bitsperblock();
        let samples = mosaic.hzorder.block_samples(query.blockid, bitsperblock);
        let mut buffer = Array::filled(samples.nsamples(), query.field.dtype, query.field.default_value);

        let level = HzOrder::address_resolution(query.end_address - 1);
        let end = level.saturating_sub(mosaic.nbits);
        let start = if query.blockid > 0 { end } else { 0 };

        for (index, tile) in mosaic.tiles.iter().enumerate() {
            query.aborted.check()?;
            let negative = PointNi(tile.offset.0.iter().map(|v| -v).collect());
            let logic_box = samples
                .logic_box
                .translate(&negative)
                .intersection(tile.dataset.logic_box());
            if !logic_box.is_full_dim() {
                continue;
            }

            let field = mosaic.tile_field(index, &query.field)?;
            let access = self.access(index)?;
            if access.io_mode().is_some() {
                access.end_io().await?;
            }

            let mut tile_query = BoxQuery::new(
                QueryMode::Read,
                logic_box,
                field,
                query.time,
                query.aborted.clone(),
            )
            .with_resolution_range(start, end)
            .with_progression(Progression::None);
            let dataset = &tile.dataset;
            if !dataset.begin_query(&mut tile_query) || !dataset.execute_query(&access, &mut tile_query).await {
                query.aborted.check()?;
                debug!(
                    tile = %tile.name,
                    reason = tile_query.error_message().unwrap_or_default(),
                    "tile skipped"
                );
                continue;
            }

            if let (Some(tile_buffer), Some(tile_samples)) = (&tile_query.buffer, &tile_query.samples) {
                let placed = LogicSamples {
                    logic_box: tile_samples.logic_box.translate(&tile.offset),
                    delta: tile_samples.delta.clone(),
                };
                insert_samples(&mut buffer, &samples, tile_buffer, &placed, &query.aborted)?;
            }
        }

        debug!(
            blockid = query.blockid,
            tiles = mosaic.tiles.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "slow coarse mosaic block"
        );
        Ok(buffer)
    }
}

/// Read-only access to a mosaic
pub struct MosaicAccess {
    info: AccessInfo,
    session: IoSession,
    tiles: Arc<TileAccesses>,
}

impl std::fmt::Debug for MosaicAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MosaicAccess")
            .field("info", &self.info)
            .field("open_tiles", &self.tiles.open.lock().len())
            .finish()
    }
}

impl MosaicAccess {
    pub fn new(mosaic: Arc<MosaicDataset>, config: &AccessConfig) -> Self {
        let info = AccessInfo {
            name: config.name_or("MosaicAccess").to_string(),
            can_read: config.can_read(),
            can_write: false,
            bitsperblock: mosaic.idxfile.bitsperblock,
        };
        Self {
            info,
            session: IoSession::default(),
            tiles: Arc::new(TileAccesses {
                mosaic,
                config: config.clone(),
                open: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of tiles whose access was created so far
    pub fn open_tiles(&self) -> usize {
        self.tiles.open.lock().len()
    }
}

#[async_trait]
impl Access for MosaicAccess {
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
        let mut result = Ok(());
        for access in self.tiles.opened() {
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
        let tiles = Arc::clone(&self.tiles);
        async move { tiles.read_block(query).await }.boxed()
    }

    async fn write_block(&self, _query: BlockQuery) -> Result<()> {
        Err(IdxError::Unsupported("mosaic datasets are read only".to_string()))
    }

    async fn acquire_write_lock(&self, _query: &BlockQuery) -> Result<Option<WriteLockGuard>> {
        Ok(None)
    }

    fn filename(&self, field: &Field, time: f64, blockid: u64) -> Option<String> {
        let mosaic = &self.tiles.mosaic;
        if blockid < mosaic.first_single_tile_block() {
            return None;
        }
        let (index, child_blockid) = mosaic.child_block(blockid, self.info.bitsperblock)?;
        let field = mosaic.tile_field(index, field).ok()?;
        self.tiles.access(index).ok()?.filename(&field, time, child_blockid)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOverrides;
    use crate::dataset::DatasetContext;
    use crate::types::{DType, DataType};
    use tempfile::TempDir;

    async fn tile(dir: &TempDir, name: &str, offset: Vec<i64>) -> MosaicTile {
        let field = Field::new("data", DType::scalar(DataType::U16));
        let idxfile = IdxFile::new(BoxNi::from_dims(&PointNi(vec![8, 8])), vec![field])
            .with_bitsperblock(3);
        let dataset = Dataset::create(
            dir.path().join(format!("{}.idx", name)),
            idxfile,
            DatasetContext::new(EnvOverrides::default()),
        )
        .await
        .unwrap();
        MosaicTile {
            name: name.to_string(),
            offset: PointNi(offset),
            dataset,
        }
    }

    #[tokio::test]
    async fn test_parent_bitmask_prefixes_tile_bits() {
        let dir = TempDir::new().unwrap();
        let tiles = vec![
            tile(&dir, "a", vec![0, 0]).await,
            tile(&dir, "b", vec![8, 0]).await,
            tile(&dir, "c", vec![0, 8]).await,
            tile(&dir, "d", vec![8, 8]).await,
        ];
        let mosaic = MosaicDataset::new(tiles, "mosaic.midx").unwrap();
        assert_eq!(mosaic.idxfile().logic_box, BoxNi::from_dims(&PointNi(vec![16, 16])));
        assert_eq!(mosaic.nbits(), 2);
        assert_eq!(mosaic.hzorder.bitmask().pattern(), "V01010101");

        let (index, local) = mosaic.locate(&PointNi(vec![9, 3])).unwrap();
        assert_eq!(mosaic.tiles()[index].name, "b");
        assert_eq!(local, PointNi(vec![1, 3]));
    }

    #[tokio::test]
    async fn test_rejects_misaligned_and_overlapping_tiles() {
        let dir = TempDir::new().unwrap();
        let misaligned = vec![tile(&dir, "a", vec![0, 0]).await, tile(&dir, "b", vec![4, 0]).await];
        assert!(MosaicDataset::new(misaligned, "m.midx").is_err());

        let overlapping = vec![tile(&dir, "a", vec![0, 0]).await, tile(&dir, "b", vec![0, 0]).await];
        assert!(MosaicDataset::new(overlapping, "m.midx").is_err());

        assert!(MosaicDataset::new(Vec::new(), "m.midx").is_err());
    }

    #[tokio::test]
    async fn test_fine_blocks_map_to_one_child_block() {
        let dir = TempDir::new().unwrap();
        let tiles = vec![tile(&dir, "a", vec![0, 0]).await, tile(&dir, "b", vec![8, 0]).await];
        let mosaic = MosaicDataset::new(tiles, "m.midx").unwrap();
        let bpb = mosaic.idxfile().bitsperblock;
        let first = mosaic.first_single_tile_block();
        for blockid in first..mosaic.idxfile().total_blocks() {
            let (index, child_blockid) = mosaic.child_block(blockid, bpb).unwrap();
            let offset = &mosaic.tiles()[index].offset;
            for i in 0..(1u64 << bpb) {
                let parent = mosaic.hzorder.point((blockid << bpb) + i);
                let child = mosaic.child_hzorder.point((child_blockid << bpb) + i);
                assert_eq!(parent, child.add(offset));
            }
        }
    }

    #[tokio::test]
    async fn test_access_is_read_only() {
        let dir = TempDir::new().unwrap();
        let mosaic = Arc::new(MosaicDataset::new(vec![tile(&dir, "a", vec![0, 0]).await], "m.midx").unwrap());
        let access = MosaicAccess::new(mosaic, &AccessConfig::default());
        assert!(!access.info().can_write);
        assert!(access.begin_io(IoMode::Write).await.is_err());
        access.begin_io(IoMode::Read).await.unwrap();
        assert_eq!(access.open_tiles(), 0);
        access.end_io().await.unwrap();
    }
}
