//! Integration tests for `.midx` composites: mosaics and blended multi datasets
//!
//! The composites are described by JSON documents written next to their
//! children and opened through the same entry point as plain datasets.

use idxstore::{
    Aborted, AccessConfig, Array, BoxNi, DType, DataType, Dataset, DatasetContext, EnvOverrides,
    Field, IdxError, IdxFile, PointNi, Progression, QueryMode,
};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context() -> DatasetContext {
    DatasetContext::new(EnvOverrides::default())
}

/// Value stored at global mosaic coordinates
fn mosaic_value(x: i64, y: i64) -> f64 {
    (x + 16 * y + 1) as f64
}

/// 8x8 u8 dataset, 16 samples per block. `value` gives the sample at local (x, y).
async fn create_child(
    dir: &TempDir,
    name: &str,
    value: impl Fn(i64, i64) -> f64,
) -> anyhow::Result<Arc<Dataset>> {
    let field = Field::new("data", DType::scalar(DataType::U8)).with_compression("zip");
    let idxfile = IdxFile::new(BoxNi::from_dims(&PointNi(vec![8, 8])), vec![field])
        .with_bitsperblock(4);
    let dataset = Dataset::create(dir.path().join(format!("{}.idx", name)), idxfile, context()).await?;

    let mut data = Array::new(PointNi(vec![8, 8]), DType::scalar(DataType::U8));
    for y in 0..8 {
        for x in 0..8 {
            data.set((y * 8 + x) as usize, 0, value(x, y));
        }
    }
    let access = dataset.create_access(&AccessConfig::default())?;
    dataset
        .write_box(&access, dataset.logic_box().clone(), "data", data)
        .await?;
    Ok(dataset)
}

async fn write_descriptor(dir: &TempDir, name: &str, json: serde_json::Value) -> anyhow::Result<String> {
    let path = dir.path().join(name);
    tokio::fs::write(&path, serde_json::to_string_pretty(&json)?).await?;
    Ok(path.to_string_lossy().into_owned())
}

async fn open_mosaic(dir: &TempDir) -> anyhow::Result<Arc<Dataset>> {
    create_child(dir, "left", mosaic_value).await?;
    create_child(dir, "right", |x, y| mosaic_value(x + 8, y)).await?;
    let url = write_descriptor(
        dir,
        "tiles.midx",
        serde_json::json!({
            "kind": "mosaic",
            "children": [
                {"name": "left", "url": "./left.idx", "offset": [0, 0]},
                {"name": "right", "url": "./right.idx", "offset": [8, 0]}
            ]
        }),
    )
    .await?;
    Ok(Dataset::open_with(&url, context()).await?)
}

/// Mosaic samples match the tiles at every resolution, fine and coarse blocks alike
#[tokio::test]
async fn test_mosaic_matches_tiles() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let mosaic = open_mosaic(&dir).await?;
    assert_eq!(mosaic.kind_name(), "mosaic");
    assert_eq!(mosaic.logic_box(), &BoxNi::from_dims(&PointNi(vec![16, 8])));
    assert_eq!(mosaic.max_resolution(), 7);

    let access = mosaic.create_access(&AccessConfig::default())?;
    for resolution in [7, 6, 5, 3, 0] {
        let (buffer, samples) = mosaic
            .read_box(&access, mosaic.logic_box().clone(), "data", Some(resolution))
            .await?;
        let dims = samples.nsamples();
        assert_eq!(buffer.dims, dims);
        for py in 0..dims[1] {
            for px in 0..dims[0] {
                let p = samples.pixel_to_logic(&PointNi(vec![px, py]));
                assert_eq!(
                    buffer.get((py * dims[0] + px) as usize, 0),
                    mosaic_value(p[0], p[1]),
                    "resolution {} at {}",
                    resolution,
                    p
                );
            }
        }
    }
    println!("✓ mosaic parity at every resolution");
    Ok(())
}

#[tokio::test]
async fn test_mosaic_region_equals_direct_tile_query() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mosaic = open_mosaic(&dir).await?;
    let right = Dataset::open_with(&dir.path().join("right.idx").to_string_lossy(), context()).await?;

    let access = mosaic.create_access(&AccessConfig::read_only())?;
    let region = BoxNi::new(PointNi(vec![10, 2]), PointNi(vec![14, 6]));
    let (from_mosaic, _) = mosaic.read_box(&access, region, "data", None).await?;

    let tile_access = right.create_access(&AccessConfig::read_only())?;
    let local = BoxNi::new(PointNi(vec![2, 2]), PointNi(vec![6, 6]));
    let (direct, _) = right.read_box(&tile_access, local, "data", None).await?;
    assert_eq!(from_mosaic.data, direct.data);

    let err = mosaic
        .write_box(
            &access,
            mosaic.logic_box().clone(),
            "data",
            Array::new(PointNi(vec![16, 8]), DType::scalar(DataType::U8)),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot be written"));
    Ok(())
}

/// Children `a` and `b` side by side, `c` on top of `a`
async fn open_multi(dir: &TempDir) -> anyhow::Result<Arc<Dataset>> {
    create_child(dir, "a", |_, _| 10.0).await?;
    create_child(dir, "b", |_, _| 20.0).await?;
    create_child(dir, "c", |_, _| 40.0).await?;
    let url = write_descriptor(
        dir,
        "blend.midx",
        serde_json::json!({
            "kind": "multi",
            "children": [
                {"name": "a", "url": "./a.idx"},
                {"name": "b", "url": "./b.idx",
                 "transform": [1, 0, 0, 8, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1]},
                {"name": "c", "url": "./c.idx"}
            ]
        }),
    )
    .await?;
    Ok(Dataset::open_with(&url, context()).await?)
}

fn column(buffer: &Array, x: usize) -> Vec<f64> {
    let width = buffer.dims[0] as usize;
    (0..buffer.dims[1] as usize)
        .map(|y| buffer.get(y * width + x, 0))
        .collect()
}

#[tokio::test]
async fn test_blend_modes() -> anyhow::Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let multi = open_multi(&dir).await?;
    assert_eq!(multi.kind_name(), "multi");
    assert_eq!(multi.logic_box(), &BoxNi::from_dims(&PointNi(vec![16, 8])));
    let access = multi.create_access(&AccessConfig::default())?;
    let full = multi.logic_box().clone();

    let read = |field: &'static str| {
        let multi = Arc::clone(&multi);
        let access = Arc::clone(&access);
        let full = full.clone();
        async move { multi.read_box(&access, full, field, None).await }
    };

    // b alone covers the right half
    let (average, _) = read("averageBlend()").await?;
    assert!(column(&average, 3).iter().all(|&v| v == 25.0));
    assert!(column(&average, 12).iter().all(|&v| v == 20.0));

    let (last, _) = read("noBlend()").await?;
    assert!(column(&last, 3).iter().all(|&v| v == 40.0));
    assert!(column(&last, 12).iter().all(|&v| v == 20.0));

    let (a_last, _) = read("noBlend(c, a)").await?;
    assert!(column(&a_last, 3).iter().all(|&v| v == 10.0));

    // nothing of c reaches outside its box
    let (only_c, _) = read("c.data").await?;
    assert!(column(&only_c, 12).iter().all(|&v| v == 0.0));
    assert_eq!(only_c.alpha_at(12), 0);
    assert_eq!(only_c.alpha_at(3), 255);

    let (nearest, _) = read("voronoi()").await?;
    assert!(column(&nearest, 12).iter().all(|&v| v == 20.0));
    assert!(column(&nearest, 3).iter().all(|&v| v == 10.0 || v == 40.0));
    Ok(())
}

#[tokio::test]
async fn test_blend_region_inside_one_child() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let multi = open_multi(&dir).await?;
    let access = multi.create_access(&AccessConfig::default().with_disable_async(true))?;

    let region = BoxNi::new(PointNi(vec![9, 1]), PointNi(vec![15, 7]));
    let (buffer, samples) = multi.read_box(&access, region.clone(), "averageBlend()", None).await?;
    assert_eq!(samples.logic_box, region);
    assert!((0..buffer.nsamples() as usize).all(|i| buffer.get(i, 0) == 20.0));

    let err = multi
        .read_box(&access, region, "a.data", None)
        .await
        .expect_err("a does not reach the right half");
    assert!(err.to_string().contains("no child dataset contributed"));
    Ok(())
}

/// Abort lands between two levels of a three-child blend
#[tokio::test]
async fn test_abort_composite_query() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let multi = open_multi(&dir).await?;
    let access = multi.create_access(&AccessConfig::default())?;

    let aborted = Aborted::new();
    let mut query = multi
        .create_box_query(multi.logic_box().clone(), "averageBlend()", QueryMode::Read)?
        .with_progression(Progression::Guess)
        .with_aborted(aborted.clone());
    assert!(multi.begin_query(&mut query));
    assert_eq!(query.schedule()[0], 0);

    assert!(multi.execute_query(&access, &mut query).await);
    assert_eq!(query.cur_resolution(), Some(0));
    assert!(multi.advance_query(&mut query));

    aborted.abort();
    assert!(!multi.execute_query(&access, &mut query).await);
    assert_eq!(query.error_message(), Some("aborted"));
    assert!(query.is_failed());
    Ok(())
}

#[tokio::test]
async fn test_composite_opening_errors() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let url = write_descriptor(
        &dir,
        "broken.midx",
        serde_json::json!({
            "kind": "mosaic",
            "children": [{"name": "gone", "url": "./gone.idx", "offset": [0, 0]}]
        }),
    )
    .await?;
    let err = Dataset::open_with(&url, context()).await.unwrap_err();
    assert!(matches!(err, IdxError::CannotOpen(_)));

    let url = write_descriptor(&dir, "odd.midx", serde_json::json!({"kind": "stack"})).await?;
    assert!(Dataset::open_with(&url, context()).await.is_err());
    Ok(())
}
