//! idxstore - multiresolution block storage in HZ order
//!
//! Samples of an N-dimensional lattice are ordered along a hierarchical
//! Z-order curve (HZ order) and grouped into fixed-size blocks, so that every
//! coarser resolution is a prefix of the finer ones. Blocks live in binary
//! files described by a text `.idx` descriptor.
//!
//! # Features
//!
//! - `.idx` descriptor parsing and serialization (versions 1 to 6)
//! - HZ addressing and block enumeration for any box and resolution range
//! - Raw and zlib block codecs
//! - Progressive box queries that refine resolution step by step
//! - Mosaic datasets that tile several datasets on a regular grid
//! - Multi datasets that warp and blend several datasets into one space
//! - Async I/O throughout
//!
//! # Example
//!
//! ```rust,ignore
//! use idxstore::{AccessConfig, BoxNi, Dataset};
//!
//! # async fn example() -> idxstore::Result<()> {
//! let dataset = Dataset::open("file:///data/visus.idx").await?;
//! let access = dataset.create_access(&AccessConfig::default())?;
//! let logic_box = dataset.logic_box().clone();
//! let (array, samples) = dataset.read_box(&access, logic_box, "data", None).await?;
//! println!("{} samples on {:?}", array.nsamples(), samples.nsamples());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod array;
pub mod bitmask;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod disk_access;
pub mod error;
pub mod filename;
pub mod geometry;
pub mod header;
pub mod hzorder;
pub mod idxfile;
pub mod io;
pub mod lock;
pub mod mosaic;
pub mod multi;
pub mod query;
pub mod types;

// Re-exports
pub use access::{Access, IoMode};
pub use array::{Array, BlendMode};
pub use bitmask::Bitmask;
pub use codec::CodecRegistry;
pub use config::{AccessConfig, EnvOverrides};
pub use dataset::{Dataset, DatasetContext};
pub use error::{IdxError, Result};
pub use geometry::{BoxNi, Matrix, PointNi};
pub use hzorder::HzOrder;
pub use idxfile::IdxFile;
pub use lock::WriteLockTable;
pub use query::{BlockQuery, BoxQuery, Progression, QueryMode, QueryStatus};
pub use types::{Aborted, DType, DataType, Field, Layout};

/// Version of the idxstore implementation
pub const IDXSTORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!IDXSTORE_VERSION.is_empty());
    }
}
