//! Block-level access to a dataset - the seam between queries and storage

use crate::array::Array;
use crate::error::{IdxError, Result};
use crate::lock::WriteLockGuard;
use crate::query::BlockQuery;
use crate::types::Field;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;

/// Session mode opened by [`Access::begin_io`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

/// Static description of an access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessInfo {
    pub name: String,
    pub can_read: bool,
    pub can_write: bool,
    pub bitsperblock: u32,
}

/// Strategy that satisfies block reads and writes for one dataset.
///
/// Reads and writes happen inside a `begin_io`/`end_io` session. Read
/// futures are started in issue order and complete independently; `end_io`
/// returns only after every outstanding read has finished.
#[async_trait]
pub trait Access: Send + Sync {
    fn info(&self) -> &AccessInfo;

    /// Currently open session, if any
    fn io_mode(&self) -> Option<IoMode>;

    async fn begin_io(&self, mode: IoMode) -> Result<()>;

    async fn end_io(&self) -> Result<()>;

    /// Read one block. The request is issued before this returns.
    fn read_block(&self, query: BlockQuery) -> BoxFuture<'static, Result<Array>>;

    /// Write `query.buffer`. Writes complete before returning.
    async fn write_block(&self, query: BlockQuery) -> Result<()>;

    /// Lease the file holding a block for a read-modify-write.
    /// `None` when locking is disabled.
    async fn acquire_write_lock(&self, query: &BlockQuery) -> Result<Option<WriteLockGuard>>;

    /// Storage location of a block, for diagnostics
    fn filename(&self, field: &Field, time: f64, blockid: u64) -> Option<String>;

    fn as_any(&self) -> &dyn Any;
}

/// Session bookkeeping shared by access implementations
#[derive(Debug, Default)]
pub struct IoSession {
    mode: Mutex<Option<IoMode>>,
}

impl IoSession {
    pub fn mode(&self) -> Option<IoMode> {
        *self.mode.lock()
    }

    pub fn is_reading(&self) -> bool {
        self.mode() == Some(IoMode::Read)
    }

    pub fn is_writing(&self) -> bool {
        self.mode() == Some(IoMode::Write)
    }

    pub fn begin(&self, info: &AccessInfo, mode: IoMode) -> Result<()> {
        let mut current = self.mode.lock();
        if let Some(open) = *current {
            return Err(IdxError::InvalidQuery(format!(
                "{}: cannot begin {:?}, a {:?} session is open",
                info.name, mode, open
            )));
        }
        match mode {
            IoMode::Read if !info.can_read => Err(IdxError::Unsupported(format!(
                "{} cannot read",
                info.name
            ))),
            IoMode::Write if !info.can_write => Err(IdxError::Unsupported(format!(
                "{} cannot write",
                info.name
            ))),
            _ => {
                *current = Some(mode);
                Ok(())
            }
        }
    }

    pub fn end(&self) {
        *self.mode.lock() = None;
    }

    /// Fail unless a session is open (any mode when `mode` is `None`)
    pub fn require(&self, info: &AccessInfo, mode: Option<IoMode>) -> Result<()> {
        match (self.mode(), mode) {
            (Some(_), None) => Ok(()),
            (Some(open), Some(wanted)) if open == wanted => Ok(()),
            (open, _) => Err(IdxError::InvalidQuery(format!(
                "{}: no {} session open (current {:?})",
                info.name,
                match mode {
                    Some(IoMode::Write) => "write",
                    Some(IoMode::Read) => "read",
                    None => "io",
                },
                open
            ))),
        }
    }
}
