//! Disk-backed access to the block files of one `.idx` dataset
//!
//! Reads may run on one dedicated worker thread so that requests are served
//! in issue order. Everything else runs on tokio's blocking pool. Each side
//! owns its own open file and cached header table.

use crate::access::{Access, AccessInfo, IoMode, IoSession};
use crate::array::Array;
use crate::codec::CodecRegistry;
use crate::config::{AccessConfig, DiskAccessSettings, EnvOverrides};
use crate::error::{IdxError, Result};
use crate::filename::{filename_v1234, filename_v56, resolve_aliases};
use crate::header::{CompressionTag, HeaderTableV5, HeaderTableV6};
use crate::hzorder::HzOrder;
use crate::idxfile::IdxFile;
use crate::io::{local_path, DataFile, FileMode};
use crate::lock::{WriteLockGuard, WriteLockTable};
use crate::query::BlockQuery;
use crate::types::{DataType, Field, Layout};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Filename of the file holding `blockid`
pub fn block_filename(
    idxfile: &IdxFile,
    time_template: &str,
    filename_template: &str,
    time: f64,
    blockid: u64,
) -> Result<String> {
    let first_block = idxfile.first_block_in_file(blockid);
    if idxfile.version < 5 {
        filename_v1234(filename_template, time_template, time, first_block)
    } else {
        filename_v56(filename_template, time_template, time, first_block)
    }
}

#[derive(Debug)]
enum Headers {
    V5(HeaderTableV5),
    V6(HeaderTableV6),
}

#[derive(Debug)]
struct OpenFile {
    filename: String,
    file: DataFile,
    headers: Headers,
}

/// Synchronous block file reader/writer with one open file at a time
#[derive(Debug)]
struct BlockFiles {
    idxfile: Arc<IdxFile>,
    hzorder: HzOrder,
    time_template: String,
    filename_template: String,
    codecs: Arc<CodecRegistry>,
    verbose: bool,
    open: Option<OpenFile>,
}

impl BlockFiles {
    fn filename(&self, time: f64, blockid: u64) -> Result<String> {
        let name = block_filename(
            &self.idxfile,
            &self.time_template,
            &self.filename_template,
            time,
            blockid,
        )?;
        if name.is_empty() {
            return Err(IdxError::InvalidQuery(format!("no filename for block {}", blockid)));
        }
        Ok(local_path(&name).to_string())
    }

    fn nfields(&self) -> usize {
        self.idxfile.fields.len()
    }

    fn blocksperfile(&self) -> usize {
        self.idxfile.blocksperfile.max(1) as usize
    }

    fn header_size(&self) -> usize {
        if self.idxfile.version < 6 {
            HeaderTableV5::byte_size(self.idxfile.version, self.nfields(), self.blocksperfile())
        } else {
            HeaderTableV6::byte_size(self.nfields(), self.blocksperfile())
        }
    }

    fn decode_headers(&self, bytes: &[u8]) -> Result<Headers> {
        if self.idxfile.version < 6 {
            Ok(Headers::V5(HeaderTableV5::decode(
                bytes,
                self.idxfile.version,
                self.nfields(),
                self.blocksperfile(),
            )?))
        } else {
            Ok(Headers::V6(HeaderTableV6::decode(
                bytes,
                self.nfields(),
                self.blocksperfile(),
            )?))
        }
    }

    fn open_file(&mut self, filename: &str, mode: FileMode) -> Result<&mut OpenFile> {
        let reuse = matches!(&self.open, Some(o) if o.filename == filename && o.file.mode() == mode);
        if !reuse {
            self.close_file("need to open another file")?;

            if self.verbose {
                info!(filename, ?mode, "opening file");
            }

            let opened = match DataFile::open(filename, mode) {
                Ok(mut file) => {
                    let bytes = file.read_at(0, self.header_size()).map_err(|_| {
                        IdxError::InvalidFormat(format!("cannot read headers of {}", filename))
                    })?;
                    let headers = self.decode_headers(&bytes)?;
                    OpenFile {
                        filename: filename.to_string(),
                        file,
                        headers,
                    }
                }
                Err(e) if mode == FileMode::Read || self.idxfile.version < 6 => return Err(e),
                Err(_) => self.create_file(filename)?,
            };
            self.open = Some(opened);
        }
        self.open
            .as_mut()
            .ok_or_else(|| IdxError::CannotOpen(filename.to_string()))
    }

    /// New file with a zero-filled header region
    fn create_file(&self, filename: &str) -> Result<OpenFile> {
        let mut file = DataFile::create(filename)?;
        let headers = HeaderTableV6::new(self.nfields(), self.blocksperfile());
        if let Err(e) = headers.encode().and_then(|bytes| file.write_at(0, &bytes)) {
            drop(file);
            if let Err(rm) = std::fs::remove_file(filename) {
                warn!(filename, error = %rm, "cannot remove partially created file");
            }
            return Err(e);
        }
        Ok(OpenFile {
            filename: filename.to_string(),
            file,
            headers: Headers::V6(headers),
        })
    }

    /// Persist headers of a writable file and close it
    fn close_file(&mut self, reason: &str) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        if self.verbose {
            info!(filename = %open.filename, mode = ?open.file.mode(), reason, "closing file");
        }
        if open.file.can_write() {
            let bytes = match &open.headers {
                Headers::V6(table) => table.encode()?,
                Headers::V5(table) => table.encode()?,
            };
            open.file.write_at(0, &bytes)?;
            open.file.flush()?;
        }
        Ok(())
    }

    fn read_block(&mut self, query: &BlockQuery, writing: bool) -> Result<Array> {
        let result = self.try_read_block(query, writing);
        if self.verbose {
            match &result {
                Ok(_) => info!(blockid = query.blockid, "read block ok"),
                Err(e) => info!(blockid = query.blockid, error = %e, "read block failed"),
            }
        }
        result
    }

    fn try_read_block(&mut self, query: &BlockQuery, writing: bool) -> Result<Array> {
        query.aborted.check()?;

        let blockid = query.blockid;
        let field = &query.field;
        let filename = self.filename(query.time, blockid)?;
        let position = self.idxfile.block_position_in_file(blockid);
        let mode = if writing && self.idxfile.version >= 6 {
            FileMode::ReadWrite
        } else {
            FileMode::Read
        };
        let version = self.idxfile.version;
        let verbose = self.verbose;
        let open = self.open_file(&filename, mode)?;

        query.aborted.check()?;

        let (offset, size, tag, layout) = match &open.headers {
            Headers::V6(table) => {
                let header = table.get(field.index, position)?;
                (header.offset(), header.size, header.compression()?, header.layout())
            }
            Headers::V5(table) => {
                let header = table.get(field.index, position)?;
                (header.offset as u64, header.len, header.compression(), Layout::HzOrder)
            }
        };
        let mut compression = tag.name().to_string();

        if verbose {
            info!(blockid, offset, size, compression = %compression, ?layout, "block header");
        }
        if offset == 0 || size == 0 {
            return Err(IdxError::NotStored {
                blockid,
                offset,
                size,
            });
        }

        query.aborted.check()?;
        let encoded = open.file.read_at(offset, size as usize)?;
        query.aborted.check()?;

        // the tag alone does not carry zfp parameters
        if compression == "zfp" && field.default_compression.starts_with("zfp") {
            compression = field.default_compression.clone();
        }

        let nsamples = query.samples_count();
        let decoded = self
            .codecs
            .decode(&compression, &encoded, field.dtype, nsamples)?;

        let dims = self.hzorder.block_samples(blockid, query.bitsperblock()).nsamples();
        let mut block = Array::from_bytes(dims, field.dtype, layout, decoded)?;

        if version <= 2 && field.dtype.is_vector_of(DataType::F32) {
            if verbose {
                info!(blockid, "swapping float32 byte order");
            }
            block.swap_float32_from_big_endian();
        }
        Ok(block)
    }

    fn write_block(&mut self, query: &BlockQuery) -> Result<()> {
        let result = self.try_write_block(query);
        match &result {
            Ok(()) if self.verbose => info!(blockid = query.blockid, "write block ok"),
            Ok(()) => {}
            Err(e) => warn!(blockid = query.blockid, error = %e, "write block failed"),
        }
        result
    }

    fn try_write_block(&mut self, query: &BlockQuery) -> Result<()> {
        if self.idxfile.version < 6 {
            return Err(IdxError::Unsupported(format!(
                "writing version {} files",
                self.idxfile.version
            )));
        }
        let blockid = query.blockid;
        let field = &query.field;
        let buffer = query
            .buffer
            .as_ref()
            .ok_or_else(|| IdxError::InvalidQuery("write block without buffer".to_string()))?;

        let nsamples = query.samples_count();
        let expected = field.dtype.byte_size(nsamples);
        if buffer.dtype != field.dtype || buffer.byte_size() != expected {
            return Err(IdxError::DTypeMismatch(format!(
                "block {} buffer has {} bytes of {}, expected {} bytes of {}",
                blockid,
                buffer.byte_size(),
                buffer.dtype,
                expected,
                field.dtype
            )));
        }

        let compression = field.default_compression.as_str();
        let tag = CompressionTag::from_name(compression)?;
        let encoded = self
            .codecs
            .encode(compression, buffer.as_bytes(), field.dtype, nsamples)?;
        let encoded_size = u32::try_from(encoded.len()).map_err(|_| {
            IdxError::Encode(format!("block {} encodes to {} bytes", blockid, encoded.len()))
        })?;

        let filename = self.filename(query.time, blockid)?;
        let position = self.idxfile.block_position_in_file(blockid);
        let open = self.open_file(&filename, FileMode::ReadWrite)?;
        let Headers::V6(table) = &mut open.headers else {
            return Err(IdxError::InvalidFormat(format!("{} is not a version 6 file", filename)));
        };

        let existing = *table.get(field.index, position)?;
        let mut header = existing;
        header.size = encoded_size;
        header.set_encoding(tag, buffer.layout);

        let offset = if existing.is_stored() && encoded_size <= existing.size {
            existing.offset()
        } else {
            open.file.size()?
        };
        open.file.write_at(offset, &encoded)?;
        header.set_offset(offset);
        *table.get_mut(field.index, position)? = header;
        Ok(())
    }
}

impl Drop for BlockFiles {
    fn drop(&mut self) {
        if let Err(e) = self.close_file("dropped") {
            warn!(error = %e, "cannot persist headers");
        }
    }
}

enum Job {
    Read(BlockQuery, oneshot::Sender<Result<Array>>),
    End(oneshot::Sender<Result<()>>),
}

/// The single background read worker
struct Worker {
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(mut files: BlockFiles) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("idx-disk-access".to_string())
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Read(query, reply) => {
                            let _ = reply.send(files.read_block(&query, false));
                        }
                        Job::End(reply) => {
                            let _ = reply.send(files.close_file("end_io"));
                        }
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn send(&self, job: Job) -> Result<()> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(job).ok())
            .ok_or_else(worker_gone)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("disk access worker panicked");
            }
        }
    }
}

fn task_failed(e: tokio::task::JoinError) -> IdxError {
    IdxError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn worker_gone() -> IdxError {
    IdxError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "disk access worker stopped",
    ))
}

/// Access to the V5/V6 block files of an `.idx` dataset
pub struct DiskAccess {
    info: AccessInfo,
    settings: DiskAccessSettings,
    idxfile: Arc<IdxFile>,
    hzorder: HzOrder,
    time_template: String,
    filename_template: String,
    session: IoSession,
    sync: Arc<Mutex<BlockFiles>>,
    worker: Option<Worker>,
    locks: Arc<WriteLockTable>,
}

impl std::fmt::Debug for DiskAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskAccess")
            .field("info", &self.info)
            .field("settings", &self.settings)
            .field("async", &self.worker.is_some())
            .finish()
    }
}

impl DiskAccess {
    /// `url` is the location of the descriptor; relative templates resolve against it
    pub fn new(
        idxfile: Arc<IdxFile>,
        url: &str,
        config: &AccessConfig,
        env: &EnvOverrides,
        codecs: Arc<CodecRegistry>,
        locks: Arc<WriteLockTable>,
    ) -> Result<Self> {
        if !(1..=6).contains(&idxfile.version) {
            return Err(IdxError::UnsupportedVersion(idxfile.version));
        }
        let hzorder = idxfile.hzorder()?;
        let mut settings = DiskAccessSettings::resolve(config, env);
        if idxfile.version < 6 && settings.can_write {
            debug!(version = idxfile.version, "legacy files are read only");
            settings.can_write = false;
        }

        let time_template = resolve_aliases(&idxfile.time_template, url);
        let filename_template = resolve_aliases(&idxfile.filename_template, url);

        let make_files = || BlockFiles {
            idxfile: Arc::clone(&idxfile),
            hzorder: hzorder.clone(),
            time_template: time_template.clone(),
            filename_template: filename_template.clone(),
            codecs: Arc::clone(&codecs),
            verbose: settings.verbose,
            open: None,
        };

        let worker = if settings.disable_async {
            None
        } else {
            Some(Worker::spawn(make_files())?)
        };
        let sync = Arc::new(Mutex::new(make_files()));

        let info = AccessInfo {
            name: settings.name.clone(),
            can_read: settings.can_read,
            can_write: settings.can_write,
            bitsperblock: idxfile.bitsperblock,
        };

        if settings.verbose {
            info!(url, name = %info.name, async_read = worker.is_some(), "disk access created");
        }

        Ok(Self {
            info,
            settings,
            idxfile,
            hzorder,
            time_template,
            filename_template,
            session: IoSession::default(),
            sync,
            worker,
            locks,
        })
    }

    pub fn settings(&self) -> &DiskAccessSettings {
        &self.settings
    }

    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    fn use_worker(&self) -> Option<&Worker> {
        if self.session.is_writing() {
            None
        } else {
            self.worker.as_ref()
        }
    }
}

#[async_trait]
impl Access for DiskAccess {
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
        let result = match self.use_worker() {
            Some(worker) => {
                let (tx, rx) = oneshot::channel();
                match worker.send(Job::End(tx)) {
                    Ok(()) => rx.await.map_err(|_| worker_gone()).and_then(|r| r),
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };
        let files = Arc::clone(&self.sync);
        let closed = tokio::task::spawn_blocking(move || files.lock().close_file("end_io"))
            .await
            .map_err(task_failed)
            .and_then(|r| r);
        self.session.end();
        result.and(closed)
    }

    fn read_block(&self, query: BlockQuery) -> BoxFuture<'static, Result<Array>> {
        if let Err(e) = self.session.require(&self.info, None) {
            return future::ready(Err(e)).boxed();
        }
        if self.settings.verbose {
            info!(blockid = query.blockid, "got request to read block");
        }

        if self.settings.skip_reading {
            let dims = self
                .hzorder
                .block_samples(query.blockid, query.bitsperblock())
                .nsamples();
            let mut block = Array::new(dims, query.field.dtype);
            block.layout = Layout::RowMajor;
            return future::ready(Ok(block)).boxed();
        }

        match self.use_worker() {
            Some(worker) => {
                let (tx, rx) = oneshot::channel();
                if let Err(e) = worker.send(Job::Read(query, tx)) {
                    return future::ready(Err(e)).boxed();
                }
                async move { rx.await.map_err(|_| worker_gone())? }.boxed()
            }
            None => {
                let writing = self.session.is_writing();
                let files = Arc::clone(&self.sync);
                let task = tokio::task::spawn_blocking(move || files.lock().read_block(&query, writing));
                async move { task.await.map_err(task_failed)? }.boxed()
            }
        }
    }

    async fn write_block(&self, query: BlockQuery) -> Result<()> {
        self.session.require(&self.info, Some(IoMode::Write))?;
        if self.settings.verbose {
            info!(blockid = query.blockid, "got request to write block");
        }
        if self.settings.skip_writing {
            return Ok(());
        }
        let _lease = self.acquire_write_lock(&query).await?;
        let files = Arc::clone(&self.sync);
        tokio::task::spawn_blocking(move || files.lock().write_block(&query))
            .await
            .map_err(task_failed)?
    }

    async fn acquire_write_lock(&self, query: &BlockQuery) -> Result<Option<WriteLockGuard>> {
        if self.settings.disable_write_locks || self.settings.skip_writing {
            return Ok(None);
        }
        self.session.require(&self.info, Some(IoMode::Write))?;
        let filename = self
            .filename(&query.field, query.time, query.blockid)
            .ok_or_else(|| IdxError::InvalidQuery(format!("no filename for block {}", query.blockid)))?;
        Ok(Some(self.locks.acquire(local_path(&filename)).await?))
    }

    fn filename(&self, _field: &Field, time: f64, blockid: u64) -> Option<String> {
        block_filename(
            &self.idxfile,
            &self.time_template,
            &self.filename_template,
            time,
            blockid,
        )
        .ok()
        .filter(|name| !name.is_empty())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
