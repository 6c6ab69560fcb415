//! Parallel extraction of the embedded tar payload.
//!
//! Entries are demultiplexed sequentially from the decompressed stream.
//! Small regular files are buffered and written by a fixed pool of workers;
//! large files, directories and symlinks are handled inline on the demux
//! thread. Every entry is resolved against the canonical destination root
//! before anything touches the filesystem.
//!
//! The demux settles the pool (waits until every queued write has landed)
//! before it creates a symlink and before it touches a path that is still
//! queued. A queued write therefore never runs against a tree that gained a
//! link after the write was checked, and duplicate entries land in archive
//! order.

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write, ErrorKind::NotFound},
    path::{Component, Path, PathBuf},
    sync::{mpsc::{sync_channel, Receiver, SyncSender}, Condvar, Mutex},
    thread,
};

use cfg_if::cfg_if;
use flate2::read::GzDecoder;
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace, warn};

use crate::error::ExtractError;


/// Regular files below this size are buffered and handed to the pool.
pub const BUFFER_LIMIT: u64 = 1024 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
#[cfg(feature = "zstd")]
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub workers: usize,
    pub buffer_limit: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            workers: num_cpus::get().max(1),
            buffer_limit: BUFFER_LIMIT,
        }
    }
}

struct FileJob {
    dest: PathBuf,
    data: Vec<u8>,
    mode: u32,
}

/// First error reported by the demux thread or any worker.
#[derive(Default)]
struct Failure(Mutex<Option<ExtractError>>);

impl Failure {
    fn set(&self, err: ExtractError) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err)
        }
    }

    fn is_set(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn take(&self) -> Option<ExtractError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Number of jobs handed to the pool and not yet finished.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all()
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    dirs: usize,
    buffered: usize,
    streamed: usize,
    links: usize,
    skipped: usize,
    settles: usize,
}

pub fn extract(payload: &[u8], dest: &Path) -> Result<(), ExtractError> {
    extract_with(payload, dest, &ExtractOptions::default())
}

pub fn extract_with(payload: &[u8], dest: &Path, options: &ExtractOptions) -> Result<(), ExtractError> {
    let archive = Archive::new(decoder(payload)?);

    fs::create_dir_all(dest).map_err(|e| ExtractError::write(dest, e))?;
    let root = dest.canonicalize()
        .map_err(|e| ExtractError::io(format!("resolving {}", dest.display()), e))?;

    let workers = options.workers.max(1);
    let (tx, rx) = sync_channel::<FileJob>(workers * 2);
    let rx = Mutex::new(rx);
    let failure = Failure::default();
    let pending = Pending::default();
    debug!(root = %root.display(), workers, "extracting payload");

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker(&rx, &pending, &failure));
        }
        let demux = Demux {
            root: &root,
            buffer_limit: options.buffer_limit,
            jobs: tx,
            pending: &pending,
            failure: &failure,
            queued: HashSet::new(),
            links_created: false,
            stats: Stats::default(),
        };
        // demux owns the sender, so the pool drains and exits once it returns
        if let Err(err) = demux.run(archive) {
            failure.set(err)
        }
    });

    match failure.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn decoder(payload: &[u8]) -> Result<Box<dyn Read + '_>, ExtractError> {
    if payload.starts_with(GZIP_MAGIC) {
        return Ok(Box::new(GzDecoder::new(payload)))
    }
    cfg_if! {
        if #[cfg(feature = "zstd")] {
            if payload.starts_with(ZSTD_MAGIC) {
                let decoder = zstd::stream::read::Decoder::with_buffer(payload)
                    .map_err(ExtractError::Decompress)?;
                return Ok(Box::new(decoder))
            }
        }
    }
    Err(ExtractError::UnknownCompression)
}

fn worker(jobs: &Mutex<Receiver<FileJob>>, pending: &Pending, failure: &Failure) {
    loop {
        let job = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(job) = job else { return };
        // keep draining after a failure so the demux never blocks on a full queue
        if !failure.is_set() {
            if let Err(err) = write_file(&job.dest, &job.data, job.mode) {
                failure.set(err)
            }
        }
        pending.done();
    }
}

struct Demux<'a> {
    root: &'a Path,
    buffer_limit: u64,
    jobs: SyncSender<FileJob>,
    pending: &'a Pending,
    failure: &'a Failure,
    /// Destinations handed to the pool since the last settle.
    queued: HashSet<PathBuf>,
    links_created: bool,
    stats: Stats,
}

impl Demux<'_> {
    fn run<R: Read>(mut self, mut archive: Archive<R>) -> Result<(), ExtractError> {
        for entry in archive.entries().map_err(ExtractError::Archive)? {
            if self.failure.is_set() {
                debug!("worker failed, stopping demux");
                return Ok(())
            }
            let entry = entry.map_err(ExtractError::Archive)?;
            self.entry(entry)?;
        }
        debug!(stats = ?self.stats, "payload demultiplexed");
        Ok(())
    }

    fn entry<R: Read>(&mut self, mut entry: Entry<'_, R>) -> Result<(), ExtractError> {
        let name = entry.path().map_err(ExtractError::Archive)?.into_owned();
        let kind = entry.header().entry_type();
        let target = resolve(self.root, &name);

        if target == self.root && kind == EntryType::Directory {
            trace!(name = %name.display(), "skipping root entry");
            return Ok(())
        }
        if target == self.root || !target.starts_with(self.root) {
            return Err(ExtractError::PathTraversal(name))
        }
        if (kind == EntryType::Symlink || self.queued.contains(&target)) && !self.settle() {
            return Ok(())
        }
        if self.links_created {
            self.check_ancestors(&target, &name)?;
        }

        match kind {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| ExtractError::write(&target, e))?;
                self.stats.dirs += 1;
            }
            EntryType::Regular => {
                let mode = entry.header().mode().map_err(ExtractError::Archive)? & 0o7777;
                if self.links_created {
                    unlink_symlink(&target)?;
                }
                let size = entry.size();
                if size < self.buffer_limit {
                    let mut data = Vec::with_capacity(size as usize);
                    entry.read_to_end(&mut data).map_err(ExtractError::Archive)?;
                    trace!(name = %name.display(), size, "queueing buffered file");
                    self.queue(FileJob { dest: target, data, mode })?;
                    self.stats.buffered += 1;
                } else {
                    trace!(name = %name.display(), size, "streaming large file");
                    stream_file(&mut entry, &target, mode)?;
                    self.stats.streamed += 1;
                }
            }
            EntryType::Symlink => {
                let Some(link) = entry.link_name().map_err(ExtractError::Archive)? else {
                    warn!(name = %name.display(), "symlink without target, skipping");
                    return Ok(())
                };
                create_parent(&target)?;
                let _ = fs::remove_file(&target).or_else(|_| fs::remove_dir(&target));
                cfg_if! {
                    if #[cfg(unix)] {
                        std::os::unix::fs::symlink(&link, &target)
                            .map_err(|e| ExtractError::write(&target, e))?;
                        self.links_created = true;
                        self.stats.links += 1;
                    } else {
                        warn!(name = %name.display(), link = %link.display(), "symlinks unsupported, skipping");
                    }
                }
            }
            other => {
                trace!(name = %name.display(), kind = ?other, "ignoring entry");
                self.stats.skipped += 1;
            }
        }
        Ok(())
    }

    fn queue(&mut self, job: FileJob) -> Result<(), ExtractError> {
        self.queued.insert(job.dest.clone());
        self.pending.add();
        self.jobs.send(job).map_err(|_| {
            self.pending.done();
            ExtractError::WorkerLost
        })
    }

    /// Waits for every queued write. Returns false if one of them failed,
    /// in which case the current entry is dropped and the demux stops.
    fn settle(&mut self) -> bool {
        if !self.queued.is_empty() {
            self.pending.wait_idle();
            self.queued.clear();
            self.stats.settles += 1;
        }
        !self.failure.is_set()
    }

    /// Once a link exists in the tree, a lexically contained path may still
    /// land outside the root through it. The nearest existing ancestor must
    /// resolve under the root.
    fn check_ancestors(&self, target: &Path, name: &Path) -> Result<(), ExtractError> {
        let mut ancestor = target.parent();
        while let Some(dir) = ancestor {
            if dir == self.root {
                return Ok(())
            }
            match fs::symlink_metadata(dir) {
                Ok(_) => {
                    return match dir.canonicalize() {
                        Ok(real) if real.starts_with(self.root) => Ok(()),
                        _ => Err(ExtractError::PathTraversal(name.to_path_buf())),
                    }
                }
                Err(e) if e.kind() == NotFound => ancestor = dir.parent(),
                Err(e) => return Err(ExtractError::io(format!("inspecting {}", dir.display()), e)),
            }
        }
        Ok(())
    }
}

/// Joins `name` onto `root` lexically. Absolute names are rooted under
/// `root`; `..` may climb above it, containment is the caller's check.
fn resolve(root: &Path, name: &Path) -> PathBuf {
    let mut target = root.to_path_buf();
    for component in name.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => { target.pop(); }
            Component::Normal(part) => target.push(part),
        }
    }
    target
}

fn unlink_symlink(path: &Path) -> Result<(), ExtractError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(path).map_err(|e| ExtractError::write(path, e))
        }
        _ => Ok(()),
    }
}

fn create_parent(path: &Path) -> Result<(), ExtractError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| ExtractError::write(parent, e)),
        None => Ok(()),
    }
}

fn create_file(path: &Path, mode: u32) -> Result<File, ExtractError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        } else {
            let _ = mode;
        }
    }
    options.open(path).map_err(|e| ExtractError::write(path, e))
}

/// Applies the stored bits verbatim, bypassing the process umask.
fn apply_mode(file: &File, path: &Path, mode: u32) -> Result<(), ExtractError> {
    cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(mode))
                .map_err(|e| ExtractError::write(path, e))
        } else {
            let _ = file;
            warn!(path = %path.display(), mode = %format!("{mode:o}"), "file modes unsupported, skipping");
            Ok(())
        }
    }
}

fn write_file(dest: &Path, data: &[u8], mode: u32) -> Result<(), ExtractError> {
    create_parent(dest)?;
    let mut file = create_file(dest, mode)?;
    file.write_all(data).map_err(|e| ExtractError::write(dest, e))?;
    apply_mode(&file, dest, mode)
}

fn stream_file(entry: &mut impl Read, dest: &Path, mode: u32) -> Result<(), ExtractError> {
    create_parent(dest)?;
    let mut file = create_file(dest, mode)?;
    io::copy(entry, &mut file).map_err(|e| ExtractError::write(dest, e))?;
    apply_mode(&file, dest, mode)
}
