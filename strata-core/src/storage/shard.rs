//! One replicated shard: memory database plus block files

use crate::field::FieldMeta;
use crate::kv::{FileStoreWriter, TableReader};
use crate::memdb::{FamilyBuffer, MemoryDatabase};
use crate::metricsdata::{Flusher, Reader};
use crate::{Metric, MetricId, Result, SeriesId, ShardId, StrataError, Timestamp};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Metric, field and series ids referenced by the table files
const IDS_FILE: &str = "ids.meta";

/// Shard statistics
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub database: String,
    pub shard_id: ShardId,
    pub files: usize,
    pub metrics: usize,
    pub series: usize,
    pub families: usize,
    pub buffered_values: usize,
    pub rejected: u64,
}

/// Storage side of one (database, shard)
///
/// Writes land in the memory database; `flush` turns every buffered family
/// into one table file named `{family}-{seq}.sst` holding a metric block per
/// metric. The ids the blocks are keyed by are saved in `ids.meta` before any
/// table file using them.
pub struct Shard {
    database: String,
    shard_id: ShardId,
    dir: PathBuf,
    memdb: Mutex<MemoryDatabase>,
    files: RwLock<Vec<PathBuf>>,
    next_seq: AtomicU64,
    rejected: AtomicU64,
    flush_lock: Mutex<()>,
}

impl Shard {
    /// Open the shard directory, picking up files of previous runs
    pub fn open(
        database: impl Into<String>,
        shard_id: ShardId,
        dir: impl Into<PathBuf>,
        interval_ms: i64,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        let mut max_seq = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some((_, seq)) = parse_file_name(&path) {
                max_seq = max_seq.max(seq);
                files.push(path);
            }
        }
        files.sort_by_key(|p| parse_file_name(p).map(|(_, seq)| seq));

        let mut memdb = MemoryDatabase::new(interval_ms);
        let ids_path = dir.join(IDS_FILE);
        if ids_path.exists() {
            memdb.restore_ids(&std::fs::read(&ids_path)?)?;
        } else if !files.is_empty() {
            warn!(dir = ?dir, "no saved ids, blocks of previous runs have no names");
        }
        // ids of unnamed blocks are never handed out again
        for path in &files {
            match TableReader::open(path) {
                Ok(table) => {
                    if let Some(used) = table.keys().max() {
                        memdb.reserve_metric_ids(used);
                    }
                }
                Err(e) => warn!(path = ?path, error = %e, "unreadable table file"),
            }
        }

        Ok(Self {
            database: database.into(),
            shard_id,
            dir,
            memdb: Mutex::new(memdb),
            files: RwLock::new(files),
            next_seq: AtomicU64::new(max_seq + 1),
            rejected: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Buffer metrics; invalid ones are logged and skipped
    ///
    /// Returns the number of metrics accepted.
    pub fn write(&self, metrics: &[Metric]) -> usize {
        let mut memdb = self.memdb.lock();
        let mut accepted = 0;
        for metric in metrics {
            match memdb.write(metric) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(
                        database = %self.database,
                        shard = self.shard_id,
                        metric = %metric,
                        error = %e,
                        "metric rejected"
                    );
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        accepted
    }

    /// Write every buffered family into a new table file
    ///
    /// Returns the paths of the files written. Families that fail to flush
    /// go back into the memory database and the first error is returned.
    pub fn flush(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.flush_lock.lock();
        let (families, ids) = {
            let mut memdb = self.memdb.lock();
            let families: Vec<_> = memdb
                .take_families()
                .into_iter()
                .filter(|f| !f.is_empty())
                .collect();
            if families.is_empty() {
                return Ok(Vec::new());
            }
            let ids = memdb.encode_ids();
            (families, ids)
        };

        if let Err(e) = ids.and_then(|ids| self.save_ids(&ids)) {
            self.restore_families(families);
            return Err(e);
        }

        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for family in families {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let path = self
                .dir
                .join(format!("{}-{}.sst", family.family_time(), seq));

            match self.flush_family(&family, &path) {
                Ok(blocks) => {
                    debug!(
                        database = %self.database,
                        shard = self.shard_id,
                        family = family.family_time(),
                        blocks,
                        "family flushed"
                    );
                    self.files.write().push(path.clone());
                    written.push(path);
                }
                Err(e) => {
                    error!(
                        database = %self.database,
                        shard = self.shard_id,
                        family = family.family_time(),
                        error = %e,
                        "family flush failed"
                    );
                    // no partial file is left behind
                    let _ = std::fs::remove_file(&path);
                    failed.push(family);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.restore_families(failed);

        if !written.is_empty() {
            info!(
                database = %self.database,
                shard = self.shard_id,
                files = written.len(),
                "shard flushed"
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn flush_family(&self, family: &FamilyBuffer, path: &Path) -> Result<usize> {
        let mut flusher = Flusher::new(FileStoreWriter::create(path)?);
        let blocks = family.flush_to(&mut flusher)?;
        flusher.close()?;
        Ok(blocks)
    }

    fn restore_families(&self, families: Vec<FamilyBuffer>) {
        if families.is_empty() {
            return;
        }
        let mut memdb = self.memdb.lock();
        for family in families {
            memdb.restore_family(family);
        }
    }

    /// Replace `ids.meta` atomically
    fn save_ids(&self, ids: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", IDS_FILE));
        std::fs::write(&tmp, ids)?;
        std::fs::File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, self.dir.join(IDS_FILE)).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            StrataError::Io(e)
        })
    }

    /// Table files of this shard, oldest first
    pub fn files(&self) -> Vec<PathBuf> {
        self.files.read().clone()
    }

    /// Metric blocks of `metric_id` in every file, oldest first
    pub fn blocks(&self, metric_id: MetricId) -> Result<Vec<(Timestamp, Reader)>> {
        let mut blocks = Vec::new();
        for path in self.files() {
            let family = match parse_file_name(&path) {
                Some((family, _)) => family,
                None => continue,
            };
            let table = TableReader::open(&path)?;
            if let Some(data) = table.get(metric_id)? {
                let identifier = format!("{}#{}", path.display(), metric_id);
                blocks.push((family, Reader::new(identifier, data)?));
            }
        }
        Ok(blocks)
    }

    pub fn metric_id(&self, namespace: &str, name: &str) -> Option<MetricId> {
        self.memdb.lock().metric_id(namespace, name)
    }

    pub fn fields(&self, namespace: &str, name: &str) -> Vec<(String, FieldMeta)> {
        self.memdb.lock().fields(namespace, name)
    }

    pub fn series_id(&self, namespace: &str, name: &str, tags: &str) -> Option<SeriesId> {
        self.memdb.lock().series_id(namespace, name, tags)
    }

    pub fn series_ids(&self, namespace: &str, name: &str) -> RoaringBitmap {
        self.memdb.lock().series_ids(namespace, name)
    }

    pub fn stats(&self) -> ShardStats {
        let memdb = self.memdb.lock().stats();
        ShardStats {
            database: self.database.clone(),
            shard_id: self.shard_id,
            files: self.files.read().len(),
            metrics: memdb.metrics,
            series: memdb.series,
            families: memdb.families,
            buffered_values: memdb.buffered_values,
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Parse `{family}-{seq}.sst`
fn parse_file_name(path: &Path) -> Option<(Timestamp, u64)> {
    if path.extension()? != "sst" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (family, seq) = stem.rsplit_once('-')?;
    Some((family.parse().ok()?, seq.parse().ok()?))
}
