use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{DbError, DbResult};

const LOG_FILE: &str = "trellis.log";

/// Binary record appended to the backing log. A batch of puts and deletes
/// becomes visible only once its trailing `Commit` seal is on disk; replay
/// discards any unsealed tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Commit,
}

/// A staged mutation applied through [`Backend::apply`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        WriteOp::Put { key, value }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        WriteOp::Delete { key }
    }
}

/// Tuning knobs for the backing store.
#[derive(Clone, Debug)]
pub struct BackendOptions {
    /// Fsync after every sealed batch.
    pub sync_on_write: bool,
    /// Keep everything in memory; nothing is persisted.
    pub memory_only: bool,
    /// Refuse all mutations.
    pub read_only: bool,
    /// Advisory cap on resident data, in bytes. The live index is also the
    /// cache, so this is recorded for operators rather than enforced.
    pub max_cache_size: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            memory_only: false,
            read_only: false,
            max_cache_size: 64 << 20,
        }
    }
}

struct LogWriter {
    file: BufWriter<File>,
}

/// Log-structured key-value store. All data lives in a single append-only
/// log; an in-memory ordered map over the live keys serves reads and prefix
/// scans and is rebuilt by replaying the log on open.
pub struct Backend {
    path: Option<PathBuf>,
    options: BackendOptions,
    state: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Option<Mutex<LogWriter>>,
}

impl Backend {
    /// Open (or create) the store under `directory`. Memory-only stores
    /// ignore the directory entirely.
    pub fn open(directory: Option<&Path>, options: BackendOptions) -> DbResult<Self> {
        if options.memory_only {
            return Ok(Backend {
                path: None,
                options,
                state: RwLock::new(BTreeMap::new()),
                writer: None,
            });
        }

        let directory = directory.ok_or_else(|| {
            DbError::InvalidArgument("a directory is required unless memory_only is set".into())
        })?;
        fs::create_dir_all(directory)?;
        let path = directory.join(LOG_FILE);

        let state = Self::replay(&path)?;

        let writer = if options.read_only {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            Some(Mutex::new(LogWriter {
                file: BufWriter::new(file),
            }))
        };

        Ok(Backend {
            path: Some(path),
            options,
            state: RwLock::new(state),
            writer,
        })
    }

    /// Replay the log into a fresh map, applying records only up to the
    /// last `Commit` seal. A torn or unreadable tail is dropped.
    fn replay(path: &Path) -> DbResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut state = BTreeMap::new();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(state),
            Err(err) => return Err(err.into()),
        };

        let mut reader = BufReader::new(file);
        let mut pending: Vec<LogRecord> = Vec::new();
        let mut dropped = false;
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                dropped = true;
                break;
            }
            let record: LogRecord = match bincode::deserialize(&payload) {
                Ok(record) => record,
                Err(_) => {
                    dropped = true;
                    break;
                }
            };
            match record {
                LogRecord::Commit => {
                    for staged in pending.drain(..) {
                        match staged {
                            LogRecord::Put { key, value } => {
                                state.insert(key, value);
                            }
                            LogRecord::Delete { key } => {
                                state.remove(&key);
                            }
                            LogRecord::Commit => {}
                        }
                    }
                }
                other => pending.push(other),
            }
        }
        if dropped || !pending.is_empty() {
            warn!("discarding unsealed tail of the backing log");
        }
        Ok(state)
    }

    /// Apply a batch of mutations atomically: the records and their seal
    /// are written to the log before the live index is updated.
    pub fn apply(&self, ops: Vec<WriteOp>) -> DbResult<()> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        if ops.is_empty() {
            return Ok(());
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock();
            for op in &ops {
                let record = match op {
                    WriteOp::Put { key, value } => LogRecord::Put {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    WriteOp::Delete { key } => LogRecord::Delete { key: key.clone() },
                };
                Self::append_record(&mut writer.file, &record)?;
            }
            Self::append_record(&mut writer.file, &LogRecord::Commit)?;
            writer.file.flush()?;
            if self.options.sync_on_write {
                writer.file.get_ref().sync_data()?;
            }
        }

        let mut state = self.state.write();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    state.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    state.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn append_record(file: &mut BufWriter<File>, record: &LogRecord) -> DbResult<()> {
        let payload = bincode::serialize(record)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.read().get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.read().contains_key(key)
    }

    /// All live entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.state.read();
        state
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Rewrite the log from the live index, dropping dead records. Used by
    /// the maintenance worker after pruning.
    pub fn compact(&self) -> DbResult<()> {
        if self.options.read_only {
            return Err(DbError::ReadOnly);
        }
        let (Some(path), Some(writer)) = (&self.path, &self.writer) else {
            return Ok(());
        };

        let mut writer = writer.lock();
        let state = self.state.read();

        let tmp_path = path.with_extension("log.tmp");
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        for (key, value) in state.iter() {
            Self::append_record(
                &mut tmp,
                &LogRecord::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
            )?;
        }
        Self::append_record(&mut tmp, &LogRecord::Commit)?;
        tmp.flush()?;
        tmp.get_ref().sync_data()?;
        drop(tmp);
        fs::rename(&tmp_path, path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        writer.file = BufWriter::new(file);
        Ok(())
    }

    /// Approximate on-disk size in bytes.
    pub fn size(&self) -> u64 {
        match &self.path {
            Some(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            None => self
                .state
                .read()
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum(),
        }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Flush buffered log data to durable storage.
    pub fn sync(&self) -> DbResult<()> {
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock();
            writer.file.flush()?;
            writer.file.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("path", &self.path)
            .field("entries", &self.state.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Backend {
        Backend::open(Some(dir), BackendOptions::default()).expect("open backend")
    }

    #[test]
    fn replay_restores_sealed_batches() {
        let dir = tempdir().expect("tempdir");
        {
            let backend = open(dir.path());
            backend
                .apply(vec![
                    WriteOp::put(b"alpha".to_vec(), b"one".to_vec()),
                    WriteOp::put(b"beta".to_vec(), b"two".to_vec()),
                ])
                .expect("apply");
            backend
                .apply(vec![WriteOp::delete(b"alpha".to_vec())])
                .expect("apply delete");
        }
        let backend = open(dir.path());
        assert_eq!(backend.get(b"alpha"), None);
        assert_eq!(backend.get(b"beta"), Some(b"two".to_vec()));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().expect("tempdir");
        {
            let backend = open(dir.path());
            backend
                .apply(vec![WriteOp::put(b"kept".to_vec(), b"1".to_vec())])
                .expect("apply");
        }
        // Append a record without a seal, then half a record.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE))
                .expect("open log");
            let payload = bincode::serialize(&LogRecord::Put {
                key: b"lost".to_vec(),
                value: b"x".to_vec(),
            })
            .expect("serialize");
            file.write_all(&(payload.len() as u32).to_le_bytes())
                .expect("write len");
            file.write_all(&payload).expect("write payload");
            file.write_all(&[9, 0, 0]).expect("write torn length");
        }
        let backend = open(dir.path());
        assert_eq!(backend.get(b"kept"), Some(b"1".to_vec()));
        assert_eq!(backend.get(b"lost"), None);
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let dir = tempdir().expect("tempdir");
        let backend = open(dir.path());
        backend
            .apply(vec![
                WriteOp::put(vec![0x01, 0x02], b"a".to_vec()),
                WriteOp::put(vec![0x01, 0x01], b"b".to_vec()),
                WriteOp::put(vec![0x02, 0x00], b"c".to_vec()),
            ])
            .expect("apply");
        let hits = backend.scan_prefix(&[0x01]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, vec![0x01, 0x01]);
        assert_eq!(hits[1].0, vec![0x01, 0x02]);
    }

    #[test]
    fn compaction_preserves_state() {
        let dir = tempdir().expect("tempdir");
        let backend = open(dir.path());
        for i in 0..16u8 {
            backend
                .apply(vec![WriteOp::put(vec![i], vec![i])])
                .expect("apply");
        }
        backend
            .apply((0..8u8).map(|i| WriteOp::delete(vec![i])).collect())
            .expect("delete half");
        let before = backend.size();
        backend.compact().expect("compact");
        assert!(backend.size() < before);
        drop(backend);

        let backend = open(dir.path());
        assert_eq!(backend.get(&[3]), None);
        assert_eq!(backend.get(&[12]), Some(vec![12]));
    }

    #[test]
    fn read_only_rejects_mutations() {
        let dir = tempdir().expect("tempdir");
        {
            let backend = open(dir.path());
            backend
                .apply(vec![WriteOp::put(b"k".to_vec(), b"v".to_vec())])
                .expect("apply");
        }
        let backend = Backend::open(
            Some(dir.path()),
            BackendOptions {
                read_only: true,
                ..BackendOptions::default()
            },
        )
        .expect("open read-only");
        assert_eq!(backend.get(b"k"), Some(b"v".to_vec()));
        assert!(matches!(
            backend.apply(vec![WriteOp::delete(b"k".to_vec())]),
            Err(DbError::ReadOnly)
        ));
    }

    #[test]
    fn memory_only_skips_the_log() {
        let backend =
            Backend::open(None, BackendOptions {
                memory_only: true,
                ..BackendOptions::default()
            })
            .expect("open memory");
        backend
            .apply(vec![WriteOp::put(b"k".to_vec(), b"v".to_vec())])
            .expect("apply");
        assert_eq!(backend.get(b"k"), Some(b"v".to_vec()));
    }
}
