//! Persistent record of content hashes already downloaded.
//!
//! # The MD5 Ledger
//!
//! Before any transfer, the pipeline asks the ledger whether the post's hash
//! has been seen. The check-then-claim sequence holds one mutex, so two
//! workers can never both conclude "not present" and duplicate a transfer.
//!
//! On disk the ledger is an append-only log, one JSON object per line.
//! Appends are the only write the hot path performs, so a crash mid-write
//! can at worst tear the final line — which the loader skips — and never
//! corrupts prior entries. Deletions append tombstone lines; when the log
//! accumulates enough dead weight it is compacted by rewriting to a
//! temporary file and renaming over the original.
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use ibh_common::log::{debug, warn};
use ibh_common::serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append when the log holds this many records beyond the live entries.
const COMPACT_SLACK: usize = 1024;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to access ledger file: {source}")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },

    #[error("Failed to encode ledger record")]
    EncodeError(#[from] serde_json::Error),
}

/// One persisted ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub md5: String,
    pub path: PathBuf,
    /// The file was deleted locally but the hash stays remembered, so the
    /// post is still skipped on re-download.
    #[serde(default)]
    pub deleted: bool,
}

/// Answer to a check-and-claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Hash unknown; it is now claimed for this caller, who must follow up
    /// with [`HashLedger::record`] or [`HashLedger::release`].
    Claimed,
    /// Hash already recorded.
    AlreadyRecorded { path: PathBuf, deleted: bool },
    /// Another worker claimed the hash and is mid-transfer.
    InFlight,
}

#[derive(Debug, Default)]
struct Inner {
    entries: AHashMap<String, LedgerEntry>,
    claims: AHashSet<String>,
    file: Option<File>,
    path: Option<PathBuf>,
    log_records: usize,
}

/// The process-wide hash ledger. Wrap in `Arc` and inject it into every
/// batch; tests use [`HashLedger::in_memory`].
#[derive(Debug, Default)]
pub struct HashLedger {
    inner: Mutex<Inner>,
}

impl HashLedger {
    /// A ledger that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads (or creates) the ledger log at `path`.
    ///
    /// Unreadable lines are skipped with a warning: a torn tail from a crash
    /// mid-append must not take the rest of the ledger down with it.
    pub async fn load(path: &Path) -> Result<Self, LedgerError> {
        let mut entries = AHashMap::new();
        let mut log_records = 0;

        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    log_records += 1;
                    match serde_json::from_str::<LedgerEntry>(line) {
                        Ok(entry) => {
                            entries.insert(entry.md5.clone(), entry);
                        }
                        Err(error) => {
                            warn!("Skipping unreadable ledger line: {error}");
                        }
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("Ledger file not found, starting empty");
            }
            Err(error) => return Err(error.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        debug!("Ledger loaded with {} entries", entries.len());
        Ok(Self {
            inner: Mutex::new(Inner {
                entries,
                claims: AHashSet::new(),
                file: Some(file),
                path: Some(path.to_path_buf()),
                log_records,
            }),
        })
    }

    /// Atomic check-then-claim. Exactly one caller per hash gets
    /// [`LedgerStatus::Claimed`]; everyone else sees the recorded entry or
    /// the in-flight claim.
    pub async fn check_and_claim(&self, md5: &str) -> LedgerStatus {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.entries.get(md5) {
            return LedgerStatus::AlreadyRecorded {
                path: entry.path.clone(),
                deleted: entry.deleted,
            };
        }
        if inner.claims.contains(md5) {
            return LedgerStatus::InFlight;
        }

        inner.claims.insert(md5.to_string());
        LedgerStatus::Claimed
    }

    /// Finalizes a claim after a successful transfer and appends the record.
    pub async fn record(&self, md5: &str, path: &Path) -> Result<(), LedgerError> {
        let entry = LedgerEntry {
            md5: md5.to_string(),
            path: path.to_path_buf(),
            deleted: false,
        };

        let mut inner = self.inner.lock().await;
        inner.claims.remove(md5);
        inner.entries.insert(md5.to_string(), entry.clone());
        Self::append(&mut inner, &entry).await?;
        self.maybe_compact(&mut inner).await
    }

    /// Releases a claim after a failed transfer so the hash can be retried.
    pub async fn release(&self, md5: &str) {
        self.inner.lock().await.claims.remove(md5);
    }

    /// Tombstones a hash: the file is gone but the hash stays remembered.
    pub async fn mark_deleted(&self, md5: &str) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(md5) else {
            return Ok(());
        };
        entry.deleted = true;
        let entry = entry.clone();
        Self::append(&mut inner, &entry).await?;
        self.maybe_compact(&mut inner).await
    }

    /// Forgets a hash entirely, allowing a true re-download.
    pub async fn forget(&self, md5: &str) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(md5).is_some() {
            self.rewrite(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn contains(&self, md5: &str) -> bool {
        self.inner.lock().await.entries.contains_key(md5)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rewrites the log so it holds exactly one line per live entry.
    pub async fn compact(&self) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        self.rewrite(&mut inner).await
    }

    async fn append(inner: &mut Inner, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if let Some(file) = inner.file.as_mut() {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            inner.log_records += 1;
        }
        Ok(())
    }

    async fn maybe_compact(&self, inner: &mut Inner) -> Result<(), LedgerError> {
        if inner.path.is_some() && inner.log_records > inner.entries.len() + COMPACT_SLACK {
            debug!(
                "Compacting ledger: {} log records for {} entries",
                inner.log_records,
                inner.entries.len()
            );
            self.rewrite(inner).await?;
        }
        Ok(())
    }

    /// Tmp-write + rename so a crash mid-compaction leaves the old log
    /// intact.
    async fn rewrite(&self, inner: &mut Inner) -> Result<(), LedgerError> {
        let Some(path) = inner.path.clone() else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");

        let mut content = String::with_capacity(inner.entries.len() * 80);
        for entry in inner.entries.values() {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        inner.file = Some(OpenOptions::new().append(true).open(&path).await?);
        inner.log_records = inner.entries.len();
        Ok(())
    }
}
