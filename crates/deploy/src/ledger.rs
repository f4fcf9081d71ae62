//! Durable record of deployments per network.
//!
//! Entries are keyed by (chain ID, module, spec). They are created as
//! [`LedgerStatus::Pending`] when a creation transaction is submitted and moved
//! to `Confirmed` or `Failed` once its outcome is known. Entries are never
//! deleted.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, TxHash};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Journal file inside a network directory.
pub const JOURNAL_FILENAME: &str = "journal.jsonl";
/// Address snapshot inside a network directory.
pub const ADDRESSES_FILENAME: &str = "deployed_addresses.json";
const LOCK_FILENAME: &str = ".lock";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub chain_id: u64,
    pub module: String,
    pub spec: String,
}

impl LedgerKey {
    pub fn new(chain_id: u64, module: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            chain_id,
            module: module.into(),
            spec: spec.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub chain_id: u64,
    /// Name of the network configuration the entry was written under.
    pub network: String,
    pub module: String,
    pub spec: String,
    pub contract: String,
    pub status: LedgerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// Failure reason for `Failed` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fingerprint of the spec declaration that produced this entry.
    pub fingerprint: String,
    /// Unix timestamp of the last update.
    pub updated_at: i64,
}

impl LedgerEntry {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.chain_id, &self.module, &self.spec)
    }

    /// Address of a confirmed deployment.
    pub fn confirmed_address(&self) -> Option<Address> {
        match self.status {
            LedgerStatus::Confirmed => self.address,
            _ => None,
        }
    }
}

/// Storage for deployment records.
///
/// `put` must be durable when it returns: the next run has to observe it.
/// Concurrent writers for the same key are not supported.
pub trait Ledger: Send {
    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Insert or replace the entry under its key.
    fn put(&mut self, entry: LedgerEntry) -> Result<(), LedgerError>;

    /// All entries of a module on a chain, ordered by spec name.
    fn entries(&self, chain_id: u64, module: &str) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Volatile ledger, mostly for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    entries: BTreeMap<LedgerKey, LedgerEntry>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.entries.insert(entry.key(), entry);
        Ok(())
    }

    fn entries(&self, chain_id: u64, module: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .entries
            .values()
            .filter(|e| e.chain_id == chain_id && e.module == module)
            .cloned()
            .collect())
    }
}

/// File-backed ledger for one network.
///
/// Layout under the ledger root:
///
/// ```text
/// chain-<id>/
///   .lock                    exclusive lock held while the ledger is open
///   journal.jsonl            one JSON entry per line, the last one per key wins
///   deployed_addresses.json  "<module>#<spec>": address of confirmed entries
/// ```
#[derive(Debug)]
pub struct FileLedger {
    dir: PathBuf,
    chain_id: u64,
    journal: File,
    /// Length of the journal up to its last complete record.
    journal_len: u64,
    /// The last record was kept without its terminating newline.
    needs_newline: bool,
    entries: HashMap<LedgerKey, LedgerEntry>,
    // Released on drop.
    _lock: File,
}

impl FileLedger {
    /// Open (creating if needed) the ledger of `chain_id` under `root`.
    ///
    /// Fails with [`LedgerError::Locked`] if another process holds the ledger.
    pub fn open(root: &Path, chain_id: u64) -> Result<Self, LedgerError> {
        let dir = root.join(format!("chain-{chain_id}"));
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let lock_path = dir.join(LOCK_FILENAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| LedgerError::Locked { path: dir.clone() })?;

        let journal_path = dir.join(JOURNAL_FILENAME);
        let replay = Self::replay(&journal_path)?;
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(io_error(&journal_path))?;
        if replay.valid_len < replay.file_len {
            journal
                .set_len(replay.valid_len)
                .and_then(|_| journal.sync_data())
                .map_err(io_error(&journal_path))?;
        }

        tracing::debug!(
            path = %dir.display(),
            entries = replay.entries.len(),
            "Ledger opened"
        );

        Ok(Self {
            dir,
            chain_id,
            journal,
            journal_len: replay.valid_len,
            needs_newline: replay.needs_newline,
            entries: replay.entries,
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the journal.
    ///
    /// An interrupted write can only leave an incomplete last line: it is dropped
    /// (and truncated away by `open`) unless it still holds a complete record.
    /// Anything unreadable before that is corruption.
    fn replay(path: &Path) -> Result<Replay, LedgerError> {
        let mut replay = Replay::default();
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(replay),
            Err(e) => return Err(io_error(path)(e)),
        };
        replay.file_len = content.len() as u64;

        let mut offset = 0u64;
        for (i, chunk) in content.split_inclusive(|&b| b == b'\n').enumerate() {
            offset += chunk.len() as u64;
            let terminated = chunk.ends_with(b"\n");
            let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);

            if line.trim_ascii().is_empty() {
                if terminated {
                    replay.valid_len = offset;
                }
                continue;
            }

            match serde_json::from_slice::<LedgerEntry>(line) {
                Ok(entry) => {
                    replay.entries.insert(entry.key(), entry);
                    replay.valid_len = offset;
                    replay.needs_newline = !terminated;
                }
                Err(error) if !terminated => {
                    tracing::warn!(
                        path = %path.display(),
                        line = i + 1,
                        %error,
                        "Dropping incomplete trailing ledger record"
                    );
                }
                Err(source) => {
                    return Err(LedgerError::Corrupted {
                        path: path.to_path_buf(),
                        line: i + 1,
                        source,
                    });
                }
            }
        }
        Ok(replay)
    }

    fn write_addresses(&self) -> Result<(), LedgerError> {
        let addresses: BTreeMap<String, Address> = self
            .entries
            .values()
            .filter_map(|e| {
                e.confirmed_address()
                    .map(|address| (format!("{}#{}", e.module, e.spec), address))
            })
            .collect();

        let path = self.dir.join(ADDRESSES_FILENAME);
        let json = serde_json::to_string_pretty(&addresses).map_err(LedgerError::Serialize)?;
        std::fs::write(&path, json).map_err(io_error(&path))
    }
}

impl Ledger for FileLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, LedgerError> {
        if key.chain_id != self.chain_id {
            return Ok(None);
        }
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        debug_assert_eq!(entry.chain_id, self.chain_id);

        let journal_path = self.dir.join(JOURNAL_FILENAME);
        let mut line = Vec::new();
        if self.needs_newline {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &entry).map_err(LedgerError::Serialize)?;
        line.push(b'\n');

        if let Err(source) = self
            .journal
            .write_all(&line)
            .and_then(|_| self.journal.sync_data())
        {
            // Drop whatever part of the record made it to disk.
            if let Err(error) = self.journal.set_len(self.journal_len) {
                tracing::error!(
                    path = %journal_path.display(),
                    %error,
                    "Failed to truncate journal after a failed write"
                );
            }
            return Err(io_error(&journal_path)(source));
        }
        self.journal_len += line.len() as u64;
        self.needs_newline = false;

        tracing::trace!(
            module = %entry.module,
            spec = %entry.spec,
            status = %entry.status,
            "Ledger entry written"
        );

        let confirmed = entry.status == LedgerStatus::Confirmed;
        self.entries.insert(entry.key(), entry);
        if confirmed {
            self.write_addresses()?;
        }
        Ok(())
    }

    fn entries(&self, chain_id: u64, module: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.chain_id == chain_id && e.module == module)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.spec.cmp(&b.spec));
        Ok(entries)
    }
}

#[derive(Debug, Default)]
struct Replay {
    entries: HashMap<LedgerKey, LedgerEntry>,
    /// Length up to the end of the last record kept.
    valid_len: u64,
    file_len: u64,
    needs_newline: bool,
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}
