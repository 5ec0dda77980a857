//! Durable store backed by an append-only JSON-lines file.
//!
//! Every mutation is written and synced before it is applied to the
//! in-memory tables, under one async lock. A failed write therefore leaves
//! the tables untouched. A failed or cancelled write marks the journal
//! degraded. The next write truncates the file back to the end of the last
//! complete line and clears the mark once it succeeds.

use crate::state::{
    BudgetRow, BudgetStore, Budgets, Claim, Consume, Entries, HistoryStore, StoreError, Tier,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};
use tracing::{info, warn};
use wheelspin_types::{BudgetKey, HistoryEntry, HistoryFilter, NewEntry, SpinBudget, Stats};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Budget {
        key: BudgetKey,
        row: BudgetRow,
    },
    Append {
        entry: HistoryEntry,
    },
    Claim {
        spin_id: u64,
        claimed_at: u64,
        entry: HistoryEntry,
    },
}

struct Inner {
    file: File,
    /// File length after the last complete write.
    len: u64,
    budgets: Budgets,
    entries: Entries,
    failed: Arc<AtomicBool>,
}

/// Marks the journal failed unless the write it guards completes.
struct Pending {
    failed: Arc<AtomicBool>,
    done: bool,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if !self.done {
            self.failed.store(true, Ordering::Release);
        }
    }
}

impl Inner {
    async fn write(&mut self, record: &Record) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        line.push(b'\n');

        if self.failed.load(Ordering::Acquire) {
            // Drop whatever the interrupted write left past the last full line.
            self.file.set_len(self.len).await?;
            warn!(len = self.len, "truncated journal after a failed write");
        }
        let mut pending = Pending {
            failed: self.failed.clone(),
            done: false,
        };
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        pending.done = true;
        self.len += line.len() as u64;
        if self.failed.swap(false, Ordering::AcqRel) {
            info!("journal recovered");
        }
        Ok(())
    }

    fn replay(&mut self, record: Record) {
        match record {
            Record::Budget { key, row } => self.budgets.apply(key, row),
            Record::Append { entry } => self.entries.apply_append(entry),
            Record::Claim {
                spin_id,
                claimed_at,
                entry,
            } => self.entries.apply_claim(spin_id, claimed_at, entry),
        }
    }
}

/// File-backed [BudgetStore] and [HistoryStore].
pub struct Journal {
    path: PathBuf,
    failed: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

impl Journal {
    /// Open (or create) the journal at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (records, valid) = parse(&contents)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut len = valid.len() as u64;
        if valid.len() < contents.len() {
            file.set_len(len).await?;
        }
        if !valid.is_empty() && !valid.ends_with('\n') {
            // The last record is whole but lost its newline.
            file.write_all(b"\n").await?;
            file.flush().await?;
            len += 1;
        }
        let failed = Arc::new(AtomicBool::new(false));
        let mut inner = Inner {
            file,
            len,
            budgets: Budgets::default(),
            entries: Entries::default(),
            failed: failed.clone(),
        };
        let replayed = records.len();
        for record in records {
            inner.replay(record);
        }
        info!(path = %path.display(), records = replayed, "opened journal");

        Ok(Self {
            path,
            failed,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().await
    }
}

/// Parse journal lines, returning the records and the prefix of `contents`
/// they came from. An unparsable final line is a torn write and is left out
/// of the prefix; an unparsable line anywhere else is corruption.
fn parse(contents: &str) -> Result<(Vec<Record>, &str), StoreError> {
    let mut records = Vec::new();
    let mut valid = 0;
    let mut lines = contents.split_inclusive('\n').enumerate();
    while let Some((i, line)) = lines.next() {
        if line.trim().is_empty() {
            valid += line.len();
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(record) => {
                records.push(record);
                valid += line.len();
            }
            Err(e) if lines.clone().all(|(_, rest)| rest.trim().is_empty()) => {
                warn!(line = i + 1, "Skipping torn journal tail: {}", e);
                break;
            }
            Err(e) => {
                return Err(StoreError::Corrupt(format!("line {}: {}", i + 1, e)));
            }
        }
    }
    Ok((records, &contents[..valid]))
}

impl Tier for Journal {
    fn backend(&self) -> &'static str {
        "journal"
    }

    /// True from a failed or cancelled write until the next one succeeds.
    fn degraded(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl BudgetStore for Journal {
    async fn budget(&self, key: &BudgetKey) -> Result<SpinBudget, StoreError> {
        Ok(self.lock().await.budgets.status(key))
    }

    async fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> Result<SpinBudget, StoreError> {
        let mut inner = self.lock().await;
        let (key, row) = inner.budgets.plan_set_limit(key, max_spins);
        inner
            .write(&Record::Budget {
                key: key.clone(),
                row: row.clone(),
            })
            .await?;
        let budget = row.budget.clone();
        inner.budgets.apply(key, row);
        Ok(budget)
    }

    async fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        let mut inner = self.lock().await;
        let (result, write) = inner.budgets.plan_consume(key, request_id);
        if let Some((key, row)) = write {
            inner.write(&Record::Budget {
                key: key.clone(),
                row: row.clone(),
            })
            .await?;
            inner.budgets.apply(key, row);
        }
        Ok(result)
    }

    async fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        let mut inner = self.lock().await;
        let (budget, write) = inner.budgets.plan_release(key, request_id);
        if let Some((key, row)) = write {
            inner.write(&Record::Budget {
                key: key.clone(),
                row: row.clone(),
            })
            .await?;
            inner.budgets.apply(key, row);
        }
        Ok(budget)
    }
}

impl HistoryStore for Journal {
    async fn append(&self, entry: NewEntry) -> Result<HistoryEntry, StoreError> {
        let mut inner = self.lock().await;
        let entry = inner.entries.plan_append(entry);
        inner
            .write(&Record::Append {
                entry: entry.clone(),
            })
            .await?;
        inner.entries.apply_append(entry.clone());
        Ok(entry)
    }

    async fn entry(&self, id: u64) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(self.lock().await.entries.entry(id))
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(self.lock().await.entries.find_by_request(request_id))
    }

    async fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> Result<Claim, StoreError> {
        let mut inner = self.lock().await;
        let result = inner.entries.plan_claim(spin_id, session_id, claimed_at);
        if let Claim::Claimed(_, claim) = &result {
            inner
                .write(&Record::Claim {
                    spin_id,
                    claimed_at,
                    entry: claim.clone(),
                })
                .await?;
            inner.entries.apply_claim(spin_id, claimed_at, claim.clone());
        }
        Ok(result)
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.lock().await.entries.query(filter))
    }

    async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        Ok(self.lock().await.entries.stats(template))
    }

    async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        Ok(self.lock().await.entries.count_spins(session_id, template))
    }
}
