use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_std::sync::Mutex;
use common::errors::*;

use crate::types::{HardState, LogEntry, LogIndex, Term};

/// Persistent log + hard state storage, grounded on the append-only-segment
/// idiom used throughout the teacher's storage layer (a write-ahead log
/// rebuilt into an in-memory index at startup, rather than an on-disk
/// B-tree).
///
/// `first_index` / `last_index` describe the inclusive range of entries
/// still retained; everything below `first_index` has been compacted away
/// (folded into a snapshot).
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<()>;

    /// Truncates any existing entries at or after `from` before appending.
    /// Used when a follower's log diverges from the leader's and must be
    /// rolled back to a common point.
    async fn truncate_and_append(&self, from: LogIndex, entries: Vec<LogEntry>) -> Result<()>;

    async fn term(&self, index: LogIndex) -> Option<Term>;

    async fn entry(&self, index: LogIndex) -> Option<LogEntry>;

    /// Returns entries in `[lo, hi)`, stopping early if `max_bytes` would be
    /// exceeded by the next entry (but always returning at least one entry
    /// when the range is non-empty).
    async fn entries(&self, lo: LogIndex, hi: LogIndex, max_bytes: usize) -> Vec<LogEntry>;

    async fn first_index(&self) -> LogIndex;

    async fn last_index(&self) -> LogIndex;

    async fn save_hard_state(&self, state: HardState) -> Result<()>;

    async fn load_hard_state(&self) -> HardState;

    /// Discards entries up to and including `up_to`, recording that the log
    /// now starts just after it. The state machine's own snapshot is stored
    /// separately (see `StateMachine::snapshot`); this only bounds the log.
    async fn compact(&self, up_to: LogIndex) -> Result<()>;
}

#[derive(Default)]
struct MemState {
    entries: VecDeque<LogEntry>,
    // Index of the entry right before `entries[0]`, i.e. the last entry
    // folded into a compaction. `entries[0].index == compacted_through + 1`.
    compacted_through: LogIndex,
    hard_state: HardState,
}

/// In-memory log, used by tests and single-process development nodes.
pub struct MemLogStore {
    state: Mutex<MemState>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LogStore for MemLogStore {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut state = self.state.lock().await;
        for entry in entries {
            state.entries.push_back(entry);
        }
        Ok(())
    }

    async fn truncate_and_append(&self, from: LogIndex, entries: Vec<LogEntry>) -> Result<()> {
        let mut state = self.state.lock().await;
        let base = state.compacted_through.value() + 1;
        if from.value() >= base {
            let keep = (from.value() - base) as usize;
            state.entries.truncate(keep);
        }
        for entry in entries {
            state.entries.push_back(entry);
        }
        Ok(())
    }

    async fn term(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        let state = self.state.lock().await;
        if index == state.compacted_through {
            return None;
        }
        let base = state.compacted_through.value() + 1;
        if index.value() < base {
            return None;
        }
        let offset = (index.value() - base) as usize;
        state.entries.get(offset).map(|e| e.term)
    }

    async fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        let state = self.state.lock().await;
        let base = state.compacted_through.value() + 1;
        if index.value() < base {
            return None;
        }
        let offset = (index.value() - base) as usize;
        state.entries.get(offset).cloned()
    }

    async fn entries(&self, lo: LogIndex, hi: LogIndex, max_bytes: usize) -> Vec<LogEntry> {
        let state = self.state.lock().await;
        let base = state.compacted_through.value() + 1;
        let mut out = vec![];
        let mut size = 0usize;
        let mut idx = lo.value();
        while idx < hi.value() {
            if idx < base {
                idx += 1;
                continue;
            }
            let offset = (idx - base) as usize;
            match state.entries.get(offset) {
                Some(entry) => {
                    size += entry.data.len();
                    out.push(entry.clone());
                    if size >= max_bytes && !out.is_empty() {
                        break;
                    }
                }
                None => break,
            }
            idx += 1;
        }
        out
    }

    async fn first_index(&self) -> LogIndex {
        let state = self.state.lock().await;
        LogIndex(state.compacted_through.value() + 1)
    }

    async fn last_index(&self) -> LogIndex {
        let state = self.state.lock().await;
        LogIndex(state.compacted_through.value() + state.entries.len() as u64)
    }

    async fn save_hard_state(&self, hard_state: HardState) -> Result<()> {
        let mut state = self.state.lock().await;
        state.hard_state = hard_state;
        Ok(())
    }

    async fn load_hard_state(&self) -> HardState {
        self.state.lock().await.hard_state.clone()
    }

    async fn compact(&self, up_to: LogIndex) -> Result<()> {
        let mut state = self.state.lock().await;
        let base = state.compacted_through.value() + 1;
        if up_to.value() >= base {
            let drop_count = (up_to.value() - base + 1) as usize;
            for _ in 0..drop_count.min(state.entries.len()) {
                state.entries.pop_front();
            }
            state.compacted_through = up_to;
        }
        Ok(())
    }
}

/// On-disk log store: one append-only segment file of length-prefixed,
/// bincode-encoded entries plus a small hard-state file, both rewritten
/// fully on save (hard state changes are rare and tiny, so unlike the log
/// segment there is no need for incremental appends there).
///
/// Entries are buffered in memory after the initial load, mirroring the
/// teacher's "rebuild an in-memory index from the WAL at startup" pattern;
/// the file is only appended to, never rewritten, except by `compact`.
pub struct FileLogStore {
    dir: PathBuf,
    mem: MemLogStore,
    segment: Mutex<std::fs::File>,
}

const HARD_STATE_FILE: &str = "hard_state";
const SEGMENT_FILE: &str = "log_segment";

impl FileLogStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let segment_path = dir.join(SEGMENT_FILE);
        let mut segment = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&segment_path)?;

        let mem = MemLogStore::new();
        Self::load_entries(&mut segment, &mem).await?;

        let hard_state_path = dir.join(HARD_STATE_FILE);
        if let Ok(bytes) = std::fs::read(&hard_state_path) {
            if let Ok(hard_state) = bincode::deserialize::<HardState>(&bytes) {
                mem.save_hard_state(hard_state).await?;
            }
        }

        Ok(Self {
            dir: dir.to_owned(),
            mem,
            segment: Mutex::new(segment),
        })
    }

    async fn load_entries(segment: &mut std::fs::File, mem: &MemLogStore) -> Result<()> {
        segment.seek(SeekFrom::Start(0))?;
        let mut buf = vec![];
        segment.read_to_end(&mut buf)?;

        let mut offset = 0usize;
        let mut entries = vec![];
        while offset + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > buf.len() {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&buf[offset..offset + len])?;
            offset += len;
            entries.push(entry);
        }

        if !entries.is_empty() {
            mem.append(entries).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogStore for FileLogStore {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut segment = self.segment.lock().await;
        for entry in &entries {
            let bytes = bincode::serialize(entry)?;
            segment.write_all(&(bytes.len() as u32).to_le_bytes())?;
            segment.write_all(&bytes)?;
        }
        segment.flush()?;
        self.mem.append(entries).await
    }

    async fn truncate_and_append(&self, from: LogIndex, entries: Vec<LogEntry>) -> Result<()> {
        // Rewrite the whole segment: truncation is rare (only on log
        // divergence) so simplicity wins over incremental edits here.
        self.mem.truncate_and_append(from, entries).await?;

        let mut segment = self.segment.lock().await;
        let path = self.dir.join(SEGMENT_FILE);
        let mut rewritten = std::fs::File::create(&path)?;

        let first = self.mem.first_index().await;
        let last = self.mem.last_index().await;
        if last.value() >= first.value() {
            for entry in self.mem.entries(first, LogIndex(last.value() + 1), usize::MAX).await {
                let bytes = bincode::serialize(&entry)?;
                rewritten.write_all(&(bytes.len() as u32).to_le_bytes())?;
                rewritten.write_all(&bytes)?;
            }
        }
        rewritten.flush()?;

        *segment = std::fs::OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(())
    }

    async fn term(&self, index: LogIndex) -> Option<Term> {
        self.mem.term(index).await
    }

    async fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        self.mem.entry(index).await
    }

    async fn entries(&self, lo: LogIndex, hi: LogIndex, max_bytes: usize) -> Vec<LogEntry> {
        self.mem.entries(lo, hi, max_bytes).await
    }

    async fn first_index(&self) -> LogIndex {
        self.mem.first_index().await
    }

    async fn last_index(&self) -> LogIndex {
        self.mem.last_index().await
    }

    async fn save_hard_state(&self, hard_state: HardState) -> Result<()> {
        let bytes = bincode::serialize(&hard_state)?;
        std::fs::write(self.dir.join(HARD_STATE_FILE), bytes)?;
        self.mem.save_hard_state(hard_state).await
    }

    async fn load_hard_state(&self) -> HardState {
        self.mem.load_hard_state().await
    }

    async fn compact(&self, up_to: LogIndex) -> Result<()> {
        self.mem.compact(up_to).await?;
        // Physically reclaim space by rewriting the segment without the
        // compacted prefix; a production system would do this lazily, but
        // correctness does not depend on when it happens.
        let first = self.mem.first_index().await;
        let last = self.mem.last_index().await;
        let path = self.dir.join(SEGMENT_FILE);
        let mut rewritten = std::fs::File::create(&path)?;
        if last.value() >= first.value() {
            for entry in self.mem.entries(first, LogIndex(last.value() + 1), usize::MAX).await {
                let bytes = bincode::serialize(&entry)?;
                rewritten.write_all(&(bytes.len() as u32).to_le_bytes())?;
                rewritten.write_all(&bytes)?;
            }
        }
        rewritten.flush()?;
        let mut segment = self.segment.lock().await;
        *segment = std::fs::OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(())
    }
}
