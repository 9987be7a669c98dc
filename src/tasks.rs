use crate::error::InvalidSelection;
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use teloxide::types::ChatId;

const TASK_ID_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TASK_ID_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parse(value: &str) -> Option<Self> {
        if value.len() == TASK_ID_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A format offered on one keyboard button.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferedFormat {
    pub format_id: String,
    pub has_audio: bool,
}

/// What the user was shown for a link, waiting for a button press.
#[derive(Clone, Debug)]
pub struct PendingSelection {
    pub chat_id: ChatId,
    pub url: String,
    pub title: Option<String>,
    pub options: BTreeMap<u32, OfferedFormat>,
}

/// A decoded button press.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub task_id: TaskId,
    pub url: String,
    pub title: Option<String>,
    pub bucket: u32,
    pub format: OfferedFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    WaitingQuality,
    Downloading { bucket: u32 },
}

#[derive(Debug)]
struct Entry {
    pending: PendingSelection,
    state: TaskState,
    guarded: bool,
    created_at: Instant,
}

/// Server-side table of pending selections; buttons only carry the task id
/// and the bucket, so arbitrary URLs and format ids survive the round-trip.
#[derive(Clone)]
pub struct SelectionRegistry {
    inner: Arc<DashMap<TaskId, Entry>>,
    ttl: Duration,
}

impl SelectionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn register(&self, pending: PendingSelection) -> TaskId {
        self.purge_expired();
        let mut id = TaskId::new();
        while self.inner.contains_key(&id) {
            id = TaskId::new();
        }
        self.inner.insert(
            id.clone(),
            Entry {
                pending,
                state: TaskState::WaitingQuality,
                guarded: false,
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Decodes callback data and claims the selection for download.
    ///
    /// A successful resolve moves the task to `Downloading`; the next resolve
    /// of any button on the same keyboard fails with `AlreadyStarted`.
    pub fn resolve(&self, data: &str, chat_id: ChatId) -> Result<Selection, InvalidSelection> {
        let (task_id, bucket) = parse_selection_callback(data).ok_or(InvalidSelection::Malformed)?;
        let mut entry = self.inner.get_mut(&task_id).ok_or(InvalidSelection::Expired)?;
        if entry.created_at.elapsed() > self.ttl {
            drop(entry);
            self.inner.remove(&task_id);
            return Err(InvalidSelection::Expired);
        }
        if entry.pending.chat_id != chat_id {
            return Err(InvalidSelection::WrongChat);
        }
        if entry.state != TaskState::WaitingQuality {
            return Err(InvalidSelection::AlreadyStarted);
        }
        let format = entry
            .pending
            .options
            .get(&bucket)
            .cloned()
            .ok_or(InvalidSelection::UnknownQuality)?;
        entry.state = TaskState::Downloading { bucket };
        Ok(Selection {
            task_id,
            url: entry.pending.url.clone(),
            title: entry.pending.title.clone(),
            bucket,
            format,
        })
    }

    #[cfg(test)]
    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.inner.get(id).map(|entry| entry.state.clone())
    }

    pub fn remove(&self, id: &TaskId) -> Option<PendingSelection> {
        self.inner.remove(id).map(|(_, entry)| entry.pending)
    }

    /// Ties the entry's lifetime to the returned guard. Take it as soon as
    /// `resolve` succeeds; an expired claim without a guard is purged.
    pub fn guard(&self, id: TaskId) -> TaskGuard {
        if let Some(mut entry) = self.inner.get_mut(&id) {
            entry.guarded = true;
        }
        TaskGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.inner
            .retain(|_, entry| entry.guarded || entry.created_at.elapsed() <= ttl);
    }
}

/// Drops the task from the registry once its download finishes.
pub struct TaskGuard {
    registry: SelectionRegistry,
    id: TaskId,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let _ = self.registry.remove(&self.id);
    }
}

const SELECTION_CALLBACK_PREFIX: &str = "dl:";

pub fn build_selection_callback(id: &TaskId, bucket: u32) -> String {
    format!("{SELECTION_CALLBACK_PREFIX}{}:{bucket}", id.as_str())
}

pub fn is_selection_callback(data: &str) -> bool {
    data.starts_with(SELECTION_CALLBACK_PREFIX)
}

pub fn parse_selection_callback(data: &str) -> Option<(TaskId, u32)> {
    let payload = data.strip_prefix(SELECTION_CALLBACK_PREFIX)?;
    let (task_id, bucket) = payload.split_once(':')?;
    let task_id = TaskId::parse(task_id)?;
    if bucket.is_empty() || !bucket.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((task_id, bucket.parse().ok()?))
}
