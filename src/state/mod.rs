//! Locked state container shared by the manager, its task handlers and the
//! callers of the public entry points.
//!
//! All persistent data lives in a single [`StateData`] behind one mutex.
//! Changes group tasks; the [`runner::TaskRunner`] drives task statuses and
//! fires a per-change ready signal once every task of a change is ready.

pub mod runner;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};

use crate::error::FdeError;
use crate::Result;

pub use runner::{HandlerContext, TaskRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Do,
    Doing,
    Done,
    Undo,
    Undoing,
    Undone,
    Hold,
    Error,
}

impl Status {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Hold | Status::Error
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: String,
    kind: String,
    summary: String,
    status: Status,
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    wait_tasks: Vec<String>,
    #[serde(default)]
    change: Option<String>,
    #[serde(default)]
    log: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    clean: bool,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn change_id(&self) -> Option<&str> {
        self.change.as_deref()
    }

    pub fn wait_tasks(&self) -> &[String] {
        &self.wait_tasks
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.data
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| {
                FdeError::Serialization(format!(
                    "cannot decode {key:?} of task {}: {e}",
                    self.id
                ))
            })
    }

    /// Like [`Task::get`] but a missing key is an error.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?.ok_or_else(|| {
            FdeError::internal(format!("task {} ({}) has no {key:?}", self.id, self.kind))
        })
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn logf(&mut self, message: impl Into<String>) {
        self.log.push(format!(
            "{} INFO {}",
            Utc::now().to_rfc3339(),
            message.into()
        ));
    }

    pub fn errorf(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.log
            .push(format!("{} ERROR {}", Utc::now().to_rfc3339(), message));
        self.error = Some(message);
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    id: String,
    kind: String,
    summary: String,
    #[serde(default)]
    task_ids: Vec<String>,
    spawn_time: DateTime<Utc>,
    #[serde(default)]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    aborted: bool,
}

impl Change {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

/// Ordered group of tasks built by an entry point and embedded into a change
/// by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<String>,
}

impl TaskSet {
    pub fn new(tasks: Vec<String>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub fn push(&mut self, task_id: String) {
        self.tasks.push(task_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn numeric_id(id: &str) -> Option<u64> {
    id.parse().ok()
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateData {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    changes: BTreeMap<u64, Change>,
    #[serde(default)]
    tasks: BTreeMap<u64, Task>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(skip)]
    modified: bool,
    #[serde(skip)]
    ready_signals: HashMap<String, watch::Sender<bool>>,
}

impl StateData {
    /// Decodes the value stored under `key`, `None` when nothing is stored.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.data
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(|e| FdeError::Serialization(format!("cannot decode state entry {key:?}: {e}")))
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        self.modified = true;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.modified = true;
        }
    }

    pub fn warnf(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
        self.modified = true;
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.last_change_id += 1;
        let id = self.last_change_id.to_string();
        self.changes.insert(
            self.last_change_id,
            Change {
                id: id.clone(),
                kind: kind.to_string(),
                summary: summary.to_string(),
                task_ids: Vec::new(),
                spawn_time: Utc::now(),
                ready_time: None,
                aborted: false,
            },
        );
        self.modified = true;
        id
    }

    pub fn new_task(&mut self, kind: &str, summary: &str) -> String {
        self.last_task_id += 1;
        let id = self.last_task_id.to_string();
        self.tasks.insert(
            self.last_task_id,
            Task {
                id: id.clone(),
                kind: kind.to_string(),
                summary: summary.to_string(),
                status: Status::Do,
                data: BTreeMap::new(),
                wait_tasks: Vec::new(),
                change: None,
                log: Vec::new(),
                error: None,
                clean: false,
            },
        );
        self.modified = true;
        id
    }

    pub fn add_task(&mut self, change_id: &str, task_id: &str) -> Result<()> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| FdeError::internal(format!("no task with id {task_id}")))?;
        if let Some(existing) = &task.change {
            return Err(FdeError::internal(format!(
                "task {task_id} already belongs to change {existing}"
            )));
        }
        task.change = Some(change_id.to_string());
        let change = self
            .change_mut(change_id)
            .ok_or_else(|| FdeError::internal(format!("no change with id {change_id}")))?;
        change.task_ids.push(task_id.to_string());
        Ok(())
    }

    pub fn add_all(&mut self, change_id: &str, task_set: &TaskSet) -> Result<()> {
        for task_id in task_set.tasks() {
            self.add_task(change_id, task_id)?;
        }
        Ok(())
    }

    /// Makes `task_id` wait for `waited_id` to be done before running.
    pub fn wait_for(&mut self, task_id: &str, waited_id: &str) -> Result<()> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| FdeError::internal(format!("no task with id {task_id}")))?;
        if !task.wait_tasks.iter().any(|id| id == waited_id) {
            task.wait_tasks.push(waited_id.to_string());
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        numeric_id(id).and_then(|key| self.tasks.get(&key))
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        let key = numeric_id(id)?;
        let task = self.tasks.get_mut(&key)?;
        self.modified = true;
        Some(task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn change(&self, id: &str) -> Option<&Change> {
        numeric_id(id).and_then(|key| self.changes.get(&key))
    }

    fn change_mut(&mut self, id: &str) -> Option<&mut Change> {
        let key = numeric_id(id)?;
        let change = self.changes.get_mut(&key)?;
        self.modified = true;
        Some(change)
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn change_tasks(&self, change_id: &str) -> Vec<&Task> {
        self.change(change_id)
            .map(|change| {
                change
                    .task_ids
                    .iter()
                    .filter_map(|id| self.task(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn change_status(&self, change_id: &str) -> Status {
        let tasks = self.change_tasks(change_id);
        if let Some(pending) = tasks.iter().find(|t| !t.status.is_ready()) {
            return if tasks.iter().any(|t| t.status == Status::Doing) {
                Status::Doing
            } else if tasks.iter().any(|t| t.status == Status::Undoing) {
                Status::Undoing
            } else {
                pending.status
            };
        }
        for status in [Status::Error, Status::Undone, Status::Hold] {
            if tasks.iter().any(|t| t.status == status) {
                return status;
            }
        }
        Status::Done
    }

    pub fn is_change_ready(&self, change_id: &str) -> bool {
        self.change_status(change_id).is_ready()
    }

    /// Error summary of a change, `None` when no task failed.
    pub fn change_err(&self, change_id: &str) -> Option<String> {
        let lines: Vec<String> = self
            .change_tasks(change_id)
            .into_iter()
            .filter(|t| t.status == Status::Error)
            .map(|t| {
                format!(
                    "- {} ({})",
                    t.summary,
                    t.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "cannot perform the following tasks:\n{}",
            lines.join("\n")
        ))
    }

    /// Stops a change: pending tasks are put on hold and completed tasks are
    /// scheduled for undo.
    pub fn abort_change(&mut self, change_id: &str) {
        let task_ids = match self.change_mut(change_id) {
            Some(change) => {
                change.aborted = true;
                change.task_ids.clone()
            }
            None => return,
        };
        for id in task_ids {
            if let Some(task) = self.task_mut(&id) {
                match task.status {
                    Status::Do => task.status = Status::Hold,
                    Status::Done => task.status = Status::Undo,
                    _ => {}
                }
            }
        }
        self.refresh_ready();
    }

    /// Receiver that observes `true` once the change is ready.
    pub fn ready_signal(&mut self, change_id: &str) -> watch::Receiver<bool> {
        let ready = self.is_change_ready(change_id);
        self.ready_signals
            .entry(change_id.to_string())
            .or_insert_with(|| watch::channel(ready).0)
            .subscribe()
    }

    /// Records ready times and wakes everyone waiting on a change that just
    /// became ready.
    pub fn refresh_ready(&mut self) {
        let newly_ready: Vec<String> = self
            .changes
            .values()
            .filter(|c| c.ready_time.is_none())
            .map(|c| c.id.clone())
            .filter(|id| self.is_change_ready(id))
            .collect();
        for id in newly_ready {
            if let Some(change) = self.change_mut(&id) {
                change.ready_time = Some(Utc::now());
            }
            if let Some(sender) = self.ready_signals.get(&id) {
                sender.send_replace(true);
            }
            tracing::debug!(change_id = %id, "change is ready");
        }
    }

    /// Drops changes, with their tasks, that became ready before `cutoff`.
    /// Changes holding a task for which `awaiting_cleanup` is true are kept.
    pub fn prune(
        &mut self,
        cutoff: DateTime<Utc>,
        awaiting_cleanup: impl Fn(&Task) -> bool,
    ) -> usize {
        let stale: Vec<u64> = self
            .changes
            .iter()
            .filter(|(_, c)| c.ready_time.is_some_and(|ready| ready < cutoff))
            .filter(|(_, c)| {
                !c.task_ids
                    .iter()
                    .filter_map(|id| self.task(id))
                    .any(&awaiting_cleanup)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            let Some(change) = self.changes.remove(key) else {
                continue;
            };
            for task_key in change.task_ids.iter().filter_map(|id| numeric_id(id)) {
                self.tasks.remove(&task_key);
            }
            self.ready_signals.remove(&change.id);
        }
        if !stale.is_empty() {
            self.modified = true;
        }
        stale.len()
    }

    fn take_modified(&mut self) -> bool {
        std::mem::replace(&mut self.modified, false)
    }
}

struct StateInner {
    data: Mutex<StateData>,
    checkpoint: Option<PathBuf>,
    ensure: Notify,
}

/// Cloneable handle to the process-wide state container.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("checkpoint", &self.inner.checkpoint)
            .finish()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// In-memory state that is never written to disk.
    pub fn new() -> Self {
        Self::from_data(StateData::default(), None)
    }

    /// Loads the state checkpoint at `path`, starting empty when the file
    /// does not exist yet. Every modification is written back to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                FdeError::Serialization(format!(
                    "cannot parse state {}: {e}",
                    path.to_string_lossy()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateData::default(),
            Err(err) => {
                return Err(FdeError::Io(format!(
                    "cannot read state {}: {err}",
                    path.to_string_lossy()
                )))
            }
        };
        Ok(Self::from_data(data, Some(path.to_path_buf())))
    }

    fn from_data(data: StateData, checkpoint: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StateInner {
                data: Mutex::new(data),
                checkpoint,
                ensure: Notify::new(),
            }),
        }
    }

    pub fn lock(&self) -> StateGuard<'_> {
        let guard = match self.inner.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        StateGuard {
            guard,
            checkpoint: self.inner.checkpoint.as_deref(),
        }
    }

    /// Asks the task runner for an ensure pass as soon as possible.
    pub fn ensure_before(&self) {
        self.inner.ensure.notify_one();
    }

    pub(crate) async fn ensure_requested(&self) {
        self.inner.ensure.notified().await;
    }

    pub fn same_as(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Exclusive access to [`StateData`]. Dropping the guard releases the lock
/// and, when the data changed, writes the checkpoint.
pub struct StateGuard<'a> {
    guard: MutexGuard<'a, StateData>,
    checkpoint: Option<&'a Path>,
}

impl Deref for StateGuard<'_> {
    type Target = StateData;

    fn deref(&self) -> &StateData {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut StateData {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.guard.take_modified() {
            return;
        }
        if let Some(path) = self.checkpoint {
            if let Err(err) = write_checkpoint(path, &self.guard) {
                tracing::error!(path = %path.display(), "cannot checkpoint state: {err}");
            }
        }
    }
}

fn write_checkpoint(path: &Path, data: &StateData) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FdeError::Io(format!(
                "cannot create state directory {}: {e}",
                parent.to_string_lossy()
            ))
        })?;
    }
    let payload = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, payload).map_err(|e| {
        FdeError::Io(format!("cannot write state {}: {e}", tmp.to_string_lossy()))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        FdeError::Io(format!(
            "cannot replace state {}: {e}",
            path.to_string_lossy()
        ))
    })
}
