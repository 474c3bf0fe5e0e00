use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{State, StateData, Status, Task};
use crate::error::FdeError;
use crate::Result;

const ENSURE_INTERVAL: Duration = Duration::from_millis(250);
/// How long finished changes stay around before being pruned.
pub const DEFAULT_CHANGE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a task handler gets to know about the task it runs.
pub struct HandlerContext {
    state: State,
    task_id: String,
    change_id: Option<String>,
}

impl HandlerContext {
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn change_id(&self) -> Result<&str> {
        self.change_id.as_deref().ok_or_else(|| {
            FdeError::internal(format!("task {} is not part of a change", self.task_id))
        })
    }
}

pub type Handler = Arc<dyn Fn(&HandlerContext) -> Result<()> + Send + Sync>;
/// Returns true when `task` must not start while `running` tasks execute.
pub type BlockedPredicate = Arc<dyn Fn(&StateData, &Task, &[Task]) -> bool + Send + Sync>;

#[derive(Clone)]
struct HandlerPair {
    do_fn: Handler,
    undo_fn: Option<Handler>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Do,
    Undo,
}

struct Spawn {
    task_id: String,
    change_id: Option<String>,
    phase: Phase,
    handler: Handler,
}

struct RunnerInner {
    state: State,
    handlers: RwLock<HashMap<String, HandlerPair>>,
    cleanups: RwLock<HashMap<String, Handler>>,
    blocked: RwLock<Vec<BlockedPredicate>>,
    running: Mutex<HashSet<String>>,
    progress: Notify,
    control: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    retention: RwLock<Duration>,
}

/// Drives tasks through their statuses: runs do handlers once prerequisites
/// are done, undoes completed work of failed changes and calls cleanup
/// handlers once a change is ready.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn exclusive<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TaskRunner {
    pub fn new(state: State) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                state,
                handlers: RwLock::new(HashMap::new()),
                cleanups: RwLock::new(HashMap::new()),
                blocked: RwLock::new(Vec::new()),
                running: Mutex::new(HashSet::new()),
                progress: Notify::new(),
                control: Mutex::new(None),
                retention: RwLock::new(DEFAULT_CHANGE_RETENTION),
            }),
        }
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    pub fn set_change_retention(&self, retention: Duration) {
        *write(&self.inner.retention) = retention;
    }

    pub fn add_handler<D>(&self, kind: &str, do_fn: D, undo_fn: Option<Handler>)
    where
        D: Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.handlers).insert(
            kind.to_string(),
            HandlerPair {
                do_fn: Arc::new(do_fn),
                undo_fn,
            },
        );
    }

    pub fn add_cleanup<F>(&self, kind: &str, cleanup: F)
    where
        F: Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.cleanups).insert(kind.to_string(), Arc::new(cleanup));
    }

    pub fn add_blocked<F>(&self, predicate: F)
    where
        F: Fn(&StateData, &Task, &[Task]) -> bool + Send + Sync + 'static,
    {
        write(&self.inner.blocked).push(Arc::new(predicate));
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = read(&self.inner.handlers).keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn has_undo(&self, kind: &str) -> bool {
        read(&self.inner.handlers)
            .get(kind)
            .map(|pair| pair.undo_fn.is_some())
            .unwrap_or(false)
    }

    /// Runs one scheduling pass. Returns how many tasks were started or
    /// moved to a new status, zero means nothing could make progress.
    pub fn ensure(&self) -> Result<usize> {
        let mut spawns = Vec::new();
        let mut cleanups = Vec::new();
        let mut progress = 0;
        {
            let mut st = self.inner.state.lock();
            let mut running_ids = exclusive(&self.inner.running).clone();
            let handlers = read(&self.inner.handlers).clone();
            let blocked = read(&self.inner.blocked).clone();

            let candidates: Vec<String> = st
                .changes()
                .filter(|c| !st.is_change_ready(c.id()))
                .flat_map(|c| c.task_ids().to_vec())
                .collect();

            for task_id in candidates {
                if running_ids.contains(&task_id) {
                    continue;
                }
                let Some(task) = st.task(&task_id).cloned() else {
                    continue;
                };
                match task.status() {
                    Status::Do => {
                        let mut waiting = false;
                        let mut failed_prereq = false;
                        for wait_id in task.wait_tasks() {
                            match st.task(wait_id).map(Task::status) {
                                Some(Status::Done) | None => {}
                                Some(Status::Do) | Some(Status::Doing) => waiting = true,
                                Some(_) => failed_prereq = true,
                            }
                        }
                        if failed_prereq {
                            if let Some(t) = st.task_mut(&task_id) {
                                t.set_status(Status::Hold);
                            }
                            progress += 1;
                            continue;
                        }
                        if waiting {
                            continue;
                        }
                        let Some(pair) = handlers.get(task.kind()) else {
                            continue;
                        };
                        let running: Vec<Task> = running_ids
                            .iter()
                            .filter_map(|id| st.task(id).cloned())
                            .collect();
                        if blocked.iter().any(|pred| pred(&*st, &task, &running)) {
                            continue;
                        }
                        if let Some(t) = st.task_mut(&task_id) {
                            t.set_status(Status::Doing);
                        }
                        running_ids.insert(task_id.clone());
                        spawns.push(Spawn {
                            task_id,
                            change_id: task.change_id().map(str::to_string),
                            phase: Phase::Do,
                            handler: Arc::clone(&pair.do_fn),
                        });
                        progress += 1;
                    }
                    Status::Undo => {
                        let change_id = task.change_id().unwrap_or_default().to_string();
                        let dependents_busy = st.change_tasks(&change_id).iter().any(|other| {
                            other.wait_tasks().iter().any(|id| id == &task_id)
                                && matches!(
                                    other.status(),
                                    Status::Doing | Status::Undo | Status::Undoing
                                )
                        });
                        if dependents_busy {
                            continue;
                        }
                        match handlers.get(task.kind()).and_then(|p| p.undo_fn.clone()) {
                            Some(undo) => {
                                if let Some(t) = st.task_mut(&task_id) {
                                    t.set_status(Status::Undoing);
                                }
                                running_ids.insert(task_id.clone());
                                spawns.push(Spawn {
                                    task_id,
                                    change_id: task.change_id().map(str::to_string),
                                    phase: Phase::Undo,
                                    handler: undo,
                                });
                            }
                            None => {
                                if let Some(t) = st.task_mut(&task_id) {
                                    t.set_status(Status::Undone);
                                }
                            }
                        }
                        progress += 1;
                    }
                    _ => {}
                }
            }

            *exclusive(&self.inner.running) = running_ids;
            st.refresh_ready();

            let cleanup_handlers = read(&self.inner.cleanups).clone();
            if let Ok(retention) = chrono::Duration::from_std(*read(&self.inner.retention)) {
                let pruned = st.prune(Utc::now() - retention, |task| {
                    !task.clean && cleanup_handlers.contains_key(task.kind())
                });
                if pruned > 0 {
                    debug!(pruned, "pruned finished changes");
                }
            }
            let ready_tasks: Vec<(String, Option<String>, Handler)> = st
                .changes()
                .filter(|c| c.ready_time().is_some())
                .flat_map(|c| c.task_ids().to_vec())
                .filter_map(|id| {
                    let task = st.task(&id)?;
                    if task.clean {
                        return None;
                    }
                    let handler = cleanup_handlers.get(task.kind())?;
                    Some((id, task.change_id().map(str::to_string), Arc::clone(handler)))
                })
                .collect();
            for (task_id, change_id, handler) in ready_tasks {
                if let Some(t) = st.task_mut(&task_id) {
                    t.clean = true;
                }
                cleanups.push(Spawn {
                    task_id,
                    change_id,
                    phase: Phase::Do,
                    handler,
                });
            }
        }

        for cleanup in cleanups {
            let ctx = HandlerContext {
                state: self.inner.state.clone(),
                task_id: cleanup.task_id,
                change_id: cleanup.change_id,
            };
            if let Err(err) = (cleanup.handler)(&ctx) {
                warn!(task_id = %ctx.task_id, "task cleanup failed: {err}");
            }
        }

        for spawn in spawns {
            self.spawn(spawn);
        }
        Ok(progress)
    }

    fn spawn(&self, spawn: Spawn) {
        let runner = self.clone();
        let job = move || {
            let ctx = HandlerContext {
                state: runner.inner.state.clone(),
                task_id: spawn.task_id.clone(),
                change_id: spawn.change_id.clone(),
            };
            debug!(task_id = %spawn.task_id, phase = ?spawn.phase, "running task handler");
            let result = (spawn.handler)(&ctx);
            runner.finish(&spawn.task_id, spawn.phase, result);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }

    fn finish(&self, task_id: &str, phase: Phase, result: Result<()>) {
        {
            let mut st = self.inner.state.lock();
            let kind = st.task(task_id).map(|t| t.kind().to_string());
            let has_undo = kind.as_deref().map(|k| self.has_undo(k)).unwrap_or(false);
            let change_id = st.task(task_id).and_then(|t| t.change_id().map(str::to_string));
            let aborted = change_id
                .as_deref()
                .and_then(|id| st.change(id))
                .map(|c| c.is_aborted())
                .unwrap_or(false);

            match (phase, result) {
                (Phase::Do, Ok(())) => {
                    if let Some(task) = st.task_mut(task_id) {
                        if task.status() == Status::Doing {
                            task.set_status(Status::Done);
                        }
                        if aborted && has_undo && task.status() == Status::Done {
                            task.set_status(Status::Undo);
                        }
                    }
                }
                (Phase::Do, Err(err)) => {
                    warn!(task_id, "task failed: {err}");
                    if let Some(task) = st.task_mut(task_id) {
                        task.errorf(err.to_string());
                        task.set_status(Status::Error);
                    }
                    if let Some(change_id) = change_id.as_deref() {
                        self.abort_after_error(&mut *st, change_id);
                    }
                }
                (Phase::Undo, Ok(())) => {
                    if let Some(task) = st.task_mut(task_id) {
                        if task.status() == Status::Undoing {
                            task.set_status(Status::Undone);
                        }
                    }
                }
                (Phase::Undo, Err(err)) => {
                    warn!(task_id, "task undo failed: {err}");
                    if let Some(task) = st.task_mut(task_id) {
                        task.errorf(err.to_string());
                        task.set_status(Status::Error);
                    }
                }
            }
            exclusive(&self.inner.running).remove(task_id);
            st.refresh_ready();
        }
        self.inner.state.ensure_before();
        self.inner.progress.notify_waiters();
    }

    fn abort_after_error(&self, st: &mut StateData, change_id: &str) {
        let task_ids = st
            .change(change_id)
            .map(|c| c.task_ids().to_vec())
            .unwrap_or_default();
        for id in task_ids {
            let Some(kind) = st.task(&id).map(|t| t.kind().to_string()) else {
                continue;
            };
            let has_undo = self.has_undo(&kind);
            if let Some(task) = st.task_mut(&id) {
                match task.status() {
                    Status::Do => task.set_status(Status::Hold),
                    Status::Done if has_undo => task.set_status(Status::Undo),
                    _ => {}
                }
            }
        }
        if let Some(change) = st.change_mut(change_id) {
            change.aborted = true;
        }
    }

    fn is_idle(&self) -> bool {
        exclusive(&self.inner.running).is_empty()
    }

    /// Repeats ensure passes until no task can make progress or `timeout`
    /// elapses.
    pub async fn settle(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.progress.notified();
            let progress = self.ensure()?;
            if progress == 0 && self.is_idle() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FdeError::runtime(format!(
                    "tasks did not settle within {timeout:?}"
                )));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    pub fn is_running(&self) -> bool {
        exclusive(&self.inner.control).is_some()
    }

    /// Starts the background loop that runs ensure passes whenever the state
    /// asks for one and at a fixed interval otherwise.
    pub fn start(&self) {
        let mut control = exclusive(&self.inner.control);
        if control.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ENSURE_INTERVAL);
            let state = runner.inner.state.clone();
            loop {
                tokio::select! {
                    _ = state.ensure_requested() => {}
                    _ = tick.tick() => {}
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
                if let Err(err) = runner.ensure() {
                    warn!("task runner ensure failed: {err}");
                }
            }
        });
        *control = Some((tx, handle));
    }

    pub async fn stop(&self) {
        let control = exclusive(&self.inner.control).take();
        if let Some((tx, handle)) = control {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }
}
