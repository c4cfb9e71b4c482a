use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::fetch::{SegmentFetcher, SegmentKey};
use crate::mux::{FfmpegMuxer, Muxer};
use crate::net::{NetClient, ReqwestNetClient};
use crate::playlist::Playlist;
use crate::progress::{estimate_total, ProgressTracker};
use crate::safety::UrlValidator;
use crate::segment::{Segment, SegmentState};
use crate::storage::{MemoryStorage, Storage};
use crate::task::{
    now_epoch, safe_title, title_from_url, OutputFormat, PostProcess, SegmentRange, Task, TaskId,
    TaskOptions, TaskStatus,
};
use crate::writer::{self, OrderedWriter};

type SharedStorage = Arc<Mutex<Box<dyn Storage>>>;

/// How many segments past the first unfinished one each worker may fetch.
/// Bounds the payloads held in memory while a gap waits to be filled.
const READ_AHEAD_PER_WORKER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Delete,
}

enum Outcome {
    Finish,
    Paused,
    Failed,
    Deleted,
}

/// Point-in-time view of a task for callers.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task: Task,
    pub segments: Vec<Segment>,
    pub speed_bps: f64,
    pub eta: Option<Duration>,
    pub expected_bytes: Option<u64>,
    /// Share of selected segments that are done, 0.0 to 1.0.
    pub progress: f64,
}

impl TaskSnapshot {
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn count(&self, state: SegmentState) -> usize {
        self.segments.iter().filter(|s| s.state == state).count()
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.index == index)
    }
}

pub struct DownloadEngine {
    pub config: EngineConfig,
    storage: SharedStorage,
    net: Arc<dyn NetClient>,
    validator: UrlValidator,
    muxer: Arc<dyn Muxer>,
    tasks: Mutex<HashMap<TaskId, Arc<TaskRuntime>>>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(&config.user_agent, config.request_timeout)?;
        Ok(Self {
            config,
            storage: Arc::new(Mutex::new(Box::new(MemoryStorage::default()))),
            net: Arc::new(net),
            validator: UrlValidator::default(),
            muxer: Arc::new(FfmpegMuxer::default()),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Arc::new(Mutex::new(storage));
        self
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = net;
        self
    }

    pub fn with_validator(mut self, validator: UrlValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> Self {
        self.muxer = muxer;
        self
    }

    /// Fetch and parse the playlist, then register a task in `Created`.
    pub fn create(&self, options: TaskOptions) -> CoreResult<TaskId> {
        self.validator.validate(&options.url)?;
        let fetcher = self.fetcher(options.headers.clone());
        let (playlist_url, body) = fetcher.fetch_playlist(&options.url)?;
        let playlist = Playlist::parse(&body, playlist_url.as_str())?;
        let range = SegmentRange::resolve(options.start_segment, options.end_segment, playlist.len())?;

        let title = match options.title.as_deref() {
            Some(title) => safe_title(title),
            None => safe_title(&title_from_url(playlist_url.as_str())),
        };
        let now = now_epoch();
        let task = Task {
            id: TaskId::new(),
            playlist_url: playlist_url.to_string(),
            playlist_text: String::from_utf8_lossy(&body).into_owned(),
            title,
            output_dir: options
                .output_dir
                .unwrap_or_else(|| self.config.output_dir.clone()),
            output_format: options.output_format,
            range,
            decrypt: options.decrypt,
            concurrency: options
                .concurrency
                .unwrap_or(self.config.default_concurrency)
                .max(1),
            headers: options.headers,
            status: TaskStatus::Created,
            bytes_completed: 0,
            message: Some("created".to_string()),
            output_path: None,
            post_process: None,
            created_at: now,
            updated_at: now,
        };
        let writer = OrderedWriter::create(task.temp_path(), range.start, range.end)?;
        let segments: BTreeMap<usize, Segment> =
            range.indices().map(|i| (i, Segment::new(i))).collect();

        {
            let mut storage = self.storage()?;
            storage.save_task(&task)?;
            let list: Vec<Segment> = range.indices().map(Segment::new).collect();
            storage.save_segments(&task.id, &list)?;
        }

        let id = task.id;
        info!(
            task_id = %id,
            segments = range.len(),
            encrypted = !playlist.keys().is_empty(),
            "created task"
        );
        let runtime = self.runtime_for(task, Arc::new(playlist), segments, writer);
        self.registry()?.insert(id, runtime);
        Ok(id)
    }

    pub fn start(&self, id: &TaskId) -> CoreResult<()> {
        self.runtime(id)?.launch()
    }

    /// Stop dispatching and return once in-flight segments have settled.
    pub fn pause(&self, id: &TaskId) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        let mut state = runtime.lock()?;
        if state.task.status != TaskStatus::Running {
            return Err(CoreError::InvalidState(format!(
                "cannot pause task in state {}",
                state.task.status
            )));
        }
        state.stop = Some(StopReason::Pause);
        runtime.work_ready.notify_all();
        let state = runtime.wait_settled(state)?;
        info!(task_id = %id, status = %state.task.status, "task paused");
        Ok(())
    }

    pub fn resume(&self, id: &TaskId) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        {
            let state = runtime.lock()?;
            if state.task.status != TaskStatus::Paused {
                return Err(CoreError::InvalidState(format!(
                    "cannot resume task in state {}",
                    state.task.status
                )));
            }
        }
        runtime.launch()
    }

    pub fn retry(&self, id: &TaskId, index: usize) -> CoreResult<()> {
        self.runtime(id)?.retry(Some(index)).map(|_| ())
    }

    /// Retry every failed segment. Returns how many were reset.
    pub fn retry_failed(&self, id: &TaskId) -> CoreResult<usize> {
        self.runtime(id)?.retry(None)
    }

    /// Copy the contiguous finished prefix to `<title>.partial.ts`. A task
    /// whose output was already muxed has no transport stream left, so its
    /// container is returned instead.
    pub fn force_save(&self, id: &TaskId) -> CoreResult<(PathBuf, u64)> {
        let runtime = self.runtime(id)?;
        let (dest, muxed) = {
            let state = runtime.lock()?;
            let muxed = match (&state.task.post_process, &state.task.output_path) {
                (Some(PostProcess::Muxed { .. }), Some(path)) => Some(path.clone()),
                _ => None,
            };
            (state.task.partial_path(), muxed)
        };
        if let Some(path) = muxed {
            let bytes = fs::metadata(&path)?.len();
            debug!(task_id = %id, path = %path.display(), "task already muxed, nothing to force-save");
            return Ok((path, bytes));
        }
        let (path, bytes) = writer::force_save(&runtime.writer, &dest)?;
        info!(task_id = %id, path = %path.display(), bytes, "force-saved task");
        Ok((path, bytes))
    }

    pub fn delete(&self, id: &TaskId, remove_files: bool) -> CoreResult<()> {
        let runtime = self.runtime(id)?;
        let task = {
            let mut state = runtime.lock()?;
            state.stop = Some(StopReason::Delete);
            runtime.work_ready.notify_all();
            let mut state = runtime.wait_settled(state)?;
            let deleted = self.storage().and_then(|mut storage| {
                storage.delete_task(id)?;
                // no later snapshot of this task may reach storage again
                runtime.persisted.store(u64::MAX, Ordering::SeqCst);
                Ok(())
            });
            if let Err(err) = deleted {
                state.stop = None;
                if state.task.status == TaskStatus::Running {
                    state.task.set_status(TaskStatus::Paused, format!("delete failed: {err}"));
                }
                return Err(err);
            }
            state.task.set_status(TaskStatus::Deleted, "deleted");
            state.task.clone()
        };
        self.registry()?.remove(id);

        remove_if_exists(&task.temp_path())?;
        if remove_files {
            let mut paths = vec![task.ts_path(), task.partial_path(), task.container_path()];
            paths.extend(task.output_path.clone());
            for path in paths {
                remove_if_exists(&path)?;
            }
        }
        info!(task_id = %id, remove_files, "deleted task");
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> CoreResult<TaskSnapshot> {
        self.runtime(id)?.view()
    }

    pub fn list(&self) -> CoreResult<Vec<TaskSnapshot>> {
        let runtimes: Vec<Arc<TaskRuntime>> = self.registry()?.values().cloned().collect();
        let mut snapshots = runtimes
            .iter()
            .map(|runtime| runtime.view())
            .collect::<CoreResult<Vec<_>>>()?;
        snapshots.sort_by_key(|snapshot| (snapshot.task.created_at, snapshot.task.id));
        Ok(snapshots)
    }

    /// Block until the current run of the task, if any, has settled.
    pub fn wait(&self, id: &TaskId) -> CoreResult<TaskSnapshot> {
        let runtime = self.runtime(id)?;
        let state = runtime.lock()?;
        drop(runtime.wait_settled(state)?);
        runtime.view()
    }

    /// Rebuild tasks persisted by an earlier process. Returns how many were
    /// loaded; tasks that cannot be rebuilt are logged and skipped.
    pub fn restore(&self) -> CoreResult<usize> {
        let tasks = self.storage()?.list_tasks()?;
        let mut restored = 0usize;
        for task in tasks {
            if task.status == TaskStatus::Deleted || self.registry()?.contains_key(&task.id) {
                continue;
            }
            let id = task.id;
            let segments = self.storage()?.load_segments(&id)?;
            match self.rebuild(task, segments) {
                Ok(runtime) => {
                    self.registry()?.insert(id, runtime);
                    restored += 1;
                }
                Err(err) => warn!(task_id = %id, error = %err, "could not restore task"),
            }
        }
        info!(restored, "restored tasks from storage");
        Ok(restored)
    }

    fn rebuild(&self, mut task: Task, stored: Vec<Segment>) -> CoreResult<Arc<TaskRuntime>> {
        let playlist = Playlist::parse(task.playlist_text.as_bytes(), &task.playlist_url)?;
        if task.range.end >= playlist.len() || task.range.start > task.range.end {
            return Err(CoreError::MalformedPlaylist(format!(
                "stored range {}..={} does not fit {} segments",
                task.range.start,
                task.range.end,
                playlist.len()
            )));
        }

        let mut segments: BTreeMap<usize, Segment> =
            task.range.indices().map(|i| (i, Segment::new(i))).collect();
        for segment in stored {
            if let Some(slot) = segments.get_mut(&segment.index) {
                *slot = segment;
            }
        }
        for segment in segments.values_mut() {
            if segment.state.is_in_flight() {
                segment.state = SegmentState::Pending;
            }
        }
        if task.status == TaskStatus::Running {
            task.set_status(TaskStatus::Paused, "interrupted, resume to continue");
        }

        let writer = if task.status == TaskStatus::Completed {
            OrderedWriter::finished(task.ts_path(), task.range.end, task.bytes_completed)
        } else {
            let mut cursor = task.range.start;
            let mut written = 0u64;
            while let Some(segment) = segments.get(&cursor).filter(|s| s.is_done()) {
                written += segment.bytes;
                cursor += 1;
            }
            // payloads past the prefix were only held in memory
            for (_, segment) in segments.range_mut(cursor..) {
                reset_done(segment);
            }
            match OrderedWriter::resume(task.temp_path(), cursor, task.range.end, written)? {
                Some(writer) => writer,
                None => {
                    segments.values_mut().for_each(reset_done);
                    OrderedWriter::create(task.temp_path(), task.range.start, task.range.end)?
                }
            }
        };
        task.bytes_completed = segments
            .values()
            .filter(|s| s.is_done())
            .map(|s| s.bytes)
            .sum();

        let runtime = self.runtime_for(task, Arc::new(playlist), segments, writer);
        let snapshot = {
            let mut state = runtime.lock()?;
            debug!(task_id = %state.task.id, status = %state.task.status, "rebuilt task");
            state.snapshot()
        };
        runtime.persist(snapshot);
        Ok(runtime)
    }

    fn fetcher(&self, headers: HashMap<String, String>) -> SegmentFetcher {
        SegmentFetcher::new(
            Arc::clone(&self.net),
            self.validator.clone(),
            &self.config,
            headers,
        )
    }

    fn runtime_for(
        &self,
        task: Task,
        playlist: Arc<Playlist>,
        segments: BTreeMap<usize, Segment>,
        writer: OrderedWriter,
    ) -> Arc<TaskRuntime> {
        Arc::new(TaskRuntime {
            range: task.range,
            decrypt: task.decrypt,
            hinted_total: playlist.hinted_bytes(task.range.start, task.range.end),
            fetcher: self.fetcher(task.headers.clone()),
            playlist,
            progress: ProgressTracker::new(self.config.progress_window, task.bytes_completed),
            writer: Mutex::new(writer),
            storage: Arc::clone(&self.storage),
            muxer: Arc::clone(&self.muxer),
            persist_every: self.config.persist_every_segments.max(1),
            abort_on_failure: self.config.abort_on_segment_failure,
            persisted: AtomicU64::new(0),
            settled: Condvar::new(),
            work_ready: Condvar::new(),
            state: Mutex::new(RunState::new(task, segments)),
        })
    }

    fn runtime(&self, id: &TaskId) -> CoreResult<Arc<TaskRuntime>> {
        self.registry()?
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    fn registry(&self) -> CoreResult<MutexGuard<'_, HashMap<TaskId, Arc<TaskRuntime>>>> {
        self.tasks
            .lock()
            .map_err(|_| CoreError::Storage("task registry lock poisoned".to_string()))
    }

    fn storage(&self) -> CoreResult<MutexGuard<'_, Box<dyn Storage>>> {
        self.storage
            .lock()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }
}

fn reset_done(segment: &mut Segment) {
    if segment.is_done() {
        segment.state = SegmentState::Pending;
        segment.bytes = 0;
    }
}

fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

struct Snapshot {
    revision: u64,
    task: Task,
    segments: Vec<Segment>,
}

/// Everything guarded by the task lock.
struct RunState {
    task: Task,
    segments: BTreeMap<usize, Segment>,
    stop: Option<StopReason>,
    /// A supervisor is alive for the current run.
    run_active: bool,
    /// New workers may still join the current run.
    accepting: bool,
    aborted: bool,
    live_workers: usize,
    handles: Vec<JoinHandle<()>>,
    unsaved: usize,
    revision: u64,
}

impl RunState {
    fn new(task: Task, segments: BTreeMap<usize, Segment>) -> Self {
        Self {
            task,
            segments,
            stop: None,
            run_active: false,
            accepting: false,
            aborted: false,
            live_workers: 0,
            handles: Vec::new(),
            unsaved: 0,
            revision: 0,
        }
    }

    fn snapshot(&mut self) -> Snapshot {
        self.revision += 1;
        self.unsaved = 0;
        Snapshot {
            revision: self.revision,
            task: self.task.clone(),
            segments: self.segments.values().cloned().collect(),
        }
    }

    fn pending(&self) -> usize {
        self.segments
            .values()
            .filter(|s| s.state == SegmentState::Pending)
            .count()
    }

    fn failed(&self) -> usize {
        self.segments
            .values()
            .filter(|s| s.state == SegmentState::Failed)
            .count()
    }
}

struct TaskRuntime {
    range: SegmentRange,
    decrypt: bool,
    hinted_total: Option<u64>,
    playlist: Arc<Playlist>,
    fetcher: SegmentFetcher,
    progress: ProgressTracker,
    writer: Mutex<OrderedWriter>,
    storage: SharedStorage,
    muxer: Arc<dyn Muxer>,
    persist_every: usize,
    abort_on_failure: bool,
    persisted: AtomicU64,
    settled: Condvar,
    /// Wakes workers parked behind the read-ahead limit.
    work_ready: Condvar,
    state: Mutex<RunState>,
}

impl TaskRuntime {
    fn lock(&self) -> CoreResult<MutexGuard<'_, RunState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::InvalidState("task lock poisoned".to_string()))
    }

    fn wait_settled<'a>(
        &self,
        mut state: MutexGuard<'a, RunState>,
    ) -> CoreResult<MutexGuard<'a, RunState>> {
        while state.run_active {
            state = self
                .settled
                .wait(state)
                .map_err(|_| CoreError::InvalidState("task lock poisoned".to_string()))?;
        }
        Ok(state)
    }

    fn launch(self: &Arc<Self>) -> CoreResult<()> {
        let snapshot = {
            let mut state = self.lock()?;
            if state.run_active {
                return Err(CoreError::InvalidState(format!(
                    "task {} is still running",
                    state.task.id
                )));
            }
            if !state.task.status.can_start() {
                return Err(CoreError::InvalidState(format!(
                    "cannot start task in state {}",
                    state.task.status
                )));
            }
            state.stop = None;
            state.aborted = false;
            state.run_active = true;
            state.accepting = true;
            state.task.set_status(TaskStatus::Running, "downloading");
            let workers = state.pending().min(state.task.concurrency);
            for _ in 0..workers {
                self.spawn_worker(&mut state);
            }
            info!(
                task_id = %state.task.id,
                workers,
                pending = state.pending(),
                "task started"
            );
            state.snapshot()
        };
        self.progress.restart_window();
        self.persist(snapshot);

        let runtime = Arc::clone(self);
        thread::spawn(move || runtime.supervise());
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut RunState) {
        state.live_workers += 1;
        let runtime = Arc::clone(self);
        state.handles.push(thread::spawn(move || runtime.work()));
    }

    fn retry(self: &Arc<Self>, index: Option<usize>) -> CoreResult<usize> {
        let (snapshot, reset) = {
            let mut state = self.lock()?;
            if state.task.status == TaskStatus::Deleted {
                return Err(CoreError::NotFound(state.task.id.to_string()));
            }
            let reset = match index {
                Some(index) => {
                    if !self.range.contains(index) {
                        return Err(CoreError::SegmentOutOfRange {
                            index,
                            start: self.range.start,
                            end: self.range.end,
                        });
                    }
                    let segment = state.segments.get_mut(&index).ok_or_else(|| {
                        CoreError::SegmentOutOfRange {
                            index,
                            start: self.range.start,
                            end: self.range.end,
                        }
                    })?;
                    if !segment.reset_for_retry() {
                        return Err(CoreError::InvalidState(format!(
                            "segment {index} is {}, only failed segments can be retried",
                            segment.state
                        )));
                    }
                    1
                }
                None => state
                    .segments
                    .values_mut()
                    .filter(|s| s.state == SegmentState::Failed)
                    .map(|s| s.reset_for_retry())
                    .filter(|reset| *reset)
                    .count(),
            };
            if reset == 0 {
                return Ok(0);
            }

            if state.run_active && state.accepting && state.stop.is_none() {
                state.aborted = false;
                self.work_ready.notify_all();
                let room = state.task.concurrency.saturating_sub(state.live_workers);
                for _ in 0..room.min(reset) {
                    self.spawn_worker(&mut state);
                }
            }
            info!(task_id = %state.task.id, segments = reset, "segments queued for retry");
            state.task.touch();
            (state.snapshot(), reset)
        };
        self.persist(snapshot);
        Ok(reset)
    }

    fn work(self: Arc<Self>) {
        while let Some(index) = self.claim() {
            let result = self.download(index);
            self.settle_segment(index, result);
        }
    }

    /// Lowest pending index, or `None` once this worker should exit. The
    /// exit is counted under the same lock so retries see an accurate
    /// number of live workers.
    ///
    /// A worker never claims further than the read-ahead limit past the first
    /// unfinished segment. Beyond it, the worker parks while other fetches
    /// could still move that segment forward, and exits otherwise.
    fn claim(&self) -> Option<usize> {
        let mut state = self.state.lock().ok()?;
        loop {
            if state.stop.is_some() || state.aborted {
                break;
            }
            let Some(next) = state
                .segments
                .values()
                .find(|s| s.state == SegmentState::Pending)
                .map(|s| s.index)
            else {
                break;
            };
            let frontier = state
                .segments
                .values()
                .find(|s| !s.is_done())
                .map(|s| s.index)
                .unwrap_or(next);
            let limit = frontier + state.task.concurrency.max(1) * READ_AHEAD_PER_WORKER;
            if next < limit {
                if let Some(segment) = state.segments.get_mut(&next) {
                    segment.advance(SegmentState::Downloading);
                }
                return Some(next);
            }
            if !state.segments.values().any(|s| s.state.is_in_flight()) {
                debug!(
                    task_id = %state.task.id,
                    frontier,
                    "read-ahead limit reached with nothing in flight"
                );
                break;
            }
            state = self.work_ready.wait(state).ok()?;
        }
        state.live_workers = state.live_workers.saturating_sub(1);
        None
    }

    fn download(&self, index: usize) -> CoreResult<u64> {
        let info = self
            .playlist
            .segment(index)
            .ok_or(CoreError::SegmentOutOfRange {
                index,
                start: self.range.start,
                end: self.range.end,
            })?;
        let key = if self.decrypt {
            self.playlist.key_for(info).map(|key| SegmentKey {
                key,
                sequence_number: self.playlist.sequence_number(index),
            })
        } else {
            None
        };
        let payload = self
            .fetcher
            .fetch_segment(info, key, |stage| self.mark_stage(index, stage))?;
        let bytes = payload.len() as u64;
        self.writer
            .lock()
            .map_err(|_| CoreError::Io("writer lock poisoned".to_string()))?
            .push(index, payload)?;
        Ok(bytes)
    }

    fn mark_stage(&self, index: usize, stage: SegmentState) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(segment) = state.segments.get_mut(&index) {
                segment.advance(stage);
            }
        }
    }

    fn settle_segment(&self, index: usize, result: CoreResult<u64>) {
        let (snapshot, added) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let task_id = state.task.id;
            let mut added = None;
            match result {
                Ok(bytes) => {
                    let done = state
                        .segments
                        .get_mut(&index)
                        .map(|segment| segment.complete(bytes))
                        .unwrap_or(false);
                    if done {
                        state.task.bytes_completed += bytes;
                        added = Some(bytes);
                    }
                    debug!(task_id = %task_id, index, bytes, "segment done");
                }
                Err(err) => {
                    warn!(task_id = %task_id, index, error = %err, "segment failed");
                    if let Some(segment) = state.segments.get_mut(&index) {
                        segment.fail(err.kind());
                    }
                    state.task.message = Some(format!("segment {index} failed: {err}"));
                    if self.abort_on_failure {
                        state.aborted = true;
                    }
                }
            }
            state.task.touch();
            state.unsaved += 1;
            let snapshot = if state.unsaved >= self.persist_every {
                Some(state.snapshot())
            } else {
                None
            };
            (snapshot, added)
        };
        self.work_ready.notify_all();
        if let Some(bytes) = added {
            self.progress.add(bytes);
        }
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
    }

    fn supervise(self: Arc<Self>) {
        loop {
            let next = match self.state.lock() {
                Ok(mut state) => match state.handles.pop() {
                    Some(handle) => Some(handle),
                    None => {
                        state.accepting = false;
                        None
                    }
                },
                Err(_) => None,
            };
            match next {
                Some(handle) => {
                    if handle.join().is_err() {
                        warn!("segment worker panicked");
                    }
                }
                None => break,
            }
        }

        let (outcome, task) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.live_workers = 0;
            let outcome = if state.stop == Some(StopReason::Delete) {
                Outcome::Deleted
            } else if state.segments.values().all(Segment::is_done) {
                Outcome::Finish
            } else if state.stop == Some(StopReason::Pause) {
                Outcome::Paused
            } else {
                Outcome::Failed
            };
            (outcome, state.task.clone())
        };

        let finished = match outcome {
            Outcome::Finish => Some(self.finish(&task)),
            _ => {
                // persisted segment states must not run ahead of the file
                match self.writer.lock() {
                    Ok(mut writer) => {
                        if let Err(err) = writer.checkpoint() {
                            warn!(task_id = %task.id, error = %err, "failed to sync output");
                        }
                    }
                    Err(_) => warn!(task_id = %task.id, "writer lock poisoned"),
                }
                None
            }
        };

        let snapshot = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match (outcome, finished) {
                (Outcome::Finish, Some(Ok((path, post_process)))) => {
                    info!(task_id = %task.id, path = %path.display(), "task completed");
                    state.task.output_path = Some(path);
                    state.task.post_process = Some(post_process);
                    state.task.set_status(TaskStatus::Completed, "completed");
                }
                (Outcome::Finish, Some(Err(err))) => {
                    warn!(task_id = %task.id, error = %err, "failed to finalize output");
                    state
                        .task
                        .set_status(TaskStatus::Failed, format!("failed to finalize output: {err}"));
                }
                (Outcome::Paused, _) => {
                    state.task.set_status(TaskStatus::Paused, "paused");
                }
                (Outcome::Failed, _) => {
                    let failed = state.failed();
                    let message = if state.aborted {
                        format!("stopped after a segment failure, {failed} segment(s) failed")
                    } else {
                        format!("{failed} segment(s) failed")
                    };
                    warn!(task_id = %task.id, failed, "task failed");
                    state.task.set_status(TaskStatus::Failed, message);
                }
                _ => {}
            }
            if state.stop == Some(StopReason::Delete) {
                None
            } else {
                Some(state.snapshot())
            }
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }

        if let Ok(mut state) = self.state.lock() {
            state.run_active = false;
        }
        self.settled.notify_all();
    }

    fn finish(&self, task: &Task) -> CoreResult<(PathBuf, PostProcess)> {
        let ts_path = self
            .writer
            .lock()
            .map_err(|_| CoreError::Io("writer lock poisoned".to_string()))?
            .finalize(&task.ts_path())?;
        if task.output_format == OutputFormat::Ts {
            return Ok((ts_path, PostProcess::Skipped));
        }

        let target = task.container_path();
        match self.muxer.mux(&ts_path, &target) {
            Ok(()) => {
                if let Err(err) = fs::remove_file(&ts_path) {
                    warn!(path = %ts_path.display(), error = %err, "could not remove muxed input");
                }
                let path = target.to_string_lossy().into_owned();
                Ok((target, PostProcess::Muxed { path }))
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "muxing failed, keeping transport stream");
                Ok((
                    ts_path,
                    PostProcess::Failed {
                        reason: err.to_string(),
                    },
                ))
            }
        }
    }

    /// Write a snapshot unless a newer one already reached storage.
    fn persist(&self, snapshot: Snapshot) {
        if snapshot.task.status == TaskStatus::Deleted {
            return;
        }
        let Ok(mut storage) = self.storage.lock() else {
            warn!(task_id = %snapshot.task.id, "storage lock poisoned, state not saved");
            return;
        };
        if snapshot.revision <= self.persisted.load(Ordering::SeqCst) {
            return;
        }
        let saved = storage
            .save_task(&snapshot.task)
            .and_then(|_| storage.save_segments(&snapshot.task.id, &snapshot.segments));
        match saved {
            Ok(()) => self.persisted.store(snapshot.revision, Ordering::SeqCst),
            Err(err) => warn!(task_id = %snapshot.task.id, error = %err, "failed to save task"),
        }
    }

    fn view(&self) -> CoreResult<TaskSnapshot> {
        let (task, segments) = {
            let state = self.lock()?;
            (
                state.task.clone(),
                state.segments.values().cloned().collect::<Vec<_>>(),
            )
        };
        let done_count = segments.iter().filter(|s| s.is_done()).count();
        let done_bytes: u64 = segments.iter().filter(|s| s.is_done()).map(|s| s.bytes).sum();
        let expected_bytes = estimate_total(self.hinted_total, segments.len(), done_count, done_bytes);
        let (speed_bps, eta) = if task.status == TaskStatus::Running {
            (self.progress.speed_bps(), self.progress.eta(expected_bytes))
        } else {
            (0.0, None)
        };
        let progress = if segments.is_empty() {
            0.0
        } else {
            done_count as f64 / segments.len() as f64
        };
        Ok(TaskSnapshot {
            task,
            segments,
            speed_bps,
            eta,
            expected_bytes,
            progress,
        })
    }
}
