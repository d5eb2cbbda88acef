//! Drop-folder watcher that turns partner uploads into starts and resumes.
//!
//! New files land in `incoming/<partner>/<period>/` and start the run
//! `<partner>-<period>-deterministic`; corrected files land in
//! `uploads/<run_id>/` and resume that run. The newest file in each folder
//! becomes a candidate once its fingerprint holds across two scans. Each
//! candidate is handled on its own thread; a `(trigger, run_id, hash)` key is
//! dispatched at most once while the file is present and a run never has two
//! operations in flight, so repeated or overlapping notifications cannot
//! double-start or double-resume.
use crate::error::{protocol_violation, IntakeError};
use crate::orchestrator::{Orchestrator, StartRequest};
use crate::plan::{DETERMINISTIC_MODE, INTAKE_WORKFLOW};
use crate::run::{load_run, run_exists, validate_run_id, RunStatus};
use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

mod detector;
mod fingerprint;

pub use detector::open_detector;
use detector::PollDetector;
pub use fingerprint::{fingerprint_file, FingerprintTracker};

/// Gap between the two scans of a one-shot pass.
const ONCE_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub incoming_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub poll_interval: Duration,
    pub force_poll: bool,
    /// Scan, dispatch, wait for the dispatched work, and return.
    pub once: bool,
}

impl WatchOptions {
    fn dirs(&self) -> [PathBuf; 2] {
        [self.incoming_dir.clone(), self.uploads_dir.clone()]
    }
}

/// What a settled upload asks of its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Start,
    Resume,
}

/// Settled upload ready to start or resume a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub trigger: Trigger,
    pub run_id: String,
    pub path: PathBuf,
    pub hash: String,
}

impl Candidate {
    fn key(&self) -> DispatchKey {
        (self.trigger, self.run_id.clone(), self.hash.clone())
    }
}

type DispatchKey = (Trigger, String, String);

/// Run the watch loop until `stop` is set, or a single pass with `once`.
pub fn watch(
    orchestrator: &Orchestrator,
    options: &WatchOptions,
    stop: &AtomicBool,
) -> Result<()> {
    for dir in options.dirs() {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut tracker = FingerprintTracker::default();
    let mut dispatcher = Dispatcher::new(orchestrator.clone());

    if options.once {
        tracker.observe(scan(options));
        thread::sleep(ONCE_SETTLE);
        dispatch_all(&mut dispatcher, candidates(options, tracker.observe(scan(options))));
        dispatcher.join();
        expire(orchestrator);
        return Ok(());
    }

    let mut detector = open_detector(&options.dirs(), options.force_poll);
    info!(
        incoming = %options.incoming_dir.display(),
        uploads = %options.uploads_dir.display(),
        detector = detector.name(),
        interval_secs = options.poll_interval.as_secs(),
        "watching for partner uploads"
    );
    while !stop.load(Ordering::Relaxed) {
        let found = scan(options);
        dispatcher.retain(&candidates(options, found.clone()));
        dispatch_all(&mut dispatcher, candidates(options, tracker.observe(found)));
        dispatcher.reap();
        expire(orchestrator);
        if let Err(err) = detector.wait(options.poll_interval) {
            warn!(error = %format!("{err:#}"), "file notifications stopped; polling");
            detector = Box::new(PollDetector);
        }
    }
    dispatcher.join();
    info!("watch stopped");
    Ok(())
}

fn dispatch_all(dispatcher: &mut Dispatcher, found: Vec<Candidate>) {
    for candidate in found {
        let run_id = candidate.run_id.clone();
        if let Err(err) = dispatcher.dispatch(candidate) {
            warn!(run_id, error = %format!("{err:#}"), "dispatch failed");
        }
    }
}

fn expire(orchestrator: &Orchestrator) {
    match orchestrator.expire_stale() {
        Ok(expired) => {
            for run_id in expired {
                info!(run_id, "abandoned expired suspension");
            }
        }
        Err(err) => warn!(error = %format!("{err:#}"), "expiry sweep failed"),
    }
}

/// Components of `path` below `dir`, when it sits exactly `depth` folders deep.
fn folder_names<'a>(dir: &Path, path: &'a Path, depth: usize) -> Option<Vec<&'a str>> {
    let relative = path.strip_prefix(dir).ok()?;
    let parts = relative
        .components()
        .map(|part| part.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != depth + 1 {
        return None;
    }
    Some(parts[..depth].to_vec())
}

/// Run id owning a corrected upload at `uploads/<run_id>/<file>`.
pub fn run_id_for(uploads_dir: &Path, path: &Path) -> Option<String> {
    let run_id = folder_names(uploads_dir, path, 1)?[0].to_string();
    validate_run_id(&run_id).ok()?;
    Some(run_id)
}

/// Run id started by an initial upload at `incoming/<partner>/<period>/<file>`.
pub fn start_run_id_for(incoming_dir: &Path, path: &Path) -> Option<String> {
    let names = folder_names(incoming_dir, path, 2)?;
    let run_id = format!("{}-{}-{DETERMINISTIC_MODE}", names[0], names[1]);
    validate_run_id(&run_id).ok()?;
    Some(run_id)
}

fn candidates(
    options: &WatchOptions,
    files: impl IntoIterator<Item = (PathBuf, String)>,
) -> Vec<Candidate> {
    files
        .into_iter()
        .filter_map(|(path, hash)| {
            let (trigger, run_id) = match run_id_for(&options.uploads_dir, &path) {
                Some(run_id) => (Trigger::Resume, run_id),
                None => (Trigger::Start, start_run_id_for(&options.incoming_dir, &path)?),
            };
            Some(Candidate {
                trigger,
                run_id,
                path,
                hash,
            })
        })
        .collect()
}

fn scan(options: &WatchOptions) -> BTreeMap<PathBuf, String> {
    let mut found = scan_folders(&options.incoming_dir, 2);
    found.extend(scan_folders(&options.uploads_dir, 1));
    found
}

/// Fingerprint of the newest visible file in each folder `depth` levels
/// below `dir`. Unreadable folders are logged and skipped.
fn scan_folders(dir: &Path, depth: usize) -> BTreeMap<PathBuf, String> {
    let mut level = vec![dir.to_path_buf()];
    for _ in 0..depth {
        level = level.iter().flat_map(|dir| child_dirs(dir)).collect();
    }
    let mut found = BTreeMap::new();
    for folder in level {
        let newest = match newest_file(&folder) {
            Ok(Some(newest)) => newest,
            Ok(None) => continue,
            Err(err) => {
                warn!(dir = %folder.display(), error = %format!("{err:#}"), "skipping folder");
                continue;
            }
        };
        match fingerprint_file(&newest) {
            Ok(hash) => {
                found.insert(newest, hash);
            }
            // Removed between listing and reading.
            Err(err) => debug!(path = %newest.display(), error = %err, "skipping upload"),
        }
    }
    found
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "skipping folder");
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping entry");
                None
            }
        })
        .filter(|path| path.is_dir())
        .collect()
}

fn newest_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if hidden || !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let newer = match &newest {
            Some((time, current)) => (modified, &path) > (*time, current),
            None => true,
        };
        if newer {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[derive(Default)]
struct DispatchState {
    dispatched: HashSet<DispatchKey>,
    in_flight: HashSet<String>,
}

/// Hands candidates to worker threads without duplicating work.
pub struct Dispatcher {
    orchestrator: Orchestrator,
    state: Arc<Mutex<DispatchState>>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            state: Arc::new(Mutex::new(DispatchState::default())),
            handles: Vec::new(),
        }
    }

    /// Start work for `candidate` unless it was already dispatched or its run
    /// has an operation in flight. Returns whether a thread was started.
    pub fn dispatch(&mut self, candidate: Candidate) -> Result<bool> {
        let key = candidate.key();
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("dispatch state poisoned"))?;
            if state.dispatched.contains(&key) {
                debug!(run_id = candidate.run_id.as_str(), "duplicate upload event");
                return Ok(false);
            }
            if state.in_flight.contains(&candidate.run_id) {
                debug!(run_id = candidate.run_id.as_str(), "run busy; upload deferred");
                return Ok(false);
            }
            state.dispatched.insert(key.clone());
            state.in_flight.insert(candidate.run_id.clone());
        }
        let orchestrator = self.orchestrator.clone();
        let state = Arc::clone(&self.state);
        self.handles.push(thread::spawn(move || {
            let retry = match candidate.trigger {
                Trigger::Start => start_candidate(&orchestrator, &candidate),
                Trigger::Resume => resume_candidate(&orchestrator, &candidate),
            };
            if let Ok(mut state) = state.lock() {
                state.in_flight.remove(&candidate.run_id);
                if retry {
                    state.dispatched.remove(&key);
                }
            }
        }));
        Ok(true)
    }

    /// Forget dispatched keys whose file is gone from the drop folders.
    pub fn retain(&mut self, present: &[Candidate]) {
        let present: HashSet<DispatchKey> = present.iter().map(Candidate::key).collect();
        if let Ok(mut state) = self.state.lock() {
            let DispatchState {
                dispatched,
                in_flight,
            } = &mut *state;
            dispatched.retain(|key| present.contains(key) || in_flight.contains(&key.1));
        }
    }

    #[cfg(test)]
    fn dispatched_len(&self) -> usize {
        self.state.lock().map(|state| state.dispatched.len()).unwrap_or(0)
    }

    /// Drop handles of finished work.
    pub fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.handles.drain(..).partition(JoinHandle::is_finished);
        self.handles = running;
        for handle in done {
            if handle.join().is_err() {
                warn!("watch worker panicked");
            }
        }
    }

    /// Wait for every dispatched operation.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("watch worker panicked");
            }
        }
    }
}

/// Start a run from an initial upload. Returns whether the candidate should
/// be offered again on a later scan.
fn start_candidate(orchestrator: &Orchestrator, candidate: &Candidate) -> bool {
    let run_id = candidate.run_id.as_str();
    if run_exists(&orchestrator.context().root, run_id) {
        debug!(run_id, "duplicate initial upload");
        return false;
    }
    info!(run_id, path = %candidate.path.display(), "starting run from upload");
    let request = StartRequest {
        workflow: INTAKE_WORKFLOW.to_string(),
        run_id: run_id.to_string(),
        input: candidate.path.clone(),
    };
    match orchestrator.start(&request) {
        Ok(run) => {
            info!(run_id, status = %run.status, "start finished");
            false
        }
        Err(err) => match protocol_violation(&err) {
            Some(IntakeError::RunExists { .. }) => {
                debug!(run_id, "duplicate initial upload");
                false
            }
            Some(IntakeError::RunBusy { .. }) => {
                debug!(run_id, error = %err, "start not applicable yet");
                true
            }
            Some(_) => {
                debug!(run_id, error = %err, "start refused");
                false
            }
            None => {
                warn!(run_id, error = %format!("{err:#}"), "start failed");
                false
            }
        },
    }
}

/// Resume one run from a corrected upload. Returns whether the candidate
/// should be offered again on a later scan.
fn resume_candidate(orchestrator: &Orchestrator, candidate: &Candidate) -> bool {
    let run_id = candidate.run_id.as_str();
    match load_run(&orchestrator.context().root, run_id) {
        Ok(run) if run.input_fingerprint.as_deref() == Some(candidate.hash.as_str()) => {
            debug!(run_id, "upload already consumed");
            return false;
        }
        Ok(run) if run.status != RunStatus::SuspendedForCorrection => {
            debug!(run_id, status = %run.status, "run not awaiting correction");
            return !run.status.is_terminal();
        }
        Ok(_) => {}
        Err(err) => {
            debug!(run_id, error = %err, "upload for unknown run");
            return false;
        }
    }
    info!(run_id, path = %candidate.path.display(), "resuming from upload");
    match orchestrator.resume(run_id, &candidate.path) {
        Ok(run) => {
            info!(run_id, status = %run.status, "resume finished");
            false
        }
        Err(err) => match protocol_violation(&err) {
            Some(IntakeError::RunBusy { .. }) | Some(IntakeError::NotResumable { .. }) => {
                debug!(run_id, error = %err, "resume not applicable yet");
                true
            }
            Some(_) => {
                debug!(run_id, error = %err, "resume refused");
                false
            }
            None => {
                warn!(run_id, error = %format!("{err:#}"), "resume failed");
                false
            }
        },
    }
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
