//! OS processes started for a match, and the registry that guarantees their cleanup.

use std::{
    collections::HashMap,
    fs::File,
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{debug, instrument, trace, warn};

use crate::error::RunnerError;

type SharedChild = Arc<Mutex<Option<Child>>>;

fn lock(child: &SharedChild) -> MutexGuard<'_, Option<Child>> {
    // a poisoned lock still holds a valid child handle
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where the output of a process goes.
#[derive(Debug)]
pub(crate) enum Output<'a> {
    /// Discard stdout and stderr.
    Null,
    /// Write stdout and stderr to the same file.
    File(&'a Path),
}

pub(crate) fn create_process(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    output: Output<'_>,
) -> Result<Child, RunnerError> {
    let launch_failed = |source| RunnerError::LaunchFailed {
        program: program.to_string(),
        source,
    };

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    match output {
        Output::Null => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Output::File(path) => {
            let out = File::create(path).map_err(launch_failed)?;
            let err = out.try_clone().map_err(launch_failed)?;
            cmd.stdout(out).stderr(err);
        }
    }

    // own process group: a signal sent to the runner's group does not reach the child
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    cmd.spawn().map_err(launch_failed)
}

/// A child process killed when dropped.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    child: SharedChild,
}

impl ManagedProcess {
    pub(crate) fn new(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            child: Arc::new(Mutex::new(Some(child))),
        }
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, `None` once killed.
    pub fn id(&self) -> Option<u32> {
        lock(&self.child).as_ref().map(Child::id)
    }

    /// Forcefully terminate and reap the process.
    ///
    /// Returns `false` when there was nothing left to kill.
    pub fn kill(&self) -> bool {
        kill_shared(&self.label, &self.child)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if kill_shared(&self.label, &self.child) {
            trace!("'{}' killed on drop", self.label);
        }
    }
}

fn kill_shared(label: &str, child: &SharedChild) -> bool {
    let Some(mut child) = lock(child).take() else {
        return false;
    };
    if let Err(e) = child.kill() {
        // already exited, still reaped below
        debug!("could not kill '{label}' ({}): {e}", child.id());
    }
    if let Err(e) = child.wait() {
        warn!("could not reap '{label}' ({}): {e}", child.id());
    }
    true
}

/// Handle returned by [`ProcessRegistry::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackingId(u64);

/// Every process a scheduler started and has not explicitly released yet.
///
/// [`ProcessRegistry::shutdown`] is the cleanup hook: it force-kills whatever is still
/// tracked, so no bot or proxy outlives the runner.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    tracked: Mutex<HashMap<TrackingId, (String, SharedChild)>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<TrackingId, (String, SharedChild)>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking `process` until [`untrack`](Self::untrack) or shutdown.
    pub fn track(&self, process: &ManagedProcess) -> TrackingId {
        let id = TrackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tracked()
            .insert(id, (process.label.clone(), process.child.clone()));
        id
    }

    /// Stop tracking a process that was explicitly killed.
    pub fn untrack(&self, id: TrackingId) {
        self.tracked().remove(&id);
    }

    /// Number of processes still tracked.
    pub fn len(&self) -> usize {
        self.tracked().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every tracked process, ignoring individual failures. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> usize {
        let tracked = std::mem::take(&mut *self.tracked());
        let mut killed = 0;
        for (label, child) in tracked.into_values() {
            if kill_shared(&label, &child) {
                warn!("'{label}' was still running at shutdown, killed");
                killed += 1;
            }
        }
        killed
    }
}
