//! The in-memory process supervisor (spec.md §4.2).
//!
//! Owns the live `std::process::Child` handles and a background reaper
//! thread that polls them for exit without blocking on `wait()`. Each job
//! is launched into its own session (`setsid`) so `stop` can signal the
//! whole process group, not just the immediate child — matching the
//! teacher's kill-the-tree handling in its Windows Job Object fallback, done
//! here with POSIX process groups instead.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::SupervisorTunables;
use crate::error::SupervisorError;

/// Outcome of a reaped child, handed to whoever is listening on the
/// supervisor's [`Sender<ReapEvent>`].
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    /// Process called `exit()` (or returned from `main`) with this code.
    Exited(i32),
    /// Process was terminated by a signal.
    Signaled(i32),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

/// Emitted by the reaper thread when a tracked child exits on its own
/// (i.e. not as a direct result of `stop`).
#[derive(Debug, Clone)]
pub struct ReapEvent {
    pub job_id: String,
    pub pid: u32,
    pub outcome: ExitOutcome,
}

/// Everything spawn needs to know about where a job's output goes.
pub struct SpawnRequest<'a> {
    pub job_id: &'a str,
    pub command: &'a str,
    pub cwd: &'a Path,
    pub stdout_path: &'a Path,
    pub stderr_path: &'a Path,
}

/// What spawn hands back on success.
pub struct SpawnedProcess {
    pub pid: u32,
}

/// What `find` hands back: either the live in-process handle, or a
/// reconstructed read-only view built from a persisted pid that still
/// checks out.
#[derive(Debug, Clone, Copy)]
pub struct ProcessHandle {
    pub pid: u32,
    pub reconstructed: bool,
}

struct TrackedChild {
    child: Child,
}

/// Live-process registry plus reaper thread.
pub struct ProcessSupervisor {
    registry: Arc<Mutex<HashMap<String, TrackedChild>>>,
    /// Every `job_id` this supervisor instance has itself spawned, kept
    /// around even after the reaper removes the live entry. Only the
    /// process that actually forked a child can ever collect its real exit
    /// status, so this distinguishes "our own reaper is about to report
    /// this exit" from "nobody will ever reap this for us" in
    /// [`crate::manager::JobManager::get_status`]'s reconciliation.
    owned: Arc<Mutex<HashSet<String>>>,
    tunables: SupervisorTunables,
    reaper: Option<thread::JoinHandle<()>>,
    stop_reaper: Arc<std::sync::atomic::AtomicBool>,
}

impl ProcessSupervisor {
    /// Start a supervisor with its reaper thread, publishing exit events on
    /// `events`.
    pub fn start(tunables: SupervisorTunables, events: Sender<ReapEvent>) -> Self {
        let registry: Arc<Mutex<HashMap<String, TrackedChild>>> = Arc::new(Mutex::new(HashMap::new()));
        let stop_reaper = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reaper_registry = Arc::clone(&registry);
        let reaper_stop = Arc::clone(&stop_reaper);
        let interval = tunables.reap_interval;
        let reaper = thread::spawn(move || {
            while !reaper_stop.load(std::sync::atomic::Ordering::Relaxed) {
                thread::sleep(interval);
                reap_once(&reaper_registry, &events);
            }
        });

        ProcessSupervisor {
            registry,
            owned: Arc::new(Mutex::new(HashSet::new())),
            tunables,
            reaper: Some(reaper),
            stop_reaper,
        }
    }

    /// Launch `request.command` via `sh -c`, in its own session, with stdout
    /// and stderr truncated and redirected to the given paths.
    pub fn spawn(&self, request: SpawnRequest<'_>) -> Result<SpawnedProcess, SupervisorError> {
        if !request.cwd.is_dir() {
            return Err(SupervisorError::WorkingDirectoryInvalid(request.cwd.to_path_buf()));
        }

        let stdout_file = open_truncated(request.stdout_path)?;
        let stderr_file = open_truncated(request.stderr_path)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(request.command)
            .current_dir(request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));

        // SAFETY: setsid() is async-signal-safe and the only thing we do
        // between fork and exec in the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| classify_spawn_error(request.command, e))?;
        let pid = child.id();

        {
            let mut registry = self.registry.lock().expect("supervisor registry poisoned");
            registry.insert(request.job_id.to_string(), TrackedChild { child });
        }
        self.owned
            .lock()
            .expect("supervisor owned-set poisoned")
            .insert(request.job_id.to_string());

        Ok(SpawnedProcess { pid })
    }

    /// True if `pid` is tracked as live for `job_id` under this supervisor's
    /// in-process registry.
    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.registry
            .lock()
            .expect("supervisor registry poisoned")
            .contains_key(job_id)
    }

    /// True if this supervisor instance has, at some point in its lifetime,
    /// itself spawned `job_id` — meaning only this process's reaper can ever
    /// observe that job's real exit status. Used by the read-path
    /// reconciliation to avoid guessing a terminal state while this
    /// process's own reap-event consumer may still be in flight with the
    /// authoritative one (spec.md §4.3: "if the reaper had in fact observed
    /// a zero exit but lost the race").
    pub fn owns(&self, job_id: &str) -> bool {
        self.owned
            .lock()
            .expect("supervisor owned-set poisoned")
            .contains(job_id)
    }

    /// The registered live handle for `job_id`, if any; otherwise falls back
    /// to the persisted `(last_pid, command)` the caller provides, verifying
    /// the OS process still exists and its command line still matches
    /// before returning a reconstructed handle (spec.md §4.2's `find`,
    /// pid-reuse guard per §9).
    pub fn find(&self, job_id: &str, persisted_last_pid: u32, persisted_command: &str) -> Option<ProcessHandle> {
        {
            let registry = self.registry.lock().expect("supervisor registry poisoned");
            if let Some(tracked) = registry.get(job_id) {
                return Some(ProcessHandle {
                    pid: tracked.child.id(),
                    reconstructed: false,
                });
            }
        }

        if persisted_last_pid != 0 && pid_exists(persisted_last_pid) && is_same_process(persisted_last_pid, persisted_command) {
            return Some(ProcessHandle {
                pid: persisted_last_pid,
                reconstructed: true,
            });
        }

        None
    }

    /// All job_ids whose processes the registry believes are still alive.
    pub fn list(&self) -> Vec<(String, u32)> {
        let registry = self.registry.lock().expect("supervisor registry poisoned");
        registry
            .iter()
            .filter(|(_, tracked)| pid_exists(tracked.child.id()))
            .map(|(job_id, tracked)| (job_id.clone(), tracked.child.id()))
            .collect()
    }

    /// Send the polite signal (`SIGTERM`) to the job's process group,
    /// retrying up to `polite_signal_attempts` times across the grace
    /// period, then escalate to `SIGKILL` if it is still alive.
    ///
    /// Locates its target the same way [`Self::find`] does: a handle we
    /// spawned ourselves and still track is preferred, but a job this
    /// process inherited from a persisted record (the "Manager B stops a
    /// job Manager A spawned" scenario, spec.md §8) is just as stoppable —
    /// we simply can't `waitpid` a pid we never forked, so liveness there
    /// is polled via a signal-0 probe instead of `try_wait`.
    pub fn stop(&self, job_id: &str, persisted_last_pid: u32, persisted_command: &str) -> Result<Option<ExitOutcome>, SupervisorError> {
        let tracked_pid = {
            let registry = self.registry.lock().expect("supervisor registry poisoned");
            registry.get(job_id).map(|tracked| tracked.child.id())
        };

        let (pid, owned) = match tracked_pid {
            Some(pid) => (pid, true),
            None => {
                if persisted_last_pid != 0
                    && pid_exists(persisted_last_pid)
                    && is_same_process(persisted_last_pid, persisted_command)
                {
                    (persisted_last_pid, false)
                } else {
                    return Ok(None);
                }
            }
        };

        let pgid = Pid::from_raw(pid as i32);
        let deadline_polls =
            (self.tunables.stop_grace_period.as_millis() / self.tunables.stop_poll_interval.as_millis().max(1)) as u32;
        let polls_per_attempt = (deadline_polls / self.tunables.polite_signal_attempts.max(1)).max(1);

        for attempt in 0..self.tunables.polite_signal_attempts {
            let _ = signal::killpg(pgid, Signal::SIGTERM);
            for _ in 0..polls_per_attempt {
                thread::sleep(self.tunables.stop_poll_interval);
                if let Some(outcome) = self.try_reap(job_id, pid, owned) {
                    return Ok(Some(outcome));
                }
            }
            tracing::debug!(job_id, attempt, "job still alive after SIGTERM, retrying");
        }

        let _ = signal::killpg(pgid, Signal::SIGKILL);
        for _ in 0..20 {
            thread::sleep(self.tunables.stop_poll_interval);
            if let Some(outcome) = self.try_reap(job_id, pid, owned) {
                return Ok(Some(outcome));
            }
        }

        tracing::warn!(job_id, "job did not exit after SIGKILL");
        Ok(None)
    }

    /// Non-blocking check: for a child we own, reap it via `try_wait` and
    /// drop it from the registry; for a foreign (reconstructed) pid we can
    /// only probe liveness, since only the real parent can collect its exit
    /// status.
    fn try_reap(&self, job_id: &str, pid: u32, owned: bool) -> Option<ExitOutcome> {
        if !owned {
            return if pid_exists(pid) { None } else { Some(ExitOutcome::Signaled(-1)) };
        }
        let mut registry = self.registry.lock().expect("supervisor registry poisoned");
        let tracked = registry.get_mut(job_id)?;
        match tracked.child.try_wait() {
            Ok(Some(status)) => {
                registry.remove(job_id);
                Some(outcome_from_status(status))
            }
            _ => None,
        }
    }

    /// Stop the reaper thread without touching any tracked children.
    pub fn shutdown(mut self) {
        self.stop_reaper.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop_reaper.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}

fn reap_once(registry: &Mutex<HashMap<String, TrackedChild>>, events: &Sender<ReapEvent>) {
    let mut done = Vec::new();
    {
        let mut registry = registry.lock().expect("supervisor registry poisoned");
        registry.retain(|job_id, tracked| match tracked.child.try_wait() {
            Ok(Some(status)) => {
                done.push((job_id.clone(), tracked.child.id(), outcome_from_status(status)));
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "failed polling child, dropping from registry");
                false
            }
        });
    }
    for (job_id, pid, outcome) in done {
        let _ = events.send(ReapEvent { job_id, pid, outcome });
    }
}

fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitOutcome::Exited(code),
        None => ExitOutcome::Signaled(status.signal().unwrap_or(-1)),
    }
}

fn open_truncated(path: &Path) -> Result<File, SupervisorError> {
    File::create(path).map_err(|source| SupervisorError::LogFileUnwritable {
        path: path.to_path_buf(),
        source,
    })
}

fn classify_spawn_error(command: &str, e: io::Error) -> SupervisorError {
    match e.kind() {
        io::ErrorKind::NotFound => SupervisorError::ExecutableNotFound(command.to_string()),
        io::ErrorKind::PermissionDenied => SupervisorError::PermissionDenied(command.to_string()),
        _ => SupervisorError::ForkFailed(e),
    }
}

/// Compare a persisted pid's live `/proc/<pid>/cmdline` against the
/// command the store believes it is running. A mismatch means the pid was
/// reused by an unrelated process after our process exited without being
/// reaped (spec.md §4.2's pid-reuse guard). Degrades to "assume alive" if
/// `/proc` is unavailable (e.g. non-Linux), matching the spec's documented
/// degraded-fallback behavior.
pub fn is_same_process(pid: u32, expected_command: &str) -> bool {
    let cmdline_path = PathBuf::from(format!("/proc/{pid}/cmdline"));
    match std::fs::read(&cmdline_path) {
        Ok(bytes) => {
            let joined: String = bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            expected_command.contains(&joined) || joined.contains(expected_command)
        }
        Err(_) => true,
    }
}

/// True if a process with this pid currently exists (signal 0 probe).
pub fn pid_exists(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}
