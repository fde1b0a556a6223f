//! Base-directory resolution and supervisor tunables.
//!
//! Generalizes the teacher's `jobstore::resolve_root` priority chain
//! (explicit path → env var → XDG → home-relative default). The
//! [`crate::manager::JobManager`] constructor itself only ever takes an
//! explicit path (spec.md §6: "a caller-supplied base directory"); this
//! chain is offered as an opt-in convenience for hosts that want it.

use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;

/// Environment variable consulted by [`resolve_base`] before falling back to
/// platform defaults.
pub const ROOT_ENV_VAR: &str = "JOB_SUPERVISOR_ROOT";

/// Resolve the supervisor's base directory: explicit argument, then
/// `JOB_SUPERVISOR_ROOT`, then `$XDG_DATA_HOME/job-supervisor`, then
/// `~/.local/share/job-supervisor`.
pub fn resolve_base(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("job-supervisor");
        }
    }

    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs.data_local_dir().join("job-supervisor");
    }

    PathBuf::from("~/.local/share/job-supervisor")
}

/// Tunables the spec calls "implementation-defined" and explicitly keeps off
/// the public per-call API (spec.md §5: "the reaper's poll interval is fixed
/// by the implementation"). Grouped here so an embedding host can override
/// them once at construction time without threading parameters through every
/// call.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTunables {
    /// How often the reaper polls the registry for exited children.
    pub reap_interval: Duration,
    /// How long `stop` waits for the polite signal to take effect before
    /// escalating to `SIGKILL`. Spec.md §4.2 requires this to be within
    /// `[2s, 10s]`.
    pub stop_grace_period: Duration,
    /// Interval between polls while waiting out the grace period.
    pub stop_poll_interval: Duration,
    /// Number of times the polite signal is (re-)sent before escalating,
    /// per spec.md §9's shell-wrapper signal-swallowing note.
    pub polite_signal_attempts: u32,
}

impl Default for SupervisorTunables {
    fn default() -> Self {
        SupervisorTunables {
            reap_interval: Duration::from_millis(1500),
            stop_grace_period: Duration::from_secs(5),
            stop_poll_interval: Duration::from_millis(100),
            polite_signal_attempts: 3,
        }
    }
}
