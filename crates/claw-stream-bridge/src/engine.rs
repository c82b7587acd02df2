//! Engine process model shared between the supervisor and the router.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Spawning a new incarnation.
    Starting,
    /// An incarnation is up and accepting input.
    Running,
    /// The last incarnation terminated (or failed to spawn).
    Exited,
    /// Waiting out the backoff delay before the next start.
    Restarting,
    /// Stop requested; no further restarts.
    ShuttingDown,
}

impl EngineState {
    /// Whether envelopes can currently be delivered.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Lowercase name used in logs and the health endpoint.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an incarnation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// The process exited with a status code.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// The process was terminated by a signal.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The executable could not be started.
    SpawnFailed {
        /// OS error text.
        error: String,
    },
    /// Waiting on the child failed.
    WaitFailed {
        /// OS error text.
        error: String,
    },
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }
        Self::WaitFailed {
            error: format!("unrecognised exit status: {status}"),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Self::SpawnFailed { error } => write!(f, "spawn failed: {error}"),
            Self::WaitFailed { error } => write!(f, "wait failed: {error}"),
        }
    }
}

/// Writable view of one running engine incarnation.
///
/// Cloning is cheap; every clone feeds the same single stdin writer.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pid: Option<u32>,
    incarnation: u64,
    started_at: DateTime<Utc>,
    input: mpsc::Sender<String>,
}

impl EngineHandle {
    /// Wrap the input queue of a freshly started incarnation.
    #[must_use]
    pub fn new(pid: Option<u32>, incarnation: u64, input: mpsc::Sender<String>) -> Self {
        Self {
            pid,
            incarnation,
            started_at: Utc::now(),
            input,
        }
    }

    /// OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sequence number of this incarnation (0 for the first start).
    #[must_use]
    pub const fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// When this incarnation was started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Queue one line for the stdin writer without waiting.
    pub fn try_send_line(&self, line: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.input.try_send(line)
    }

    /// Whether the stdin writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }
}

/// The swappable "current engine" slot.
///
/// Only the supervisor installs or clears it; the router only reads. A reader
/// sees either the previous handle or the next one, never a partial swap.
#[derive(Debug, Clone, Default)]
pub struct CurrentEngine {
    slot: Arc<RwLock<Option<EngineHandle>>>,
}

impl CurrentEngine {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current handle.
    #[must_use]
    pub fn get(&self) -> Option<EngineHandle> {
        self.slot.read().clone()
    }

    /// Replace the current handle, returning the superseded one.
    pub fn install(&self, handle: EngineHandle) -> Option<EngineHandle> {
        self.slot.write().replace(handle)
    }

    /// Empty the slot, returning the handle that was current.
    pub fn clear(&self) -> Option<EngineHandle> {
        self.slot.write().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_names() {
        assert_eq!(EngineState::Running.to_string(), "running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(
            serde_json::to_string(&EngineState::Restarting).unwrap(),
            "\"restarting\""
        );
        assert!(EngineState::Running.is_running());
        assert!(!EngineState::Restarting.is_running());
    }

    #[test]
    fn test_exit_reason_serialization() {
        let reason = ExitReason::Exited { code: 3 };
        let json = serde_json::to_value(&reason).unwrap();

        assert_eq!(json["kind"], "exited");
        assert_eq!(json["code"], 3);
        assert_eq!(reason.to_string(), "exited with code 3");

        let reason = ExitReason::SpawnFailed {
            error: "No such file or directory".into(),
        };
        assert_eq!(serde_json::to_value(&reason).unwrap()["kind"], "spawn_failed");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_reason_from_status() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            ExitReason::from(ExitStatus::from_raw(2 << 8)),
            ExitReason::Exited { code: 2 }
        );
        assert_eq!(
            ExitReason::from(ExitStatus::from_raw(9)),
            ExitReason::Signaled { signal: 9 }
        );
    }

    #[tokio::test]
    async fn test_current_engine_swap() {
        let current = CurrentEngine::new();
        assert!(current.get().is_none());

        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);

        assert!(current.install(EngineHandle::new(Some(10), 0, tx_a)).is_none());
        let old = current.install(EngineHandle::new(Some(11), 1, tx_b));
        assert_eq!(old.map(|h| h.incarnation()), Some(0));

        let handle = current.get().unwrap();
        assert_eq!(handle.pid(), Some(11));
        handle.try_send_line("hello".into()).unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), "hello");

        assert!(current.clear().is_some());
        assert!(current.get().is_none());
    }

    #[tokio::test]
    async fn test_handle_reports_closed_writer() {
        let (tx, rx) = mpsc::channel(1);
        let handle = EngineHandle::new(None, 0, tx);
        assert!(!handle.is_closed());

        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.try_send_line("x".into()).is_err());
    }
}
