use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Default delay between the interrupt and the forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(1500);

/// Which signal to deliver to the running encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// Ask the encoder to finish up (SIGINT where available)
    Interrupt,
    /// Kill it outright
    Kill,
}

#[derive(Default)]
struct Shared {
    requested: bool,
    active: Option<ActiveProcess>,
    generation: u64,
}

struct ActiveProcess {
    pid: Option<u32>,
    generation: u64,
    kill: Arc<Notify>,
}

impl ActiveProcess {
    fn deliver(&self, signal: TerminationSignal) {
        match signal {
            TerminationSignal::Kill => self.kill.notify_one(),
            TerminationSignal::Interrupt => self.interrupt(),
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::{sys::signal, unistd::Pid};

        let Some(pid) = self.pid else {
            self.kill.notify_one();
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            self.kill.notify_one();
            return;
        };
        if let Err(err) = signal::kill(Pid::from_raw(raw), signal::Signal::SIGINT) {
            warn!("could not interrupt encoder {}: {}, killing instead", pid, err);
            self.kill.notify_one();
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        // no cooperative interrupt for console-less children
        self.kill.notify_one();
    }
}

/// Handed to the supervisor when it registers a process.
pub(crate) struct ProcessTicket {
    pub generation: u64,
    /// Notified when the process must be killed
    pub kill: Arc<Notify>,
}

/// Monotonic stop signal for one batch run, sharing its lock with the slot holding the
/// running encoder so that a stop request can reach the process from any thread.
#[derive(Clone)]
pub struct CancellationController {
    shared: Arc<Mutex<Shared>>,
    grace: Duration,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl CancellationController {
    pub fn new(grace: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_requested(&self) -> bool {
        self.lock().requested
    }

    /// Flip the signal and start terminating the active encoder, if any.
    /// Never blocks. Returns false when a stop had already been requested.
    pub fn request(&self) -> bool {
        let first = {
            let mut shared = self.lock();
            !std::mem::replace(&mut shared.requested, true)
        };
        if first {
            info!("cancellation requested");
            self.terminate(self.grace);
        }
        first
    }

    pub(crate) fn set(&self, pid: Option<u32>) -> ProcessTicket {
        let mut shared = self.lock();
        shared.generation += 1;
        let kill = Arc::new(Notify::new());
        shared.active = Some(ActiveProcess {
            pid,
            generation: shared.generation,
            kill: Arc::clone(&kill),
        });
        ProcessTicket {
            generation: shared.generation,
            kill,
        }
    }

    pub(crate) fn clear(&self, generation: u64) {
        let mut shared = self.lock();
        if shared
            .active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
        {
            shared.active = None;
        }
    }

    /// Deliver `signal` to the active process. Returns its generation, or `None` when no
    /// process is running.
    pub fn signal_if_present(&self, signal: TerminationSignal) -> Option<u64> {
        let shared = self.lock();
        let active = shared.active.as_ref()?;
        active.deliver(signal);
        Some(active.generation)
    }

    /// Interrupt the active process and kill it if it is still registered after
    /// `escalate_after`. No-op when nothing is running.
    pub fn terminate(&self, escalate_after: Duration) -> bool {
        let Some(generation) = self.signal_if_present(TerminationSignal::Interrupt) else {
            debug!("no encoder running, nothing to terminate");
            return false;
        };

        let controller = self.clone();
        let escalate = move || controller.kill_if_still_running(generation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(escalate_after).await;
                    escalate();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(escalate_after);
                    escalate();
                });
            }
        }
        true
    }

    fn kill_if_still_running(&self, generation: u64) {
        let shared = self.lock();
        if let Some(active) = shared
            .active
            .as_ref()
            .filter(|a| a.generation == generation)
        {
            warn!(
                "encoder did not exit within {:?} of the interrupt, killing it",
                self.grace
            );
            active.deliver(TerminationSignal::Kill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_monotonic() {
        let cancel = CancellationController::default();
        assert!(!cancel.is_requested());
        assert!(cancel.request());
        assert!(!cancel.request());
        assert!(cancel.is_requested());
        assert!(cancel.clone().is_requested());
    }

    #[test]
    fn terminate_without_process_is_a_noop() {
        let cancel = CancellationController::default();
        assert!(!cancel.terminate(Duration::from_millis(1)));
        assert_eq!(cancel.signal_if_present(TerminationSignal::Kill), None);
    }

    #[tokio::test]
    async fn escalates_to_kill_when_process_stays() {
        let cancel = CancellationController::new(Duration::from_millis(20));
        // no pid: the interrupt falls straight through to the kill notification
        let ticket = cancel.set(None);
        assert!(cancel.terminate(Duration::from_millis(20)));
        tokio::time::timeout(Duration::from_secs(1), ticket.kill.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleared_process_is_not_killed() {
        let cancel = CancellationController::new(Duration::from_millis(10));
        let first = cancel.set(None);
        cancel.clear(first.generation);
        let second = cancel.set(None);
        // a stale generation does not clear the new registration
        cancel.clear(first.generation);
        assert_eq!(
            cancel.signal_if_present(TerminationSignal::Kill),
            Some(second.generation)
        );
        cancel.clear(second.generation);
        assert_eq!(cancel.signal_if_present(TerminationSignal::Kill), None);
    }
}
