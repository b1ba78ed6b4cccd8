//! Sender and receiver session state machines
//!
//! Each session owns its transport while joined and at most one background
//! loop thread. Transition methods never fail for being called in the wrong
//! state; they return [`Transition::Rejected`] and leave the state untouched.
//! Only real failures (socket setup, thread spawn) are errors.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::SessionError;

#[cfg(feature = "receiver")]
pub mod receiver;
#[cfg(feature = "sender")]
pub mod sender;

#[cfg(feature = "receiver")]
pub use receiver::{PlaybackPuller, ReceiverSession, ReceiverState, ReceiverStats};
#[cfg(feature = "sender")]
pub use sender::{SenderSession, SenderState, SenderStats};

/// Session operations, used to report rejected transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Join,
    Leave,
    SelectSource,
    StartSending,
    StopSending,
    StartReceiving,
    StopReceiving,
    StartPlaying,
    StopPlaying,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Join => "join",
            Operation::Leave => "leave",
            Operation::SelectSource => "select_source",
            Operation::StartSending => "start_sending",
            Operation::StopSending => "stop_sending",
            Operation::StartReceiving => "start_receiving",
            Operation::StopReceiving => "stop_receiving",
            Operation::StartPlaying => "start_playing",
            Operation::StopPlaying => "stop_playing",
        };
        f.write_str(name)
    }
}

/// Outcome of a state transition request
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The operation ran; `to` may equal `from` for operations that do not move state.
    Applied { from: S, to: S },
    /// The operation is not permitted in `from`; nothing changed.
    Rejected { from: S, operation: Operation },
}

impl<S: Copy> Transition<S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Transition::Rejected { .. })
    }

    /// State after the request
    pub fn state(&self) -> S {
        match *self {
            Transition::Applied { to, .. } => to,
            Transition::Rejected { from, .. } => from,
        }
    }
}

pub(crate) fn rejected<S: Copy + fmt::Debug>(from: S, operation: Operation) -> Transition<S> {
    tracing::warn!("Ignoring {} in state {:?}", operation, from);
    Transition::Rejected { from, operation }
}

pub(crate) fn applied<S: Copy + fmt::Debug>(from: S, to: S, operation: Operation) -> Transition<S> {
    tracing::info!("{}: {:?} -> {:?}", operation, from, to);
    Transition::Applied { from, to }
}

/// Result of waiting on a loop's cancellation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Cancelled,
    TimedOut,
    /// The signalling side vanished without signalling
    Failed,
}

/// Loop-side end of a cancellation signal
pub(crate) struct CancelWait {
    rx: Receiver<()>,
}

impl CancelWait {
    pub(crate) fn wait_until(&self, deadline: Instant) -> Wait {
        match self.rx.recv_deadline(deadline) {
            Ok(()) => Wait::Cancelled,
            Err(RecvTimeoutError::Timeout) => Wait::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Wait::Failed,
        }
    }

    pub(crate) fn wait_for(&self, timeout: std::time::Duration) -> Wait {
        self.wait_until(Instant::now() + timeout)
    }
}

/// A running background loop whose thread hands back `R` when it exits
pub(crate) struct BackgroundLoop<R> {
    cancel: Sender<()>,
    handle: JoinHandle<R>,
}

impl<R: Send + 'static> BackgroundLoop<R> {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self, SessionError>
    where
        F: FnOnce(CancelWait) -> R + Send + 'static,
    {
        let (cancel, rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(CancelWait { rx }))
            .map_err(SessionError::Spawn)?;

        Ok(Self { cancel, handle })
    }

    /// Signal cancellation and block until the loop has exited.
    ///
    /// A panic inside the loop is re-raised on the calling thread.
    pub(crate) fn stop(self) -> R {
        // The loop may already have exited on its own; that is fine.
        let _ = self.cancel.try_send(());
        match self.handle.join() {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_background_loop_cancels() {
        let worker = BackgroundLoop::spawn("test-loop", |cancel| {
            let mut ticks = 0u32;
            while cancel.wait_for(Duration::from_millis(1)) == Wait::TimedOut {
                ticks += 1;
            }
            ticks
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(worker.stop() > 0);
    }

    #[test]
    fn test_transition_state() {
        let applied: Transition<u8> = Transition::Applied { from: 1, to: 2 };
        assert!(applied.is_applied());
        assert_eq!(applied.state(), 2);

        let rejected: Transition<u8> = Transition::Rejected {
            from: 1,
            operation: Operation::Leave,
        };
        assert!(rejected.is_rejected());
        assert_eq!(rejected.state(), 1);
        assert_eq!(Operation::StartReceiving.to_string(), "start_receiving");
    }
}
