//! Sender session
//!
//! `Initial -> Joined -> Sending -> Joined -> Initial`. While `Sending`, a
//! background thread slices the PCM source into fixed-size datagrams and
//! sends one per period, wrapping at the end of the data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::wav::PcmSource;
use crate::config::{NetworkConfig, SenderConfig};
use crate::error::SessionError;
use crate::network::MulticastTransport;
use crate::session::{applied, rejected, BackgroundLoop, CancelWait, Operation, Transition, Wait};

/// Periods the loop may fall behind before it stops trying to catch up
const MAX_CATCH_UP_PERIODS: u32 = 8;

/// Sender session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderState {
    Initial,
    Joined,
    Sending,
}

impl SenderState {
    /// Target state of `operation`, or `None` when not permitted here
    pub fn next(self, operation: Operation) -> Option<SenderState> {
        use SenderState::*;
        match (self, operation) {
            (Initial, Operation::Join) => Some(Joined),
            (Joined, Operation::Leave) => Some(Initial),
            (Joined, Operation::StartSending) => Some(Sending),
            (Sending, Operation::StopSending) => Some(Joined),
            (Initial | Joined, Operation::SelectSource) => Some(self),
            _ => None,
        }
    }
}

/// Sender loop statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct SenderCounters {
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Drives one PCM source onto one multicast group
pub struct SenderSession {
    state: SenderState,
    network: NetworkConfig,
    config: SenderConfig,
    source: PcmSource,
    transport: Option<Arc<MulticastTransport>>,
    worker: Option<BackgroundLoop<PcmSource>>,
    counters: Arc<SenderCounters>,
}

impl SenderSession {
    pub fn new(network: NetworkConfig, config: SenderConfig, source: PcmSource) -> Self {
        Self {
            state: SenderState::Initial,
            network,
            config,
            source,
            transport: None,
            worker: None,
            counters: Arc::new(SenderCounters::default()),
        }
    }

    /// Current state
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Transport, present while joined
    pub fn transport(&self) -> Option<&MulticastTransport> {
        self.transport.as_deref()
    }

    /// Source as of the last time the send loop was stopped
    pub fn source(&self) -> &PcmSource {
        &self.source
    }

    /// Effective send cadence for the current source
    pub fn period(&self) -> Duration {
        self.config.period_for(self.source.format())
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            datagrams_sent: self.counters.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }

    /// `Initial -> Joined`. A transport failure leaves the state unchanged.
    pub fn join(&mut self) -> Result<Transition<SenderState>, SessionError> {
        let Some(to) = self.state.next(Operation::Join) else {
            return Ok(rejected(self.state, Operation::Join));
        };

        let transport = MulticastTransport::join(&self.network)?;
        self.transport = Some(Arc::new(transport));
        Ok(self.commit(to, Operation::Join))
    }

    /// `Joined -> Initial`
    pub fn leave(&mut self) -> Transition<SenderState> {
        let Some(to) = self.state.next(Operation::Leave) else {
            return rejected(self.state, Operation::Leave);
        };

        if let Some(transport) = self.transport.take() {
            match Arc::try_unwrap(transport) {
                Ok(transport) => transport.leave(),
                Err(_) => tracing::warn!("Transport still shared on leave; closing when released"),
            }
        }
        self.commit(to, Operation::Leave)
    }

    /// Replace the PCM source. Not permitted while sending.
    pub fn select_source(&mut self, source: PcmSource) -> Transition<SenderState> {
        let Some(to) = self.state.next(Operation::SelectSource) else {
            return rejected(self.state, Operation::SelectSource);
        };

        tracing::info!(
            "Selected source: {} bytes, {} Hz, {} channel(s)",
            source.len(),
            source.format().sample_rate(),
            source.format().channels()
        );
        self.source = source;
        self.commit(to, Operation::SelectSource)
    }

    /// `Joined -> Sending`, spawning the send loop
    pub fn start_sending(&mut self) -> Result<Transition<SenderState>, SessionError> {
        let (Some(to), Some(transport)) =
            (self.state.next(Operation::StartSending), self.transport.clone())
        else {
            return Ok(rejected(self.state, Operation::StartSending));
        };

        let source = self.source.clone();
        let chunk_size = self.config.chunk_size;
        let period = self.period();
        let counters = self.counters.clone();

        let worker = BackgroundLoop::spawn("multicast-send", move |cancel| {
            run_send_loop(&transport, source, chunk_size, period, &cancel, &counters)
        })?;

        self.worker = Some(worker);
        Ok(self.commit(to, Operation::StartSending))
    }

    /// `Sending -> Joined`; blocks until the loop has observed cancellation
    pub fn stop_sending(&mut self) -> Transition<SenderState> {
        let Some(to) = self.state.next(Operation::StopSending) else {
            return rejected(self.state, Operation::StopSending);
        };

        if let Some(worker) = self.worker.take() {
            // Keep the cursor so a restart resumes where this run stopped.
            self.source = worker.stop();
        }
        self.commit(to, Operation::StopSending)
    }

    fn commit(&mut self, to: SenderState, operation: Operation) -> Transition<SenderState> {
        let from = std::mem::replace(&mut self.state, to);
        applied(from, to, operation)
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        if self.state == SenderState::Sending {
            let _ = self.stop_sending();
        }
        if self.state == SenderState::Joined {
            let _ = self.leave();
        }
    }
}

fn run_send_loop(
    transport: &MulticastTransport,
    mut source: PcmSource,
    chunk_size: usize,
    period: Duration,
    cancel: &CancelWait,
    counters: &SenderCounters,
) -> PcmSource {
    tracing::info!(
        "Send loop started: {} byte datagrams every {:?} to {}",
        chunk_size,
        period,
        transport.group()
    );

    let mut deadline = Instant::now();
    loop {
        let chunk = source.next_slice(chunk_size);
        if !chunk.is_empty() {
            match transport.send(&chunk) {
                Ok(sent) => {
                    counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Failed to send datagram: {}", e);
                }
            }
        }

        deadline += period;
        let now = Instant::now();
        if now > deadline + period * MAX_CATCH_UP_PERIODS {
            tracing::debug!("Send loop fell behind by {:?}; resetting cadence", now - deadline);
            deadline = now;
        }

        match cancel.wait_until(deadline) {
            Wait::TimedOut => continue,
            Wait::Cancelled => break,
            Wait::Failed => {
                tracing::error!("Send loop lost its cancellation signal; exiting");
                break;
            }
        }
    }

    tracing::info!("Send loop stopped");
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tone::sine_wav;

    fn session() -> SenderSession {
        let blob = sine_wav(440.0, 8000, 1, Duration::from_millis(50)).unwrap();
        SenderSession::new(
            NetworkConfig {
                group: "239.255.77.79".to_string(),
                port: 47_411,
                ..Default::default()
            },
            SenderConfig::default(),
            PcmSource::parse(blob).unwrap(),
        )
    }

    #[test]
    fn test_transition_table() {
        use SenderState::*;
        assert_eq!(Initial.next(Operation::Join), Some(Joined));
        assert_eq!(Initial.next(Operation::StartSending), None);
        assert_eq!(Joined.next(Operation::StartSending), Some(Sending));
        assert_eq!(Joined.next(Operation::Join), None);
        assert_eq!(Sending.next(Operation::Leave), None);
        assert_eq!(Sending.next(Operation::StopSending), Some(Joined));
        assert_eq!(Sending.next(Operation::SelectSource), None);
        assert_eq!(Joined.next(Operation::StartReceiving), None);
    }

    #[test]
    fn test_rejects_without_join() {
        let mut session = session();

        let result = session.start_sending().unwrap();
        assert_eq!(
            result,
            Transition::Rejected {
                from: SenderState::Initial,
                operation: Operation::StartSending
            }
        );
        assert_eq!(session.state(), SenderState::Initial);
        assert!(session.stop_sending().is_rejected());
        assert!(session.leave().is_rejected());
        assert!(session.transport().is_none());
    }

    #[test]
    fn test_select_source_keeps_state() {
        let mut session = session();
        let replacement = PcmSource::parse(sine_wav(880.0, 16000, 2, Duration::from_millis(10)).unwrap()).unwrap();

        let result = session.select_source(replacement);
        assert_eq!(
            result,
            Transition::Applied {
                from: SenderState::Initial,
                to: SenderState::Initial
            }
        );
        assert_eq!(session.source().format().sample_rate(), 16000);
        // 1024 bytes at 64000 B/s
        assert_eq!(session.period(), Duration::from_millis(16));
    }
}
