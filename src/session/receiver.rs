//! Receiver session
//!
//! Group membership and the receive loop form one axis; playback is an
//! orthogonal flag folded into the state enum so transitions stay exhaustive:
//!
//! ```text
//!              join              start_receiving
//!   Initial ---------> Joined ------------------> Receiving
//!      |  ^   <-------   |  ^  <------------------   |  ^
//!      |  |    leave     |  |    stop_receiving      |  |
//!  start/stop_playing    start/stop_playing      start/stop_playing
//!      v  |              v  |                        v  |
//!   Playing ---------> JoinedPlaying -----------> ReceivingPlaying
//! ```
//!
//! The receive loop pushes every datagram into the jitter buffer. The audio
//! device pulls from the other end through a [`PlaybackPuller`].

use crossbeam_channel::bounded;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{Consumer, Producer, RingBuffer, RingMonitor};
use crate::config::{NetworkConfig, ReceiverConfig};
use crate::error::{RingError, SessionError, TransportError};
use crate::network::MulticastTransport;
use crate::session::{applied, rejected, BackgroundLoop, CancelWait, Operation, Transition, Wait};

/// Datagrams drained per wake-up before checking for cancellation again
const MAX_DATAGRAMS_PER_WAKE: usize = 256;

/// Receiver session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    Initial,
    Joined,
    Playing,
    JoinedPlaying,
    Receiving,
    ReceivingPlaying,
}

impl ReceiverState {
    /// Target state of `operation`, or `None` when not permitted here
    pub fn next(self, operation: Operation) -> Option<ReceiverState> {
        use ReceiverState::*;
        match (self, operation) {
            (Initial, Operation::Join) => Some(Joined),
            (Playing, Operation::Join) => Some(JoinedPlaying),

            (Joined, Operation::Leave) => Some(Initial),
            (JoinedPlaying, Operation::Leave) => Some(Playing),

            (Joined, Operation::StartReceiving) => Some(Receiving),
            (JoinedPlaying, Operation::StartReceiving) => Some(ReceivingPlaying),

            (Receiving, Operation::StopReceiving) => Some(Joined),
            (ReceivingPlaying, Operation::StopReceiving) => Some(JoinedPlaying),

            (Initial, Operation::StartPlaying) => Some(Playing),
            (Joined, Operation::StartPlaying) => Some(JoinedPlaying),
            (Receiving, Operation::StartPlaying) => Some(ReceivingPlaying),

            (Playing, Operation::StopPlaying) => Some(Initial),
            (JoinedPlaying, Operation::StopPlaying) => Some(Joined),
            (ReceivingPlaying, Operation::StopPlaying) => Some(Receiving),

            _ => None,
        }
    }

    pub fn is_playing(self) -> bool {
        matches!(
            self,
            ReceiverState::Playing | ReceiverState::JoinedPlaying | ReceiverState::ReceivingPlaying
        )
    }

    pub fn is_joined(self) -> bool {
        !matches!(self, ReceiverState::Initial | ReceiverState::Playing)
    }

    pub fn is_receiving(self) -> bool {
        matches!(self, ReceiverState::Receiving | ReceiverState::ReceivingPlaying)
    }
}

/// Receiver statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    /// Reads that found a datagram larger than the scratch buffer
    pub truncated: u64,
    pub receive_failures: u64,
    /// Pulls that had to be padded with silence
    pub underruns: u64,
    pub silence_bytes: u64,
    /// Bytes evicted from the jitter buffer by overwrite-oldest
    pub dropped_bytes: u64,
    /// Bytes currently buffered
    pub buffered: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct ReceiverCounters {
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    truncated: AtomicU64,
    receive_failures: AtomicU64,
    underruns: AtomicU64,
    silence_bytes: AtomicU64,
}

/// Consumer side of the jitter buffer, handed to the audio device callback
pub struct PlaybackPuller {
    consumer: Consumer<u8>,
    playing: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
}

impl PlaybackPuller {
    /// Fill `out` for playback without blocking.
    ///
    /// Copies what is buffered and zero-fills the rest. While the session is
    /// not playing, `out` is silenced and buffered data is left in place.
    /// Returns the number of real (non-silence) bytes.
    pub fn pull(&mut self, out: &mut [u8]) -> usize {
        if !self.playing.load(Ordering::Acquire) {
            out.fill(0);
            return 0;
        }

        let fetched = self.consumer.fetch(out);
        if fetched < out.len() {
            out[fetched..].fill(0);
            self.counters.underruns.fetch_add(1, Ordering::Relaxed);
            self.counters
                .silence_bytes
                .fetch_add((out.len() - fetched) as u64, Ordering::Relaxed);
        }
        fetched
    }

    /// Bytes waiting in the jitter buffer
    pub fn buffered(&self) -> usize {
        self.consumer.monitor().len()
    }
}

/// Growable receive buffer with a hard cap.
///
/// Holds one byte past its limit, since the transport reports a datagram
/// that fills the whole buffer as truncated.
struct ScratchBuffer {
    buf: Vec<u8>,
    max: usize,
}

impl ScratchBuffer {
    fn new(initial: usize, max: usize) -> Self {
        Self {
            buf: vec![0u8; initial.min(max) + 1],
            max,
        }
    }

    /// Largest datagram that fits
    fn limit(&self) -> usize {
        self.buf.len() - 1
    }

    /// Double the limit up to the cap; false when already at the cap
    fn grow(&mut self) -> bool {
        let limit = self.limit();
        let target = (limit * 2).max(1).min(self.max);
        if target <= limit {
            return false;
        }
        self.buf.resize(target + 1, 0);
        true
    }
}

/// Receives one multicast group into a jitter buffer
pub struct ReceiverSession {
    state: ReceiverState,
    network: NetworkConfig,
    config: ReceiverConfig,
    transport: Option<Arc<MulticastTransport>>,
    /// Absent while the receive loop owns it
    producer: Option<Producer<u8>>,
    puller: Option<PlaybackPuller>,
    monitor: RingMonitor<u8>,
    playing: Arc<AtomicBool>,
    worker: Option<BackgroundLoop<Option<Producer<u8>>>>,
    counters: Arc<ReceiverCounters>,
}

impl ReceiverSession {
    /// Create a session with a `2^capacity_exponent` byte jitter buffer
    pub fn new(network: NetworkConfig, config: ReceiverConfig) -> Result<Self, RingError> {
        let (producer, consumer) = RingBuffer::<u8>::create(config.capacity_exponent)?.split();
        let monitor = producer.monitor();
        let playing = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(ReceiverCounters::default());

        let puller = PlaybackPuller {
            consumer,
            playing: playing.clone(),
            counters: counters.clone(),
        };

        Ok(Self {
            state: ReceiverState::Initial,
            network,
            config,
            transport: None,
            producer: Some(producer),
            puller: Some(puller),
            monitor,
            playing,
            worker: None,
            counters,
        })
    }

    /// Current state
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Transport, present while joined
    pub fn transport(&self) -> Option<&MulticastTransport> {
        self.transport.as_deref()
    }

    /// Hand the playback end of the jitter buffer to the audio device. Succeeds once.
    pub fn take_puller(&mut self) -> Option<PlaybackPuller> {
        self.puller.take()
    }

    /// Jitter buffer occupancy, for progress display
    pub fn buffer(&self) -> &RingMonitor<u8> {
        &self.monitor
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            datagrams_received: self.counters.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            truncated: self.counters.truncated.load(Ordering::Relaxed),
            receive_failures: self.counters.receive_failures.load(Ordering::Relaxed),
            underruns: self.counters.underruns.load(Ordering::Relaxed),
            silence_bytes: self.counters.silence_bytes.load(Ordering::Relaxed),
            dropped_bytes: self.monitor.dropped(),
            buffered: self.monitor.len(),
            capacity: self.monitor.capacity(),
        }
    }

    /// `Initial -> Joined` or `Playing -> JoinedPlaying`
    pub fn join(&mut self) -> Result<Transition<ReceiverState>, SessionError> {
        let Some(to) = self.state.next(Operation::Join) else {
            return Ok(rejected(self.state, Operation::Join));
        };

        let transport = MulticastTransport::join(&self.network)?;
        self.transport = Some(Arc::new(transport));
        Ok(self.commit(to, Operation::Join))
    }

    /// `Joined -> Initial` or `JoinedPlaying -> Playing`
    pub fn leave(&mut self) -> Transition<ReceiverState> {
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

    /// Spawn the receive loop
    pub fn start_receiving(&mut self) -> Result<Transition<ReceiverState>, SessionError> {
        let (Some(to), Some(transport)) =
            (self.state.next(Operation::StartReceiving), self.transport.clone())
        else {
            return Ok(rejected(self.state, Operation::StartReceiving));
        };
        let Some(producer) = self.producer.take() else {
            return Ok(rejected(self.state, Operation::StartReceiving));
        };

        let config = self.config.clone();
        let counters = self.counters.clone();

        // The producer only moves to the loop once the thread exists, so a
        // failed spawn leaves the session able to retry.
        let (handoff, handoff_rx) = bounded::<Producer<u8>>(1);
        let spawned = BackgroundLoop::spawn("multicast-receive", move |cancel| {
            let producer = handoff_rx.recv().ok()?;
            Some(run_receive_loop(&transport, producer, &config, &cancel, &counters))
        });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.producer = Some(producer);
                return Err(e);
            }
        };

        if let Err(returned) = handoff.send(producer) {
            self.producer = Some(returned.into_inner());
            let _ = worker.stop();
            return Err(SessionError::Spawn(io::Error::new(
                io::ErrorKind::Other,
                "receive loop exited before start",
            )));
        }

        self.worker = Some(worker);
        Ok(self.commit(to, Operation::StartReceiving))
    }

    /// Stop the receive loop; blocks until it has observed cancellation
    pub fn stop_receiving(&mut self) -> Transition<ReceiverState> {
        let Some(to) = self.state.next(Operation::StopReceiving) else {
            return rejected(self.state, Operation::StopReceiving);
        };

        if let Some(producer) = self.worker.take().and_then(BackgroundLoop::stop) {
            self.producer = Some(producer);
        }
        self.commit(to, Operation::StopReceiving)
    }

    /// Let the puller hand out buffered audio
    pub fn start_playing(&mut self) -> Transition<ReceiverState> {
        let Some(to) = self.state.next(Operation::StartPlaying) else {
            return rejected(self.state, Operation::StartPlaying);
        };
        self.playing.store(true, Ordering::Release);
        self.commit(to, Operation::StartPlaying)
    }

    /// Make the puller output silence
    pub fn stop_playing(&mut self) -> Transition<ReceiverState> {
        let Some(to) = self.state.next(Operation::StopPlaying) else {
            return rejected(self.state, Operation::StopPlaying);
        };
        self.playing.store(false, Ordering::Release);
        self.commit(to, Operation::StopPlaying)
    }

    fn commit(&mut self, to: ReceiverState, operation: Operation) -> Transition<ReceiverState> {
        let from = std::mem::replace(&mut self.state, to);
        applied(from, to, operation)
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        if self.state.is_receiving() {
            let _ = self.stop_receiving();
        }
        if self.state.is_joined() {
            let _ = self.leave();
        }
        self.playing.store(false, Ordering::Release);
    }
}

fn run_receive_loop(
    transport: &MulticastTransport,
    mut producer: Producer<u8>,
    config: &ReceiverConfig,
    cancel: &CancelWait,
    counters: &ReceiverCounters,
) -> Producer<u8> {
    let poll_interval = config.poll_interval();
    let mut scratch = ScratchBuffer::new(config.initial_scratch, config.max_scratch);

    tracing::info!(
        "Receive loop started on {} ({} byte scratch, {:?} poll)",
        transport.group(),
        scratch.limit(),
        poll_interval
    );

    loop {
        match cancel.wait_for(poll_interval) {
            Wait::TimedOut => drain_socket(transport, &mut scratch, &mut producer, counters),
            Wait::Cancelled => break,
            Wait::Failed => {
                tracing::error!("Receive loop lost its cancellation signal; exiting");
                break;
            }
        }
    }

    drop(scratch);
    tracing::info!("Receive loop stopped");
    producer
}

/// Move every waiting datagram into the jitter buffer
fn drain_socket(
    transport: &MulticastTransport,
    scratch: &mut ScratchBuffer,
    producer: &mut Producer<u8>,
    counters: &ReceiverCounters,
) {
    for _ in 0..MAX_DATAGRAMS_PER_WAKE {
        match transport.poll_readable(Some(Duration::ZERO)) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                counters.receive_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to poll socket: {}", e);
                return;
            }
        }

        match transport.receive(&mut scratch.buf) {
            Ok(len) => {
                producer.push(&scratch.buf[..len]);
                counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
                counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(TransportError::Truncated { .. }) => {
                counters.truncated.fetch_add(1, Ordering::Relaxed);
                let limit = scratch.limit();
                if scratch.grow() {
                    // Still queued; the next pass reads it into the larger buffer.
                    tracing::debug!(
                        "Datagram exceeded {} bytes; scratch buffer grown to {}",
                        limit,
                        scratch.limit()
                    );
                } else if let Err(e) = transport.discard() {
                    counters.receive_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Failed to drop oversized datagram: {}", e);
                    return;
                } else {
                    tracing::warn!("Dropped datagram larger than the {} byte cap", limit);
                }
            }
            Err(e) => {
                counters.receive_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to receive datagram: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ReceiverSession {
        ReceiverSession::new(
            NetworkConfig {
                group: "239.255.77.80".to_string(),
                port: 47_421,
                ..Default::default()
            },
            ReceiverConfig {
                capacity_exponent: 4,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_transition_table_is_closed() {
        use ReceiverState::*;
        let states = [Initial, Joined, Playing, JoinedPlaying, Receiving, ReceivingPlaying];
        let operations = [
            Operation::Join,
            Operation::Leave,
            Operation::StartReceiving,
            Operation::StopReceiving,
            Operation::StartPlaying,
            Operation::StopPlaying,
        ];

        for state in states {
            for operation in operations {
                if let Some(next) = state.next(operation) {
                    // Every transition touches exactly one axis.
                    let playing_changed = next.is_playing() != state.is_playing();
                    let joined_changed = next.is_joined() != state.is_joined();
                    let receiving_changed = next.is_receiving() != state.is_receiving();
                    match operation {
                        Operation::StartPlaying | Operation::StopPlaying => {
                            assert!(playing_changed && !joined_changed && !receiving_changed)
                        }
                        Operation::Join | Operation::Leave => {
                            assert!(joined_changed && !playing_changed && !receiving_changed)
                        }
                        _ => assert!(receiving_changed && !playing_changed && !joined_changed),
                    }
                }
            }
        }

        assert_eq!(Joined.next(Operation::StartReceiving), Some(Receiving));
        assert_eq!(JoinedPlaying.next(Operation::StartReceiving), Some(ReceivingPlaying));
        assert_eq!(Initial.next(Operation::StartReceiving), None);
        assert_eq!(Playing.next(Operation::StartReceiving), None);
        assert_eq!(Receiving.next(Operation::Leave), None);
        assert_eq!(ReceivingPlaying.next(Operation::Join), None);
    }

    #[test]
    fn test_playing_axis_without_network() {
        let mut session = session();

        assert!(session.start_receiving().unwrap().is_rejected());
        assert_eq!(
            session.start_playing(),
            Transition::Applied {
                from: ReceiverState::Initial,
                to: ReceiverState::Playing
            }
        );
        assert!(session.start_playing().is_rejected());
        assert!(session.stop_receiving().is_rejected());
        assert_eq!(session.stop_playing().state(), ReceiverState::Initial);
    }

    #[test]
    fn test_puller_zero_fills_and_respects_playing() {
        let mut session = session();
        let mut puller = session.take_puller().unwrap();
        assert!(session.take_puller().is_none());

        session.producer.as_mut().unwrap().push(&[1, 2, 3]);

        let mut out = [0xFFu8; 5];
        assert_eq!(puller.pull(&mut out), 0);
        assert_eq!(out, [0; 5]);
        assert_eq!(puller.buffered(), 3);

        let _ = session.start_playing();
        let mut out = [0xFFu8; 5];
        assert_eq!(puller.pull(&mut out), 3);
        assert_eq!(out, [1, 2, 3, 0, 0]);

        let stats = session.stats();
        assert_eq!(stats.underruns, 1);
        assert_eq!(stats.silence_bytes, 2);
        assert_eq!(stats.capacity, 16);
        assert_eq!(stats.buffered, 0);
    }

    #[test]
    fn test_scratch_growth_is_capped() {
        let mut scratch = ScratchBuffer::new(1000, 3000);
        assert_eq!(scratch.limit(), 1000);
        assert_eq!(scratch.buf.len(), 1001);
        assert!(scratch.grow());
        assert_eq!(scratch.limit(), 2000);
        assert!(scratch.grow());
        assert_eq!(scratch.limit(), 3000);
        assert!(!scratch.grow());
        assert_eq!(scratch.buf.len(), 3001);

        let capped = ScratchBuffer::new(5000, 64);
        assert_eq!(capped.limit(), 64);
    }

    #[test]
    fn test_invalid_capacity() {
        let result = ReceiverSession::new(
            NetworkConfig::default(),
            ReceiverConfig {
                capacity_exponent: 1,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(RingError::InvalidCapacity { exponent: 1 })));
    }
}
