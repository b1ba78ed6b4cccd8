//! Sender/receiver state machines over a real multicast socket.
//!
//! Hosts without a multicast route cannot join a group; these tests print a
//! note and return early there.

use std::time::{Duration, Instant};

use lan_multicast_audio::{
    audio::{tone::encode_wav, PcmFormat, PcmSource},
    config::{NetworkConfig, ReceiverConfig, SenderConfig},
    network::MulticastTransport,
    session::{Operation, ReceiverSession, ReceiverState, SenderSession, SenderState, Transition},
};

fn network(port: u16) -> NetworkConfig {
    NetworkConfig {
        group: "239.255.77.81".to_string(),
        port,
        ..Default::default()
    }
}

/// Ten-byte blocks tagged with their index so the receiver can check order.
fn tagged_source(blocks: u8) -> PcmSource {
    let data: Vec<u8> = (0..blocks).flat_map(|b| [b; 10]).collect();
    PcmSource::parse(encode_wav(&PcmFormat::pcm16(1, 8000).unwrap(), &data)).unwrap()
}

#[test]
fn sender_state_machine() {
    let mut session = SenderSession::new(network(47_501), SenderConfig::default(), tagged_source(4));

    assert_eq!(
        session.start_sending().unwrap(),
        Transition::Rejected {
            from: SenderState::Initial,
            operation: Operation::StartSending
        }
    );
    assert_eq!(session.state(), SenderState::Initial);

    match session.join() {
        Ok(transition) => assert!(transition.is_applied()),
        Err(e) => {
            eprintln!("skipping: cannot join multicast group: {}", e);
            return;
        }
    }
    assert_eq!(session.state(), SenderState::Joined);
    assert!(session.join().unwrap().is_rejected());

    assert_eq!(session.start_sending().unwrap().state(), SenderState::Sending);
    assert!(session.leave().is_rejected());
    assert!(session.select_source(tagged_source(2)).is_rejected());

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(
        session.stop_sending(),
        Transition::Applied {
            from: SenderState::Sending,
            to: SenderState::Joined
        }
    );
    assert!(session.stats().datagrams_sent > 0);

    assert_eq!(session.leave().state(), SenderState::Initial);
    assert!(session.transport().is_none());
}

#[test]
fn sender_to_receiver_loopback() {
    let port = 47_502;
    let mut receiver = ReceiverSession::new(
        network(port),
        ReceiverConfig {
            capacity_exponent: 16,
            poll_interval_ms: 2,
            // Smaller than a datagram: the first one is truncated and the buffer grows.
            initial_scratch: 4,
            max_scratch: 64,
        },
    )
    .unwrap();
    let mut puller = receiver.take_puller().unwrap();

    if let Err(e) = receiver.join() {
        eprintln!("skipping: cannot join multicast group: {}", e);
        return;
    }
    assert_eq!(receiver.start_playing().state(), ReceiverState::JoinedPlaying);
    assert_eq!(
        receiver.start_receiving().unwrap().state(),
        ReceiverState::ReceivingPlaying
    );

    let mut sender = SenderSession::new(
        network(port),
        SenderConfig {
            chunk_size: 10,
            period_ms: 1,
        },
        tagged_source(200),
    );
    let _ = sender.join().unwrap();
    let _ = sender.start_sending().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while receiver.stats().datagrams_received < 20 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = sender.stop_sending();
    assert_eq!(receiver.stop_receiving().state(), ReceiverState::JoinedPlaying);

    let stats = receiver.stats();
    if stats.datagrams_received == 0 {
        eprintln!("skipping: multicast loopback delivered nothing");
        return;
    }
    assert!(stats.truncated >= 1);
    assert_eq!(stats.bytes_received, stats.datagrams_received * 10);

    let mut out = vec![0u8; stats.buffered];
    assert_eq!(puller.pull(&mut out), stats.buffered);

    // Whole ten-byte blocks, in send order.
    assert_eq!(out.len() % 10, 0);
    let tags: Vec<u8> = out.chunks(10).map(|block| block[0]).collect();
    assert!(out.chunks(10).all(|block| block.iter().all(|&b| b == block[0])));
    assert!(tags.windows(2).all(|w| w[1] == (w[0] + 1) % 200));

    assert_eq!(receiver.stop_playing().state(), ReceiverState::Joined);
    assert_eq!(receiver.leave().state(), ReceiverState::Initial);
}

#[test]
fn oversized_datagram_grows_scratch_and_is_delivered() {
    let port = 47_503;
    let mut receiver = ReceiverSession::new(
        network(port),
        ReceiverConfig {
            capacity_exponent: 8,
            poll_interval_ms: 2,
            initial_scratch: 4,
            max_scratch: 64,
        },
    )
    .unwrap();
    let mut puller = receiver.take_puller().unwrap();

    if let Err(e) = receiver.join() {
        eprintln!("skipping: cannot join multicast group: {}", e);
        return;
    }
    let _ = receiver.start_playing();

    let sender = MulticastTransport::join(&network(port)).unwrap();
    // Over the cap, then over the initial size but within the cap.
    sender.send(&[9u8; 100]).unwrap();
    sender.send(&[7u8; 10]).unwrap();

    let _ = receiver.start_receiving().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while receiver.stats().datagrams_received < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = receiver.stop_receiving();
    sender.leave();

    let stats = receiver.stats();
    if stats.datagrams_received == 0 {
        eprintln!("skipping: multicast loopback delivered nothing");
        return;
    }
    assert_eq!(stats.datagrams_received, 1);
    assert_eq!(stats.bytes_received, 10);
    assert!(stats.truncated >= 2);
    assert_eq!(stats.receive_failures, 0);

    let mut out = [0u8; 16];
    assert_eq!(puller.pull(&mut out), 10);
    assert_eq!(&out[..10], &[7u8; 10]);
}
