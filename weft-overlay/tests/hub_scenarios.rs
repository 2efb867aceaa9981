//! End-to-end hub scenarios driven through the event interface.
//!
//! Connections are flume pairs standing in for sockets, so every test is
//! fully deterministic: feed frames in with `Received`, read the hub's
//! output off the command channel.

use bytes::Bytes;
use flume::Receiver;
use weft_core::node::{CONTROLLER, MAX_ID};
use weft_core::serializer;
use weft_core::wire::{qualifier, Command, Header, ACCEPTED, HEADER_SIZE, REJECTED, REQUEST};
use weft_overlay::auth::StaticCredentials;
use weft_overlay::events::{ConnCmd, FileEvent, HubEvent, WatchSlot};
use weft_overlay::hub::{HubOptions, OverlayHub};
use weft_overlay::identity::Identity;
use weft_overlay::protocol::{build_frame, parse_frame, request_header};
use weft_overlay::srp::SrpUser;

struct TestLink {
    id: u64,
    rx: Receiver<ConnCmd>,
}

impl TestLink {
    /// Next frame the hub pushed to this connection, if any.
    fn recv(&self) -> Option<(Header, Vec<u8>)> {
        loop {
            match self.rx.try_recv() {
                Ok(ConnCmd::Send(data)) => {
                    return parse_frame(&data).map(|(h, p)| (h, p.to_vec()))
                }
                Ok(ConnCmd::Close) => continue,
                Err(_) => return None,
            }
        }
    }

    fn is_closed(&self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(ConnCmd::Close) => return true,
                Ok(ConnCmd::Send(_)) => continue,
                Err(flume::TryRecvError::Disconnected) => return true,
                Err(flume::TryRecvError::Empty) => return false,
            }
        }
    }
}

fn standalone_hub(uid: u64) -> OverlayHub {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    OverlayHub::new(
        HubOptions::new(uid),
        Identity::default(),
        Box::new(StaticCredentials::new()),
    )
    .unwrap()
}

fn attach(hub: &mut OverlayHub) -> TestLink {
    let id = hub.ids().next();
    let (tx, rx) = flume::unbounded();
    assert!(hub.handle_event(HubEvent::Accepted { id, tx }));
    TestLink { id, rx }
}

fn feed(hub: &mut OverlayHub, link_id: u64, frame: Bytes) {
    assert!(hub.handle_event(HubEvent::Received {
        id: link_id,
        data: frame,
    }));
}

/// Issue a `basic/register` for `identity` and return the reply header.
fn register(hub: &mut OverlayHub, link: &TestLink, identity: u64) -> Header {
    let frame = build_frame(
        request_header(identity, 0, 1, 0, Command::Basic, qualifier::REGISTER),
        &[],
    );
    feed(hub, link.id, frame);
    link.recv().expect("registration reply").0
}

#[test]
fn single_hub_registration_lifecycle() {
    let mut hub = standalone_hub(100);
    let client = attach(&mut hub);
    assert_eq!(hub.connection_count(), 1);

    let identity = MAX_ID + 7;
    let reply = register(&mut hub, &client, identity);
    assert_eq!(reply.status, ACCEPTED);
    assert_eq!(reply.command, Command::Basic as u8);
    assert_eq!(reply.qualifier, qualifier::REGISTER);
    assert!(hub.is_registered(identity));
    assert_eq!(hub.connection_count(), 1);

    // Re-registering the same identity is an accepted no-op.
    let reply = register(&mut hub, &client, identity);
    assert_eq!(reply.status, ACCEPTED);
    assert!(hub.is_registered(identity));

    // Frames are accounted and the pool fully recycled after each exchange.
    assert_eq!(hub.metrics().received_messages, 2);
    assert_eq!(hub.allocated_messages(), 0);
}

#[test]
fn registration_refused_when_enrollment_disabled() {
    let mut options = HubOptions::new(100);
    options.enroll = false;
    let mut hub = OverlayHub::new(
        options,
        Identity::default(),
        Box::new(StaticCredentials::new()),
    )
    .unwrap();

    let client = attach(&mut hub);
    let reply = register(&mut hub, &client, MAX_ID + 7);
    assert_eq!(reply.status, REJECTED);
    assert!(!hub.is_registered(MAX_ID + 7));
    // The connection is deactivated as well.
    assert_eq!(hub.connection_count(), 0);
}

#[test]
fn srp_identify_authenticate_register() {
    let mut credentials = StaticCredentials::new();
    let identity = MAX_ID + 7;
    credentials.add_user(identity, b"pw", 1, 9);

    let mut options = HubOptions::new(100);
    options.authenticate = true;
    // With key material loaded, unauthenticated registrations cannot fall
    // back to the open path.
    let mut hub =
        OverlayHub::new(options, Identity::ephemeral().unwrap(), Box::new(credentials)).unwrap();
    let client = attach(&mut hub);

    let mut user = SrpUser::new(identity, b"pw", 1);

    // identify: request carries A, reply carries salt ∥ B.
    let frame = build_frame(
        request_header(identity, 0, 1, 0, Command::Null, qualifier::IDENTIFY),
        &user.user_nonce(),
    );
    feed(&mut hub, client.id, frame);
    let (header, payload) = client.recv().expect("identify reply");
    assert_eq!(header.status, ACCEPTED);
    let salt_len = payload.len() - weft_overlay::srp::NONCE_SIZE;
    let (salt, host_nonce) = payload.split_at(salt_len);
    assert!(user.process_challenge(salt, host_nonce));

    // authenticate: request carries M, reply carries H(A, M, K).
    let frame = build_frame(
        request_header(identity, 0, 2, 0, Command::Null, qualifier::AUTHENTICATE),
        user.user_proof(),
    );
    feed(&mut hub, client.id, frame);
    let (header, payload) = client.recv().expect("authenticate reply");
    assert_eq!(header.status, ACCEPTED);
    assert!(user.verify_host_proof(&payload));

    // register: accepted, and the proven group sticks to the connection.
    let reply = register(&mut hub, &client, identity);
    assert_eq!(reply.status, ACCEPTED);
    assert!(hub.is_registered(identity));

    // Without the handshake a second connection cannot take an identity.
    let intruder = attach(&mut hub);
    let frame = build_frame(
        request_header(MAX_ID + 8, 0, 1, 0, Command::Basic, qualifier::REGISTER),
        &[],
    );
    feed(&mut hub, intruder.id, frame);
    let (header, _) = intruder.recv().expect("reply");
    assert_eq!(header.status, REJECTED);
}

#[test]
fn wrong_password_burns_the_attempt() {
    let mut credentials = StaticCredentials::new();
    let identity = MAX_ID + 7;
    credentials.add_user(identity, b"pw", 1, 0);

    let mut options = HubOptions::new(100);
    options.authenticate = true;
    let mut hub =
        OverlayHub::new(options, Identity::default(), Box::new(credentials)).unwrap();
    let client = attach(&mut hub);

    let mut user = SrpUser::new(identity, b"wrong", 1);
    let frame = build_frame(
        request_header(identity, 0, 1, 0, Command::Null, qualifier::IDENTIFY),
        &user.user_nonce(),
    );
    feed(&mut hub, client.id, frame);
    let (_, payload) = client.recv().expect("identify reply");
    let salt_len = payload.len() - weft_overlay::srp::NONCE_SIZE;
    let (salt, host_nonce) = payload.split_at(salt_len);
    assert!(user.process_challenge(salt, host_nonce));

    let frame = build_frame(
        request_header(identity, 0, 2, 0, Command::Null, qualifier::AUTHENTICATE),
        user.user_proof(),
    );
    feed(&mut hub, client.id, frame);
    let (header, _) = client.recv().expect("authenticate reply");
    assert_eq!(header.status, REJECTED);
    assert_eq!(header.command, Command::Null as u8);

    // A second identify on the same connection is refused outright.
    let frame = build_frame(
        request_header(identity, 0, 3, 0, Command::Null, qualifier::AUTHENTICATE),
        user.user_proof(),
    );
    feed(&mut hub, client.id, frame);
    let (header, _) = client.recv().expect("reply");
    assert_eq!(header.status, REJECTED);
}

#[test]
fn pubsub_fanout_reaches_only_other_subscribers() {
    let mut hub = standalone_hub(100);

    let a = attach(&mut hub);
    let b = attach(&mut hub);
    let id_a = MAX_ID + 10;
    let id_b = MAX_ID + 11;
    assert_eq!(register(&mut hub, &a, id_a).status, ACCEPTED);
    assert_eq!(register(&mut hub, &b, id_b).status, ACCEPTED);

    // A subscribes to topic 42.
    let frame = build_frame(
        request_header(id_a, 0, 2, 42, Command::Multicast, qualifier::SUBSCRIBE),
        &[],
    );
    feed(&mut hub, a.id, frame);
    assert_eq!(a.recv().expect("subscribe ack").0.status, ACCEPTED);

    // B publishes "hello" on topic 42 with sequence 7.
    let frame = build_frame(
        request_header(id_b, 0, 7, 42, Command::Multicast, qualifier::PUBLISH),
        b"hello",
    );
    feed(&mut hub, b.id, frame);

    // A receives exactly one copy, correctly annotated.
    let (header, payload) = a.recv().expect("published frame");
    assert_eq!(payload, b"hello");
    assert_eq!(header.command, Command::Multicast as u8);
    assert_eq!(header.qualifier, qualifier::PUBLISH);
    assert_eq!(header.session, 42);
    assert_eq!(header.sequence, 7);
    assert_eq!(header.source, id_b);
    assert_eq!(header.destination, 0);
    assert!(a.recv().is_none());

    // The publisher hears nothing back.
    assert!(b.recv().is_none());

    // All refcounted copies were released.
    assert_eq!(hub.allocated_messages(), 0);
}

#[test]
fn subscribe_is_idempotent_and_unsubscribe_restores_baseline() {
    let mut hub = standalone_hub(100);
    let a = attach(&mut hub);
    let b = attach(&mut hub);
    let id_a = MAX_ID + 10;
    let id_b = MAX_ID + 11;
    register(&mut hub, &a, id_a);
    register(&mut hub, &b, id_b);

    for sequence in [2, 3] {
        let frame = build_frame(
            request_header(id_a, 0, sequence, 42, Command::Multicast, qualifier::SUBSCRIBE),
            &[],
        );
        feed(&mut hub, a.id, frame);
        assert_eq!(a.recv().expect("ack").0.status, ACCEPTED);
    }

    let frame = build_frame(
        request_header(id_a, 0, 4, 42, Command::Multicast, qualifier::UNSUBSCRIBE),
        &[],
    );
    feed(&mut hub, a.id, frame);
    assert_eq!(a.recv().expect("ack").0.status, ACCEPTED);

    // Post-unsubscribe publishes no longer reach A.
    let frame = build_frame(
        request_header(id_b, 0, 5, 42, Command::Multicast, qualifier::PUBLISH),
        b"silence",
    );
    feed(&mut hub, b.id, frame);
    assert!(a.recv().is_none());
}

#[test]
fn netmask_partitions_client_traffic() {
    // Netmask 0 allows everything; ~0 requires exact identity match, which
    // two distinct clients can never satisfy.
    for (netmask, delivered) in [(0u64, true), (u64::MAX, false)] {
        let mut options = HubOptions::new(100);
        options.netmask = netmask;
        let mut hub = OverlayHub::new(
            options,
            Identity::default(),
            Box::new(StaticCredentials::new()),
        )
        .unwrap();

        let a = attach(&mut hub);
        let b = attach(&mut hub);
        let id_a = MAX_ID + 10;
        let id_b = MAX_ID + 11;
        register(&mut hub, &a, id_a);
        register(&mut hub, &b, id_b);

        let frame = build_frame(
            request_header(id_a, id_b, 9, 0, Command::Null, qualifier::NULL),
            b"ping",
        );
        // Client-origin frames carry the connection's identity regardless of
        // what the header claims, so send with the registered id.
        feed(&mut hub, id_a, frame);

        if delivered {
            let (header, payload) = b.recv().expect("delivered");
            assert_eq!(header.source, id_a);
            assert_eq!(payload, b"ping");
        } else {
            // Permission denial is silent on both sides.
            assert!(b.recv().is_none());
            assert!(a.recv().is_none());
        }
    }
}

#[test]
fn purge_makes_room_under_connection_pressure() {
    let mut options = HubOptions::new(100);
    options.connection_pool = 4;
    let mut hub = OverlayHub::new(
        options,
        Identity::default(),
        Box::new(StaticCredentials::new()),
    )
    .unwrap();

    // Fill the pool with ephemeral connections that never authenticate. The
    // first one is measurably the oldest so the sweep order is well defined.
    let oldest = attach(&mut hub);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let stale: Vec<TestLink> = (0..3).map(|_| attach(&mut hub)).collect();
    assert_eq!(hub.connection_count(), 4);

    // One more accept: the purge sweep closes the oldest ephemeral
    // connection and the new accept succeeds.
    let fresh = attach(&mut hub);
    assert_eq!(hub.connection_count(), 4);
    assert!(oldest.is_closed());
    assert!(!stale[0].is_closed());
    assert!(!fresh.is_closed());
    assert_eq!(register(&mut hub, &fresh, MAX_ID + 30).status, ACCEPTED);
}

#[test]
fn describe_reports_pool_occupancy() {
    let mut hub = standalone_hub(100);

    // An internal peer may ask; clients may not.
    let peer = attach(&mut hub);
    assert_eq!(register(&mut hub, &peer, 5).status, ACCEPTED);

    let frame = build_frame(
        request_header(5, 100, 3, 0, Command::Null, qualifier::DESCRIBE),
        &[],
    );
    feed(&mut hub, 5, frame);
    let (header, payload) = peer.recv().expect("describe reply");
    assert_eq!(header.status, ACCEPTED);

    assert_eq!(serializer::get_u64(&payload, 0), Some(100)); // uid
    assert_eq!(serializer::get_u16(&payload, 8), Some(1024)); // mtu
    assert_eq!(serializer::get_u32(&payload, 14), Some(1)); // connections
    assert_eq!(serializer::get_u32(&payload, 22), Some(1)); // in-flight frames
    // Predecessor and successor of a lone node are itself.
    assert_eq!(serializer::get_u64(&payload, 66), Some(100));
    assert_eq!(serializer::get_u64(&payload, 74), Some(100));
}

#[test]
fn malformed_frames_close_the_connection_at_threshold() {
    let mut hub = standalone_hub(100);
    let client = attach(&mut hub);

    // length = 31 is below the header size and poisons the stream.
    let mut bad = vec![0u8; HEADER_SIZE];
    let mut header = request_header(1, 2, 3, 0, Command::Null, qualifier::NULL);
    header.length = 31;
    header.serialize(&mut bad);

    for _ in 0..weft_core::config::DROP_THRESHOLD {
        feed(&mut hub, client.id, Bytes::copy_from_slice(&bad));
    }
    assert!(client.is_closed());
    assert_eq!(hub.connection_count(), 0);
}

#[test]
fn unknown_destination_bounces_a_rejected_null() {
    let mut hub = standalone_hub(100);
    let client = attach(&mut hub);
    let id = MAX_ID + 10;
    register(&mut hub, &client, id);

    let frame = build_frame(
        request_header(id, MAX_ID + 99, 21, 6, Command::Null, qualifier::NULL),
        &[],
    );
    feed(&mut hub, id, frame);

    let (header, _) = client.recv().expect("bounce");
    assert_eq!(header.status, REJECTED);
    assert_eq!(header.command, Command::Null as u8);
    assert_eq!(header.sequence, 21);
    assert_eq!(header.session, 6);
    assert_eq!(header.source, 100);
}

#[compio::test]
async fn run_loop_honors_shutdown() {
    let hub = standalone_hub(100);
    let events = hub.events();
    events.send(HubEvent::Shutdown).unwrap();
    // The event loop drains the queued shutdown and returns.
    hub.run().await;
}

#[test]
fn hosts_hot_reload_changes_connect_target() {
    let mut hub = standalone_hub(100);

    let path = std::env::temp_dir().join(format!("weft-reload-hosts-{}", std::process::id()));
    std::fs::write(&path, "0 old.example 9000\n").unwrap();
    hub.identity_mut()
        .set_hosts(weft_core::hosts::HostsFile::load(&path).unwrap());

    // First maintenance round connects toward the old address.
    assert!(hub.handle_event(HubEvent::Tick));
    let pending = hub.take_pending_connects();
    assert_eq!(pending[0].1.host, "old.example");

    // The connect fails; the hub goes unstable again.
    assert!(hub.handle_event(HubEvent::ProxyFailed { id: CONTROLLER }));

    // Operator rewrites the hosts file; modify + close-write reloads it.
    std::fs::write(&path, "0 new.example 9100\n").unwrap();
    assert!(hub.handle_event(HubEvent::File {
        slot: WatchSlot::HostsFile,
        event: FileEvent::Modified,
    }));
    assert!(hub.handle_event(HubEvent::File {
        slot: WatchSlot::HostsFile,
        event: FileEvent::CloseWrite,
    }));

    // The next attempt must use the new address.
    assert!(hub.handle_event(HubEvent::Tick));
    let pending = hub.take_pending_connects();
    assert_eq!(pending[0].1.host, "new.example");
    assert_eq!(pending[0].1.port, 9100);

    std::fs::remove_file(path).ok();
}

/// Scenario: two hubs, a controller H0 and a peer H1, wired by shuttling
/// frames between their event loops. A client on H1 sends toward an
/// identifier that maps into H0's half; the frame must leave H1, land on H0
/// and come back as a rejected null.
#[test]
fn routing_between_two_hubs() {
    let mut h0 = standalone_hub(CONTROLLER);
    let mut h1 = standalone_hub(100);

    // --- H1 discovers the controller through its hosts table.
    let hosts_path = std::env::temp_dir().join(format!("weft-scenario-hosts-{}", std::process::id()));
    std::fs::write(&hosts_path, "0 127.0.0.1 9110\n").unwrap();
    h1.identity_mut()
        .set_hosts(weft_core::hosts::HostsFile::load(&hosts_path).unwrap());
    std::fs::remove_file(&hosts_path).ok();

    // --- Maintenance queues the proxy connect toward the controller.
    assert!(h1.handle_event(HubEvent::Tick));
    let pending = h1.take_pending_connects();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, CONTROLLER);

    // Attach the pump; the queued token request flushes.
    let (tx, h1_to_h0) = flume::unbounded();
    assert!(h1.handle_event(HubEvent::ProxyUp {
        id: CONTROLLER,
        tx
    }));
    let take = |rx: &Receiver<ConnCmd>| -> Option<Bytes> {
        match rx.try_recv() {
            Ok(ConnCmd::Send(b)) => Some(b),
            _ => None,
        }
    };
    let token_request = take(&h1_to_h0).expect("token request");

    // --- H0 sees an inbound ephemeral connection carrying that request.
    let h1_link = attach(&mut h0);
    feed(&mut h0, h1_link.id, token_request);
    let token_reply = match h1_link.rx.try_recv() {
        Ok(ConnCmd::Send(b)) => b,
        other => panic!("expected token reply, got {other:?}"),
    };

    // --- H1 turns the nonce pair into a signed register request.
    feed(&mut h1, CONTROLLER, token_reply);
    let register_request = take(&h1_to_h0).expect("register request");
    feed(&mut h0, h1_link.id, register_request);
    let register_reply = match h1_link.rx.try_recv() {
        Ok(ConnCmd::Send(b)) => b,
        other => panic!("expected register reply, got {other:?}"),
    };
    feed(&mut h1, CONTROLLER, register_reply);

    // Both ends now see a registered peering.
    assert!(h0.is_registered(100));
    assert!(h1.is_registered(CONTROLLER));

    // --- Partition the ring: H1 owns (0, 100], H0 the rest.
    let frame = build_frame(
        request_header(CONTROLLER, 100, 31, 0, Command::Node, qualifier::SET_PREDECESSOR),
        &CONTROLLER.to_be_bytes(),
    );
    feed(&mut h1, CONTROLLER, frame);
    assert!(take(&h1_to_h0).is_some()); // confirmation
    let frame = build_frame(
        request_header(CONTROLLER, 100, 32, 0, Command::Node, qualifier::SET_SUCCESSOR),
        &CONTROLLER.to_be_bytes(),
    );
    feed(&mut h1, CONTROLLER, frame);
    assert!(take(&h1_to_h0).is_some()); // confirmation
    assert_eq!(h1.node().successor(), CONTROLLER);

    // Maintenance marks the successor link live again.
    assert!(h1.handle_event(HubEvent::Tick));

    // --- A client registers on H1 inside its half.
    let client = attach(&mut h1);
    let client_id = MAX_ID + 50;
    assert_eq!(register(&mut h1, &client, client_id).status, ACCEPTED);

    // --- The client sends toward an identifier owned by H0.
    let target = MAX_ID + 1; // maps to key 0, outside (0, 100]
    let frame = build_frame(
        request_header(client_id, target, 77, 0, Command::Null, qualifier::NULL),
        b"anyone home?",
    );
    feed(&mut h1, client_id, frame);

    // (a) it was forwarded off H1 toward the controller...
    let forwarded = take(&h1_to_h0).expect("frame forwarded to H0");
    let (header, _) = parse_frame(&forwarded).unwrap();
    assert_eq!(header.destination, target);
    assert_eq!(header.source, client_id);

    // (b) ...H0 received it and found nobody registered...
    let received_before = h0.metrics().received_messages;
    feed(&mut h0, 100, forwarded);
    assert_eq!(h0.metrics().received_messages, received_before + 1);
    let bounced = match h1_link.rx.try_recv() {
        Ok(ConnCmd::Send(b)) => b,
        other => panic!("expected bounce, got {other:?}"),
    };

    // (c) ...and the client gets a rejected null with its own sequence.
    feed(&mut h1, CONTROLLER, bounced);
    let (header, _) = client.recv().expect("rejected null");
    assert_eq!(header.status, REJECTED);
    assert_eq!(header.command, Command::Null as u8);
    assert_eq!(header.sequence, 77);
}
