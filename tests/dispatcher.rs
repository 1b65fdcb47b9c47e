//! Two dispatchers on localhost, driven by hand from the test thread.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::Receiver;

use kadmos::rpc::handler::{Request, RequestFilter, RequestHandler};
use kadmos::rpc::{Callback, Config, DispatcherEvent, MessageDispatcher, Outcome};
use kadmos::{Contact, Kuid, Message, MessageBody, MessageType, PingResponse, RoutingTable};

fn dispatcher() -> MessageDispatcher {
    let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
    let mut dispatcher =
        MessageDispatcher::new(&Config::localhost(), RoutingTable::new(local).shared());

    dispatcher
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .unwrap();
    dispatcher.start().unwrap();
    dispatcher
}

/// Ticks both dispatchers until `done` or two seconds pass.
fn drive(a: &mut MessageDispatcher, b: &mut MessageDispatcher, done: impl Fn() -> bool) {
    let start = Instant::now();

    while !done() {
        a.tick();
        b.tick();

        assert!(start.elapsed() < Duration::from_secs(2), "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Ticks `dispatcher` until it emits an event matching `expected`.
fn wait_for_event(
    dispatcher: &mut MessageDispatcher,
    events: &Receiver<DispatcherEvent>,
    expected: impl Fn(&DispatcherEvent) -> bool,
) -> DispatcherEvent {
    let start = Instant::now();

    loop {
        dispatcher.tick();

        if let Some(event) = events.try_iter().find(|event| expected(event)) {
            return event;
        }

        assert!(start.elapsed() < Duration::from_secs(2), "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A socket speaking the wire format by hand.
fn raw_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    socket
}

fn send_raw(socket: &UdpSocket, to: SocketAddr, node_id: Kuid, message_id: Kuid, body: MessageBody) {
    let message = Message {
        vendor: 0,
        version: 0,
        node_id: Some(node_id),
        message_id: Some(message_id),
        body,
    };

    socket.send_to(&message.to_bytes().unwrap(), to).unwrap();
}

/// Ticks `dispatcher` until a request sent with a short timeout has timed out.
fn send_and_time_out(
    dispatcher: &mut MessageDispatcher,
    node_id: Kuid,
    address: SocketAddr,
) -> Kuid {
    let timed_out = Arc::new(AtomicUsize::new(0));
    let timed_out_ = timed_out.clone();

    let message_id = dispatcher
        .send(
            Some(node_id),
            address,
            MessageBody::PingRequest,
            Callback::with_timeout(
                Duration::from_millis(50),
                move |_: &mut MessageDispatcher, outcome| {
                    assert!(matches!(outcome, Outcome::Timeout(_)));
                    timed_out_.fetch_add(1, Ordering::SeqCst);
                },
            ),
        )
        .unwrap();

    let start = Instant::now();
    while timed_out.load(Ordering::SeqCst) == 0 {
        dispatcher.tick();
        assert!(start.elapsed() < Duration::from_secs(2), "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(dispatcher.pending_requests(), 0);

    message_id
}

#[derive(Debug)]
struct Pong;

impl RequestHandler for Pong {
    fn handle_request(&mut self, request: &Request) -> Option<MessageBody> {
        Some(MessageBody::PingResponse(PingResponse {
            external_address: Some(request.from),
        }))
    }
}

#[derive(Debug, Clone, Default)]
struct CountingPong(Arc<AtomicUsize>);

impl RequestHandler for CountingPong {
    fn handle_request(&mut self, request: &Request) -> Option<MessageBody> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Pong.handle_request(request)
    }
}

#[derive(Debug)]
struct DenyAll;

impl RequestFilter for DenyAll {
    fn allow_request(&self, _request: &Request) -> bool {
        false
    }
}

#[test]
fn request_response() {
    let mut a = dispatcher();
    let mut b = dispatcher();
    b.register_handler(MessageType::PingRequest, Box::new(Pong));

    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();
    let b_id = *b.local_id();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let outcomes_ = outcomes.clone();

    let sent = Instant::now();
    a.send(
        Some(b_id),
        b_addr,
        MessageBody::PingRequest,
        Callback::new(move |_: &mut MessageDispatcher, result| {
            outcomes_.lock().unwrap().push(result);
        }),
    )
    .unwrap();

    drive(&mut a, &mut b, || !outcomes.lock().unwrap().is_empty());
    let elapsed = sent.elapsed();

    // Nothing else reaches the callback afterwards
    for _ in 0..20 {
        a.tick();
        b.tick();
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);

    let outcome = outcomes.remove(0);
    let Outcome::Response(response) = outcome else {
        panic!("expected a response, got {:?}", outcome);
    };

    assert!(response.round_trip_time > Duration::ZERO);
    assert!(response.round_trip_time <= elapsed);
    assert_eq!(response.from, b_addr);
    assert_eq!(response.message.node_id, Some(b_id));
    assert_eq!(
        response.message.body,
        MessageBody::PingResponse(PingResponse {
            external_address: Some(a_addr)
        })
    );
    assert_eq!(a.pending_requests(), 0);

    // The responder was added to the routing table
    let table = a.route_table().read().unwrap();
    assert!(table.get(&b_id).is_some());
}

#[test]
fn handler_timeout() {
    let mut dispatcher = dispatcher();
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let events = dispatcher.subscribe();

    let outcome = Arc::new(Mutex::new(None));
    let outcome_ = outcome.clone();

    let start = Instant::now();
    dispatcher
        .send(
            None,
            silent.local_addr().unwrap(),
            MessageBody::PingRequest,
            Callback::with_timeout(
                Duration::from_millis(100),
                move |_: &mut MessageDispatcher, result| {
                    *outcome_.lock().unwrap() = Some(result);
                },
            ),
        )
        .unwrap();

    while outcome.lock().unwrap().is_none() {
        dispatcher.tick();
        assert!(start.elapsed() < Duration::from_secs(2), "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }

    match outcome.lock().unwrap().take() {
        Some(Outcome::Timeout(timeout)) => {
            assert!(!timeout.cancelled);
            assert_eq!(timeout.request, MessageType::PingRequest);
            assert!(timeout.elapsed >= Duration::from_millis(100));
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(dispatcher.pending_requests(), 0);

    assert!(events
        .try_iter()
        .any(|event| matches!(event, DispatcherEvent::TimedOut { .. })));
}

#[test]
fn messages_carrying_the_local_id_are_dropped() {
    let mut dispatcher = dispatcher();
    let requests = CountingPong::default();
    dispatcher.register_handler(MessageType::PingRequest, Box::new(requests.clone()));
    let events = dispatcher.subscribe();

    let raw = raw_socket();
    let local_id = *dispatcher.local_id();

    send_raw(
        &raw,
        dispatcher.local_addr().unwrap(),
        local_id,
        Kuid::random(),
        MessageBody::PingRequest,
    );

    let event = wait_for_event(&mut dispatcher, &events, |event| {
        matches!(event, DispatcherEvent::Dropped { .. })
    });

    match event {
        DispatcherEvent::Dropped { from, reason } => {
            assert_eq!(from, raw.local_addr().unwrap());
            assert_eq!(reason, "local node id");
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(requests.0.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.statistics().dropped, 1);
    assert_eq!(dispatcher.statistics().requests_received, 0);

    // No response was sent
    dispatcher.tick();
    let mut buf = [0u8; 1024];
    assert!(raw.recv_from(&mut buf).is_err());
}

#[test]
fn late_response_refreshes_known_contact() {
    let mut dispatcher = dispatcher();
    let events = dispatcher.subscribe();

    let raw = raw_socket();
    let raw_addr = raw.local_addr().unwrap();
    let node_id = Kuid::random();

    assert!(dispatcher
        .route_table()
        .write()
        .unwrap()
        .add(Contact::new(node_id, raw_addr)));

    let message_id = send_and_time_out(&mut dispatcher, node_id, raw_addr);
    assert_eq!(
        dispatcher
            .route_table()
            .read()
            .unwrap()
            .get(&node_id)
            .unwrap()
            .failures(),
        1
    );

    let response = || {
        MessageBody::PingResponse(PingResponse {
            external_address: None,
        })
    };

    // The same answer from another port was never solicited
    let other = raw_socket();
    send_raw(
        &other,
        dispatcher.local_addr().unwrap(),
        node_id,
        message_id,
        response(),
    );

    let event = wait_for_event(&mut dispatcher, &events, |event| {
        matches!(event, DispatcherEvent::LateResponse { .. })
    });
    assert!(matches!(
        event,
        DispatcherEvent::LateResponse { from, refreshed: false } if from == other.local_addr().unwrap()
    ));

    send_raw(
        &raw,
        dispatcher.local_addr().unwrap(),
        node_id,
        message_id,
        response(),
    );

    let event = wait_for_event(&mut dispatcher, &events, |event| {
        matches!(event, DispatcherEvent::LateResponse { .. })
    });
    assert!(matches!(
        event,
        DispatcherEvent::LateResponse { from, refreshed: true } if from == raw_addr
    ));

    let contact = dispatcher
        .route_table()
        .read()
        .unwrap()
        .get(&node_id)
        .unwrap();
    assert_eq!(contact.failures(), 0);
    assert_eq!(contact.address(), raw_addr);
    assert_eq!(dispatcher.statistics().late_responses, 2);
}

#[test]
fn late_response_from_another_address_is_discarded() {
    let mut dispatcher = dispatcher();
    let events = dispatcher.subscribe();

    let known = raw_socket();
    let raw = raw_socket();
    let node_id = Kuid::random();

    dispatcher
        .route_table()
        .write()
        .unwrap()
        .add(Contact::new(node_id, known.local_addr().unwrap()));

    // Sent to an address other than the one the contact is known by
    let message_id = send_and_time_out(&mut dispatcher, node_id, raw.local_addr().unwrap());

    send_raw(
        &raw,
        dispatcher.local_addr().unwrap(),
        node_id,
        message_id,
        MessageBody::PingResponse(PingResponse {
            external_address: None,
        }),
    );

    let event = wait_for_event(&mut dispatcher, &events, |event| {
        matches!(event, DispatcherEvent::LateResponse { .. })
    });
    assert!(matches!(
        event,
        DispatcherEvent::LateResponse { refreshed: false, .. }
    ));

    let contact = dispatcher
        .route_table()
        .read()
        .unwrap()
        .get(&node_id)
        .unwrap();
    assert_eq!(contact.address(), known.local_addr().unwrap());
    assert_eq!(contact.failures(), 1);
}

#[test]
fn filtered_requests_reach_no_handler() {
    let mut dispatcher = dispatcher();
    let requests = CountingPong::default();
    dispatcher.register_handler(MessageType::PingRequest, Box::new(requests.clone()));
    dispatcher.set_filter(Box::new(DenyAll));
    let events = dispatcher.subscribe();

    let raw = raw_socket();
    let sender_id = Kuid::random();

    send_raw(
        &raw,
        dispatcher.local_addr().unwrap(),
        sender_id,
        Kuid::random(),
        MessageBody::PingRequest,
    );

    let event = wait_for_event(&mut dispatcher, &events, |event| {
        matches!(event, DispatcherEvent::Filtered { .. })
    });
    assert!(matches!(
        event,
        DispatcherEvent::Filtered { from } if from == raw.local_addr().unwrap()
    ));

    assert_eq!(requests.0.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.statistics().requests_received, 0);
    assert!(dispatcher
        .route_table()
        .read()
        .unwrap()
        .get(&sender_id)
        .is_none());

    // Filtered requests are not answered
    dispatcher.tick();
    let mut buf = [0u8; 1024];
    assert!(raw.recv_from(&mut buf).is_err());
}
