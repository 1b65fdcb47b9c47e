//! Message dispatcher: owns the UDP socket, the outbound queue and the
//! requests awaiting a response, and routes every decoded message.

mod config;
mod handle_request;
mod handle_response;
pub mod handler;
mod message_id;
pub mod receipts;
mod socket;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::common::{
    Kuid, Message, MessageBody, MessageError, MessageType, SharedRouteTable,
    ValueFactoryRegistry,
};
use crate::contacts;

use handler::{DefaultFilter, DefaultHandler, RequestFilter, RequestHandler, ResponseHandler};
use receipts::{PendingRequestTable, Receipt};
use socket::DatagramSocket;

pub use config::Config;
pub use handler::{Callback, Ignore, Outcome, Request, Response, Statistics, Timeout};
pub use message_id::MessageIdFactory;

/// Vendor tag of this implementation: "KADM".
pub const VENDOR: u32 = 0x4b41_444d;
pub const VERSION: u16 = 1;
/// Default request timeout before abandoning a request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Interval between sweeps of timed out requests, to avoid checking on every iteration.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_SENDS_PER_TICK: usize = 10;
/// How long [MessageDispatcher::run] sleeps after an iteration with nothing to do.
/// Lower values increases CPU usage, but reduces latency.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(5);

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Dispatcher is already bound")]
    AlreadyBound,

    #[error("Failed to bind socket: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("Dispatcher is not bound")]
    NotBound,

    #[error("Dispatcher is stopped")]
    NotRunning,

    /// The destination is the local node.
    #[error("Refusing to send a message to the local node")]
    SelfSend,

    #[error("Invalid destination address: {0}")]
    InvalidDestination(SocketAddr),

    /// Only requests are sent through [MessageDispatcher::send].
    #[error("Not a request: {0:?}")]
    NotARequest(MessageType),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Unbound,
    Bound,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Observable dispatcher activity, see [MessageDispatcher::subscribe].
pub enum DispatcherEvent {
    Sent {
        message_id: Option<Kuid>,
        to: SocketAddr,
        message_type: MessageType,
    },
    Received {
        message_id: Option<Kuid>,
        from: SocketAddr,
        message_type: MessageType,
    },
    /// A request was rejected by the [RequestFilter].
    Filtered { from: SocketAddr },
    TimedOut { message_id: Kuid, to: SocketAddr },
    /// A response matched no pending request.
    LateResponse { from: SocketAddr, refreshed: bool },
    Dropped {
        from: SocketAddr,
        reason: &'static str,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// What one [MessageDispatcher::tick] did.
pub struct TickReport {
    pub received: usize,
    pub sent: usize,
    pub expired: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.received == 0 && self.sent == 0 && self.expired == 0
    }
}

pub(crate) enum Command {
    Send {
        node_id: Option<Kuid>,
        address: SocketAddr,
        body: MessageBody,
        handler: Box<dyn ResponseHandler>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
/// Sends requests to a dispatcher running on another thread.
pub struct DispatcherHandle {
    local_id: Kuid,
    sender: Sender<Command>,
}

impl DispatcherHandle {
    /// Queues a request, see [MessageDispatcher::send].
    ///
    /// Fails immediately with [DispatchError::SelfSend] for the local node id,
    /// any later failure is delivered to the handler.
    pub fn send(
        &self,
        node_id: Option<Kuid>,
        address: SocketAddr,
        body: MessageBody,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<(), DispatchError> {
        if node_id.as_ref() == Some(&self.local_id) {
            return Err(DispatchError::SelfSend);
        }

        self.sender
            .send(Command::Send {
                node_id,
                address,
                body,
                handler,
            })
            .map_err(|_| DispatchError::NotRunning)
    }

    /// Asks the dispatcher to close, cancelling every pending request.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }

    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }
}

#[derive(Debug)]
enum Outgoing {
    Request(Receipt),
    Response {
        address: SocketAddr,
        message_id: Option<Kuid>,
        message_type: MessageType,
        payload: Bytes,
    },
}

#[derive(Debug)]
/// Single threaded, non-blocking message dispatcher.
///
/// Call [Self::tick] in a loop, or [Self::run], from the one thread that owns it.
/// Other threads talk to it through a [DispatcherHandle].
pub struct MessageDispatcher {
    state: DispatcherState,
    socket: Option<DatagramSocket>,

    local_id: Kuid,
    vendor: u32,
    version: u16,
    request_timeout: Duration,
    max_message_size: usize,
    max_sends_per_tick: usize,
    cleanup_interval: Duration,
    allow_private_addresses: bool,

    route_table: SharedRouteTable,
    receipts: PendingRequestTable,
    queue: VecDeque<Outgoing>,

    request_handlers: HashMap<MessageType, Box<dyn RequestHandler>>,
    default_handler: DefaultHandler,
    filter: Box<dyn RequestFilter>,

    message_ids: MessageIdFactory,
    values: Arc<ValueFactoryRegistry>,

    command_sender: Sender<Command>,
    commands: Receiver<Command>,
    listeners: Vec<Sender<DispatcherEvent>>,

    last_sweep: Instant,
}

impl MessageDispatcher {
    /// Creates an unbound dispatcher for the local node of `route_table`.
    pub fn new(config: &Config, route_table: SharedRouteTable) -> Self {
        let local_id = *route_table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .local_node()
            .node_id();

        let (command_sender, commands) = flume::unbounded();

        MessageDispatcher {
            state: DispatcherState::Unbound,
            socket: None,

            local_id,
            vendor: config.vendor,
            version: config.version,
            request_timeout: config.request_timeout,
            max_message_size: config.max_message_size,
            max_sends_per_tick: config.max_sends_per_tick.max(1),
            cleanup_interval: config.cleanup_interval,
            allow_private_addresses: config.allow_private_addresses,

            default_handler: DefaultHandler::new(
                route_table.clone(),
                config.allow_private_addresses,
                config.required_scrub_ratio,
            ),
            route_table,
            receipts: PendingRequestTable::new(config.receipt_capacity),
            queue: VecDeque::new(),

            request_handlers: HashMap::new(),
            filter: Box::new(DefaultFilter),

            message_ids: MessageIdFactory::new(),
            values: Arc::new(ValueFactoryRegistry::default()),

            command_sender,
            commands,
            listeners: Vec::new(),

            last_sweep: Instant::now(),
        }
    }

    // === Getters ===

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.local_addr())
    }

    pub fn route_table(&self) -> &SharedRouteTable {
        &self.route_table
    }

    /// Number of sent requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.receipts.len()
    }

    /// Number of messages waiting to be written.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn statistics(&self) -> Statistics {
        self.default_handler.statistics()
    }

    /// A handle to send requests from other threads.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            local_id: self.local_id,
            sender: self.command_sender.clone(),
        }
    }

    // === Setup ===

    /// Registers the handler for one request type, returning the one it replaced.
    pub fn register_handler(
        &mut self,
        message_type: MessageType,
        handler: Box<dyn RequestHandler>,
    ) -> Option<Box<dyn RequestHandler>> {
        if !message_type.is_request() {
            warn!(?message_type, "Ignoring handler for a response type");
            return None;
        }

        self.request_handlers.insert(message_type, handler)
    }

    pub fn set_filter(&mut self, filter: Box<dyn RequestFilter>) {
        self.filter = filter;
    }

    /// Decodes incoming values through this registry.
    pub fn set_value_factories(&mut self, values: Arc<ValueFactoryRegistry>) {
        self.values = values;
    }

    /// Returns a channel receiving every [DispatcherEvent] from now on.
    pub fn subscribe(&mut self) -> Receiver<DispatcherEvent> {
        let (sender, receiver) = flume::unbounded();
        self.listeners.push(sender);
        receiver
    }

    // === Lifecycle ===

    /// Binds the UDP socket, returning the bound address.
    pub fn bind(&mut self, address: SocketAddr) -> Result<SocketAddr, DispatchError> {
        match self.state {
            DispatcherState::Unbound => {}
            DispatcherState::Stopped => return Err(DispatchError::NotRunning),
            _ => return Err(DispatchError::AlreadyBound),
        }

        let socket = DatagramSocket::bind(address, self.max_message_size)
            .map_err(DispatchError::BindFailed)?;
        let local_addr = socket.local_addr();

        self.socket = Some(socket);
        self.state = DispatcherState::Bound;

        info!(?local_addr, local_id = ?self.local_id, "Dispatcher bound");

        Ok(local_addr)
    }

    /// Starts processing messages.
    pub fn start(&mut self) -> Result<(), DispatchError> {
        match self.state {
            DispatcherState::Unbound => Err(DispatchError::NotBound),
            DispatcherState::Stopped => Err(DispatchError::NotRunning),
            _ => {
                self.state = DispatcherState::Running;
                Ok(())
            }
        }
    }

    /// Runs the dispatcher loop on the current thread until it is closed.
    pub fn run(&mut self) -> Result<(), DispatchError> {
        self.start()?;

        while self.state == DispatcherState::Running {
            let report = self.tick();

            if report.is_idle() && self.state == DispatcherState::Running {
                thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
        }

        Ok(())
    }

    /// Closes the socket and cancels every pending request.
    ///
    /// Every handler waiting for an outcome receives a cancelled timeout
    /// before this returns, and none is invoked afterwards.
    pub fn close(&mut self) {
        if self.state == DispatcherState::Stopped {
            return;
        }
        self.state = DispatcherState::Stopped;

        let now = Instant::now();

        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { handler, .. } = command {
                handler.handle_error(self, DispatchError::NotRunning);
            }
        }

        while let Some(outgoing) = self.queue.pop_front() {
            if let Outgoing::Request(receipt) = outgoing {
                self.fire_timeout(receipt, now, true);
            }
        }

        for receipt in self.receipts.drain() {
            self.fire_timeout(receipt, now, true);
        }

        self.socket = None;

        info!(local_id = ?self.local_id, "Dispatcher closed");
    }

    // === Public Methods ===

    /// Queues a request to `address`, returning its message id.
    ///
    /// `node_id` is the expected responder, `None` accepts a response from anyone.
    /// The handler's timeout starts once the request is actually written.
    pub fn send(
        &mut self,
        node_id: Option<Kuid>,
        address: SocketAddr,
        body: MessageBody,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<Kuid, DispatchError> {
        match self.prepare(node_id, address, body, handler) {
            Ok(receipt) => {
                let message_id = *receipt.message_id();
                self.queue.push_back(Outgoing::Request(receipt));
                Ok(message_id)
            }
            Err((error, _)) => Err(error),
        }
    }

    /// One iteration of the dispatcher loop.
    ///
    /// Drains commands and every readable datagram, writes at most
    /// [Config::max_sends_per_tick] datagrams, then sweeps timed out
    /// requests if [Config::cleanup_interval] elapsed.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.state != DispatcherState::Running {
            return report;
        }

        self.handle_commands();
        if self.state != DispatcherState::Running {
            return report;
        }

        report.received = self.read();
        report.sent = self.write();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= self.cleanup_interval {
            self.last_sweep = now;
            report.expired = self.sweep(now);
        }

        report
    }

    // === Private Methods ===

    fn handle_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send {
                    node_id,
                    address,
                    body,
                    handler,
                } => match self.prepare(node_id, address, body, handler) {
                    Ok(receipt) => self.queue.push_back(Outgoing::Request(receipt)),
                    Err((error, handler)) => handler.handle_error(self, error),
                },
                Command::Shutdown => {
                    self.close();
                    return;
                }
            }
        }
    }

    /// Validates and encodes an outgoing request into a receipt ready to be written.
    ///
    /// Hands the handler back on failure, so the caller decides how to report it.
    #[allow(clippy::type_complexity)]
    fn prepare(
        &mut self,
        node_id: Option<Kuid>,
        address: SocketAddr,
        body: MessageBody,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<Receipt, (DispatchError, Box<dyn ResponseHandler>)> {
        if let Err(error) = self.validate_destination(node_id.as_ref(), &address, &body) {
            return Err((error, handler));
        }

        let message_id = self.message_ids.create(address);
        let message_type = body.message_type();
        let message = Message {
            vendor: self.vendor,
            version: self.version,
            node_id: Some(self.local_id),
            message_id: Some(message_id),
            body,
        };

        let payload = match message.to_bytes_with_limit(self.max_message_size) {
            Ok(payload) => payload,
            Err(error) => return Err((error.into(), handler)),
        };
        trace!(context = "dispatcher_sending", ?message, ?address);

        let timeout = handler.timeout().unwrap_or(self.request_timeout);

        Ok(Receipt::new(
            node_id,
            address,
            message_id,
            message_type,
            payload,
            timeout,
            handler,
        ))
    }

    fn validate_destination(
        &self,
        node_id: Option<&Kuid>,
        address: &SocketAddr,
        body: &MessageBody,
    ) -> Result<(), DispatchError> {
        if node_id == Some(&self.local_id) {
            return Err(DispatchError::SelfSend);
        }

        match self.state {
            DispatcherState::Unbound => return Err(DispatchError::NotBound),
            DispatcherState::Stopped => return Err(DispatchError::NotRunning),
            _ => {}
        }

        if self.local_addr().as_ref() == Some(address) {
            return Err(DispatchError::SelfSend);
        }

        if !contacts::is_valid_socket_address(address) {
            return Err(DispatchError::InvalidDestination(*address));
        }

        if !self.allow_private_addresses && contacts::is_private_address(&address.ip()) {
            return Err(DispatchError::InvalidDestination(*address));
        }

        if !body.is_request() {
            return Err(DispatchError::NotARequest(body.message_type()));
        }

        Ok(())
    }

    /// Drains every readable datagram.
    fn read(&mut self) -> usize {
        let mut received = 0;

        loop {
            let Some(socket) = self.socket.as_mut() else {
                break;
            };

            let (bytes, from) = match socket.recv_from() {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(error) => {
                    warn!(context = "socket_error", ?error, "recv_from failed unexpectedly");
                    break;
                }
            };
            received += 1;

            match Message::from_bytes_with(&bytes, &self.values) {
                Ok(message) => self.handle_message(message, from),
                Err(error) => {
                    trace!(
                        context = "socket_error",
                        ?error,
                        ?from,
                        "Received invalid message."
                    );
                    self.default_handler.handle_dropped();
                    self.emit(DispatcherEvent::Dropped {
                        from,
                        reason: "malformed",
                    });
                }
            }

            if self.state != DispatcherState::Running {
                break;
            }
        }

        received
    }

    /// Writes up to `max_sends_per_tick` queued datagrams.
    fn write(&mut self) -> usize {
        let mut sent = 0;

        while sent < self.max_sends_per_tick {
            let Some(outgoing) = self.queue.pop_front() else {
                break;
            };
            let Some(socket) = self.socket.as_ref() else {
                self.queue.push_front(outgoing);
                break;
            };

            match outgoing {
                Outgoing::Request(mut receipt) => {
                    let Some(payload) = receipt.payload().cloned() else {
                        continue;
                    };

                    match socket.send_to(&payload, receipt.address()) {
                        Ok(true) => {
                            let now = Instant::now();
                            receipt.mark_sent(now);
                            sent += 1;

                            self.emit(DispatcherEvent::Sent {
                                message_id: Some(*receipt.message_id()),
                                to: receipt.address(),
                                message_type: receipt.request(),
                            });

                            if let Some(displaced) = self.receipts.register(receipt) {
                                debug!(
                                    message_id = ?displaced.message_id(),
                                    "Pending request table full, evicting oldest request"
                                );
                                self.fire_timeout(displaced, now, true);
                            }
                        }
                        Ok(false) => {
                            self.queue.push_front(Outgoing::Request(receipt));
                            break;
                        }
                        Err(error) => {
                            debug!(?error, to = ?receipt.address(), "Error sending request message");
                            sent += 1;
                            receipt.into_handler().handle_error(self, error.into());
                        }
                    }
                }
                Outgoing::Response {
                    address,
                    message_id,
                    message_type,
                    payload,
                } => match socket.send_to(&payload, address) {
                    Ok(true) => {
                        sent += 1;
                        self.emit(DispatcherEvent::Sent {
                            message_id,
                            to: address,
                            message_type,
                        });
                    }
                    Ok(false) => {
                        self.queue.push_front(Outgoing::Response {
                            address,
                            message_id,
                            message_type,
                            payload,
                        });
                        break;
                    }
                    Err(error) => {
                        sent += 1;
                        debug!(?error, to = ?address, "Error sending response message");
                    }
                },
            }
        }

        sent
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.receipts.sweep_expired(now);
        let count = expired.len();

        for receipt in expired {
            self.fire_timeout(receipt, now, false);
        }

        count
    }

    fn fire_timeout(&mut self, receipt: Receipt, now: Instant, cancelled: bool) {
        let (handler, timeout) = receipt.into_timeout(now, cancelled);

        debug!(
            message_id = ?timeout.message_id,
            to = ?timeout.address,
            request = ?timeout.request,
            elapsed = ?timeout.elapsed,
            cancelled,
            "Request timed out"
        );

        self.default_handler.handle_timeout(&timeout);
        self.emit(DispatcherEvent::TimedOut {
            message_id: timeout.message_id,
            to: timeout.address,
        });

        handler.handle_timeout(self, timeout);
    }

    fn emit(&mut self, event: DispatcherEvent) {
        if self.listeners.is_empty() {
            return;
        }

        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::common::{Contact, FindNodeRequest, RoutingTable};

    fn dispatcher() -> MessageDispatcher {
        let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut dispatcher =
            MessageDispatcher::new(&Config::localhost(), RoutingTable::new(local).shared());
        dispatcher
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap();
        dispatcher
    }

    #[test]
    fn state_machine() {
        let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut dispatcher =
            MessageDispatcher::new(&Config::localhost(), RoutingTable::new(local).shared());

        assert_eq!(dispatcher.state(), DispatcherState::Unbound);
        assert!(matches!(dispatcher.start(), Err(DispatchError::NotBound)));

        dispatcher
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Bound);
        assert!(matches!(
            dispatcher.bind(SocketAddr::from(([127, 0, 0, 1], 0))),
            Err(DispatchError::AlreadyBound)
        ));

        dispatcher.start().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Running);

        dispatcher.close();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(dispatcher.local_addr().is_none());
    }

    #[test]
    fn bind_failed() {
        let first = dispatcher();
        let taken = first.local_addr().unwrap();

        let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut second =
            MessageDispatcher::new(&Config::localhost(), RoutingTable::new(local).shared());

        assert!(matches!(second.bind(taken), Err(DispatchError::BindFailed(_))));
    }

    #[test]
    fn self_send_is_rejected() {
        let mut dispatcher = dispatcher();
        let local_id = *dispatcher.local_id();

        let result = dispatcher.send(
            Some(local_id),
            SocketAddr::from(([127, 0, 0, 1], 9)),
            MessageBody::PingRequest,
            Box::new(Ignore),
        );

        assert!(matches!(result, Err(DispatchError::SelfSend)));
        assert_eq!(dispatcher.queued(), 0);

        let handle = dispatcher.handle();
        assert!(matches!(
            handle.send(
                Some(local_id),
                SocketAddr::from(([127, 0, 0, 1], 9)),
                MessageBody::PingRequest,
                Box::new(Ignore),
            ),
            Err(DispatchError::SelfSend)
        ));
    }

    #[test]
    fn private_destinations_need_permission() {
        let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut strict = MessageDispatcher::new(
            &Config {
                bind_address: Some(IpAddr::from([127, 0, 0, 1])),
                ..Config::default()
            },
            RoutingTable::new(local).shared(),
        );
        strict
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap();
        strict.start().unwrap();

        for address in [
            SocketAddr::from(([10, 0, 0, 1], 4000)),
            SocketAddr::from(([192, 168, 1, 1], 4000)),
            SocketAddr::from(([127, 0, 0, 1], 4000)),
        ] {
            let result = strict.send(None, address, MessageBody::PingRequest, Box::new(Ignore));

            assert!(
                matches!(result, Err(DispatchError::InvalidDestination(rejected)) if rejected == address)
            );
        }
        assert_eq!(strict.queued(), 0);
        assert_eq!(strict.pending_requests(), 0);

        // Public destinations are still accepted
        strict
            .send(
                None,
                SocketAddr::from(([93, 184, 216, 34], 4000)),
                MessageBody::PingRequest,
                Box::new(Ignore),
            )
            .unwrap();
        assert_eq!(strict.queued(), 1);

        // Allowed with the setting, as in every other test here
        let mut permissive = dispatcher();
        permissive.start().unwrap();
        permissive
            .send(
                None,
                SocketAddr::from(([10, 0, 0, 1], 4000)),
                MessageBody::PingRequest,
                Box::new(Ignore),
            )
            .unwrap();
        assert_eq!(permissive.queued(), 1);
    }

    #[test]
    fn only_requests_are_sent() {
        let mut dispatcher = dispatcher();

        let result = dispatcher.send(
            None,
            SocketAddr::from(([127, 0, 0, 1], 9)),
            MessageBody::StoreResponse(crate::common::StoreResponse { statuses: vec![] }),
            Box::new(Ignore),
        );

        assert!(matches!(
            result,
            Err(DispatchError::NotARequest(MessageType::StoreResponse))
        ));
    }

    #[test]
    fn timeout_clock_starts_when_sent() {
        let mut dispatcher = dispatcher();
        dispatcher.start().unwrap();

        for _ in 0..25 {
            dispatcher
                .send(
                    None,
                    SocketAddr::from(([127, 0, 0, 1], 9)),
                    MessageBody::FindNodeRequest(FindNodeRequest {
                        target: Kuid::random(),
                    }),
                    Box::new(Ignore),
                )
                .unwrap();
        }

        assert_eq!(dispatcher.pending_requests(), 0);

        let report = dispatcher.tick();
        assert_eq!(report.sent, DEFAULT_MAX_SENDS_PER_TICK);
        assert_eq!(dispatcher.pending_requests(), 10);
        assert_eq!(dispatcher.queued(), 15);
    }

    #[test]
    fn close_cancels_everything() {
        let mut dispatcher = dispatcher();
        dispatcher.start().unwrap();

        let outcomes = Arc::new(Mutex::new(vec![]));

        for _ in 0..12 {
            let outcomes = outcomes.clone();
            dispatcher
                .send(
                    None,
                    SocketAddr::from(([127, 0, 0, 1], 9)),
                    MessageBody::PingRequest,
                    Callback::new(move |_, outcome| outcomes.lock().unwrap().push(outcome)),
                )
                .unwrap();
        }

        dispatcher.tick();
        assert_eq!(dispatcher.pending_requests(), 10);
        assert_eq!(dispatcher.queued(), 2);

        dispatcher.close();

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 12);
        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, Outcome::Timeout(Timeout { cancelled: true, .. }))));

        assert!(matches!(
            dispatcher.send(
                None,
                SocketAddr::from(([127, 0, 0, 1], 9)),
                MessageBody::PingRequest,
                Box::new(Ignore),
            ),
            Err(DispatchError::NotRunning)
        ));
    }

    #[test]
    fn eviction_is_a_timeout() {
        let local = Contact::new(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut dispatcher = MessageDispatcher::new(
            &Config {
                receipt_capacity: 2,
                ..Config::localhost()
            },
            RoutingTable::new(local).shared(),
        );
        dispatcher
            .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap();
        dispatcher.start().unwrap();

        let timeouts = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let timeouts = timeouts.clone();
            dispatcher
                .send(
                    None,
                    SocketAddr::from(([127, 0, 0, 1], 9)),
                    MessageBody::PingRequest,
                    Callback::new(move |_, outcome| {
                        if let Outcome::Timeout(_) = outcome {
                            *timeouts.lock().unwrap() += 1;
                        }
                    }),
                )
                .unwrap();
        }

        dispatcher.tick();

        assert_eq!(dispatcher.pending_requests(), 2);
        assert_eq!(*timeouts.lock().unwrap(), 1);
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let mut dispatcher = dispatcher();
        dispatcher.start().unwrap();
        let events = dispatcher.subscribe();

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .send_to(&[1, 2, 3], dispatcher.local_addr().unwrap())
            .unwrap();

        let start = Instant::now();
        while dispatcher.statistics().dropped == 0 {
            dispatcher.tick();
            assert!(start.elapsed() < Duration::from_secs(2));
        }

        assert_eq!(dispatcher.state(), DispatcherState::Running);
        assert!(matches!(
            events.try_recv(),
            Ok(DispatcherEvent::Dropped {
                reason: "malformed",
                ..
            })
        ));
    }
}
