//! Callbacks invoked by the [MessageDispatcher] for requests and responses.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::common::{Contact, Kuid, Message, MessageBody, MessageType, SharedRouteTable};
use crate::contacts;

use super::{DispatchError, MessageDispatcher};

#[derive(Debug, Clone)]
/// A response correlated with one of our requests.
pub struct Response {
    pub message: Message,
    pub from: SocketAddr,
    /// Time between writing the request and decoding this response.
    pub round_trip_time: Duration,
}

#[derive(Debug, Clone)]
/// A request that received no response in time, or was cancelled on shutdown.
pub struct Timeout {
    pub message_id: Kuid,
    pub node_id: Option<Kuid>,
    pub address: SocketAddr,
    pub request: MessageType,
    pub elapsed: Duration,
    /// The dispatcher was closed or the receipt was evicted before a response arrived.
    pub cancelled: bool,
}

/// Receives exactly one of the three outcomes of a request.
pub trait ResponseHandler: Send {
    /// How long to wait for a response, `None` to use [super::Config::request_timeout].
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn handle_response(self: Box<Self>, dispatcher: &mut MessageDispatcher, response: Response);

    fn handle_timeout(self: Box<Self>, dispatcher: &mut MessageDispatcher, timeout: Timeout);

    /// The request could not be sent.
    fn handle_error(self: Box<Self>, dispatcher: &mut MessageDispatcher, error: DispatchError);
}

#[derive(Debug)]
/// The terminal outcome of a request, as delivered to a [Callback].
pub enum Outcome {
    Response(Response),
    Timeout(Timeout),
    Error(DispatchError),
}

/// [ResponseHandler] from a closure receiving the [Outcome].
pub struct Callback<F> {
    timeout: Option<Duration>,
    callback: F,
}

impl<F> Callback<F> {
    pub fn new(callback: F) -> Box<Self>
    where
        F: FnOnce(&mut MessageDispatcher, Outcome) + Send + 'static,
    {
        Box::new(Callback {
            timeout: None,
            callback,
        })
    }

    pub fn with_timeout(timeout: Duration, callback: F) -> Box<Self>
    where
        F: FnOnce(&mut MessageDispatcher, Outcome) + Send + 'static,
    {
        Box::new(Callback {
            timeout: Some(timeout),
            callback,
        })
    }
}

impl<F> ResponseHandler for Callback<F>
where
    F: FnOnce(&mut MessageDispatcher, Outcome) + Send + 'static,
{
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn handle_response(self: Box<Self>, dispatcher: &mut MessageDispatcher, response: Response) {
        (self.callback)(dispatcher, Outcome::Response(response))
    }

    fn handle_timeout(self: Box<Self>, dispatcher: &mut MessageDispatcher, timeout: Timeout) {
        (self.callback)(dispatcher, Outcome::Timeout(timeout))
    }

    fn handle_error(self: Box<Self>, dispatcher: &mut MessageDispatcher, error: DispatchError) {
        (self.callback)(dispatcher, Outcome::Error(error))
    }
}

impl<F> Debug for Callback<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Callback(timeout: {:?})", self.timeout)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Discards the outcome, for requests sent only to refresh liveness.
pub struct Ignore;

impl ResponseHandler for Ignore {
    fn handle_response(self: Box<Self>, _: &mut MessageDispatcher, _: Response) {}

    fn handle_timeout(self: Box<Self>, _: &mut MessageDispatcher, _: Timeout) {}

    fn handle_error(self: Box<Self>, _: &mut MessageDispatcher, _: DispatchError) {}
}

#[derive(Debug, Clone)]
/// An incoming request.
pub struct Request {
    pub message: Message,
    pub from: SocketAddr,
}

impl Request {
    /// The sender as a contact, `None` for anonymous requests.
    pub fn contact(&self) -> Option<Contact> {
        self.message.node_id.map(|node_id| {
            Contact::new(node_id, self.from).with_vendor(self.message.vendor, self.message.version)
        })
    }
}

/// Answers one type of request. Runs on the dispatcher thread, so it must not block.
pub trait RequestHandler: Debug + Send {
    /// Returns the response body, or `None` to stay silent.
    fn handle_request(&mut self, request: &Request) -> Option<MessageBody>;
}

/// Decides whether an incoming request is processed at all.
pub trait RequestFilter: Debug + Send {
    /// Returns true if the request from this source is allowed.
    fn allow_request(&self, request: &Request) -> bool;
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DefaultFilter;

impl RequestFilter for DefaultFilter {
    fn allow_request(&self, _request: &Request) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters kept by the [DefaultHandler].
pub struct Statistics {
    pub requests_received: u64,
    pub responses_received: u64,
    pub late_responses: u64,
    pub timeouts: u64,
    pub dropped: u64,
}

#[derive(Debug)]
/// Liveness and statistics bookkeeping that runs for every message,
/// before any registered handler.
pub struct DefaultHandler {
    route_table: SharedRouteTable,
    allow_private_addresses: bool,
    required_ratio: f64,
    statistics: Statistics,
}

impl DefaultHandler {
    pub fn new(
        route_table: SharedRouteTable,
        allow_private_addresses: bool,
        required_ratio: f64,
    ) -> Self {
        DefaultHandler {
            route_table,
            allow_private_addresses,
            required_ratio,
            statistics: Statistics::default(),
        }
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics
    }

    /// A request tells us the sender is alive and willing to talk.
    pub fn handle_request(&mut self, request: &Request) {
        self.statistics.requests_received += 1;

        if let Some(contact) = request.contact() {
            self.add_if_valid(contact);
        }
    }

    /// A correlated response refreshes or adds the responder.
    pub fn handle_response(&mut self, response: &Response) {
        self.statistics.responses_received += 1;

        if let Some(node_id) = response.message.node_id {
            let mut table = self.route_table.write().unwrap_or_else(|e| e.into_inner());

            if !table.touch(&node_id, Some(response.round_trip_time)) {
                let mut contact = Contact::new(node_id, response.from)
                    .with_vendor(response.message.vendor, response.message.version);
                contact.set_round_trip_time(response.round_trip_time);

                if contacts::is_valid_contact(&contact, &contact, self.allow_private_addresses) {
                    table.add(contact);
                }
            }
        }

        if let MessageBody::FindNodeResponse(found) = &response.message.body {
            self.add_found(response, &found.contacts);
        }
    }

    pub fn handle_timeout(&mut self, timeout: &Timeout) {
        if timeout.cancelled {
            return;
        }

        self.statistics.timeouts += 1;

        if let Some(node_id) = timeout.node_id {
            self.route_table
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .handle_failure(&node_id);
        }
    }

    /// A response no receipt is waiting for.
    ///
    /// Refreshes a known contact if it responded from the address we know it by.
    /// Returns `true` if a contact was refreshed.
    pub fn handle_late_response(&mut self, message: &Message, from: SocketAddr) -> bool {
        self.statistics.late_responses += 1;

        let Some(node_id) = message.node_id else {
            trace!(?from, "Late anonymous response");
            return false;
        };

        let mut table = self.route_table.write().unwrap_or_else(|e| e.into_inner());

        match table.get(&node_id) {
            Some(contact) if contact.same_address(&from) => table.touch(&node_id, None),
            Some(contact) => {
                debug!(
                    ?node_id,
                    ?from,
                    known = ?contact.address(),
                    "Late response from an unexpected address"
                );
                false
            }
            None => {
                trace!(?node_id, ?from, "Late response from an unknown contact");
                false
            }
        }
    }

    pub fn handle_dropped(&mut self) {
        self.statistics.dropped += 1;
    }

    /// Admits the contacts of a FIND_NODE response, if enough of them pass validation.
    fn add_found(&mut self, response: &Response, found: &[Contact]) {
        let Some(sender_id) = response.message.node_id else {
            return;
        };
        let sender = Contact::new(sender_id, response.from);

        let mut table = self.route_table.write().unwrap_or_else(|e| e.into_inner());
        let local = table.local_node().clone();

        let scrubbed = contacts::scrub(
            &local,
            &sender,
            found,
            self.required_ratio,
            self.allow_private_addresses,
        );

        for collision in &scrubbed.collisions {
            warn!(
                sender = ?sender_id,
                address = ?collision.address(),
                "Another node claims the local node id"
            );
        }

        if !scrubbed.valid {
            return;
        }

        for contact in scrubbed.scrubbed {
            if table.get(contact.node_id()).is_none() {
                table.add(contact);
            }
        }
    }

    fn add_if_valid(&mut self, contact: Contact) {
        if contacts::is_valid_contact(&contact, &contact, self.allow_private_addresses) {
            self.route_table
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .add(contact);
        }
    }
}
