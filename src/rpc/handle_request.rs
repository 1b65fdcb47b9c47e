use std::net::SocketAddr;

use tracing::{debug, error, trace, warn};

use crate::common::{Kuid, Message, MessageBody};

use super::handler::Request;
use super::{DispatcherEvent, MessageDispatcher, Outgoing};

impl MessageDispatcher {
    /// Routes a decoded message to the request handlers or the pending requests.
    pub(super) fn handle_message(&mut self, message: Message, from: SocketAddr) {
        if message.node_id.as_ref() == Some(&self.local_id) {
            error!(
                ?from,
                message_type = ?message.message_type(),
                "Dropping message carrying the local node id"
            );
            self.default_handler.handle_dropped();
            self.emit(DispatcherEvent::Dropped {
                from,
                reason: "local node id",
            });
            return;
        }

        self.emit(DispatcherEvent::Received {
            message_id: message.message_id,
            from,
            message_type: message.message_type(),
        });

        if message.is_request() {
            self.handle_request(message, from);
        } else {
            self.handle_response(message, from);
        }
    }

    pub(super) fn handle_request(&mut self, message: Message, from: SocketAddr) {
        trace!(
            context = "dispatcher_request",
            ?message,
            ?from,
            "Received request message"
        );

        let request = Request { message, from };

        if !self.filter.allow_request(&request) {
            debug!(?from, request_type = ?request.message.message_type(), "Request filtered");
            self.emit(DispatcherEvent::Filtered { from });
            return;
        }

        self.default_handler.handle_request(&request);

        let message_type = request.message.message_type();
        let response = match self.request_handlers.get_mut(&message_type) {
            Some(handler) => handler.handle_request(&request),
            None => {
                debug!(?message_type, ?from, "No handler registered for request");
                None
            }
        };

        if let Some(body) = response {
            self.respond(from, request.message.message_id, body);
        }
    }

    /// Queues a response echoing the request's message id.
    pub(super) fn respond(&mut self, address: SocketAddr, message_id: Option<Kuid>, body: MessageBody) {
        if body.is_request() {
            warn!(message_type = ?body.message_type(), "Refusing to respond with a request");
            return;
        }

        let message_type = body.message_type();
        let message = Message {
            vendor: self.vendor,
            version: self.version,
            node_id: Some(self.local_id),
            message_id,
            body,
        };

        match message.to_bytes_with_limit(self.max_message_size) {
            Ok(payload) => {
                trace!(context = "dispatcher_sending", ?message, ?address);
                self.queue.push_back(Outgoing::Response {
                    address,
                    message_id,
                    message_type,
                    payload,
                });
            }
            Err(error) => {
                warn!(?error, ?message_type, ?address, "Failed to encode response");
            }
        }
    }
}
