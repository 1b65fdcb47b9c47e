use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{Kuid, Message};

use super::{DispatcherEvent, MessageDispatcher};

impl MessageDispatcher {
    pub(super) fn handle_response(&mut self, message: Message, from: SocketAddr) {
        trace!(
            context = "dispatcher_response",
            ?message,
            ?from,
            "Received response message"
        );

        let Some(message_id) = message.message_id else {
            debug!(?from, "Dropping response without a message id");
            self.default_handler.handle_dropped();
            self.emit(DispatcherEvent::Dropped {
                from,
                reason: "missing message id",
            });
            return;
        };

        if let Some(receipt) =
            self.receipts
                .take_for_response(&message_id, &from, message.node_id.as_ref())
        {
            let (handler, response) = receipt.into_response(message, from, Instant::now());

            self.default_handler.handle_response(&response);
            handler.handle_response(self, response);
            return;
        }

        if self.receipts.contains(&message_id) {
            debug!(
                ?message_id,
                ?from,
                node_id = ?message.node_id,
                "Response from an unexpected node or address"
            );
            self.default_handler.handle_dropped();
            self.emit(DispatcherEvent::Dropped {
                from,
                reason: "unexpected responder",
            });
            return;
        }

        self.handle_late_response(message, message_id, from);
    }

    /// A response to a request that already timed out, or was never sent.
    fn handle_late_response(&mut self, message: Message, message_id: Kuid, from: SocketAddr) {
        let refreshed = if self.message_ids.verify(&message_id, from) {
            self.default_handler.handle_late_response(&message, from)
        } else {
            debug!(?message_id, ?from, "Discarding unsolicited response");
            false
        };

        trace!(?from, refreshed, "Late response");
        self.emit(DispatcherEvent::LateResponse { from, refreshed });
    }
}
