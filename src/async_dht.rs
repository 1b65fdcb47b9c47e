//! AsyncDht node.

use std::net::SocketAddr;

use crate::common::{Contact, DhtValue, FindNodeRequest, Kuid, MessageBody};
use crate::dht::{response, Dht};
use crate::rpc::{DispatchError, Response};
use crate::{Error, Result};

impl Dht {
    /// Return an async version of the Dht node.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    pub fn local_id(&self) -> &Kuid {
        self.0.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }

    /// The blocking node behind this one.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    /// Pings a node at `address`.
    pub async fn ping(&self, address: SocketAddr) -> Result<Response> {
        let receiver = self.0.request(None, address, MessageBody::PingRequest)?;

        match receiver.recv_async().await {
            Ok(outcome) => response(outcome),
            Err(_) => Err(DispatchError::NotRunning.into()),
        }
    }

    /// Asks a single node for the contacts it knows closest to `target`.
    pub async fn find_node(&self, address: SocketAddr, target: Kuid) -> Result<Vec<Contact>> {
        let receiver = self.0.request(
            None,
            address,
            MessageBody::FindNodeRequest(FindNodeRequest { target }),
        )?;

        let response = match receiver.recv_async().await {
            Ok(outcome) => response(outcome)?,
            Err(_) => return Err(DispatchError::NotRunning.into()),
        };

        match response.message.body {
            MessageBody::FindNodeResponse(found) => Ok(found.contacts),
            body => Err(Error::UnexpectedResponse(body.message_type())),
        }
    }

    /// See [Dht::store_local]
    pub fn store_local(&self, key: Kuid, value: DhtValue) -> bool {
        self.0.store_local(key, value)
    }

    /// See [Dht::get_local]
    pub fn get_local(&self, key: &Kuid) -> Vec<DhtValue> {
        self.0.get_local(key)
    }

    /// Shutdown the dispatcher and republish threads.
    pub fn shutdown(&mut self) {
        self.0.shutdown();
    }
}
