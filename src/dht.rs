//! Dht node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use flume::Receiver;
use tracing::{debug, error, info};

use crate::common::{
    Contact, DhtValue, FindNodeRequest, Kuid, MessageBody, RoutingTable, SharedRouteTable,
};
use crate::db::{self, Database, DhtValueEntity, SharedDatabase};
use crate::republish::{DatabasePublisher, KClosestStorer, RepublishTask};
use crate::rpc::{
    Callback, Config, DispatchError, DispatcherHandle, MessageDispatcher, Outcome, Response,
};
use crate::server::DefaultServer;
use crate::{Error, Result};

#[derive(Debug)]
/// A node: the message dispatcher running on its own thread, the default
/// request handlers, the local database, and the republish task.
pub struct Dht {
    local: Contact,
    dispatcher: DispatcherHandle,
    route_table: SharedRouteTable,
    database: SharedDatabase,

    handle: Option<JoinHandle<()>>,
    republish: Option<RepublishTask>,
}

impl Dht {
    /// Binds a node and starts its threads.
    pub fn new(config: Config) -> Result<Self> {
        let bind_address = SocketAddr::new(
            config
                .bind_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            config.port.unwrap_or(0),
        );
        let local_id = config.local_id.unwrap_or_else(Kuid::random);

        let route_table = RoutingTable::new(
            Contact::new(local_id, bind_address).with_vendor(config.vendor, config.version),
        )
        .shared();
        let database: SharedDatabase = Arc::new(Mutex::new(Database::new(config.database.clone())));

        let mut dispatcher = MessageDispatcher::new(&config, route_table.clone());
        let local_addr = dispatcher.bind(bind_address)?;

        route_table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update_local_address(local_addr);

        let k = config.republish.replication_parameter;
        DefaultServer::new(route_table.clone(), database.clone(), k).register(&mut dispatcher);

        let handle = dispatcher.handle();
        dispatcher.start()?;

        let dispatcher_thread = thread::Builder::new()
            .name("kadmos-dispatcher".to_string())
            .spawn(move || {
                if let Err(error) = dispatcher.run() {
                    error!(?error, "Dispatcher stopped");
                }
            })?;

        let republish = RepublishTask::spawn(
            DatabasePublisher::new(
                database.clone(),
                route_table.clone(),
                &config.database,
                config.republish.clone(),
            ),
            KClosestStorer::new(handle.clone(), route_table.clone(), k),
            config.republish.period,
        )?;

        let local = Contact::new(local_id, local_addr).with_vendor(config.vendor, config.version);
        info!(?local_id, ?local_addr, "Dht node started");

        Ok(Dht {
            local,
            dispatcher: handle,
            route_table,
            database,

            handle: Some(dispatcher_thread),
            republish: Some(republish),
        })
    }

    // === Getters ===

    pub fn local_id(&self) -> &Kuid {
        self.local.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.address()
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    pub fn route_table(&self) -> &SharedRouteTable {
        &self.route_table
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.database
    }

    /// Handle to send requests through this node's dispatcher.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    // === Public Methods ===

    /// Adds a known contact to the routing table, returning `true` if it was added.
    pub fn add_contact(&self, contact: Contact) -> bool {
        self.route_table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add(contact)
    }

    /// Pings a node at `address`, blocking until it responds or the request times out.
    pub fn ping(&self, address: SocketAddr) -> Result<Response> {
        let receiver = self.request(None, address, MessageBody::PingRequest)?;

        match receiver.recv() {
            Ok(outcome) => response(outcome),
            Err(_) => Err(DispatchError::NotRunning.into()),
        }
    }

    /// Asks a single node for the contacts it knows closest to `target`.
    pub fn find_node(&self, address: SocketAddr, target: Kuid) -> Result<Vec<Contact>> {
        let receiver = self.request(
            None,
            address,
            MessageBody::FindNodeRequest(FindNodeRequest { target }),
        )?;

        let response = match receiver.recv() {
            Ok(outcome) => response(outcome)?,
            Err(_) => return Err(DispatchError::NotRunning.into()),
        };

        match response.message.body {
            MessageBody::FindNodeResponse(found) => Ok(found.contacts),
            body => Err(Error::UnexpectedResponse(body.message_type())),
        }
    }

    /// Stores a value created by this node, and schedules its publishing.
    ///
    /// An empty value removes the local value under `key`.
    pub fn store_local(&self, key: Kuid, value: DhtValue) -> bool {
        let entity = DhtValueEntity::local(self.local.clone(), key, value);
        let stored = db::lock(&self.database).add(entity);

        if stored {
            if let Some(republish) = &self.republish {
                republish.trigger();
            }
        }

        stored
    }

    /// Values stored locally under `key`, by any creator.
    pub fn get_local(&self, key: &Kuid) -> Vec<DhtValue> {
        let mut entities: Vec<DhtValueEntity> = db::lock(&self.database)
            .get(key)
            .into_values()
            .collect();
        entities.sort_by_key(|entity| *entity.secondary_key());

        entities
            .into_iter()
            .map(|entity| entity.value().clone())
            .collect()
    }

    /// Stops the republish task and the dispatcher, and waits for both threads.
    ///
    /// Every pending request is cancelled before this returns.
    pub fn shutdown(&mut self) {
        if let Some(mut republish) = self.republish.take() {
            republish.cancel();
        }

        if let Some(handle) = self.handle.take() {
            self.dispatcher.shutdown();
            let _ = handle.join();

            debug!(local_id = ?self.local.node_id(), "Dht node stopped");
        }
    }

    // === Private Methods ===

    pub(crate) fn request(
        &self,
        node_id: Option<Kuid>,
        address: SocketAddr,
        body: MessageBody,
    ) -> Result<Receiver<Outcome>> {
        let (sender, receiver) = flume::bounded(1);

        self.dispatcher.send(
            node_id,
            address,
            body,
            Callback::new(move |_: &mut MessageDispatcher, outcome| {
                let _ = sender.send(outcome);
            }),
        )?;

        Ok(receiver)
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn response(outcome: Outcome) -> Result<Response> {
    match outcome {
        Outcome::Response(response) => Ok(response),
        Outcome::Timeout(timeout) if timeout.cancelled => Err(DispatchError::NotRunning.into()),
        Outcome::Timeout(_) => Err(Error::Timeout),
        Outcome::Error(error) => Err(error.into()),
    }
}

#[derive(Debug)]
/// Local nodes that know each other, for tests.
pub struct Testnet {
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Starts `count` nodes on localhost, each with every other node in its routing table.
    pub fn new(count: usize) -> Result<Testnet> {
        Self::with_config(count, Config::localhost())
    }

    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let mut nodes = Vec::with_capacity(count);

        for _ in 0..count {
            nodes.push(Dht::new(config.clone())?);
        }

        for node in &nodes {
            for other in &nodes {
                if node.local_id() != other.local_id() {
                    node.add_contact(other.local_contact().clone());
                }
            }
        }

        Ok(Testnet { nodes })
    }
}
