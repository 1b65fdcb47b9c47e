//! Default request handlers of a node: PING, FIND_NODE, FIND_VALUE and STORE.

pub mod query_keys;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::common::{
    Contact, FindNodeResponse, FindValueRequest, FindValueResponse, Kuid, MessageBody,
    MessageType, PingResponse, SelectMode, SharedRouteTable, StoreRequest, StoreResponse,
    StoreStatus, StoreStatusCode, MAX_LIST_SIZE, MAX_MESSAGE_SIZE,
};
use crate::db::{self, DhtValueEntity, SharedDatabase};
use crate::rpc::handler::{Request, RequestHandler};
use crate::rpc::MessageDispatcher;

use query_keys::QueryKeys;

/// Encoded size of a value besides its payload: creator, primary key, type and version.
const VALUE_OVERHEAD: usize = 20 + 1 + 16 + 2 + 20 + 4 + 2 + 2;
/// Room left for values in a FIND_VALUE response.
const VALUES_BUDGET: usize = MAX_MESSAGE_SIZE - 512;

#[derive(Debug, Clone)]
/// Answers requests from the routing table and the database.
///
/// Cheap to clone, clones share the same state.
pub struct DefaultServer {
    route_table: SharedRouteTable,
    database: SharedDatabase,
    query_keys: Arc<Mutex<QueryKeys>>,
    k: usize,
}

impl DefaultServer {
    pub fn new(route_table: SharedRouteTable, database: SharedDatabase, k: usize) -> Self {
        DefaultServer {
            route_table,
            database,
            query_keys: Arc::new(Mutex::new(QueryKeys::new())),
            k,
        }
    }

    /// Registers this server for every request type.
    pub fn register(&self, dispatcher: &mut MessageDispatcher) {
        for message_type in [
            MessageType::PingRequest,
            MessageType::FindNodeRequest,
            MessageType::FindValueRequest,
            MessageType::StoreRequest,
        ] {
            dispatcher.register_handler(message_type, Box::new(self.clone()));
        }
    }

    // === Private Methods ===

    fn local_id(&self) -> Kuid {
        *self
            .route_table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .local_node()
            .node_id()
    }

    /// The `k` closest alive contacts to `target`, without the requester.
    fn closest(&self, target: &Kuid, requester: Option<&Kuid>) -> Vec<Contact> {
        self.route_table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .select(target, self.k + 1, SelectMode::Alive)
            .into_iter()
            .filter(|contact| Some(contact.node_id()) != requester)
            .take(self.k)
            .collect()
    }

    fn query_key(&self, from: SocketAddr) -> Vec<u8> {
        self.query_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generate(from)
            .to_vec()
    }

    fn find_node(&self, request: &Request, target: &Kuid) -> MessageBody {
        MessageBody::FindNodeResponse(FindNodeResponse {
            query_key: self.query_key(request.from),
            contacts: self.closest(target, request.message.node_id.as_ref()),
        })
    }

    fn find_value(&self, request: &Request, find: &FindValueRequest) -> MessageBody {
        let mut entities: Vec<DhtValueEntity> = db::lock(&self.database)
            .get(&find.target)
            .into_values()
            .filter(|entity| {
                find.secondary_keys.is_empty()
                    || find.secondary_keys.contains(entity.secondary_key())
            })
            .collect();

        if entities.is_empty() {
            return self.find_node(request, &find.target);
        }

        entities.sort_by_key(|entity| *entity.secondary_key());

        let mut values = Vec::new();
        let mut secondary_keys = Vec::new();
        let mut size = 0;

        for entity in entities {
            let encoded = VALUE_OVERHEAD + entity.value().len();

            if values.len() < MAX_LIST_SIZE && size + encoded <= VALUES_BUDGET {
                size += encoded;
                values.push(entity.to_wire());
            } else if secondary_keys.len() < MAX_LIST_SIZE {
                secondary_keys.push(*entity.secondary_key());
            }
        }

        MessageBody::FindValueResponse(FindValueResponse {
            secondary_keys,
            values,
        })
    }

    fn store(&self, request: &Request, store: &StoreRequest) -> MessageBody {
        let failed = |store: &StoreRequest| {
            MessageBody::StoreResponse(StoreResponse {
                statuses: store
                    .values
                    .iter()
                    .map(|value| StoreStatus {
                        primary_key: value.primary_key,
                        secondary_key: *value.secondary_key(),
                        code: StoreStatusCode::Failed,
                    })
                    .collect(),
            })
        };

        let Some(sender) = request.contact() else {
            debug!(from = ?request.from, "Anonymous store request");
            return failed(store);
        };

        let valid = self
            .query_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .validate(request.from, &store.query_key);

        if !valid {
            debug!(
                requester_id = ?sender.node_id(),
                from = ?request.from,
                "Invalid query key"
            );
            return failed(store);
        }

        let local_id = self.local_id();
        let mut database = db::lock(&self.database);

        let statuses = store
            .values
            .iter()
            .map(|value| {
                let primary_key = value.primary_key;
                let secondary_key = *value.secondary_key();

                let stored = secondary_key != local_id
                    && database
                        .store(DhtValueEntity::from_wire(value.clone(), sender.clone()))
                        .is_success();

                StoreStatus {
                    primary_key,
                    secondary_key,
                    code: if stored {
                        StoreStatusCode::Succeeded
                    } else {
                        StoreStatusCode::Failed
                    },
                }
            })
            .collect();

        MessageBody::StoreResponse(StoreResponse { statuses })
    }
}

impl RequestHandler for DefaultServer {
    fn handle_request(&mut self, request: &Request) -> Option<MessageBody> {
        match &request.message.body {
            MessageBody::PingRequest => Some(MessageBody::PingResponse(PingResponse {
                external_address: Some(request.from),
            })),
            MessageBody::FindNodeRequest(find) => Some(self.find_node(request, &find.target)),
            MessageBody::FindValueRequest(find) => Some(self.find_value(request, find)),
            MessageBody::StoreRequest(store) => Some(self.store(request, store)),
            _ => None,
        }
    }
}
