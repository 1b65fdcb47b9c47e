//! Store operation: FIND_NODE each of the k closest contacts for a query key,
//! then STORE the value with it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::common::{
    Contact, FindNodeRequest, Kuid, MessageBody, SelectMode, SharedRouteTable, StoreRequest,
    StoreStatusCode, WireValue,
};
use crate::db::DhtValueEntity;
use crate::rpc::{Callback, DispatcherHandle, MessageDispatcher, Outcome};

use super::StoreError;

/// Called once with the number of nodes that accepted the value.
pub type StoreCallback = Box<dyn FnOnce(Result<usize, StoreError>) + Send>;

/// Stores a value in the DHT.
pub trait Storer: Send {
    /// Starts storing `entity`, calling `done` exactly once when finished.
    fn store(&mut self, entity: DhtValueEntity, done: StoreCallback);
}

#[derive(Debug, Clone)]
/// Stores values at the `k` closest alive contacts in the routing table.
pub struct KClosestStorer {
    dispatcher: DispatcherHandle,
    route_table: SharedRouteTable,
    k: usize,
}

impl KClosestStorer {
    pub fn new(dispatcher: DispatcherHandle, route_table: SharedRouteTable, k: usize) -> Self {
        KClosestStorer {
            dispatcher,
            route_table,
            k,
        }
    }

    fn closest(&self, key: &Kuid) -> Vec<Contact> {
        let table = self.route_table.read().unwrap_or_else(|e| e.into_inner());
        let local_id = *table.local_node().node_id();

        table
            .select(key, self.k + 1, SelectMode::Alive)
            .into_iter()
            .filter(|contact| contact.node_id() != &local_id)
            .take(self.k)
            .collect()
    }
}

impl Storer for KClosestStorer {
    fn store(&mut self, entity: DhtValueEntity, done: StoreCallback) {
        let contacts = self.closest(entity.primary_key());

        if contacts.is_empty() {
            done(Err(StoreError::NoContacts));
            return;
        }

        trace!(
            primary_key = ?entity.primary_key(),
            contacts = contacts.len(),
            "Storing value"
        );

        let operation = Arc::new(Mutex::new(StoreOperation {
            remaining: contacts.len(),
            stored: 0,
            last_error: None,
            done: Some(done),
        }));
        let value = entity.to_wire();

        for contact in contacts {
            let node_id = *contact.node_id();
            let address = contact.address();
            let operation_ = operation.clone();
            let value = value.clone();

            let result = self.dispatcher.send(
                Some(node_id),
                address,
                MessageBody::FindNodeRequest(FindNodeRequest {
                    target: value.primary_key,
                }),
                Callback::new(move |dispatcher: &mut MessageDispatcher, outcome| {
                    match outcome {
                        Outcome::Response(response) => match response.message.body {
                            MessageBody::FindNodeResponse(found) => send_store(
                                dispatcher,
                                node_id,
                                address,
                                found.query_key,
                                value,
                                operation_,
                            ),
                            _ => StoreOperation::complete(&operation_, Err(StoreError::Rejected)),
                        },
                        outcome => StoreOperation::complete(&operation_, Err(failure(outcome))),
                    }
                }),
            );

            if let Err(error) = result {
                StoreOperation::complete(&operation, Err(error.into()));
            }
        }
    }
}

/// Second step, sent from the dispatcher thread with the query key just received.
fn send_store(
    dispatcher: &mut MessageDispatcher,
    node_id: Kuid,
    address: SocketAddr,
    query_key: Vec<u8>,
    value: WireValue,
    operation: Arc<Mutex<StoreOperation>>,
) {
    let primary_key = value.primary_key;
    let secondary_key = *value.secondary_key();
    let operation_ = operation.clone();

    let result = dispatcher.send(
        Some(node_id),
        address,
        MessageBody::StoreRequest(StoreRequest {
            query_key,
            values: vec![value],
        }),
        Callback::new(move |_: &mut MessageDispatcher, outcome| {
            let result = match outcome {
                Outcome::Response(response) => match response.message.body {
                    MessageBody::StoreResponse(store) => {
                        let stored = store.statuses.iter().any(|status| {
                            status.primary_key == primary_key
                                && status.secondary_key == secondary_key
                                && status.code == StoreStatusCode::Succeeded
                        });

                        if stored {
                            Ok(())
                        } else {
                            debug!(?node_id, ?primary_key, "Node refused to store the value");
                            Err(StoreError::Rejected)
                        }
                    }
                    _ => Err(StoreError::Rejected),
                },
                outcome => Err(failure(outcome)),
            };

            StoreOperation::complete(&operation_, result);
        }),
    );

    if let Err(error) = result {
        StoreOperation::complete(&operation, Err(error.into()));
    }
}

fn failure(outcome: Outcome) -> StoreError {
    match outcome {
        Outcome::Timeout(timeout) if timeout.cancelled => StoreError::Cancelled,
        Outcome::Timeout(_) => StoreError::Timeout,
        Outcome::Error(error) => StoreError::Dispatch(error),
        Outcome::Response(_) => StoreError::Rejected,
    }
}

/// Progress of one value being stored at several contacts.
struct StoreOperation {
    remaining: usize,
    stored: usize,
    last_error: Option<StoreError>,
    done: Option<StoreCallback>,
}

impl StoreOperation {
    /// Records the outcome for one contact, and calls `done` after the last one.
    fn complete(operation: &Mutex<StoreOperation>, result: Result<(), StoreError>) {
        let finished = {
            let mut operation = operation.lock().unwrap_or_else(|e| e.into_inner());

            match result {
                Ok(()) => operation.stored += 1,
                Err(error) => operation.last_error = Some(error),
            }
            operation.remaining = operation.remaining.saturating_sub(1);

            if operation.remaining == 0 {
                let result = if operation.stored > 0 {
                    Ok(operation.stored)
                } else {
                    Err(operation.last_error.take().unwrap_or(StoreError::Timeout))
                };

                operation.done.take().map(|done| (done, result))
            } else {
                None
            }
        };

        if let Some((done, result)) = finished {
            done(result);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    type Completions = flume::Receiver<Result<usize, StoreError>>;

    fn operation(remaining: usize) -> (Arc<Mutex<StoreOperation>>, Completions) {
        let (sender, receiver) = flume::unbounded();

        let operation = Arc::new(Mutex::new(StoreOperation {
            remaining,
            stored: 0,
            last_error: None,
            done: Some(Box::new(move |result: Result<usize, StoreError>| {
                let _ = sender.send(result);
            })),
        }));

        (operation, receiver)
    }

    #[test]
    fn completes_after_every_contact() {
        let (operation, receiver) = operation(3);

        StoreOperation::complete(&operation, Ok(()));
        StoreOperation::complete(&operation, Err(StoreError::Timeout));
        assert!(receiver.try_recv().is_err());

        StoreOperation::complete(&operation, Ok(()));
        assert!(matches!(receiver.try_recv(), Ok(Ok(2))));

        // Extra completions never call back twice
        StoreOperation::complete(&operation, Ok(()));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn fails_with_last_error() {
        let (operation, receiver) = operation(2);

        StoreOperation::complete(&operation, Err(StoreError::Timeout));
        StoreOperation::complete(&operation, Err(StoreError::Rejected));

        assert!(matches!(receiver.try_recv(), Ok(Err(StoreError::Rejected))));
    }
}
