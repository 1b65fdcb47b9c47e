//! Bookkeeping for requests awaiting a response.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

use crate::common::{Kuid, Message, MessageType};

use super::handler::{Response, ResponseHandler, Timeout};

/// Default maximum number of requests awaiting a response.
pub const DEFAULT_RECEIPT_CAPACITY: usize = 512;

/// One outbound request, from the moment it is queued until its handler
/// receives a response, a timeout or an error.
pub struct Receipt {
    node_id: Option<Kuid>,
    address: SocketAddr,
    message_id: Kuid,
    request: MessageType,
    payload: Option<Bytes>,
    timeout: Duration,
    handler: Box<dyn ResponseHandler>,
    sent_at: Option<Instant>,
    received_at: Option<Instant>,
}

impl Receipt {
    pub(crate) fn new(
        node_id: Option<Kuid>,
        address: SocketAddr,
        message_id: Kuid,
        request: MessageType,
        payload: Bytes,
        timeout: Duration,
        handler: Box<dyn ResponseHandler>,
    ) -> Self {
        Receipt {
            node_id,
            address,
            message_id,
            request,
            payload: Some(payload),
            timeout,
            handler,
            sent_at: None,
            received_at: None,
        }
    }

    // === Getters ===

    /// Destination node id, `None` for anonymous requests.
    pub fn node_id(&self) -> Option<&Kuid> {
        self.node_id.as_ref()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn message_id(&self) -> &Kuid {
        &self.message_id
    }

    pub fn request(&self) -> MessageType {
        self.request
    }

    /// Encoded request, `None` once it was written to the socket.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn received_at(&self) -> Option<Instant> {
        self.received_at
    }

    // === Public Methods ===

    /// Round trip time, once both sent and received.
    pub fn round_trip_time(&self) -> Option<Duration> {
        match (self.sent_at, self.received_at) {
            (Some(sent), Some(received)) => Some(received.saturating_duration_since(sent)),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.sent_at {
            Some(sent) => now.saturating_duration_since(sent) >= self.timeout,
            None => false,
        }
    }

    /// Returns `true` if a response `from` this address, claiming `node_id`,
    /// may answer this request.
    pub fn matches(&self, from: &SocketAddr, node_id: Option<&Kuid>) -> bool {
        let Some(expected) = &self.node_id else {
            // Anonymous requests accept a response from anyone.
            return true;
        };

        if node_id != Some(expected) {
            return false;
        }

        if self.address.port() != from.port() {
            return false;
        }

        self.address.ip().is_unspecified() || self.address.ip() == from.ip()
    }

    // === Lifecycle ===

    /// Marks the payload as written, starting the timeout clock.
    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
        self.payload = None;
    }

    pub(crate) fn into_response(
        mut self,
        message: Message,
        from: SocketAddr,
        now: Instant,
    ) -> (Box<dyn ResponseHandler>, Response) {
        self.received_at = Some(now);
        let round_trip_time = self.round_trip_time().unwrap_or_default();

        (
            self.handler,
            Response {
                message,
                from,
                round_trip_time,
            },
        )
    }

    pub(crate) fn into_timeout(
        self,
        now: Instant,
        cancelled: bool,
    ) -> (Box<dyn ResponseHandler>, Timeout) {
        let elapsed = self
            .sent_at
            .map(|sent| now.saturating_duration_since(sent))
            .unwrap_or_default();

        (
            self.handler,
            Timeout {
                message_id: self.message_id,
                node_id: self.node_id,
                address: self.address,
                request: self.request,
                elapsed,
                cancelled,
            },
        )
    }

    pub(crate) fn into_handler(self) -> Box<dyn ResponseHandler> {
        self.handler
    }
}

impl std::fmt::Debug for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("message_id", &self.message_id)
            .field("request", &self.request)
            .field("timeout", &self.timeout)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}

#[derive(Debug)]
/// Sent requests awaiting a response, keyed by message id.
///
/// Bounded: registering past capacity evicts the oldest receipt, which the
/// caller must treat as timed out.
pub struct PendingRequestTable {
    // Only ever read with `peek` and `pop`, so the LRU order is the insertion order.
    receipts: LruCache<Kuid, Receipt>,
}

impl PendingRequestTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        PendingRequestTable {
            receipts: LruCache::new(capacity),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.receipts.cap().get()
    }

    pub fn contains(&self, message_id: &Kuid) -> bool {
        self.receipts.contains(message_id)
    }

    // === Public Methods ===

    /// Registers a sent receipt, returning the receipt it displaced, if any.
    pub fn register(&mut self, receipt: Receipt) -> Option<Receipt> {
        self.receipts
            .push(receipt.message_id, receipt)
            .map(|(_, displaced)| displaced)
    }

    /// Removes and returns the receipt for this message id.
    pub fn take_for_message_id(&mut self, message_id: &Kuid) -> Option<Receipt> {
        self.receipts.pop(message_id)
    }

    /// Removes and returns the receipt for this message id, only if a response
    /// from `from` claiming `node_id` may answer it.
    pub fn take_for_response(
        &mut self,
        message_id: &Kuid,
        from: &SocketAddr,
        node_id: Option<&Kuid>,
    ) -> Option<Receipt> {
        if self.receipts.peek(message_id)?.matches(from, node_id) {
            self.receipts.pop(message_id)
        } else {
            None
        }
    }

    /// Removes and returns every receipt whose timeout elapsed by `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Receipt> {
        let expired: Vec<Kuid> = self
            .receipts
            .iter()
            .filter(|(_, receipt)| receipt.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        expired
            .iter()
            .filter_map(|id| self.receipts.pop(id))
            .collect()
    }

    /// Removes every receipt, oldest first.
    pub fn drain(&mut self) -> Vec<Receipt> {
        let mut receipts = Vec::with_capacity(self.receipts.len());
        while let Some((_, receipt)) = self.receipts.pop_lru() {
            receipts.push(receipt);
        }
        receipts
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::rpc::handler::Ignore;

    fn receipt(timeout: Duration) -> Receipt {
        let mut receipt = Receipt::new(
            Some(Kuid::random()),
            SocketAddr::from(([127, 0, 0, 1], 5000)),
            Kuid::random(),
            MessageType::PingRequest,
            Bytes::from_static(&[1, 2, 3]),
            timeout,
            Box::new(Ignore),
        );
        receipt.mark_sent(Instant::now());
        receipt
    }

    #[test]
    fn payload_is_freed_once_sent() {
        let receipt = Receipt::new(
            None,
            SocketAddr::from(([127, 0, 0, 1], 5000)),
            Kuid::random(),
            MessageType::PingRequest,
            Bytes::from_static(&[1]),
            Duration::from_secs(1),
            Box::new(Ignore),
        );
        assert!(receipt.payload().is_some());
        assert!(!receipt.is_expired(Instant::now() + Duration::from_secs(10)));

        let mut receipt = receipt;
        receipt.mark_sent(Instant::now());
        assert!(receipt.payload().is_none());
    }

    #[test]
    fn take_for_message_id() {
        let mut table = PendingRequestTable::new(10);
        let receipt = receipt(Duration::from_secs(1));
        let id = *receipt.message_id();

        assert!(table.register(receipt).is_none());
        assert!(table.contains(&id));

        assert!(table.take_for_message_id(&id).is_some());
        assert!(table.take_for_message_id(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn response_must_come_from_destination() {
        let mut table = PendingRequestTable::new(10);
        let receipt = receipt(Duration::from_secs(1));
        let id = *receipt.message_id();
        let node_id = *receipt.node_id().unwrap();
        let address = receipt.address();

        table.register(receipt);

        let other = SocketAddr::from(([127, 0, 0, 2], 5000));
        assert!(table.take_for_response(&id, &other, Some(&node_id)).is_none());
        assert!(table
            .take_for_response(&id, &address, Some(&Kuid::random()))
            .is_none());
        assert!(table.contains(&id));

        assert!(table.take_for_response(&id, &address, Some(&node_id)).is_some());
    }

    #[test]
    fn anonymous_accepts_anyone() {
        let mut receipt = Receipt::new(
            None,
            SocketAddr::from(([127, 0, 0, 1], 5000)),
            Kuid::random(),
            MessageType::PingRequest,
            Bytes::new(),
            Duration::from_secs(1),
            Box::new(Ignore),
        );
        receipt.mark_sent(Instant::now());

        assert!(receipt.matches(&SocketAddr::from(([10, 0, 0, 1], 1)), Some(&Kuid::random())));
    }

    #[test]
    fn evicts_oldest() {
        let mut table = PendingRequestTable::new(2);

        let first = receipt(Duration::from_secs(1));
        let first_id = *first.message_id();
        let second = receipt(Duration::from_secs(1));
        let second_id = *second.message_id();

        table.register(first);
        table.register(second);

        // Lookups do not refresh the eviction order
        assert!(table
            .take_for_response(&first_id, &SocketAddr::from(([1, 1, 1, 1], 1)), None)
            .is_none());

        let evicted = table.register(receipt(Duration::from_secs(1))).unwrap();
        assert_eq!(evicted.message_id(), &first_id);
        assert!(table.contains(&second_id));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sweep_expired() {
        let mut table = PendingRequestTable::new(10);

        let short = receipt(Duration::from_millis(100));
        let short_id = *short.message_id();
        table.register(short);
        table.register(receipt(Duration::from_secs(60)));

        assert!(table.sweep_expired(Instant::now()).is_empty());

        let expired = table.sweep_expired(Instant::now() + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id(), &short_id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn every_receipt_ends_exactly_once() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut table = PendingRequestTable::new(3);
        let mut ids = vec![];

        for i in 0..6u64 {
            let receipt = receipt(Duration::from_millis(10 * (i + 1)));
            ids.push(*receipt.message_id());

            if let Some(evicted) = table.register(receipt) {
                outcomes.lock().unwrap().push(*evicted.message_id());
            }
        }

        if let Some(receipt) = table.take_for_message_id(&ids[4]) {
            outcomes.lock().unwrap().push(*receipt.message_id());
        }
        for receipt in table.sweep_expired(Instant::now() + Duration::from_millis(55)) {
            outcomes.lock().unwrap().push(*receipt.message_id());
        }
        for receipt in table.drain() {
            outcomes.lock().unwrap().push(*receipt.message_id());
        }

        let mut outcomes = outcomes.lock().unwrap().clone();
        outcomes.sort();
        ids.sort();
        assert_eq!(outcomes, ids);
    }
}
