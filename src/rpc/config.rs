use std::{net::IpAddr, time::Duration};

use crate::common::{Kuid, MAX_MESSAGE_SIZE};
use crate::contacts::DEFAULT_REQUIRED_RATIO;
use crate::db::DatabaseSettings;
use crate::republish::RepublishSettings;

use super::receipts::DEFAULT_RECEIPT_CAPACITY;
use super::{
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_SENDS_PER_TICK, DEFAULT_REQUEST_TIMEOUT, VENDOR,
    VERSION,
};

#[derive(Debug, Clone)]
/// Node configurations
pub struct Config {
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where the OS picks a free port.
    pub port: Option<u16>,
    /// Ip address to bind the socket to.
    ///
    /// Defaults to None, where all IPv4 interfaces are used.
    pub bind_address: Option<IpAddr>,
    /// Node id of the local node.
    ///
    /// Defaults to None, where a random id is generated.
    pub local_id: Option<Kuid>,
    /// Vendor tag written in every message header.
    pub vendor: u32,
    /// Protocol version written in every message header.
    pub version: u16,
    /// How long to wait for a response before timing out a request,
    /// unless its handler asks for a different timeout.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Maximum encoded size of outgoing messages and accepted datagrams.
    ///
    /// Defaults to [MAX_MESSAGE_SIZE]
    pub max_message_size: usize,
    /// Maximum number of requests awaiting a response.
    /// Past this, the oldest request is timed out.
    ///
    /// Defaults to [DEFAULT_RECEIPT_CAPACITY]
    pub receipt_capacity: usize,
    /// Maximum datagrams written per dispatcher iteration, so reads are not starved.
    ///
    /// Defaults to [DEFAULT_MAX_SENDS_PER_TICK]
    pub max_sends_per_tick: usize,
    /// Interval between sweeps for timed out requests.
    ///
    /// Defaults to [DEFAULT_CLEANUP_INTERVAL]
    pub cleanup_interval: Duration,
    /// Accept contacts with private, loopback or link local addresses.
    /// Useful for LAN and local testing.
    ///
    /// Defaults to false
    pub allow_private_addresses: bool,
    /// Fraction of a batch of contacts that must pass validation for the batch to be trusted.
    ///
    /// Defaults to [DEFAULT_REQUIRED_RATIO]
    pub required_scrub_ratio: f64,
    pub database: DatabaseSettings,
    pub republish: RepublishSettings,
}

impl Config {
    /// Configuration for a node bound to localhost, accepting private addresses.
    pub fn localhost() -> Self {
        Config {
            bind_address: Some(IpAddr::from([127, 0, 0, 1])),
            allow_private_addresses: true,
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            bind_address: None,
            local_id: None,
            vendor: VENDOR,
            version: VERSION,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            receipt_capacity: DEFAULT_RECEIPT_CAPACITY,
            max_sends_per_tick: DEFAULT_MAX_SENDS_PER_TICK,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            allow_private_addresses: false,
            required_scrub_ratio: DEFAULT_REQUIRED_RATIO,
            database: DatabaseSettings::default(),
            republish: RepublishSettings::default(),
        }
    }
}
