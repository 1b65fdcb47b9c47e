//! Values stored on one node reach its closest contacts.

use std::thread;
use std::time::{Duration, Instant};

use kadmos::{DhtValue, Kuid, Testnet, ValueType, Version};

fn wait_for(done: impl Fn() -> bool) {
    let start = Instant::now();

    while !done() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn local_value_is_published() {
    let testnet = Testnet::new(3).unwrap();
    let (a, b, c) = (&testnet.nodes[0], &testnet.nodes[1], &testnet.nodes[2]);

    let key = Kuid::sha1(b"replicated");
    let value = DhtValue::new(ValueType::TEXT, Version::ZERO, "hello");

    assert!(a.store_local(key, value.clone()));

    wait_for(|| {
        b.get_local(&key) == vec![value.clone()] && c.get_local(&key) == vec![value.clone()]
    });

    let database = b.database().lock().unwrap();
    let entity = database.get_value(&key, a.local_id()).unwrap();

    assert!(!entity.is_local());
    assert!(entity.is_direct());
    assert_eq!(entity.creator().address(), a.local_addr());
    drop(database);

    // The creator records where its value landed
    wait_for(|| {
        a.database()
            .lock()
            .unwrap()
            .get_value(&key, a.local_id())
            .map(|entity| entity.locations() == 2)
            .unwrap_or(false)
    });
}

#[test]
fn values_stay_out_of_reach_without_contacts() {
    let testnet = Testnet::new(1).unwrap();
    let node = &testnet.nodes[0];

    let key = Kuid::sha1(b"lonely");
    let value = DhtValue::new(ValueType::TEXT, Version::ZERO, "alone");

    assert!(node.store_local(key, value.clone()));
    thread::sleep(Duration::from_millis(100));

    let database = node.database().lock().unwrap();
    let entity = database.get_value(&key, node.local_id()).unwrap();

    assert!(entity.is_local());
    assert!(!entity.has_been_published());
}
