//! When stored values expire, and when local values must be published again.

use std::time::{Duration, Instant};

use crate::common::{Bucket, Kuid, RouteTable, SelectMode, KUID_BITS};

use super::DhtValueEntity;

/// How long a value stored under `primary_key` is kept.
///
/// Nodes among the `k` closest to the key keep values for `default_ttl`.
/// Nodes further away keep them for a fraction of it, shrinking with the
/// number of leading bits the value's bucket shares with the local bucket.
pub fn time_to_live(
    route_table: &dyn RouteTable,
    primary_key: &Kuid,
    default_ttl: Duration,
    k: usize,
) -> Duration {
    let local_id = route_table.local_node().node_id();
    let closest = route_table.select(primary_key, k, SelectMode::All);

    if closest.len() < k || closest.iter().any(|contact| contact.node_id() == local_id) {
        return default_ttl;
    }

    distance_weighted_ttl(
        &route_table.bucket(local_id),
        &route_table.bucket(primary_key),
        default_ttl,
    )
}

/// `default_ttl` scaled by the depth at which the two buckets diverge over the local depth.
pub fn distance_weighted_ttl(local: &Bucket, value: &Bucket, default_ttl: Duration) -> Duration {
    let depth = local.depth.min(value.depth);
    let xor = local.id.truncate(depth).xor(&value.id.truncate(depth));

    let Some(lowest) = xor.lowest_set_bit() else {
        return default_ttl;
    };
    if local.depth == 0 {
        return default_ttl;
    }

    let divergence = KUID_BITS - lowest;
    let ratio = (divergence as f64 / local.depth as f64).min(1.0);

    default_ttl.mul_f64(ratio)
}

pub fn expiration_time(
    route_table: &dyn RouteTable,
    entity: &DhtValueEntity,
    default_ttl: Duration,
    k: usize,
) -> Instant {
    entity.creation_time() + time_to_live(route_table, entity.primary_key(), default_ttl, k)
}

/// Local values never expire.
pub fn is_expired(
    route_table: &dyn RouteTable,
    entity: &DhtValueEntity,
    default_ttl: Duration,
    k: usize,
    now: Instant,
) -> bool {
    if entity.is_local() {
        return false;
    }

    now >= expiration_time(route_table, entity, default_ttl, k)
}

/// A local value is due for publishing once its republish interval has elapsed.
///
/// Values stored at fewer of the `k` closest nodes are republished sooner,
/// but never more often than `min_interval`.
pub fn is_republishing_required(
    entity: &DhtValueEntity,
    republish_interval: Duration,
    min_interval: Duration,
    k: usize,
    now: Instant,
) -> bool {
    if !entity.is_local() {
        return false;
    }

    let Some(last_publish_time) = entity.last_publish_time() else {
        return true;
    };

    let locations = entity.locations().min(k) as u32;
    let interval = (republish_interval * locations / k.max(1) as u32).max(min_interval);

    now.saturating_duration_since(last_publish_time) >= interval
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{Contact, DhtValue, RoutingTable, ValueType, Version, MAX_BUCKET_SIZE_K};

    const TTL: Duration = Duration::from_secs(3600);

    fn bucket(id: Kuid, depth: usize) -> Bucket {
        Bucket {
            id: id.truncate(depth),
            depth,
        }
    }

    #[test]
    fn ttl_shrinks_with_distance() {
        let local = bucket(Kuid::MIN, 8);

        let mut previous = Duration::ZERO;
        for depth in 1..=7 {
            // Diverges from the local bucket at bit `depth - 1`
            let value = bucket(Kuid::MIN.set_bit(depth - 1), depth);
            let ttl = distance_weighted_ttl(&local, &value, TTL);

            assert!(ttl > previous, "ttl should grow as buckets get closer");
            assert!(ttl < TTL);
            previous = ttl;
        }

        assert_eq!(distance_weighted_ttl(&local, &local, TTL), TTL);
        assert_eq!(
            distance_weighted_ttl(&local, &bucket(Kuid::MAX, 1), TTL),
            TTL / 8
        );
    }

    #[test]
    fn empty_table_uses_default() {
        let table = RoutingTable::new(Contact::new(Kuid::MIN, SocketAddr::from(([1, 1, 1, 1], 1))));
        assert_eq!(time_to_live(&table, &Kuid::MAX, TTL, MAX_BUCKET_SIZE_K), TTL);
    }

    #[test]
    fn far_values_expire_sooner() {
        let mut table =
            RoutingTable::new(Contact::new(Kuid::MIN, SocketAddr::from(([1, 1, 1, 1], 1))));

        // Enough contacts in the far half of the id space to exclude the local node
        for i in 0..MAX_BUCKET_SIZE_K as u8 {
            let id = Kuid::random().set_bit(0);
            table.add(Contact::new(id, SocketAddr::from(([2, 2, i, 1], 1))));
        }
        // A contact sharing 7 bits with the local node
        table.add(Contact::new(
            Kuid::MIN.set_bit(7),
            SocketAddr::from(([3, 3, 3, 3], 1)),
        ));

        let far = time_to_live(&table, &Kuid::MAX, TTL, MAX_BUCKET_SIZE_K);
        assert_eq!(far, TTL / 8);

        // The local node is among the closest to its own id
        assert_eq!(
            time_to_live(&table, &Kuid::MIN.set_bit(159), TTL, MAX_BUCKET_SIZE_K),
            TTL
        );

        let creator = Contact::new(Kuid::random(), SocketAddr::from(([4, 4, 4, 4], 1)));
        let value = DhtValue::new(ValueType::TEXT, Version::ZERO, "v");
        let remote = DhtValueEntity::remote(creator.clone(), creator.clone(), Kuid::MAX, value.clone());

        let now = remote.creation_time();
        assert!(!is_expired(&table, &remote, TTL, MAX_BUCKET_SIZE_K, now));
        assert!(is_expired(&table, &remote, TTL, MAX_BUCKET_SIZE_K, now + far));

        let local = DhtValueEntity::local(creator, Kuid::MAX, value);
        assert!(!is_expired(&table, &local, TTL, MAX_BUCKET_SIZE_K, now + TTL * 10));
    }

    #[test]
    fn republishing() {
        let interval = Duration::from_secs(1800);
        let min = Duration::from_secs(300);
        let creator = Contact::new(Kuid::random(), SocketAddr::from(([4, 4, 4, 4], 1)));

        let mut local = DhtValueEntity::local(
            creator.clone(),
            Kuid::random(),
            DhtValue::new(ValueType::TEXT, Version::ZERO, "v"),
        );
        let now = Instant::now();

        assert!(is_republishing_required(&local, interval, min, 20, now));

        local.set_published(20, now);
        assert!(!is_republishing_required(&local, interval, min, 20, now + min));
        assert!(is_republishing_required(&local, interval, min, 20, now + interval));

        // Stored at few nodes: sooner, but not before the minimum interval
        local.set_published(2, now);
        assert!(!is_republishing_required(&local, interval, min, 20, now + min / 2));
        assert!(is_republishing_required(&local, interval, min, 20, now + min));

        let remote = DhtValueEntity::remote(
            creator.clone(),
            creator,
            Kuid::random(),
            DhtValue::new(ValueType::TEXT, Version::ZERO, "v"),
        );
        assert!(!is_republishing_required(&remote, interval, min, 20, now + interval));
    }
}
