//! Partitions the stores of a set into available and failed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::common::pod;
use crate::crd::common::{FailoverStatus, Store, StorePhase};

/// A pod must stay Ready this long before its store counts as up.
pub const MIN_READY: Duration = Duration::from_secs(15);

/// Recomputes the store partition from the current pods.
///
/// The transition time of a store is carried over from `prev` while its phase
/// is unchanged, so a failed store ages until it recovers.
pub fn collect_store_status(pods: &[Pod], prev: &FailoverStatus, now: DateTime<Utc>) -> FailoverStatus {
    let previous: HashMap<&str, &Store> = prev
        .available_stores
        .iter()
        .chain(prev.failed_stores.iter())
        .map(|s| (s.pod_name.as_str(), s))
        .collect();

    let mut status = FailoverStatus::default();
    for p in pods {
        let name = pod::name(p);
        let phase = if is_up(p, now) {
            StorePhase::Up
        } else {
            StorePhase::Down
        };
        let last_transition = match previous.get(name) {
            Some(s) if s.phase == phase => s.last_transition.clone(),
            _ => Time(now),
        };
        let store = Store {
            pod_name: name.to_string(),
            phase,
            last_transition,
        };
        match phase {
            StorePhase::Up => status.available_stores.push(store),
            StorePhase::Down => status.failed_stores.push(store),
        }
    }
    status.available_stores.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    status.failed_stores.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    status
}

fn is_up(p: &Pod, now: DateTime<Utc>) -> bool {
    match pod::ready_since(p) {
        Some(since) => now.signed_duration_since(since).to_std().map_or(false, |d| d >= MIN_READY),
        None => false,
    }
}

/// Failed stores that have been down for at least `d`.
pub fn stores_failed_for(status: &FailoverStatus, d: Duration, now: DateTime<Utc>) -> Vec<&Store> {
    status
        .failed_stores
        .iter()
        .filter(|s| {
            now.signed_duration_since(s.last_transition.0)
                .to_std()
                .map_or(false, |down| down >= d)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pod::testing;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_pod_is_up_only_after_min_ready() {
        let now = Utc::now();
        let pods = vec![
            testing::pod("test-log-0", Some(now - ChronoDuration::seconds(60))),
            testing::pod("test-log-1", Some(now - ChronoDuration::seconds(5))),
            testing::pod("test-log-2", None),
        ];
        let status = collect_store_status(&pods, &FailoverStatus::default(), now);
        let up: Vec<&str> = status.available_stores.iter().map(|s| s.pod_name.as_str()).collect();
        let down: Vec<&str> = status.failed_stores.iter().map(|s| s.pod_name.as_str()).collect();
        assert_eq!(up, vec!["test-log-0"]);
        assert_eq!(down, vec!["test-log-1", "test-log-2"]);
    }

    #[test]
    fn test_transition_time_is_preserved_while_phase_holds() {
        let t0 = Utc::now();
        let pods = vec![testing::pod("test-log-0", None)];
        let first = collect_store_status(&pods, &FailoverStatus::default(), t0);
        assert_eq!(first.failed_stores[0].last_transition, Time(t0));

        let t1 = t0 + ChronoDuration::minutes(3);
        let second = collect_store_status(&pods, &first, t1);
        assert_eq!(second.failed_stores[0].last_transition, Time(t0));

        // recovers: the clock restarts
        let t2 = t1 + ChronoDuration::minutes(1);
        let pods = vec![testing::pod("test-log-0", Some(t1))];
        let third = collect_store_status(&pods, &second, t2);
        assert_eq!(third.available_stores[0].last_transition, Time(t2));
        assert!(third.failed_stores.is_empty());
    }

    #[test]
    fn test_only_long_failures_are_reported() {
        let now = Utc::now();
        let status = FailoverStatus {
            available_stores: vec![],
            failed_stores: vec![
                Store {
                    pod_name: "test-log-0".to_string(),
                    phase: StorePhase::Down,
                    last_transition: Time(now - ChronoDuration::minutes(11)),
                },
                Store {
                    pod_name: "test-log-1".to_string(),
                    phase: StorePhase::Down,
                    last_transition: Time(now - ChronoDuration::seconds(30)),
                },
            ],
        };
        let failed = stores_failed_for(&status, Duration::from_secs(600), now);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].pod_name, "test-log-0");
    }
}
