//! Subscription engine: tiered polling of printer status objects.
//!
//! Clients subscribe to objects (optionally narrowed to an attribute set).
//! The engine merges every client's interests, polls each object at the
//! period of the fastest tier assigning it, and fans the results back out
//! filtered to what each client asked for. The host sees at most one
//! in-flight status request per tier: a tick that fires while the previous
//! poll is outstanding is dropped, not queued.

use crate::domain::config::{ServerConfig, TIER_COUNT};
use crate::events::ConnId;
use crate::host::mux;
use crate::service::GatewayState;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Endpoint polled for status objects
pub const STATUS_ENDPOINT: &str = "/printer/status";

/// One source of subscription interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// The shared REST slot fed by `POST /printer/subscriptions`
    Http,
    /// A WebSocket connection
    Ws(ConnId),
}

/// Object name to requested attributes; an empty set means all attributes.
pub type InterestMap = HashMap<String, HashSet<String>>;

/// Engine-global interest bookkeeping plus the polling tasks.
pub struct SubscriptionEngine {
    interests: DashMap<Subscriber, InterestMap>,
    inflight: [AtomicBool; TIER_COUNT],
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self {
            interests: DashMap::new(),
            inflight: Default::default(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Merge new interests into a subscriber's record. An empty attribute
    /// set (or a merge with one) widens the request to all attributes.
    pub fn subscribe(&self, subscriber: Subscriber, requests: InterestMap) {
        let mut record = self.interests.entry(subscriber).or_default();
        for (object, attrs) in requests {
            match record.get_mut(&object) {
                Some(existing) => {
                    if attrs.is_empty() {
                        existing.clear();
                    } else if !existing.is_empty() {
                        existing.extend(attrs);
                    }
                }
                None => {
                    record.insert(object, attrs);
                }
            }
        }
    }

    /// Drop every interest a subscriber held. Objects nobody else wants
    /// stop being polled on the next tick.
    pub fn unsubscribe_all(&self, subscriber: Subscriber) {
        if self.interests.remove(&subscriber).is_some() {
            debug!(?subscriber, "subscriptions removed");
        }
    }

    /// Union of interests across subscribers, restricted to one tier.
    fn merged_interest(&self, config: &ServerConfig, tier: usize) -> InterestMap {
        let mut merged: InterestMap = HashMap::new();
        for record in self.interests.iter() {
            for (object, attrs) in record.iter() {
                if config.object_tier(object) != tier {
                    continue;
                }
                match merged.get_mut(object) {
                    Some(existing) => {
                        if attrs.is_empty() {
                            existing.clear();
                        } else if !existing.is_empty() {
                            existing.extend(attrs.iter().cloned());
                        }
                    }
                    None => {
                        merged.insert(object.clone(), attrs.clone());
                    }
                }
            }
        }
        merged
    }

    /// Current merged view: subscribed objects and their poll periods.
    pub fn current(&self, config: &ServerConfig) -> Value {
        let mut objects = Map::new();
        let mut poll_times = Map::new();
        for tier in 1..=TIER_COUNT {
            let period = config.tier_period(tier).as_secs_f64();
            for (object, attrs) in self.merged_interest(config, tier) {
                let mut attrs: Vec<String> = attrs.into_iter().collect();
                attrs.sort();
                objects.insert(object.clone(), json!(attrs));
                poll_times.insert(object, json!(period));
            }
        }
        json!({ "objects": objects, "poll_times": poll_times })
    }

    /// Start one polling task per tier. Called on the ready transition.
    pub fn start(&self, state: Arc<GatewayState>) {
        self.stop();
        let mut tasks = self.tasks.lock();
        for tier in 1..=TIER_COUNT {
            let period = state.config.read().tier_period(tier);
            tasks.push(tokio::spawn(poll_loop(Arc::clone(&state), tier, period)));
        }
        info!("status polling started");
    }

    /// Stop polling. Called on disconnect and shutdown.
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            return;
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        for flag in &self.inflight {
            flag.store(false, Ordering::Release);
        }
        info!("status polling stopped");
    }

    /// Fan a status payload out to interested WebSocket clients and feed
    /// the temperature store. Also the entry point for host-pushed updates.
    pub fn handle_status(&self, state: &GatewayState, payload: &Map<String, Value>) {
        state.temperatures.record(payload);
        for record in self.interests.iter() {
            let Subscriber::Ws(conn_id) = *record.key() else {
                continue;
            };
            if let Some(filtered) = filter_payload(record.value(), payload) {
                state
                    .websockets
                    .notify_to(conn_id, "status_update", Value::Object(filtered));
            }
        }
    }
}

impl Default for SubscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic poll for one tier.
async fn poll_loop(state: Arc<GatewayState>, tier: usize, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let interest = {
            let config = state.config.read();
            state.engine.merged_interest(&config, tier)
        };
        if interest.is_empty() {
            continue;
        }
        if state.engine.inflight[tier - 1].swap(true, Ordering::AcqRel) {
            debug!(tier, "previous poll outstanding, dropping tick");
            continue;
        }
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let args = interest_to_args(&interest);
            let result = mux::submit(&state, STATUS_ENDPOINT, args).await;
            state.engine.inflight[tier - 1].store(false, Ordering::Release);
            match result {
                Ok(Value::Object(payload)) => state.engine.handle_status(&state, &payload),
                Ok(_) => {}
                Err(e) => debug!(tier, error = %e, "status poll failed"),
            }
        });
    }
}

/// Request arguments for a status poll: object name to attribute list,
/// empty list meaning all attributes.
fn interest_to_args(interest: &InterestMap) -> Value {
    let mut args = Map::new();
    for (object, attrs) in interest {
        let mut attrs: Vec<&String> = attrs.iter().collect();
        attrs.sort();
        args.insert(object.clone(), json!(attrs));
    }
    Value::Object(args)
}

/// Restrict a status payload to one subscriber's interests. `None` when
/// nothing intersects.
fn filter_payload(
    interests: &InterestMap,
    payload: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let mut filtered = Map::new();
    for (object, attrs) in interests {
        let Some(Value::Object(status)) = payload.get(object) else {
            continue;
        };
        if attrs.is_empty() {
            filtered.insert(object.clone(), Value::Object(status.clone()));
            continue;
        }
        let subset: Map<String, Value> = status
            .iter()
            .filter(|(key, _)| attrs.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !subset.is_empty() {
            filtered.insert(object.clone(), Value::Object(subset));
        }
    }
    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interests(entries: &[(&str, &[&str])]) -> InterestMap {
        entries
            .iter()
            .map(|(object, attrs)| {
                (
                    object.to_string(),
                    attrs.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_subscribe_merges_attribute_sets() {
        let engine = SubscriptionEngine::new();
        let conn = Subscriber::Ws(1);
        engine.subscribe(conn, interests(&[("toolhead", &["position"])]));
        engine.subscribe(conn, interests(&[("toolhead", &["status"])]));

        let record = engine.interests.get(&conn).unwrap();
        let attrs = &record["toolhead"];
        assert!(attrs.contains("position") && attrs.contains("status"));
    }

    #[test]
    fn test_empty_set_means_all_attributes() {
        let engine = SubscriptionEngine::new();
        let conn = Subscriber::Ws(1);
        engine.subscribe(conn, interests(&[("toolhead", &["position"])]));
        engine.subscribe(conn, interests(&[("toolhead", &[])]));
        assert!(engine.interests.get(&conn).unwrap()["toolhead"].is_empty());
    }

    #[test]
    fn test_merged_interest_by_tier() {
        let engine = SubscriptionEngine::new();
        let config = ServerConfig {
            status_tier_1: vec!["toolhead".into()],
            ..Default::default()
        };
        engine.subscribe(Subscriber::Ws(1), interests(&[("toolhead", &["position"])]));
        engine.subscribe(Subscriber::Ws(2), interests(&[("toolhead", &[])]));
        engine.subscribe(Subscriber::Http, interests(&[("heater_bed", &["temperature"])]));

        let tier1 = engine.merged_interest(&config, 1);
        assert!(tier1["toolhead"].is_empty());
        assert!(!tier1.contains_key("heater_bed"));

        // unnamed objects land in the default tier
        let tier4 = engine.merged_interest(&config, 4);
        assert!(tier4.contains_key("heater_bed"));
    }

    #[test]
    fn test_unsubscribe_stops_polling_object() {
        let engine = SubscriptionEngine::new();
        let config = ServerConfig::default();
        engine.subscribe(Subscriber::Ws(1), interests(&[("toolhead", &[])]));
        engine.subscribe(Subscriber::Ws(2), interests(&[("toolhead", &[])]));

        engine.unsubscribe_all(Subscriber::Ws(1));
        assert!(engine.merged_interest(&config, 4).contains_key("toolhead"));
        engine.unsubscribe_all(Subscriber::Ws(2));
        assert!(engine.merged_interest(&config, 4).is_empty());
    }

    #[test]
    fn test_filter_payload_attribute_subset() {
        let payload: Map<String, Value> = serde_json::from_value(json!({
            "toolhead": {"position": [0, 0, 0, 0], "status": "Ready"},
            "extruder": {"temperature": 24.5},
        }))
        .unwrap();

        let filtered =
            filter_payload(&interests(&[("toolhead", &["position"])]), &payload).unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered["toolhead"].get("status").is_none());
        assert!(filtered["toolhead"].get("position").is_some());

        assert!(filter_payload(&interests(&[("heater_bed", &[])]), &payload).is_none());
    }

    #[test]
    fn test_current_reports_poll_times() {
        let engine = SubscriptionEngine::new();
        let config = ServerConfig {
            status_tier_1: vec!["toolhead".into()],
            ..Default::default()
        };
        engine.subscribe(Subscriber::Ws(1), interests(&[("toolhead", &[])]));
        let current = engine.current(&config);
        assert_eq!(current["poll_times"]["toolhead"], json!(0.25));
        assert_eq!(current["objects"]["toolhead"], json!([]));
    }
}
