//! Temperature history rings.
//!
//! Each sensor keeps the last 20 minutes of temperature and target samples
//! at one sample per second. Status updates only record the most recent
//! values; a 1 Hz sampler appends them, repeating the last value when no
//! update arrived, so a sample's index always maps to its age.

use crate::host::mux;
use crate::service::GatewayState;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Samples retained per sensor (20 minutes at 1 Hz)
pub const TEMPERATURE_STORE_SIZE: usize = 1200;

/// Sampler period
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

struct SensorHistory {
    temperatures: VecDeque<f64>,
    targets: VecDeque<f64>,
}

impl SensorHistory {
    fn new() -> Self {
        Self {
            temperatures: VecDeque::from(vec![0.0; TEMPERATURE_STORE_SIZE]),
            targets: VecDeque::from(vec![0.0; TEMPERATURE_STORE_SIZE]),
        }
    }

    fn push(&mut self, temperature: f64, target: f64) {
        self.temperatures.pop_front();
        self.temperatures.push_back(temperature);
        self.targets.pop_front();
        self.targets.push_back(target);
    }
}

/// Per-sensor history plus the last-seen values feeding it.
pub struct TemperatureStore {
    sensors: parking_lot::Mutex<HashMap<String, SensorHistory>>,
    last: parking_lot::Mutex<HashMap<String, (f64, f64)>>,
}

impl TemperatureStore {
    pub fn new() -> Self {
        Self {
            sensors: parking_lot::Mutex::new(HashMap::new()),
            last: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a sensor with a zero-filled history.
    pub fn add_sensor(&self, name: &str) {
        let mut sensors = self.sensors.lock();
        if !sensors.contains_key(name) {
            info!(sensor = name, "tracking temperature sensor");
            sensors.insert(name.to_string(), SensorHistory::new());
            self.last.lock().insert(name.to_string(), (0.0, 0.0));
        }
    }

    /// Record last-seen values from a status payload. Objects carrying a
    /// `temperature` attribute are discovered as sensors on sight.
    pub fn record(&self, payload: &Map<String, Value>) {
        for (object, status) in payload {
            let Some(temperature) = status.get("temperature").and_then(Value::as_f64) else {
                continue;
            };
            self.add_sensor(object);
            let target = status.get("target").and_then(Value::as_f64).unwrap_or(0.0);
            self.last
                .lock()
                .insert(object.clone(), (round2(temperature), target));
        }
    }

    /// Append the last-seen values to every ring. Called at 1 Hz whether or
    /// not any update arrived since the previous sample.
    pub fn sample(&self) {
        let last = self.last.lock();
        let mut sensors = self.sensors.lock();
        for (name, history) in sensors.iter_mut() {
            let (temperature, target) = last.get(name).copied().unwrap_or((0.0, 0.0));
            history.push(temperature, target);
        }
    }

    /// Full history, oldest sample first.
    pub fn snapshot(&self) -> Value {
        let sensors = self.sensors.lock();
        let mut store = Map::new();
        for (name, history) in sensors.iter() {
            store.insert(
                name.clone(),
                json!({
                    "temperatures": history.temperatures.iter().collect::<Vec<_>>(),
                    "targets": history.targets.iter().collect::<Vec<_>>(),
                }),
            );
        }
        Value::Object(store)
    }

    pub fn sensor_names(&self) -> Vec<String> {
        self.sensors.lock().keys().cloned().collect()
    }
}

impl Default for TemperatureStore {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 1 Hz sampler task, running for the process lifetime.
pub async fn sampler_task(store: Arc<TemperatureStore>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        store.sample();
    }
}

/// Snapshot every printer object once and register those that expose a
/// temperature. Runs when the host reports ready; later status updates
/// still discover sensors lazily.
pub async fn discover_sensors(state: &GatewayState) {
    let objects = match mux::submit(state, "/printer/objects", json!({})).await {
        Ok(Value::Object(objects)) => objects,
        Ok(_) => return,
        Err(e) => {
            debug!(error = %e, "object list unavailable, skipping sensor discovery");
            return;
        }
    };
    let mut args = Map::new();
    for object in objects.keys() {
        args.insert(object.clone(), json!([]));
    }
    match mux::submit(state, super::engine::STATUS_ENDPOINT, Value::Object(args)).await {
        Ok(Value::Object(payload)) => state.temperatures.record(&payload),
        Ok(_) => {}
        Err(e) => debug!(error = %e, "status snapshot failed, skipping sensor discovery"),
    }
}
