//! Tiered status polling and temperature history.

pub mod engine;
pub mod temperature;

pub use engine::{Subscriber, SubscriptionEngine};
pub use temperature::TemperatureStore;
