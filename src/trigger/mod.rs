/// Trigger Layer
///
/// Activation of funnel triggers and conversion of webhooks, schedule ticks,
/// manual fires and events into executions.

pub mod manager;

pub use manager::{TriggerManager, TriggerState, TRIGGER_PAYLOAD_KEY};
