//! SecurityGate trait: authorisation checks and event signing.
//!
//! Every externally visible engine operation consults the gate before it
//! touches a flow. Event signing lives here too because only the gate knows
//! which keys and publishers are trusted.

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;
use waypoint_types::error::EngineError;
use waypoint_types::event::SignedEvent;
use waypoint_types::flow::FlowInstance;
use waypoint_types::query::FlowFilter;

/// Authorisation and event-integrity port.
///
/// The `can_*` checks are async (RPITIT) so implementations may consult
/// external policy stores. Signing and verification are synchronous.
pub trait SecurityGate: Send + Sync {
    fn can_start_flow(
        &self,
        user_id: &str,
        flow_type: &str,
        initial_data: &BTreeMap<String, Value>,
    ) -> impl Future<Output = bool> + Send;

    fn can_access_flow(&self, flow: &FlowInstance, user_id: &str)
    -> impl Future<Output = bool> + Send;

    fn can_cancel_flow(&self, flow: &FlowInstance, user_id: &str)
    -> impl Future<Output = bool> + Send;

    fn can_resume_flow(&self, flow: &FlowInstance, user_id: &str)
    -> impl Future<Output = bool> + Send;

    /// Per-step resume check. `user_id` is `None` for system triggers
    /// (timeouts and resume conditions).
    fn can_resume_from_step(
        &self,
        flow: &FlowInstance,
        step_name: &str,
        user_id: Option<&str>,
    ) -> impl Future<Output = bool> + Send;

    /// Whether `event` may resume `flow` at `step_name`.
    fn can_resume_with_event(
        &self,
        flow: &FlowInstance,
        step_name: &str,
        event: &SignedEvent,
    ) -> impl Future<Output = bool> + Send;

    /// Whether the payload of `event` is acceptable input for `step_name`.
    fn validate_event_payload_for_step(
        &self,
        flow: &FlowInstance,
        step_name: &str,
        event: &SignedEvent,
    ) -> impl Future<Output = bool> + Send;

    /// Narrow a listing filter to what `user_id` may see.
    fn filter_query(&self, filter: FlowFilter, user_id: &str) -> FlowFilter;

    /// Build and sign an event on behalf of `publisher_id`.
    fn sign_event(
        &self,
        event_type: &str,
        payload: Value,
        publisher_id: &str,
        correlation_id: Option<String>,
    ) -> Result<SignedEvent, EngineError>;

    /// Verify the signature of `event` (and that its publisher is trusted).
    fn validate_event_signature(&self, event: &SignedEvent) -> bool;
}
