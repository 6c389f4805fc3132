//! Policy-driven implementation of the `SecurityGate` port.
//!
//! Authorisation comes from `SecurityConfig`: admins may act on any flow,
//! owners on their own flows, and `flow_type_grants` restricts who may start
//! a given flow type (types without a grant entry are open to everyone).
//! Event integrity is delegated to an [`HmacEventSigner`].
//!
//! Per-step rules narrow event-driven resumes further: a step can be limited
//! to specific publishers and can require payload keys.

use std::collections::BTreeMap;

use serde_json::Value;
use waypoint_core::service::security::SecurityGate;
use waypoint_types::config::SecurityConfig;
use waypoint_types::error::EngineError;
use waypoint_types::event::SignedEvent;
use waypoint_types::flow::FlowInstance;
use waypoint_types::query::FlowFilter;

use super::signer::HmacEventSigner;

/// Extra constraints on events resuming a particular step.
#[derive(Debug, Clone, Default)]
struct StepEventRule {
    publishers: Vec<String>,
    required_keys: Vec<String>,
}

/// `SecurityGate` backed by static policy and HMAC event signatures.
#[derive(Debug)]
pub struct PolicySecurityGate {
    policy: SecurityConfig,
    signer: HmacEventSigner,
    step_rules: BTreeMap<String, StepEventRule>,
}

impl PolicySecurityGate {
    pub fn new(policy: SecurityConfig, signer: HmacEventSigner) -> Self {
        Self {
            policy,
            signer,
            step_rules: BTreeMap::new(),
        }
    }

    /// Only events from `publishers` may resume `step`.
    pub fn restrict_step_publishers<I, S>(mut self, step: &str, publishers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_rules
            .entry(step.to_string())
            .or_default()
            .publishers
            .extend(publishers.into_iter().map(Into::into));
        self
    }

    /// Events resuming `step` must carry every key in `keys`.
    pub fn require_payload_keys<I, S>(mut self, step: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_rules
            .entry(step.to_string())
            .or_default()
            .required_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn policy(&self) -> &SecurityConfig {
        &self.policy
    }

    pub fn signer(&self) -> &HmacEventSigner {
        &self.signer
    }

    fn is_owner_or_admin(&self, flow: &FlowInstance, user_id: &str) -> bool {
        flow.user_id == user_id || self.policy.is_admin(user_id)
    }

    fn is_trusted_publisher(&self, publisher_id: &str) -> bool {
        self.policy.trusted_publishers.is_empty()
            || self
                .policy
                .trusted_publishers
                .iter()
                .any(|p| p == publisher_id)
    }
}

impl SecurityGate for PolicySecurityGate {
    async fn can_start_flow(
        &self,
        user_id: &str,
        flow_type: &str,
        _initial_data: &BTreeMap<String, Value>,
    ) -> bool {
        if self.policy.is_admin(user_id) {
            return true;
        }
        match self.policy.flow_type_grants.get(flow_type) {
            None => true,
            Some(users) => users.iter().any(|u| u == user_id),
        }
    }

    async fn can_access_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
        self.is_owner_or_admin(flow, user_id)
    }

    async fn can_cancel_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
        self.is_owner_or_admin(flow, user_id)
    }

    async fn can_resume_flow(&self, flow: &FlowInstance, user_id: &str) -> bool {
        self.is_owner_or_admin(flow, user_id)
    }

    async fn can_resume_from_step(
        &self,
        flow: &FlowInstance,
        step_name: &str,
        user_id: Option<&str>,
    ) -> bool {
        let Some(user_id) = user_id else {
            // System triggers (timeouts, conditions) are always allowed.
            return true;
        };
        let allowed = self.is_owner_or_admin(flow, user_id);
        if !allowed {
            tracing::debug!(flow_id = %flow.id, step = step_name, user_id, "step resume denied");
        }
        allowed
    }

    async fn can_resume_with_event(
        &self,
        flow: &FlowInstance,
        step_name: &str,
        event: &SignedEvent,
    ) -> bool {
        if !self.is_trusted_publisher(&event.publisher_id) {
            return false;
        }
        if let Some(correlation) = &event.correlation_id {
            if *correlation != flow.correlation_id {
                return false;
            }
        }
        match self.step_rules.get(step_name) {
            Some(rule) if !rule.publishers.is_empty() => {
                rule.publishers.iter().any(|p| *p == event.publisher_id)
            }
            _ => true,
        }
    }

    async fn validate_event_payload_for_step(
        &self,
        _flow: &FlowInstance,
        step_name: &str,
        event: &SignedEvent,
    ) -> bool {
        let required = self
            .step_rules
            .get(step_name)
            .map(|rule| rule.required_keys.as_slice())
            .unwrap_or_default();
        match &event.payload {
            Value::Null => required.is_empty(),
            Value::Object(map) => required.iter().all(|key| map.contains_key(key)),
            _ => false,
        }
    }

    fn filter_query(&self, mut filter: FlowFilter, user_id: &str) -> FlowFilter {
        if !self.policy.is_admin(user_id) {
            filter.user_id = Some(user_id.to_string());
        }
        filter
    }

    fn sign_event(
        &self,
        event_type: &str,
        payload: Value,
        publisher_id: &str,
        correlation_id: Option<String>,
    ) -> Result<SignedEvent, EngineError> {
        self.signer
            .sign(event_type, payload, publisher_id, correlation_id)
            .map_err(|e| EngineError::EventRejected(format!("signing failed: {e}")))
    }

    fn validate_event_signature(&self, event: &SignedEvent) -> bool {
        if !self.is_trusted_publisher(&event.publisher_id) {
            tracing::warn!(
                event_id = %event.id,
                publisher = event.publisher_id.as_str(),
                "event from untrusted publisher"
            );
            return false;
        }
        match self.signer.verify(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(event_id = %event.id, key_id = event.key_id.as_str(), error = %e, "event signature rejected");
                false
            }
        }
    }
}
