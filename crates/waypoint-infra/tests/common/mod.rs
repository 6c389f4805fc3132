//! Shared wiring for the engine scenario tests: the real in-memory adapters
//! behind a `FlowEngine`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::Value;
use waypoint_core::FlowEngine;
use waypoint_infra::crypto::hash::Sha256ContentHasher;
use waypoint_infra::repository::InMemoryFlowRepository;
use waypoint_infra::security::{HmacEventSigner, PolicySecurityGate};
use waypoint_infra::validation::RuleValidator;
use waypoint_types::config::{EngineConfig, SecurityConfig};
use waypoint_types::event::{FlowEvent, FlowEventType};
use waypoint_types::flow::FlowStatus;

pub type Engine = FlowEngine<InMemoryFlowRepository, PolicySecurityGate>;

pub const SIGNING_KEY: &str = "test-signing-secret";

pub struct Harness {
    pub engine: Engine,
    pub repo: Arc<InMemoryFlowRepository>,
}

pub fn policy() -> SecurityConfig {
    let mut grants = BTreeMap::new();
    grants.insert("payout".to_string(), vec!["finance".to_string()]);
    SecurityConfig {
        admin_users: vec!["root".to_string()],
        flow_type_grants: grants,
        trusted_publishers: Vec::new(),
    }
}

pub fn signer() -> HmacEventSigner {
    HmacEventSigner::new("k1", SecretString::from(SIGNING_KEY.to_string()))
}

pub fn harness() -> Harness {
    build(EngineConfig::default(), PolicySecurityGate::new(policy(), signer()), RuleValidator::new())
}

pub fn harness_with_config(config: EngineConfig) -> Harness {
    build(config, PolicySecurityGate::new(policy(), signer()), RuleValidator::new())
}

pub fn harness_with_gate(gate: PolicySecurityGate) -> Harness {
    build(EngineConfig::default(), gate, RuleValidator::new())
}

pub fn harness_with_validator(validator: RuleValidator) -> Harness {
    build(EngineConfig::default(), PolicySecurityGate::new(policy(), signer()), validator)
}

fn build(config: EngineConfig, gate: PolicySecurityGate, validator: RuleValidator) -> Harness {
    let repo = Arc::new(InMemoryFlowRepository::new());
    let engine = FlowEngine::builder(
        Arc::clone(&repo),
        Arc::new(gate),
        Arc::new(validator),
        Arc::new(Sha256ContentHasher::new()),
    )
    .config(config)
    .build();
    Harness { engine, repo }
}

pub fn data(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn count(events: &[FlowEvent], event_type: FlowEventType) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

/// Poll `status` until it equals `expected` (bounded).
pub async fn wait_for_status(engine: &Engine, flow_id: uuid::Uuid, user: &str, expected: FlowStatus) {
    for _ in 0..200 {
        if let Ok(status) = engine.status(flow_id, user).await {
            if status == expected {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("flow {flow_id} never reached {expected}");
}
