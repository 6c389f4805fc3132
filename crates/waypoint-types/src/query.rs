//! Flow listing filters and paged results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::{FlowInstance, FlowStatus};

/// Filter criteria for listing flows.
///
/// All fields are optional and combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FlowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    /// Page size. `None` lets the engine apply its configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl FlowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_type(mut self, flow_type: impl Into<String>) -> Self {
        self.flow_type = Some(flow_type.into());
        self
    }

    pub fn status(mut self, status: FlowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Whether `flow` satisfies every set criterion (paging is ignored).
    pub fn matches(&self, flow: &FlowInstance) -> bool {
        self.flow_type.as_ref().is_none_or(|t| *t == flow.flow_type)
            && self.status.is_none_or(|s| s == flow.status)
            && self.user_id.as_ref().is_none_or(|u| *u == flow.user_id)
            && self
                .correlation_id
                .as_ref()
                .is_none_or(|c| *c == flow.correlation_id)
            && self.created_after.is_none_or(|t| flow.created_at >= t)
            && self.created_before.is_none_or(|t| flow.created_at < t)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matches before paging.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn empty(offset: usize, limit: usize) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            offset,
            limit,
        }
    }

    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use uuid::Uuid;

    fn flow(user: &str, flow_type: &str) -> FlowInstance {
        FlowInstance::new(
            Uuid::now_v7(),
            flow_type,
            user,
            "c",
            vec!["a".to_string()],
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(FlowFilter::new().matches(&flow("alice", "order")));
    }

    #[test]
    fn test_filter_combines_criteria() {
        let filter = FlowFilter::new().user("alice").flow_type("order");
        assert!(filter.matches(&flow("alice", "order")));
        assert!(!filter.matches(&flow("bob", "order")));
        assert!(!filter.matches(&flow("alice", "refund")));
    }

    #[test]
    fn test_status_filter() {
        let filter = FlowFilter::new().status(FlowStatus::Paused);
        assert!(!filter.matches(&flow("alice", "order")));
    }

    #[test]
    fn test_page_has_more() {
        let page = Page {
            items: vec![1, 2],
            total: 5,
            offset: 0,
            limit: 2,
        };
        assert!(page.has_more());
        let page = page.map(|n| n * 10);
        assert_eq!(page.items, vec![10, 20]);
    }
}
