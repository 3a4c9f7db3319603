//! Broadcast message model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutation verb applied to the target element(s) on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Append,
    Prepend,
    Replace,
    Update,
    Remove,
    Before,
    After,
}

/// One DOM mutation instruction carried through the hub.
///
/// `data` is opaque to the subsystem; MSG handlers interpret it when
/// rendering the wire fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: Action,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub targets: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Message {
    pub fn new(action: Action, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            targets: String::new(),
            template: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
