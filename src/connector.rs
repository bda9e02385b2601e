//! The boundary to the remote service.
//!
//! The client never talks to the network directly. Transport (HTTP, TLS, the server-push
//! connection) is supplied by the host through a [`Connector`] implementation.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::ConnectorError,
    models::{Flag, Segment},
};

/// Result type returned by [`Connector`] methods.
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// A bearer credential obtained from [`Connector::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credential {
    pub token: String,
    pub environment: String,
    pub cluster: String,
}

/// Requests the client makes to the remote service.
///
/// Implementations must be safe to call from several background threads at once.
pub trait Connector: Send + Sync {
    /// Exchange the SDK key for a credential used by all other calls.
    fn authenticate(&self) -> ConnectorResult<Credential>;

    fn get_flags(&self) -> ConnectorResult<Vec<Flag>>;
    fn get_flag(&self, identifier: &str) -> ConnectorResult<Flag>;
    fn get_segments(&self) -> ConnectorResult<Vec<Segment>>;
    fn get_segment(&self, identifier: &str) -> ConnectorResult<Segment>;

    fn post_metrics(&self, metrics: &Metrics) -> ConnectorResult<()>;

    /// Open the server-push connection. Lifecycle changes and messages are reported to `handler`
    /// until the returned subscription is closed.
    fn open_stream(&self, handler: Arc<dyn StreamHandler>)
        -> ConnectorResult<Box<dyn Subscription>>;

    /// Register a callback to invoke whenever the remote service rejects the current credential.
    fn set_on_unauthorized(&self, callback: Box<dyn Fn() + Send + Sync>);

    fn close(&self) {}
}

/// Receives events from a server-push connection.
pub trait StreamHandler: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self, reason: &str);
    /// The connection has been established for the first time.
    fn on_ready(&self);
    fn on_failure(&self, error: &ConnectorError);
    fn on_message(&self, message: Message);
}

/// A handle to an open server-push connection.
pub trait Subscription: Send {
    fn close(&mut self);
}

/// A change notification received over the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub event: MessageEvent,
    pub domain: MessageDomain,
    pub identifier: String,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEvent {
    Create,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDomain {
    Flag,
    #[serde(rename = "segment", alias = "target-segment")]
    Segment,
}

/// Analytics report posted by [`Connector::post_metrics`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub target_data: Vec<TargetData>,
    pub metrics_data: Vec<MetricsData>,
}

/// Metadata of a target seen during a flush window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetData {
    pub identifier: String,
    pub name: String,
    pub attributes: Vec<KeyValue>,
}

/// One aggregated evaluation count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub count: u64,
    pub metrics_type: String,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}
