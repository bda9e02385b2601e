//! Runtime core of a feature flag client.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates feature flags for [`Target`]s, where each
//! target has a unique identifier and key-value attributes associated with it. The client keeps a
//! local replica of flag and segment definitions that is synchronized in the background, by
//! periodic polling and by a server-push stream, and reports aggregated evaluation counts back to
//! the remote service.
//!
//! The network is not part of this crate: the host supplies a [`Connector`] that performs the
//! requests and manages the stream connection.
//!
//! # Error Handling
//!
//! Flag evaluation never fails and never blocks. When a flag cannot be evaluated, the
//! caller-supplied default is returned and the reason is logged. Lifecycle operations return
//! [`Error`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `ff` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into client operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod auth;
mod cache;
mod client;
mod config;
mod connector;
mod error;
mod eval;
mod events;
mod metrics;
mod models;
mod poller;
mod repository;
mod rules;
mod sharder;
mod stream;
mod target;

#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientState};
pub use config::ClientConfig;
pub use connector::{
    Connector, ConnectorResult, Credential, KeyValue, Message, MessageDomain, MessageEvent,
    Metrics, MetricsData, StreamHandler, Subscription, TargetData,
};
pub use error::{ConnectorError, Error, Result};
pub use events::{Event, SubscriberId};
pub use metrics::GLOBAL_TARGET_IDENTIFIER;
pub use models::{
    Clause, Distribution, Flag, FlagKind, FlagState, Prerequisite, Segment, Serve, ServingRule,
    TargetRef, Variation, VariationMap, WeightedVariation,
};
pub use repository::{Query, Repository, RepositoryEvent, Storage};
pub use rules::Operator;
pub use sharder::{Murmur3Sharder, Sharder};
pub use target::{Attributes, Target, TargetBuilder};
