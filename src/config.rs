use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::{Client, Connector, Result, Storage};

/// Configuration for [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) stream_enabled: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) analytics_enabled: bool,
    pub(crate) metrics_flush_frequency: Duration,
    pub(crate) metrics_buffer_size: usize,
    pub(crate) global_target_aggregation: bool,
    pub(crate) max_auth_retries: Option<u32>,
    pub(crate) auth_retry_budget: Duration,
    pub(crate) auth_retry_delay: Duration,
    pub(crate) keep_previous_flag_snapshot: bool,
    pub(crate) durable_store: Option<Arc<dyn Storage>>,
    pub(crate) cache_capacity: usize,
    pub(crate) all_attributes_private: bool,
    pub(crate) private_attributes: HashSet<String>,
}

impl ClientConfig {
    /// Lower bound for [`ClientConfig::poll_interval`] and
    /// [`ClientConfig::metrics_flush_frequency`].
    pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

    pub const DEFAULT_METRICS_BUFFER_SIZE: usize = 2048;
    pub const DEFAULT_MAX_AUTH_RETRIES: u32 = 10;
    pub const DEFAULT_AUTH_RETRY_BUDGET: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

    /// Create a default configuration.
    ///
    /// ```
    /// # use ff_client::ClientConfig;
    /// let mut config = ClientConfig::new();
    /// config.stream_enabled(false).analytics_enabled(false);
    /// ```
    pub fn new() -> Self {
        ClientConfig {
            stream_enabled: true,
            poll_interval: Self::MIN_INTERVAL,
            analytics_enabled: true,
            metrics_flush_frequency: Self::MIN_INTERVAL,
            metrics_buffer_size: Self::DEFAULT_METRICS_BUFFER_SIZE,
            global_target_aggregation: true,
            max_auth_retries: Some(Self::DEFAULT_MAX_AUTH_RETRIES),
            auth_retry_budget: Self::DEFAULT_AUTH_RETRY_BUDGET,
            auth_retry_delay: Duration::from_secs(1),
            keep_previous_flag_snapshot: false,
            durable_store: None,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
            all_attributes_private: false,
            private_attributes: HashSet::new(),
        }
    }

    /// Receive changes over the server-push stream. When disabled, only polling is used.
    pub fn stream_enabled(&mut self, enabled: bool) -> &mut Self {
        self.stream_enabled = enabled;
        self
    }

    /// How often to fetch all flags and segments. Values below one minute are raised to one
    /// minute.
    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval.max(Self::MIN_INTERVAL);
        self
    }

    /// Report evaluation counts to the remote service.
    pub fn analytics_enabled(&mut self, enabled: bool) -> &mut Self {
        self.analytics_enabled = enabled;
        self
    }

    /// How often to post analytics. Values below one minute are raised to one minute.
    pub fn metrics_flush_frequency(&mut self, frequency: Duration) -> &mut Self {
        self.metrics_flush_frequency = frequency.max(Self::MIN_INTERVAL);
        self
    }

    /// Number of distinct analytics keys that triggers an immediate flush.
    pub fn metrics_buffer_size(&mut self, size: usize) -> &mut Self {
        self.metrics_buffer_size = size.max(1);
        self
    }

    /// Report all evaluations under a single global target instead of per target.
    pub fn global_target_aggregation(&mut self, enabled: bool) -> &mut Self {
        self.global_target_aggregation = enabled;
        self
    }

    /// Retries after a failed authentication attempt. `None` retries until the budget runs out.
    pub fn max_auth_retries(&mut self, retries: Option<u32>) -> &mut Self {
        self.max_auth_retries = retries;
        self
    }

    /// Total time one authentication run may take, retries included.
    pub fn auth_retry_budget(&mut self, budget: Duration) -> &mut Self {
        self.auth_retry_budget = budget;
        self
    }

    /// Keep the definition a flag replaced, for
    /// [`Client::get_current_and_previous_flag`].
    pub fn keep_previous_flag_snapshot(&mut self, keep: bool) -> &mut Self {
        self.keep_previous_flag_snapshot = keep;
        self
    }

    /// Persist definitions in `store` in addition to the in-memory cache.
    pub fn durable_store(&mut self, store: Arc<dyn Storage>) -> &mut Self {
        self.durable_store = Some(store);
        self
    }

    /// Maximum number of flags (and, separately, segments) held in memory.
    pub fn cache_capacity(&mut self, capacity: usize) -> &mut Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Never include target attributes in analytics.
    pub fn all_attributes_private(&mut self, private: bool) -> &mut Self {
        self.all_attributes_private = private;
        self
    }

    /// Attribute names that are never included in analytics, for every target.
    pub fn private_attributes(
        &mut self,
        attributes: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.private_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Create a new [`Client`] using this configuration. Authentication starts immediately in the
    /// background.
    pub fn to_client(&self, connector: Arc<dyn Connector>) -> Result<Client> {
        Client::new(self.clone(), connector)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
