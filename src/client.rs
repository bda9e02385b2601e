use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use derive_more::Display;

use crate::{
    auth::{Authenticator, RetryPolicy},
    connector::{Connector, Message},
    eval::{EvaluationError, Evaluator},
    events::{Event, EventSender, SubscriberId, Subscribers, SubsystemEvent},
    metrics::{MetricsConfig, MetricsProcessor},
    models::{Flag, FlagKind, Variation},
    poller::{join_with_timeout, PollingProcessor, STOP_TIMEOUT},
    repository::{Repository, RepositoryEvent},
    stream::{apply_message, StreamProcessor},
    ClientConfig, Error, Result, Target,
};

/// How often a blocked [`Client::wait_for_initialization`] re-checks for failure.
const WAIT_TICK: Duration = Duration::from_secs(1);
const MAX_AUTH_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Lifecycle of a [`Client`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    #[display(fmt = "created")]
    Created,
    /// Waiting for a credential.
    #[display(fmt = "authenticating")]
    Authenticating,
    /// Authenticated, waiting for the first synchronization.
    #[display(fmt = "starting")]
    Starting,
    #[display(fmt = "ready")]
    Ready,
    #[display(fmt = "closing")]
    Closing,
    #[display(fmt = "closed")]
    Closed,
}

/// A feature flag client.
///
/// The client keeps a local replica of flag and segment definitions up to date in the background
/// and evaluates flags against it. Evaluation never blocks and never fails: when a flag cannot be
/// evaluated (not synchronized yet, wrong kind, broken definition), the supplied default is
/// returned.
///
/// In order to create a client instance, first create [`ClientConfig`].
pub struct Client {
    inner: Arc<Inner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    repository: Arc<Repository>,
    evaluator: Evaluator,
    authenticator: Authenticator,
    poller: Arc<PollingProcessor>,
    stream: Option<StreamProcessor>,
    metrics: Option<MetricsProcessor>,
    subscribers: Subscribers,
    events: EventSender,
    status: Mutex<Status>,
    status_changed: Condvar,
}

struct Status {
    state: ClientState,
    /// Set the first time the client becomes ready. Never reset.
    initialized: bool,
    poll_ready: bool,
    stream_ready: bool,
    metrics_ready: bool,
    failure: Option<String>,
}

impl Client {
    /// Create a client and start authenticating in the background.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Client> {
        let (sender, receiver) = mpsc::channel();
        let events = EventSender::new(sender);

        let repository = {
            let events = events.clone();
            Arc::new(Repository::new(
                config.cache_capacity,
                config.durable_store.clone(),
                config.keep_previous_flag_snapshot,
                Some(Box::new(move |event| {
                    events.send(SubsystemEvent::RepositoryChanged(event))
                })),
            ))
        };

        {
            let events = events.clone();
            connector.set_on_unauthorized(Box::new(move || {
                events.send(SubsystemEvent::Unauthorized)
            }));
        }

        let poller = Arc::new(PollingProcessor::new(
            connector.clone(),
            repository.clone(),
            events.clone(),
            config.poll_interval,
        ));
        let stream = config.stream_enabled.then(|| {
            StreamProcessor::new(
                connector.clone(),
                repository.clone(),
                poller.clone(),
                events.clone(),
            )
        });
        let metrics = config.analytics_enabled.then(|| {
            MetricsProcessor::new(
                connector.clone(),
                events.clone(),
                MetricsConfig {
                    flush_frequency: config.metrics_flush_frequency,
                    buffer_size: config.metrics_buffer_size,
                    global_target_aggregation: config.global_target_aggregation,
                    all_attributes_private: config.all_attributes_private,
                    private_attributes: config.private_attributes.clone(),
                },
            )
        });
        let authenticator = Authenticator::new(
            connector.clone(),
            events.clone(),
            RetryPolicy {
                max_retries: config.max_auth_retries,
                budget: config.auth_retry_budget,
                base_delay: config.auth_retry_delay,
                max_delay: MAX_AUTH_RETRY_DELAY,
            },
        );

        let inner = Arc::new(Inner {
            connector,
            evaluator: Evaluator::new(repository.clone()),
            repository,
            authenticator,
            poller,
            stream,
            metrics,
            subscribers: Subscribers::default(),
            events,
            status: Mutex::new(Status {
                state: ClientState::Created,
                initialized: false,
                poll_ready: false,
                stream_ready: false,
                metrics_ready: false,
                failure: None,
            }),
            status_changed: Condvar::new(),
        });

        let event_loop = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("ff-client".to_owned())
                .spawn(move || inner.run(receiver))?
        };

        inner.lock_status().state = ClientState::Authenticating;
        if let Err(err) = inner.authenticator.start() {
            inner.fail(format!("failed to start authentication: {err}"));
        }

        Ok(Client {
            inner,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock_status().state
    }

    /// Block until the client is ready.
    ///
    /// Returns an error if authentication failed for good or the client was closed. Evaluation
    /// does not require waiting: before the client is ready, defaults are served.
    pub fn wait_for_initialization(&self) -> Result<()> {
        self.wait(None)
    }

    /// Like [`Client::wait_for_initialization`], giving up after `timeout`.
    pub fn wait_for_initialization_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        let mut status = self.inner.lock_status();
        loop {
            if status.initialized {
                return Ok(());
            }
            if let Some(reason) = &status.failure {
                return Err(Error::InitializationFailed(reason.clone()));
            }
            if matches!(status.state, ClientState::Closing | ClientState::Closed) {
                return Err(Error::Closed);
            }

            let mut timeout = WAIT_TICK;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::InitializationTimeout);
                }
                timeout = timeout.min(deadline - now);
            }
            status = self
                .inner
                .status_changed
                .wait_timeout(status, timeout)
                .map_err(|_| Error::ThreadPanicked)?
                .0;
        }
    }

    /// Evaluate a boolean flag.
    pub fn bool_variation(&self, identifier: &str, target: &Target, default: bool) -> bool {
        self.evaluate(identifier, target, FlagKind::Boolean, Variation::as_bool)
            .unwrap_or(default)
    }

    /// Evaluate a string flag.
    pub fn string_variation(&self, identifier: &str, target: &Target, default: &str) -> String {
        self.evaluate(identifier, target, FlagKind::String, |v| Ok(v.value.clone()))
            .unwrap_or_else(|| default.to_owned())
    }

    /// Evaluate a number flag.
    pub fn number_variation(&self, identifier: &str, target: &Target, default: f64) -> f64 {
        self.evaluate(identifier, target, FlagKind::Int, Variation::as_number)
            .unwrap_or(default)
    }

    /// Evaluate a JSON flag.
    pub fn json_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.evaluate(identifier, target, FlagKind::Json, Variation::as_json)
            .unwrap_or(default)
    }

    fn evaluate<T>(
        &self,
        identifier: &str,
        target: &Target,
        kind: FlagKind,
        convert: impl FnOnce(&Variation) -> std::result::Result<T, EvaluationError>,
    ) -> Option<T> {
        let inner = &self.inner;
        let result = catch_unwind(AssertUnwindSafe(|| -> std::result::Result<T, EvaluationError> {
            let evaluation = inner.evaluator.evaluate(identifier, target, kind)?;
            let value = convert(&evaluation.variation)?;

            log::trace!(target: "ff",
                        flag = identifier,
                        version = evaluation.flag.version,
                        target:serde = target,
                        variation = evaluation.variation.identifier.as_str();
                        "evaluated a flag");

            if let Some(metrics) = &inner.metrics {
                if target.is_valid() && !target.is_private {
                    metrics.register_evaluation(target, identifier, &evaluation.variation);
                }
            }
            Ok(value)
        }));

        match result {
            Ok(Ok(value)) => Some(value),
            Ok(Err(EvaluationError::FlagNotFound)) => {
                log::debug!(target: "ff", flag = identifier; "flag not found, serving default");
                None
            }
            Ok(Err(err)) => {
                log::warn!(target: "ff",
                           flag = identifier,
                           target = target.identifier.as_str();
                           "error occurred while evaluating a flag, serving default: {err}");
                None
            }
            Err(_) => {
                log::error!(target: "ff", flag = identifier; "flag evaluation panicked, serving default");
                None
            }
        }
    }

    /// Register `callback` for `event`. The callback receives the event payload: empty for
    /// [`Event::Ready`], the reason for [`Event::Failed`], the flag identifier for
    /// [`Event::Changed`].
    pub fn on(
        &self,
        event: Event,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.inner.subscribers.on(event, Arc::new(callback))
    }

    /// Remove every subscriber.
    pub fn off(&self) {
        self.inner.subscribers.off();
    }

    pub fn off_event(&self, event: Event) {
        self.inner.subscribers.off_event(event);
    }

    pub fn off_subscriber(&self, id: SubscriberId) {
        self.inner.subscribers.off_subscriber(id);
    }

    /// Apply a change notification received outside of the stream.
    pub fn update(&self, message: Message) -> Result<()> {
        apply_message(
            self.inner.connector.as_ref(),
            &self.inner.repository,
            &message,
        )?;
        Ok(())
    }

    /// The current definition of a flag and, with
    /// [`ClientConfig::keep_previous_flag_snapshot`], the one it replaced.
    pub fn get_current_and_previous_flag(
        &self,
        identifier: &str,
    ) -> Option<(Arc<Flag>, Option<Arc<Flag>>)> {
        self.inner.repository.get_current_and_previous_flag(identifier)
    }

    /// Identifiers of all known flags starting with `prefix`.
    pub fn get_all_flag_identifiers(&self, prefix: &str) -> Vec<String> {
        self.inner.repository.get_all_flag_identifiers(prefix)
    }

    /// Number of evaluations reported to the remote service.
    pub fn metrics_sent(&self) -> u64 {
        self.inner.metrics.as_ref().map_or(0, MetricsProcessor::metrics_sent)
    }

    /// Number of evaluations waiting to be reported.
    pub fn pending_metrics(&self) -> u64 {
        self.inner
            .metrics
            .as_ref()
            .map_or(0, MetricsProcessor::pending_metrics)
    }

    /// Number of distinct analytics keys waiting to be reported.
    pub fn queue_size(&self) -> usize {
        self.inner.metrics.as_ref().map_or(0, MetricsProcessor::queue_size)
    }

    /// Stop all background work, flushing analytics once, and release the durable store.
    ///
    /// Evaluation keeps working against the last known definitions. Calling `close` more than
    /// once is fine.
    pub fn close(&self) -> Result<()> {
        {
            let mut status = self.inner.lock_status();
            if matches!(status.state, ClientState::Closing | ClientState::Closed) {
                return Ok(());
            }
            status.state = ClientState::Closing;
            self.inner.status_changed.notify_all();
        }
        log::info!(target: "ff", "closing client");

        self.inner.subscribers.off();
        self.inner.authenticator.stop();

        self.inner.events.send(SubsystemEvent::Shutdown);
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = event_loop {
            // close() may be called from a subscriber, which runs on the event loop thread.
            if handle.thread().id() != std::thread::current().id() {
                if let Err(err) = join_with_timeout(handle, STOP_TIMEOUT) {
                    log::warn!(target: "ff", "event loop exited abnormally: {err}");
                }
            }
        }

        self.inner.stop_subsystems(true);
        let result = self.inner.repository.close();
        self.inner.connector.close();

        self.inner.lock_status().state = ClientState::Closed;
        self.inner.status_changed.notify_all();
        log::info!(target: "ff", "client closed");
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!(target: "ff", "error while closing client: {err}");
        }
    }
}

impl Inner {
    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self, receiver: mpsc::Receiver<SubsystemEvent>) {
        loop {
            match receiver.recv() {
                Ok(SubsystemEvent::Shutdown) | Err(_) => {
                    log::debug!(target: "ff", "event loop stopped");
                    return;
                }
                Ok(event) => self.handle(event),
            }
        }
    }

    fn handle(&self, event: SubsystemEvent) {
        match event {
            SubsystemEvent::AuthSuccess(credential) => {
                log::debug!(target: "ff", environment = credential.environment.as_str(); "starting subsystems");
                self.on_authenticated();
            }
            SubsystemEvent::AuthFailure(reason) => self.fail(reason),
            SubsystemEvent::PollReady => self.mark(|status| status.poll_ready = true),
            SubsystemEvent::PollError(reason) => {
                log::debug!(target: "ff", reason = reason.as_str(); "poll cycle failed");
            }
            SubsystemEvent::StreamReady => self.mark(|status| status.stream_ready = true),
            SubsystemEvent::StreamConnected => {
                log::debug!(target: "ff", "stream connected and resynchronized");
            }
            SubsystemEvent::StreamDisconnected(reason) => {
                log::debug!(target: "ff", reason = reason.as_str(); "stream disconnected");
            }
            SubsystemEvent::StreamFailure {
                reason,
                unrecoverable,
            } => {
                if unrecoverable {
                    // Polling carries the client from now on.
                    self.mark(|status| status.stream_ready = true);
                } else {
                    log::debug!(target: "ff", reason = reason.as_str(); "stream failure");
                }
            }
            SubsystemEvent::MetricsReady => self.mark(|status| status.metrics_ready = true),
            SubsystemEvent::Unauthorized => self.reauthenticate(),
            SubsystemEvent::RepositoryChanged(event) => self.notify_change(event),
            SubsystemEvent::Shutdown => {}
        }
    }

    fn on_authenticated(&self) {
        {
            let mut status = self.lock_status();
            if matches!(status.state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            status.state = ClientState::Starting;
        }

        if let Err(err) = self.poller.start() {
            log::error!(target: "ff", "failed to start poller: {err}");
        }
        if let Some(stream) = &self.stream {
            if let Err(err) = stream.start() {
                log::error!(target: "ff", "failed to start stream: {err}");
            }
        }
        if let Some(metrics) = &self.metrics {
            if let Err(err) = metrics.start() {
                log::error!(target: "ff", "failed to start metrics processor: {err}");
            }
        }
        self.mark(|_| {});
    }

    /// Update readiness flags and move to `Ready` once every enabled subsystem is ready.
    fn mark(&self, update: impl FnOnce(&mut Status)) {
        let first_ready = {
            let mut status = self.lock_status();
            update(&mut status);

            let stream_ready = match &self.stream {
                Some(stream) => status.stream_ready || stream.is_disabled(),
                None => true,
            };
            let metrics_ready = self.metrics.is_none() || status.metrics_ready;

            if status.state == ClientState::Starting
                && status.poll_ready
                && stream_ready
                && metrics_ready
            {
                status.state = ClientState::Ready;
                self.status_changed.notify_all();
                !std::mem::replace(&mut status.initialized, true)
            } else {
                false
            }
        };

        if first_ready {
            log::info!(target: "ff", "client is ready");
            self.subscribers.emit(Event::Ready, "");
        }
    }

    fn fail(&self, reason: String) {
        {
            let mut status = self.lock_status();
            if matches!(status.state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            status.failure = Some(reason.clone());
            self.status_changed.notify_all();
        }
        log::error!(target: "ff", "client initialization failed, serving defaults: {reason}");
        self.subscribers.emit(Event::Failed, &reason);
    }

    fn reauthenticate(&self) {
        {
            let mut status = self.lock_status();
            match status.state {
                ClientState::Authenticating | ClientState::Closing | ClientState::Closed => {
                    return
                }
                ClientState::Created | ClientState::Starting | ClientState::Ready => {}
            }
            status.state = ClientState::Authenticating;
            status.poll_ready = false;
            status.stream_ready = false;
            status.metrics_ready = false;
        }
        log::warn!(target: "ff", "credential rejected, re-authenticating");

        self.stop_subsystems(false);
        if let Err(err) = self.authenticator.start() {
            self.fail(format!("failed to start authentication: {err}"));
        }
    }

    fn stop_subsystems(&self, flush_metrics: bool) {
        // The stream restarts the poller on disconnect, so stop it first.
        if let Some(stream) = &self.stream {
            stream.stop();
        }
        self.poller.stop();
        if let Some(metrics) = &self.metrics {
            metrics.stop(flush_metrics);
        }
    }

    fn notify_change(&self, event: RepositoryEvent) {
        if !self.subscribers.has(Event::Changed) {
            return;
        }
        match event {
            RepositoryEvent::FlagStored(flag) | RepositoryEvent::FlagDeleted(flag) => {
                self.subscribers.emit(Event::Changed, &flag);
            }
            RepositoryEvent::SegmentStored(segment) | RepositoryEvent::SegmentDeleted(segment) => {
                for flag in self.repository.find_flags_referencing_segment(&segment) {
                    self.subscribers.emit(Event::Changed, &flag);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use crate::{
        connector::{Message, MessageDomain, MessageEvent},
        error::ConnectorError,
        models::{Clause, Serve, ServingRule},
        repository::Repository,
        test_utils::{bool_flag, segment, MemoryStorage, MockConnector},
        ClientConfig, Error, Event, Target,
    };

    use super::{Client, ClientState};

    fn config(stream: bool, analytics: bool) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.stream_enabled(stream).analytics_enabled(analytics);
        config.auth_retry_delay = Duration::from_millis(1);
        config
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn on_flag(identifier: &str) -> crate::models::Flag {
        let mut flag = bool_flag(identifier);
        flag.default_serve = Serve::variation("true");
        flag.version = Some(1);
        flag
    }

    #[test]
    fn ready_after_poll_when_stream_and_analytics_disabled() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![on_flag("dark-mode")]);
        let client = config(false, false).to_client(connector.clone()).unwrap();

        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.state(), ClientState::Ready);
        assert!(client.bool_variation("dark-mode", &Target::new("alice"), false));
        assert_eq!(connector.auth_attempts(), 1);
    }

    #[test]
    fn waits_for_stream_before_ready() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![on_flag("dark-mode")]);
        let client = config(true, true).to_client(connector.clone()).unwrap();

        let handler = connector
            .wait_for_stream_handler(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            client.wait_for_initialization_timeout(Duration::from_millis(100)),
            Err(Error::InitializationTimeout)
        ));

        handler.on_connected();
        handler.on_ready();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[test]
    fn unrecoverable_stream_failure_does_not_block_readiness() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_stream(Some(ConnectorError::Http {
            status: 501,
            message: "streaming not supported".into(),
        }));
        let client = config(true, false).to_client(connector.clone()).unwrap();

        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(connector.stream_opens(), 1);
    }

    #[test]
    fn failed_authentication_serves_defaults() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(u32::MAX, ConnectorError::Unauthorized("bad key".into()));
        let client = config(true, true).to_client(connector.clone()).unwrap();

        assert!(matches!(
            client.wait_for_initialization(),
            Err(Error::InitializationFailed(_))
        ));
        let target = Target::new("alice");
        for _ in 0..1000 {
            assert!(client.bool_variation("dark-mode", &target, true));
            assert_eq!(client.string_variation("theme", &target, "light"), "light");
        }
        assert_eq!(client.pending_metrics(), 0);
        assert_eq!(connector.auth_attempts(), 1);
        assert_ne!(client.state(), ClientState::Ready);
    }

    #[test]
    fn persisted_flags_without_credential_keep_metrics_bounded() {
        let store = Arc::new(MemoryStorage::default());
        Repository::new(10, Some(store.clone()), false, None).set_flag(on_flag("dark-mode"));

        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(u32::MAX, ConnectorError::Unauthorized("bad key".into()));
        let mut config = config(false, true);
        config
            .durable_store(store)
            .metrics_buffer_size(10)
            .global_target_aggregation(false);
        let client = config.to_client(connector).unwrap();
        assert!(client.wait_for_initialization().is_err());

        for i in 0..5000 {
            assert!(client.bool_variation("dark-mode", &Target::new(format!("t{i}")), false));
        }
        assert_eq!(client.queue_size(), 10);
        assert_eq!(client.pending_metrics(), 10);
    }

    #[test]
    fn kind_mismatch_and_bad_values_serve_defaults() {
        let connector = Arc::new(MockConnector::default());
        let mut broken = bool_flag("broken");
        broken.variations[0].value = "yes".into();
        broken.default_serve = Serve::variation(broken.variations[0].identifier.clone());
        connector.set_flags(vec![on_flag("dark-mode"), broken]);
        let client = config(false, false).to_client(connector).unwrap();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();

        let target = Target::new("alice");
        assert_eq!(client.string_variation("dark-mode", &target, "x"), "x");
        assert_eq!(client.number_variation("dark-mode", &target, 1.5), 1.5);
        assert!(!client.bool_variation("broken", &target, false));
    }

    #[test]
    fn unauthorized_triggers_reauthentication() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![on_flag("dark-mode")]);
        let client = config(false, false).to_client(connector.clone()).unwrap();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();

        connector.trigger_unauthorized();

        assert!(wait_until(|| connector.auth_attempts() == 2));
        assert!(wait_until(|| client.state() == ClientState::Ready));
        // Evaluation keeps working throughout.
        assert!(client.bool_variation("dark-mode", &Target::new("alice"), false));
    }

    #[test]
    fn changes_are_published_to_subscribers() {
        let connector = Arc::new(MockConnector::default());
        let mut gated = on_flag("gated");
        gated.rules = vec![ServingRule {
            rule_id: None,
            priority: 1,
            clauses: vec![Clause {
                attribute: String::new(),
                op: "segmentMatch".into(),
                values: vec!["beta".into()],
                negate: false,
            }],
            serve: Serve::variation("false"),
        }];
        connector.set_flags(vec![on_flag("dark-mode"), gated]);
        let client = config(false, false).to_client(connector.clone()).unwrap();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();

        let changed = Arc::new(Mutex::new(Vec::new()));
        {
            let changed = changed.clone();
            client.on(Event::Changed, move |flag| {
                changed.lock().unwrap().push(flag.to_owned())
            });
        }

        let mut updated = on_flag("dark-mode");
        updated.version = Some(2);
        connector.set_flags(vec![updated]);
        client
            .update(Message {
                event: MessageEvent::Patch,
                domain: MessageDomain::Flag,
                identifier: "dark-mode".into(),
                version: Some(2),
            })
            .unwrap();

        let mut beta = segment("beta", &["alice"]);
        beta.version = Some(1);
        connector.set_segments(vec![beta]);
        client
            .update(Message {
                event: MessageEvent::Create,
                domain: MessageDomain::Segment,
                identifier: "beta".into(),
                version: Some(1),
            })
            .unwrap();

        assert!(wait_until(|| changed.lock().unwrap().len() == 2));
        assert_eq!(*changed.lock().unwrap(), vec!["dark-mode", "gated"]);
        assert!(!client.bool_variation("gated", &Target::new("alice"), true));
    }

    #[test]
    fn close_flushes_metrics_and_is_idempotent() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![on_flag("dark-mode")]);
        let client = config(false, true).to_client(connector.clone()).unwrap();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();

        client.bool_variation("dark-mode", &Target::new("alice"), false);
        client.bool_variation("dark-mode", &Target::builder("bob").private(true).build(), false);
        assert_eq!(client.pending_metrics(), 1);

        client.close().unwrap();
        client.close().unwrap();

        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(connector.posted_metrics().len(), 1);
        assert_eq!(client.metrics_sent(), 1);
        assert!(connector.is_closed());
        assert!(matches!(client.wait_for_initialization(), Ok(())));
    }

    #[test]
    fn keeps_previous_snapshot_and_lists_flags() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![on_flag("checkout-v1"), on_flag("theme")]);
        let mut config = config(false, false);
        config.keep_previous_flag_snapshot(true);
        let client = config.to_client(connector.clone()).unwrap();
        client
            .wait_for_initialization_timeout(Duration::from_secs(5))
            .unwrap();

        let mut updated = on_flag("theme");
        updated.version = Some(2);
        connector.set_flags(vec![updated]);
        client
            .update(Message {
                event: MessageEvent::Patch,
                domain: MessageDomain::Flag,
                identifier: "theme".into(),
                version: Some(2),
            })
            .unwrap();

        let (current, previous) = client.get_current_and_previous_flag("theme").unwrap();
        assert_eq!(current.version, Some(2));
        assert_eq!(previous.unwrap().version, Some(1));
        assert_eq!(client.get_all_flag_identifiers("check"), vec!["checkout-v1"]);
    }
}
