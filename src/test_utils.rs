//! Helpers shared by unit tests.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    connector::{
        Connector, ConnectorResult, Credential, Metrics, StreamHandler, Subscription,
    },
    error::ConnectorError,
    models::{Clause, Flag, FlagKind, FlagState, Segment, Serve, Variation},
    repository::{Query, Storage},
    Result,
};

pub(crate) fn clause(attribute: &str, op: &str, values: &[&str]) -> Clause {
    Clause {
        attribute: attribute.into(),
        op: op.into(),
        values: values.iter().map(|&v| v.to_owned()).collect(),
        negate: false,
    }
}

/// A boolean flag that is on and serves `"false"` to everyone; off variation is `"false"` too.
pub(crate) fn bool_flag(identifier: &str) -> Flag {
    Flag {
        identifier: identifier.into(),
        kind: FlagKind::Boolean,
        state: FlagState::On,
        variations: vec![
            Variation {
                identifier: "true".into(),
                value: "true".into(),
                name: None,
                description: None,
            },
            Variation {
                identifier: "false".into(),
                value: "false".into(),
                name: None,
                description: None,
            },
        ],
        rules: vec![],
        default_serve: Serve::variation("false"),
        off_variation: "false".into(),
        prerequisites: vec![],
        variation_to_target_map: vec![],
        version: None,
    }
}

pub(crate) fn segment(identifier: &str, included: &[&str]) -> Segment {
    Segment {
        identifier: identifier.into(),
        name: None,
        included: included.iter().map(|&id| id.into()).collect(),
        excluded: vec![],
        rules: vec![],
        version: None,
    }
}

/// In-memory [`Query`] for evaluator tests.
#[derive(Default)]
pub(crate) struct TestQuery {
    flags: HashMap<String, Arc<Flag>>,
    segments: HashMap<String, Arc<Segment>>,
}

impl TestQuery {
    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag.identifier.clone(), Arc::new(flag));
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments
            .insert(segment.identifier.clone(), Arc::new(segment));
        self
    }
}

impl Query for TestQuery {
    fn get_flag(&self, identifier: &str) -> Option<Arc<Flag>> {
        self.flags.get(identifier).cloned()
    }

    fn get_segment(&self, identifier: &str) -> Option<Arc<Segment>> {
        self.segments.get(identifier).cloned()
    }
}

/// [`Storage`] backed by a map.
#[derive(Default)]
pub(crate) struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    closes: AtomicUsize,
}

impl MemoryStorage {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A scriptable [`Connector`] that records the calls it receives.
#[derive(Default)]
pub(crate) struct MockConnector {
    flags: Mutex<Vec<Flag>>,
    segments: Mutex<Vec<Segment>>,

    auth_failures: Mutex<Option<(u32, ConnectorError)>>,
    auth_attempts: AtomicU32,

    fetch_error: Mutex<Option<ConnectorError>>,
    flag_fetches: AtomicUsize,
    single_fetches: AtomicUsize,

    metrics_error: Mutex<Option<ConnectorError>>,
    posted_metrics: Mutex<Vec<Metrics>>,

    stream_error: Mutex<Option<ConnectorError>>,
    stream_opens: AtomicUsize,
    stream_handler: Mutex<Option<Arc<dyn StreamHandler>>>,
    subscription_closed: Arc<AtomicBool>,

    on_unauthorized: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    closed: AtomicBool,
}

impl MockConnector {
    pub fn set_flags(&self, flags: Vec<Flag>) {
        *self.flags.lock().unwrap() = flags;
    }

    pub fn set_segments(&self, segments: Vec<Segment>) {
        *self.segments.lock().unwrap() = segments;
    }

    /// Fail the next `times` authentication attempts with `error`.
    pub fn fail_auth_times(&self, times: u32, error: ConnectorError) {
        *self.auth_failures.lock().unwrap() = Some((times, error));
    }

    pub fn auth_attempts(&self) -> u32 {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self, error: Option<ConnectorError>) {
        *self.fetch_error.lock().unwrap() = error;
    }

    /// Number of `get_flags` calls.
    pub fn flag_fetches(&self) -> usize {
        self.flag_fetches.load(Ordering::SeqCst)
    }

    /// Number of `get_flag` and `get_segment` calls.
    pub fn single_fetches(&self) -> usize {
        self.single_fetches.load(Ordering::SeqCst)
    }

    pub fn fail_metrics(&self, error: Option<ConnectorError>) {
        *self.metrics_error.lock().unwrap() = error;
    }

    pub fn posted_metrics(&self) -> Vec<Metrics> {
        self.posted_metrics.lock().unwrap().clone()
    }

    pub fn fail_stream(&self, error: Option<ConnectorError>) {
        *self.stream_error.lock().unwrap() = error;
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    pub fn subscription_closed(&self) -> bool {
        self.subscription_closed.load(Ordering::SeqCst)
    }

    /// Wait for the client to open the stream and return the handler it registered.
    pub fn wait_for_stream_handler(&self, timeout: Duration) -> Option<Arc<dyn StreamHandler>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handler) = self.stream_handler.lock().unwrap().clone() {
                return Some(handler);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Simulate the remote service rejecting the current credential.
    pub fn trigger_unauthorized(&self) {
        if let Some(callback) = self.on_unauthorized.lock().unwrap().as_ref() {
            callback();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_fetch(&self) -> ConnectorResult<()> {
        match self.fetch_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(identifier: &str) -> ConnectorError {
        ConnectorError::Http {
            status: 404,
            message: format!("{identifier} not found"),
        }
    }
}

struct MockSubscription(Arc<AtomicBool>);

impl Subscription for MockSubscription {
    fn close(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn authenticate(&self) -> ConnectorResult<Credential> {
        self.auth_attempts.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.auth_failures.lock().unwrap();
        if let Some((remaining, error)) = failures.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(Credential {
            token: "token".into(),
            environment: "test".into(),
            cluster: "1".into(),
        })
    }

    fn get_flags(&self) -> ConnectorResult<Vec<Flag>> {
        self.flag_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_fetch()?;
        Ok(self.flags.lock().unwrap().clone())
    }

    fn get_flag(&self, identifier: &str) -> ConnectorResult<Flag> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_fetch()?;
        self.flags
            .lock()
            .unwrap()
            .iter()
            .find(|flag| flag.identifier == identifier)
            .cloned()
            .ok_or_else(|| Self::not_found(identifier))
    }

    fn get_segments(&self) -> ConnectorResult<Vec<Segment>> {
        self.check_fetch()?;
        Ok(self.segments.lock().unwrap().clone())
    }

    fn get_segment(&self, identifier: &str) -> ConnectorResult<Segment> {
        self.single_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_fetch()?;
        self.segments
            .lock()
            .unwrap()
            .iter()
            .find(|segment| segment.identifier == identifier)
            .cloned()
            .ok_or_else(|| Self::not_found(identifier))
    }

    fn post_metrics(&self, metrics: &Metrics) -> ConnectorResult<()> {
        if let Some(err) = self.metrics_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.posted_metrics.lock().unwrap().push(metrics.clone());
        Ok(())
    }

    fn open_stream(
        &self,
        handler: Arc<dyn StreamHandler>,
    ) -> ConnectorResult<Box<dyn Subscription>> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.stream_error.lock().unwrap().clone() {
            return Err(err);
        }
        *self.stream_handler.lock().unwrap() = Some(handler);
        Ok(Box::new(MockSubscription(self.subscription_closed.clone())))
    }

    fn set_on_unauthorized(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.on_unauthorized.lock().unwrap() = Some(callback);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
