use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::runtime::{Builder, Runtime};

use crate::{
    connector::{
        Connector, ConnectorResult, Message, MessageDomain, MessageEvent, StreamHandler,
        Subscription,
    },
    error::ConnectorError,
    events::{EventSender, SubsystemEvent},
    models::is_outdated,
    poller::{jitter, wait_for_stop, PollingProcessor, Worker, STOP_TIMEOUT},
    repository::Repository,
    Result,
};

/// Number of threads applying stream messages concurrently.
const UPDATE_WORKERS: usize = 4;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Apply one change notification to the repository.
///
/// Creates and patches fetch the current definition unless the stored one is already at least as
/// new as the message; deletes remove the definition without a fetch. Returns `true` if the
/// repository changed.
pub(crate) fn apply_message(
    connector: &dyn Connector,
    repository: &Repository,
    message: &Message,
) -> ConnectorResult<bool> {
    let identifier = message.identifier.as_str();
    match (message.event, message.domain) {
        (MessageEvent::Delete, MessageDomain::Flag) => {
            repository.delete_flag(identifier);
            Ok(true)
        }
        (MessageEvent::Delete, MessageDomain::Segment) => {
            repository.delete_segment(identifier);
            Ok(true)
        }
        (_, MessageDomain::Flag) => {
            if is_outdated(repository.flag_version(identifier), message.version) {
                log::debug!(target: "ff", flag = identifier, version = message.version; "skipping outdated flag message");
                return Ok(false);
            }
            let flag = connector.get_flag(identifier)?;
            Ok(repository.set_flag(flag))
        }
        (_, MessageDomain::Segment) => {
            if is_outdated(repository.segment_version(identifier), message.version) {
                log::debug!(target: "ff", segment = identifier, version = message.version; "skipping outdated segment message");
                return Ok(false);
            }
            let segment = connector.get_segment(identifier)?;
            Ok(repository.set_segment(segment))
        }
    }
}

/// Keeps the repository up to date from the server-push connection, falling back to the poller
/// while disconnected.
pub(crate) struct StreamProcessor {
    shared: Arc<Shared>,
    connection: Mutex<Option<Worker>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    repository: Arc<Repository>,
    poller: Arc<PollingProcessor>,
    events: EventSender,
    running: AtomicBool,
    /// Set once the server rejected the stream for good.
    disabled: AtomicBool,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    workers: Mutex<Option<Runtime>>,
}

impl StreamProcessor {
    pub fn new(
        connector: Arc<dyn Connector>,
        repository: Arc<Repository>,
        poller: Arc<PollingProcessor>,
        events: EventSender,
    ) -> StreamProcessor {
        StreamProcessor {
            shared: Arc::new(Shared {
                connector,
                repository,
                poller,
                events,
                running: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
                subscription: Mutex::new(None),
                workers: Mutex::new(None),
            }),
            connection: Mutex::new(None),
        }
    }

    /// Open the stream on a background thread, retrying until the connector accepts. Does
    /// nothing if the stream is running or has been rejected for good.
    pub fn start(&self) -> Result<()> {
        if self.shared.disabled.load(Ordering::SeqCst) {
            log::debug!(target: "ff", "stream was rejected by the server, not reconnecting");
            return Ok(());
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(UPDATE_WORKERS)
            .thread_name("ff-stream-worker")
            .build();
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        *lock(&self.shared.workers) = Some(runtime);

        let shared = self.shared.clone();
        let worker = Worker::spawn("ff-stream", move |stop_receiver| {
            let mut attempt: u32 = 0;
            while shared.running.load(Ordering::SeqCst) {
                attempt += 1;
                log::debug!(target: "ff", attempt; "opening stream");
                let handler: Arc<dyn StreamHandler> = shared.clone();
                match shared.connector.open_stream(handler) {
                    Ok(subscription) => {
                        *lock(&shared.subscription) = Some(subscription);
                        return;
                    }
                    Err(err) => {
                        shared.on_failure(&err);
                        if err.is_unrecoverable_stream_failure() {
                            return;
                        }
                    }
                }

                // Keep the repository advancing while the stream is down.
                if let Err(err) = shared.poller.start() {
                    log::warn!(target: "ff", "failed to start fallback poller: {err}");
                }
                let delay = jitter(RECONNECT_DELAY.saturating_mul(attempt), RECONNECT_DELAY)
                    .min(MAX_RECONNECT_DELAY);
                if wait_for_stop(&stop_receiver, delay) {
                    return;
                }
            }
        });
        match worker {
            Ok(worker) => {
                *lock(&self.connection) = Some(worker);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Close the stream and wait (bounded) for in-flight messages to be applied.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::debug!(target: "ff", "stopping stream");

        if let Some(worker) = lock(&self.connection).take() {
            if let Err(err) = worker.stop(STOP_TIMEOUT) {
                log::warn!(target: "ff", "stream connection thread exited abnormally: {err}");
            }
        }
        if let Some(mut subscription) = lock(&self.shared.subscription).take() {
            subscription.close();
        }
        if let Some(runtime) = lock(&self.shared.workers).take() {
            runtime.shutdown_timeout(STOP_TIMEOUT);
        }
    }

    /// Returns `true` if the server rejected the stream in a way reconnecting cannot fix.
    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn report_connector_error(&self, err: &ConnectorError) {
        if err.is_unauthorized() {
            self.events.send(SubsystemEvent::Unauthorized);
        }
    }
}

impl StreamHandler for Shared {
    fn on_connected(&self) {
        if !self.is_running() {
            return;
        }
        log::info!(target: "ff", "stream connected");
        self.poller.stop();
        // Repair anything missed while disconnected.
        if let Err(err) = self.poller.retrieve_all() {
            log::warn!(target: "ff", "resync after stream connect failed: {err}");
            self.report_connector_error(&err);
        }
        self.events.send(SubsystemEvent::StreamConnected);
    }

    fn on_disconnected(&self, reason: &str) {
        if !self.is_running() {
            return;
        }
        log::warn!(target: "ff", reason; "stream disconnected, falling back to polling");
        if let Err(err) = self.poller.start() {
            log::warn!(target: "ff", "failed to start fallback poller: {err}");
        }
        self.events
            .send(SubsystemEvent::StreamDisconnected(reason.to_owned()));
    }

    fn on_ready(&self) {
        if !self.is_running() {
            return;
        }
        self.events.send(SubsystemEvent::StreamReady);
    }

    fn on_failure(&self, error: &ConnectorError) {
        self.report_connector_error(error);

        let unrecoverable = error.is_unrecoverable_stream_failure();
        if unrecoverable {
            log::error!(target: "ff", "stream rejected by the server, polling only from now on: {error}");
            self.disabled.store(true, Ordering::SeqCst);
        } else {
            log::warn!(target: "ff", "stream error: {error}");
        }
        self.events.send(SubsystemEvent::StreamFailure {
            reason: error.to_string(),
            unrecoverable,
        });

        if unrecoverable {
            if let Err(err) = self.poller.start() {
                log::warn!(target: "ff", "failed to start fallback poller: {err}");
            }
        }
    }

    fn on_message(&self, message: Message) {
        if !self.is_running() {
            return;
        }
        let workers = lock(&self.workers);
        let Some(runtime) = workers.as_ref() else {
            return;
        };

        log::debug!(target: "ff", message:serde; "received stream message");
        let connector = self.connector.clone();
        let repository = self.repository.clone();
        let events = self.events.clone();
        runtime.spawn_blocking(move || {
            if let Err(err) = apply_message(connector.as_ref(), &repository, &message) {
                log::warn!(target: "ff",
                           identifier = message.identifier.as_str();
                           "failed to apply stream message: {err}");
                if err.is_unauthorized() {
                    events.send(SubsystemEvent::Unauthorized);
                }
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
