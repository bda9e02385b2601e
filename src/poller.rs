use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};

use crate::{
    connector::{Connector, ConnectorResult},
    events::{EventSender, SubsystemEvent},
    repository::Repository,
    Error, Result,
};

/// How long `stop()` waits for an in-flight cycle before detaching the thread.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// A background thread that can be asked to stop.
pub(crate) struct Worker {
    join_handle: JoinHandle<()>,
    /// Used to send a stop command to the thread.
    stop_sender: SyncSender<()>,
}

impl Worker {
    /// Spawn a named thread running `body`. The thread is expected to exit once it receives a
    /// message on (or sees a disconnect of) the provided receiver.
    pub fn spawn(
        name: &str,
        body: impl FnOnce(Receiver<()>) + Send + 'static,
    ) -> Result<Worker> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel(1);
        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(stop_receiver))?;
        Ok(Worker {
            join_handle,
            stop_sender,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Stop the thread and wait up to `timeout` for it to exit.
    pub fn stop(self, timeout: Duration) -> Result<()> {
        // Full means a stop command is already pending. Disconnected means the thread has exited.
        let _ = self.stop_sender.try_send(());
        join_with_timeout(self.join_handle, timeout)
    }
}

/// Wait up to `timeout` for the thread to finish.
///
/// A thread that does not finish in time is detached; it exits on its own once it notices the
/// stop command.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(target: "ff",
                       thread = handle.thread().name().unwrap_or("unnamed");
                       "thread did not stop in time, detaching it");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().map_err(|_| Error::ThreadPanicked)
}

/// Sleep for `timeout` unless a stop command arrives first. Returns `true` if the caller should
/// stop.
pub(crate) fn wait_for_stop(stop_receiver: &Receiver<()>, timeout: Duration) -> bool {
    match stop_receiver.recv_timeout(timeout) {
        // Timed out. Loop to do another round of work.
        Err(RecvTimeoutError::Timeout) => false,
        Ok(()) => true,
        // The owner dropped the sender without asking. Nobody can stop us anymore, so stop now.
        Err(RecvTimeoutError::Disconnected) => true,
    }
}

/// Apply a random jitter to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

/// Periodically fetches every flag and segment and stores them in the repository.
pub(crate) struct PollingProcessor {
    connector: Arc<dyn Connector>,
    repository: Arc<Repository>,
    events: EventSender,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl PollingProcessor {
    pub fn new(
        connector: Arc<dyn Connector>,
        repository: Arc<Repository>,
        events: EventSender,
        interval: Duration,
    ) -> PollingProcessor {
        PollingProcessor {
            connector,
            repository,
            events,
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Start the poller thread. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().map_or(false, Worker::is_running) {
            return Ok(());
        }

        let connector = self.connector.clone();
        let repository = self.repository.clone();
        let events = self.events.clone();
        let interval = self.interval;

        log::debug!(target: "ff", interval_ms = interval.as_millis() as u64; "starting poller");
        *worker = Some(Worker::spawn("ff-poller", move |stop_receiver| {
            let mut ready = false;
            loop {
                log::debug!(target: "ff", "fetching all flags and segments");
                match retrieve_all(connector.as_ref(), &repository) {
                    Ok(()) => {
                        if !ready {
                            ready = true;
                            events.send(SubsystemEvent::PollReady);
                        }
                    }
                    Err(err) if err.is_unauthorized() => {
                        log::warn!(target: "ff", "poller is not authorized: {err}");
                        events.send(SubsystemEvent::Unauthorized);
                    }
                    Err(err) => {
                        // Ignore other errors, we'll try another request later.
                        log::warn!(target: "ff", "error while polling flags and segments: {err}");
                        events.send(SubsystemEvent::PollError(err.to_string()));
                    }
                }

                if wait_for_stop(&stop_receiver, jitter(interval, interval / 10)) {
                    log::debug!(target: "ff", "poller thread received stop command");
                    return;
                }
            }
        })?);
        Ok(())
    }

    /// Stop the poller thread, waiting (bounded) for an in-flight cycle to finish.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            log::debug!(target: "ff", "stopping poller");
            if let Err(err) = worker.stop(STOP_TIMEOUT) {
                log::warn!(target: "ff", "poller thread exited abnormally: {err}");
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, Worker::is_running)
    }

    /// Fetch everything once, on the caller's thread.
    pub fn retrieve_all(&self) -> ConnectorResult<()> {
        retrieve_all(self.connector.as_ref(), &self.repository)?;
        self.events.send(SubsystemEvent::PollReady);
        Ok(())
    }
}

/// Fetch all segments and flags, then store them. Nothing is stored if either fetch fails.
fn retrieve_all(connector: &dyn Connector, repository: &Repository) -> ConnectorResult<()> {
    let segments = connector.get_segments()?;
    let flags = connector.get_flags()?;

    let segment_count = segments.len();
    let flag_count = flags.len();
    // Segments first, so that flags referencing them evaluate against fresh membership.
    for segment in segments {
        repository.set_segment(segment);
    }
    for flag in flags {
        repository.set_flag(flag);
    }

    log::debug!(target: "ff", flags = flag_count, segments = segment_count; "successfully fetched flags and segments");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    use crate::{
        error::ConnectorError,
        events::{EventSender, SubsystemEvent},
        repository::{Query, Repository},
        test_utils::{bool_flag, MockConnector},
    };

    use super::{jitter, PollingProcessor};

    fn poller(
        connector: Arc<MockConnector>,
        interval: Duration,
    ) -> (PollingProcessor, Arc<Repository>, mpsc::Receiver<SubsystemEvent>) {
        let (sender, receiver) = mpsc::channel();
        let repository = Arc::new(Repository::new(100, None, false, None));
        let poller = PollingProcessor::new(
            connector,
            repository.clone(),
            EventSender::new(sender),
            interval,
        );
        (poller, repository, receiver)
    }

    #[test]
    fn first_successful_cycle_signals_ready() {
        let connector = Arc::new(MockConnector::default());
        connector.set_flags(vec![bool_flag("dark-mode")]);
        let (poller, repository, events) = poller(connector, Duration::from_secs(60));

        poller.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::PollReady));
        assert!(repository.get_flag("dark-mode").is_some());

        poller.stop();
        assert!(!poller.is_running());
    }

    #[test]
    fn errors_do_not_stop_polling() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_fetches(Some(ConnectorError::Network("reset".into())));
        let (poller, _repository, events) = poller(connector.clone(), Duration::from_millis(20));

        poller.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::PollError(_)));

        connector.fail_fetches(None);
        let ready = std::iter::from_fn(|| events.recv_timeout(Duration::from_secs(5)).ok())
            .any(|event| matches!(event, SubsystemEvent::PollReady));
        assert!(ready);
        poller.stop();
    }

    #[test]
    fn unauthorized_is_reported() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_fetches(Some(ConnectorError::Unauthorized("expired".into())));
        let (poller, _repository, events) = poller(connector, Duration::from_secs(60));

        poller.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::Unauthorized));
        poller.stop();
    }

    #[test]
    fn start_is_idempotent_and_restartable() {
        let connector = Arc::new(MockConnector::default());
        let (poller, _repository, _events) = poller(connector.clone(), Duration::from_secs(60));

        poller.start().unwrap();
        poller.start().unwrap();
        poller.stop();
        poller.stop();
        poller.start().unwrap();
        assert!(poller.is_running());
        poller.stop();

        assert!(connector.flag_fetches() <= 2);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let value = jitter(Duration::from_secs(60), Duration::from_secs(6));
            assert!(value >= Duration::from_secs(60) && value < Duration::from_secs(66));
        }
        assert_eq!(jitter(Duration::from_secs(1), Duration::ZERO), Duration::from_secs(1));
    }
}
