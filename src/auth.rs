use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    connector::Connector,
    events::{EventSender, SubsystemEvent},
    poller::{jitter, wait_for_stop, Worker, STOP_TIMEOUT},
    Result,
};

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    /// Retries after the first attempt. `None` retries until the budget runs out.
    pub max_retries: Option<u32>,
    /// Overall time allowed for one authentication run.
    pub budget: Duration,
    /// Backoff unit; the n-th retry waits roughly `n * base_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        jitter(self.base_delay.saturating_mul(attempt), self.base_delay).min(self.max_delay)
    }
}

/// Obtains a credential on a background thread, retrying transient failures.
pub(crate) struct Authenticator {
    connector: Arc<dyn Connector>,
    events: EventSender,
    policy: RetryPolicy,
    /// Set while a run has not yet decided its outcome. Cleared before the outcome is sent, so a
    /// run that already reported is never mistaken for one in progress.
    in_progress: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl Authenticator {
    pub fn new(connector: Arc<dyn Connector>, events: EventSender, policy: RetryPolicy) -> Self {
        Authenticator {
            connector,
            events,
            policy,
            in_progress: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start an authentication run. Does nothing if one is already in progress.
    ///
    /// The outcome is reported as [`SubsystemEvent::AuthSuccess`] or
    /// [`SubsystemEvent::AuthFailure`].
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The previous run has reported its outcome and is on its way out.
        if let Some(previous) = worker.take() {
            if let Err(err) = previous.stop(STOP_TIMEOUT) {
                log::warn!(target: "ff", "authentication thread exited abnormally: {err}");
            }
        }

        let connector = self.connector.clone();
        let events = self.events.clone();
        let policy = self.policy.clone();
        let in_progress = self.in_progress.clone();

        let spawned = Worker::spawn("ff-auth", move |stop_receiver| {
            let outcome = authenticate(connector.as_ref(), &policy, &stop_receiver);
            in_progress.store(false, Ordering::SeqCst);
            if let Some(event) = outcome {
                events.send(event);
            }
        });
        match spawned {
            Ok(spawned) => {
                *worker = Some(spawned);
                Ok(())
            }
            Err(err) => {
                self.in_progress.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Cancel an in-progress authentication run.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.stop(STOP_TIMEOUT) {
                log::warn!(target: "ff", "authentication thread exited abnormally: {err}");
            }
        }
    }
}

/// Run attempts until one succeeds or the policy gives up. Returns `None` if stopped.
fn authenticate(
    connector: &dyn Connector,
    policy: &RetryPolicy,
    stop_receiver: &Receiver<()>,
) -> Option<SubsystemEvent> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        log::debug!(target: "ff", attempt; "authenticating");
        let err = match connector.authenticate() {
            Ok(credential) => {
                log::info!(target: "ff",
                           environment = credential.environment.as_str(),
                           cluster = credential.cluster.as_str();
                           "authenticated");
                return Some(SubsystemEvent::AuthSuccess(credential));
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            log::error!(target: "ff", "authentication failed with a non-retryable error: {err}");
            return Some(SubsystemEvent::AuthFailure(err.to_string()));
        }

        let retries_exhausted = policy.max_retries.map_or(false, |max| attempt > max);
        let elapsed = started.elapsed();
        if retries_exhausted || elapsed >= policy.budget {
            log::error!(target: "ff", attempt; "giving up on authentication: {err}");
            return Some(SubsystemEvent::AuthFailure(format!(
                "gave up after {attempt} attempts: {err}"
            )));
        }

        let delay = policy.backoff(attempt).min(policy.budget - elapsed);
        log::warn!(target: "ff",
                   attempt,
                   delay_ms = delay.as_millis() as u64;
                   "authentication failed, retrying: {err}");
        if wait_for_stop(stop_receiver, delay) {
            log::debug!(target: "ff", "authentication cancelled");
            return None;
        }
    }
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
        test_utils::MockConnector,
    };

    use super::{Authenticator, RetryPolicy};

    fn policy(max_retries: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            budget: Duration::from_secs(10),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn authenticator(
        connector: Arc<MockConnector>,
        max_retries: Option<u32>,
    ) -> (Authenticator, mpsc::Receiver<SubsystemEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Authenticator::new(connector, EventSender::new(sender), policy(max_retries)),
            receiver,
        )
    }

    #[test]
    fn retries_transient_failures() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(3, ConnectorError::Network("timeout".into()));
        let (authenticator, events) = authenticator(connector.clone(), Some(10));

        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthSuccess(_)));
        assert_eq!(connector.auth_attempts(), 4);
    }

    #[test]
    fn non_retryable_failure_stops_immediately() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(u32::MAX, ConnectorError::Unauthorized("bad key".into()));
        let (authenticator, events) = authenticator(connector.clone(), None);

        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthFailure(_)));
        assert_eq!(connector.auth_attempts(), 1);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(u32::MAX, ConnectorError::Network("timeout".into()));
        let (authenticator, events) = authenticator(connector.clone(), Some(2));

        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthFailure(_)));
        assert_eq!(connector.auth_attempts(), 3);
    }

    #[test]
    fn restart_right_after_success_runs_again() {
        let connector = Arc::new(MockConnector::default());
        let (authenticator, events) = authenticator(connector.clone(), Some(10));

        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthSuccess(_)));

        // The first thread may still be exiting; the restart must not be swallowed.
        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthSuccess(_)));
        assert_eq!(connector.auth_attempts(), 2);
    }

    #[test]
    fn start_during_run_is_ignored() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(1, ConnectorError::Network("timeout".into()));
        let (sender, events) = mpsc::channel();
        let authenticator = Authenticator::new(
            connector.clone(),
            EventSender::new(sender),
            RetryPolicy {
                max_retries: Some(3),
                budget: Duration::from_secs(10),
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(200),
            },
        );

        authenticator.start().unwrap();
        authenticator.start().unwrap();
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, SubsystemEvent::AuthSuccess(_)));
        assert_eq!(connector.auth_attempts(), 2);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn stop_cancels_retries() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_auth_times(u32::MAX, ConnectorError::Network("timeout".into()));
        let (sender, events) = mpsc::channel();
        let authenticator = Authenticator::new(
            connector.clone(),
            EventSender::new(sender),
            RetryPolicy {
                max_retries: None,
                budget: Duration::from_secs(60),
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
            },
        );

        authenticator.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        authenticator.stop();
        let attempts = connector.auth_attempts();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(connector.auth_attempts(), attempts);
        assert!(events.try_recv().is_err());
    }
}
