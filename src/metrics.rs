//! Evaluation analytics.
//!
//! Every evaluation increments a counter keyed by (flag, target, variation). A flush thread
//! periodically drains the table and posts one row per key, plus metadata for targets not reported
//! before. Filling the table up to the buffer size triggers an immediate flush.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{sync_channel, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    connector::{Connector, KeyValue, Metrics, MetricsData, TargetData},
    events::{EventSender, SubsystemEvent},
    models::Variation,
    poller::{join_with_timeout, STOP_TIMEOUT},
    target::attribute_to_string,
    Result, Target,
};

/// Identifier all evaluations are reported under when targets are aggregated globally.
pub const GLOBAL_TARGET_IDENTIFIER: &str = "__global__cf_target";
const GLOBAL_TARGET_NAME: &str = "Global Target";

const METRICS_TYPE: &str = "FFMETRICS";
const FEATURE_NAME_ATTRIBUTE: &str = "featureName";
const VARIATION_IDENTIFIER_ATTRIBUTE: &str = "variationIdentifier";
const VARIATION_VALUE_ATTRIBUTE: &str = "variationValue";
const TARGET_ATTRIBUTE: &str = "target";
const SDK_TYPE: &str = "SDK_TYPE";
const SDK_LANGUAGE: &str = "SDK_LANGUAGE";
const SDK_VERSION: &str = "SDK_VERSION";

#[derive(Debug, Clone)]
pub(crate) struct MetricsConfig {
    pub flush_frequency: Duration,
    pub buffer_size: usize,
    pub global_target_aggregation: bool,
    pub all_attributes_private: bool,
    pub private_attributes: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    flag: String,
    target: String,
    variation_identifier: String,
    variation_value: String,
}

/// Evaluations accumulated since the last flush.
#[derive(Default)]
struct Window {
    counts: HashMap<MetricKey, u64>,
    targets: HashMap<String, Target>,
}

enum Command {
    Flush,
    Stop { flush: bool },
}

struct FlushThread {
    join_handle: JoinHandle<()>,
    commands: SyncSender<Command>,
}

pub(crate) struct MetricsProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<FlushThread>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    events: EventSender,
    config: MetricsConfig,
    window: Mutex<Window>,
    /// Targets whose metadata has already been reported by this client.
    reported_targets: Mutex<HashSet<String>>,
    /// Sender of the running flush thread, used to request out-of-band flushes.
    flush_trigger: Mutex<Option<SyncSender<Command>>>,
    metrics_sent: AtomicU64,
    pending: AtomicU64,
}

impl MetricsProcessor {
    pub fn new(connector: Arc<dyn Connector>, events: EventSender, config: MetricsConfig) -> Self {
        MetricsProcessor {
            shared: Arc::new(Shared {
                connector,
                events,
                config,
                window: Mutex::new(Window::default()),
                reported_targets: Mutex::new(HashSet::new()),
                flush_trigger: Mutex::new(None),
                metrics_sent: AtomicU64::new(0),
                pending: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the flush thread. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread
            .as_ref()
            .map_or(false, |t| !t.join_handle.is_finished())
        {
            return Ok(());
        }

        let (commands, receiver) = sync_channel(1);
        let shared = self.shared.clone();
        let frequency = self.shared.config.flush_frequency;
        let join_handle = std::thread::Builder::new()
            .name("ff-metrics".to_owned())
            .spawn(move || loop {
                match receiver.recv_timeout(frequency) {
                    Err(RecvTimeoutError::Timeout) | Ok(Command::Flush) => shared.flush(),
                    Ok(Command::Stop { flush }) => {
                        if flush {
                            shared.flush();
                        }
                        log::debug!(target: "ff", "metrics thread received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;

        *lock(&self.shared.flush_trigger) = Some(commands.clone());
        *thread = Some(FlushThread {
            join_handle,
            commands,
        });
        drop(thread);

        log::debug!(target: "ff", "metrics processor started");
        self.shared.events.send(SubsystemEvent::MetricsReady);
        Ok(())
    }

    /// Stop the flush thread, optionally flushing once more before it exits.
    pub fn stop(&self, flush: bool) {
        lock(&self.shared.flush_trigger).take();
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        // Error means the thread has already exited.
        let _ = thread.commands.send(Command::Stop { flush });
        if let Err(err) = join_with_timeout(thread.join_handle, STOP_TIMEOUT) {
            log::warn!(target: "ff", "metrics thread exited abnormally: {err}");
        }
    }

    /// Count one evaluation of `flag` that served `variation` to `target`.
    pub fn register_evaluation(&self, target: &Target, flag: &str, variation: &Variation) {
        self.shared.register_evaluation(target, flag, variation);
    }

    /// Drain and post the table on the caller's thread.
    #[cfg(test)]
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Number of evaluations successfully reported.
    pub fn metrics_sent(&self) -> u64 {
        self.shared.metrics_sent.load(Ordering::Relaxed)
    }

    /// Number of evaluations waiting for the next flush.
    pub fn pending_metrics(&self) -> u64 {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// Number of distinct keys waiting for the next flush.
    pub fn queue_size(&self) -> usize {
        lock(&self.shared.window).counts.len()
    }
}

impl Shared {
    fn register_evaluation(&self, target: &Target, flag: &str, variation: &Variation) {
        let target_key = if self.config.global_target_aggregation {
            GLOBAL_TARGET_IDENTIFIER
        } else {
            target.identifier.as_str()
        };
        let key = MetricKey {
            flag: flag.to_owned(),
            target: target_key.to_owned(),
            variation_identifier: variation.identifier.clone(),
            variation_value: variation.value.clone(),
        };

        // Without a flush thread nothing drains the window, so it is capped at the buffer size.
        let flushing = lock(&self.flush_trigger).is_some();
        let size = {
            let mut window = lock(&self.window);
            if !flushing
                && window.counts.len() >= self.config.buffer_size
                && !window.counts.contains_key(&key)
            {
                log::trace!(target: "ff", flag; "metrics processor is not running and the buffer is full, dropping evaluation");
                return;
            }
            *window.counts.entry(key).or_insert(0) += 1;
            if !target.is_private
                && !window.targets.contains_key(&target.identifier)
                && (flushing || window.targets.len() < self.config.buffer_size)
            {
                window
                    .targets
                    .insert(target.identifier.clone(), target.clone());
            }
            // Updated under the window lock so a concurrent flush never subtracts it first.
            self.pending.fetch_add(1, Ordering::Relaxed);
            window.counts.len()
        };

        if flushing && size >= self.config.buffer_size {
            if let Some(trigger) = lock(&self.flush_trigger).as_ref() {
                match trigger.try_send(Command::Flush) {
                    Ok(()) => {
                        log::debug!(target: "ff", size; "metrics buffer full, flushing early");
                    }
                    // A flush is already pending.
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
    }

    fn flush(&self) {
        let (window, total) = {
            let mut guard = lock(&self.window);
            let window = std::mem::take(&mut *guard);
            let total: u64 = window.counts.values().sum();
            self.pending.fetch_sub(total, Ordering::Relaxed);
            (window, total)
        };
        if window.counts.is_empty() {
            return;
        }

        let (metrics, staged_targets) = self.build_report(window);
        log::debug!(target: "ff",
                    rows = metrics.metrics_data.len(),
                    targets = metrics.target_data.len(),
                    evaluations = total;
                    "posting metrics");

        match self.connector.post_metrics(&metrics) {
            Ok(()) => {
                self.metrics_sent.fetch_add(total, Ordering::Relaxed);
                lock(&self.reported_targets).extend(staged_targets);
            }
            Err(err) => {
                // Dropped, not re-queued.
                log::warn!(target: "ff", evaluations = total; "failed to post metrics: {err}");
                if err.is_unauthorized() {
                    self.events.send(SubsystemEvent::Unauthorized);
                }
            }
        }
    }

    /// Returns the report and the identifiers of targets whose metadata it carries.
    fn build_report(&self, window: Window) -> (Metrics, Vec<String>) {
        let reported = lock(&self.reported_targets);
        let mut staged = Vec::new();
        let mut target_data = Vec::new();

        if self.config.global_target_aggregation && !reported.contains(GLOBAL_TARGET_IDENTIFIER) {
            staged.push(GLOBAL_TARGET_IDENTIFIER.to_owned());
            target_data.push(TargetData {
                identifier: GLOBAL_TARGET_IDENTIFIER.to_owned(),
                name: GLOBAL_TARGET_NAME.to_owned(),
                attributes: Vec::new(),
            });
        }

        for (identifier, target) in window.targets {
            if target.is_private || reported.contains(&identifier) {
                continue;
            }
            target_data.push(self.target_data(&target));
            staged.push(identifier);
        }
        drop(reported);

        let timestamp = chrono::Utc::now().timestamp_millis();
        let metrics_data = window
            .counts
            .into_iter()
            .map(|(key, count)| MetricsData {
                timestamp,
                count,
                metrics_type: METRICS_TYPE.to_owned(),
                attributes: vec![
                    KeyValue::new(FEATURE_NAME_ATTRIBUTE, key.flag),
                    KeyValue::new(VARIATION_IDENTIFIER_ATTRIBUTE, key.variation_identifier),
                    KeyValue::new(VARIATION_VALUE_ATTRIBUTE, key.variation_value),
                    KeyValue::new(TARGET_ATTRIBUTE, key.target),
                    KeyValue::new(SDK_TYPE, "server"),
                    KeyValue::new(SDK_LANGUAGE, "rust"),
                    KeyValue::new(SDK_VERSION, env!("CARGO_PKG_VERSION")),
                ],
            })
            .collect();

        (
            Metrics {
                target_data,
                metrics_data,
            },
            staged,
        )
    }

    fn target_data(&self, target: &Target) -> TargetData {
        let mut attributes = Vec::new();
        if !self.config.all_attributes_private {
            for (name, value) in &target.attributes {
                if target.private_attributes.contains(name)
                    || self.config.private_attributes.contains(name)
                {
                    continue;
                }
                if let Some(value) = attribute_to_string(value) {
                    attributes.push(KeyValue::new(name.as_str(), value));
                }
            }
            attributes.sort_by(|a, b| a.key.cmp(&b.key));
        }

        TargetData {
            identifier: target.identifier.clone(),
            name: if target.name.is_empty() {
                target.identifier.clone()
            } else {
                target.name.clone()
            },
            attributes,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
