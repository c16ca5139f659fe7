//! Autoscaler: windowed metrics in, scale decisions out.
//!
//! Replica counts are read from the router. Executed decisions are
//! recorded in history and handed to a [`ScaleDecisionHandler`]; the
//! autoscaler never provisions anything itself.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::autoscale::policy::{
    AutoscaleError, ScaleDecision, ScaleDirection, ScalingHistory, ScalingMetrics, ScalingPolicy,
};
use crate::inspector::Protocol;
use crate::lifecycle::supervisor::{BackgroundTask, StopOutcome};
use crate::load_balancer::endpoint::now_millis;
use crate::load_balancer::Router;
use crate::observability::metrics::{self as m, SharedSink};

const RECENT_HISTORY: usize = 10;

/// Source of the current replica count for a protocol.
pub trait ReplicaSource: Send + Sync {
    fn replica_count(&self, protocol: Protocol) -> usize;
}

impl ReplicaSource for Router {
    fn replica_count(&self, protocol: Protocol) -> usize {
        self.module_count(protocol)
    }
}

/// A decision handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleEvent {
    pub protocol: Protocol,
    pub from: usize,
    pub to: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("scale handler failed: {0}")]
pub struct ScaleHandlerError(pub String);

/// Receives executed scale decisions. Must not block.
pub trait ScaleDecisionHandler: Send + Sync {
    fn on_scale_decision(&self, event: &ScaleEvent) -> Result<(), ScaleHandlerError>;
}

/// Forwards decisions over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ScaleEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScaleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ScaleDecisionHandler for ChannelNotifier {
    fn on_scale_decision(&self, event: &ScaleEvent) -> Result<(), ScaleHandlerError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ScaleHandlerError("decision receiver dropped".into()))
    }
}

/// Loop and retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscalerSettings {
    pub interval: Duration,
    pub max_history: usize,
}

impl Default for AutoscalerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_history: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub target_cpu: f64,
    pub target_memory: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoscalerStats {
    pub running: bool,
    pub evaluation_interval_secs: u64,
    pub policies: BTreeMap<Protocol, PolicySummary>,
    pub recent_history: Vec<ScalingHistory>,
}

#[derive(Default)]
struct ScalerState {
    policies: BTreeMap<Protocol, ScalingPolicy>,
    samples: HashMap<Protocol, VecDeque<ScalingMetrics>>,
    history: VecDeque<ScalingHistory>,
    last_scale: HashMap<Protocol, Instant>,
}

pub struct Autoscaler {
    state: RwLock<ScalerState>,
    replicas: Arc<dyn ReplicaSource>,
    handler: RwLock<Option<Arc<dyn ScaleDecisionHandler>>>,
    settings: AutoscalerSettings,
    metrics: SharedSink,
    task: Mutex<Option<BackgroundTask>>,
}

impl fmt::Debug for Autoscaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autoscaler")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Autoscaler {
    pub fn new(replicas: Arc<dyn ReplicaSource>, settings: AutoscalerSettings, metrics: SharedSink) -> Self {
        Self {
            state: RwLock::new(ScalerState::default()),
            replicas,
            handler: RwLock::new(None),
            settings,
            metrics,
            task: Mutex::new(None),
        }
    }

    /// Install the orchestrator seam, replacing any previous handler.
    pub fn set_decision_handler(&self, handler: Arc<dyn ScaleDecisionHandler>) {
        *self.handler.write().expect("scale handler lock poisoned") = Some(handler);
    }

    pub fn set_policy(&self, policy: ScalingPolicy) -> Result<(), AutoscaleError> {
        policy.validate()?;
        tracing::info!(
            protocol = %policy.protocol,
            min_replicas = policy.min_replicas,
            max_replicas = policy.max_replicas,
            target_cpu = policy.target_cpu,
            "Scaling policy configured"
        );
        self.state
            .write()
            .expect("autoscaler lock poisoned")
            .policies
            .insert(policy.protocol, policy);
        Ok(())
    }

    pub fn get_policy(&self, protocol: Protocol) -> Option<ScalingPolicy> {
        self.state
            .read()
            .expect("autoscaler lock poisoned")
            .policies
            .get(&protocol)
            .cloned()
    }

    pub fn remove_policy(&self, protocol: Protocol) -> Option<ScalingPolicy> {
        self.state
            .write()
            .expect("autoscaler lock poisoned")
            .policies
            .remove(&protocol)
    }

    /// Append a sample, evicting the oldest beyond `max_history`.
    pub fn record_metrics(&self, protocol: Protocol, mut sample: ScalingMetrics) {
        sample.timestamp_ms = now_millis();
        let mut state = self.state.write().expect("autoscaler lock poisoned");
        let samples = state.samples.entry(protocol).or_default();
        samples.push_back(sample);
        while samples.len() > self.settings.max_history {
            samples.pop_front();
        }
    }

    pub fn sample_count(&self, protocol: Protocol) -> usize {
        self.state
            .read()
            .expect("autoscaler lock poisoned")
            .samples
            .get(&protocol)
            .map_or(0, VecDeque::len)
    }

    /// Decide for one protocol without acting on the decision.
    pub fn evaluate_protocol(&self, protocol: Protocol) -> ScaleDecision {
        let (policy, window, last_scale) = {
            let state = self.state.read().expect("autoscaler lock poisoned");
            let Some(policy) = state.policies.get(&protocol).cloned() else {
                return ScaleDecision::None;
            };
            let samples = state.samples.get(&protocol);
            let len = samples.map_or(0, VecDeque::len);
            if len < policy.evaluation_periods {
                drop(state);
                self.record_decision(protocol, ScaleDecision::InsufficientData);
                return ScaleDecision::InsufficientData;
            }
            let window: Vec<ScalingMetrics> = samples
                .into_iter()
                .flatten()
                .skip(len - policy.evaluation_periods)
                .cloned()
                .collect();
            (policy, window, state.last_scale.get(&protocol).copied())
        };

        let current = self.replicas.replica_count(protocol);
        let n = window.len() as f64;
        let avg_cpu = window.iter().map(|s| s.cpu_utilization).sum::<f64>() / n;
        let avg_mem = window.iter().map(|s| s.memory_utilization).sum::<f64>() / n;
        let avg_conn_per_replica = if current > 0 {
            window
                .iter()
                .map(|s| s.connection_count as f64 / current as f64)
                .sum::<f64>()
                / n
        } else {
            0.0
        };

        let cpu_pressure = avg_cpu / policy.target_cpu;
        let mem_pressure = avg_mem / policy.target_memory;
        let conn_pressure = avg_conn_per_replica / policy.target_conn_per_replica as f64;
        let pressure = cpu_pressure.max(mem_pressure).max(conn_pressure);

        let since_last = last_scale.map(|t| t.elapsed());
        let cooled = |cooldown: Duration| since_last.map_or(true, |d| d >= cooldown);

        let decision = if pressure >= policy.scale_up_threshold
            && current < policy.max_replicas
            && cooled(policy.scale_up_cooldown)
        {
            ScaleDecision::ScaleUp
        } else if pressure <= policy.scale_down_threshold
            && current > policy.min_replicas
            && cooled(policy.scale_down_cooldown)
        {
            ScaleDecision::ScaleDown
        } else {
            ScaleDecision::None
        };

        if decision != ScaleDecision::None {
            tracing::info!(
                protocol = %protocol,
                decision = decision.as_str(),
                current,
                cpu_pressure,
                mem_pressure,
                conn_pressure,
                "Scale decision"
            );
        }
        self.record_decision(protocol, decision);
        decision
    }

    fn record_decision(&self, protocol: Protocol, decision: ScaleDecision) {
        self.metrics.increment_counter(
            m::SCALE_DECISIONS,
            &[
                ("protocol", protocol.to_string()),
                ("decision", decision.as_str().to_string()),
            ],
        );
    }

    /// Evaluate every protocol with a policy and execute the results.
    pub fn evaluate(&self) -> Vec<(Protocol, ScaleDecision)> {
        let protocols: Vec<Protocol> = self
            .state
            .read()
            .expect("autoscaler lock poisoned")
            .policies
            .keys()
            .copied()
            .collect();

        protocols
            .into_iter()
            .map(|protocol| {
                let decision = self.evaluate_protocol(protocol);
                if let Some(direction) = decision.direction() {
                    self.execute(protocol, direction);
                }
                (protocol, decision)
            })
            .collect()
    }

    /// Move the logical target one replica and notify the handler.
    fn execute(&self, protocol: Protocol, direction: ScaleDirection) -> ScalingHistory {
        let from = self.replicas.replica_count(protocol);
        let to = match direction {
            ScaleDirection::Up => from + 1,
            ScaleDirection::Down => from.saturating_sub(1),
        };

        let entry = ScalingHistory {
            timestamp_ms: now_millis(),
            protocol,
            direction,
            from,
            to,
            reason: "autoscaling".to_string(),
        };

        {
            let mut state = self.state.write().expect("autoscaler lock poisoned");
            state.last_scale.insert(protocol, Instant::now());
            state.history.push_back(entry.clone());
            while state.history.len() > self.settings.max_history {
                state.history.pop_front();
            }
        }

        self.metrics.increment_counter(
            m::SCALE_OPERATIONS,
            &[
                ("protocol", protocol.to_string()),
                ("direction", direction.as_str().to_string()),
            ],
        );
        self.metrics
            .set_gauge(m::CURRENT_REPLICAS, &[("protocol", protocol.to_string())], to as f64);
        tracing::info!(protocol = %protocol, direction = direction.as_str(), from, to, "Scaling operation executed");

        let handler = self.handler.read().expect("scale handler lock poisoned").clone();
        if let Some(handler) = handler {
            let event = ScaleEvent {
                protocol,
                from,
                to,
                reason: entry.reason.clone(),
            };
            if let Err(e) = handler.on_scale_decision(&event) {
                tracing::warn!(protocol = %protocol, error = %e, "Scale decision handler failed");
            }
        }
        entry
    }

    /// Executed actions, oldest first.
    pub fn history(&self) -> Vec<ScalingHistory> {
        self.state
            .read()
            .expect("autoscaler lock poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AutoscalerStats {
        let state = self.state.read().expect("autoscaler lock poisoned");
        let policies = state
            .policies
            .iter()
            .map(|(protocol, p)| {
                (
                    *protocol,
                    PolicySummary {
                        min_replicas: p.min_replicas,
                        max_replicas: p.max_replicas,
                        target_cpu: p.target_cpu,
                        target_memory: p.target_memory,
                        scale_up_cooldown_secs: p.scale_up_cooldown.as_secs(),
                        scale_down_cooldown_secs: p.scale_down_cooldown.as_secs(),
                    },
                )
            })
            .collect();
        let skip = state.history.len().saturating_sub(RECENT_HISTORY);
        let recent_history = state.history.iter().skip(skip).cloned().collect();
        drop(state);

        AutoscalerStats {
            running: self.is_running(),
            evaluation_interval_secs: self.settings.interval.as_secs(),
            policies,
            recent_history,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("autoscaler task lock poisoned")
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Start the evaluation loop.
    pub fn start(self: &Arc<Self>) -> Result<(), AutoscaleError> {
        let mut slot = self.task.lock().expect("autoscaler task lock poisoned");
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(AutoscaleError::AlreadyRunning);
        }

        let scaler = Arc::clone(self);
        *slot = Some(BackgroundTask::spawn("autoscaler", move |shutdown| {
            scaler.run(shutdown)
        }));
        tracing::info!(interval_secs = self.settings.interval.as_secs(), "Autoscaler started");
        Ok(())
    }

    /// Stop the evaluation loop. No-op when not running.
    pub async fn stop(&self, timeout: Duration) -> Option<StopOutcome> {
        let task = self.task.lock().expect("autoscaler task lock poisoned").take()?;
        let outcome = task.stop(timeout).await;
        tracing::info!(?outcome, "Autoscaler stopped");
        Some(outcome)
    }

    pub(crate) fn take_task(&self) -> Option<BackgroundTask> {
        self.task.lock().expect("autoscaler task lock poisoned").take()
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let start = Instant::now() + self.settings.interval;
        let mut ticker = tokio::time::interval_at(start, self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Autoscaler loop shutting down");
                    break;
                }
            }
        }
    }
}
