//! Blue/green controller.
//!
//! # Responsibilities
//! - Hold at most one [`DeploymentState`] per protocol
//! - Run one stepper task per active canary rollout
//! - Roll back automatically when a step fails
//! - Answer which color a new connection should go to

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::deploy::state::{DeployError, DeploymentColor, DeploymentState, StepOutcome};
use crate::inspector::Protocol;
use crate::lifecycle::supervisor::{self, BackgroundTask, StopOutcome};
use crate::observability::metrics::{self as m, SharedSink};

/// Defaults for rollouts that do not name their own step parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub step_size: u32,
    pub step_duration: Duration,
    /// How often a stepper checks whether its step duration has elapsed.
    pub tick_interval: Duration,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            step_size: 10,
            step_duration: Duration::from_secs(120),
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployStats {
    pub total_deployments: usize,
    pub active_rollouts: usize,
    pub deployments: BTreeMap<Protocol, DeploymentState>,
}

pub struct BlueGreenController {
    deployments: RwLock<HashMap<Protocol, DeploymentState>>,
    steppers: Mutex<HashMap<Protocol, BackgroundTask>>,
    settings: RolloutSettings,
    metrics: SharedSink,
}

impl fmt::Debug for BlueGreenController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueGreenController")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BlueGreenController {
    pub fn new(settings: RolloutSettings, metrics: SharedSink) -> Self {
        Self {
            deployments: RwLock::new(HashMap::new()),
            steppers: Mutex::new(HashMap::new()),
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> RolloutSettings {
        self.settings
    }

    fn report_split(&self, state: &DeploymentState) {
        for color in [DeploymentColor::Blue, DeploymentColor::Green] {
            self.metrics.set_gauge(
                m::BLUEGREEN_SPLIT,
                &[
                    ("protocol", state.protocol.to_string()),
                    ("version", state.version(color).to_string()),
                    ("color", color.to_string()),
                ],
                f64::from(state.weight(color)),
            );
        }
    }

    fn count_deployment(&self, protocol: Protocol, status: &str) {
        self.metrics.increment_counter(
            m::BLUEGREEN_DEPLOYMENTS,
            &[("protocol", protocol.to_string()), ("status", status.to_string())],
        );
    }

    /// Apply `f` to the protocol's deployment under the write lock.
    fn with_deployment<T>(
        &self,
        protocol: Protocol,
        f: impl FnOnce(&mut DeploymentState) -> Result<T, DeployError>,
    ) -> Result<T, DeployError> {
        let mut deployments = self.deployments.write().expect("deployment lock poisoned");
        let state = deployments
            .get_mut(&protocol)
            .ok_or(DeployError::NotInitialized(protocol))?;
        let out = f(state)?;
        self.report_split(state);
        Ok(out)
    }

    /// Create the protocol's deployment on first call (100% blue), then
    /// set the named color's version.
    pub fn initialize_deployment(
        &self,
        protocol: Protocol,
        version: &str,
        color: DeploymentColor,
    ) -> Result<DeploymentState, DeployError> {
        if !protocol.is_known() {
            return Err(DeployError::InvalidProtocol);
        }

        let mut deployments = self.deployments.write().expect("deployment lock poisoned");
        let state = deployments
            .entry(protocol)
            .or_insert_with(|| DeploymentState::new(protocol));
        state.set_version(color, version);
        self.report_split(state);
        let snapshot = state.clone();
        drop(deployments);

        tracing::info!(protocol = %protocol, version, color = %color, "Deployment initialized");
        Ok(snapshot)
    }

    /// Start shifting traffic to `target` step by step.
    ///
    /// `None` step parameters fall back to the controller defaults.
    pub fn start_canary_deployment(
        self: &Arc<Self>,
        protocol: Protocol,
        new_version: &str,
        target: DeploymentColor,
        step_size: Option<u32>,
        step_duration: Option<Duration>,
    ) -> Result<DeploymentState, DeployError> {
        let step_size = step_size.unwrap_or(self.settings.step_size);
        let step_duration = step_duration.unwrap_or(self.settings.step_duration);

        let snapshot = self.with_deployment(protocol, |state| {
            state.begin_canary(new_version, target, step_size, step_duration, Instant::now())?;
            Ok(state.clone())
        })?;
        self.count_deployment(protocol, "started");
        tracing::info!(
            protocol = %protocol,
            new_version,
            target_color = %target,
            step_size,
            ?step_duration,
            "Canary deployment started"
        );

        let controller = Arc::clone(self);
        let task = BackgroundTask::spawn(format!("rollout-{protocol}"), move |shutdown| {
            controller.run_stepper(protocol, shutdown)
        });

        let previous = self
            .steppers
            .lock()
            .expect("stepper lock poisoned")
            .insert(protocol, task);
        // A finished rollout's task may still be winding down.
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(snapshot)
    }

    async fn run_stepper(self: Arc<Self>, protocol: Protocol, mut shutdown: broadcast::Receiver<()>) {
        let tick = self.settings.tick_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.step(protocol) {
                        Ok(StepOutcome::Completed) => {
                            tracing::info!(protocol = %protocol, "Gradual rollout completed");
                            break;
                        }
                        Ok(StepOutcome::Idle) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(protocol = %protocol, error = %e, "Rollout step failed");
                            if let Err(e) = self.rollback(protocol) {
                                tracing::error!(protocol = %protocol, error = %e, "Automatic rollback failed");
                            }
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Run one stepper tick for `protocol`.
    pub fn step(&self, protocol: Protocol) -> Result<StepOutcome, DeployError> {
        let outcome = self.with_deployment(protocol, |state| state.advance(Instant::now()))?;
        match outcome {
            StepOutcome::Stepped | StepOutcome::Completed => {
                if let Some(state) = self.get_deployment_state(protocol) {
                    tracing::debug!(
                        protocol = %protocol,
                        blue_weight = state.blue_weight,
                        green_weight = state.green_weight,
                        "Rollout step completed"
                    );
                }
                if outcome == StepOutcome::Completed {
                    self.count_deployment(protocol, "completed");
                }
            }
            StepOutcome::Idle | StepOutcome::Waiting => {}
        }
        Ok(outcome)
    }

    /// Move all traffic to `target` in one update.
    pub fn instant_switch(
        &self,
        protocol: Protocol,
        target: DeploymentColor,
    ) -> Result<DeploymentState, DeployError> {
        let snapshot = self.with_deployment(protocol, |state| {
            state.switch_to(target, Instant::now());
            Ok(state.clone())
        })?;
        self.count_deployment(protocol, "instant_switch");
        tracing::info!(protocol = %protocol, target_color = %target, "Instant switch completed");
        Ok(snapshot)
    }

    /// Flip the active color to its complement at full weight.
    pub fn rollback(&self, protocol: Protocol) -> Result<DeploymentState, DeployError> {
        let snapshot = self.with_deployment(protocol, |state| {
            state.rollback(Instant::now());
            Ok(state.clone())
        })?;
        self.metrics.increment_counter(m::BLUEGREEN_ROLLBACKS, &[]);
        tracing::warn!(protocol = %protocol, active_color = %snapshot.active_color, "Deployment rolled back");
        Ok(snapshot)
    }

    pub fn get_deployment_state(&self, protocol: Protocol) -> Option<DeploymentState> {
        self.deployments
            .read()
            .expect("deployment lock poisoned")
            .get(&protocol)
            .cloned()
    }

    /// Color for a connection given a uniform `random_value` in 0..100.
    pub fn should_route_to_color(
        &self,
        protocol: Protocol,
        random_value: u32,
    ) -> Result<DeploymentColor, DeployError> {
        self.deployments
            .read()
            .expect("deployment lock poisoned")
            .get(&protocol)
            .map(|state| state.pick_color(random_value))
            .ok_or(DeployError::NotInitialized(protocol))
    }

    /// Version string new connections for `protocol` should prefer.
    ///
    /// `None` when no deployment exists or the chosen color has no version.
    pub fn preferred_version(&self, protocol: Protocol, random_value: u32) -> Option<String> {
        let deployments = self.deployments.read().expect("deployment lock poisoned");
        let state = deployments.get(&protocol)?;
        let version = state.version(state.pick_color(random_value));
        (!version.is_empty()).then(|| version.to_string())
    }

    pub fn stats(&self) -> DeployStats {
        let deployments: BTreeMap<Protocol, DeploymentState> = self
            .deployments
            .read()
            .expect("deployment lock poisoned")
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect();
        let active_rollouts = deployments.values().filter(|s| s.is_rolling_out()).count();
        DeployStats {
            total_deployments: deployments.len(),
            active_rollouts,
            deployments,
        }
    }

    /// Overwrite the raw split, bypassing the state machine.
    #[cfg(test)]
    pub(crate) fn force_weights(&self, protocol: Protocol, blue: u32, green: u32) {
        let mut deployments = self.deployments.write().expect("deployment lock poisoned");
        if let Some(state) = deployments.get_mut(&protocol) {
            state.blue_weight = blue;
            state.green_weight = green;
        }
    }

    pub(crate) fn take_steppers(&self) -> Vec<BackgroundTask> {
        self.steppers
            .lock()
            .expect("stepper lock poisoned")
            .drain()
            .map(|(_, task)| task)
            .collect()
    }

    /// Stop every stepper, waiting at most `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Vec<(String, StopOutcome)> {
        let outcomes = supervisor::stop_all(self.take_steppers(), timeout).await;
        tracing::info!(steppers = outcomes.len(), "Blue/green controller stopped");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::state::DeploymentStatus;
    use crate::observability::metrics::RecordingSink;

    fn controller() -> (Arc<BlueGreenController>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let settings = RolloutSettings {
            step_size: 10,
            step_duration: Duration::from_secs(2),
            tick_interval: Duration::from_millis(500),
        };
        (Arc::new(BlueGreenController::new(settings, sink.clone())), sink)
    }

    #[test]
    fn test_initialize_defaults_and_updates_version() {
        let (c, sink) = controller();
        let state = c
            .initialize_deployment(Protocol::Http, "v1", DeploymentColor::Blue)
            .unwrap();
        assert_eq!((state.blue_weight, state.green_weight), (100, 0));
        assert_eq!(state.status, DeploymentStatus::Stable);

        assert_eq!(c.stats().total_deployments, 1);
        let state = c
            .initialize_deployment(Protocol::Http, "v2", DeploymentColor::Green)
            .unwrap();
        assert_eq!(state.blue_version, "v1");
        assert_eq!(state.green_version, "v2");
        assert_eq!(state.blue_weight, 100);

        assert_eq!(
            sink.gauge(m::BLUEGREEN_SPLIT, &[("protocol", "HTTP"), ("version", "v1"), ("color", "blue")]),
            Some(100.0)
        );
        assert_eq!(
            c.initialize_deployment(Protocol::Unknown, "v1", DeploymentColor::Blue),
            Err(DeployError::InvalidProtocol)
        );
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let (c, _) = controller();
        assert_eq!(
            c.start_canary_deployment(Protocol::Redis, "v2", DeploymentColor::Green, None, None)
                .unwrap_err(),
            DeployError::NotInitialized(Protocol::Redis)
        );
        assert!(c.instant_switch(Protocol::Redis, DeploymentColor::Green).is_err());
        assert!(c.rollback(Protocol::Redis).is_err());
        assert!(c.should_route_to_color(Protocol::Redis, 10).is_err());
        assert!(c.get_deployment_state(Protocol::Redis).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepper_converges_and_exits() {
        let (c, sink) = controller();
        c.initialize_deployment(Protocol::Http, "v1", DeploymentColor::Blue).unwrap();
        c.start_canary_deployment(Protocol::Http, "v2", DeploymentColor::Green, None, None)
            .unwrap();

        assert_eq!(
            c.start_canary_deployment(Protocol::Http, "v3", DeploymentColor::Green, None, None)
                .unwrap_err(),
            DeployError::RolloutInProgress(Protocol::Http)
        );

        // Ten 2s steps, plus slack for tick alignment.
        tokio::time::sleep(Duration::from_secs(23)).await;

        let state = c.get_deployment_state(Protocol::Http).unwrap();
        assert_eq!((state.blue_weight, state.green_weight), (0, 100));
        assert_eq!(state.active_color, DeploymentColor::Green);
        assert_eq!(state.status, DeploymentStatus::Stable);
        assert_eq!(
            sink.counter(m::BLUEGREEN_DEPLOYMENTS, &[("protocol", "HTTP"), ("status", "started")]),
            1
        );
        assert_eq!(
            sink.counter(m::BLUEGREEN_DEPLOYMENTS, &[("protocol", "HTTP"), ("status", "completed")]),
            1
        );

        let outcomes = c.stop(Duration::from_secs(1)).await;
        assert_eq!(outcomes, vec![("rollout-HTTP".to_string(), StopOutcome::Joined)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_split_triggers_rollback() {
        let (c, sink) = controller();
        c.initialize_deployment(Protocol::Redis, "v1", DeploymentColor::Blue).unwrap();
        c.initialize_deployment(Protocol::Redis, "v0", DeploymentColor::Green).unwrap();
        c.start_canary_deployment(Protocol::Redis, "v2", DeploymentColor::Green, None, None)
            .unwrap();

        c.force_weights(Protocol::Redis, 70, 20);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let state = c.get_deployment_state(Protocol::Redis).unwrap();
        assert_eq!(state.status, DeploymentStatus::Rollback);
        assert_eq!(state.blue_weight + state.green_weight, 100);
        assert!(!state.is_rolling_out());
        assert_eq!(sink.counter(m::BLUEGREEN_ROLLBACKS, &[]), 1);

        // The stepper exits after rolling back.
        let outcomes = c.stop(Duration::from_secs(1)).await;
        assert_eq!(outcomes, vec![("rollout-Redis".to_string(), StopOutcome::Joined)]);
        assert_eq!(sink.counter(m::BLUEGREEN_ROLLBACKS, &[]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_switch_ends_rollout() {
        let (c, _) = controller();
        c.initialize_deployment(Protocol::MySql, "v1", DeploymentColor::Blue).unwrap();
        c.start_canary_deployment(Protocol::MySql, "v2", DeploymentColor::Green, Some(10), None)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = c.instant_switch(Protocol::MySql, DeploymentColor::Green).unwrap();
        assert_eq!((state.blue_weight, state.green_weight), (0, 100));
        assert_eq!(state.status, DeploymentStatus::Stable);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let state = c.get_deployment_state(Protocol::MySql).unwrap();
        assert_eq!(state.green_weight, 100);
        c.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rollback_and_color_choice() {
        let (c, sink) = controller();
        c.initialize_deployment(Protocol::Http, "v1", DeploymentColor::Blue).unwrap();
        c.initialize_deployment(Protocol::Http, "v2", DeploymentColor::Green).unwrap();

        assert_eq!(c.should_route_to_color(Protocol::Http, 99), Ok(DeploymentColor::Blue));
        assert_eq!(c.preferred_version(Protocol::Http, 50).as_deref(), Some("v1"));

        let state = c.rollback(Protocol::Http).unwrap();
        assert_eq!(state.active_color, DeploymentColor::Green);
        assert_eq!(c.should_route_to_color(Protocol::Http, 0), Ok(DeploymentColor::Green));
        assert_eq!(c.preferred_version(Protocol::Http, 0).as_deref(), Some("v2"));
        assert_eq!(sink.counter_total(m::BLUEGREEN_ROLLBACKS), 1);
    }
}
