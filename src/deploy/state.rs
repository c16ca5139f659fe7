//! Per-protocol deployment state and its step transition.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::inspector::Protocol;
use crate::load_balancer::endpoint::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("deployments require a known protocol")]
    InvalidProtocol,

    #[error("no deployment initialized for {0}")]
    NotInitialized(Protocol),

    #[error("a rollout is already in progress for {0}")]
    RolloutInProgress(Protocol),

    #[error("invalid rollout step: {0}")]
    InvalidStep(String),

    #[error("weights out of balance: blue {blue} + green {green} != 100")]
    WeightInvariant { blue: u32, green: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentColor {
    Blue,
    Green,
}

impl DeploymentColor {
    pub fn complement(self) -> Self {
        match self {
            DeploymentColor::Blue => DeploymentColor::Green,
            DeploymentColor::Green => DeploymentColor::Blue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentColor::Blue => "blue",
            DeploymentColor::Green => "green",
        }
    }
}

impl fmt::Display for DeploymentColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Stable,
    Canary,
    Rollback,
}

/// Result of one stepper tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not in canary; the stepper has nothing to do.
    Idle,
    /// Step duration has not elapsed yet.
    Waiting,
    /// Weights moved one step.
    Stepped,
    /// Weights reached their targets; status is stable again.
    Completed,
}

/// Traffic split between two versions of one protocol's modules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentState {
    pub protocol: Protocol,
    pub blue_version: String,
    pub green_version: String,
    pub active_color: DeploymentColor,
    pub blue_weight: u32,
    pub green_weight: u32,
    pub status: DeploymentStatus,
    pub target_blue: u32,
    pub target_green: u32,
    pub step_size: u32,
    #[serde(serialize_with = "secs")]
    pub step_duration: Duration,
    pub started_at_ms: u64,
    pub last_update_ms: u64,
    #[serde(skip)]
    pub(crate) last_update: Instant,
}

fn secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl DeploymentState {
    /// Fresh deployment: all traffic on blue.
    pub fn new(protocol: Protocol) -> Self {
        let now = now_millis();
        Self {
            protocol,
            blue_version: String::new(),
            green_version: String::new(),
            active_color: DeploymentColor::Blue,
            blue_weight: 100,
            green_weight: 0,
            status: DeploymentStatus::Stable,
            target_blue: 100,
            target_green: 0,
            step_size: 0,
            step_duration: Duration::ZERO,
            started_at_ms: now,
            last_update_ms: now,
            last_update: Instant::now(),
        }
    }

    pub fn version(&self, color: DeploymentColor) -> &str {
        match color {
            DeploymentColor::Blue => &self.blue_version,
            DeploymentColor::Green => &self.green_version,
        }
    }

    pub fn set_version(&mut self, color: DeploymentColor, version: impl Into<String>) {
        match color {
            DeploymentColor::Blue => self.blue_version = version.into(),
            DeploymentColor::Green => self.green_version = version.into(),
        }
    }

    pub fn weight(&self, color: DeploymentColor) -> u32 {
        match color {
            DeploymentColor::Blue => self.blue_weight,
            DeploymentColor::Green => self.green_weight,
        }
    }

    pub fn is_rolling_out(&self) -> bool {
        self.status == DeploymentStatus::Canary
    }

    /// Blue when `random_value` (0..100) falls under the blue weight.
    pub fn pick_color(&self, random_value: u32) -> DeploymentColor {
        if random_value < self.blue_weight {
            DeploymentColor::Blue
        } else {
            DeploymentColor::Green
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_update = now;
        self.last_update_ms = now_millis();
    }

    fn put_full_weight_on(&mut self, color: DeploymentColor) {
        let (blue, green) = match color {
            DeploymentColor::Blue => (100, 0),
            DeploymentColor::Green => (0, 100),
        };
        self.blue_weight = blue;
        self.green_weight = green;
        self.active_color = color;
    }

    /// Begin a gradual shift of all traffic to `target`.
    pub fn begin_canary(
        &mut self,
        version: impl Into<String>,
        target: DeploymentColor,
        step_size: u32,
        step_duration: Duration,
        now: Instant,
    ) -> Result<(), DeployError> {
        if self.is_rolling_out() {
            return Err(DeployError::RolloutInProgress(self.protocol));
        }
        if step_size == 0 || step_size > 100 {
            return Err(DeployError::InvalidStep(format!(
                "step size {step_size} outside 1..=100"
            )));
        }
        if step_duration.is_zero() {
            return Err(DeployError::InvalidStep("step duration must be positive".into()));
        }

        self.set_version(target, version);
        (self.target_blue, self.target_green) = match target {
            DeploymentColor::Blue => (100, 0),
            DeploymentColor::Green => (0, 100),
        };
        self.status = DeploymentStatus::Canary;
        self.step_size = step_size;
        self.step_duration = step_duration;
        self.touch(now);
        Ok(())
    }

    /// Advance a canary by at most one step, gated on `step_duration`.
    pub fn advance(&mut self, now: Instant) -> Result<StepOutcome, DeployError> {
        if self.status != DeploymentStatus::Canary {
            return Ok(StepOutcome::Idle);
        }
        if self.blue_weight + self.green_weight != 100 {
            return Err(DeployError::WeightInvariant {
                blue: self.blue_weight,
                green: self.green_weight,
            });
        }
        if now.duration_since(self.last_update) < self.step_duration {
            return Ok(StepOutcome::Waiting);
        }

        if self.target_blue > self.blue_weight {
            self.blue_weight = (self.blue_weight + self.step_size).min(self.target_blue);
            self.green_weight = 100 - self.blue_weight;
        } else if self.target_green > self.green_weight {
            self.green_weight = (self.green_weight + self.step_size).min(self.target_green);
            self.blue_weight = 100 - self.green_weight;
        }
        self.touch(now);

        if self.blue_weight == self.target_blue && self.green_weight == self.target_green {
            self.status = DeploymentStatus::Stable;
            self.active_color = if self.blue_weight == 100 {
                DeploymentColor::Blue
            } else {
                DeploymentColor::Green
            };
            return Ok(StepOutcome::Completed);
        }
        Ok(StepOutcome::Stepped)
    }

    /// All traffic to `target` at once.
    pub fn switch_to(&mut self, target: DeploymentColor, now: Instant) {
        self.put_full_weight_on(target);
        self.target_blue = self.blue_weight;
        self.target_green = self.green_weight;
        self.status = DeploymentStatus::Stable;
        self.touch(now);
    }

    /// Flip to the complement of the active color at full weight.
    pub fn rollback(&mut self, now: Instant) {
        self.put_full_weight_on(self.active_color.complement());
        self.target_blue = self.blue_weight;
        self.target_green = self.green_weight;
        self.status = DeploymentStatus::Rollback;
        self.touch(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_canary_converges_in_gated_steps() {
        let mut state = DeploymentState::new(Protocol::Http);
        state.set_version(DeploymentColor::Blue, "v1");
        let step = Duration::from_secs(2);
        state
            .begin_canary("v2", DeploymentColor::Green, 10, step, Instant::now())
            .unwrap();

        assert_eq!(state.advance(Instant::now()), Ok(StepOutcome::Waiting));

        let mut steps = 0;
        loop {
            tokio::time::advance(step).await;
            steps += 1;
            match state.advance(Instant::now()).unwrap() {
                StepOutcome::Stepped => {
                    assert_eq!(state.blue_weight + state.green_weight, 100);
                    assert_eq!(state.green_weight, steps * 10);
                }
                StepOutcome::Completed => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(steps, 10);
        assert_eq!((state.blue_weight, state.green_weight), (0, 100));
        assert_eq!(state.status, DeploymentStatus::Stable);
        assert_eq!(state.active_color, DeploymentColor::Green);
        assert_eq!(state.green_version, "v2");
        assert_eq!(state.advance(Instant::now()), Ok(StepOutcome::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_step_is_clamped() {
        let mut state = DeploymentState::new(Protocol::Redis);
        state
            .begin_canary("v2", DeploymentColor::Green, 30, Duration::from_secs(1), Instant::now())
            .unwrap();
        let mut weights = Vec::new();
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            state.advance(Instant::now()).unwrap();
            weights.push(state.green_weight);
        }
        assert_eq!(weights, [30, 60, 90, 100]);
    }

    #[test]
    fn test_second_canary_rejected() {
        let mut state = DeploymentState::new(Protocol::Http);
        let now = Instant::now();
        state
            .begin_canary("v2", DeploymentColor::Green, 10, Duration::from_secs(1), now)
            .unwrap();
        assert_eq!(
            state.begin_canary("v3", DeploymentColor::Green, 10, Duration::from_secs(1), now),
            Err(DeployError::RolloutInProgress(Protocol::Http))
        );
    }

    #[test]
    fn test_invalid_step_rejected() {
        let mut state = DeploymentState::new(Protocol::Http);
        let now = Instant::now();
        assert!(state
            .begin_canary("v2", DeploymentColor::Green, 0, Duration::from_secs(1), now)
            .is_err());
        assert!(state
            .begin_canary("v2", DeploymentColor::Green, 101, Duration::from_secs(1), now)
            .is_err());
        assert!(state
            .begin_canary("v2", DeploymentColor::Green, 10, Duration::ZERO, now)
            .is_err());
        assert_eq!(state.status, DeploymentStatus::Stable);
    }

    #[test]
    fn test_rollback_flips_from_any_state() {
        let now = Instant::now();
        let mut state = DeploymentState::new(Protocol::MySql);
        state.rollback(now);
        assert_eq!(state.active_color, DeploymentColor::Green);
        assert_eq!((state.blue_weight, state.green_weight), (0, 100));
        assert_eq!(state.status, DeploymentStatus::Rollback);

        state.rollback(now);
        assert_eq!(state.active_color, DeploymentColor::Blue);
        assert_eq!((state.blue_weight, state.green_weight), (100, 0));

        state
            .begin_canary("v2", DeploymentColor::Green, 10, Duration::from_secs(1), now)
            .unwrap();
        state.rollback(now);
        assert_eq!(state.active_color, DeploymentColor::Green);
        assert!(!state.is_rolling_out());
    }

    #[test]
    fn test_pick_color_threshold() {
        let mut state = DeploymentState::new(Protocol::Http);
        state.blue_weight = 30;
        state.green_weight = 70;
        assert_eq!(state.pick_color(0), DeploymentColor::Blue);
        assert_eq!(state.pick_color(29), DeploymentColor::Blue);
        assert_eq!(state.pick_color(30), DeploymentColor::Green);
        assert_eq!(state.pick_color(99), DeploymentColor::Green);
    }

    #[test]
    fn test_broken_weights_are_an_error() {
        let now = Instant::now();
        let mut state = DeploymentState::new(Protocol::Http);
        state
            .begin_canary("v2", DeploymentColor::Green, 10, Duration::from_secs(1), now)
            .unwrap();
        state.green_weight = 50;
        assert_eq!(
            state.advance(now),
            Err(DeployError::WeightInvariant { blue: 100, green: 50 })
        );
    }
}
