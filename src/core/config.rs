#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunables for one engine instance.
///
/// The shape of the engine (state size and action categories) is passed to
/// the constructor separately; everything here is a rate, threshold or
/// capacity. All fields are persisted in snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SingularityConfig {
    // --- temporal smearing ---
    /// Weight of the previous trace when blending a new observation, in (0, 1).
    pub smear_decay: f32,
    /// Norm ceiling for the smeared trace and the perturbed state.
    pub smear_ceiling: f32,
    /// Gain applied to each observation scalar before injection.
    pub injection_gain: f32,
    /// Phase precession step of the trace per tick.
    pub wave_dt: f32,

    // --- field memory ---
    pub attractor_capacity: usize,
    pub coupling_capacity: usize,
    /// Minimum reward that reinforces field memory.
    pub reward_threshold: f32,
    /// Distance inside which a reward strengthens an existing attractor.
    pub capture_radius: f32,
    pub attractor_gain: f32,
    pub attractor_max_strength: f32,
    /// Per-tick retention of attractors well below the event horizon.
    pub attractor_decay: f32,
    /// Strength above which decay is suppressed ("orbit").
    pub event_horizon: f32,
    /// Width of the smooth transition below the event horizon.
    pub horizon_width: f32,
    /// Residual per-tick loss in orbit.
    pub orbit_leak: f32,
    pub attractor_floor: f32,
    pub gravity_gain: f32,
    /// Max engine ticks between two reinforcements for them to couple.
    pub coupling_window: u32,
    pub coupling_gain: f32,
    pub coupling_decay: f32,
    pub coupling_floor: f32,
    pub activation_radius: f32,
    pub jump_gain: f32,

    // --- projection / selection ---
    pub learning_rate: f32,
    pub weight_limit: f32,
    pub momentum_decay: f32,
    pub momentum_gain: f32,
    pub fatigue_decay: f32,
    pub fatigue_gain: f32,
    pub fatigue_penalty: f32,
    /// Exploration strength: softmax temperature scale and visit bonus.
    pub exploration_beta: f32,

    // --- homeostasis ---
    pub initial_temperature: f32,
    pub max_temperature: f32,
    pub heat_gain: f32,
    pub cool_gain: f32,
    pub temperature_retention: f32,
    pub frustration_gain: f32,
    pub frustration_decay: f32,
    pub adrenaline_threshold: f32,
    pub adrenaline_gain: f32,
    pub adrenaline_decay: f32,

    // --- rules / inverse learning ---
    pub max_rules: usize,
    pub inferred_rule_capacity: usize,
    pub inferred_rule_rate: f32,
    pub imitation_reward: f32,
    pub imitation_margin: f32,

    /// Seed for the exploration PRNG. `None` uses a fixed default seed so
    /// that two engines built from the same config behave identically.
    pub seed: Option<u64>,
}

impl Default for SingularityConfig {
    fn default() -> Self {
        Self {
            smear_decay: 0.6,
            smear_ceiling: 1.0,
            injection_gain: 1.0,
            wave_dt: 0.05,

            attractor_capacity: 16,
            coupling_capacity: 32,
            reward_threshold: 0.5,
            capture_radius: 0.35,
            attractor_gain: 0.25,
            attractor_max_strength: 4.0,
            attractor_decay: 0.98,
            event_horizon: 2.0,
            horizon_width: 0.5,
            orbit_leak: 1e-6,
            attractor_floor: 0.05,
            gravity_gain: 0.05,
            coupling_window: 8,
            coupling_gain: 0.2,
            coupling_decay: 0.995,
            coupling_floor: 0.02,
            activation_radius: 0.5,
            jump_gain: 0.05,

            learning_rate: 0.1,
            weight_limit: 4.0,
            momentum_decay: 0.8,
            momentum_gain: 0.2,
            fatigue_decay: 0.9,
            fatigue_gain: 0.1,
            fatigue_penalty: 0.5,
            exploration_beta: 0.25,

            initial_temperature: 0.5,
            max_temperature: 2.0,
            heat_gain: 0.25,
            cool_gain: 0.45,
            temperature_retention: 0.94,
            frustration_gain: 0.2,
            frustration_decay: 0.9,
            adrenaline_threshold: 0.8,
            adrenaline_gain: 0.5,
            adrenaline_decay: 0.9,

            max_rules: 4096,
            inferred_rule_capacity: 64,
            inferred_rule_rate: 0.1,
            imitation_reward: 1.0,
            imitation_margin: 0.25,

            seed: None,
        }
    }
}

impl SingularityConfig {
    /// Minimum allowed state size (4 affective slots + 4 general slots).
    pub const MIN_STATE_SIZE: usize = 8;
    /// Maximum allowed state size.
    pub const MAX_STATE_SIZE: usize = 1 << 20;
    /// Upper bound on attractor and coupling capacities (ids are u16).
    pub const MAX_FIELD_CAPACITY: usize = u16::MAX as usize;

    /// Parse a config from JSON; missing fields fall back to defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the exploration PRNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_learning_rate(mut self, rate: f32) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_exploration_beta(mut self, beta: f32) -> Self {
        self.exploration_beta = beta;
        self
    }

    /// Set attractor and coupling capacities together.
    pub fn with_field_capacity(mut self, attractors: usize, couplings: usize) -> Self {
        self.attractor_capacity = attractors;
        self.coupling_capacity = couplings;
        self
    }

    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        fn unit_open(x: f32) -> bool {
            x.is_finite() && x > 0.0 && x < 1.0
        }
        fn unit_closed(x: f32) -> bool {
            x.is_finite() && (0.0..=1.0).contains(&x)
        }
        fn non_negative(x: f32) -> bool {
            x.is_finite() && x >= 0.0
        }
        fn positive(x: f32) -> bool {
            x.is_finite() && x > 0.0
        }

        if !unit_open(self.smear_decay) {
            return Err("smear_decay must be in (0, 1)");
        }
        if !positive(self.smear_ceiling) {
            return Err("smear_ceiling must be finite and > 0");
        }
        if !non_negative(self.injection_gain) {
            return Err("injection_gain must be finite and >= 0");
        }
        if !non_negative(self.wave_dt) {
            return Err("wave_dt must be finite and >= 0");
        }

        if self.attractor_capacity == 0 || self.attractor_capacity > Self::MAX_FIELD_CAPACITY {
            return Err("attractor_capacity must be in [1, 65535]");
        }
        if self.coupling_capacity > Self::MAX_FIELD_CAPACITY {
            return Err("coupling_capacity must be <= 65535");
        }
        if !non_negative(self.reward_threshold) {
            return Err("reward_threshold must be finite and >= 0");
        }
        if !positive(self.capture_radius) {
            return Err("capture_radius must be finite and > 0");
        }
        if !positive(self.attractor_gain) {
            return Err("attractor_gain must be finite and > 0");
        }
        if !positive(self.event_horizon) {
            return Err("event_horizon must be finite and > 0");
        }
        if !positive(self.horizon_width) || self.horizon_width > self.event_horizon {
            return Err("horizon_width must be in (0, event_horizon]");
        }
        if !self.attractor_max_strength.is_finite()
            || self.attractor_max_strength < self.event_horizon
        {
            return Err("attractor_max_strength must be >= event_horizon");
        }
        if !unit_open(self.attractor_decay) {
            return Err("attractor_decay must be in (0, 1)");
        }
        if !unit_closed(self.orbit_leak) || self.orbit_leak >= 1.0 - self.attractor_decay {
            return Err("orbit_leak must be in [0, 1 - attractor_decay)");
        }
        if !positive(self.attractor_floor) || self.attractor_floor >= self.event_horizon {
            return Err("attractor_floor must be in (0, event_horizon)");
        }
        if !non_negative(self.gravity_gain) {
            return Err("gravity_gain must be finite and >= 0");
        }
        if !non_negative(self.coupling_gain) {
            return Err("coupling_gain must be finite and >= 0");
        }
        if !unit_open(self.coupling_decay) || self.coupling_decay < self.attractor_decay {
            return Err("coupling_decay must be in [attractor_decay, 1)");
        }
        if !non_negative(self.coupling_floor) {
            return Err("coupling_floor must be finite and >= 0");
        }
        if !non_negative(self.activation_radius) {
            return Err("activation_radius must be finite and >= 0");
        }
        if !non_negative(self.jump_gain) {
            return Err("jump_gain must be finite and >= 0");
        }

        if !positive(self.learning_rate) || self.learning_rate > 1.0 {
            return Err("learning_rate must be in (0, 1]");
        }
        if !positive(self.weight_limit) {
            return Err("weight_limit must be finite and > 0");
        }
        if !unit_closed(self.momentum_decay) {
            return Err("momentum_decay must be in [0, 1]");
        }
        if !non_negative(self.momentum_gain) {
            return Err("momentum_gain must be finite and >= 0");
        }
        if !unit_closed(self.fatigue_decay) {
            return Err("fatigue_decay must be in [0, 1]");
        }
        if !non_negative(self.fatigue_gain) || !non_negative(self.fatigue_penalty) {
            return Err("fatigue_gain and fatigue_penalty must be finite and >= 0");
        }
        if !non_negative(self.exploration_beta) {
            return Err("exploration_beta must be finite and >= 0");
        }

        if !positive(self.max_temperature) {
            return Err("max_temperature must be finite and > 0");
        }
        if !non_negative(self.initial_temperature)
            || self.initial_temperature > self.max_temperature
        {
            return Err("initial_temperature must be in [0, max_temperature]");
        }
        if !non_negative(self.heat_gain) || !non_negative(self.cool_gain) {
            return Err("heat_gain and cool_gain must be finite and >= 0");
        }
        if !unit_closed(self.temperature_retention) {
            return Err("temperature_retention must be in [0, 1]");
        }
        if !non_negative(self.frustration_gain) || !unit_closed(self.frustration_decay) {
            return Err("frustration_gain must be >= 0 and frustration_decay in [0, 1]");
        }
        if !non_negative(self.adrenaline_threshold)
            || !non_negative(self.adrenaline_gain)
            || !unit_closed(self.adrenaline_decay)
        {
            return Err("adrenaline parameters out of range");
        }

        if self.max_rules == 0 {
            return Err("max_rules must be >= 1");
        }
        if !unit_closed(self.inferred_rule_rate) {
            return Err("inferred_rule_rate must be in [0, 1]");
        }
        if !self.imitation_reward.is_finite() || !non_negative(self.imitation_margin) {
            return Err("imitation_reward must be finite and imitation_margin >= 0");
        }
        Ok(())
    }
}
