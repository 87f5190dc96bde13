//! The engine: one instance per agent, owning every subsystem.
//!
//! Per tick: observation -> temporal smearing -> field perturbation ->
//! affect axes written into the reserved slots -> rule bias -> projection
//! and choice. Outcomes come back through `learn`, `learn_multi` or
//! `observe` (see `learning.rs`); checkpoints through `snapshot.rs`.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::affect::AffectCircuit;
use crate::config::SingularityConfig;
use crate::error::{ensure_all_finite, ensure_finite, SingularityError, SingularityResult};
use crate::field::FieldMemory;
use crate::prng::Prng;
use crate::projector::{ActionLayout, ActionProjector, ExecutionTier, ThermalPhase};
use crate::rules::HamiltonianRuleSet;
use crate::wave::{TemporalSmear, WaveState, AFFECT_SLOTS};

// Upper bound on projection weights per complex component.
const MAX_WEIGHT_ROWS_TIMES_DIM: usize = 1 << 28;
// Upper bound on attractor location floats per complex component.
const MAX_ATTRACTOR_SLOTS_TIMES_DIM: usize = 1 << 28;

/// Read-only summary of the engine's derived metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineStatus {
    pub temperature: f32,
    pub phase: ThermalPhase,
    pub frustration: f32,
    pub adrenaline: f32,
    pub glia_activity: f32,
    pub attractors: usize,
    pub couplings: usize,
    pub tick: u64,
}

/// Fixed-memory wave-state decision engine.
///
/// ```
/// use singularity::Singularity;
///
/// let mut engine = Singularity::new(64, &[5, 3]).unwrap();
/// let actions = engine.select_actions(&[0.2, -0.1, 0.4]).unwrap();
/// assert_eq!(actions.len(), 2);
/// engine.learn(1.0).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Singularity {
    pub(crate) cfg: SingularityConfig,
    pub(crate) state_size: usize,
    pub(crate) smear: TemporalSmear,
    // Smeared, perturbed state with affect axes; what the projector sees.
    pub(crate) wave: WaveState,
    pub(crate) field: FieldMemory,
    pub(crate) rules: HamiltonianRuleSet,
    pub(crate) projector: ActionProjector,
    pub(crate) affect: AffectCircuit,
    pub(crate) prng: Prng,
    pub(crate) tick: u64,

    pub(crate) temperature: f32,
    pub(crate) frustration: f32,
    pub(crate) adrenaline: f32,
    pub(crate) exploration_beta: f32,

    // Credit trace of the most recent selection.
    pub(crate) has_selection: bool,
    pub(crate) last_actions: Vec<usize>,
    pub(crate) last_state: WaveState,
}

impl Singularity {
    pub fn new(state_size: usize, category_sizes: &[usize]) -> SingularityResult<Self> {
        Self::with_config(state_size, category_sizes, SingularityConfig::default())
    }

    pub fn with_config(
        state_size: usize,
        category_sizes: &[usize],
        cfg: SingularityConfig,
    ) -> SingularityResult<Self> {
        cfg.validate()
            .map_err(|msg| SingularityError::InvalidConfiguration(msg.to_string()))?;
        validate_shape(state_size, category_sizes, &cfg)?;

        let layout = ActionLayout::new(category_sizes);
        let categories = layout.categories();
        let total = layout.total();
        Ok(Self {
            cfg,
            state_size,
            smear: TemporalSmear::new(state_size, &cfg),
            wave: WaveState::zeros(state_size),
            field: FieldMemory::new(state_size, &cfg),
            rules: HamiltonianRuleSet::new(total, &cfg),
            projector: ActionProjector::new(state_size, layout, &cfg),
            affect: AffectCircuit::new(),
            prng: Prng::new(cfg.seed.unwrap_or(1)),
            tick: 0,
            temperature: cfg.initial_temperature,
            frustration: 0.0,
            adrenaline: 0.0,
            exploration_beta: cfg.exploration_beta,
            has_selection: false,
            last_actions: vec![0; categories],
            last_state: WaveState::zeros(state_size),
        })
    }

    pub fn config(&self) -> &SingularityConfig {
        &self.cfg
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    pub fn category_sizes(&self) -> &[usize] {
        self.projector.layout().sizes()
    }

    pub fn layout(&self) -> &ActionLayout {
        self.projector.layout()
    }

    /// Number of observations injected so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Run the perception half of a tick without choosing.
    ///
    /// Observations must be finite; they fold onto the general-purpose
    /// slots when longer than the state.
    pub fn inject(&mut self, observation: &[f32]) -> SingularityResult<&WaveState> {
        ensure_all_finite("observation", observation)?;

        let smeared = self.smear.inject(observation);
        self.wave.copy_from(smeared);
        self.field.perturb(&mut self.wave);
        for (i, s) in self.affect.states().into_iter().enumerate() {
            self.wave.set_amplitude(i, s);
        }

        self.tick += 1;
        self.adrenaline *= self.cfg.adrenaline_decay;
        Ok(&self.wave)
    }

    /// Inject `observation` and choose one action per category.
    ///
    /// Returns local indices (one per category, each below that category's
    /// size). The choice is remembered for the next `learn`.
    pub fn select_actions(&mut self, observation: &[f32]) -> SingularityResult<Vec<usize>> {
        self.inject(observation)?;
        let flat = self.projector.select(
            &self.wave,
            &self.rules,
            self.temperature,
            self.exploration_beta,
            &mut self.prng,
        );

        let layout = self.projector.layout();
        let local = flat
            .iter()
            .enumerate()
            .map(|(c, &a)| a - layout.offset(c))
            .collect();
        self.last_actions.copy_from_slice(&flat);
        self.last_state.copy_from(&self.wave);
        self.has_selection = true;
        Ok(local)
    }

    /// Category-0 choice for single-category hosts.
    pub fn select_action(&mut self, observation: &[f32]) -> SingularityResult<usize> {
        Ok(self.select_actions(observation)?[0])
    }

    /// Age field memory by one step. Returns the number of evicted attractors.
    pub fn decay_tick(&mut self) -> usize {
        self.field.decay_tick()
    }

    pub fn register_rule(
        &mut self,
        condition_id: i32,
        action: usize,
        strength: f32,
    ) -> SingularityResult<()> {
        self.rules.register(condition_id, action, strength)
    }

    /// Register rules zipped from three equal-length sequences. Action
    /// indices are flat across categories.
    pub fn register_rules(
        &mut self,
        condition_ids: &[i32],
        actions: &[usize],
        strengths: &[f32],
    ) -> SingularityResult<()> {
        self.rules.register_many(condition_ids, actions, strengths)
    }

    /// Replace the active condition set (empty clears all rule bias).
    pub fn set_active_conditions(&mut self, ids: &[i32]) {
        self.rules.set_active_conditions(ids);
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn phase(&self) -> ThermalPhase {
        ThermalPhase::from_temperature(self.temperature)
    }

    pub fn frustration(&self) -> f32 {
        self.frustration
    }

    pub fn adrenaline(&self) -> f32 {
        self.adrenaline
    }

    /// Aggregate field-memory load in [0, 1].
    pub fn glia_activity(&self) -> f32 {
        self.field.load()
    }

    /// Score of a flat action against the current state, without the
    /// exploration bonus. `None` if the index is out of range.
    pub fn action_score(&self, flat: usize) -> Option<f32> {
        if flat >= self.projector.layout().total() {
            return None;
        }
        Some(self.projector.score(&self.wave, &self.rules, flat))
    }

    pub fn action_scores(&self, category: usize) -> Option<Vec<f32>> {
        if category >= self.projector.layout().categories() {
            return None;
        }
        Some(self.projector.scores(&self.wave, &self.rules, category))
    }

    /// Amplitude of every slot of the current state.
    pub fn neuron_states(&self) -> Vec<f32> {
        self.wave.amplitudes()
    }

    pub fn wave(&self) -> &WaveState {
        &self.wave
    }

    pub fn field(&self) -> &FieldMemory {
        &self.field
    }

    pub fn rules(&self) -> &HamiltonianRuleSet {
        &self.rules
    }

    pub fn projector(&self) -> &ActionProjector {
        &self.projector
    }

    pub fn affect(&self) -> &AffectCircuit {
        &self.affect
    }

    /// Flat actions of the most recent selection, if any.
    pub fn last_actions(&self) -> Option<&[usize]> {
        self.has_selection.then_some(self.last_actions.as_slice())
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            temperature: self.temperature,
            phase: self.phase(),
            frustration: self.frustration,
            adrenaline: self.adrenaline,
            glia_activity: self.glia_activity(),
            attractors: self.field.len(),
            couplings: self.field.couplings().len(),
            tick: self.tick,
        }
    }

    pub fn exploration_beta(&self) -> f32 {
        self.exploration_beta
    }

    pub fn set_exploration_beta(&mut self, beta: f32) -> SingularityResult<()> {
        ensure_finite("exploration beta", beta)?;
        if beta < 0.0 {
            return Err(SingularityError::InvalidArgument(
                "exploration beta must be >= 0".to_string(),
            ));
        }
        self.exploration_beta = beta;
        Ok(())
    }

    /// Diagnostic override of one neuron.
    ///
    /// Affect slots set the node activation (clamped to [0, 1]); other slots
    /// set the amplitude of both the current state and the smearing trace,
    /// keeping phase. Not part of normal learning.
    pub fn set_neuron_state(&mut self, index: usize, value: f32) -> SingularityResult<()> {
        ensure_finite("neuron value", value)?;
        if index >= self.state_size {
            return Err(SingularityError::InvalidArgument(format!(
                "neuron index {index} out of range (state size {})",
                self.state_size
            )));
        }
        if index < AFFECT_SLOTS {
            self.affect.set_state(index, value);
            self.wave.set_amplitude(index, self.affect.state(index));
        } else {
            self.wave.set_amplitude(index, value);
            self.smear.trace_mut().set_amplitude(index, value);
        }
        Ok(())
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.projector.set_execution_tier(tier);
    }

    pub fn execution_tier(&self) -> ExecutionTier {
        self.projector.execution_tier()
    }
}

pub(crate) fn validate_shape(
    state_size: usize,
    category_sizes: &[usize],
    cfg: &SingularityConfig,
) -> SingularityResult<()> {
    if !(SingularityConfig::MIN_STATE_SIZE..=SingularityConfig::MAX_STATE_SIZE).contains(&state_size)
    {
        return Err(SingularityError::InvalidConfiguration(format!(
            "state size {state_size} outside [{}, {}]",
            SingularityConfig::MIN_STATE_SIZE,
            SingularityConfig::MAX_STATE_SIZE
        )));
    }
    if category_sizes.is_empty() {
        return Err(SingularityError::InvalidConfiguration(
            "at least one action category is required".to_string(),
        ));
    }
    if let Some(c) = category_sizes.iter().position(|&s| s == 0) {
        return Err(SingularityError::InvalidConfiguration(format!(
            "action category {c} is empty"
        )));
    }
    let total = category_sizes
        .iter()
        .try_fold(0usize, |acc, &s| acc.checked_add(s))
        .filter(|&t| t.saturating_mul(state_size) <= MAX_WEIGHT_ROWS_TIMES_DIM);
    if total.is_none() {
        return Err(SingularityError::InvalidConfiguration(
            "too many actions for this state size".to_string(),
        ));
    }
    if cfg.attractor_capacity.saturating_mul(state_size) > MAX_ATTRACTOR_SLOTS_TIMES_DIM {
        return Err(SingularityError::InvalidConfiguration(format!(
            "attractor_capacity {} too large for state size {state_size}",
            cfg.attractor_capacity
        )));
    }
    Ok(())
}
