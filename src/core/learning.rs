//! Outcome handling: direct reward, replayed credit, and inverse learning
//! from observed expert actions. All paths end in `digest`, which runs the
//! homeostatic updates (temperature, frustration, adrenaline, affect).

use std::mem;

use crate::affect::AffectInputs;
use crate::engine::Singularity;
use crate::error::{ensure_finite, SingularityError, SingularityResult};
use crate::wave::{WaveState, IDX_AGGRESSION, IDX_FEAR, IDX_REFLEX, IDX_TACTICAL};

// Rewards with |r| >= 1 / URGENCY_SCALE are fully urgent.
const URGENCY_SCALE: f32 = 5.0;
// Share of the margin violation removed from a rival per observation.
const RIVAL_PUSH: f32 = 0.5;

impl Singularity {
    /// Apply `reward` to the most recent selection in every category.
    ///
    /// A no-op (returning `Ok`) if nothing has been selected yet.
    pub fn learn(&mut self, reward: f32) -> SingularityResult<()> {
        ensure_finite("reward", reward)?;
        if !self.has_selection {
            return Ok(());
        }
        let actions = mem::take(&mut self.last_actions);
        let state = mem::replace(&mut self.last_state, WaveState::zeros(0));
        self.credit(&actions, &state, reward);
        self.last_actions = actions;
        self.last_state = state;
        Ok(())
    }

    /// Apply `reward` to an explicit action set (one local index per
    /// category), e.g. for delayed or replayed credit.
    ///
    /// Credited against the state of the most recent selection, or the
    /// current state if there was none.
    pub fn learn_multi(&mut self, actions: &[usize], reward: f32) -> SingularityResult<()> {
        ensure_finite("reward", reward)?;
        let flat = self.flatten_actions(actions, "actions")?;
        let state = if self.has_selection {
            self.last_state.clone()
        } else {
            self.wave.clone()
        };
        self.credit(&flat, &state, reward);
        Ok(())
    }

    /// Inverse learning: treat `expert_actions` (one local index per
    /// category) taken under `conditions` as evidence of a latent objective.
    ///
    /// The expert's score is pulled toward the imitation target and rivals
    /// scoring within the margin are pushed down. Field memory is reinforced
    /// as if the imitation target had been the reward, and inferred rules
    /// `condition -> expert action` are strengthened so the same context
    /// biases toward the same choice later.
    pub fn observe(
        &mut self,
        expert_actions: &[usize],
        conditions: &[i32],
    ) -> SingularityResult<()> {
        let flat = self.flatten_actions(expert_actions, "expert actions")?;
        let state = self.wave.clone();
        let target = self.cfg.imitation_reward;
        let margin = self.cfg.imitation_margin;
        let lr = self.learning_rate();

        let mut td_sum = 0.0;
        for (c, &expert) in flat.iter().enumerate() {
            let offset = self.projector.layout().offset(c);
            let scores = self.projector.scores(&state, &self.rules, c);
            let s_e = scores[expert - offset];
            let td = target - s_e;
            self.projector.update(expert, &state, td, lr);
            self.projector.note_outcome(expert, target);

            for (k, &s_j) in scores.iter().enumerate() {
                let rival = offset + k;
                if rival != expert && s_j >= s_e - margin {
                    let push = -(s_j - s_e + margin) * RIVAL_PUSH;
                    self.projector.update(rival, &state, push, lr);
                }
            }
            self.rules.infer(conditions, expert, self.cfg.inferred_rule_rate);
            td_sum += td.abs();
        }

        self.field.reinforce(&state, target, self.tick);
        self.digest(td_sum / flat.len() as f32, 0.0);
        Ok(())
    }

    /// Learning rate at the current temperature; hotter means larger steps.
    pub fn learning_rate(&self) -> f32 {
        self.cfg.learning_rate * (1.0 + self.temperature)
    }

    fn credit(&mut self, flat_actions: &[usize], state: &WaveState, reward: f32) {
        let lr = self.learning_rate();
        let mut td_sum = 0.0;
        for &a in flat_actions {
            let predicted = self.projector.score(state, &self.rules, a);
            let td = reward - predicted;
            self.projector.update(a, state, td, lr);
            self.projector.note_outcome(a, reward);
            td_sum += td.abs();
        }
        let mean_td = td_sum / flat_actions.len().max(1) as f32;

        self.field.reinforce(state, reward, self.tick);
        self.digest(mean_td, reward);
    }

    /// Homeostasis after an outcome.
    fn digest(&mut self, mean_td: f32, reward: f32) {
        let cfg = self.cfg;
        let before = self.phase();

        let heated = self.temperature + cfg.heat_gain * mean_td - cfg.cool_gain * reward.max(0.0);
        self.temperature = heated.clamp(0.0, cfg.max_temperature) * cfg.temperature_retention;

        if reward < 0.0 {
            self.frustration = (self.frustration + cfg.frustration_gain * -reward).min(1.0);
        } else {
            self.frustration *= cfg.frustration_decay;
        }
        if reward.abs() >= cfg.adrenaline_threshold {
            self.adrenaline = (self.adrenaline + cfg.adrenaline_gain * reward.abs()).min(1.0);
        }

        let mut signals = [0.0; 4];
        signals[IDX_AGGRESSION] = reward.max(0.0);
        signals[IDX_FEAR] = (-reward).max(0.0);
        signals[IDX_TACTICAL] = 1.0 - mean_td.min(1.0);
        signals[IDX_REFLEX] = self.adrenaline;
        self.affect.digest(&AffectInputs {
            temperature: self.temperature,
            urgency: (reward.abs() * URGENCY_SCALE).min(1.0),
            glia: self.field.load(),
            adrenaline: self.adrenaline,
            frustration: self.frustration,
            fatigue: self.projector.fatigue(),
            signals,
        });

        let after = self.phase();
        if after != before {
            tracing::debug!(
                from = before.as_str(),
                to = after.as_str(),
                temperature = self.temperature,
                "thermal phase transition"
            );
        }
    }

    fn flatten_actions(
        &self,
        local: &[usize],
        what: &'static str,
    ) -> SingularityResult<Vec<usize>> {
        let layout = self.projector.layout();
        if local.len() != layout.categories() {
            return Err(SingularityError::ArgumentLengthMismatch {
                what,
                expected: layout.categories(),
                found: local.len(),
            });
        }
        local
            .iter()
            .enumerate()
            .map(|(c, &a)| {
                if a < layout.size(c) {
                    Ok(layout.offset(c) + a)
                } else {
                    Err(SingularityError::InvalidArgument(format!(
                        "{what}[{c}] = {a} out of range (category size {})",
                        layout.size(c)
                    )))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SingularityConfig;
    use crate::engine::Singularity;
    use crate::error::SingularityError;

    const OBS: [f32; 4] = [0.3, -0.2, 0.5, 0.1];

    #[test]
    fn learn_before_any_selection_is_a_no_op() {
        let mut e = Singularity::new(32, &[3]).unwrap();
        let before = e.status();
        e.learn(1.0).unwrap();
        assert_eq!(e.status(), before);
        assert!(e.projector().visits().iter().all(|&v| v == 0));
    }

    #[test]
    fn non_finite_reward_is_rejected() {
        let mut e = Singularity::new(32, &[3]).unwrap();
        e.select_actions(&OBS).unwrap();
        for r in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(matches!(e.learn(r), Err(SingularityError::InvalidArgument(_))));
            assert!(e.learn_multi(&[0], r).is_err());
        }
        assert_eq!(e.temperature(), 0.5);
        assert!(e.field().is_empty());
    }

    #[test]
    fn positive_reward_cools_and_raises_the_chosen_score() {
        let mut e = Singularity::new(32, &[3]).unwrap();
        let chosen = e.select_actions(&OBS).unwrap()[0];
        e.learn(1.0).unwrap();
        assert!(e.temperature() < 0.5);
        let score = e.action_score(chosen).unwrap();
        assert!(score > 0.0, "score = {score}");
        assert_eq!(e.field().len(), 1);
        assert_eq!(e.projector().visits()[chosen], 1);
    }

    #[test]
    fn negative_reward_heats_and_frustrates() {
        let mut e = Singularity::new(32, &[3]).unwrap();
        e.select_actions(&OBS).unwrap();
        e.learn(-1.0).unwrap();
        assert!(e.temperature() > 0.5);
        assert!((e.frustration() - 0.2).abs() < 1e-6);
        assert!(e.field().is_empty());
    }

    #[test]
    fn adrenaline_spikes_then_decays_per_tick() {
        let mut e = Singularity::new(32, &[3]).unwrap();
        e.select_actions(&OBS).unwrap();
        e.learn(0.1).unwrap();
        assert_eq!(e.adrenaline(), 0.0);

        e.learn(1.0).unwrap();
        let spike = e.adrenaline();
        assert!(spike > 0.0);
        e.inject(&OBS).unwrap();
        assert!(e.adrenaline() < spike);
    }

    #[test]
    fn learn_multi_validates_shape() {
        let mut e = Singularity::new(32, &[5, 3]).unwrap();
        assert!(matches!(
            e.learn_multi(&[1], 1.0),
            Err(SingularityError::ArgumentLengthMismatch { .. })
        ));
        assert!(matches!(
            e.learn_multi(&[1, 3], 1.0),
            Err(SingularityError::InvalidArgument(_))
        ));
        assert_eq!(e.temperature(), 0.5);
    }

    #[test]
    fn learn_multi_credits_the_given_actions() {
        let mut e = Singularity::new(32, &[5, 3]).unwrap();
        e.select_actions(&OBS).unwrap();
        e.learn_multi(&[4, 2], 1.0).unwrap();
        assert_eq!(e.projector().visits()[4], 1);
        assert_eq!(e.projector().visits()[5 + 2], 1);
        assert!(e.action_score(4).unwrap() > e.action_score(0).unwrap());
    }

    #[test]
    fn observed_expert_becomes_preferred() {
        let mut e = Singularity::new(32, &[4]).unwrap();
        e.inject(&OBS).unwrap();
        for _ in 0..20 {
            e.observe(&[2], &[7]).unwrap();
        }
        let scores = e.action_scores(0).unwrap();
        for (a, &s) in scores.iter().enumerate() {
            if a != 2 {
                assert!(scores[2] > s, "{scores:?}");
            }
        }
        let rule = e.rules().inferred()[0];
        assert_eq!((rule.condition_id, rule.action), (7, 2));

        // The inferred rule adds bias once its condition is active.
        let plain = scores[2];
        e.set_active_conditions(&[7]);
        assert!(e.action_score(2).unwrap() > plain);
    }

    #[test]
    fn observe_validates_before_mutating() {
        let mut e = Singularity::with_config(32, &[4], SingularityConfig::default()).unwrap();
        assert!(e.observe(&[4], &[1]).is_err());
        assert!(e.observe(&[], &[1]).is_err());
        assert!(e.rules().inferred().is_empty());
        assert_eq!(e.temperature(), 0.5);
    }
}
