//! Condition-gated additive action bias.
//!
//! Registered rules come from the host and are append-only. Inferred rules
//! are produced by inverse learning, share the same shape and gating, and
//! live in a small bounded table. Only rules whose condition id is in the
//! active set contribute, and their strengths are added to action scores.

use std::io::{self, Read, Write};

use hashbrown::{HashMap, HashSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SingularityConfig;
use crate::error::{SingularityError, SingularityResult};
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HamiltonianRule {
    pub condition_id: i32,
    /// Flat action index across all categories.
    pub action: usize,
    /// Resonance strength in [0, 1].
    pub strength: f32,
}

#[derive(Debug, Clone)]
pub struct HamiltonianRuleSet {
    rules: Vec<HamiltonianRule>,
    // condition id -> indices into `rules`
    by_condition: HashMap<i32, Vec<u32>>,
    inferred: Vec<HamiltonianRule>,
    active: HashSet<i32>,
    // Same ids, ascending; summation order must not depend on the hasher.
    active_sorted: Vec<i32>,
    total_actions: usize,
    max_rules: usize,
    inferred_capacity: usize,
}

impl HamiltonianRuleSet {
    pub fn new(total_actions: usize, cfg: &SingularityConfig) -> Self {
        Self {
            rules: Vec::new(),
            by_condition: HashMap::new(),
            inferred: Vec::with_capacity(cfg.inferred_rule_capacity),
            active: HashSet::new(),
            active_sorted: Vec::new(),
            total_actions,
            max_rules: cfg.max_rules,
            inferred_capacity: cfg.inferred_rule_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[HamiltonianRule] {
        &self.rules
    }

    pub fn inferred(&self) -> &[HamiltonianRule] {
        &self.inferred
    }

    pub fn is_active(&self, condition_id: i32) -> bool {
        self.active.contains(&condition_id)
    }

    /// Active condition ids in ascending order.
    pub fn active_conditions(&self) -> &[i32] {
        &self.active_sorted
    }

    pub fn register(
        &mut self,
        condition_id: i32,
        action: usize,
        strength: f32,
    ) -> SingularityResult<()> {
        self.register_many(&[condition_id], &[action], &[strength])
    }

    /// Append rules zipped from three equal-length sequences.
    ///
    /// Every triple is validated before any is appended, so a failing call
    /// leaves the set unchanged.
    pub fn register_many(
        &mut self,
        condition_ids: &[i32],
        actions: &[usize],
        strengths: &[f32],
    ) -> SingularityResult<()> {
        let n = condition_ids.len();
        if actions.len() != n {
            return Err(SingularityError::ArgumentLengthMismatch {
                what: "rule action indices",
                expected: n,
                found: actions.len(),
            });
        }
        if strengths.len() != n {
            return Err(SingularityError::ArgumentLengthMismatch {
                what: "rule strengths",
                expected: n,
                found: strengths.len(),
            });
        }
        for (i, (&action, &strength)) in actions.iter().zip(strengths).enumerate() {
            self.check_rule(action, strength)
                .map_err(|msg| SingularityError::InvalidRule(format!("rule {i}: {msg}")))?;
        }
        if self.rules.len() + n > self.max_rules {
            return Err(SingularityError::InvalidRule(format!(
                "rule table holds at most {} rules",
                self.max_rules
            )));
        }

        for ((&condition_id, &action), &strength) in
            condition_ids.iter().zip(actions).zip(strengths)
        {
            self.push_rule(HamiltonianRule {
                condition_id,
                action,
                strength,
            });
        }
        tracing::debug!(added = n, total = self.rules.len(), "rules registered");
        Ok(())
    }

    /// Replace the active condition set. An empty slice clears all bias.
    pub fn set_active_conditions(&mut self, ids: &[i32]) {
        self.active.clear();
        self.active.extend(ids.iter().copied());
        self.active_sorted.clear();
        self.active_sorted.extend(self.active.iter().copied());
        self.active_sorted.sort_unstable();
    }

    /// Add the active bias for flat actions `offset..offset + out.len()` into `out`.
    pub fn add_bias(&self, offset: usize, out: &mut [f32]) {
        if self.active.is_empty() {
            return;
        }
        let range = offset..offset + out.len();
        for cond in &self.active_sorted {
            let Some(indices) = self.by_condition.get(cond) else {
                continue;
            };
            for &i in indices {
                let rule = &self.rules[i as usize];
                if range.contains(&rule.action) {
                    out[rule.action - offset] += rule.strength;
                }
            }
        }
        for rule in &self.inferred {
            if range.contains(&rule.action) && self.active.contains(&rule.condition_id) {
                out[rule.action - offset] += rule.strength;
            }
        }
    }

    /// Bias vector for the flat action range of one category.
    pub fn bias(&self, offset: usize, len: usize) -> Vec<f32> {
        let mut out = vec![0.0; len];
        self.add_bias(offset, &mut out);
        out
    }

    /// Strengthen the inferred rule `condition -> action` for every given
    /// condition, creating it if needed. Returns how many rules changed.
    pub(crate) fn infer(&mut self, conditions: &[i32], action: usize, rate: f32) -> usize {
        if self.inferred_capacity == 0 || action >= self.total_actions || !(rate > 0.0) {
            return 0;
        }
        let mut changed = 0;
        for &condition_id in conditions {
            if let Some(rule) = self
                .inferred
                .iter_mut()
                .find(|r| r.condition_id == condition_id && r.action == action)
            {
                rule.strength = (rule.strength + rate).min(1.0);
                changed += 1;
                continue;
            }

            let fresh = HamiltonianRule {
                condition_id,
                action,
                strength: rate.min(1.0),
            };
            if self.inferred.len() < self.inferred_capacity {
                self.inferred.push(fresh);
                changed += 1;
            } else if let Some((i, weakest)) = self
                .inferred
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.strength.total_cmp(&b.strength))
                .map(|(i, r)| (i, r.strength))
            {
                if fresh.strength > weakest {
                    self.inferred[i] = fresh;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn check_rule(&self, action: usize, strength: f32) -> Result<(), String> {
        if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
            return Err(format!("strength {strength} outside [0, 1]"));
        }
        if action >= self.total_actions {
            return Err(format!(
                "action index {action} out of range (total actions {})",
                self.total_actions
            ));
        }
        Ok(())
    }

    fn push_rule(&mut self, rule: HamiltonianRule) {
        let idx = self.rules.len() as u32;
        self.by_condition.entry(rule.condition_id).or_default().push(idx);
        self.rules.push(rule);
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_rules(w, &self.rules)?;
        write_rules(w, &self.inferred)?;
        storage::write_len(w, self.active_sorted.len())?;
        for &id in &self.active_sorted {
            storage::write_i32_le(w, id)?;
        }
        Ok(())
    }

    pub(crate) fn read_image_payload<R: Read>(
        r: &mut R,
        total_actions: usize,
        cfg: &SingularityConfig,
    ) -> io::Result<Self> {
        let mut set = Self::new(total_actions, cfg);
        for rule in read_rules(r, cfg.max_rules)? {
            set.check_rule(rule.action, rule.strength)
                .map_err(|_| storage::invalid("invalid registered rule"))?;
            set.push_rule(rule);
        }
        for rule in read_rules(r, cfg.inferred_rule_capacity)? {
            set.check_rule(rule.action, rule.strength)
                .map_err(|_| storage::invalid("invalid inferred rule"))?;
            set.inferred.push(rule);
        }
        let n = storage::read_len(r, u32::MAX as usize)?;
        let mut ids = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            ids.push(storage::read_i32_le(r)?);
        }
        set.set_active_conditions(&ids);
        Ok(set)
    }
}

fn write_rules<W: Write>(w: &mut W, rules: &[HamiltonianRule]) -> io::Result<()> {
    storage::write_len(w, rules.len())?;
    for rule in rules {
        storage::write_i32_le(w, rule.condition_id)?;
        storage::write_len(w, rule.action)?;
        storage::write_f32_le(w, rule.strength)?;
    }
    Ok(())
}

fn read_rules<R: Read>(r: &mut R, max: usize) -> io::Result<Vec<HamiltonianRule>> {
    let n = storage::read_len(r, max)?;
    let mut out = Vec::with_capacity(n.min(1 << 12));
    for _ in 0..n {
        let condition_id = storage::read_i32_le(r)?;
        let action = storage::read_u32_le(r)? as usize;
        let strength = storage::read_f32_le(r)?;
        out.push(HamiltonianRule {
            condition_id,
            action,
            strength,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> HamiltonianRuleSet {
        HamiltonianRuleSet::new(8, &SingularityConfig::default())
    }

    #[test]
    fn inactive_rules_contribute_nothing() {
        let mut s = set();
        s.register(0, 3, 0.8).unwrap();
        assert_eq!(s.bias(0, 5), vec![0.0; 5]);

        s.set_active_conditions(&[0]);
        assert_eq!(s.bias(0, 5), vec![0.0, 0.0, 0.0, 0.8, 0.0]);

        s.set_active_conditions(&[]);
        assert_eq!(s.bias(0, 5), vec![0.0; 5]);
    }

    #[test]
    fn bias_lands_in_the_owning_category() {
        let mut s = set();
        // Flat index 6 is local action 1 of a category starting at 5.
        s.register(1, 6, 0.5).unwrap();
        s.set_active_conditions(&[1]);
        assert_eq!(s.bias(0, 5), vec![0.0; 5]);
        assert_eq!(s.bias(5, 3), vec![0.0, 0.5, 0.0]);
    }

    #[test]
    fn active_set_is_replaced_not_merged() {
        let mut s = set();
        s.register_many(&[0, 1], &[2, 2], &[0.3, 0.4]).unwrap();
        s.set_active_conditions(&[0]);
        s.set_active_conditions(&[1]);
        assert!(!s.is_active(0));
        assert!((s.bias(0, 5)[2] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn bias_is_bounded_by_targeting_strengths() {
        let mut s = set();
        s.register_many(&[0, 1, 2, 0], &[4, 4, 4, 1], &[0.2, 0.3, 0.4, 1.0])
            .unwrap();
        s.set_active_conditions(&[0, 1, 2, 99]);
        let b = s.bias(0, 8);
        assert!(b[4] <= 0.2 + 0.3 + 0.4 + 1e-6);
        assert!((b[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn length_mismatch_rejects_whole_call() {
        let mut s = set();
        let err = s.register_many(&[0, 1], &[1], &[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, SingularityError::ArgumentLengthMismatch { .. }));
        assert!(s.is_empty());
    }

    #[test]
    fn one_bad_triple_rejects_all() {
        let mut s = set();
        assert!(matches!(
            s.register_many(&[0, 1], &[1, 2], &[0.5, 1.5]),
            Err(SingularityError::InvalidRule(_))
        ));
        assert!(matches!(
            s.register_many(&[0], &[8], &[0.5]),
            Err(SingularityError::InvalidRule(_))
        ));
        assert!(matches!(
            s.register(0, 1, f32::NAN),
            Err(SingularityError::InvalidRule(_))
        ));
        assert!(s.is_empty());
    }

    #[test]
    fn table_capacity_is_enforced() {
        let cfg = SingularityConfig {
            max_rules: 2,
            ..Default::default()
        };
        let mut s = HamiltonianRuleSet::new(4, &cfg);
        s.register_many(&[0, 1], &[0, 1], &[0.1, 0.1]).unwrap();
        assert!(s.register(2, 2, 0.1).is_err());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn inferred_rules_accumulate_and_saturate() {
        let mut s = set();
        for _ in 0..20 {
            s.infer(&[7], 2, 0.1);
        }
        assert_eq!(s.inferred().len(), 1);
        assert!((s.inferred()[0].strength - 1.0).abs() < 1e-6);

        s.set_active_conditions(&[7]);
        assert!((s.bias(0, 5)[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inferred_table_evicts_weakest() {
        let cfg = SingularityConfig {
            inferred_rule_capacity: 2,
            ..Default::default()
        };
        let mut s = HamiltonianRuleSet::new(4, &cfg);
        s.infer(&[1], 0, 0.1);
        s.infer(&[2], 0, 0.1);
        s.infer(&[2], 0, 0.1);
        s.infer(&[3], 1, 0.15);
        let conds: Vec<i32> = s.inferred().iter().map(|r| r.condition_id).collect();
        assert_eq!(conds.len(), 2);
        assert!(conds.contains(&2) && conds.contains(&3));
    }

    #[test]
    fn image_payload_roundtrip() {
        let mut s = set();
        s.register_many(&[0, 5, -3], &[3, 6, 0], &[0.8, 0.2, 1.0]).unwrap();
        s.infer(&[5], 1, 0.3);
        s.set_active_conditions(&[5, 0]);

        let mut buf = Vec::new();
        s.write_image_payload(&mut buf).unwrap();
        let t = HamiltonianRuleSet::read_image_payload(
            &mut io::Cursor::new(buf),
            8,
            &SingularityConfig::default(),
        )
        .unwrap();
        assert_eq!(s.rules(), t.rules());
        assert_eq!(s.inferred(), t.inferred());
        assert_eq!(t.active_conditions(), &[0, 5]);
        assert_eq!(s.bias(0, 8), t.bias(0, 8));
    }
}
