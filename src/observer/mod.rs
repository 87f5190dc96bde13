use crate::engine::{EngineStatus, Singularity};
use crate::field::{AttractorId, Coupling};
use crate::rules::HamiltonianRule;

#[cfg(feature = "serde")]
use serde::Serialize;

/// A read-only report of what an engine is doing.
///
/// Observers cannot mutate or steer the engine. Reports are built on demand
/// and allocate; the decision loop is untouched.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct EngineReport {
    pub state_size: usize,
    pub category_sizes: Vec<usize>,
    pub status: EngineStatus,
    pub execution_tier: &'static str,
    pub exploration_beta: f32,
    pub learning_rate: f32,

    /// Affect node states (aggression, fear, tactical, reflex).
    pub affect: [f32; 4],
    pub state_norm: f32,

    pub attractors: Vec<AttractorReport>,
    pub couplings: Vec<Coupling>,

    pub rules: usize,
    pub inferred_rules: Vec<HamiltonianRule>,
    pub active_conditions: Vec<i32>,

    /// Scores per category at the current state.
    pub scores: Vec<Vec<f32>>,
    pub last_actions: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AttractorReport {
    pub id: AttractorId,
    pub strength: f32,
    pub hits: u32,
    pub age: u64,
    pub last_reinforced: u64,
    /// Distance from the current state to this attractor.
    pub distance: f32,
}

pub struct EngineAdapter<'a> {
    engine: &'a Singularity,
}

impl<'a> EngineAdapter<'a> {
    pub fn new(engine: &'a Singularity) -> Self {
        Self { engine }
    }

    pub fn report(&self) -> EngineReport {
        let e = self.engine;
        let wave = e.wave();
        let field = e.field();

        let mut attractors: Vec<AttractorReport> = field
            .attractors()
            .filter_map(|(id, a)| {
                let (re, im) = field.location(id)?;
                Some(AttractorReport {
                    id,
                    strength: a.strength,
                    hits: a.hits,
                    age: a.age,
                    last_reinforced: a.last_reinforced,
                    distance: wave.distance_to(re, im),
                })
            })
            .collect();
        attractors.sort_by(|a, b| b.strength.total_cmp(&a.strength));

        let scores = (0..e.layout().categories())
            .filter_map(|c| e.action_scores(c))
            .collect();

        EngineReport {
            state_size: e.state_size(),
            category_sizes: e.category_sizes().to_vec(),
            status: e.status(),
            execution_tier: e.execution_tier().effective().as_str(),
            exploration_beta: e.exploration_beta(),
            learning_rate: e.learning_rate(),
            affect: e.affect().states(),
            state_norm: wave.norm(),
            attractors,
            couplings: field.couplings().to_vec(),
            rules: e.rules().len(),
            inferred_rules: e.rules().inferred().to_vec(),
            active_conditions: e.rules().active_conditions().to_vec(),
            scores,
            last_actions: e.last_actions().map(|a| a.to_vec()),
        }
    }

    /// The `n` strongest attractors as `(id, strength)`.
    pub fn strongest_attractors(&self, n: usize) -> Vec<(AttractorId, f32)> {
        let mut all: Vec<(AttractorId, f32)> = self
            .engine
            .field()
            .attractors()
            .map(|(id, a)| (id, a.strength))
            .collect();
        all.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SingularityConfig;

    #[test]
    fn report_reflects_engine_without_touching_it() {
        let cfg = SingularityConfig::default().with_seed(3);
        let mut e = Singularity::with_config(32, &[3, 2], cfg).unwrap();
        e.register_rule(4, 1, 0.5).unwrap();
        e.set_active_conditions(&[4]);
        e.select_actions(&[0.4, 0.1]).unwrap();
        e.learn(1.0).unwrap();

        let before = e.save().unwrap();
        let report = EngineAdapter::new(&e).report();
        assert_eq!(e.save().unwrap(), before);

        assert_eq!(report.category_sizes, vec![3, 2]);
        assert_eq!(report.scores.len(), 2);
        assert_eq!(report.scores[0].len(), 3);
        assert_eq!(report.attractors.len(), 1);
        assert_eq!(report.active_conditions, vec![4]);
        assert_eq!(report.rules, 1);
        assert_eq!(report.last_actions.map(|a| a.len()), Some(2));
        assert_eq!(report.status, e.status());
    }

    #[test]
    fn strongest_attractors_are_ordered() {
        let mut e = Singularity::new(16, &[2]).unwrap();
        let (re, im) = (vec![0.0; 16], vec![0.0; 16]);
        let mut far = re.clone();
        far[0] = 5.0;
        e.field
            .insert_attractor(&re, &im, 0.3, 0)
            .expect("free slot");
        e.field
            .insert_attractor(&far, &im, 0.8, 0)
            .expect("free slot");

        let top = EngineAdapter::new(&e).strongest_attractors(1);
        assert_eq!(top.len(), 1);
        assert!((top[0].1 - 0.8).abs() < 1e-6);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn report_serializes_to_json() {
        let e = Singularity::new(16, &[2]).unwrap();
        let json = serde_json::to_string(&EngineAdapter::new(&e).report()).unwrap();
        assert!(json.contains("\"category_sizes\":[2]"));
        assert!(json.contains("\"phase\""));
    }
}
