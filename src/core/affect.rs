//! Four-node affect circuit (aggression, fear, tactical, reflex).
//!
//! Node activations live in [0, 1] and are mirrored into the reserved
//! slots of the wave state every tick. The wiring between nodes is rebuilt
//! from the thermal phase whenever the temperature moves noticeably or an
//! urgent outcome arrives.

use std::io::{self, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::projector::ThermalPhase;
use crate::storage;
use crate::wave::{AFFECT_SLOTS, IDX_AGGRESSION, IDX_FEAR, IDX_REFLEX, IDX_TACTICAL};

const BASE_DECAY: [f32; AFFECT_SLOTS] = [0.5, 0.4, 0.3, 0.3];
const SELF_FEEDBACK: f32 = 0.1;
const THERMAL_FLUIDITY: f32 = 0.4;
const RESHAPE_TEMPERATURE_DELTA: f32 = 0.05;
const RESHAPE_URGENCY: f32 = 0.5;

const REGULATION_TEMPERATURE: f32 = 1.0;
const REGULATION_ACTIVITY: f32 = 1.8;
const REGULATION_GLIA: f32 = 0.66;
const REGULATION_NODE_FLOOR: f32 = 0.5;
const INHIBITION: f32 = 0.15;

const FATIGUED: f32 = 0.8;
const MAX_SYNAPSES: usize = 4;

/// Input edge of a node: the listener adds `weight * state[source]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Synapse {
    pub source: usize,
    pub weight: f32,
}

/// Outcome context one digest step needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffectInputs<'a> {
    pub temperature: f32,
    pub urgency: f32,
    pub glia: f32,
    pub adrenaline: f32,
    pub frustration: f32,
    /// Per-action fatigue, flat indexed.
    pub fatigue: &'a [f32],
    /// External drive per node, added to the synaptic input.
    pub signals: [f32; AFFECT_SLOTS],
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffectCircuit {
    states: [f32; AFFECT_SLOTS],
    synapses: [Vec<Synapse>; AFFECT_SLOTS],
    last_reshape_temperature: f32,
}

impl Default for AffectCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl AffectCircuit {
    pub fn new() -> Self {
        Self {
            states: [0.0; AFFECT_SLOTS],
            synapses: Default::default(),
            // Negative so the first digest always wires the circuit.
            last_reshape_temperature: -1.0,
        }
    }

    pub fn states(&self) -> [f32; AFFECT_SLOTS] {
        self.states
    }

    pub fn state(&self, node: usize) -> f32 {
        self.states[node]
    }

    /// Diagnostic override; clamped to [0, 1].
    pub fn set_state(&mut self, node: usize, value: f32) {
        self.states[node] = value.clamp(0.0, 1.0);
    }

    pub fn synapses(&self, node: usize) -> &[Synapse] {
        &self.synapses[node]
    }

    pub fn last_reshape_temperature(&self) -> f32 {
        self.last_reshape_temperature
    }

    /// Settle the circuit after an outcome: relax every node, rewire if the
    /// regime shifted, then apply homeostatic inhibition.
    pub fn digest(&mut self, inputs: &AffectInputs<'_>) {
        self.relax(&inputs.signals, inputs.temperature, inputs.urgency);

        let moved = (inputs.temperature - self.last_reshape_temperature).abs();
        if inputs.urgency > RESHAPE_URGENCY || moved > RESHAPE_TEMPERATURE_DELTA {
            self.reshape(inputs);
        }
        self.regulate(inputs.temperature, inputs.glia);
    }

    fn relax(&mut self, signals: &[f32; AFFECT_SLOTS], temperature: f32, urgency: f32) {
        let before = self.states;
        for node in 0..AFFECT_SLOTS {
            let mut input: f32 = signals[node];
            input += self.synapses[node]
                .iter()
                .map(|s| before[s.source] * s.weight)
                .sum::<f32>();
            input += before[node] * SELF_FEEDBACK;

            let base = BASE_DECAY[node];
            let alpha = (base + urgency * (1.0 - base) + (temperature * THERMAL_FLUIDITY).max(0.0))
                .clamp(0.01, 1.0);
            let s = before[node] + alpha * (input - before[node]);
            self.states[node] = s.clamp(0.0, 1.0);
        }
    }

    /// Rebuild the wiring for the current thermal phase.
    pub fn reshape(&mut self, inputs: &AffectInputs<'_>) {
        let phase = ThermalPhase::from_temperature(inputs.temperature);
        tracing::debug!(
            temperature = inputs.temperature,
            phase = phase.as_str(),
            "affect circuit rewired"
        );
        self.last_reshape_temperature = inputs.temperature;
        for s in self.synapses.iter_mut() {
            s.clear();
        }

        match phase {
            ThermalPhase::Gas => {
                self.connect(IDX_AGGRESSION, IDX_REFLEX, 2.0);
                if inputs.glia > 0.6 {
                    self.synapses[IDX_AGGRESSION].clear();
                    self.connect(IDX_REFLEX, IDX_FEAR, 1.5);
                    self.connect(IDX_FEAR, IDX_REFLEX, 1.2);
                }
            }
            ThermalPhase::Solid => {
                let lead_fatigue = inputs.fatigue.first().copied().unwrap_or(0.0);
                if lead_fatigue < 0.5 {
                    self.connect(IDX_TACTICAL, IDX_AGGRESSION, 1.2);
                }
                self.connect(IDX_TACTICAL, IDX_REFLEX, 0.5);
            }
            ThermalPhase::Liquid => {
                self.connect(IDX_TACTICAL, IDX_REFLEX, 1.0);
                if inputs.adrenaline > 0.5 {
                    self.connect(IDX_AGGRESSION, IDX_REFLEX, 1.5);
                } else {
                    self.connect(IDX_FEAR, IDX_REFLEX, 0.8);
                    self.connect(IDX_AGGRESSION, IDX_TACTICAL, 0.7);
                }
                if inputs.frustration > 0.7 {
                    self.connect(IDX_TACTICAL, IDX_AGGRESSION, 1.8);
                }
            }
        }

        // Overused actions weaken the edges reading the matching node.
        for (idx, &f) in inputs.fatigue.iter().take(AFFECT_SLOTS).enumerate() {
            if f > FATIGUED {
                for s in self.synapses.iter_mut().flatten() {
                    if s.source == idx {
                        s.weight *= 0.5;
                    }
                }
            }
        }
    }

    fn regulate(&mut self, temperature: f32, glia: f32) {
        let activity: f32 = self.states.iter().sum();
        if temperature > REGULATION_TEMPERATURE
            && (activity > REGULATION_ACTIVITY || glia > REGULATION_GLIA)
        {
            for s in self.states.iter_mut() {
                if *s > REGULATION_NODE_FLOOR {
                    *s = (*s - *s * INHIBITION).max(0.0);
                }
            }
        }
    }

    fn connect(&mut self, listener: usize, source: usize, weight: f32) {
        self.synapses[listener].push(Synapse { source, weight });
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_f32_slice(w, &self.states)?;
        storage::write_f32_le(w, self.last_reshape_temperature)?;
        for syn in &self.synapses {
            storage::write_len(w, syn.len())?;
            for s in syn {
                storage::write_len(w, s.source)?;
                storage::write_f32_le(w, s.weight)?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_image_payload<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut c = Self::new();
        for s in c.states.iter_mut() {
            *s = storage::read_f32_le(r)?;
            if !(0.0..=1.0).contains(s) {
                return Err(storage::invalid("affect node state out of range"));
            }
        }
        c.last_reshape_temperature = storage::read_f32_le(r)?;
        if !c.last_reshape_temperature.is_finite() {
            return Err(storage::invalid("non-finite reshape temperature"));
        }
        for syn in c.synapses.iter_mut() {
            let n = storage::read_len(r, MAX_SYNAPSES)?;
            for _ in 0..n {
                let source = storage::read_u32_le(r)? as usize;
                let weight = storage::read_f32_le(r)?;
                if source >= AFFECT_SLOTS || !weight.is_finite() {
                    return Err(storage::invalid("invalid affect synapse"));
                }
                syn.push(Synapse { source, weight });
            }
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(temperature: f32) -> AffectInputs<'static> {
        AffectInputs {
            temperature,
            ..Default::default()
        }
    }

    #[test]
    fn first_digest_wires_the_circuit() {
        let mut c = AffectCircuit::new();
        c.digest(&inputs(0.5));
        assert_eq!(c.last_reshape_temperature(), 0.5);
        assert!(!c.synapses(IDX_TACTICAL).is_empty());
    }

    #[test]
    fn small_temperature_drift_keeps_wiring() {
        let mut c = AffectCircuit::new();
        c.digest(&inputs(0.50));
        c.digest(&inputs(0.51));
        assert_eq!(c.last_reshape_temperature(), 0.50);
        c.digest(&inputs(0.60));
        assert_eq!(c.last_reshape_temperature(), 0.60);
    }

    #[test]
    fn gas_phase_links_aggression_to_reflex() {
        let mut c = AffectCircuit::new();
        c.reshape(&inputs(1.5));
        assert_eq!(
            c.synapses(IDX_AGGRESSION),
            &[Synapse {
                source: IDX_REFLEX,
                weight: 2.0
            }]
        );
    }

    #[test]
    fn overloaded_gas_phase_cuts_aggression() {
        let mut c = AffectCircuit::new();
        c.reshape(&AffectInputs {
            temperature: 1.5,
            glia: 0.9,
            ..Default::default()
        });
        assert!(c.synapses(IDX_AGGRESSION).is_empty());
        assert_eq!(c.synapses(IDX_REFLEX).len(), 1);
        assert_eq!(c.synapses(IDX_FEAR).len(), 1);
    }

    #[test]
    fn fatigue_halves_edges_from_tired_node() {
        let fatigue = [0.0, 0.0, 0.0, 0.9];
        let mut c = AffectCircuit::new();
        c.reshape(&AffectInputs {
            temperature: 0.1,
            fatigue: &fatigue,
            ..Default::default()
        });
        let to_reflex = c
            .synapses(IDX_TACTICAL)
            .iter()
            .find(|s| s.source == IDX_REFLEX)
            .unwrap();
        assert!((to_reflex.weight - 0.25).abs() < 1e-6);
    }

    #[test]
    fn states_stay_in_unit_range() {
        let mut c = AffectCircuit::new();
        for i in 0..AFFECT_SLOTS {
            c.set_state(i, 1.0);
        }
        for t in [0.1, 0.8, 1.6, 2.0] {
            c.digest(&AffectInputs {
                temperature: t,
                urgency: 1.0,
                adrenaline: 1.0,
                frustration: 1.0,
                ..Default::default()
            });
            assert!(c.states().iter().all(|s| (0.0..=1.0).contains(s)));
        }
    }

    #[test]
    fn signals_drive_their_node() {
        let mut c = AffectCircuit::new();
        let mut signals = [0.0; AFFECT_SLOTS];
        signals[IDX_FEAR] = 1.0;
        c.digest(&AffectInputs {
            temperature: 0.5,
            signals,
            ..Default::default()
        });
        assert!(c.state(IDX_FEAR) > 0.0);
        assert_eq!(c.state(IDX_AGGRESSION), 0.0);
    }

    #[test]
    fn hot_overactive_circuit_is_inhibited() {
        let mut c = AffectCircuit::new();
        for i in 0..AFFECT_SLOTS {
            c.set_state(i, 0.9);
        }
        c.regulate(1.5, 0.0);
        assert!(c.states().iter().all(|&s| (s - 0.765).abs() < 1e-5));

        let mut cool = AffectCircuit::new();
        cool.set_state(0, 0.9);
        cool.regulate(0.5, 1.0);
        assert_eq!(cool.state(0), 0.9);
    }

    #[test]
    fn image_payload_roundtrip() {
        let mut c = AffectCircuit::new();
        c.set_state(IDX_FEAR, 0.4);
        c.digest(&inputs(1.4));
        let mut buf = Vec::new();
        c.write_image_payload(&mut buf).unwrap();
        let d = AffectCircuit::read_image_payload(&mut io::Cursor::new(buf)).unwrap();
        assert_eq!(c, d);
    }
}
