//! The complex state vector and the temporal smearing that feeds it.
//!
//! Every slot is a "neuron" holding one complex number, stored as parallel
//! real/imaginary arrays. Slots `0..AFFECT_SLOTS` carry the affective axes;
//! observations land in the remaining general-purpose slots.

use core::f32::consts::TAU;

use crate::config::SingularityConfig;

/// Number of reserved affective slots at the front of the state vector.
pub const AFFECT_SLOTS: usize = 4;
pub const IDX_AGGRESSION: usize = 0;
pub const IDX_FEAR: usize = 1;
pub const IDX_TACTICAL: usize = 2;
pub const IDX_REFLEX: usize = 3;

/// Fixed-size complex latent vector.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveState {
    re: Vec<f32>,
    im: Vec<f32>,
}

impl WaveState {
    pub fn zeros(len: usize) -> Self {
        Self {
            re: vec![0.0; len],
            im: vec![0.0; len],
        }
    }

    pub(crate) fn from_parts(re: Vec<f32>, im: Vec<f32>) -> Self {
        debug_assert_eq!(re.len(), im.len());
        Self { re, im }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.re.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.re.is_empty()
    }

    #[inline]
    pub fn re(&self) -> &[f32] {
        &self.re
    }

    #[inline]
    pub fn im(&self) -> &[f32] {
        &self.im
    }

    #[inline]
    pub(crate) fn parts_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.re, &mut self.im)
    }

    /// Magnitude of slot `i`.
    #[inline]
    pub fn amplitude(&self, i: usize) -> f32 {
        self.re[i].hypot(self.im[i])
    }

    /// Phase of slot `i` in (-π, π].
    #[inline]
    pub fn phase(&self, i: usize) -> f32 {
        self.im[i].atan2(self.re[i])
    }

    pub fn amplitudes(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.amplitude(i)).collect()
    }

    pub fn norm_sq(&self) -> f32 {
        norm_sq(&self.re, &self.im)
    }

    pub fn norm(&self) -> f32 {
        self.norm_sq().sqrt()
    }

    /// Set the magnitude of slot `i`, keeping its phase (phase 0 if the slot is empty).
    pub fn set_amplitude(&mut self, i: usize, amp: f32) {
        let cur = self.amplitude(i);
        if cur > 1e-12 {
            let s = amp / cur;
            self.re[i] *= s;
            self.im[i] *= s;
        } else {
            self.re[i] = amp;
            self.im[i] = 0.0;
        }
    }

    pub fn copy_from(&mut self, other: &WaveState) {
        self.re.copy_from_slice(&other.re);
        self.im.copy_from_slice(&other.im);
    }

    /// Rescale so the norm does not exceed `ceiling`. Returns true if rescaled.
    pub fn clamp_norm(&mut self, ceiling: f32) -> bool {
        clamp_norm(&mut self.re, &mut self.im, ceiling)
    }

    /// Euclidean distance to another complex vector given as parts.
    pub fn distance_to(&self, re: &[f32], im: &[f32]) -> f32 {
        distance_sq(&self.re, &self.im, re, im).sqrt()
    }
}

#[inline]
pub(crate) fn norm_sq(re: &[f32], im: &[f32]) -> f32 {
    re.iter().zip(im).map(|(a, b)| a * a + b * b).sum()
}

#[inline]
pub(crate) fn distance_sq(a_re: &[f32], a_im: &[f32], b_re: &[f32], b_im: &[f32]) -> f32 {
    let mut acc = 0.0;
    for i in 0..a_re.len() {
        let dr = a_re[i] - b_re[i];
        let di = a_im[i] - b_im[i];
        acc += dr * dr + di * di;
    }
    acc
}

pub(crate) fn clamp_norm(re: &mut [f32], im: &mut [f32], ceiling: f32) -> bool {
    let n = norm_sq(re, im).sqrt();
    if n > ceiling && n > 0.0 {
        let s = ceiling / n;
        for x in re.iter_mut() {
            *x *= s;
        }
        for x in im.iter_mut() {
            *x *= s;
        }
        true
    } else {
        false
    }
}

/// Natural frequency of slot `i`: slow (strategic) near the front, fast
/// (reflexive) towards the back.
#[inline]
fn slot_frequency(i: usize, len: usize) -> f32 {
    let x = i as f32 / len as f32;
    x * x * TAU
}

/// Exponential blend of the newest observation with a precessing trace of
/// the previous ones.
#[derive(Debug, Clone)]
pub struct TemporalSmear {
    trace: WaveState,
    basis_cos: Vec<f32>,
    basis_sin: Vec<f32>,
    rot_cos: Vec<f32>,
    rot_sin: Vec<f32>,
    decay: f32,
    ceiling: f32,
    gain: f32,
}

impl TemporalSmear {
    pub fn new(len: usize, cfg: &SingularityConfig) -> Self {
        let mut basis_cos = Vec::with_capacity(len);
        let mut basis_sin = Vec::with_capacity(len);
        let mut rot_cos = Vec::with_capacity(len);
        let mut rot_sin = Vec::with_capacity(len);
        for i in 0..len {
            let w = slot_frequency(i, len);
            basis_cos.push(w.cos());
            basis_sin.push(w.sin());
            rot_cos.push((w * cfg.wave_dt).cos());
            rot_sin.push((w * cfg.wave_dt).sin());
        }
        Self {
            trace: WaveState::zeros(len),
            basis_cos,
            basis_sin,
            rot_cos,
            rot_sin,
            decay: cfg.smear_decay,
            ceiling: cfg.smear_ceiling,
            gain: cfg.injection_gain,
        }
    }

    /// Blend `observation` into the trace and return the smeared state.
    ///
    /// `smeared = observation_term + decay * rotate(previous_smeared)`,
    /// rescaled to the ceiling when its norm exceeds it. Observations longer
    /// than the general-purpose region fold back onto it.
    pub fn inject(&mut self, observation: &[f32]) -> &WaveState {
        let len = self.trace.len();
        let (re, im) = self.trace.parts_mut();
        for i in 0..len {
            let (r, m) = (re[i], im[i]);
            re[i] = self.decay * (r * self.rot_cos[i] - m * self.rot_sin[i]);
            im[i] = self.decay * (r * self.rot_sin[i] + m * self.rot_cos[i]);
        }

        let span = len - AFFECT_SLOTS;
        for (k, &x) in observation.iter().enumerate() {
            let i = AFFECT_SLOTS + k % span;
            let v = self.gain * x;
            re[i] += v * self.basis_cos[i];
            im[i] += v * self.basis_sin[i];
        }

        self.trace.clamp_norm(self.ceiling);
        &self.trace
    }

    #[inline]
    pub fn trace(&self) -> &WaveState {
        &self.trace
    }

    #[inline]
    pub(crate) fn trace_mut(&mut self) -> &mut WaveState {
        &mut self.trace
    }
}
