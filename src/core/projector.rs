//! Linear read-out from the wave state to per-category action scores, and
//! the temperature-driven choice among them.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "simd")]
use wide::f32x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SingularityConfig;
use crate::prng::Prng;
use crate::rules::HamiltonianRuleSet;
use crate::wave::WaveState;

/// Score of every action of a freshly constructed engine.
pub const BASELINE_SCORE: f32 = 0.0;

// Keeps the normalized update finite on an all-zero state.
const NORM_EPSILON: f32 = 1e-6;

/// Execution tier for score projection.
///
/// - `Scalar`: single-threaded, works everywhere
/// - `Simd`: 4-lane dot products (requires `simd` feature)
/// - `Parallel`: one rayon task per action row (requires `parallel` feature)
///
/// Each tier is deterministic on its own. `Parallel` splits work by row, so
/// it reproduces `Scalar` exactly; `Simd` sums in a different order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

impl ExecutionTier {
    /// The tier actually used given the compiled features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionTier::Scalar => "scalar",
            ExecutionTier::Simd => "simd",
            ExecutionTier::Parallel => "parallel",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionTier> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "cpu" => Some(ExecutionTier::Scalar),
            "simd" => Some(ExecutionTier::Simd),
            "parallel" => Some(ExecutionTier::Parallel),
            _ => None,
        }
    }
}

/// Regime of the system temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThermalPhase {
    /// Cold: deterministic arg-max selection.
    Solid,
    Liquid,
    /// Hot: wide exploration.
    Gas,
}

impl ThermalPhase {
    pub const SOLID_BELOW: f32 = 0.3;
    pub const GAS_ABOVE: f32 = 1.2;

    pub fn from_temperature(t: f32) -> ThermalPhase {
        if t < Self::SOLID_BELOW {
            ThermalPhase::Solid
        } else if t > Self::GAS_ABOVE {
            ThermalPhase::Gas
        } else {
            ThermalPhase::Liquid
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThermalPhase::Solid => "solid",
            ThermalPhase::Liquid => "liquid",
            ThermalPhase::Gas => "gas",
        }
    }
}

/// Category sizes and the flat action index space they concatenate into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLayout {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl ActionLayout {
    pub fn new(sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut total = 0;
        for &s in sizes {
            offsets.push(total);
            total += s;
        }
        Self {
            sizes: sizes.to_vec(),
            offsets,
            total,
        }
    }

    #[inline]
    pub fn categories(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    #[inline]
    pub fn size(&self, category: usize) -> usize {
        self.sizes[category]
    }

    #[inline]
    pub fn offset(&self, category: usize) -> usize {
        self.offsets[category]
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn range(&self, category: usize) -> core::ops::Range<usize> {
        self.offsets[category]..self.offsets[category] + self.sizes[category]
    }

    /// (category, local index) of a flat action index.
    pub fn locate(&self, flat: usize) -> Option<(usize, usize)> {
        if flat >= self.total {
            return None;
        }
        // Categories are few.
        let category = self.offsets.iter().rposition(|&o| o <= flat)?;
        Some((category, flat - self.offsets[category]))
    }
}

#[derive(Debug, Clone)]
pub struct ActionProjector {
    layout: ActionLayout,
    dim: usize,
    // One row of `dim` weights per flat action.
    w_re: Vec<f32>,
    w_im: Vec<f32>,
    momentum: Vec<f32>,
    fatigue: Vec<f32>,
    visits: Vec<u32>,
    tier: ExecutionTier,
    cfg: SingularityConfig,
}

impl ActionProjector {
    pub fn new(dim: usize, layout: ActionLayout, cfg: &SingularityConfig) -> Self {
        let total = layout.total();
        Self {
            layout,
            dim,
            w_re: vec![0.0; total * dim],
            w_im: vec![0.0; total * dim],
            momentum: vec![0.0; total],
            fatigue: vec![0.0; total],
            visits: vec![0; total],
            tier: ExecutionTier::default(),
            cfg: *cfg,
        }
    }

    pub fn layout(&self) -> &ActionLayout {
        &self.layout
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    pub fn execution_tier(&self) -> ExecutionTier {
        self.tier
    }

    pub fn momentum(&self) -> &[f32] {
        &self.momentum
    }

    pub fn fatigue(&self) -> &[f32] {
        &self.fatigue
    }

    pub fn visits(&self) -> &[u32] {
        &self.visits
    }

    /// Weight row of a flat action as (re, im).
    pub fn weights(&self, flat: usize) -> (&[f32], &[f32]) {
        let base = flat * self.dim;
        (
            &self.w_re[base..base + self.dim],
            &self.w_im[base..base + self.dim],
        )
    }

    /// Scores of every action in `category`, written into `out`.
    ///
    /// `score = w·x + baseline + momentum_gain * momentum + bias
    ///          - fatigue_penalty * fatigue`
    pub fn scores_into(
        &self,
        state: &WaveState,
        rules: &HamiltonianRuleSet,
        category: usize,
        out: &mut [f32],
    ) {
        let range = self.layout.range(category);
        debug_assert_eq!(out.len(), range.len());
        self.project_rows(state, range.start, out);
        for (k, o) in out.iter_mut().enumerate() {
            let a = range.start + k;
            *o += BASELINE_SCORE + self.cfg.momentum_gain * self.momentum[a]
                - self.cfg.fatigue_penalty * self.fatigue[a];
        }
        rules.add_bias(range.start, out);
    }

    pub fn scores(
        &self,
        state: &WaveState,
        rules: &HamiltonianRuleSet,
        category: usize,
    ) -> Vec<f32> {
        let mut out = vec![0.0; self.layout.size(category)];
        self.scores_into(state, rules, category, &mut out);
        out
    }

    /// Score of one flat action.
    pub fn score(&self, state: &WaveState, rules: &HamiltonianRuleSet, flat: usize) -> f32 {
        let Some((category, local)) = self.layout.locate(flat) else {
            return BASELINE_SCORE;
        };
        self.scores(state, rules, category)[local]
    }

    /// Choose one local action per category. Returns flat indices.
    pub fn select(
        &self,
        state: &WaveState,
        rules: &HamiltonianRuleSet,
        temperature: f32,
        beta: f32,
        prng: &mut Prng,
    ) -> Vec<usize> {
        let mut chosen = Vec::with_capacity(self.layout.categories());
        let mut buf = Vec::new();
        for c in 0..self.layout.categories() {
            let range = self.layout.range(c);
            buf.clear();
            buf.resize(range.len(), 0.0);
            self.scores_into(state, rules, c, &mut buf);
            for (k, s) in buf.iter_mut().enumerate() {
                *s += beta / ((self.visits[range.start + k] as f32) + 1.0).sqrt();
            }
            chosen.push(range.start + choose(&buf, temperature, beta, prng));
        }
        chosen
    }

    /// Normalized TD step on the weight row of `flat`:
    /// `w += lr * td * x / (|x|^2 + eps)`, clamped to the weight limit.
    pub fn update(&mut self, flat: usize, state: &WaveState, td: f32, lr: f32) {
        let step = lr * td / (state.norm_sq() + NORM_EPSILON);
        if step == 0.0 || !step.is_finite() {
            return;
        }
        let limit = self.cfg.weight_limit;
        let base = flat * self.dim;
        let row_re = &mut self.w_re[base..base + self.dim];
        let row_im = &mut self.w_im[base..base + self.dim];
        for (w, &x) in row_re.iter_mut().zip(state.re()) {
            *w = (*w + step * x).clamp(-limit, limit);
        }
        for (w, &x) in row_im.iter_mut().zip(state.im()) {
            *w = (*w + step * x).clamp(-limit, limit);
        }
    }

    /// Momentum EMA toward the reward, visit count, and fatigue for `flat`.
    pub fn note_outcome(&mut self, flat: usize, reward: f32) {
        let d = self.cfg.momentum_decay;
        self.momentum[flat] = d * self.momentum[flat] + (1.0 - d) * reward;
        self.visits[flat] = self.visits[flat].saturating_add(1);
        let grow = if reward <= 0.0 { self.cfg.fatigue_gain } else { 0.0 };
        self.fatigue[flat] = (self.fatigue[flat] * self.cfg.fatigue_decay + grow).clamp(0.0, 1.0);
    }

    /// Weight-only projection of the state onto rows `start..start + out.len()`.
    fn project_rows(&self, state: &WaveState, start: usize, out: &mut [f32]) {
        let dim = self.dim;
        let (w_re, w_im) = (&self.w_re, &self.w_im);
        let row = |a: usize| {
            let base = (start + a) * dim;
            (&w_re[base..base + dim], &w_im[base..base + dim])
        };

        match self.tier.effective() {
            ExecutionTier::Scalar => {
                for (a, o) in out.iter_mut().enumerate() {
                    let (re, im) = row(a);
                    *o = dot(re, state.re()) + dot(im, state.im());
                }
            }
            ExecutionTier::Simd => {
                for (a, o) in out.iter_mut().enumerate() {
                    let (re, im) = row(a);
                    *o = dot_simd(re, state.re()) + dot_simd(im, state.im());
                }
            }
            ExecutionTier::Parallel => project_parallel(state, start, dim, w_re, w_im, out),
        }
    }

    pub(crate) fn write_image_payload<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        use crate::storage;
        storage::write_f32_slice(w, &self.w_re)?;
        storage::write_f32_slice(w, &self.w_im)?;
        storage::write_f32_slice(w, &self.momentum)?;
        storage::write_f32_slice(w, &self.fatigue)?;
        for &v in &self.visits {
            storage::write_u32_le(w, v)?;
        }
        storage::write_u8(w, self.tier as u8)
    }

    pub(crate) fn read_image_payload<R: std::io::Read>(
        r: &mut R,
        dim: usize,
        layout: ActionLayout,
        cfg: &SingularityConfig,
    ) -> std::io::Result<Self> {
        use crate::storage;
        let mut p = Self::new(dim, layout, cfg);
        let total = p.layout.total();
        p.w_re = storage::read_f32_vec(r, total * dim)?;
        p.w_im = storage::read_f32_vec(r, total * dim)?;
        p.momentum = storage::read_f32_vec(r, total)?;
        p.fatigue = storage::read_f32_vec(r, total)?;
        for v in p.visits.iter_mut() {
            *v = storage::read_u32_le(r)?;
        }
        p.tier = match storage::read_u8(r)? {
            0 => ExecutionTier::Scalar,
            1 => ExecutionTier::Simd,
            2 => ExecutionTier::Parallel,
            _ => return Err(storage::invalid("unknown execution tier")),
        };
        let mut values = p.w_re.iter().chain(&p.w_im).chain(&p.momentum).chain(&p.fatigue);
        if !values.all(|v| v.is_finite()) {
            return Err(storage::invalid("non-finite projector value"));
        }
        Ok(p)
    }
}

/// Selection policy over one category's scores.
///
/// Solid phase (or a vanishing softmax scale) takes the arg-max, lowest
/// index on ties. Otherwise samples from `softmax(score / (beta * T))`.
pub fn choose(scores: &[f32], temperature: f32, beta: f32, prng: &mut Prng) -> usize {
    let scale = beta * temperature;
    if ThermalPhase::from_temperature(temperature) == ThermalPhase::Solid || !(scale > 1e-6) {
        return argmax(scores);
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = scores.iter().map(|s| ((s - max) / scale).exp()).collect();
    prng.choose_weighted(&weights)
}

fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(feature = "simd")]
fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let lanes = n / 4 * 4;
    let mut acc = f32x4::splat(0.0);
    let mut i = 0;
    while i < lanes {
        let va = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc += va * vb;
        i += 4;
    }
    let lanes_sum: f32 = acc.to_array().iter().sum();
    lanes_sum + dot(&a[lanes..n], &b[lanes..n])
}

#[cfg(not(feature = "simd"))]
fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b)
}

#[cfg(feature = "parallel")]
fn project_parallel(
    state: &WaveState,
    start: usize,
    dim: usize,
    w_re: &[f32],
    w_im: &[f32],
    out: &mut [f32],
) {
    out.par_iter_mut().enumerate().for_each(|(a, o)| {
        let base = (start + a) * dim;
        *o = dot(&w_re[base..base + dim], state.re()) + dot(&w_im[base..base + dim], state.im());
    });
}

#[cfg(not(feature = "parallel"))]
fn project_parallel(
    state: &WaveState,
    start: usize,
    dim: usize,
    w_re: &[f32],
    w_im: &[f32],
    out: &mut [f32],
) {
    for (a, o) in out.iter_mut().enumerate() {
        let base = (start + a) * dim;
        *o = dot(&w_re[base..base + dim], state.re()) + dot(&w_im[base..base + dim], state.im());
    }
}
