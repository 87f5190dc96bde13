//! Long-term field memory: attractors ("gravity points") anchored to rewarded
//! regions of state space, and ordered couplings ("wormholes") between them.
//!
//! Attractors live in a fixed arena of `attractor_capacity` slots. Their
//! locations share one preallocated flat buffer, so the memory footprint is
//! set at construction and never grows. Couplings reference attractors by
//! slot index and are pruned whenever an endpoint is evicted.

use std::io::{self, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SingularityConfig;
use crate::storage;
use crate::wave::{self, WaveState};

/// Stable slot index of an attractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttractorId(pub u16);

impl AttractorId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Attractor {
    pub strength: f32,
    /// Decay ticks survived since creation.
    pub age: u64,
    /// Engine tick of the most recent reinforcement.
    pub last_reinforced: u64,
    /// Number of reinforcements, creation included.
    pub hits: u32,
    // Monotonic reinforcement order; breaks distance and strength ties.
    stamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coupling {
    pub from: AttractorId,
    pub to: AttractorId,
    pub strength: f32,
    pub created: u64,
}

const COUPLING_MAX_STRENGTH: f32 = 1.0;
const MAX_GRAVITY_PULL: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct FieldMemory {
    cfg: SingularityConfig,
    dim: usize,
    slots: Vec<Option<Attractor>>,
    loc_re: Vec<f32>,
    loc_im: Vec<f32>,
    couplings: Vec<Coupling>,
    stamp: u64,
    last_reinforced: Option<(AttractorId, u64)>,
}

impl FieldMemory {
    pub fn new(dim: usize, cfg: &SingularityConfig) -> Self {
        let cap = cfg.attractor_capacity;
        Self {
            cfg: *cfg,
            dim,
            slots: vec![None; cap],
            loc_re: vec![0.0; cap * dim],
            loc_im: vec![0.0; cap * dim],
            couplings: Vec::with_capacity(cfg.coupling_capacity),
            stamp: 0,
            last_reinforced: None,
        }
    }

    /// Number of live attractors.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn attractor(&self, id: AttractorId) -> Option<&Attractor> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn attractors(&self) -> impl Iterator<Item = (AttractorId, &Attractor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|a| (AttractorId(i as u16), a)))
    }

    /// Location of a live attractor as (re, im) slices.
    pub fn location(&self, id: AttractorId) -> Option<(&[f32], &[f32])> {
        self.attractor(id)?;
        Some(self.loc(id.index()))
    }

    pub fn couplings(&self) -> &[Coupling] {
        &self.couplings
    }

    pub fn total_strength(&self) -> f32 {
        self.attractors().map(|(_, a)| a.strength).sum()
    }

    /// Aggregate field load in [0, 1]: total strength relative to a full
    /// arena sitting exactly at the event horizon.
    pub fn load(&self) -> f32 {
        let full = self.capacity() as f32 * self.cfg.event_horizon;
        (self.total_strength() / full).clamp(0.0, 1.0)
    }

    /// Fraction of strength kept by one decay tick at strength `s`.
    ///
    /// Below the transition band this is `attractor_decay`; above the event
    /// horizon only `orbit_leak` is lost. The band in between is a smoothstep,
    /// so the rate is continuous in `s`.
    pub fn retention(&self, s: f32) -> f32 {
        let h = self.cfg.event_horizon;
        let g = 1.0 - smoothstep(h - self.cfg.horizon_width, h, s);
        let loss = (1.0 - self.cfg.attractor_decay) * g + self.cfg.orbit_leak * (1.0 - g);
        1.0 - loss
    }

    /// Nearest live attractor to `state` and its distance.
    ///
    /// Equal distances resolve to the most recently reinforced attractor.
    pub fn nearest(&self, state: &WaveState) -> Option<(AttractorId, f32)> {
        let mut best: Option<(AttractorId, f32, u64)> = None;
        for (id, a) in self.attractors() {
            let (re, im) = self.loc(id.index());
            let d = wave::distance_sq(state.re(), state.im(), re, im);
            let better = match best {
                None => true,
                Some((_, bd, bs)) => d < bd || (d == bd && a.stamp > bs),
            };
            if better {
                best = Some((id, d, a.stamp));
            }
        }
        best.map(|(id, d, _)| (id, d.sqrt()))
    }

    /// Pull `state` toward nearby attractors and fire couplings whose source
    /// endpoint the state currently sits on.
    ///
    /// Couplings are directed. Sitting on `to` does not jump back to `from`;
    /// the reverse link only exists if the order was also rewarded.
    pub fn perturb(&self, state: &mut WaveState) {
        if self.is_empty() {
            return;
        }
        let r2 = self.cfg.capture_radius * self.cfg.capture_radius;

        for (i, slot) in self.slots.iter().enumerate() {
            let Some(a) = slot else { continue };
            let (lre, lim) = self.loc(i);
            let d2 = wave::distance_sq(state.re(), state.im(), lre, lim);
            let k = (self.cfg.gravity_gain * a.strength / (1.0 + d2 / r2)).min(MAX_GRAVITY_PULL);
            if k <= 0.0 {
                continue;
            }
            let (re, im) = state.parts_mut();
            for j in 0..self.dim {
                re[j] += k * (lre[j] - re[j]);
                im[j] += k * (lim[j] - im[j]);
            }
        }

        let radius_sq = self.cfg.activation_radius * self.cfg.activation_radius;
        for c in &self.couplings {
            let (are, aim) = self.loc(c.from.index());
            if wave::distance_sq(state.re(), state.im(), are, aim) >= radius_sq {
                continue;
            }
            // Phase of <loc_from, state>; the jump arrives aligned with it.
            let mut dot_re = 0.0;
            let mut dot_im = 0.0;
            for j in 0..self.dim {
                dot_re += are[j] * state.re()[j] + aim[j] * state.im()[j];
                dot_im += are[j] * state.im()[j] - aim[j] * state.re()[j];
            }
            let theta = dot_im.atan2(dot_re);
            let (cos_t, sin_t) = (theta.cos(), theta.sin());
            let g = self.cfg.jump_gain * c.strength;
            let (bre, bim) = self.loc(c.to.index());
            let (re, im) = state.parts_mut();
            for j in 0..self.dim {
                re[j] += g * (bre[j] * cos_t - bim[j] * sin_t);
                im[j] += g * (bre[j] * sin_t + bim[j] * cos_t);
            }
        }

        state.clamp_norm(self.cfg.smear_ceiling);
    }

    /// Record a reward at `state`.
    ///
    /// Rewards below the threshold are ignored. Otherwise the nearest
    /// attractor inside the capture radius is strengthened (and its location
    /// moves toward the running centroid), or a new attractor is inserted.
    /// Two distinct attractors reinforced within the coupling window are
    /// linked from the earlier to the later one.
    pub fn reinforce(&mut self, state: &WaveState, reward: f32, now: u64) -> Option<AttractorId> {
        if !(reward >= self.cfg.reward_threshold) || reward <= 0.0 {
            return None;
        }
        let amount = self.cfg.attractor_gain * reward;

        let captured = match self.nearest(state) {
            Some((id, d)) if d <= self.cfg.capture_radius => Some(id),
            _ => None,
        };

        let target = match captured {
            Some(id) => {
                self.stamp += 1;
                let stamp = self.stamp;
                let max = self.cfg.attractor_max_strength;
                let Some(a) = self.slots[id.index()].as_mut() else {
                    return None;
                };
                a.strength = (a.strength + amount).min(max);
                a.last_reinforced = now;
                a.hits = a.hits.saturating_add(1);
                a.stamp = stamp;
                let w = 1.0 / a.hits as f32;
                let base = id.index() * self.dim;
                for j in 0..self.dim {
                    self.loc_re[base + j] += w * (state.re()[j] - self.loc_re[base + j]);
                    self.loc_im[base + j] += w * (state.im()[j] - self.loc_im[base + j]);
                }
                Some(id)
            }
            None => self.insert_attractor(state.re(), state.im(), amount, now),
        };

        if let Some(id) = target {
            if let Some((prev, at)) = self.last_reinforced {
                let within = now.saturating_sub(at) <= self.cfg.coupling_window as u64;
                if prev != id && within && self.attractor(prev).is_some() {
                    self.link(prev, id, now);
                }
            }
            self.last_reinforced = Some((id, now));
        }
        target
    }

    /// Insert an attractor at the given location.
    ///
    /// At capacity the weakest attractor (oldest on ties) is evicted, unless
    /// the newcomer is not stronger than it, in which case nothing changes
    /// and `None` is returned.
    pub fn insert_attractor(
        &mut self,
        re: &[f32],
        im: &[f32],
        strength: f32,
        now: u64,
    ) -> Option<AttractorId> {
        if !(strength.is_finite() && strength > 0.0) || re.len() != self.dim || im.len() != self.dim
        {
            return None;
        }
        let strength = strength.min(self.cfg.attractor_max_strength);

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                let (weakest, ws) = self.weakest()?;
                if strength <= ws {
                    return None;
                }
                tracing::debug!(
                    slot = weakest.0,
                    strength = ws,
                    "evicting weakest attractor for a stronger newcomer"
                );
                self.evict(weakest);
                weakest.index()
            }
        };

        let base = slot * self.dim;
        self.loc_re[base..base + self.dim].copy_from_slice(re);
        self.loc_im[base..base + self.dim].copy_from_slice(im);
        self.stamp += 1;
        self.slots[slot] = Some(Attractor {
            strength,
            age: 0,
            last_reinforced: now,
            hits: 1,
            stamp: self.stamp,
        });
        tracing::debug!(slot, strength, "attractor formed");
        Some(AttractorId(slot as u16))
    }

    /// Age every attractor and coupling by one tick. Returns the number of
    /// attractors evicted below the floor.
    pub fn decay_tick(&mut self) -> usize {
        let mut evicted = 0;
        let floor = self.cfg.attractor_floor;
        for i in 0..self.slots.len() {
            let retention = match &self.slots[i] {
                Some(a) => self.retention(a.strength),
                None => continue,
            };
            let below_floor = match self.slots[i].as_mut() {
                Some(a) => {
                    a.strength *= retention;
                    a.age = a.age.saturating_add(1);
                    a.strength < floor
                }
                None => false,
            };
            if below_floor {
                self.evict(AttractorId(i as u16));
                evicted += 1;
            }
        }

        let decay = self.cfg.coupling_decay;
        let coupling_floor = self.cfg.coupling_floor;
        self.couplings.retain_mut(|c| {
            c.strength *= decay;
            c.strength >= coupling_floor
        });

        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.len(), "attractors decayed away");
        }
        evicted
    }

    fn weakest(&self) -> Option<(AttractorId, f32)> {
        self.attractors()
            .min_by(|(_, a), (_, b)| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(core::cmp::Ordering::Equal)
                    .then(a.stamp.cmp(&b.stamp))
            })
            .map(|(id, a)| (id, a.strength))
    }

    fn evict(&mut self, id: AttractorId) {
        self.slots[id.index()] = None;
        self.couplings.retain(|c| c.from != id && c.to != id);
        if matches!(self.last_reinforced, Some((prev, _)) if prev == id) {
            self.last_reinforced = None;
        }
    }

    fn link(&mut self, from: AttractorId, to: AttractorId, now: u64) {
        let gain = self.cfg.coupling_gain;
        if gain <= 0.0 {
            return;
        }
        if let Some(c) = self
            .couplings
            .iter_mut()
            .find(|c| c.from == from && c.to == to)
        {
            c.strength = (c.strength + gain).min(COUPLING_MAX_STRENGTH);
            return;
        }

        let fresh = Coupling {
            from,
            to,
            strength: gain.min(COUPLING_MAX_STRENGTH),
            created: now,
        };
        if self.couplings.len() < self.cfg.coupling_capacity {
            self.couplings.push(fresh);
            tracing::debug!(from = from.0, to = to.0, "coupling formed");
            return;
        }
        let weakest = self
            .couplings
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(core::cmp::Ordering::Equal)
            })
            .map(|(i, c)| (i, c.strength));
        if let Some((i, s)) = weakest {
            if fresh.strength > s {
                self.couplings[i] = fresh;
            }
        }
    }

    #[inline]
    fn loc(&self, slot: usize) -> (&[f32], &[f32]) {
        let base = slot * self.dim;
        (
            &self.loc_re[base..base + self.dim],
            &self.loc_im[base..base + self.dim],
        )
    }

    pub(crate) fn write_image_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u64_le(w, self.stamp)?;
        match self.last_reinforced {
            Some((id, at)) => {
                storage::write_u8(w, 1)?;
                storage::write_u32_le(w, id.0 as u32)?;
                storage::write_u64_le(w, at)?;
            }
            None => storage::write_u8(w, 0)?,
        }

        storage::write_len(w, self.slots.len())?;
        for (i, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(a) => {
                    storage::write_u8(w, 1)?;
                    storage::write_f32_le(w, a.strength)?;
                    storage::write_u64_le(w, a.age)?;
                    storage::write_u64_le(w, a.last_reinforced)?;
                    storage::write_u32_le(w, a.hits)?;
                    storage::write_u64_le(w, a.stamp)?;
                    let (re, im) = self.loc(i);
                    storage::write_f32_slice(w, re)?;
                    storage::write_f32_slice(w, im)?;
                }
                None => storage::write_u8(w, 0)?,
            }
        }

        storage::write_len(w, self.couplings.len())?;
        for c in &self.couplings {
            storage::write_u32_le(w, c.from.0 as u32)?;
            storage::write_u32_le(w, c.to.0 as u32)?;
            storage::write_f32_le(w, c.strength)?;
            storage::write_u64_le(w, c.created)?;
        }
        Ok(())
    }

    pub(crate) fn read_image_payload<R: Read>(
        r: &mut R,
        dim: usize,
        cfg: &SingularityConfig,
    ) -> io::Result<Self> {
        let mut field = Self::new(dim, cfg);
        field.stamp = storage::read_u64_le(r)?;
        if storage::read_bool(r)? {
            let id = field.read_id(r)?;
            let at = storage::read_u64_le(r)?;
            field.last_reinforced = Some((id, at));
        }

        let cap = storage::read_len(r, SingularityConfig::MAX_FIELD_CAPACITY)?;
        if cap != field.slots.len() {
            return Err(storage::invalid("attractor capacity mismatch"));
        }
        for i in 0..cap {
            if !storage::read_bool(r)? {
                continue;
            }
            let strength = storage::read_f32_le(r)?;
            let age = storage::read_u64_le(r)?;
            let last_reinforced = storage::read_u64_le(r)?;
            let hits = storage::read_u32_le(r)?;
            let stamp = storage::read_u64_le(r)?;
            if !strength.is_finite() {
                return Err(storage::invalid("non-finite attractor strength"));
            }
            let re = storage::read_f32_vec(r, dim)?;
            let im = storage::read_f32_vec(r, dim)?;
            if !re.iter().chain(&im).all(|v| v.is_finite()) {
                return Err(storage::invalid("non-finite attractor location"));
            }
            let base = i * dim;
            field.loc_re[base..base + dim].copy_from_slice(&re);
            field.loc_im[base..base + dim].copy_from_slice(&im);
            field.slots[i] = Some(Attractor {
                strength,
                age,
                last_reinforced,
                hits,
                stamp,
            });
        }

        let n = storage::read_len(r, cfg.coupling_capacity)?;
        for _ in 0..n {
            let from = field.read_id(r)?;
            let to = field.read_id(r)?;
            let strength = storage::read_f32_le(r)?;
            let created = storage::read_u64_le(r)?;
            if field.attractor(from).is_none() || field.attractor(to).is_none() {
                return Err(storage::invalid("coupling references a dead attractor"));
            }
            field.couplings.push(Coupling {
                from,
                to,
                strength,
                created,
            });
        }
        if let Some((id, _)) = field.last_reinforced {
            if field.attractor(id).is_none() {
                return Err(storage::invalid("last reinforcement references a dead attractor"));
            }
        }
        Ok(field)
    }

    fn read_id<R: Read>(&self, r: &mut R) -> io::Result<AttractorId> {
        let raw = storage::read_u32_le(r)? as usize;
        if raw >= self.slots.len() {
            return Err(storage::invalid("attractor id out of range"));
        }
        Ok(AttractorId(raw as u16))
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 16;

    fn cfg() -> SingularityConfig {
        SingularityConfig {
            attractor_capacity: 3,
            coupling_capacity: 4,
            ..Default::default()
        }
    }

    fn point(slot: usize, amp: f32) -> WaveState {
        let mut re = vec![0.0; DIM];
        re[slot] = amp;
        WaveState::from_parts(re, vec![0.0; DIM])
    }

    #[test]
    fn reward_below_threshold_is_ignored() {
        let mut f = FieldMemory::new(DIM, &cfg());
        assert_eq!(f.reinforce(&point(5, 0.8), 0.1, 0), None);
        assert!(f.is_empty());
    }

    #[test]
    fn repeated_reward_captures_the_same_attractor() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let s = point(5, 0.8);
        let a = f.reinforce(&s, 1.0, 0).unwrap();
        let b = f.reinforce(&s, 1.0, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(f.len(), 1);
        assert_eq!(f.attractor(a).unwrap().hits, 2);
        assert!((f.attractor(a).unwrap().strength - 0.5).abs() < 1e-6);
    }

    #[test]
    fn strength_grows_monotonically_then_orbits() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let s = point(6, 0.9);
        let horizon = cfg().event_horizon;
        let mut last = 0.0;
        let mut id = None;
        while last < horizon {
            id = f.reinforce(&s, 1.0, 0);
            let now = f.attractor(id.unwrap()).unwrap().strength;
            assert!(now > last);
            last = now;
        }

        let id = id.unwrap();
        let at_horizon = f.attractor(id).unwrap().strength;
        for _ in 0..200 {
            f.decay_tick();
        }
        let after = f.attractor(id).unwrap().strength;
        assert!((at_horizon - after).abs() < 1e-3, "{at_horizon} -> {after}");
    }

    #[test]
    fn weak_attractors_decay_and_are_evicted() {
        let mut f = FieldMemory::new(DIM, &cfg());
        f.reinforce(&point(5, 0.8), 1.0, 0);
        let mut evicted = 0;
        for _ in 0..500 {
            evicted += f.decay_tick();
        }
        assert_eq!(evicted, 1);
        assert!(f.is_empty());
    }

    #[test]
    fn retention_is_continuous_across_the_horizon() {
        let f = FieldMemory::new(DIM, &cfg());
        let h = cfg().event_horizon;
        let mut prev = f.retention(0.0);
        let mut s = 0.0;
        while s < h + 1.0 {
            let r = f.retention(s);
            assert!((r - prev).abs() < 1e-3, "jump at {s}");
            assert!(r >= prev - 1e-7, "retention must not drop as strength grows");
            prev = r;
            s += 0.01;
        }
        assert!((f.retention(h) - (1.0 - cfg().orbit_leak)).abs() < 1e-7);
    }

    #[test]
    fn decay_on_empty_field_changes_nothing() {
        let mut f = FieldMemory::new(DIM, &cfg());
        assert_eq!(f.decay_tick(), 0);
        assert_eq!(f.load(), 0.0);
        assert!(f.couplings().is_empty());
    }

    #[test]
    fn weaker_insert_at_capacity_is_rejected() {
        let mut f = FieldMemory::new(DIM, &cfg());
        for (i, s) in [0.5, 0.6, 0.7].into_iter().enumerate() {
            let p = point(4 + i, 1.0);
            f.insert_attractor(p.re(), p.im(), s, 0).unwrap();
        }
        let before: Vec<_> = f.attractors().map(|(id, a)| (id, a.strength)).collect();

        let p = point(10, 1.0);
        assert_eq!(f.insert_attractor(p.re(), p.im(), 0.4, 1), None);
        let after: Vec<_> = f.attractors().map(|(id, a)| (id, a.strength)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn stronger_insert_at_capacity_evicts_exactly_the_weakest() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let mut ids = Vec::new();
        for (i, s) in [0.6, 0.5, 0.7].into_iter().enumerate() {
            let p = point(4 + i, 1.0);
            ids.push(f.insert_attractor(p.re(), p.im(), s, 0).unwrap());
        }
        let p = point(10, 1.0);
        let new_id = f.insert_attractor(p.re(), p.im(), 0.55, 1).unwrap();
        assert_eq!(new_id, ids[1]);
        assert_eq!(f.len(), 3);
        assert!(f.attractor(ids[0]).is_some());
        assert!(f.attractor(ids[2]).is_some());
        assert_eq!(f.location(new_id).unwrap().0[10], 1.0);
    }

    #[test]
    fn close_rewards_in_time_form_a_coupling() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let a = f.reinforce(&point(4, 0.9), 1.0, 10).unwrap();
        let b = f.reinforce(&point(9, 0.9), 1.0, 12).unwrap();
        assert_eq!(f.couplings().len(), 1);
        assert_eq!((f.couplings()[0].from, f.couplings()[0].to), (a, b));

        // Outside the window: no new coupling.
        f.reinforce(&point(12, 0.9), 1.0, 100);
        assert_eq!(f.couplings().len(), 1);
    }

    #[test]
    fn evicting_an_endpoint_prunes_its_couplings() {
        let mut f = FieldMemory::new(DIM, &cfg());
        f.reinforce(&point(4, 0.9), 0.6, 0);
        f.reinforce(&point(9, 0.9), 1.0, 1);
        assert_eq!(f.couplings().len(), 1);
        // Fill and force out the weak first attractor.
        f.reinforce(&point(12, 0.9), 1.0, 50);
        let p = point(14, 0.9);
        f.insert_attractor(p.re(), p.im(), 1.0, 51).unwrap();
        assert_eq!(f.len(), 3);
        assert!(f.couplings().is_empty());
    }

    #[test]
    fn equal_distance_ties_go_to_most_recent() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let a = point(4, 0.5);
        let b = point(5, 0.5);
        f.insert_attractor(a.re(), a.im(), 1.0, 0).unwrap();
        let second = f.insert_attractor(b.re(), b.im(), 1.0, 1).unwrap();
        // Origin is equidistant from both.
        let origin = WaveState::zeros(DIM);
        assert_eq!(f.nearest(&origin).unwrap().0, second);
    }

    #[test]
    fn perturb_pulls_toward_attractor() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let target = point(7, 0.8);
        f.insert_attractor(target.re(), target.im(), 2.0, 0).unwrap();
        let mut s = point(7, 0.4);
        let before = s.distance_to(target.re(), target.im());
        f.perturb(&mut s);
        let after = s.distance_to(target.re(), target.im());
        assert!(after < before);
    }

    #[test]
    fn coupling_jump_injects_into_paired_endpoint() {
        let mut f = FieldMemory::new(DIM, &cfg());
        f.reinforce(&point(4, 0.9), 1.0, 0);
        f.reinforce(&point(11, 0.9), 1.0, 1);
        assert_eq!(f.couplings().len(), 1);

        let mut s = point(4, 0.9);
        f.perturb(&mut s);
        assert!(s.re()[11] > 0.0);
    }

    #[test]
    fn couplings_fire_one_way() {
        let mut linked = FieldMemory::new(DIM, &cfg());
        linked.reinforce(&point(4, 0.9), 1.0, 0);
        linked.reinforce(&point(11, 0.9), 1.0, 1);
        let mut unlinked = FieldMemory::new(DIM, &cfg());
        unlinked.reinforce(&point(4, 0.9), 1.0, 0);
        unlinked.reinforce(&point(11, 0.9), 1.0, 100);
        assert_eq!(linked.couplings().len(), 1);
        assert!(unlinked.couplings().is_empty());

        let (mut a, mut b) = (point(11, 0.9), point(11, 0.9));
        linked.perturb(&mut a);
        unlinked.perturb(&mut b);
        assert_eq!(a, b);

        let (mut a, mut b) = (point(4, 0.9), point(4, 0.9));
        linked.perturb(&mut a);
        unlinked.perturb(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn couplings_outlast_sub_horizon_attractors() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let a = point(4, 1.0);
        let b = point(9, 1.0);
        let ia = f.insert_attractor(a.re(), a.im(), 1.0, 0).unwrap();
        let ib = f.insert_attractor(b.re(), b.im(), 1.0, 0).unwrap();
        f.link(ia, ib, 0);
        let coupling_start = f.couplings()[0].strength;

        for _ in 0..20 {
            f.decay_tick();
        }
        let attractor_kept = f.attractor(ia).unwrap().strength;
        let coupling_kept = f.couplings()[0].strength / coupling_start;
        assert!(attractor_kept < 1.0);
        assert!(
            coupling_kept > attractor_kept,
            "{coupling_kept} vs {attractor_kept}"
        );
    }

    #[test]
    fn couplings_below_the_floor_are_dropped() {
        let mut f = FieldMemory::new(DIM, &cfg());
        let a = point(4, 1.0);
        let b = point(9, 1.0);
        // Orbiting endpoints barely decay, so only the coupling fades.
        let ia = f.insert_attractor(a.re(), a.im(), 4.0, 0).unwrap();
        let ib = f.insert_attractor(b.re(), b.im(), 4.0, 0).unwrap();
        f.link(ia, ib, 0);

        for _ in 0..450 {
            f.decay_tick();
        }
        assert_eq!(f.couplings().len(), 1);
        assert!(f.couplings()[0].strength >= cfg().coupling_floor);
        for _ in 0..20 {
            f.decay_tick();
        }
        assert!(f.couplings().is_empty());
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn full_coupling_table_replaces_only_a_weaker_link() {
        let cfg = SingularityConfig {
            attractor_capacity: 4,
            coupling_capacity: 2,
            ..Default::default()
        };
        let mut f = FieldMemory::new(DIM, &cfg);
        let ids: Vec<_> = [2, 6, 10]
            .into_iter()
            .map(|k| {
                let p = point(k, 1.0);
                f.insert_attractor(p.re(), p.im(), 4.0, 0).unwrap()
            })
            .collect();
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        f.link(a, b, 0);
        f.link(a, b, 1);
        f.link(b, c, 2);
        assert_eq!(f.couplings().len(), 2);

        // Same strength as the weakest: rejected.
        f.link(c, a, 3);
        let pairs: Vec<_> = f.couplings().iter().map(|k| (k.from, k.to)).collect();
        assert_eq!(pairs, vec![(a, b), (b, c)]);

        // After one decay the weakest is below a fresh link and is replaced.
        f.decay_tick();
        f.link(c, a, 4);
        let pairs: Vec<_> = f.couplings().iter().map(|k| (k.from, k.to)).collect();
        assert_eq!(pairs, vec![(a, b), (c, a)]);
    }

    #[test]
    fn image_payload_roundtrip() {
        let mut f = FieldMemory::new(DIM, &cfg());
        f.reinforce(&point(4, 0.9), 1.0, 0);
        f.reinforce(&point(9, 0.9), 1.0, 2);
        f.decay_tick();

        let mut buf = Vec::new();
        f.write_image_payload(&mut buf).unwrap();
        let g = FieldMemory::read_image_payload(&mut io::Cursor::new(buf), DIM, &cfg()).unwrap();

        let a: Vec<_> = f.attractors().map(|(id, a)| (id, *a)).collect();
        let b: Vec<_> = g.attractors().map(|(id, a)| (id, *a)).collect();
        assert_eq!(a, b);
        assert_eq!(f.couplings(), g.couplings());
        assert_eq!(f.loc_re, g.loc_re);
    }
}
