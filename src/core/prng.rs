// Exploration PRNG (no external crates).
//
// Not cryptographically secure. Its state is part of every snapshot so a
// restored engine draws the same exploration samples as the one that was saved.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prng {
    state: u64,
}

const ZERO_STATE_REPLACEMENT: u64 = 0x9E3779B97F4A7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self::from_state(seed)
    }

    pub(crate) fn from_state(state: u64) -> Self {
        // xorshift never leaves zero.
        let state = if state == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            state
        };
        Self { state }
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform sample in [0, 1).
    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Draw an index with probability proportional to `weights`.
    ///
    /// Non-positive and non-finite weights never win. When every weight is
    /// unusable the draw falls back to uniform.
    pub fn choose_weighted(&mut self, weights: &[f32]) -> usize {
        let total: f32 = weights
            .iter()
            .filter(|w| w.is_finite() && **w > 0.0)
            .sum();
        if weights.is_empty() {
            return 0;
        }
        if !(total > 0.0 && total.is_finite()) {
            return self.gen_range_usize(0, weights.len());
        }

        let mut target = self.next_f32_01() * total;
        let mut last_usable = 0;
        for (i, &w) in weights.iter().enumerate() {
            if !(w.is_finite() && w > 0.0) {
                continue;
            }
            last_usable = i;
            if target < w {
                return i;
            }
            target -= w;
        }
        // Rounding can leave a sliver of `target`; it belongs to the last bucket.
        last_usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(42);
        let mut b = Prng::new(42);
        for _ in 0..32 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn zero_seed_is_remapped() {
        let mut p = Prng::new(0);
        assert_ne!(p.state(), 0);
        assert_ne!(p.next_u32(), 0);
    }

    #[test]
    fn unit_samples_stay_in_range() {
        let mut p = Prng::new(7);
        for _ in 0..10_000 {
            let x = p.next_f32_01();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn weighted_choice_skips_zero_weights() {
        let mut p = Prng::new(3);
        for _ in 0..1000 {
            let i = p.choose_weighted(&[0.0, 2.0, 0.0, f32::NAN]);
            assert_eq!(i, 1);
        }
    }

    #[test]
    fn weighted_choice_follows_weights() {
        let mut p = Prng::new(5);
        let mut hits = [0usize; 2];
        for _ in 0..10_000 {
            hits[p.choose_weighted(&[1.0, 3.0])] += 1;
        }
        let frac = hits[1] as f32 / 10_000.0;
        assert!((0.70..0.80).contains(&frac), "frac = {frac}");
    }

    #[test]
    fn resumed_state_continues_stream() {
        let mut a = Prng::new(99);
        a.next_u32();
        let mut b = Prng::from_state(a.state());
        assert_eq!(a.next_u32(), b.next_u32());
    }
}
