//! Versioned engine image.
//!
//! Layout: `MAGIC` (8 bytes), `u32` version, then LZ4 chunks (see
//! `storage::write_chunk_lz4`). Chunks:
//!
//! | tag    | contents                                             |
//! |--------|------------------------------------------------------|
//! | `CFG0` | state size, category sizes, every tunable            |
//! | `PRNG` | exploration PRNG state                               |
//! | `CLCK` | tick counter                                         |
//! | `WAVE` | current state (re, im)                               |
//! | `SMER` | smearing trace (re, im)                              |
//! | `FELD` | attractors, locations, couplings                     |
//! | `RULE` | registered rules, inferred rules, active conditions  |
//! | `PROJ` | weights, momentum, fatigue, visits, execution tier   |
//! | `META` | temperature, frustration, adrenaline, beta           |
//! | `AFCT` | affect node states and wiring                        |
//! | `LAST` | credit trace of the most recent selection            |
//!
//! Unknown chunks are skipped. Loading is staged: nothing in the running
//! engine changes until the whole image has been decoded and validated.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::affect::AffectCircuit;
use crate::config::SingularityConfig;
use crate::engine::{validate_shape, Singularity};
use crate::error::{SingularityError, SingularityResult};
use crate::field::FieldMemory;
use crate::prng::Prng;
use crate::projector::{ActionLayout, ActionProjector};
use crate::rules::HamiltonianRuleSet;
use crate::storage::{self, CountingWriter};
use crate::wave::{TemporalSmear, WaveState};

const TAG_CONFIG: [u8; 4] = *b"CFG0";
const TAG_PRNG: [u8; 4] = *b"PRNG";
const TAG_CLOCK: [u8; 4] = *b"CLCK";
const TAG_WAVE: [u8; 4] = *b"WAVE";
const TAG_SMEAR: [u8; 4] = *b"SMER";
const TAG_FIELD: [u8; 4] = *b"FELD";
const TAG_RULES: [u8; 4] = *b"RULE";
const TAG_PROJECTOR: [u8; 4] = *b"PROJ";
const TAG_META: [u8; 4] = *b"META";
const TAG_AFFECT: [u8; 4] = *b"AFCT";
const TAG_LAST: [u8; 4] = *b"LAST";

// Guards the category count read from an image.
const MAX_CATEGORIES: usize = 1 << 16;

macro_rules! f32_tunables {
    ($($field:ident),* $(,)?) => {
        fn write_f32_tunables<W: Write>(w: &mut W, cfg: &SingularityConfig) -> io::Result<()> {
            $(storage::write_f32_le(w, cfg.$field)?;)*
            Ok(())
        }

        fn read_f32_tunables<R: Read>(r: &mut R, cfg: &mut SingularityConfig) -> io::Result<()> {
            $(cfg.$field = storage::read_f32_le(r)?;)*
            Ok(())
        }
    };
}

f32_tunables!(
    smear_decay,
    smear_ceiling,
    injection_gain,
    wave_dt,
    reward_threshold,
    capture_radius,
    attractor_gain,
    attractor_max_strength,
    attractor_decay,
    event_horizon,
    horizon_width,
    orbit_leak,
    attractor_floor,
    gravity_gain,
    coupling_gain,
    coupling_decay,
    coupling_floor,
    activation_radius,
    jump_gain,
    learning_rate,
    weight_limit,
    momentum_decay,
    momentum_gain,
    fatigue_decay,
    fatigue_gain,
    fatigue_penalty,
    exploration_beta,
    initial_temperature,
    max_temperature,
    heat_gain,
    cool_gain,
    temperature_retention,
    frustration_gain,
    frustration_decay,
    adrenaline_threshold,
    adrenaline_gain,
    adrenaline_decay,
    inferred_rule_rate,
    imitation_reward,
    imitation_margin,
);

struct Shape {
    state_size: usize,
    category_sizes: Vec<usize>,
    cfg: SingularityConfig,
}

impl Singularity {
    /// Serialize the complete engine state.
    pub fn save(&self) -> SingularityResult<Vec<u8>> {
        let mut out = Vec::new();
        self.save_to(&mut out)?;
        Ok(out)
    }

    pub fn save_to<W: Write>(&self, w: &mut W) -> SingularityResult<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut buf = Vec::new();
        put(w, &mut buf, TAG_CONFIG, |b| self.write_config_payload(b))?;
        put(w, &mut buf, TAG_PRNG, |b| storage::write_u64_le(b, self.prng.state()))?;
        put(w, &mut buf, TAG_CLOCK, |b| storage::write_u64_le(b, self.tick))?;
        put(w, &mut buf, TAG_WAVE, |b| write_wave(b, &self.wave))?;
        put(w, &mut buf, TAG_SMEAR, |b| write_wave(b, self.smear.trace()))?;
        put(w, &mut buf, TAG_FIELD, |b| self.field.write_image_payload(b))?;
        put(w, &mut buf, TAG_RULES, |b| self.rules.write_image_payload(b))?;
        put(w, &mut buf, TAG_PROJECTOR, |b| self.projector.write_image_payload(b))?;
        put(w, &mut buf, TAG_META, |b| {
            storage::write_f32_le(b, self.temperature)?;
            storage::write_f32_le(b, self.frustration)?;
            storage::write_f32_le(b, self.adrenaline)?;
            storage::write_f32_le(b, self.exploration_beta)
        })?;
        put(w, &mut buf, TAG_AFFECT, |b| self.affect.write_image_payload(b))?;
        put(w, &mut buf, TAG_LAST, |b| {
            storage::write_u8(b, self.has_selection as u8)?;
            for &a in &self.last_actions {
                storage::write_len(b, a)?;
            }
            write_wave(b, &self.last_state)
        })?;
        Ok(())
    }

    /// Size in bytes `save` would produce, without keeping the bytes.
    pub fn snapshot_size_bytes(&self) -> SingularityResult<usize> {
        let mut counter = CountingWriter::new();
        self.save_to(&mut counter)?;
        Ok(counter.written())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> SingularityResult<()> {
        let file = fs::File::create(path)?;
        let mut w = io::BufWriter::new(file);
        self.save_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    /// Restore from an image produced by `save`.
    ///
    /// The image must match this engine's state size and category sizes;
    /// its tunables replace the current ones. On any error the engine is
    /// left exactly as it was.
    pub fn load(&mut self, bytes: &[u8]) -> SingularityResult<()> {
        match Self::decode(bytes, self.state_size, self.projector.layout().sizes()) {
            Ok(staged) => {
                *self = staged;
                tracing::debug!(tick = self.tick, "snapshot loaded");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "snapshot rejected");
                Err(err)
            }
        }
    }

    pub fn load_from<R: Read>(&mut self, r: &mut R) -> SingularityResult<()> {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes)?;
        self.load(&bytes)
    }

    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> SingularityResult<()> {
        let bytes = fs::read(path)?;
        self.load(&bytes)
    }

    fn write_config_payload(&self, w: &mut Vec<u8>) -> io::Result<()> {
        storage::write_len(w, self.state_size)?;
        let sizes = self.projector.layout().sizes();
        storage::write_len(w, sizes.len())?;
        for &s in sizes {
            storage::write_len(w, s)?;
        }

        let cfg = &self.cfg;
        storage::write_len(w, cfg.attractor_capacity)?;
        storage::write_len(w, cfg.coupling_capacity)?;
        storage::write_len(w, cfg.max_rules)?;
        storage::write_len(w, cfg.inferred_rule_capacity)?;
        storage::write_u32_le(w, cfg.coupling_window)?;
        storage::write_u8(w, cfg.seed.is_some() as u8)?;
        storage::write_u64_le(w, cfg.seed.unwrap_or(0))?;
        write_f32_tunables(w, cfg)
    }

    fn decode(
        bytes: &[u8],
        state_size: usize,
        category_sizes: &[usize],
    ) -> SingularityResult<Singularity> {
        let mut r = io::Cursor::new(bytes);
        let magic = storage::read_exact::<8, _>(&mut r).map_err(|_| malformed("missing header"))?;
        if &magic != storage::MAGIC {
            return Err(malformed("bad magic"));
        }
        let version = storage::read_u32_le(&mut r).map_err(|_| malformed("missing version"))?;
        if version != storage::VERSION_CURRENT {
            return Err(SingularityError::UnsupportedVersion {
                found: version,
                expected: storage::VERSION_CURRENT,
            });
        }

        let mut chunks = Chunks::default();
        while r.position() < bytes.len() as u64 {
            let (tag, len) = storage::read_chunk_header(&mut r)
                .map_err(|e| malformed(&format!("chunk header: {e}")))?;
            let payload = storage::read_chunk_payload(&mut r, len)
                .map_err(|e| malformed(&format!("chunk {}: {e}", tag_name(&tag))))?;
            let slot = match tag {
                TAG_CONFIG => &mut chunks.config,
                TAG_PRNG => &mut chunks.prng,
                TAG_CLOCK => &mut chunks.clock,
                TAG_WAVE => &mut chunks.wave,
                TAG_SMEAR => &mut chunks.smear,
                TAG_FIELD => &mut chunks.field,
                TAG_RULES => &mut chunks.rules,
                TAG_PROJECTOR => &mut chunks.projector,
                TAG_META => &mut chunks.meta,
                TAG_AFFECT => &mut chunks.affect,
                TAG_LAST => &mut chunks.last,
                _ => continue,
            };
            if slot.replace(payload).is_some() {
                return Err(malformed(&format!("duplicate chunk {}", tag_name(&tag))));
            }
        }

        let shape = parse(TAG_CONFIG, chunks.config.as_deref(), read_shape)?;
        if shape.state_size != state_size || shape.category_sizes != category_sizes {
            return Err(SingularityError::IncompatibleConfiguration(format!(
                "snapshot has state size {} and categories {:?}, engine has {} and {:?}",
                shape.state_size, shape.category_sizes, state_size, category_sizes
            )));
        }
        let cfg = shape.cfg;
        let n = state_size;
        let layout = ActionLayout::new(category_sizes);
        let categories = layout.categories();
        let total = layout.total();

        let prng = parse(TAG_PRNG, chunks.prng.as_deref(), |r| {
            Ok(Prng::from_state(storage::read_u64_le(r)?))
        })?;
        let tick = parse(TAG_CLOCK, chunks.clock.as_deref(), storage::read_u64_le)?;
        let wave = parse(TAG_WAVE, chunks.wave.as_deref(), |r| read_wave(r, n))?;
        let trace = parse(TAG_SMEAR, chunks.smear.as_deref(), |r| read_wave(r, n))?;
        let field = parse(TAG_FIELD, chunks.field.as_deref(), |r| {
            FieldMemory::read_image_payload(r, n, &cfg)
        })?;
        let rules = parse(TAG_RULES, chunks.rules.as_deref(), |r| {
            HamiltonianRuleSet::read_image_payload(r, total, &cfg)
        })?;
        let projector = parse(TAG_PROJECTOR, chunks.projector.as_deref(), |r| {
            ActionProjector::read_image_payload(r, n, layout.clone(), &cfg)
        })?;
        let (temperature, frustration, adrenaline, exploration_beta) =
            parse(TAG_META, chunks.meta.as_deref(), |r| {
                let t = storage::read_f32_le(r)?;
                let f = storage::read_f32_le(r)?;
                let a = storage::read_f32_le(r)?;
                let b = storage::read_f32_le(r)?;
                if ![t, f, a, b].iter().all(|v| v.is_finite() && *v >= 0.0) {
                    return Err(storage::invalid("metrics must be finite and >= 0"));
                }
                Ok((t, f, a, b))
            })?;
        let affect = parse(TAG_AFFECT, chunks.affect.as_deref(), AffectCircuit::read_image_payload)?;
        let (has_selection, last_actions, last_state) =
            parse(TAG_LAST, chunks.last.as_deref(), |r| {
                let valid = storage::read_bool(r)?;
                let mut actions = Vec::with_capacity(categories);
                for c in 0..categories {
                    let a = storage::read_u32_le(r)? as usize;
                    if valid && !layout.range(c).contains(&a) {
                        return Err(storage::invalid("credit trace action out of range"));
                    }
                    actions.push(a);
                }
                Ok((valid, actions, read_wave(r, n)?))
            })?;

        let mut smear = TemporalSmear::new(n, &cfg);
        smear.trace_mut().copy_from(&trace);

        Ok(Singularity {
            cfg,
            state_size: n,
            smear,
            wave,
            field,
            rules,
            projector,
            affect,
            prng,
            tick,
            temperature,
            frustration,
            adrenaline,
            exploration_beta,
            has_selection,
            last_actions,
            last_state,
        })
    }
}

#[derive(Default)]
struct Chunks {
    config: Option<Vec<u8>>,
    prng: Option<Vec<u8>>,
    clock: Option<Vec<u8>>,
    wave: Option<Vec<u8>>,
    smear: Option<Vec<u8>>,
    field: Option<Vec<u8>>,
    rules: Option<Vec<u8>>,
    projector: Option<Vec<u8>>,
    meta: Option<Vec<u8>>,
    affect: Option<Vec<u8>>,
    last: Option<Vec<u8>>,
}

/// Encode one chunk through the shared scratch buffer.
fn put<W: Write>(
    w: &mut W,
    buf: &mut Vec<u8>,
    tag: [u8; 4],
    fill: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
) -> io::Result<()> {
    buf.clear();
    fill(buf)?;
    storage::write_chunk_lz4(w, tag, buf)
}

/// Decode one chunk payload, requiring it to be present and fully consumed.
fn parse<'a, T>(
    tag: [u8; 4],
    payload: Option<&'a [u8]>,
    read: impl FnOnce(&mut io::Cursor<&'a [u8]>) -> io::Result<T>,
) -> SingularityResult<T> {
    let payload = payload.ok_or_else(|| malformed(&format!("missing chunk {}", tag_name(&tag))))?;
    let mut r = io::Cursor::new(payload);
    let value = read(&mut r).map_err(|e| malformed(&format!("chunk {}: {e}", tag_name(&tag))))?;
    if r.position() != payload.len() as u64 {
        return Err(malformed(&format!("trailing bytes in chunk {}", tag_name(&tag))));
    }
    Ok(value)
}

fn read_shape<R: Read>(r: &mut R) -> io::Result<Shape> {
    let state_size = storage::read_len(r, SingularityConfig::MAX_STATE_SIZE)?;
    let n_categories = storage::read_len(r, MAX_CATEGORIES)?;
    let mut category_sizes = Vec::with_capacity(n_categories);
    for _ in 0..n_categories {
        category_sizes.push(storage::read_u32_le(r)? as usize);
    }
    let mut cfg = SingularityConfig {
        attractor_capacity: storage::read_u32_le(r)? as usize,
        coupling_capacity: storage::read_u32_le(r)? as usize,
        max_rules: storage::read_u32_le(r)? as usize,
        inferred_rule_capacity: storage::read_u32_le(r)? as usize,
        coupling_window: storage::read_u32_le(r)?,
        ..SingularityConfig::default()
    };
    let seeded = storage::read_bool(r)?;
    let seed = storage::read_u64_le(r)?;
    cfg.seed = seeded.then_some(seed);
    read_f32_tunables(r, &mut cfg)?;
    cfg.validate().map_err(storage::invalid)?;
    validate_shape(state_size, &category_sizes, &cfg)
        .map_err(|_| storage::invalid("invalid shape"))?;

    Ok(Shape {
        state_size,
        category_sizes,
        cfg,
    })
}

fn write_wave<W: Write>(w: &mut W, wave: &WaveState) -> io::Result<()> {
    storage::write_f32_slice(w, wave.re())?;
    storage::write_f32_slice(w, wave.im())
}

fn read_wave<R: Read>(r: &mut R, n: usize) -> io::Result<WaveState> {
    let re = storage::read_f32_vec(r, n)?;
    let im = storage::read_f32_vec(r, n)?;
    if !re.iter().chain(&im).all(|v| v.is_finite()) {
        return Err(storage::invalid("non-finite state value"));
    }
    Ok(WaveState::from_parts(re, im))
}

fn tag_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

fn malformed(msg: &str) -> SingularityError {
    SingularityError::MalformedSnapshot(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained() -> Singularity {
        let cfg = SingularityConfig::default().with_seed(11);
        let mut e = Singularity::with_config(32, &[4, 2], cfg).unwrap();
        e.register_rules(&[1, 2], &[3, 5], &[0.4, 0.9]).unwrap();
        e.set_active_conditions(&[2]);
        for i in 0..30 {
            let obs = [(i % 5) as f32 * 0.1, 0.2, -0.1];
            e.select_actions(&obs).unwrap();
            e.learn(if i % 3 == 0 { 1.0 } else { -0.2 }).unwrap();
            e.decay_tick();
        }
        e.observe(&[1, 0], &[4]).unwrap();
        e
    }

    #[test]
    fn roundtrip_reproduces_future_decisions() {
        let mut a = trained();
        let bytes = a.save().unwrap();
        let mut b = Singularity::new(32, &[4, 2]).unwrap();
        b.load(&bytes).unwrap();

        assert_eq!(b.save().unwrap(), bytes);
        for i in 0..40 {
            let obs = [0.05 * i as f32, -0.3, 0.2];
            assert_eq!(a.select_actions(&obs).unwrap(), b.select_actions(&obs).unwrap());
            let r = if i % 2 == 0 { 0.7 } else { -0.4 };
            a.learn(r).unwrap();
            b.learn(r).unwrap();
            assert_eq!(a.temperature().to_bits(), b.temperature().to_bits());
        }
    }

    #[test]
    fn size_matches_saved_bytes() {
        let e = trained();
        assert_eq!(e.snapshot_size_bytes().unwrap(), e.save().unwrap().len());
    }

    #[test]
    fn shape_mismatch_is_incompatible_and_atomic() {
        let bytes = trained().save().unwrap();
        for (n, cats) in [(64, vec![4, 2]), (32, vec![4, 3]), (32, vec![4])] {
            let mut other = Singularity::new(n, &cats).unwrap();
            let before = other.save().unwrap();
            assert!(matches!(
                other.load(&bytes),
                Err(SingularityError::IncompatibleConfiguration(_))
            ));
            assert_eq!(other.save().unwrap(), before);
        }
    }

    #[test]
    fn truncated_or_corrupt_images_are_malformed() {
        let bytes = trained().save().unwrap();
        let mut target = Singularity::new(32, &[4, 2]).unwrap();
        let before = target.save().unwrap();

        for cut in [0, 5, 12, 40, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(
                    target.load(&bytes[..cut]),
                    Err(SingularityError::MalformedSnapshot(_))
                ),
                "cut at {cut}"
            );
        }
        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            target.load(&bad_magic),
            Err(SingularityError::MalformedSnapshot(_))
        ));
        assert_eq!(target.save().unwrap(), before);
    }

    #[test]
    fn bytes_after_the_last_chunk_are_malformed() {
        let bytes = trained().save().unwrap();
        let mut target = Singularity::new(32, &[4, 2]).unwrap();
        let before = target.save().unwrap();
        for extra in 1..8 {
            let mut padded = bytes.clone();
            padded.extend(std::iter::repeat(0u8).take(extra));
            assert!(
                matches!(
                    target.load(&padded),
                    Err(SingularityError::MalformedSnapshot(_))
                ),
                "{extra} trailing bytes"
            );
        }
        assert_eq!(target.save().unwrap(), before);
    }

    #[test]
    fn oversized_field_in_image_is_malformed() {
        let mut source = Singularity::new(8192, &[1]).unwrap();
        source.cfg.attractor_capacity = 65535;
        let bytes = source.save().unwrap();

        let mut target = Singularity::new(8192, &[1]).unwrap();
        let before = target.save().unwrap();
        assert!(matches!(
            target.load(&bytes),
            Err(SingularityError::MalformedSnapshot(_))
        ));
        assert_eq!(target.save().unwrap(), before);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = trained().save().unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        let mut target = Singularity::new(32, &[4, 2]).unwrap();
        assert!(matches!(
            target.load(&bytes),
            Err(SingularityError::UnsupportedVersion {
                found: 99,
                expected: 1
            })
        ));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut bytes = trained().save().unwrap();
        storage::write_chunk_lz4(&mut bytes, *b"XTRA", b"future data").unwrap();
        let mut target = Singularity::new(32, &[4, 2]).unwrap();
        target.load(&bytes).unwrap();
    }

    #[test]
    fn file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "singularity-snapshot-{}.dsng",
            std::process::id()
        ));
        let a = trained();
        a.save_to_file(&path).unwrap();
        let mut b = Singularity::new(32, &[4, 2]).unwrap();
        b.load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(a.save().unwrap(), b.save().unwrap());
    }
}
