//! # singularity
//!
//! A fixed-memory decision engine for many concurrent agents.
//!
//! Each engine keeps a complex-valued state vector. Observations are smeared
//! into it over time, bent by reward-shaped attractors in field memory, and
//! projected onto per-category action scores. Hamiltonian rules add hard
//! biases for known conditions; a small affect circuit and a thermal
//! temperature regulate how greedy the choice is.
//!
//! ## Quick Start
//!
//! ```
//! use singularity::prelude::*;
//!
//! let cfg = SingularityConfig::default().with_seed(42);
//! let mut engine = Singularity::with_config(128, &[5, 3], cfg).unwrap();
//!
//! engine.register_rule(7, 2, 0.6).unwrap();
//! engine.set_active_conditions(&[7]);
//!
//! let actions = engine.select_actions(&[0.3, -0.2, 0.9]).unwrap();
//! engine.learn(1.0).unwrap();
//!
//! let bytes = engine.save().unwrap();
//! let mut restored = Singularity::new(128, &[5, 3]).unwrap();
//! restored.load(&bytes).unwrap();
//! # assert_eq!(actions.len(), 2);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization for configs and observer reports
//! - `parallel`: score projection across threads via rayon
//! - `simd`: SIMD dot products via the `wide` crate
//! - `cli`: the `singularity-cli` driver binary
//!
//! ## Modules
//!
//! - [`engine`]: the engine and its per-tick pipeline
//! - [`wave`]: state vectors and temporal smearing
//! - [`field`]: attractors, couplings and the event horizon
//! - [`rules`]: Hamiltonian rule table
//! - [`projector`]: action scores and selection
//! - [`affect`]: the four-node affect circuit
//! - [`observer`]: read-only reports

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/wave.rs"]
pub mod wave;

#[path = "core/field.rs"]
pub mod field;

#[path = "core/rules.rs"]
pub mod rules;

#[path = "core/projector.rs"]
pub mod projector;

#[path = "core/affect.rs"]
pub mod affect;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/learning.rs"]
mod learning;

#[path = "core/snapshot.rs"]
mod snapshot;

pub mod observer;

pub use config::SingularityConfig;
pub use engine::{EngineStatus, Singularity};
pub use error::{SingularityError, SingularityResult};
pub use projector::{ExecutionTier, ThermalPhase};

pub mod prelude {
    pub use crate::config::SingularityConfig;
    pub use crate::engine::{EngineStatus, Singularity};
    pub use crate::error::{SingularityError, SingularityResult};
    pub use crate::field::AttractorId;
    pub use crate::observer::{EngineAdapter, EngineReport};
    pub use crate::projector::{ExecutionTier, ThermalPhase};
    pub use crate::rules::HamiltonianRule;
    pub use crate::wave::WaveState;
}
