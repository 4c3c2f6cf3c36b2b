//! Cancer subtype discovery by greedy, parallel rank matrix factorisation.
//!
//! Three patient x gene matrices (network-diffusion ranks, expression ranks and
//! binary somatic mutations) are decomposed into k patterns, each pairing a
//! set of patients with a supporting gene signature.

pub mod config;
pub mod decomposer;
pub mod error;
pub mod matrix_store;
pub mod output;
pub mod runner;
pub mod score;
pub mod search;

pub use config::{DecompositionConfig, InputPaths};
pub use decomposer::{Pattern, PatternStatus, RejectionReason, StopCause};
pub use error::{Result, SubtypeError};
pub use matrix_store::{MatrixStore, RankCutoffs};
pub use runner::{Decomposition, DecompositionRunner};
