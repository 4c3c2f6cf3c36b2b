use crate::error::{Result, SubtypeError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved, immutable settings for a decomposition run.
///
/// Everything the engine needs is carried here explicitly; nothing is read
/// from globals.
#[derive(Clone, Debug)]
pub struct DecompositionConfig {
    /// Number of pattern slots per restart.
    pub k: usize,
    /// Minimum diffusion consistency of an accepted pattern, in [0,1].
    pub dtheta: f64,
    /// Minimum expression consistency of an accepted pattern, in [0,1].
    pub etheta: f64,
    /// Weight of diffusion against expression consistency, in [0,1].
    pub beta: f64,
    /// Minimum number of member patients mutated in at least one signature gene.
    pub n_req_mutations: usize,
    /// Largest diffusion rank that still counts as signal. 0 means unbounded.
    pub max_dif_rank: u32,
    /// Largest expression rank that still counts as signal. 0 means unbounded.
    pub max_exp_rank: u32,
    pub working_dir: PathBuf,
    pub restart_count: usize,
    /// Write one trace file per pattern listing every applied move.
    pub log_intermediate: bool,
    /// Cross-check incremental scores against a full recomputation.
    pub debug: bool,
    /// Size of the worker pool used for candidate scoring.
    pub threads: usize,
    /// Per-pattern cap on applied moves. `None` uses 2 * (patients + genes).
    pub max_iterations: Option<usize>,
    /// Wall-clock budget for one restart.
    pub time_budget: Option<Duration>,
    /// Std-dev of Gaussian noise added to the initial factor for restarts after
    /// the first. 0 keeps every restart identical.
    pub restart_jitter: f64,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            k: 5,
            dtheta: 0.86,
            etheta: 0.65,
            beta: 1.0,
            n_req_mutations: 2,
            max_dif_rank: 0,
            max_exp_rank: 0,
            working_dir: PathBuf::from("./"),
            restart_count: 1,
            log_intermediate: false,
            debug: false,
            threads: num_cpus::get(),
            max_iterations: None,
            time_budget: None,
            restart_jitter: 0.0,
            seed: 0,
            show_progress: false,
        }
    }
}

impl DecompositionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(SubtypeError::Configuration(
                "Number of patterns (k) must be > 0.".to_string(),
            ));
        }
        if self.restart_count == 0 {
            return Err(SubtypeError::Configuration(
                "Restart count must be > 0.".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(SubtypeError::Configuration(
                "Worker pool needs at least one thread.".to_string(),
            ));
        }
        for (name, value) in [
            ("dtheta", self.dtheta),
            ("etheta", self.etheta),
            ("beta", self.beta),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(SubtypeError::Configuration(format!(
                    "{} must lie in [0, 1], got {}.",
                    name, value
                )));
            }
        }
        if !self.restart_jitter.is_finite() || self.restart_jitter < 0.0 {
            return Err(SubtypeError::Configuration(format!(
                "Restart jitter must be a finite non-negative std-dev, got {}.",
                self.restart_jitter
            )));
        }
        if self.max_iterations == Some(0) {
            return Err(SubtypeError::Configuration(
                "Iteration cap must be > 0 when given.".to_string(),
            ));
        }
        Ok(())
    }

    /// Iteration cap for a store of the given shape.
    pub fn iteration_cap(&self, n_patients: usize, n_genes: usize) -> usize {
        self.max_iterations
            .unwrap_or_else(|| 2 * (n_patients + n_genes))
            .max(1)
    }
}

/// Locations of the four required input matrices.
#[derive(Clone, Debug)]
pub struct InputPaths {
    pub diffusion: PathBuf,
    pub expression: PathBuf,
    pub mutation: PathBuf,
    pub initial_factor: PathBuf,
}

impl InputPaths {
    /// Resolves optional command-line values into a complete set, reporting the
    /// first missing or non-existent input.
    pub fn from_options(
        diffusion: Option<PathBuf>,
        expression: Option<PathBuf>,
        mutation: Option<PathBuf>,
        initial_factor: Option<PathBuf>,
    ) -> Result<Self> {
        let paths = Self {
            diffusion: require(diffusion, "Diffusion")?,
            expression: require(expression, "Expression")?,
            mutation: require(mutation, "Mutation")?,
            initial_factor: require(initial_factor, "Initialised matrix F")?,
        };
        for (label, path) in paths.labelled() {
            if !path.is_file() {
                return Err(SubtypeError::Configuration(format!(
                    "{} file {} does not exist.",
                    label,
                    path.display()
                )));
            }
        }
        Ok(paths)
    }

    pub fn labelled(&self) -> [(&'static str, &Path); 4] {
        [
            ("Diffusion", self.diffusion.as_path()),
            ("Expression", self.expression.as_path()),
            ("Mutation", self.mutation.as_path()),
            ("Initialised matrix F", self.initial_factor.as_path()),
        ]
    }
}

fn require(path: Option<PathBuf>, label: &str) -> Result<PathBuf> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Err(SubtypeError::Configuration(format!(
            "{} file is not provided.",
            label
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(DecompositionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = DecompositionConfig {
            dtheta: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SubtypeError::Configuration(_))));

        let config = DecompositionConfig {
            k: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SubtypeError::Configuration(_))));

        let config = DecompositionConfig {
            beta: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn iteration_cap_defaults_to_twice_the_shape() {
        let config = DecompositionConfig::default();
        assert_eq!(config.iteration_cap(10, 5), 30);
        let config = DecompositionConfig {
            max_iterations: Some(7),
            ..Default::default()
        };
        assert_eq!(config.iteration_cap(10, 5), 7);
    }

    #[test]
    fn missing_input_is_a_configuration_error() {
        let err = InputPaths::from_options(Some(PathBuf::from("d.tsv")), None, None, None)
            .unwrap_err();
        match err {
            SubtypeError::Configuration(msg) => assert!(msg.contains("Expression")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
