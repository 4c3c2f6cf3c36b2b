use crate::config::DecompositionConfig;
use crate::decomposer::{GreedyDecomposer, Pattern, RejectionReason, StopCause};
use crate::error::{Result, SubtypeError};
use crate::matrix_store::MatrixStore;
use crate::output::RestartWriter;
use crate::score::{ScoreModel, Thresholds};
use crate::search::CandidateSearch;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::ThreadPool;
use std::time::Instant;

/// The k pattern slots produced by one restart, in slot order.
#[derive(Clone, Debug, PartialEq)]
pub struct Decomposition {
    /// 1-based restart number.
    pub restart: usize,
    pub patterns: Vec<Pattern>,
}

impl Decomposition {
    pub fn accepted(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter().filter(|p| p.is_accepted())
    }
}

/// Runs k sequential pattern extractions per restart on a shared worker pool
/// and persists each slot as soon as it is finalized.
pub struct DecompositionRunner {
    store: MatrixStore,
    config: DecompositionConfig,
    model: ScoreModel,
    workers: ThreadPool,
}

impl DecompositionRunner {
    pub fn new(store: MatrixStore, config: DecompositionConfig) -> Result<Self> {
        config.validate()?;
        let cutoffs = store.cutoffs();
        if cutoffs.max_dif_rank != config.max_dif_rank || cutoffs.max_exp_rank != config.max_exp_rank {
            return Err(SubtypeError::Configuration(format!(
                "store was built with rank cutoffs {:?} but the configuration asks for maxDifRank={} maxExpRank={}",
                cutoffs, config.max_dif_rank, config.max_exp_rank
            )));
        }
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("rmf-worker-{}", i))
            .build()?;
        info!(
            "Decomposition runner: k={}, dtheta={}, etheta={}, beta={}, nReqMutations={}, {} worker threads.",
            config.k, config.dtheta, config.etheta, config.beta, config.n_req_mutations, config.threads
        );
        let model = ScoreModel::new(
            config.beta,
            Thresholds {
                dtheta: config.dtheta,
                etheta: config.etheta,
                n_req_mutations: config.n_req_mutations,
            },
        );
        Ok(Self {
            store,
            config,
            model,
            workers,
        })
    }

    pub fn store(&self) -> &MatrixStore {
        &self.store
    }

    pub fn config(&self) -> &DecompositionConfig {
        &self.config
    }

    /// Runs the configured number of restarts.
    ///
    /// If a restart exhausts its time budget, the `ResourceExhaustion` error
    /// replaces the whole result: decompositions of the earlier restarts are
    /// not returned, only their files under `working_dir` remain.
    pub fn run(&self) -> Result<Vec<Decomposition>> {
        self.repeat_decomposition(self.config.restart_count)
    }

    /// Runs `n` independent restarts, each from a fresh residual. Stops at
    /// the first failing restart; see [`DecompositionRunner::run`].
    pub fn repeat_decomposition(&self, n: usize) -> Result<Vec<Decomposition>> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(n);
        for restart in 1..=n {
            info!("Starting restart {} of {}", restart, n);
            results.push(self.decompose(restart)?);
        }
        info!("{} restart(s) finished in {:.2?}.", n, started.elapsed());
        Ok(results)
    }

    /// Factor weights used to seed a restart.
    fn seeds_for_restart(&self, restart: usize) -> Result<Array2<f64>> {
        let mut seeds = self.store.initial_factor().to_owned();
        if restart > 1 && self.config.restart_jitter > 0.0 {
            let noise = Normal::new(0.0, self.config.restart_jitter).map_err(|e| {
                SubtypeError::Configuration(format!("invalid restart jitter: {}", e))
            })?;
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(restart as u64));
            seeds.mapv_inplace(|w| w + noise.sample(&mut rng));
            info!(
                "Restart {}: perturbed initial factor with N(0, {}) noise.",
                restart, self.config.restart_jitter
            );
        }
        Ok(seeds)
    }

    /// One full k-slot decomposition.
    ///
    /// Every slot gets a recorded outcome. If the time budget runs out, the
    /// remaining slots are recorded as rejected, everything is persisted, and
    /// `ResourceExhaustion` is returned.
    pub fn decompose(&self, restart: usize) -> Result<Decomposition> {
        let k = self.config.k;
        let seeds = self.seeds_for_restart(restart)?;
        let mut writer = RestartWriter::create(&self.config.working_dir, restart)?;
        let search = CandidateSearch::new(&self.store, &self.model, &self.workers);
        let mut decomposer =
            GreedyDecomposer::new(&self.store, &self.model, search, &self.config, seeds.view());
        let deadline = self.config.time_budget.map(|b| Instant::now() + b);

        let progress = if self.config.show_progress {
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} patterns {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");
            ProgressBar::new(k as u64).with_style(style)
        } else {
            ProgressBar::hidden()
        };

        let mut patterns = Vec::with_capacity(k);
        let mut exhausted_after: Option<usize> = None;
        for slot in 1..=k {
            let pattern = if exhausted_after.is_some() {
                Pattern::unattempted(slot, &self.model, RejectionReason::BudgetExhausted)
            } else {
                let pattern = decomposer.extract(slot, deadline);
                if pattern.stop_cause == StopCause::TimeBudget {
                    warn!("Restart {}: time budget exhausted during pattern {}.", restart, slot);
                    exhausted_after = Some(slot);
                }
                pattern
            };
            writer.write_pattern(&self.store, &pattern)?;
            progress.set_message(if pattern.is_accepted() { "accepted" } else { "rejected" });
            progress.inc(1);
            patterns.push(pattern);
        }
        progress.finish_with_message("done");

        writer.write_factor_matrices(&self.store, &patterns)?;
        #[cfg(feature = "json-summary")]
        writer.write_json_summary(&self.store, &patterns)?;

        let n_accepted = patterns.iter().filter(|p| p.is_accepted()).count();
        info!(
            "Restart {}: {} of {} patterns accepted, {} cells explained.",
            restart,
            n_accepted,
            k,
            decomposer.residual().explained_cells()
        );

        if let Some(slot) = exhausted_after {
            return Err(SubtypeError::ResourceExhaustion {
                restart,
                completed_slots: slot,
                total_slots: k,
                reason: format!(
                    "time budget of {:.2?} exceeded; partial results written to {}",
                    self.config.time_budget.unwrap_or_default(),
                    writer.dir().display()
                ),
            });
        }
        Ok(Decomposition { restart, patterns })
    }
}
