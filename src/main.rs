// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use log::{error, info};
use rmf_subtyping::{DecompositionConfig, DecompositionRunner, InputPaths, MatrixStore, RankCutoffs};
use std::{
    fs,
    time::{Duration, Instant},
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    let log_level = if cli_args.debug && log_level < log::LevelFilter::Debug {
        log::LevelFilter::Debug
    } else {
        log_level
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    // --- 1. Resolve configuration ---
    let config = cli_args.to_config();
    info!("Working directory = {}", config.working_dir.display());
    info!("Ranked diffusion file = {:?}", cli_args.dif_rank_file);
    info!("Ranked expression file = {:?}", cli_args.exp_rank_file);
    info!("Mutation file = {:?}", cli_args.mutation_file);
    info!("Initialised matrix F file = {:?}", cli_args.init_f_file);
    info!("dtheta = {}", config.dtheta);
    info!("etheta = {}", config.etheta);
    info!("beta = {}", config.beta);
    info!("Number of required mutations = {}", config.n_req_mutations);
    info!("maxDifRank = {}", config.max_dif_rank);
    info!("maxExpRank = {}", config.max_exp_rank);
    info!("Number of patterns = {}", config.k);
    info!("Restarts = {}", config.restart_count);
    info!("Worker threads = {}", config.threads);
    info!("Logging = {}", config.log_intermediate);
    info!("Debug = {}", config.debug);

    config.validate()?;
    let inputs = InputPaths::from_options(
        cli_args.dif_rank_file.clone(),
        cli_args.exp_rank_file.clone(),
        cli_args.mutation_file.clone(),
        cli_args.init_f_file.clone(),
    )
    .inspect_err(|e| error!("{}. Stop.", e))?;

    // --- 2. Record the command line ---
    fs::create_dir_all(&config.working_dir).map_err(|e| {
        anyhow!(
            "Failed to create working directory {}: {}",
            config.working_dir.display(),
            e
        )
    })?;
    let cmdline_path = config.working_dir.join("cmdline.txt");
    let cmdline: Vec<String> = std::env::args().skip(1).collect();
    fs::write(&cmdline_path, cmdline.join(" "))
        .map_err(|e| anyhow!("Failed to write {}: {}", cmdline_path.display(), e))?;

    // --- 3. Load matrices ---
    let store = MatrixStore::load(
        &inputs,
        RankCutoffs {
            max_dif_rank: config.max_dif_rank,
            max_exp_rank: config.max_exp_rank,
        },
    )?;

    // --- 4. Decompose ---
    let runner = DecompositionRunner::new(store, config)?;
    let decompositions = runner.run()?;
    for decomposition in &decompositions {
        info!(
            "Restart {}: {} of {} patterns accepted.",
            decomposition.restart,
            decomposition.accepted().count(),
            decomposition.patterns.len()
        );
    }

    info!(
        "rmf_subtyping finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use super::{DecompositionConfig, Duration};
    use clap::Parser;
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Subtyping using rank matrix factorisation - parallel version", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Ranked diffusion file
        #[arg(long = "df")]
        pub(crate) dif_rank_file: Option<PathBuf>,

        /// Ranked expression file
        #[arg(long = "ef")]
        pub(crate) exp_rank_file: Option<PathBuf>,

        /// Mutation file
        #[arg(long = "mf")]
        pub(crate) mutation_file: Option<PathBuf>,

        /// Initialised matrix F
        #[arg(long = "if")]
        pub(crate) init_f_file: Option<PathBuf>,

        /// Working directory
        #[arg(long = "dir", default_value = "./")]
        pub(crate) working_dir: PathBuf,

        /// Number of pattern sets
        #[arg(short = 'k', default_value_t = 5)]
        pub(crate) k: usize,

        /// Theta threshold for diffusion
        #[arg(long, default_value_t = 0.86)]
        pub(crate) dtheta: f64,

        /// Theta threshold for expression
        #[arg(long, default_value_t = 0.65)]
        pub(crate) etheta: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) beta: f64,

        /// The required number of mutations
        #[arg(long = "n-req-mut", default_value_t = 2)]
        pub(crate) n_req_mutations: usize,

        /// Maximal ranked diffusion (0 = unbounded)
        #[arg(long = "max-d", default_value_t = 0)]
        pub(crate) max_dif_rank: u32,

        /// Maximal ranked expression (0 = unbounded)
        #[arg(long = "max-e", default_value_t = 0)]
        pub(crate) max_exp_rank: u32,

        /// Log intermediate results into files
        #[arg(long = "log")]
        pub(crate) log_intermediate: bool,

        #[arg(long)]
        pub(crate) debug: bool,

        #[arg(long, default_value_t = 1)]
        pub(crate) restarts: usize,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long)]
        pub(crate) max_iterations: Option<usize>,

        #[arg(long)]
        pub(crate) time_budget_secs: Option<u64>,

        /// Std-dev of Gaussian noise added to F for restarts after the first
        #[arg(long, default_value_t = 0.0)]
        pub(crate) restart_jitter: f64,

        #[arg(long, default_value_t = 0)]
        pub(crate) seed: u64,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn to_config(&self) -> DecompositionConfig {
            DecompositionConfig {
                k: self.k,
                dtheta: self.dtheta,
                etheta: self.etheta,
                beta: self.beta,
                n_req_mutations: self.n_req_mutations,
                max_dif_rank: self.max_dif_rank,
                max_exp_rank: self.max_exp_rank,
                working_dir: self.working_dir.clone(),
                restart_count: self.restarts,
                log_intermediate: self.log_intermediate,
                debug: self.debug,
                threads: self.threads.unwrap_or_else(num_cpus::get),
                max_iterations: self.max_iterations,
                time_budget: self.time_budget_secs.map(Duration::from_secs),
                restart_jitter: self.restart_jitter,
                seed: self.seed,
                show_progress: true,
            }
        }
    }
}
