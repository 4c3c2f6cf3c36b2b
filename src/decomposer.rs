use crate::config::DecompositionConfig;
use crate::matrix_store::MatrixStore;
use crate::score::{Evaluation, PatternState, ScoreModel};
use crate::search::{CandidatePool, CandidateSearch, Move, SearchOutcome};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use std::fmt;
use std::time::Instant;

/// Lifecycle of one pattern slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternPhase {
    Seeding,
    Growing,
    Stabilized,
    Accepted,
    Rejected,
}

/// Why the growth loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    NoImprovingMove,
    IterationCap,
    TimeBudget,
    /// The slot never grew: no seed, or the restart's budget was already gone.
    NotStarted,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopCause::NoImprovingMove => "no_improving_move",
            StopCause::IterationCap => "iteration_cap",
            StopCause::TimeBudget => "time_budget",
            StopCause::NotStarted => "not_started",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    /// Every patient was already explained.
    NoSeedPatients,
    /// No gene could ever satisfy the floors.
    EmptySignature,
    BelowThresholds,
    /// The restart's time budget ran out before this slot was reached.
    BudgetExhausted,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionReason::NoSeedPatients => "no_seed_patients",
            RejectionReason::EmptySignature => "empty_signature",
            RejectionReason::BelowThresholds => "below_thresholds",
            RejectionReason::BudgetExhausted => "budget_exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternStatus {
    Accepted,
    Rejected(RejectionReason),
}

impl PatternStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PatternStatus::Accepted)
    }
}

/// One applied move of the growth loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceStep {
    pub iteration: usize,
    pub mv: Move,
    pub evaluation: Evaluation,
}

/// Finalized outcome of one pattern slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    /// 1-based slot number.
    pub slot: usize,
    pub patients: Vec<usize>,
    pub genes: Vec<usize>,
    pub evaluation: Evaluation,
    pub status: PatternStatus,
    pub stop_cause: StopCause,
    pub iterations: usize,
    /// Applied moves, recorded only when intermediate logging is on.
    pub trace: Vec<TraceStep>,
}

impl Pattern {
    /// Placeholder for a slot that was never attempted.
    pub fn unattempted(slot: usize, model: &ScoreModel, reason: RejectionReason) -> Self {
        Self {
            slot,
            patients: Vec::new(),
            genes: Vec::new(),
            evaluation: model.from_counts(0, 0, None, None, 0),
            status: PatternStatus::Rejected(reason),
            stop_cause: StopCause::NotStarted,
            iterations: 0,
            trace: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status.is_accepted()
    }
}

/// Which (patient, gene) cells earlier accepted patterns already explain.
///
/// Explanation is tracked per cell. A patient that joined an accepted pattern
/// is no longer a candidate, while a gene stays available to later patterns
/// for as long as it has unexplained cells among the remaining patients.
#[derive(Clone, Debug)]
pub struct Residual {
    explained: Array2<bool>,
    patient_explained: Vec<bool>,
}

impl Residual {
    pub fn new(n_patients: usize, n_genes: usize) -> Self {
        Self {
            explained: Array2::from_elem((n_patients, n_genes), false),
            patient_explained: vec![false; n_patients],
        }
    }

    /// Marks every cell of the pattern as explained.
    pub fn mark(&mut self, patients: &[usize], genes: &[usize]) {
        for &p in patients {
            for &g in genes {
                self.explained[[p, g]] = true;
            }
        }
        if !genes.is_empty() {
            for &p in patients {
                self.patient_explained[p] = true;
            }
        }
    }

    pub fn is_cell_explained(&self, patient: usize, gene: usize) -> bool {
        self.explained[[patient, gene]]
    }

    pub fn is_patient_explained(&self, patient: usize) -> bool {
        self.patient_explained[patient]
    }

    /// Cells of `patients` x `genes` that are already explained.
    pub fn overlap(&self, patients: &[usize], genes: &[usize]) -> usize {
        patients
            .iter()
            .map(|&p| genes.iter().filter(|&&g| self.is_cell_explained(p, g)).count())
            .sum()
    }

    pub fn explained_cells(&self) -> usize {
        self.explained.iter().filter(|&&e| e).count()
    }

    /// Genes and patients that later patterns may still use.
    pub fn candidate_pool(&self) -> CandidatePool {
        let patients: Vec<usize> = self
            .patient_explained
            .iter()
            .enumerate()
            .filter(|(_, &e)| !e)
            .map(|(p, _)| p)
            .collect();
        let genes = (0..self.explained.ncols())
            .filter(|&g| patients.iter().any(|&p| !self.is_cell_explained(p, g)))
            .collect();
        CandidatePool { genes, patients }
    }
}

/// Greedy growth of one pattern at a time over a private residual.
///
/// Only this type mutates the residual, and only on the calling thread;
/// workers see it through an immutable `CandidatePool`.
pub struct GreedyDecomposer<'a> {
    store: &'a MatrixStore,
    model: &'a ScoreModel,
    search: CandidateSearch<'a>,
    config: &'a DecompositionConfig,
    seeds: ArrayView2<'a, f64>,
    residual: Residual,
    iteration_cap: usize,
}

impl<'a> GreedyDecomposer<'a> {
    pub fn new(
        store: &'a MatrixStore,
        model: &'a ScoreModel,
        search: CandidateSearch<'a>,
        config: &'a DecompositionConfig,
        seeds: ArrayView2<'a, f64>,
    ) -> Self {
        Self {
            store,
            model,
            search,
            config,
            seeds,
            residual: Residual::new(store.n_patients(), store.n_genes()),
            iteration_cap: config.iteration_cap(store.n_patients(), store.n_genes()),
        }
    }

    pub fn residual(&self) -> &Residual {
        &self.residual
    }

    /// Seed patients for a 0-based slot.
    ///
    /// Patients whose strongest factor column is this slot, else any patient
    /// with positive weight in it, else (factor exhausted) every unexplained
    /// patient.
    fn seed_patients(&self, slot_index: usize) -> Vec<usize> {
        let eligible: Vec<usize> = (0..self.store.n_patients())
            .filter(|&p| !self.residual.is_patient_explained(p))
            .collect();
        if slot_index < self.seeds.ncols() {
            let column = self.seeds.column(slot_index);
            let top: Vec<usize> = eligible
                .iter()
                .copied()
                .filter(|&p| column[p] > 0.0 && argmax(self.seeds.row(p)) == Some(slot_index))
                .collect();
            if !top.is_empty() {
                debug!(
                    "Slot {}: seeding from {} patients whose strongest factor weight is this slot.",
                    slot_index + 1,
                    top.len()
                );
                return top;
            }
            let positive: Vec<usize> = eligible.iter().copied().filter(|&p| column[p] > 0.0).collect();
            if !positive.is_empty() {
                debug!(
                    "Slot {}: seeding from {} patients with positive factor weight.",
                    slot_index + 1,
                    positive.len()
                );
                return positive;
            }
        }
        debug!(
            "Slot {}: initial factor exhausted, seeding from {} unexplained patients.",
            slot_index + 1,
            eligible.len()
        );
        eligible
    }

    /// Runs one slot through Seeding -> Growing -> Stabilized -> Accepted |
    /// Rejected. Accepted patterns are marked in the residual.
    pub fn extract(&mut self, slot: usize, deadline: Option<Instant>) -> Pattern {
        let mut phase = PatternPhase::Seeding;
        debug!("Slot {}: {:?}", slot, phase);
        let seed = self.seed_patients(slot - 1);
        if seed.is_empty() {
            info!("Slot {}: no unexplained patients left to seed from.", slot);
            return Pattern::unattempted(slot, self.model, RejectionReason::NoSeedPatients);
        }

        let mut state = PatternState::seeded(self.store, &seed);
        let pool = self.residual.candidate_pool();
        let mut trace = Vec::new();
        let mut iterations = 0usize;
        let mut current = self.model.evaluate_state(&state);
        phase = PatternPhase::Growing;
        debug!("Slot {}: {:?} from {} seed patients", slot, phase, seed.len());

        let stop_cause = loop {
            if iterations >= self.iteration_cap {
                break StopCause::IterationCap;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break StopCause::TimeBudget;
            }
            match self.search.best_move(&state, &pool) {
                SearchOutcome::NoImprovingMove => break StopCause::NoImprovingMove,
                SearchOutcome::Improve(best) => {
                    debug_assert!(best.evaluation.score >= current.score);
                    state.apply(self.store, best.mv);
                    iterations += 1;
                    current = best.evaluation;
                    debug!(
                        "Slot {} iteration {}: {:?} -> score={:.4} dif={:.3} exp={:.3} support={} size={}x{}",
                        slot,
                        iterations,
                        best.mv,
                        current.score,
                        current.diffusion_consistency,
                        current.expression_consistency,
                        current.mutation_support,
                        state.patients().len(),
                        state.genes().len()
                    );
                    if self.config.log_intermediate {
                        trace.push(TraceStep {
                            iteration: iterations,
                            mv: best.mv,
                            evaluation: current,
                        });
                    }
                }
            }
        };
        phase = PatternPhase::Stabilized;
        debug!("Slot {}: {:?} after {} moves ({})", slot, phase, iterations, stop_cause);
        if stop_cause == StopCause::IterationCap {
            warn!(
                "Slot {}: iteration cap of {} reached; keeping the current pattern.",
                slot, self.iteration_cap
            );
        }

        let evaluation = self
            .model
            .evaluate_members(self.store, state.patients(), state.genes());
        if self.config.debug && evaluation != current {
            warn!(
                "Slot {}: incremental evaluation {:?} disagrees with full recomputation {:?}",
                slot, current, evaluation
            );
        }

        let status = if evaluation.is_valid() {
            PatternStatus::Accepted
        } else if state.genes().is_empty() {
            PatternStatus::Rejected(RejectionReason::EmptySignature)
        } else {
            PatternStatus::Rejected(RejectionReason::BelowThresholds)
        };
        phase = if status.is_accepted() {
            let overlap = self.residual.overlap(state.patients(), state.genes());
            if overlap > 0 {
                warn!(
                    "Slot {}: {} cells were already explained by an earlier pattern.",
                    slot, overlap
                );
            }
            self.residual.mark(state.patients(), state.genes());
            PatternPhase::Accepted
        } else {
            PatternPhase::Rejected
        };
        info!(
            "Slot {}: {:?} with {} patients x {} genes (dif={:.3}, exp={:.3}, support={}, {} moves)",
            slot,
            phase,
            state.patients().len(),
            state.genes().len(),
            evaluation.diffusion_consistency,
            evaluation.expression_consistency,
            evaluation.mutation_support,
            iterations
        );

        Pattern {
            slot,
            patients: state.patients().to_vec(),
            genes: state.genes().to_vec(),
            evaluation,
            status,
            stop_cause,
            iterations,
            trace,
        }
    }
}

/// Column of the largest entry, ties to the lowest column.
fn argmax(row: ndarray::ArrayView1<'_, f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (j, &w) in row.iter().enumerate() {
        match best {
            Some((_, b)) if w <= b => {}
            _ => best = Some((j, w)),
        }
    }
    best.map(|(j, _)| j)
}
