use crate::matrix_store::MatrixStore;
use crate::score::{Evaluation, PatternState, ScoreModel};
use log::trace;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::cmp::Ordering;

/// A single-element change to a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Move {
    AddGene(usize),
    AddPatient(usize),
    RemoveGene(usize),
    RemovePatient(usize),
}

impl Move {
    /// Rank used to break exact ties: kind first, then lowest index.
    fn tie_rank(&self) -> (u8, usize) {
        match *self {
            Move::AddGene(g) => (0, g),
            Move::AddPatient(p) => (1, p),
            Move::RemoveGene(g) => (2, g),
            Move::RemovePatient(p) => (3, p),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Move::AddGene(_) => "add_gene",
            Move::AddPatient(_) => "add_patient",
            Move::RemoveGene(_) => "remove_gene",
            Move::RemovePatient(_) => "remove_patient",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredMove {
    pub mv: Move,
    pub evaluation: Evaluation,
}

/// `Greater` means `a` is the better move. Total over distinct moves, so the
/// winner does not depend on how candidates were split across workers.
fn compare(a: &ScoredMove, b: &ScoredMove) -> Ordering {
    a.evaluation
        .progress_cmp(&b.evaluation)
        .then_with(|| b.mv.tie_rank().cmp(&a.mv.tie_rank()))
}

fn better(a: ScoredMove, b: ScoredMove) -> ScoredMove {
    if compare(&a, &b) == Ordering::Less {
        b
    } else {
        a
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SearchOutcome {
    Improve(ScoredMove),
    NoImprovingMove,
}

/// Genes and patients later patterns may still draw on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidatePool {
    pub genes: Vec<usize>,
    pub patients: Vec<usize>,
}

/// Fork-join search for the best single-element move.
pub struct CandidateSearch<'a> {
    store: &'a MatrixStore,
    model: &'a ScoreModel,
    workers: &'a ThreadPool,
}

impl<'a> CandidateSearch<'a> {
    pub fn new(store: &'a MatrixStore, model: &'a ScoreModel, workers: &'a ThreadPool) -> Self {
        Self {
            store,
            model,
            workers,
        }
    }

    /// Best improving move for `state`, drawing additions from `pool`.
    ///
    /// Additions are tried first; removals of current members only when no
    /// addition improves. While `state` misses a floor, a move improves if it
    /// shrinks the shortfall, so noisy seeds can be trimmed into shape.
    pub fn best_move(&self, state: &PatternState, pool: &CandidatePool) -> SearchOutcome {
        let current = self.model.evaluate_state(state);

        let additions: Vec<Move> = pool
            .genes
            .iter()
            .filter(|&&g| !state.contains_gene(g))
            .map(|&g| Move::AddGene(g))
            .chain(
                pool.patients
                    .iter()
                    .filter(|&&p| !state.contains_patient(p))
                    .map(|&p| Move::AddPatient(p)),
            )
            .collect();
        if let Some(best) = self.best_of(state, &additions) {
            if best.evaluation.improves_on(&current) {
                return SearchOutcome::Improve(best);
            }
        }

        let removals: Vec<Move> = state
            .genes()
            .iter()
            .map(|&g| Move::RemoveGene(g))
            .chain(state.patients().iter().map(|&p| Move::RemovePatient(p)))
            .collect();
        match self.best_of(state, &removals) {
            Some(best) if best.evaluation.improves_on(&current) => SearchOutcome::Improve(best),
            _ => SearchOutcome::NoImprovingMove,
        }
    }

    /// Scores every move, one contiguous slice per worker, and reduces the
    /// local winners.
    fn best_of(&self, state: &PatternState, moves: &[Move]) -> Option<ScoredMove> {
        if moves.is_empty() {
            return None;
        }
        let n_workers = self.workers.current_num_threads().max(1);
        let chunk_size = moves.len().div_ceil(n_workers);
        let best = self.workers.install(|| {
            moves
                .par_chunks(chunk_size)
                .filter_map(|slice| {
                    slice
                        .iter()
                        .map(|&mv| ScoredMove {
                            mv,
                            evaluation: self.model.evaluate_move(self.store, state, mv),
                        })
                        .reduce(better)
                })
                .reduce_with(better)
        });
        if let Some(ref b) = best {
            trace!(
                "Best of {} candidates: {:?} score={:.4} cells={}",
                moves.len(),
                b.mv,
                b.evaluation.score,
                b.evaluation.cells
            );
        }
        best
    }
}
