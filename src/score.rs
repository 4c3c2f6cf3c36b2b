//! Pattern scoring.
//!
//! A pattern's diffusion (expression) consistency is the smallest, over its
//! signature genes, fraction of member patients whose rank for that gene lies
//! within the cutoff. Mutation support counts member patients mutated in at
//! least one signature gene. The score is
//! `beta * diffusion + (1 - beta) * expression`, or minus infinity whenever a
//! floor (`dtheta`, `etheta`, `n_req_mutations`) is missed. Invalid patterns
//! still carry a shortfall, the summed distance to the floors, so the growth
//! loop can steer an infeasible seed towards feasibility.

use crate::matrix_store::MatrixStore;
use crate::search::Move;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub dtheta: f64,
    pub etheta: f64,
    pub n_req_mutations: usize,
}

/// Score and components of one pattern or candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    /// `objective` when every floor is met, otherwise `f64::NEG_INFINITY`.
    pub score: f64,
    /// Weighted consistency regardless of the floors.
    pub objective: f64,
    pub diffusion_consistency: f64,
    pub expression_consistency: f64,
    pub mutation_support: usize,
    /// |patients| x |genes|.
    pub cells: usize,
    /// Distance to the floors; zero exactly when the pattern is valid.
    pub shortfall: f64,
}

impl Evaluation {
    pub fn is_valid(&self) -> bool {
        self.score.is_finite()
    }

    /// Progress order used by the growth loop.
    ///
    /// Any valid evaluation beats any invalid one. Valid ones compare on
    /// (score, cells); invalid ones on (smaller shortfall, objective, cells).
    pub fn progress_cmp(&self, other: &Evaluation) -> Ordering {
        match (self.is_valid(), other.is_valid()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => self
                .score
                .total_cmp(&other.score)
                .then(self.cells.cmp(&other.cells)),
            (false, false) => other
                .shortfall
                .total_cmp(&self.shortfall)
                .then(self.objective.total_cmp(&other.objective))
                .then(self.cells.cmp(&other.cells)),
        }
    }

    /// Whether moving from `other` to `self` is progress.
    pub fn improves_on(&self, other: &Evaluation) -> bool {
        self.progress_cmp(other) == Ordering::Greater
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScoreModel {
    beta: f64,
    thresholds: Thresholds,
}

impl ScoreModel {
    pub fn new(beta: f64, thresholds: Thresholds) -> Self {
        Self { beta, thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Evaluation from the aggregate counts of a pattern.
    ///
    /// `dif_min` / `exp_min` are the smallest per-gene hit counts over the
    /// signature (`None` for an empty signature).
    pub fn from_counts(
        &self,
        n_patients: usize,
        n_genes: usize,
        dif_min: Option<usize>,
        exp_min: Option<usize>,
        mutation_support: usize,
    ) -> Evaluation {
        let cells = n_patients * n_genes;
        let (diffusion_consistency, expression_consistency) = match (dif_min, exp_min) {
            (Some(d), Some(e)) if n_patients > 0 && n_genes > 0 => (
                d as f64 / n_patients as f64,
                e as f64 / n_patients as f64,
            ),
            _ => (0.0, 0.0),
        };
        let objective =
            self.beta * diffusion_consistency + (1.0 - self.beta) * expression_consistency;
        let n_req = self.thresholds.n_req_mutations;
        let empty = n_patients == 0 || n_genes == 0;
        let valid = !empty
            && diffusion_consistency >= self.thresholds.dtheta
            && expression_consistency >= self.thresholds.etheta
            && mutation_support >= n_req;
        let shortfall = if valid {
            0.0
        } else {
            let support_gap = if n_req > 0 {
                n_req.saturating_sub(mutation_support) as f64 / n_req as f64
            } else {
                0.0
            };
            let empty_penalty = if empty { 1.0 } else { 0.0 };
            empty_penalty
                + (self.thresholds.dtheta - diffusion_consistency).max(0.0)
                + (self.thresholds.etheta - expression_consistency).max(0.0)
                + support_gap
        };
        Evaluation {
            score: if valid { objective } else { f64::NEG_INFINITY },
            objective,
            diffusion_consistency,
            expression_consistency,
            mutation_support,
            cells,
            shortfall,
        }
    }

    /// Scores an explicit (patients, genes) pair from scratch.
    pub fn evaluate_members(
        &self,
        store: &MatrixStore,
        patients: &[usize],
        genes: &[usize],
    ) -> Evaluation {
        let dif_min = column_min(patients, genes, |p, g| store.diffusion_hit(p, g));
        let exp_min = column_min(patients, genes, |p, g| store.expression_hit(p, g));
        let support = patients
            .iter()
            .filter(|&&p| genes.iter().any(|&g| store.is_mutated(p, g)))
            .count();
        self.from_counts(patients.len(), genes.len(), dif_min, exp_min, support)
    }

    /// Scores the pattern currently held in `state`.
    pub fn evaluate_state(&self, state: &PatternState) -> Evaluation {
        self.from_counts(
            state.patients.len(),
            state.genes.len(),
            state.dif_min,
            state.exp_min,
            state.support,
        )
    }

    /// Scores `state` with `mv` applied, without touching `state`.
    ///
    /// Pure in its inputs, so it can run on any worker thread.
    pub fn evaluate_move(&self, store: &MatrixStore, state: &PatternState, mv: Move) -> Evaluation {
        let n_patients = state.patients.len();
        let n_genes = state.genes.len();
        match mv {
            Move::AddGene(g) => {
                let gained = state
                    .patients
                    .iter()
                    .filter(|&&p| state.mut_row[p] == 0 && store.is_mutated(p, g))
                    .count();
                self.from_counts(
                    n_patients,
                    n_genes + 1,
                    Some(state.dif_min.map_or(state.dif_col[g], |m| m.min(state.dif_col[g]))),
                    Some(state.exp_min.map_or(state.exp_col[g], |m| m.min(state.exp_col[g]))),
                    state.support + gained,
                )
            }
            Move::RemoveGene(g) => {
                let remaining = || state.genes.iter().copied().filter(|&x| x != g);
                let lost = state
                    .patients
                    .iter()
                    .filter(|&&p| state.mut_row[p] == 1 && store.is_mutated(p, g))
                    .count();
                self.from_counts(
                    n_patients,
                    n_genes - 1,
                    remaining().map(|x| state.dif_col[x]).min(),
                    remaining().map(|x| state.exp_col[x]).min(),
                    state.support - lost,
                )
            }
            Move::AddPatient(p) => {
                let dif_min = state
                    .genes
                    .iter()
                    .map(|&g| state.dif_col[g] + store.diffusion_hit(p, g) as usize)
                    .min();
                let exp_min = state
                    .genes
                    .iter()
                    .map(|&g| state.exp_col[g] + store.expression_hit(p, g) as usize)
                    .min();
                self.from_counts(
                    n_patients + 1,
                    n_genes,
                    dif_min,
                    exp_min,
                    state.support + (state.mut_row[p] > 0) as usize,
                )
            }
            Move::RemovePatient(p) => {
                let dif_min = state
                    .genes
                    .iter()
                    .map(|&g| state.dif_col[g] - store.diffusion_hit(p, g) as usize)
                    .min();
                let exp_min = state
                    .genes
                    .iter()
                    .map(|&g| state.exp_col[g] - store.expression_hit(p, g) as usize)
                    .min();
                self.from_counts(
                    n_patients - 1,
                    n_genes,
                    dif_min,
                    exp_min,
                    state.support - (state.mut_row[p] > 0) as usize,
                )
            }
        }
    }
}

/// A pattern under construction with the running counts needed to score
/// single-element moves cheaply.
#[derive(Clone, Debug)]
pub struct PatternState {
    patients: Vec<usize>,
    genes: Vec<usize>,
    is_patient: Vec<bool>,
    is_gene: Vec<bool>,
    /// Per gene: member patients with a diffusion hit.
    dif_col: Vec<usize>,
    /// Per gene: member patients with an expression hit.
    exp_col: Vec<usize>,
    /// Per patient (members or not): signature genes it is mutated in.
    mut_row: Vec<usize>,
    support: usize,
    dif_min: Option<usize>,
    exp_min: Option<usize>,
}

impl PatternState {
    /// A state with the given patients and an empty signature.
    pub fn seeded(store: &MatrixStore, seed_patients: &[usize]) -> Self {
        let mut state = Self {
            patients: Vec::with_capacity(seed_patients.len()),
            genes: Vec::new(),
            is_patient: vec![false; store.n_patients()],
            is_gene: vec![false; store.n_genes()],
            dif_col: vec![0; store.n_genes()],
            exp_col: vec![0; store.n_genes()],
            mut_row: vec![0; store.n_patients()],
            support: 0,
            dif_min: None,
            exp_min: None,
        };
        for &p in seed_patients {
            if !state.is_patient[p] {
                state.apply(store, Move::AddPatient(p));
            }
        }
        state
    }

    pub fn patients(&self) -> &[usize] {
        &self.patients
    }

    pub fn genes(&self) -> &[usize] {
        &self.genes
    }

    pub fn contains_patient(&self, p: usize) -> bool {
        self.is_patient[p]
    }

    pub fn contains_gene(&self, g: usize) -> bool {
        self.is_gene[g]
    }

    /// Applies a move, keeping member lists sorted and counts current.
    pub fn apply(&mut self, store: &MatrixStore, mv: Move) {
        match mv {
            Move::AddGene(g) => {
                debug_assert!(!self.is_gene[g]);
                for p in 0..self.mut_row.len() {
                    if store.is_mutated(p, g) {
                        if self.is_patient[p] && self.mut_row[p] == 0 {
                            self.support += 1;
                        }
                        self.mut_row[p] += 1;
                    }
                }
                insert_sorted(&mut self.genes, g);
                self.is_gene[g] = true;
            }
            Move::RemoveGene(g) => {
                debug_assert!(self.is_gene[g]);
                for p in 0..self.mut_row.len() {
                    if store.is_mutated(p, g) {
                        self.mut_row[p] -= 1;
                        if self.is_patient[p] && self.mut_row[p] == 0 {
                            self.support -= 1;
                        }
                    }
                }
                self.genes.retain(|&x| x != g);
                self.is_gene[g] = false;
            }
            Move::AddPatient(p) => {
                debug_assert!(!self.is_patient[p]);
                for g in 0..self.dif_col.len() {
                    self.dif_col[g] += store.diffusion_hit(p, g) as usize;
                    self.exp_col[g] += store.expression_hit(p, g) as usize;
                }
                if self.mut_row[p] > 0 {
                    self.support += 1;
                }
                insert_sorted(&mut self.patients, p);
                self.is_patient[p] = true;
            }
            Move::RemovePatient(p) => {
                debug_assert!(self.is_patient[p]);
                for g in 0..self.dif_col.len() {
                    self.dif_col[g] -= store.diffusion_hit(p, g) as usize;
                    self.exp_col[g] -= store.expression_hit(p, g) as usize;
                }
                if self.mut_row[p] > 0 {
                    self.support -= 1;
                }
                self.patients.retain(|&x| x != p);
                self.is_patient[p] = false;
            }
        }
        self.dif_min = self.genes.iter().map(|&g| self.dif_col[g]).min();
        self.exp_min = self.genes.iter().map(|&g| self.exp_col[g]).min();
    }
}

/// Smallest per-gene hit count over `genes`, `None` for an empty signature.
fn column_min<F>(patients: &[usize], genes: &[usize], hit: F) -> Option<usize>
where
    F: Fn(usize, usize) -> bool,
{
    genes
        .iter()
        .map(|&g| patients.iter().filter(|&&p| hit(p, g)).count())
        .min()
}

fn insert_sorted(items: &mut Vec<usize>, value: usize) {
    if let Err(pos) = items.binary_search(&value) {
        items.insert(pos, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix_store::{RankCutoffs, UNRANKED};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn store() -> MatrixStore {
        // 4 patients x 3 genes
        MatrixStore::from_arrays(
            (0..4).map(|i| format!("p{i}")).collect(),
            (0..3).map(|j| format!("g{j}")).collect(),
            array![[1, 1, 9], [1, 9, 9], [1, 1, 1], [9, 1, UNRANKED]],
            array![[1, 1, 1], [1, 9, 1], [9, 1, 1], [1, 1, 9]],
            array![
                [true, false, false],
                [false, true, false],
                [true, true, false],
                [false, false, true]
            ],
            Array2::ones((4, 1)),
            RankCutoffs {
                max_dif_rank: 5,
                max_exp_rank: 5,
            },
        )
        .unwrap()
    }

    fn model(dtheta: f64, etheta: f64, n_req: usize) -> ScoreModel {
        ScoreModel::new(
            0.5,
            Thresholds {
                dtheta,
                etheta,
                n_req_mutations: n_req,
            },
        )
    }

    #[test]
    fn consistency_is_the_weakest_gene() {
        let store = store();
        let m = model(0.0, 0.0, 0);
        let eval = m.evaluate_members(&store, &[0, 1, 2], &[0, 1]);
        // gene 0 diffusion hits 3/3, gene 1 hits 2/3
        assert_abs_diff_eq!(eval.diffusion_consistency, 2.0 / 3.0);
        // gene 0 expression hits 2/3, gene 1 hits 2/3
        assert_abs_diff_eq!(eval.expression_consistency, 2.0 / 3.0);
        assert_eq!(eval.mutation_support, 3);
        assert_eq!(eval.cells, 6);
        assert_abs_diff_eq!(eval.score, 2.0 / 3.0);
    }

    #[test]
    fn floors_gate_the_score() {
        let store = store();
        let eval = model(0.9, 0.0, 0).evaluate_members(&store, &[0, 1, 2], &[0, 1]);
        assert!(!eval.is_valid());
        assert_eq!(eval.score, f64::NEG_INFINITY);
        assert_abs_diff_eq!(eval.objective, 2.0 / 3.0);

        let eval = model(0.0, 0.0, 4).evaluate_members(&store, &[0, 1, 2], &[0, 1]);
        assert!(!eval.is_valid());

        let empty = model(0.0, 0.0, 0).evaluate_members(&store, &[0, 1], &[]);
        assert!(!empty.is_valid());
    }

    #[test]
    fn incremental_moves_match_full_recomputation() {
        let store = store();
        let m = model(0.0, 0.0, 0);
        let mut state = PatternState::seeded(&store, &[0, 2]);
        let script = [
            Move::AddGene(1),
            Move::AddPatient(3),
            Move::AddGene(2),
            Move::RemovePatient(0),
            Move::AddPatient(1),
            Move::RemoveGene(1),
            Move::AddGene(0),
        ];
        for mv in script {
            let predicted = m.evaluate_move(&store, &state, mv);
            state.apply(&store, mv);
            let direct = m.evaluate_members(&store, state.patients(), state.genes());
            assert_eq!(predicted, direct, "after {:?}", mv);
            assert_eq!(m.evaluate_state(&state), direct);
        }
        assert_eq!(state.patients(), &[1, 2, 3]);
        assert_eq!(state.genes(), &[0, 2]);
    }

    #[test]
    fn improvement_prefers_score_then_size() {
        let base = model(0.0, 0.0, 0).from_counts(2, 1, Some(2), Some(2), 0);
        let bigger = model(0.0, 0.0, 0).from_counts(2, 2, Some(2), Some(2), 0);
        let worse = model(0.0, 0.0, 0).from_counts(3, 1, Some(2), Some(2), 0);
        assert!(bigger.improves_on(&base));
        assert!(!base.improves_on(&bigger));
        assert!(!worse.improves_on(&base));
        assert!(!base.improves_on(&base));
    }

    #[test]
    fn infeasible_patterns_progress_by_shortfall() {
        let m = model(0.8, 0.5, 2);
        let empty = m.from_counts(10, 0, None, None, 0);
        let noisy = m.from_counts(10, 1, Some(7), Some(8), 7);
        let cleaner = m.from_counts(9, 1, Some(7), Some(8), 7);
        let feasible = m.from_counts(8, 1, Some(7), Some(7), 7);
        assert!(!noisy.is_valid());
        assert_abs_diff_eq!(empty.shortfall, 1.0 + 0.8 + 0.5 + 1.0);
        assert_abs_diff_eq!(noisy.shortfall, 0.1, epsilon = 1e-12);
        assert_eq!(feasible.shortfall, 0.0);

        assert!(noisy.improves_on(&empty));
        assert!(cleaner.improves_on(&noisy));
        assert!(feasible.improves_on(&cleaner));
        assert!(!cleaner.improves_on(&feasible));
    }
}
