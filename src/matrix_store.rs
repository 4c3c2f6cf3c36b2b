use crate::config::InputPaths;
use crate::error::{Result, SubtypeError};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Sentinel for a cell that carries no rank at all.
pub const UNRANKED: u32 = u32::MAX;

/// Rank cutoffs used to turn rank matrices into signal indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankCutoffs {
    pub max_dif_rank: u32,
    pub max_exp_rank: u32,
}

impl RankCutoffs {
    pub fn unbounded() -> Self {
        Self {
            max_dif_rank: 0,
            max_exp_rank: 0,
        }
    }
}

#[inline(always)]
fn within_cutoff(rank: u32, max_rank: u32) -> bool {
    rank != UNRANKED && (max_rank == 0 || rank <= max_rank)
}

/// A matrix read from disk together with its row and column identifiers.
#[derive(Debug, Clone)]
pub struct LabeledTable<T> {
    pub row_ids: Vec<String>,
    pub col_ids: Vec<String>,
    pub values: Array2<T>,
}

impl<T: Clone> LabeledTable<T> {
    fn select(&self, rows: &[usize], cols: &[usize]) -> Array2<T> {
        Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            self.values[[rows[i], cols[j]]].clone()
        })
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    if line.contains('\t') {
        line.split('\t').map(str::trim).collect()
    } else {
        line.split_whitespace().collect()
    }
}

/// Reads a row-labelled, column-labelled matrix.
///
/// The header may or may not carry a corner label; that is settled by the
/// field count of the first data row.
pub fn read_table<T, F>(path: &Path, parse_cell: F) -> Result<LabeledTable<T>>
where
    F: Fn(&str) -> std::result::Result<T, String>,
{
    debug!("Reading matrix from {}", path.display());
    let file = File::open(path).map_err(|e| SubtypeError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut header: Option<(usize, Vec<String>)> = None;
    let mut col_ids: Vec<String> = Vec::new();
    let mut row_ids: Vec<String> = Vec::new();
    let mut seen_rows: HashSet<String> = HashSet::new();
    let mut data: Vec<T> = Vec::new();

    for (line_idx, line_result) in reader.lines().enumerate() {
        let line_num = line_idx + 1;
        let line = line_result.map_err(|e| SubtypeError::io(path, e))?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields = split_fields(trimmed);

        if header.is_none() && col_ids.is_empty() && row_ids.is_empty() {
            header = Some((
                line_num,
                fields.iter().map(|s| s.to_string()).collect(),
            ));
            continue;
        }

        if row_ids.is_empty() {
            // First data row decides whether the header has a corner cell.
            let (header_line, header_fields) = header.take().unwrap_or_default();
            col_ids = if header_fields.len() + 1 == fields.len() {
                header_fields
            } else if header_fields.len() == fields.len() {
                header_fields.into_iter().skip(1).collect()
            } else {
                return Err(SubtypeError::malformed(
                    path,
                    line_num,
                    format!(
                        "header on line {} has {} fields but first data row has {}",
                        header_line,
                        header_fields.len(),
                        fields.len()
                    ),
                ));
            };
            if col_ids.is_empty() {
                return Err(SubtypeError::malformed(path, header_line, "header names no columns"));
            }
            let mut seen_cols = HashSet::with_capacity(col_ids.len());
            for id in &col_ids {
                if !seen_cols.insert(id.as_str()) {
                    return Err(SubtypeError::malformed(
                        path,
                        header_line,
                        format!("duplicate column identifier '{}'", id),
                    ));
                }
            }
        }

        if fields.len() != col_ids.len() + 1 {
            return Err(SubtypeError::malformed(
                path,
                line_num,
                format!(
                    "expected {} fields (identifier + {} values), found {}",
                    col_ids.len() + 1,
                    col_ids.len(),
                    fields.len()
                ),
            ));
        }
        let row_id = fields[0].to_string();
        if !seen_rows.insert(row_id.clone()) {
            return Err(SubtypeError::malformed(
                path,
                line_num,
                format!("duplicate row identifier '{}'", row_id),
            ));
        }
        for (col, raw) in fields[1..].iter().enumerate() {
            let value = parse_cell(raw).map_err(|reason| {
                SubtypeError::malformed(
                    path,
                    line_num,
                    format!("column '{}': {}", col_ids[col], reason),
                )
            })?;
            data.push(value);
        }
        row_ids.push(row_id);
    }

    if row_ids.is_empty() {
        return Err(SubtypeError::malformed(path, 0, "no data rows"));
    }

    let values = Array2::from_shape_vec((row_ids.len(), col_ids.len()), data)
        .map_err(|e| SubtypeError::DimensionMismatch(format!("{}: {}", path.display(), e)))?;
    debug!(
        "Read {} rows x {} columns from {}",
        row_ids.len(),
        col_ids.len(),
        path.display()
    );
    Ok(LabeledTable {
        row_ids,
        col_ids,
        values,
    })
}

fn is_missing(raw: &str) -> bool {
    matches!(raw, "" | "NA" | "na" | "NaN" | "nan" | "." | "-")
}

fn parse_integral(raw: &str) -> std::result::Result<i64, String> {
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(v);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as i64),
        _ => Err(format!("'{}' is not an integer", raw)),
    }
}

/// Rank cell: non-negative integer, or one of the unranked spellings.
pub fn parse_rank(raw: &str) -> std::result::Result<u32, String> {
    if is_missing(raw) {
        return Ok(UNRANKED);
    }
    let value = parse_integral(raw)?;
    if value < 0 {
        Ok(UNRANKED)
    } else if value >= UNRANKED as i64 {
        Err(format!("rank {} is out of range", value))
    } else {
        Ok(value as u32)
    }
}

/// Mutation cell: 0 or 1. Missing reads as not mutated.
pub fn parse_mutation(raw: &str) -> std::result::Result<bool, String> {
    if is_missing(raw) {
        return Ok(false);
    }
    match parse_integral(raw)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(format!("mutation value must be 0 or 1, found {}", other)),
    }
}

pub fn parse_weight(raw: &str) -> std::result::Result<f64, String> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("'{}' is not a finite number", raw)),
    }
}

/// The three patient x gene matrices plus the initial factor, aligned on one
/// patient index and one gene index.
///
/// Immutable after construction and shared by reference across worker
/// threads.
#[derive(Debug)]
pub struct MatrixStore {
    patient_ids: Vec<String>,
    gene_ids: Vec<String>,
    diffusion: Array2<u32>,
    expression: Array2<u32>,
    mutations: Array2<bool>,
    initial_factor: Array2<f64>,
    cutoffs: RankCutoffs,
    diffusion_hits: Array2<bool>,
    expression_hits: Array2<bool>,
}

impl MatrixStore {
    /// Loads and aligns all four inputs.
    pub fn load(paths: &InputPaths, cutoffs: RankCutoffs) -> Result<Self> {
        info!("Loading ranked diffusion matrix: {}", paths.diffusion.display());
        let diffusion = read_table(&paths.diffusion, parse_rank)?;
        info!("Loading ranked expression matrix: {}", paths.expression.display());
        let expression = read_table(&paths.expression, parse_rank)?;
        info!("Loading mutation matrix: {}", paths.mutation.display());
        let mutations = read_table(&paths.mutation, parse_mutation)?;
        info!("Loading initial factor matrix: {}", paths.initial_factor.display());
        let initial_factor = read_table(&paths.initial_factor, parse_weight)?;
        Self::from_tables(diffusion, expression, mutations, initial_factor, cutoffs)
    }

    /// Aligns tables by identifier. Patients missing from any input and genes
    /// missing from any gene matrix are dropped; diffusion order is kept.
    pub fn from_tables(
        diffusion: LabeledTable<u32>,
        expression: LabeledTable<u32>,
        mutations: LabeledTable<bool>,
        initial_factor: LabeledTable<f64>,
        cutoffs: RankCutoffs,
    ) -> Result<Self> {
        let index_of = |ids: &[String]| -> HashMap<String, usize> {
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect()
        };
        let exp_rows = index_of(&expression.row_ids);
        let mut_rows = index_of(&mutations.row_ids);
        let f_rows = index_of(&initial_factor.row_ids);
        let exp_cols = index_of(&expression.col_ids);
        let mut_cols = index_of(&mutations.col_ids);

        let mut patient_ids = Vec::new();
        let mut rows: [Vec<usize>; 4] = Default::default();
        for (d_idx, id) in diffusion.row_ids.iter().enumerate() {
            if let (Some(&e), Some(&m), Some(&f)) =
                (exp_rows.get(id), mut_rows.get(id), f_rows.get(id))
            {
                patient_ids.push(id.clone());
                rows[0].push(d_idx);
                rows[1].push(e);
                rows[2].push(m);
                rows[3].push(f);
            }
        }

        let mut gene_ids = Vec::new();
        let mut cols: [Vec<usize>; 3] = Default::default();
        for (d_idx, id) in diffusion.col_ids.iter().enumerate() {
            if let (Some(&e), Some(&m)) = (exp_cols.get(id), mut_cols.get(id)) {
                gene_ids.push(id.clone());
                cols[0].push(d_idx);
                cols[1].push(e);
                cols[2].push(m);
            }
        }

        if patient_ids.is_empty() {
            return Err(SubtypeError::DimensionMismatch(
                "no patient identifier is shared by all four inputs".to_string(),
            ));
        }
        if gene_ids.is_empty() {
            return Err(SubtypeError::DimensionMismatch(
                "no gene identifier is shared by the diffusion, expression and mutation matrices"
                    .to_string(),
            ));
        }

        let max_patients = diffusion
            .row_ids
            .len()
            .max(expression.row_ids.len())
            .max(mutations.row_ids.len())
            .max(initial_factor.row_ids.len());
        let max_genes = diffusion
            .col_ids
            .len()
            .max(expression.col_ids.len())
            .max(mutations.col_ids.len());
        if patient_ids.len() < max_patients {
            warn!(
                "Dropping patients absent from at least one input: keeping {} of up to {}.",
                patient_ids.len(),
                max_patients
            );
        }
        if gene_ids.len() < max_genes {
            warn!(
                "Dropping genes absent from at least one gene matrix: keeping {} of up to {}.",
                gene_ids.len(),
                max_genes
            );
        }

        let all_factor_cols: Vec<usize> = (0..initial_factor.col_ids.len()).collect();
        Self::from_arrays(
            patient_ids,
            gene_ids,
            diffusion.select(&rows[0], &cols[0]),
            expression.select(&rows[1], &cols[1]),
            mutations.select(&rows[2], &cols[2]),
            initial_factor.select(&rows[3], &all_factor_cols),
            cutoffs,
        )
    }

    /// Builds a store from already aligned arrays.
    pub fn from_arrays(
        patient_ids: Vec<String>,
        gene_ids: Vec<String>,
        diffusion: Array2<u32>,
        expression: Array2<u32>,
        mutations: Array2<bool>,
        initial_factor: Array2<f64>,
        cutoffs: RankCutoffs,
    ) -> Result<Self> {
        let shape = (patient_ids.len(), gene_ids.len());
        for (name, dim) in [
            ("diffusion", diffusion.dim()),
            ("expression", expression.dim()),
            ("mutation", mutations.dim()),
        ] {
            if dim != shape {
                return Err(SubtypeError::DimensionMismatch(format!(
                    "{} matrix is {}x{} but the store indexes {} patients x {} genes",
                    name, dim.0, dim.1, shape.0, shape.1
                )));
            }
        }
        if initial_factor.nrows() != shape.0 {
            return Err(SubtypeError::DimensionMismatch(format!(
                "initial factor has {} rows but the store indexes {} patients",
                initial_factor.nrows(),
                shape.0
            )));
        }

        let diffusion_hits = diffusion.mapv(|r| within_cutoff(r, cutoffs.max_dif_rank));
        let expression_hits = expression.mapv(|r| within_cutoff(r, cutoffs.max_exp_rank));
        info!(
            "Matrix store ready: {} patients x {} genes, initial factor with {} columns.",
            shape.0,
            shape.1,
            initial_factor.ncols()
        );

        Ok(Self {
            patient_ids,
            gene_ids,
            diffusion,
            expression,
            mutations,
            initial_factor,
            cutoffs,
            diffusion_hits,
            expression_hits,
        })
    }

    pub fn n_patients(&self) -> usize {
        self.patient_ids.len()
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn patient_ids(&self) -> &[String] {
        &self.patient_ids
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cutoffs(&self) -> RankCutoffs {
        self.cutoffs
    }

    pub fn diffusion_rank(&self, patient: usize, gene: usize) -> u32 {
        self.diffusion[[patient, gene]]
    }

    pub fn expression_rank(&self, patient: usize, gene: usize) -> u32 {
        self.expression[[patient, gene]]
    }

    #[inline(always)]
    pub fn is_mutated(&self, patient: usize, gene: usize) -> bool {
        self.mutations[[patient, gene]]
    }

    /// Whether the diffusion rank of this cell is within the cutoff.
    #[inline(always)]
    pub fn diffusion_hit(&self, patient: usize, gene: usize) -> bool {
        self.diffusion_hits[[patient, gene]]
    }

    #[inline(always)]
    pub fn expression_hit(&self, patient: usize, gene: usize) -> bool {
        self.expression_hits[[patient, gene]]
    }

    /// Initial weight of `patient` for pattern slot `slot` (0-based), if the
    /// factor has that many columns.
    pub fn initial_weight(&self, patient: usize, slot: usize) -> Option<f64> {
        self.initial_factor.get([patient, slot]).copied()
    }

    pub fn initial_factor(&self) -> ArrayView2<'_, f64> {
        self.initial_factor.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reads_header_with_and_without_corner_label() {
        let dir = tempfile::tempdir().unwrap();
        let with_corner = write_file(&dir, "a.tsv", "patient\tg1\tg2\np1\t1\t2\np2\tNA\t3\n");
        let without = write_file(&dir, "b.tsv", "g1\tg2\n# comment\np1\t1\t2\n\np2\t-1\t3\n");

        let a = read_table(&with_corner, parse_rank).unwrap();
        let b = read_table(&without, parse_rank).unwrap();
        assert_eq!(a.col_ids, vec!["g1", "g2"]);
        assert_eq!(b.col_ids, vec!["g1", "g2"]);
        assert_eq!(a.values, b.values);
        assert_eq!(a.values[[1, 0]], UNRANKED);
    }

    #[test]
    fn ragged_row_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "r.tsv", "id\tg1\tg2\np1\t1\t2\np2\t3\n");
        match read_table(&path, parse_rank) {
            Err(SubtypeError::MalformedInput { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected malformed input, got {:?}", other.map(|t| t.row_ids)),
        }
    }

    #[test]
    fn cell_parsers() {
        assert_eq!(parse_rank("12"), Ok(12));
        assert_eq!(parse_rank("3.0"), Ok(3));
        assert_eq!(parse_rank("NA"), Ok(UNRANKED));
        assert!(parse_rank("abc").is_err());
        assert_eq!(parse_mutation("1"), Ok(true));
        assert_eq!(parse_mutation("0.0"), Ok(false));
        assert!(parse_mutation("2").is_err());
        assert!(parse_weight("inf").is_err());
    }

    #[test]
    fn alignment_keeps_shared_identifiers_in_diffusion_order() {
        let dif = LabeledTable {
            row_ids: vec!["p1".into(), "p2".into(), "p3".into()],
            col_ids: vec!["g1".into(), "g2".into(), "g3".into()],
            values: array![[1, 2, 3], [4, 5, 6], [7, 8, 9]],
        };
        let exp = LabeledTable {
            row_ids: vec!["p3".into(), "p1".into()],
            col_ids: vec!["g3".into(), "g1".into()],
            values: array![[30, 10], [31, 11]],
        };
        let muts = LabeledTable {
            row_ids: vec!["p1".into(), "p2".into(), "p3".into()],
            col_ids: vec!["g1".into(), "g3".into()],
            values: array![[true, false], [false, false], [false, true]],
        };
        let f0 = LabeledTable {
            row_ids: vec!["p1".into(), "p3".into()],
            col_ids: vec!["k1".into()],
            values: array![[0.5], [0.25]],
        };
        let store = MatrixStore::from_tables(dif, exp, muts, f0, RankCutoffs::unbounded()).unwrap();

        assert_eq!(store.patient_ids(), &["p1".to_string(), "p3".to_string()]);
        assert_eq!(store.gene_ids(), &["g1".to_string(), "g3".to_string()]);
        assert_eq!(store.diffusion_rank(1, 1), 9);
        assert_eq!(store.expression_rank(0, 0), 11);
        assert_eq!(store.expression_rank(1, 1), 30);
        assert!(store.is_mutated(1, 1));
        assert_eq!(store.initial_weight(1, 0), Some(0.25));
        assert_eq!(store.initial_weight(1, 1), None);
    }

    #[test]
    fn disjoint_identifiers_are_a_dimension_mismatch() {
        let table = |rows: &[&str]| LabeledTable {
            row_ids: rows.iter().map(|s| s.to_string()).collect(),
            col_ids: vec!["g1".to_string()],
            values: Array2::<u32>::zeros((rows.len(), 1)),
        };
        let muts = LabeledTable {
            row_ids: vec!["p9".to_string()],
            col_ids: vec!["g1".to_string()],
            values: Array2::from_elem((1, 1), false),
        };
        let f0 = LabeledTable {
            row_ids: vec!["p1".to_string()],
            col_ids: vec!["k1".to_string()],
            values: Array2::<f64>::ones((1, 1)),
        };
        let err = MatrixStore::from_tables(table(&["p1"]), table(&["p1"]), muts, f0, RankCutoffs::unbounded())
            .unwrap_err();
        assert!(matches!(err, SubtypeError::DimensionMismatch(_)));
    }

    #[test]
    fn cutoffs_define_hits() {
        let store = MatrixStore::from_arrays(
            vec!["p1".into()],
            vec!["g1".into(), "g2".into(), "g3".into()],
            array![[1, 5, UNRANKED]],
            array![[0, 2, 3]],
            array![[false, true, false]],
            array![[1.0]],
            RankCutoffs {
                max_dif_rank: 4,
                max_exp_rank: 0,
            },
        )
        .unwrap();
        assert!(store.diffusion_hit(0, 0));
        assert!(!store.diffusion_hit(0, 1));
        assert!(!store.diffusion_hit(0, 2));
        assert!(store.expression_hit(0, 0));
        assert!(store.expression_hit(0, 2));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = MatrixStore::from_arrays(
            vec!["p1".into(), "p2".into()],
            vec!["g1".into()],
            Array2::zeros((2, 1)),
            Array2::zeros((1, 1)),
            Array2::from_elem((2, 1), false),
            Array2::zeros((2, 1)),
            RankCutoffs::unbounded(),
        )
        .unwrap_err();
        assert!(matches!(err, SubtypeError::DimensionMismatch(_)));
    }
}
