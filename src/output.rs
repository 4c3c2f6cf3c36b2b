use crate::decomposer::{Pattern, PatternStatus};
use crate::error::{Result, SubtypeError};
use crate::matrix_store::MatrixStore;
use crate::search::Move;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn create_output_file(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    File::create(&path)
        .map(BufWriter::new)
        .map_err(|e| SubtypeError::io(path, e))
}

fn write_ids<'a>(dir: &Path, name: &str, ids: impl Iterator<Item = &'a String>) -> Result<()> {
    let path = dir.join(name);
    let mut writer = create_output_file(dir, name)?;
    for id in ids {
        writeln!(writer, "{}", id).map_err(|e| SubtypeError::io(&path, e))?;
    }
    writer.flush().map_err(|e| SubtypeError::io(&path, e))
}

/// One indicator column per slot; only accepted patterns set their members.
fn indicator_columns<F>(n: usize, patterns: &[Pattern], members: F) -> Vec<Vec<bool>>
where
    F: Fn(&Pattern) -> &[usize],
{
    patterns
        .iter()
        .map(|pattern| {
            let mut column = vec![false; n];
            if pattern.is_accepted() {
                for &i in members(pattern) {
                    column[i] = true;
                }
            }
            column
        })
        .collect()
}

fn format_score(score: f64) -> String {
    if score.is_finite() {
        format!("{:.6}", score)
    } else {
        "NA".to_string()
    }
}

/// Persists the patterns of one restart as they are finalized.
///
/// `patterns.tsv` is flushed after every slot so a later failure in the same
/// restart leaves earlier slots on disk.
pub struct RestartWriter {
    dir: PathBuf,
    summary_path: PathBuf,
    summary: BufWriter<File>,
}

impl RestartWriter {
    pub fn create(working_dir: &Path, restart: usize) -> Result<Self> {
        let dir = working_dir.join(format!("restart_{}", restart));
        fs::create_dir_all(&dir).map_err(|e| SubtypeError::io(&dir, e))?;
        let summary_path = dir.join("patterns.tsv");
        let mut summary = create_output_file(&dir, "patterns.tsv")?;
        writeln!(
            summary,
            "Pattern\tStatus\tReason\tPatients\tGenes\tDiffusionConsistency\tExpressionConsistency\tMutationSupport\tScore\tObjective\tIterations\tStopCause"
        )
        .and_then(|_| summary.flush())
        .map_err(|e| SubtypeError::io(&summary_path, e))?;
        info!("Writing restart {} results to {}", restart, dir.display());
        Ok(Self {
            dir,
            summary_path,
            summary,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends the slot's summary row and writes its member lists (and trace,
    /// if one was recorded).
    pub fn write_pattern(&mut self, store: &MatrixStore, pattern: &Pattern) -> Result<()> {
        let (status, reason) = match pattern.status {
            PatternStatus::Accepted => ("accepted", "-".to_string()),
            PatternStatus::Rejected(r) => ("rejected", r.to_string()),
        };
        let eval = &pattern.evaluation;
        writeln!(
            self.summary,
            "{}\t{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{}\t{}\t{:.6}\t{}\t{}",
            pattern.slot,
            status,
            reason,
            pattern.patients.len(),
            pattern.genes.len(),
            eval.diffusion_consistency,
            eval.expression_consistency,
            eval.mutation_support,
            format_score(eval.score),
            eval.objective,
            pattern.iterations,
            pattern.stop_cause
        )
        .and_then(|_| self.summary.flush())
        .map_err(|e| SubtypeError::io(&self.summary_path, e))?;

        write_ids(
            &self.dir,
            &format!("pattern_{}.patients.txt", pattern.slot),
            pattern.patients.iter().map(|&p| &store.patient_ids()[p]),
        )?;
        write_ids(
            &self.dir,
            &format!("pattern_{}.genes.txt", pattern.slot),
            pattern.genes.iter().map(|&g| &store.gene_ids()[g]),
        )?;
        if !pattern.trace.is_empty() {
            self.write_trace(store, pattern)?;
        }
        debug!("Persisted pattern {} to {}", pattern.slot, self.dir.display());
        Ok(())
    }

    fn write_trace(&self, store: &MatrixStore, pattern: &Pattern) -> Result<()> {
        let name = format!("pattern_{}.trace.tsv", pattern.slot);
        let path = self.dir.join(&name);
        let mut writer = create_output_file(&self.dir, &name)?;
        let io_err = |e| SubtypeError::io(&path, e);
        writeln!(
            writer,
            "Iteration\tMove\tTarget\tScore\tDiffusionConsistency\tExpressionConsistency\tMutationSupport\tCells"
        )
        .map_err(io_err)?;
        for step in &pattern.trace {
            let target = match step.mv {
                Move::AddGene(g) | Move::RemoveGene(g) => &store.gene_ids()[g],
                Move::AddPatient(p) | Move::RemovePatient(p) => &store.patient_ids()[p],
            };
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{}\t{}",
                step.iteration,
                step.mv.label(),
                target,
                format_score(step.evaluation.score),
                step.evaluation.diffusion_consistency,
                step.evaluation.expression_consistency,
                step.evaluation.mutation_support,
                step.evaluation.cells
            )
            .map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }

    /// Writes the binary factor matrices of accepted patterns:
    /// `membership_F.tsv` (patient x k) and `signature_G.tsv` (gene x k).
    pub fn write_factor_matrices(&self, store: &MatrixStore, patterns: &[Pattern]) -> Result<()> {
        let f = indicator_columns(store.n_patients(), patterns, |p: &Pattern| p.patients.as_slice());
        let g = indicator_columns(store.n_genes(), patterns, |p: &Pattern| p.genes.as_slice());
        self.write_indicator_matrix("membership_F.tsv", "PatientID", store.patient_ids(), patterns, &f)?;
        self.write_indicator_matrix("signature_G.tsv", "GeneID", store.gene_ids(), patterns, &g)?;
        info!("Wrote factor matrices for {} pattern slots.", patterns.len());
        Ok(())
    }

    fn write_indicator_matrix(
        &self,
        name: &str,
        corner: &str,
        row_ids: &[String],
        patterns: &[Pattern],
        columns: &[Vec<bool>],
    ) -> Result<()> {
        let path = self.dir.join(name);
        let mut writer = create_output_file(&self.dir, name)?;
        let io_err = |e| SubtypeError::io(&path, e);
        write!(writer, "{}", corner).map_err(io_err)?;
        for pattern in patterns {
            write!(writer, "\tPattern{}", pattern.slot).map_err(io_err)?;
        }
        writeln!(writer).map_err(io_err)?;
        for (row, id) in row_ids.iter().enumerate() {
            write!(writer, "{}", id).map_err(io_err)?;
            for column in columns {
                write!(writer, "\t{}", column[row] as u8).map_err(io_err)?;
            }
            writeln!(writer).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }

    #[cfg(feature = "json-summary")]
    pub fn write_json_summary(&self, store: &MatrixStore, patterns: &[Pattern]) -> Result<()> {
        let entries: Vec<serde_json::Value> = patterns
            .iter()
            .map(|p| {
                serde_json::json!({
                    "pattern": p.slot,
                    "accepted": p.is_accepted(),
                    "status": match p.status {
                        PatternStatus::Accepted => "accepted".to_string(),
                        PatternStatus::Rejected(r) => r.to_string(),
                    },
                    "patients": p.patients.iter().map(|&i| store.patient_ids()[i].clone()).collect::<Vec<_>>(),
                    "genes": p.genes.iter().map(|&i| store.gene_ids()[i].clone()).collect::<Vec<_>>(),
                    "diffusion_consistency": p.evaluation.diffusion_consistency,
                    "expression_consistency": p.evaluation.expression_consistency,
                    "mutation_support": p.evaluation.mutation_support,
                    "objective": p.evaluation.objective,
                    "iterations": p.iterations,
                    "stop_cause": p.stop_cause.to_string(),
                })
            })
            .collect();
        let path = self.dir.join("summary.json");
        let text = serde_json::to_string_pretty(&entries)
            .map_err(|e| SubtypeError::io(&path, std::io::Error::other(e)))?;
        fs::write(&path, text).map_err(|e| SubtypeError::io(&path, e))
    }
}
