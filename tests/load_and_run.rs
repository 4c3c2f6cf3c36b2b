use rmf_subtyping::{
    DecompositionConfig, DecompositionRunner, InputPaths, MatrixStore, RankCutoffs, SubtypeError,
};
use std::fs;
use std::path::PathBuf;

fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    path
}

/// Six patients in two groups; the expression file lists patients in another
/// order and carries an extra gene, the mutation file lacks patient P7.
fn write_inputs(dir: &tempfile::TempDir) -> InputPaths {
    let diffusion = write(
        dir,
        "dif.tsv",
        "Patient\tTP53\tKRAS\tEGFR\tMYC\n\
         P1\t1\t2\t40\t35\n\
         P2\t2\t1\t38\t33\n\
         P3\t1\t3\t37\t39\n\
         P4\t40\t39\t1\t2\n\
         P5\t38\t36\t2\t1\n\
         P6\t35\t40\t3\t1\n\
         P7\t1\t1\t1\t1\n",
    );
    let expression = write(
        dir,
        "exp.tsv",
        "TP53\tKRAS\tEGFR\tMYC\tEXTRA\n\
         P6\t30\t31\t2\t2\t1\n\
         P5\t33\t30\t1\t3\t1\n\
         P4\t32\t35\t2\t1\t1\n\
         P3\t2\t1\t30\t31\t1\n\
         P2\t1\t2\t33\t34\t1\n\
         P1\t3\t1\t31\t32\t1\n\
         P7\tNA\tNA\tNA\tNA\t1\n",
    );
    let mutation = write(
        dir,
        "mut.tsv",
        "id\tTP53\tKRAS\tEGFR\tMYC\n\
         P1\t1\t0\t0\t0\n\
         P2\t1\t0\t0\t0\n\
         P3\t0\t1\t0\t0\n\
         P4\t0\t0\t1\t0\n\
         P5\t0\t0\t1\t0\n\
         P6\t0\t0\t0\t0\n",
    );
    let factor = write(
        dir,
        "f.tsv",
        "id\tk1\tk2\n\
         P1\t0.9\t0.1\n\
         P2\t0.8\t0.2\n\
         P3\t0.7\t0.1\n\
         P4\t0.1\t0.9\n\
         P5\t0.2\t0.8\n\
         P6\t0.1\t0.7\n\
         P7\t0.5\t0.5\n",
    );
    InputPaths::from_options(Some(diffusion), Some(expression), Some(mutation), Some(factor)).unwrap()
}

#[test]
fn loads_aligns_decomposes_and_persists() -> anyhow::Result<()> {
    let inputs_dir = tempfile::tempdir()?;
    let out_dir = tempfile::tempdir()?;
    let inputs = write_inputs(&inputs_dir);
    let cutoffs = RankCutoffs {
        max_dif_rank: 5,
        max_exp_rank: 5,
    };
    let store = MatrixStore::load(&inputs, cutoffs)?;
    assert_eq!(store.n_patients(), 6);
    assert_eq!(store.gene_ids(), &["TP53", "KRAS", "EGFR", "MYC"]);

    let config = DecompositionConfig {
        k: 2,
        dtheta: 0.8,
        etheta: 0.8,
        beta: 0.5,
        n_req_mutations: 2,
        max_dif_rank: 5,
        max_exp_rank: 5,
        working_dir: out_dir.path().to_path_buf(),
        threads: 2,
        log_intermediate: true,
        ..Default::default()
    };
    let runner = DecompositionRunner::new(store, config)?;
    let results = runner.run()?;
    let patterns = &results[0].patterns;
    assert_eq!(patterns.len(), 2);
    assert!(patterns.iter().all(|p| p.is_accepted()));

    let restart_dir = out_dir.path().join("restart_1");
    let patients_1 = fs::read_to_string(restart_dir.join("pattern_1.patients.txt"))?;
    assert_eq!(patients_1.lines().collect::<Vec<_>>(), vec!["P1", "P2", "P3"]);
    let genes_1 = fs::read_to_string(restart_dir.join("pattern_1.genes.txt"))?;
    assert_eq!(genes_1.lines().collect::<Vec<_>>(), vec!["TP53", "KRAS"]);
    let patients_2 = fs::read_to_string(restart_dir.join("pattern_2.patients.txt"))?;
    assert_eq!(patients_2.lines().collect::<Vec<_>>(), vec!["P4", "P5", "P6"]);

    let trace = fs::read_to_string(restart_dir.join("pattern_1.trace.tsv"))?;
    assert!(trace.lines().nth(1).is_some_and(|l| l.starts_with("1\tadd_gene\tTP53")));

    let signature = fs::read_to_string(restart_dir.join("signature_G.tsv"))?;
    assert!(signature.lines().any(|l| l == "EGFR\t0\t1"));
    Ok(())
}

#[test]
fn malformed_rank_cell_is_reported_with_its_line() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = write_inputs(&dir);
    inputs.diffusion = write(&dir, "bad.tsv", "id\tTP53\nP1\t1\nP2\thigh\n");
    match MatrixStore::load(&inputs, RankCutoffs::unbounded()) {
        Err(SubtypeError::MalformedInput { line, reason, .. }) => {
            assert_eq!(line, 3);
            assert!(reason.contains("TP53"));
        }
        other => panic!("expected malformed input, got {:?}", other.map(|s| s.n_patients())),
    }
}

#[test]
fn nonexistent_input_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = InputPaths::from_options(
        Some(dir.path().join("missing.tsv")),
        Some(dir.path().join("missing.tsv")),
        Some(dir.path().join("missing.tsv")),
        Some(dir.path().join("missing.tsv")),
    )
    .unwrap_err();
    assert!(matches!(err, SubtypeError::Configuration(_)));
}
