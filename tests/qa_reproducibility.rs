//! Falsification tests for the reproducibility guarantees of a study.
//!
//! Every test states the null hypothesis it tries to falsify.

use cfasim::prelude::*;
use cfasim::replay::{ConditionStatus, StateStore, StudyIdentity};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn small_levels() -> FactorLevels {
    FactorLevels {
        sample_size: vec![100, 200],
        model_type: vec![ModelType::True, ModelType::Misspecified],
        data_type: vec![DataType::Normal, DataType::NonNormal],
    }
}

fn engine_config(seed: u64, state_path: Option<PathBuf>) -> EngineConfig {
    EngineConfig {
        replications: 6,
        base_seed: seed,
        state_path,
        context: "qa".into(),
        ..EngineConfig::default()
    }
}

fn surrogate_engine(config: EngineConfig) -> SimulationEngine<'static> {
    let model = PopulationModel::default();
    SimulationEngine::new(
        PopulationGenerator::new(model.clone()),
        SurrogateFitter::new(model),
        config,
    )
}

/// Surrogate fitter that counts its calls.
fn counting_fitter(
    calls: &AtomicUsize,
) -> impl Fn(&Condition, &Dataset) -> Result<FittedModel, ReplicationError> + Sync + '_ {
    let fitter = SurrogateFitter::new(PopulationModel::default());
    move |condition: &Condition, data: &Dataset| {
        calls.fetch_add(1, Ordering::SeqCst);
        fitter.fit(condition, data)
    }
}

fn means(table: &ResultsTable) -> Vec<Vec<u64>> {
    table
        .rows()
        .iter()
        .map(|r| r.means.iter().map(|m| m.to_bits()).collect())
        .collect()
}

// H0: The grid misses, repeats or reorders conditions
// Falsification: build the 2x2x1 grid and compare against the expected order
#[test]
fn h0_1_grid_order_is_lexicographic() {
    let grid = ConditionGrid::build(&FactorLevels {
        sample_size: vec![100, 200],
        model_type: vec![ModelType::True, ModelType::Misspecified],
        data_type: vec![DataType::Normal],
    })
    .unwrap();

    let expected = [
        Condition::new(100, ModelType::True, DataType::Normal),
        Condition::new(100, ModelType::Misspecified, DataType::Normal),
        Condition::new(200, ModelType::True, DataType::Normal),
        Condition::new(200, ModelType::Misspecified, DataType::Normal),
    ];
    assert_eq!(grid.conditions(), &expected);
}

// H0: The same seed produces different tables across runs
// Falsification: run the grid three times with seed 42; compare bitwise
#[test]
fn h0_2_same_seed_same_table() {
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    let reference = means(&surrogate_engine(engine_config(42, None)).run(&grid).unwrap());

    for run in 0..2 {
        let table = surrogate_engine(engine_config(42, None)).run(&grid).unwrap();
        assert_eq!(means(&table), reference, "run {run} diverged");
    }
}

// H0: Different seeds produce identical tables
// Falsification: run the grid with seeds 42 and 43
#[test]
fn h0_3_different_seeds_different_tables() {
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    let a = surrogate_engine(engine_config(42, None)).run(&grid).unwrap();
    let b = surrogate_engine(engine_config(43, None)).run(&grid).unwrap();
    assert_ne!(means(&a), means(&b));
}

// H0: Thread layout changes the results
// Falsification: every parallelism mode at 1, 2 and 7 workers vs sequential
#[test]
fn h0_4_parallelism_invariance() {
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    let reference = surrogate_engine(engine_config(7, None)).run(&grid).unwrap();

    for parallelism in [Parallelism::ByCondition, Parallelism::ByReplication] {
        for workers in [1, 2, 7] {
            let config = EngineConfig {
                parallelism,
                workers: Some(workers),
                ..engine_config(7, None)
            };
            let table = surrogate_engine(config).run(&grid).unwrap();
            assert_eq!(means(&table), means(&reference), "{parallelism} with {workers} workers");
            let seeds: Vec<u64> = table.rows().iter().map(|r| r.seed).collect();
            let expected: Vec<u64> = reference.rows().iter().map(|r| r.seed).collect();
            assert_eq!(seeds, expected);
        }
    }
}

// H0: Resuming a finished study recomputes conditions or changes the table
// Falsification: run, then resume with a counting fitter
#[test]
fn h0_5_resume_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let grid = ConditionGrid::build(&small_levels()).unwrap();

    let first = surrogate_engine(engine_config(42, Some(state.clone())))
        .run(&grid)
        .unwrap();

    let calls = AtomicUsize::new(0);
    let resumed = SimulationEngine::new(
        PopulationGenerator::new(PopulationModel::default()),
        counting_fitter(&calls),
        EngineConfig {
            resume: true,
            ..engine_config(42, Some(state))
        },
    )
    .run(&grid)
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0, "resume recomputed replications");
    assert_eq!(resumed, first);
}

// H0: A partially completed study resumes to a different table than an
// uninterrupted run
// Falsification: cancel after two conditions, resume, compare
#[test]
fn h0_6_interrupted_then_resumed_matches_uninterrupted() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    let uninterrupted = surrogate_engine(engine_config(42, None)).run(&grid).unwrap();

    let calls = AtomicUsize::new(0);
    let stop = Arc::new(AtomicBool::new(false));
    let interrupting = {
        let stop = Arc::clone(&stop);
        let inner = counting_fitter(&calls);
        let calls = &calls;
        move |condition: &Condition, data: &Dataset| -> Result<FittedModel, ReplicationError> {
            let result = inner(condition, data);
            // Two conditions' worth of replications.
            if calls.load(Ordering::SeqCst) == 12 {
                stop.store(true, Ordering::SeqCst);
            }
            result
        }
    };
    let engine = SimulationEngine::new(
        PopulationGenerator::new(PopulationModel::default()),
        interrupting,
        engine_config(42, Some(state.clone())),
    )
    .with_cancel_flag(Arc::clone(&stop));

    let err = engine.run(&grid).unwrap_err();
    assert!(matches!(err, SimError::Cancelled { completed: 2, total: 8 }));

    let store = StateStore::resume(
        &state,
        &grid,
        &StudyIdentity {
            base_seed: 42,
            replications: 6,
            max_retries: 0,
            context: "qa".into(),
        },
    )
    .unwrap();
    assert_eq!(store.completed_count(), 2);
    assert!(store
        .records()
        .iter()
        .all(|r| (r.status == ConditionStatus::Completed) == r.summary.is_some()));
    assert_eq!(means(&store.table()), means(&uninterrupted)[..2]);

    let resumed = surrogate_engine(EngineConfig {
        resume: true,
        ..engine_config(42, Some(state))
    })
    .run(&grid)
    .unwrap();
    assert_eq!(means(&resumed), means(&uninterrupted));
}

// H0: A clean run reuses stale completion flags or seeds
// Falsification: complete a run with seed 1, then run seed 2 without resume
#[test]
fn h0_7_clean_then_run_uses_fresh_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let grid = ConditionGrid::build(&small_levels()).unwrap();

    let stale = surrogate_engine(engine_config(1, Some(state.clone())))
        .run(&grid)
        .unwrap();

    let calls = AtomicUsize::new(0);
    let engine = SimulationEngine::new(
        PopulationGenerator::new(PopulationModel::default()),
        counting_fitter(&calls),
        engine_config(2, Some(state.clone())),
    );
    assert!(engine.clean().unwrap());
    let fresh = engine.run(&grid).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 8 * 6);
    let reference = surrogate_engine(engine_config(2, None)).run(&grid).unwrap();
    assert_eq!(means(&fresh), means(&reference));
    assert_ne!(means(&fresh), means(&stale));
    for (row, stale_row) in fresh.rows().iter().zip(stale.rows()) {
        assert_ne!(row.seed, stale_row.seed);
    }
}

// H0: Resuming under a changed study silently mixes results
// Falsification: resume a seed-42 state with seed 43 and with more replications
#[test]
fn h0_8_mismatched_resume_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    surrogate_engine(engine_config(42, Some(state.clone())))
        .run(&grid)
        .unwrap();

    let reseeded = surrogate_engine(EngineConfig {
        resume: true,
        ..engine_config(43, Some(state.clone()))
    });
    assert!(matches!(reseeded.run(&grid), Err(SimError::ResumeState { .. })));

    let more = surrogate_engine(EngineConfig {
        resume: true,
        replications: 7,
        ..engine_config(42, Some(state))
    });
    assert!(matches!(more.run(&grid), Err(SimError::ResumeState { .. })));
}

// H0: One failed replication poisons the condition mean
// Falsification: fail the third replication; mean must equal the mean of
// the other four
#[test]
fn h0_9_failed_replication_excluded_from_mean() {
    let condition = Condition::new(150, ModelType::True, DataType::Normal);
    let generator = PopulationGenerator::new(PopulationModel::default());
    let fitter = SurrogateFitter::new(PopulationModel::default());

    let calls = AtomicUsize::new(0);
    let failing = |c: &Condition, d: &Dataset| -> Result<FittedModel, ReplicationError> {
        if calls.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(ReplicationError::NonConvergence("iteration limit".into()));
        }
        fitter.fit(c, d)
    };

    let run = ReplicationRunner::new(&generator, &failing, 0)
        .run(0, &condition, 99, 5)
        .unwrap();
    let summary = Aggregator::default().summarize(&run).unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 1);

    let full = ReplicationRunner::new(&generator, &fitter, 0)
        .run(0, &condition, 99, 5)
        .unwrap();
    let kept: Vec<f64> = full
        .successes()
        .filter(|(index, _)| *index != 2)
        .map(|(_, stats)| stats.get("srmr").unwrap())
        .collect();
    let expected = kept.iter().sum::<f64>() / 4.0;
    assert!((summary.mean("srmr").unwrap() - expected).abs() < 1e-12);
}

// H0: A fully failed condition aborts the study
// Falsification: fail every replication of one condition
#[test]
fn h0_10_fully_failed_condition_continues() {
    let grid = ConditionGrid::build(&small_levels()).unwrap();
    let fitter = SurrogateFitter::new(PopulationModel::default());
    let failing = move |c: &Condition, d: &Dataset| -> Result<FittedModel, ReplicationError> {
        if c.sample_size == 100 && c.data_type == DataType::NonNormal {
            Err(ReplicationError::SingularCovariance("forced".into()))
        } else {
            fitter.fit(c, d)
        }
    };
    let engine = SimulationEngine::new(
        PopulationGenerator::new(PopulationModel::default()),
        failing,
        EngineConfig {
            max_retries: 1,
            ..engine_config(42, None)
        },
    );
    let table = engine.run(&grid).unwrap();

    assert_eq!(table.len(), 8);
    let failed: Vec<Condition> = table.fully_failed().map(|r| r.condition).collect();
    assert_eq!(
        failed,
        vec![
            Condition::new(100, ModelType::True, DataType::NonNormal),
            Condition::new(100, ModelType::Misspecified, DataType::NonNormal),
        ]
    );
    for row in table.fully_failed() {
        assert!(row.means.iter().all(|m| m.is_nan()));
        assert_eq!(row.retries, 6);
    }
    assert_eq!(table.rows()[7].completed, 6);

    let report = table.failure_report().to_string();
    assert!(report.contains("Fully failed conditions: 2"));
    assert!(report.contains("singular_covariance=6"));
}
