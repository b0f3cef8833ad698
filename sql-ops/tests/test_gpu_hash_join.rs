// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod common;

use common::*;
use datagen::relation::UniformRelation;
use device_runtime::Device;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sql_ops::data_store::ColumnMeta;
use sql_ops::error::{ErrorKind, Result as OpsResult};
use sql_ops::eval::{ExprEvaluator, HostEvaluator, TupleAccess};
use sql_ops::expr::{BinaryOp, Expr, TargetEntry};
use sql_ops::join::codegen::CodegenContext;
use sql_ops::join::multi_hash::MultiHashWriter;
use sql_ops::join::{
    DepthClauses, DeviceCodeTranslator, ExplainOptions, GpuHashJoin, GpuHashJoinConfig,
    GpuHashJoinPlanner, GpuHashJoinStrategy, InnerRelationSpec, JoinSpec, OuterRelationSpec,
};
use sql_ops::types::{Datum, TypeInfo};
use std::error::Error;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn small_relations() -> (Vec<KeyValue>, Vec<KeyValue>) {
    let outer = vec![key_value(1, "a"), key_value(2, "b"), key_value(3, "c")];
    let inner = vec![key_value(1, "x"), key_value(2, "y"), key_value(2, "z")];
    (outer, inner)
}

#[test]
fn two_way_join_returns_all_matches() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 3.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let rows = collect_rows(&mut join)?;
    let keys: Vec<_> = rows.iter().map(|row| row[0].clone()).collect();
    assert_eq!(keys, vec![Datum::Int4(1), Datum::Int4(2), Datum::Int4(2)]);
    assert_eq!(
        rows[0],
        vec![Datum::Int4(1), Datum::Text("a".into()), Datum::Text("x".into())]
    );

    let rows = sorted(rows);
    let expected = vec![
        vec![Datum::Int4(1), Datum::Text("a".into()), Datum::Text("x".into())],
        vec![Datum::Int4(2), Datum::Text("b".into()), Datum::Text("y".into())],
        vec![Datum::Int4(2), Datum::Text("b".into()), Datum::Text("z".into())],
    ];
    assert_eq!(rows, expected);
    assert_eq!(rows, reference_join(&outer, &inner));

    Ok(())
}

/// Joins two relations on their keys. The target list and the clauses
/// compute values from both relations.
fn computed_spec(
    outer: &[KeyValue],
    inner: &[KeyValue],
) -> Result<(JoinSpec, Vec<Expr>), Box<dyn Error>> {
    let int4 = |v: i32| Expr::Const(Datum::Int4(v), TypeInfo::int4());
    let hash = Expr::equal(key(1), key(2));
    let qual = Expr::binary(BinaryOp::Lt, key(1), int4(4));
    let host = Expr::binary(BinaryOp::Ne, value(2), value(1));

    let tlist = vec![
        TargetEntry::new(Expr::binary(BinaryOp::Add, key(1), key(2)), "key_sum"),
        TargetEntry::new(Expr::binary(BinaryOp::Mul, key(2), int4(10)), "key_times_ten"),
        TargetEntry::new(value(2), "r2_value"),
        TargetEntry::new(value(1), "r1_value"),
    ];
    let spec = JoinSpec {
        outer: OuterRelationSpec {
            source: Box::new(relation(outer)?),
            tlist: relation_tlist(1),
        },
        inners: vec![InnerRelationSpec {
            source: Box::new(relation(inner)?),
            tlist: relation_tlist(2),
            clauses: DepthClauses {
                hash: vec![hash.clone()],
                qual: vec![qual.clone()],
                host: vec![host.clone()],
            },
        }],
        tlist,
        join_rows: outer.len() as f64,
    };
    Ok((spec, vec![hash, qual, host]))
}

fn computed_join(outer: &[KeyValue], inner: &[KeyValue]) -> Result<(), Box<dyn Error>> {
    let (spec, clauses) = computed_spec(outer, inner)?;
    let tlist = spec.tlist.clone();
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let rows = sorted(collect_rows(&mut join)?);
    let expected = reference_rows(outer, inner, &clauses, &tlist)?;
    assert_eq!(rows, expected);

    Ok(())
}

#[test]
fn computed_columns_equal_direct_evaluation() -> Result<(), Box<dyn Error>> {
    let values = ["a", "b", "c"];
    let outer: Vec<_> = (0..30)
        .map(|i| key_value(i % 6, values[i as usize % 3]))
        .collect();
    let inner: Vec<_> = (0..18)
        .map(|i| key_value(i % 6, values[i as usize % 2]))
        .collect();

    computed_join(&outer, &inner)
}

#[test]
fn null_keys_never_match() -> Result<(), Box<dyn Error>> {
    let outer = vec![(None, "a".to_string()), key_value(1, "b")];
    let inner = vec![(None, "x".to_string()), key_value(1, "y")];
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 1.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let rows = sorted(collect_rows(&mut join)?);
    assert_eq!(rows, reference_join(&outer, &inner));
    assert_eq!(rows.len(), 1);

    Ok(())
}

#[test]
fn chain_without_matches_at_last_depth_is_empty() -> Result<(), Box<dyn Error>> {
    let first = (0..10).map(|k| key_value(k, "o")).collect::<Vec<_>>();
    let second = (0..10).map(|k| key_value(k, "m")).collect::<Vec<_>>();
    let third = (100..110).map(|k| key_value(k, "i")).collect::<Vec<_>>();
    let spec = chain_spec(
        vec![relation(&first)?, relation(&second)?, relation(&third)?],
        10.0,
    );
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    assert!(collect_rows(&mut join)?.is_empty());
    assert!(join.next_row()?.is_none());

    Ok(())
}

#[test]
fn three_way_chain_follows_every_depth() -> Result<(), Box<dyn Error>> {
    let first = vec![key_value(1, "a"), key_value(2, "b"), key_value(3, "c")];
    let second = vec![key_value(1, "m"), key_value(3, "n"), key_value(3, "o")];
    let third = vec![key_value(3, "x"), key_value(1, "y")];
    let spec = chain_spec(
        vec![relation(&first)?, relation(&second)?, relation(&third)?],
        3.0,
    );
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let text = |s: &str| Datum::Text(s.to_string());
    let expected = sorted(vec![
        vec![Datum::Int4(1), text("a"), text("m"), text("y")],
        vec![Datum::Int4(3), text("c"), text("n"), text("x")],
        vec![Datum::Int4(3), text("c"), text("o"), text("x")],
    ]);
    assert_eq!(sorted(collect_rows(&mut join)?), expected);

    Ok(())
}

#[test]
fn host_columns_form_a_dense_prefix() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 3.0);
    let plan = planner(GpuHashJoinConfig::default()).plan(spec)?;
    let schema = &plan.description.schema;

    schema.check_dense_prefix()?;
    assert_eq!(schema.nhost(), 3);
    let device_only: Vec<_> = schema
        .entries()
        .iter()
        .filter(|e| !e.ref_host)
        .map(|e| e.resname.as_str())
        .collect();
    assert_eq!(device_only, vec!["r2_key"]);
    assert!(plan.description.is_pseudo_tlist());

    Ok(())
}

#[test]
fn bulk_batches_equal_row_results() -> Result<(), Box<dyn Error>> {
    let outer = (0..500).map(|k| key_value(k % 50, "o")).collect::<Vec<_>>();
    let inner = (0..100).map(|k| key_value(k % 25, "i")).collect::<Vec<_>>();
    let config = GpuHashJoinConfig::default().chunk_size(2048);

    let spec = chain_spec(vec![relation(&outer)?.with_bulk(), relation(&inner)?], 1000.0);
    let mut bulk_join = hash_join(spec, config.clone())?;
    assert!(bulk_join.supports_bulk());
    let bulk = sorted(collect_bulk(&mut bulk_join)?);

    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 1000.0);
    let mut row_join = hash_join(spec, config)?;
    let rows = sorted(collect_rows(&mut row_join)?);

    assert_eq!(bulk, rows);
    assert_eq!(rows, reference_join(&outer, &inner));
    assert!(bulk_join.perfmon().num_sessions > 1);

    Ok(())
}

#[test]
fn bulk_filter_hides_rows() -> Result<(), Box<dyn Error>> {
    let outer = (0..20).map(|k| key_value(k, "o")).collect::<Vec<_>>();
    let inner = (0..20).map(|k| key_value(k, "i")).collect::<Vec<_>>();
    let outer_relation = relation(&outer)?.with_bulk_filter(|row| row[0] == Datum::Int4(7));
    let spec = chain_spec(vec![outer_relation, relation(&inner)?], 20.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let rows = collect_rows(&mut join)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Datum::Int4(7));

    Ok(())
}

#[test]
fn divided_hash_buffer_joins_like_single_buffer() -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(5);
    let mut keys = vec![0_i32; 1000];
    UniformRelation::gen_primary_key(&mut keys, None, &mut rng)?;
    let inner: Vec<_> = keys.iter().map(|&k| key_value(k, "inner")).collect();
    let outer: Vec<_> = (0..400).map(|k| key_value(k * 3, "outer")).collect();

    let config = GpuHashJoinConfig::default()
        .max_alloc_size(16 * 1024)
        .min_hashtable_size(1024);
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 400.0);
    let mut join = hash_join(spec, config)?;
    assert!(join.description().estimate.numbatches > 1);

    let rows = sorted(collect_rows(&mut join)?);
    assert_eq!(rows, reference_join(&outer, &inner));

    Ok(())
}

#[test]
fn divided_hash_buffer_requires_rewindable_outer() -> Result<(), Box<dyn Error>> {
    let outer = (0..10).map(|k| key_value(k, "o")).collect::<Vec<_>>();
    let inner = (0..1000).map(|k| key_value(k, "i")).collect::<Vec<_>>();
    let config = GpuHashJoinConfig::default()
        .max_alloc_size(16 * 1024)
        .min_hashtable_size(1024);
    let spec = chain_spec(
        vec![relation(&outer)?.non_rewindable(), relation(&inner)?],
        10.0,
    );
    let mut join = hash_join(spec, config)?;

    match join.next_row() {
        Err(e) => assert!(matches!(e.kind(), ErrorKind::InvalidArgument(_))),
        Ok(_) => panic!("joined a non-rewindable outer relation with a divided hash buffer"),
    }

    Ok(())
}

#[test]
fn result_overflow_is_retried() -> Result<(), Box<dyn Error>> {
    let outer = (0..10).map(|k| key_value(k, "o")).collect::<Vec<_>>();
    let inner = (0..30).map(|k| key_value(k % 10, "i")).collect::<Vec<_>>();
    let config = GpuHashJoinConfig::default().row_population_margin(0.5);
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 10.0);
    let mut join = hash_join(spec, config)?;

    let rows = sorted(collect_rows(&mut join)?);
    assert_eq!(rows.len(), 30);
    assert_eq!(rows, reference_join(&outer, &inner));
    assert_eq!(join.perfmon().num_sessions, 1);
    assert_eq!(join.perfmon().num_retries, 1);

    Ok(())
}

#[test]
fn rescan_reuses_complete_hash_buffer() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let inner_relation = relation(&inner)?;
    let inner_reads = inner_relation.read_counter();
    let spec = chain_spec(vec![relation(&outer)?, inner_relation], 3.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let first = sorted(collect_rows(&mut join)?);
    assert_eq!(inner_reads.load(Ordering::SeqCst), inner.len());

    join.rescan(&[])?;
    let second = sorted(collect_rows(&mut join)?);
    assert_eq!(first, second);
    assert_eq!(inner_reads.load(Ordering::SeqCst), inner.len());

    Ok(())
}

#[test]
fn rescan_reloads_on_changed_inner_param() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let inner_relation = relation(&inner)?.with_param_deps(vec![1]);
    let inner_reads = inner_relation.read_counter();
    let spec = chain_spec(vec![relation(&outer)?, inner_relation], 3.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let first = sorted(collect_rows(&mut join)?);
    join.set_param(1, Datum::Int4(42));
    join.rescan(&[1])?;
    let second = sorted(collect_rows(&mut join)?);

    assert_eq!(first, second);
    assert_eq!(inner_reads.load(Ordering::SeqCst), 2 * inner.len());

    Ok(())
}

#[test]
fn concurrent_sessions_share_one_upload() -> Result<(), Box<dyn Error>> {
    let mut writer = MultiHashWriter::new(4096, 1);
    writer.begin_table(1, &[ColumnMeta::of(&TypeInfo::int4())], 4)?;
    writer.insert(7, &[0, 1, 0, 0, 0])?;
    writer.end_table()?;
    let buffer = Arc::new(writer.freeze()?);

    let nthreads = 8;
    let barrier = Arc::new(Barrier::new(nthreads));
    let handles: Vec<_> = (0..nthreads)
        .map(|_| {
            let buffer = buffer.clone();
            let barrier = barrier.clone();
            let device = DEVICE.clone();
            thread::spawn(move || -> OpsResult<()> {
                let token = buffer.acquire_device(&device)?;
                // All tokens are held at the same time
                barrier.wait();
                token.ready().wait()?;
                barrier.wait();
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("session thread panicked")?;
    }

    assert_eq!(buffer.upload_count(), 1);
    assert_eq!(buffer.resident_sessions(), 0);

    Ok(())
}

#[test]
fn explain_shows_buckets_and_device_only_columns() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 3.0);
    let mut join = hash_join(spec, GpuHashJoinConfig::default())?;

    let plan = join.explain(ExplainOptions::default());
    assert!(plan.starts_with("GpuHashJoin\n"));
    assert!(plan.contains("Buckets: "));
    assert!(plan.contains("(r2_key)"));
    assert!(plan.contains("Bulkload: On"));
    assert!(!plan.contains("Kernel source"));

    collect_rows(&mut join)?;
    let analyzed = join.explain(ExplainOptions {
        verbose: true,
        analyze: true,
    });
    assert!(analyzed.contains("Kernel source"));
    assert!(analyzed.contains("Sessions: 1 (retried: 0)"));

    Ok(())
}

/// Emits code that doesn't compile.
struct UnbalancedTranslator;

impl DeviceCodeTranslator for UnbalancedTranslator {
    fn translate(&self, _expr: &Expr, _ctx: &mut CodegenContext) -> OpsResult<String> {
        Ok("(".to_string())
    }
}

#[test]
fn compile_failure_reports_source_and_log() -> Result<(), Box<dyn Error>> {
    let (outer, inner) = small_relations();
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 3.0);
    let planner = GpuHashJoinPlanner::new(
        vec![Arc::new(GpuHashJoinStrategy)],
        Arc::new(UnbalancedTranslator),
        GpuHashJoinConfig::default(),
    );
    let plan = planner.plan(spec)?;

    match GpuHashJoin::new(plan, &DEVICE, Arc::new(HostEvaluator)) {
        Err(e) => match e.kind() {
            ErrorKind::KernelCompile { source, build_log } => {
                assert!(source.contains("("));
                assert!(!build_log.is_empty());
            }
            other => panic!("expected a compile error, got {:?}", other),
        },
        Ok(_) => panic!("built a program with unbalanced brackets"),
    }

    Ok(())
}

/// Delays every evaluation.
struct SlowEvaluator {
    delay: Duration,
}

impl ExprEvaluator for SlowEvaluator {
    fn eval(&self, expr: &Expr, tuple: &dyn TupleAccess) -> OpsResult<Datum> {
        thread::sleep(self.delay);
        HostEvaluator.eval(expr, tuple)
    }
}

#[test]
fn slow_session_times_out() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().name("slow device").build()?;
    let (outer, inner) = small_relations();
    let spec = chain_spec(vec![relation(&outer)?, relation(&inner)?], 3.0);
    let config = GpuHashJoinConfig::default().queue_timeout(Duration::from_millis(1));
    let plan = planner(config).plan(spec)?;
    let evaluator = Arc::new(SlowEvaluator {
        delay: Duration::from_millis(50),
    });
    let mut join = GpuHashJoin::new(plan, &device, evaluator)?;

    match join.next_row() {
        Err(e) => assert!(matches!(e.kind(), ErrorKind::Timeout(_))),
        Ok(_) => panic!("session finished within the timeout"),
    }
    assert_eq!(join.num_running(), 0);

    Ok(())
}

fn grown_join(outer: &[KeyValue], inner: &[KeyValue]) -> Result<Vec<sql_ops::types::Row>, Box<dyn Error>> {
    // Underestimate the inner relation, so that the hash buffer must grow
    let inner_relation = relation(inner)?.with_estimates(1.0, 8);
    let config = GpuHashJoinConfig::default().min_hashtable_size(1024);
    let spec = chain_spec(vec![relation(outer)?, inner_relation], outer.len() as f64);
    let mut join = hash_join(spec, config)?;
    Ok(sorted(collect_rows(&mut join)?))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn growing_hash_buffer_preserves_matches(
        outer_keys in prop::collection::vec(0..3000_i32, 1..200),
        inner_len in 1500_usize..2500,
        duplicates in 1_i32..3,
    ) {
        let outer: Vec<_> = outer_keys.iter().map(|&k| key_value(k, "o")).collect();
        let inner: Vec<_> = (0..inner_len as i32)
            .map(|k| key_value(k / duplicates, "i"))
            .collect();

        let rows = grown_join(&outer, &inner).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(rows, reference_join(&outer, &inner));
    }

    #[test]
    fn computed_columns_follow_their_sources(
        outer in prop::collection::vec(
            (prop::option::weighted(0.9, 0..8_i32), prop::sample::select(vec!["a", "b", "c"])),
            1..60,
        ),
        inner in prop::collection::vec(
            (prop::option::weighted(0.9, 0..8_i32), prop::sample::select(vec!["a", "b", "c"])),
            1..40,
        ),
    ) {
        let outer: Vec<KeyValue> = outer.into_iter().map(|(k, v)| (k, v.to_string())).collect();
        let inner: Vec<KeyValue> = inner.into_iter().map(|(k, v)| (k, v.to_string())).collect();

        computed_join(&outer, &inner).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }
}
