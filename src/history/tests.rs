use super::*;
use crate::schema::{DType, FieldDef, Frame, Schema, Value};

fn sim_out() -> Vec<FieldDef> {
    vec![FieldDef::new("f", DType::Float)]
}

fn gen_out() -> Vec<FieldDef> {
    vec![FieldDef::new("x", DType::Float)]
}

fn gen_frame(xs: &[f64]) -> Frame {
    let schema = Schema::new(gen_out()).unwrap();
    Frame::from_rows(
        schema,
        xs.iter().map(|&x| vec![Value::Float(x)]).collect(),
    )
    .unwrap()
}

fn sim_frame(fs: &[f64]) -> Frame {
    let schema = Schema::new(sim_out()).unwrap();
    Frame::from_rows(
        schema,
        fs.iter().map(|&f| vec![Value::Float(f)]).collect(),
    )
    .unwrap()
}

fn fresh() -> History {
    History::new(&sim_out(), &gen_out(), &[], None).unwrap()
}

#[test]
fn schema_union_carries_reserved_and_user_fields() {
    let hist = fresh();
    for name in [SIM_ID, GIVEN, GIVEN_TIME, SIM_WORKER, GEN_WORKER, RETURNED, GIVEN_BACK] {
        assert!(hist.schema().contains(name), "missing {}", name);
    }
    assert!(hist.schema().contains("x"));
    assert!(hist.schema().contains("f"));
}

#[test]
fn conflicting_user_fields_are_a_spec_error() {
    let bad_gen = vec![FieldDef::new("f", DType::Int)];
    assert!(History::new(&sim_out(), &bad_gen, &[], None).is_err());
}

#[test]
fn append_assigns_dense_sim_ids_and_gen_worker() {
    let mut hist = fresh();
    hist.append_gen_output(2, &gen_frame(&[0.5, 1.5])).unwrap();
    hist.append_gen_output(1, &gen_frame(&[2.5])).unwrap();
    assert_eq!(hist.index(), 3);
    for row in 0..3 {
        assert_eq!(
            hist.trim().get(SIM_ID, row).unwrap(),
            Value::Int(row as i64)
        );
    }
    assert_eq!(hist.trim().get(GEN_WORKER, 2).unwrap(), Value::Int(1));
    assert_eq!(hist.trim().get(GEN_WORKER, 0).unwrap(), Value::Int(2));
    assert_eq!(hist.given_count(), 0);
}

#[test]
fn dispatch_then_ingest_advances_counters() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[3.14])).unwrap();
    hist.mark_dispatched(&[0], 1);
    assert_eq!(hist.given_count(), 1);
    assert_eq!(hist.trim().get(GIVEN, 0).unwrap(), Value::Bool(true));
    assert_eq!(hist.trim().get(SIM_WORKER, 0).unwrap(), Value::Int(1));
    assert!(matches!(
        hist.trim().get(GIVEN_TIME, 0).unwrap(),
        Value::Float(t) if !t.is_nan()
    ));

    hist.ingest_sim_result(&[0], Some(&sim_frame(&[9.8596])), CalcStatus::WorkerDone)
        .unwrap();
    assert_eq!(hist.sim_count(), 1);
    assert_eq!(hist.trim().get(RETURNED, 0).unwrap(), Value::Bool(true));
    assert_eq!(hist.trim().get("f", 0).unwrap(), Value::Float(9.8596));
}

#[test]
fn failed_result_without_output_still_returns_the_row() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0])).unwrap();
    hist.mark_dispatched(&[0], 1);
    hist.ingest_sim_result(&[0], None, CalcStatus::JobFailed)
        .unwrap();
    assert_eq!(hist.sim_count(), 1);
    assert_eq!(hist.trim().get(RETURNED, 0).unwrap(), Value::Bool(true));
    assert!(matches!(
        hist.trim().get("f", 0).unwrap(),
        Value::Float(v) if v.is_nan()
    ));
}

#[test]
fn declared_calc_status_column_records_the_code() {
    let alloc_out = vec![FieldDef::new(CALC_STATUS, DType::Int)];
    let mut hist = History::new(&sim_out(), &gen_out(), &alloc_out, None).unwrap();
    hist.append_gen_output(1, &gen_frame(&[1.0])).unwrap();
    hist.mark_dispatched(&[0], 1);
    hist.ingest_sim_result(&[0], None, CalcStatus::JobFailed)
        .unwrap();
    assert_eq!(
        hist.trim().get(CALC_STATUS, 0).unwrap(),
        Value::Int(CalcStatus::JobFailed.code())
    );
}

#[test]
#[should_panic(expected = "dispatched twice")]
fn double_dispatch_panics() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0])).unwrap();
    hist.mark_dispatched(&[0], 1);
    hist.mark_dispatched(&[0], 2);
}

#[test]
#[should_panic(expected = "never dispatched")]
fn ingest_before_dispatch_panics() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0])).unwrap();
    let _ = hist.ingest_sim_result(&[0], None, CalcStatus::WorkerDone);
}

#[test]
#[should_panic(expected = "before returning")]
fn hand_back_before_return_panics() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0])).unwrap();
    hist.mark_dispatched(&[0], 1);
    hist.mark_given_back(&[0]);
}

#[test]
fn seed_history_sets_offset_and_counters() {
    let schema = Schema::new(vec![
        FieldDef::new("x", DType::Float),
        FieldDef::new("f", DType::Float),
        FieldDef::new(RETURNED, DType::Bool),
    ])
    .unwrap();
    let seed = Frame::from_rows(
        schema,
        vec![
            vec![Value::Float(0.1), Value::Float(1.0), Value::Bool(true)],
            vec![Value::Float(0.2), Value::Float(2.0), Value::Bool(true)],
        ],
    )
    .unwrap();
    let hist = History::new(&sim_out(), &gen_out(), &[], Some(&seed)).unwrap();
    assert_eq!(hist.offset(), 2);
    assert_eq!(hist.index(), 2);
    assert_eq!(hist.given_count(), 2);
    assert_eq!(hist.sim_count(), 2);
    assert_eq!(hist.trim().get(SIM_ID, 1).unwrap(), Value::Int(1));
    assert_eq!(hist.trim().get(GIVEN, 0).unwrap(), Value::Bool(true));
}

#[test]
fn seed_with_unreturned_rows_is_rejected() {
    let schema = Schema::new(vec![
        FieldDef::new("x", DType::Float),
        FieldDef::new(RETURNED, DType::Bool),
    ])
    .unwrap();
    let seed = Frame::from_rows(
        schema,
        vec![vec![Value::Float(0.1), Value::Bool(false)]],
    )
    .unwrap();
    assert!(History::new(&sim_out(), &gen_out(), &[], Some(&seed)).is_err());
}

#[test]
fn seed_with_foreign_fields_is_rejected() {
    let schema = Schema::new(vec![
        FieldDef::new("bogus", DType::Float),
        FieldDef::new(RETURNED, DType::Bool),
    ])
    .unwrap();
    let seed = Frame::from_rows(
        schema,
        vec![vec![Value::Float(0.1), Value::Bool(true)]],
    )
    .unwrap();
    assert!(History::new(&sim_out(), &gen_out(), &[], Some(&seed)).is_err());
}

#[test]
fn stop_value_ignores_nan_and_finds_threshold() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0, 2.0])).unwrap();
    hist.mark_dispatched(&[0, 1], 1);
    hist.ingest_sim_result(&[0], Some(&sim_frame(&[f64::NAN])), CalcStatus::WorkerDone)
        .unwrap();
    assert!(!hist.stop_value_reached("f", 0.5));
    hist.ingest_sim_result(&[1], Some(&sim_frame(&[0.25])), CalcStatus::WorkerDone)
        .unwrap();
    assert!(hist.stop_value_reached("f", 0.5));
    assert!(!hist.stop_value_reached("missing", 0.5));
}

#[test]
fn row_selection_helpers() {
    let mut hist = fresh();
    hist.append_gen_output(1, &gen_frame(&[1.0, 2.0, 3.0])).unwrap();
    hist.mark_dispatched(&[0, 2], 1);
    assert_eq!(hist.undispatched_rows(), vec![1]);
    hist.ingest_sim_result(&[0], Some(&sim_frame(&[1.0])), CalcStatus::WorkerDone)
        .unwrap();
    assert_eq!(hist.returned_not_given_back(1), vec![0]);
    hist.mark_given_back(&[0]);
    assert!(hist.returned_not_given_back(1).is_empty());
    assert!(hist.returned_not_given_back(2).is_empty());
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Drive a random interleaving of appends, dispatches, ingests, and
    // hand-backs; the per-row state must only ever step forward and the
    // counters must match a recount of the columns.
    proptest! {
        #[test]
        fn counters_match_column_recounts(ops in proptest::collection::vec(0..4u8, 1..60)) {
            let mut hist = fresh();
            for op in ops {
                match op {
                    0 => hist.append_gen_output(1, &gen_frame(&[0.0])).unwrap(),
                    1 => {
                        if let Some(&row) = hist.undispatched_rows().first() {
                            hist.mark_dispatched(&[row], 1);
                        }
                    }
                    2 => {
                        let pending: Vec<usize> = (0..hist.index())
                            .filter(|&r| {
                                hist.trim().get(GIVEN, r).unwrap() == Value::Bool(true)
                                    && hist.trim().get(RETURNED, r).unwrap() == Value::Bool(false)
                            })
                            .collect();
                        if let Some(&row) = pending.first() {
                            hist.ingest_sim_result(&[row], Some(&sim_frame(&[1.0])), CalcStatus::WorkerDone)
                                .unwrap();
                        }
                    }
                    _ => {
                        if let Some(&row) = hist.returned_not_given_back(1).first() {
                            hist.mark_given_back(&[row]);
                        }
                    }
                }

                let given = (0..hist.index())
                    .filter(|&r| hist.trim().get(GIVEN, r).unwrap() == Value::Bool(true))
                    .count();
                let returned = (0..hist.index())
                    .filter(|&r| hist.trim().get(RETURNED, r).unwrap() == Value::Bool(true))
                    .count();
                prop_assert_eq!(hist.given_count(), given);
                prop_assert_eq!(hist.sim_count(), returned);

                for r in 0..hist.index() {
                    let g = hist.trim().get(GIVEN, r).unwrap() == Value::Bool(true);
                    let ret = hist.trim().get(RETURNED, r).unwrap() == Value::Bool(true);
                    let gb = hist.trim().get(GIVEN_BACK, r).unwrap() == Value::Bool(true);
                    prop_assert!(!gb || ret, "given_back implies returned");
                    prop_assert!(!ret || g, "returned implies given");
                    prop_assert_eq!(
                        hist.trim().get(SIM_ID, r).unwrap(),
                        Value::Int(r as i64)
                    );
                }
            }
        }
    }
}
