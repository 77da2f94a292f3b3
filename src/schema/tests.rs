use super::*;

fn xy_schema() -> Schema {
    Schema::new(vec![
        FieldDef::new("x", DType::Float),
        FieldDef::new("n", DType::Int),
        FieldDef::new("flag", DType::Bool),
        FieldDef::new("v", DType::FloatArr(3)),
    ])
    .unwrap()
}

#[test]
fn union_collapses_identical_duplicates() {
    let a = [
        FieldDef::new("x", DType::Float),
        FieldDef::new("f", DType::Float),
    ];
    let b = [
        FieldDef::new("x", DType::Float),
        FieldDef::new("sim_id", DType::Int),
    ];
    let schema = Schema::union(&[&a, &b]).unwrap();
    assert_eq!(schema.len(), 3);
    assert_eq!(schema.position("x"), Some(0));
    assert_eq!(schema.position("sim_id"), Some(2));
}

#[test]
fn union_rejects_conflicting_dtypes() {
    let a = [FieldDef::new("x", DType::Float)];
    let b = [FieldDef::new("x", DType::Int)];
    match Schema::union(&[&a, &b]) {
        Err(SchemaError::Conflict { name, .. }) => assert_eq!(name, "x"),
        other => panic!("expected conflict, got {:?}", other.map(|s| s.len())),
    }
}

#[test]
fn frame_defaults_per_dtype() {
    let mut frame = Frame::new(xy_schema());
    frame.push_default_row();
    assert!(matches!(frame.get("x", 0).unwrap(), Value::Float(v) if v.is_nan()));
    assert_eq!(frame.get("n", 0).unwrap(), Value::Int(0));
    assert_eq!(frame.get("flag", 0).unwrap(), Value::Bool(false));
    assert!(matches!(frame.get("v", 0).unwrap(), Value::FloatArr(v) if v.len() == 3));
}

#[test]
fn frame_set_rejects_dtype_mismatch() {
    let mut frame = Frame::new(xy_schema());
    frame.push_default_row();
    let err = frame.set("n", 0, &Value::Float(1.0)).unwrap_err();
    assert!(matches!(err, SchemaError::DTypeMismatch { .. }));
    let err = frame.set("v", 0, &Value::FloatArr(vec![1.0])).unwrap_err();
    assert!(matches!(err, SchemaError::DTypeMismatch { .. }));
}

#[test]
fn frame_slice_projects_fields_and_rows() {
    let schema = xy_schema();
    let mut frame = Frame::new(schema);
    for i in 0..4 {
        let row = frame.push_default_row();
        frame.set("x", row, &Value::Float(i as f64)).unwrap();
        frame.set("n", row, &Value::Int(i as i64 * 10)).unwrap();
    }
    let slice = frame
        .slice(&["n".to_string(), "x".to_string()], &[3, 1])
        .unwrap();
    assert_eq!(slice.len(), 2);
    assert_eq!(slice.schema().fields()[0].name, "n");
    assert_eq!(slice.get("n", 0).unwrap(), Value::Int(30));
    assert_eq!(slice.get("x", 1).unwrap(), Value::Float(1.0));
}

#[test]
fn frame_slice_rejects_unknown_field_and_bad_row() {
    let mut frame = Frame::new(xy_schema());
    frame.push_default_row();
    assert!(matches!(
        frame.slice(&["nope".to_string()], &[0]),
        Err(SchemaError::UnknownField(_))
    ));
    assert!(matches!(
        frame.slice(&["x".to_string()], &[5]),
        Err(SchemaError::RowOutOfRange { .. })
    ));
}

#[test]
fn schema_round_trips_through_serde() {
    let schema = xy_schema();
    let json = serde_json::to_string(&schema).unwrap();
    let back: Schema = serde_json::from_str(&json).unwrap();
    assert_eq!(back.fields(), schema.fields());
    assert_eq!(back.position("v"), Some(3));
}

#[test]
fn frame_round_trips_through_serde() {
    let mut frame = Frame::new(xy_schema());
    let row = frame.push_default_row();
    frame.set("x", row, &Value::Float(3.5)).unwrap();
    frame
        .set("v", row, &Value::FloatArr(vec![1.0, 2.0, 3.0]))
        .unwrap();
    let json = serde_json::to_string(&frame).unwrap();
    let back: Frame = serde_json::from_str(&json).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back.get("x", 0).unwrap(), Value::Float(3.5));
    assert_eq!(
        back.get("v", 0).unwrap(),
        Value::FloatArr(vec![1.0, 2.0, 3.0])
    );
}
