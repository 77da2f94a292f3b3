//! CSV persistence of history frames.
//!
//! Snapshots are write-once: an existing file is never overwritten, so a
//! run that crosses the same counter boundary twice keeps the first image.

use crate::error::EnsembleError;
use crate::schema::{Frame, Value};
use std::path::{Path, PathBuf};

pub const AFTER_SIM_STEM: &str = "ensemble_history_after_sim";
pub const AFTER_GEN_STEM: &str = "ensemble_history_after_gen";
pub const AT_ABORT_STEM: &str = "ensemble_history_at_abort";

fn cell(value: &Value) -> String {
    match value {
        Value::Bool(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Str(v) => v.clone(),
        Value::FloatArr(v) => v
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(";"),
        Value::IntArr(v) => v
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(";"),
    }
}

/// Write `frame` to `path` as CSV, one record per row.
pub fn save_frame(path: &Path, frame: &Frame) -> Result<(), EnsembleError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    let names: Vec<&str> = frame
        .schema()
        .fields()
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    writer.write_record(&names).map_err(csv_err)?;
    for row in 0..frame.len() {
        let record: Vec<String> = frame
            .schema()
            .fields()
            .iter()
            .map(|f| cell(&frame.get(&f.name, row).expect("row in range")))
            .collect();
        writer.write_record(&record).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_err(err: csv::Error) -> EnsembleError {
    EnsembleError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

/// Snapshot `frame` at the last multiple of `k` at or below `count`.
///
/// Nothing is written when the rounded count is zero or the target file
/// already exists. Returns the path written, if any.
pub fn save_every_k(
    dir: &Path,
    stem: &str,
    frame: &Frame,
    count: usize,
    k: usize,
) -> Result<Option<PathBuf>, EnsembleError> {
    let count = k * (count / k.max(1));
    if count == 0 {
        return Ok(None);
    }
    let path = dir.join(format!("{}_{}.csv", stem, count));
    if path.is_file() {
        return Ok(None);
    }
    save_frame(&path, frame)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DType, FieldDef, Schema};

    fn small_frame() -> Frame {
        let schema = Schema::new(vec![
            FieldDef::new("x", DType::Float),
            FieldDef::new("v", DType::IntArr(2)),
        ])
        .unwrap();
        Frame::from_rows(
            schema,
            vec![
                vec![Value::Float(1.5), Value::IntArr(vec![1, 2])],
                vec![Value::Float(f64::NAN), Value::IntArr(vec![3, 4])],
            ],
        )
        .unwrap()
    }

    #[test]
    fn save_frame_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hist.csv");
        save_frame(&path, &small_frame()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("x,v"));
        assert_eq!(lines.next(), Some("1.5,1;2"));
        assert_eq!(lines.next(), Some("NaN,3;4"));
    }

    #[test]
    fn save_every_k_rounds_down_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let frame = small_frame();

        // Below the first boundary: nothing written.
        assert!(save_every_k(dir.path(), AFTER_SIM_STEM, &frame, 2, 3)
            .unwrap()
            .is_none());

        let path = save_every_k(dir.path(), AFTER_SIM_STEM, &frame, 7, 3)
            .unwrap()
            .expect("first boundary crossing writes");
        assert!(path.ends_with("ensemble_history_after_sim_6.csv"));

        // Same boundary again: the existing file wins.
        std::fs::write(&path, "sentinel").unwrap();
        assert!(save_every_k(dir.path(), AFTER_SIM_STEM, &frame, 8, 3)
            .unwrap()
            .is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sentinel");
    }
}
