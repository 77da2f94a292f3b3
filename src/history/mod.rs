//! The append-only history of every point proposed and evaluated in a run.
//!
//! Rows are appended by generator output and never reordered; per-row state
//! advances monotonically from undispatched, to given, to returned, to
//! given back. Violating that order is a programmer error and panics: the
//! coordination loop cannot continue over a corrupt history.

pub mod snapshot;
#[cfg(test)]
mod tests;

use crate::comms::CalcStatus;
use crate::error::EnsembleError;
use crate::registry::WorkerId;
use crate::schema::{DType, FieldDef, Frame, Schema, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SIM_ID: &str = "sim_id";
pub const GIVEN: &str = "given";
pub const GIVEN_TIME: &str = "given_time";
pub const SIM_WORKER: &str = "sim_worker";
pub const GEN_WORKER: &str = "gen_worker";
pub const RETURNED: &str = "returned";
pub const GIVEN_BACK: &str = "given_back";
/// Optional user column; when declared, each ingested row records the
/// worker-reported status code.
pub const CALC_STATUS: &str = "calc_status";

/// The columns every history carries, ahead of user-declared output fields.
pub fn reserved_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(SIM_ID, DType::Int),
        FieldDef::new(GIVEN, DType::Bool),
        FieldDef::new(GIVEN_TIME, DType::Float),
        FieldDef::new(SIM_WORKER, DType::Int),
        FieldDef::new(GEN_WORKER, DType::Int),
        FieldDef::new(RETURNED, DType::Bool),
        FieldDef::new(GIVEN_BACK, DType::Bool),
    ]
}

fn wallclock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The history table `H` and the counters carried alongside it.
#[derive(Debug)]
pub struct History {
    frame: Frame,
    index: usize,
    given_count: usize,
    sim_count: usize,
    offset: usize,
}

impl History {
    /// Build the history schema from the union of the reserved columns and
    /// the user-declared output fields, then prepend the seed history.
    ///
    /// The seed must consist entirely of returned points and declare only
    /// fields the assembled schema carries, with matching dtypes.
    pub fn new(
        sim_out: &[FieldDef],
        gen_out: &[FieldDef],
        alloc_out: &[FieldDef],
        seed: Option<&Frame>,
    ) -> Result<Self, EnsembleError> {
        let reserved = reserved_fields();
        let schema = Schema::union(&[&reserved, sim_out, gen_out, alloc_out])
            .map_err(|e| EnsembleError::Spec(e.to_string()))?;
        let mut hist = Self {
            frame: Frame::new(schema),
            index: 0,
            given_count: 0,
            sim_count: 0,
            offset: 0,
        };
        if let Some(seed) = seed {
            hist.prepend_seed(seed)?;
        }
        Ok(hist)
    }

    fn prepend_seed(&mut self, seed: &Frame) -> Result<(), EnsembleError> {
        if !seed.schema().compatible_subset_of(self.frame.schema()) {
            return Err(EnsembleError::Spec(
                "seed history declares fields the run schema does not carry".into(),
            ));
        }
        let returned = seed.column(RETURNED).ok_or_else(|| {
            EnsembleError::Spec("seed history has no 'returned' column".into())
        })?;
        for row in 0..seed.len() {
            if returned.get(row) != Value::Bool(true) {
                return Err(EnsembleError::Spec(format!(
                    "seed history row {} is unreturned",
                    row
                )));
            }
        }
        let now = wallclock();
        for row in 0..seed.len() {
            let at = self.frame.push_default_row();
            for field in seed.schema().fields() {
                let value = seed.get(&field.name, row).expect("validated field");
                self.frame.set(&field.name, at, &value).expect("validated dtype");
            }
            // Seed rows are fully evaluated; re-key them into this run.
            self.set_unchecked(SIM_ID, at, Value::Int(at as i64));
            self.set_unchecked(GIVEN, at, Value::Bool(true));
            self.set_unchecked(RETURNED, at, Value::Bool(true));
            if self.float(GIVEN_TIME, at).is_nan() {
                self.set_unchecked(GIVEN_TIME, at, Value::Float(now));
            }
        }
        self.index = seed.len();
        self.offset = seed.len();
        self.given_count = seed.len();
        self.sim_count = seed.len();
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        self.frame.schema()
    }

    pub fn len(&self) -> usize {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.index == 0
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn given_count(&self) -> usize {
        self.given_count
    }

    pub fn sim_count(&self) -> usize {
        self.sim_count
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The valid rows. Appends are dense, so this is the whole frame.
    pub fn trim(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    fn bool(&self, field: &str, row: usize) -> bool {
        self.frame
            .get(field, row)
            .ok()
            .and_then(|v| v.as_bool())
            .expect("reserved bool column")
    }

    fn float(&self, field: &str, row: usize) -> f64 {
        self.frame
            .get(field, row)
            .ok()
            .and_then(|v| v.as_float())
            .expect("reserved float column")
    }

    fn set_unchecked(&mut self, field: &str, row: usize, value: Value) {
        self.frame
            .set(field, row, &value)
            .expect("reserved column write");
    }

    /// Append generator output, assigning consecutive `sim_id`s from the
    /// current index and stamping the producing worker.
    pub fn append_gen_output(
        &mut self,
        gen_worker: WorkerId,
        out: &Frame,
    ) -> Result<(), EnsembleError> {
        if !out.schema().compatible_subset_of(self.frame.schema()) {
            return Err(EnsembleError::Spec(format!(
                "generator output from worker {} declares fields outside the run schema",
                gen_worker
            )));
        }
        for row in 0..out.len() {
            let at = self.frame.push_default_row();
            assert_eq!(at, self.index, "history grew outside append");
            for field in out.schema().fields() {
                if is_reserved(&field.name) {
                    continue;
                }
                let value = out.get(&field.name, row).expect("validated field");
                self.frame.set(&field.name, at, &value)?;
            }
            self.set_unchecked(SIM_ID, at, Value::Int(at as i64));
            self.set_unchecked(GEN_WORKER, at, Value::Int(gen_worker as i64));
            self.index += 1;
        }
        Ok(())
    }

    /// Mark `rows` dispatched to a simulator on `sim_worker`.
    pub fn mark_dispatched(&mut self, rows: &[usize], sim_worker: WorkerId) {
        let now = wallclock();
        for &row in rows {
            assert!(row < self.index, "dispatch of row {} beyond index", row);
            assert!(
                !self.bool(GIVEN, row),
                "row {} dispatched twice",
                row
            );
            self.set_unchecked(GIVEN, row, Value::Bool(true));
            self.set_unchecked(GIVEN_TIME, row, Value::Float(now));
            self.set_unchecked(SIM_WORKER, row, Value::Int(sim_worker as i64));
            self.given_count += 1;
        }
    }

    /// Mark `rows` handed back to a persistent generator.
    pub fn mark_given_back(&mut self, rows: &[usize]) {
        for &row in rows {
            assert!(row < self.index, "hand-back of row {} beyond index", row);
            assert!(
                self.bool(RETURNED, row),
                "row {} handed back before returning",
                row
            );
            assert!(
                !self.bool(GIVEN_BACK, row),
                "row {} handed back twice",
                row
            );
            self.set_unchecked(GIVEN_BACK, row, Value::Bool(true));
        }
    }

    /// Ingest one simulator result covering `rows`; `out` rows apply
    /// positionally when present.
    pub fn ingest_sim_result(
        &mut self,
        rows: &[usize],
        out: Option<&Frame>,
        status: CalcStatus,
    ) -> Result<(), EnsembleError> {
        if let Some(out) = out {
            if !out.schema().compatible_subset_of(self.frame.schema()) {
                return Err(EnsembleError::Spec(
                    "simulator output declares fields outside the run schema".into(),
                ));
            }
        }
        let record_status = self
            .frame
            .schema()
            .field(CALC_STATUS)
            .map(|f| f.dtype == DType::Int)
            .unwrap_or(false);
        for (pos, &row) in rows.iter().enumerate() {
            assert!(row < self.index, "result for row {} beyond index", row);
            assert!(
                self.bool(GIVEN, row),
                "result for row {} that was never dispatched",
                row
            );
            assert!(
                !self.bool(RETURNED, row),
                "row {} returned twice",
                row
            );
            if let Some(out) = out {
                for field in out.schema().fields() {
                    if is_reserved(&field.name) {
                        continue;
                    }
                    let value = out.get(&field.name, pos).expect("validated field");
                    self.frame.set(&field.name, row, &value)?;
                }
            }
            if record_status {
                self.set_unchecked(CALC_STATUS, row, Value::Int(status.code()));
            }
            self.set_unchecked(RETURNED, row, Value::Bool(true));
            self.sim_count += 1;
        }
        Ok(())
    }

    /// Ship `H[fields][rows]` to a worker.
    pub fn slice(&self, fields: &[String], rows: &[usize]) -> Result<Frame, EnsembleError> {
        self.frame
            .slice(fields, rows)
            .map_err(|e| EnsembleError::Dispatch(e.to_string()))
    }

    pub fn is_given(&self, row: usize) -> bool {
        self.bool(GIVEN, row)
    }

    pub fn is_returned(&self, row: usize) -> bool {
        self.bool(RETURNED, row)
    }

    pub fn is_given_back(&self, row: usize) -> bool {
        self.bool(GIVEN_BACK, row)
    }

    /// Row indices with `given = false`, oldest first.
    pub fn undispatched_rows(&self) -> Vec<usize> {
        (0..self.index).filter(|&r| !self.bool(GIVEN, r)).collect()
    }

    /// Rows produced by `gen_worker` that have returned but were never
    /// handed back.
    pub fn returned_not_given_back(&self, gen_worker: WorkerId) -> Vec<usize> {
        (0..self.index)
            .filter(|&r| {
                self.frame
                    .get(GEN_WORKER, r)
                    .ok()
                    .and_then(|v| v.as_int())
                    == Some(gen_worker as i64)
                    && self.bool(RETURNED, r)
                    && !self.bool(GIVEN_BACK, r)
            })
            .collect()
    }

    /// True when any non-NaN value of `field` over the valid rows is at or
    /// below `threshold`.
    pub fn stop_value_reached(&self, field: &str, threshold: f64) -> bool {
        let column = match self.frame.column(field) {
            Some(c) => c,
            None => return false,
        };
        (0..self.index).any(|row| match column.get(row) {
            Value::Float(v) => !v.is_nan() && v <= threshold,
            Value::Int(v) => (v as f64) <= threshold,
            _ => false,
        })
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        SIM_ID | GIVEN | GIVEN_TIME | SIM_WORKER | GEN_WORKER | RETURNED | GIVEN_BACK
    )
}
