//! Allocation: deciding, each iteration, which idle workers run what.
//!
//! An allocator sees the worker registry and the history and returns a map
//! from idle worker ids to work units. The manager validates and dispatches
//! the units; it never retries failed rows itself, so retry policy lives in
//! the allocator (undispatched and failed rows simply show up again on the
//! next pass).

mod give_sim_work_first;
mod persistent_gen;

pub use give_sim_work_first::GiveSimWorkFirst;
pub use persistent_gen::PersistentGen;

use crate::comms::{CalcType, WorkMeta};
use crate::history::History;
use crate::registry::{WorkerId, WorkerRegistry};
use crate::schema::FieldDef;
use crate::specs::{Blob, GenSpecs, PersisInfo, SimSpecs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One dispatch record: what a worker should do next.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkUnit {
    pub calc: CalcType,
    /// History fields shipped with the unit.
    pub h_fields: Vec<String>,
    /// Rows, persistence, and blocking reservation.
    pub meta: WorkMeta,
    /// The target worker's scratch, travelling with the unit.
    pub persis: Blob,
}

/// Work units keyed by target worker; dispatch iterates in id order.
pub type WorkMap = BTreeMap<WorkerId, WorkUnit>;

/// Decides which idle workers do what.
pub trait Allocator: Send + Sync {
    fn allocate(
        &self,
        registry: &WorkerRegistry,
        hist: &History,
        sim_specs: &SimSpecs,
        gen_specs: &GenSpecs,
        persis_info: &mut PersisInfo,
    ) -> anyhow::Result<WorkMap>;
}

impl<F> Allocator for F
where
    F: Fn(
            &WorkerRegistry,
            &History,
            &SimSpecs,
            &GenSpecs,
            &mut PersisInfo,
        ) -> anyhow::Result<WorkMap>
        + Send
        + Sync,
{
    fn allocate(
        &self,
        registry: &WorkerRegistry,
        hist: &History,
        sim_specs: &SimSpecs,
        gen_specs: &GenSpecs,
        persis_info: &mut PersisInfo,
    ) -> anyhow::Result<WorkMap> {
        self(registry, hist, sim_specs, gen_specs, persis_info)
    }
}

/// Specification of the allocation side of a run.
#[derive(Clone)]
pub struct AllocSpecs {
    pub f: Arc<dyn Allocator>,
    /// Allocator-declared history fields.
    pub out: Vec<FieldDef>,
    pub user: Blob,
}

impl AllocSpecs {
    pub fn new<A: Allocator + 'static>(f: A, out: Vec<FieldDef>) -> Self {
        Self {
            f: Arc::new(f),
            out,
            user: Blob::new(),
        }
    }
}

impl Default for AllocSpecs {
    fn default() -> Self {
        Self::new(GiveSimWorkFirst::default(), Vec::new())
    }
}

/// Idle workers, optionally filtered by whether they hold a persistent
/// session.
pub fn avail_worker_ids(registry: &WorkerRegistry, persistent: Option<bool>) -> Vec<WorkerId> {
    registry
        .iter()
        .filter(|s| s.is_idle())
        .filter(|s| match persistent {
            None => true,
            Some(p) => s.persis_state.is_some() == p,
        })
        .map(|s| s.worker_id)
        .collect()
}

/// Number of workers hosting a persistent generator session.
pub fn count_persistent_gens(registry: &WorkerRegistry) -> usize {
    registry
        .iter()
        .filter(|s| s.persis_state == Some(CalcType::Gen))
        .count()
}

/// Add a simulation unit for `w` covering `rows`.
pub fn sim_work(
    map: &mut WorkMap,
    w: WorkerId,
    h_fields: Vec<String>,
    rows: Vec<usize>,
    persis: Blob,
) {
    map.insert(
        w,
        WorkUnit {
            calc: CalcType::Sim,
            h_fields,
            meta: WorkMeta {
                h_rows: rows,
                persistent: false,
                blocking: Vec::new(),
            },
            persis,
        },
    );
}

/// Add a generation unit for `w`; `rows` is empty for a fresh call and
/// non-empty when handing evaluated points back to a persistent session.
pub fn gen_work(
    map: &mut WorkMap,
    w: WorkerId,
    h_fields: Vec<String>,
    rows: Vec<usize>,
    persis: Blob,
    persistent: bool,
) {
    map.insert(
        w,
        WorkUnit {
            calc: CalcType::Gen,
            h_fields,
            meta: WorkMeta {
                h_rows: rows,
                persistent,
                blocking: Vec::new(),
            },
            persis,
        },
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::schema::{DType, Frame, Schema, Value};

    pub fn gen_points(xs: &[f64]) -> Frame {
        let schema = Schema::new(vec![FieldDef::new("x", DType::Float)]).unwrap();
        Frame::from_rows(
            schema,
            xs.iter().map(|&x| vec![Value::Float(x)]).collect(),
        )
        .unwrap()
    }

    pub fn seeded_history(xs: &[f64]) -> History {
        let mut hist = History::new(
            &[FieldDef::new("f", DType::Float)],
            &[FieldDef::new("x", DType::Float)],
            &[],
            None,
        )
        .unwrap();
        hist.append_gen_output(1, &gen_points(xs)).unwrap();
        hist
    }
}
