//! User-facing run specifications and the callback interfaces they carry.
//!
//! Simulators, generators, and allocators are each a single capability with
//! one method, blanket-implemented for closures, so user code can pass a
//! plain `move` closure wherever a callback is expected.

use crate::comms::CalcStatus;
use crate::error::EnsembleError;
use crate::history::History;
use crate::launcher::Launcher;
use crate::registry::WorkerId;
use crate::schema::{DType, FieldDef, Frame, Schema, Value};
use crate::worker::CalcContext;
use hashbrown::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Opaque per-worker scratch: a string-keyed map of primitives and arrays.
pub type Blob = HashMap<String, Value>;

/// Scratch carried across dispatches, keyed by worker id.
pub type PersisInfo = HashMap<WorkerId, Blob>;

/// What a simulator or generator callback hands back.
#[derive(Clone, Debug)]
pub struct CalcResult {
    pub out: Option<Frame>,
    pub status: CalcStatus,
}

impl CalcResult {
    /// A successful calculation with output rows.
    pub fn done(out: Frame) -> Self {
        Self {
            out: Some(out),
            status: CalcStatus::WorkerDone,
        }
    }

    /// A successful calculation with nothing to report (typical for the
    /// closing return of a persistent session, whose output already went
    /// through the session channel).
    pub fn empty() -> Self {
        Self {
            out: None,
            status: CalcStatus::WorkerDone,
        }
    }

    pub fn with_status(mut self, status: CalcStatus) -> Self {
        self.status = status;
        self
    }
}

/// Evaluates dispatched points.
pub trait Simulator: Send + Sync {
    fn simulate(
        &self,
        input: &Frame,
        persis: &mut Blob,
        ctx: &mut CalcContext<'_>,
    ) -> anyhow::Result<CalcResult>;
}

impl<F> Simulator for F
where
    F: Fn(&Frame, &mut Blob, &mut CalcContext<'_>) -> anyhow::Result<CalcResult> + Send + Sync,
{
    fn simulate(
        &self,
        input: &Frame,
        persis: &mut Blob,
        ctx: &mut CalcContext<'_>,
    ) -> anyhow::Result<CalcResult> {
        self(input, persis, ctx)
    }
}

/// Proposes candidate evaluation points.
///
/// `input` is the handed-back history slice, absent for a fresh call.
/// Persistent generators find their session channel on `ctx`.
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        input: Option<&Frame>,
        persis: &mut Blob,
        ctx: &mut CalcContext<'_>,
    ) -> anyhow::Result<CalcResult>;
}

impl<F> Generator for F
where
    F: Fn(Option<&Frame>, &mut Blob, &mut CalcContext<'_>) -> anyhow::Result<CalcResult>
        + Send
        + Sync,
{
    fn generate(
        &self,
        input: Option<&Frame>,
        persis: &mut Blob,
        ctx: &mut CalcContext<'_>,
    ) -> anyhow::Result<CalcResult> {
        self(input, persis, ctx)
    }
}

/// Specification of the simulation side of a run.
#[derive(Clone)]
pub struct SimSpecs {
    pub f: Arc<dyn Simulator>,
    /// History fields shipped to the simulator with each dispatch.
    pub inputs: Vec<String>,
    /// Fields the simulator writes; joined into the history schema.
    pub out: Vec<FieldDef>,
    /// Snapshot the history every `k` completed simulations.
    pub save_every_k: Option<usize>,
    /// Free-form parameters, opaque to the coordinator.
    pub user: Blob,
}

impl SimSpecs {
    pub fn new<S: Simulator + 'static>(f: S, inputs: &[&str], out: Vec<FieldDef>) -> Self {
        Self {
            f: Arc::new(f),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            out,
            save_every_k: None,
            user: Blob::new(),
        }
    }
}

/// Specification of the generation side of a run.
#[derive(Clone)]
pub struct GenSpecs {
    pub f: Arc<dyn Generator>,
    pub inputs: Vec<String>,
    pub out: Vec<FieldDef>,
    /// Snapshot the history every `k` appended rows.
    pub save_every_k: Option<usize>,
    pub user: Blob,
}

impl GenSpecs {
    pub fn new<G: Generator + 'static>(f: G, inputs: &[&str], out: Vec<FieldDef>) -> Self {
        Self {
            f: Arc::new(f),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            out,
            save_every_k: None,
            user: Blob::new(),
        }
    }
}

/// When to end the run. At least one criterion must be set.
#[derive(Clone, Debug, Default)]
pub struct ExitCriteria {
    /// Stop once this many points have been dispatched to simulators
    /// (beyond the seed history).
    pub sim_max: Option<usize>,
    /// Stop once this many points exist in the history (beyond the seed).
    pub gen_max: Option<usize>,
    /// Stop after this much wallclock time, in seconds.
    pub elapsed_wallclock_time: Option<f64>,
    /// Stop when any non-NaN value of the named field drops to or below the
    /// threshold.
    pub stop_val: Option<(String, f64)>,
}

impl ExitCriteria {
    pub fn sim_max(n: usize) -> Self {
        Self {
            sim_max: Some(n),
            ..Self::default()
        }
    }

    pub fn gen_max(n: usize) -> Self {
        Self {
            gen_max: Some(n),
            ..Self::default()
        }
    }

    pub fn wallclock(seconds: f64) -> Self {
        Self {
            elapsed_wallclock_time: Some(seconds),
            ..Self::default()
        }
    }

    pub fn validate(&self, schema: &Schema) -> Result<(), EnsembleError> {
        if self.sim_max.is_none()
            && self.gen_max.is_none()
            && self.elapsed_wallclock_time.is_none()
            && self.stop_val.is_none()
        {
            return Err(EnsembleError::Spec("no exit criterion set".into()));
        }
        if let Some((field, _)) = &self.stop_val {
            match schema.field(field).map(|f| f.dtype) {
                Some(DType::Float) | Some(DType::Int) => {}
                Some(other) => {
                    return Err(EnsembleError::Spec(format!(
                        "stop_val field '{}' has non-numeric dtype {}",
                        field, other
                    )))
                }
                None => {
                    return Err(EnsembleError::Spec(format!(
                        "stop_val references unknown field '{}'",
                        field
                    )))
                }
            }
        }
        Ok(())
    }
}

/// User hook run each iteration over the current history, carrying scratch
/// between calls.
pub type QueueUpdateFn = Arc<dyn Fn(&History, &GenSpecs, Blob) -> Blob + Send + Sync>;

/// Coordinator-level settings.
#[derive(Clone)]
pub struct RunConfig {
    pub nworkers: usize,
    /// Bound on the final drain and on worker shutdown.
    pub worker_timeout: Duration,
    /// Broadcast a kill to the fleet before returning an error.
    pub abort_on_exception: bool,
    pub queue_update: Option<QueueUpdateFn>,
    /// Route crate logs to this file (e.g. `ensemble.log`).
    pub log_file: Option<PathBuf>,
    /// Directory for history snapshots and dumps.
    pub output_dir: PathBuf,
    /// Launcher handed to simulators that spawn subprocesses.
    pub launcher: Option<Arc<dyn Launcher>>,
}

impl RunConfig {
    pub fn new(nworkers: usize) -> Self {
        Self {
            nworkers,
            ..Self::default()
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nworkers: 1,
            worker_timeout: Duration::from_secs(5),
            abort_on_exception: true,
            queue_update: None,
            log_file: None,
            output_dir: PathBuf::from("."),
            launcher: None,
        }
    }
}
