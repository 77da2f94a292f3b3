//! A coordinator for ensemble computations.
//!
//! A central manager orchestrates a fleet of workers that repeatedly run
//! two kinds of user-supplied callbacks: *generators*, which propose
//! candidate evaluation points, and *simulators*, which evaluate them. A
//! pluggable *allocator* decides, at each step, which idle workers do
//! what. Every point flows through an append-only history table; an exit
//! criterion terminates the run and the final history is returned.
//!
//! # Examples
//! ```no_run
//! use ensemble::{
//!     CalcResult, DType, Ensemble, ExitCriteria, FieldDef, Frame, GenSpecs, RunConfig, Schema,
//!     SimSpecs, Value,
//! };
//!
//! let sim = SimSpecs::new(
//!     |input: &Frame,
//!      _persis: &mut ensemble::Blob,
//!      _ctx: &mut ensemble::CalcContext<'_>|
//!      -> anyhow::Result<CalcResult> {
//!         let x = input.get("x", 0)?.as_float().unwrap();
//!         let schema = Schema::new(vec![FieldDef::new("f", DType::Float)])?;
//!         let out = Frame::from_rows(schema, vec![vec![Value::Float(x * x)]])?;
//!         Ok(CalcResult::done(out))
//!     },
//!     &["x"],
//!     vec![FieldDef::new("f", DType::Float)],
//! );
//!
//! let gen = GenSpecs::new(
//!     |_input: Option<&Frame>,
//!      _persis: &mut ensemble::Blob,
//!      _ctx: &mut ensemble::CalcContext<'_>|
//!      -> anyhow::Result<CalcResult> {
//!         let schema = Schema::new(vec![FieldDef::new("x", DType::Float)])?;
//!         let out = Frame::from_rows(schema, vec![vec![Value::Float(1.5)]])?;
//!         Ok(CalcResult::done(out))
//!     },
//!     &[],
//!     vec![FieldDef::new("x", DType::Float)],
//! );
//!
//! let output = Ensemble::new(sim, gen, ExitCriteria::sim_max(8))
//!     .config(RunConfig::new(4))
//!     .run()?;
//! assert_eq!(output.history.sim_count(), 8);
//! # Ok::<(), ensemble::EnsembleError>(())
//! ```

pub mod alloc;
pub mod comms;
pub mod error;
pub mod history;
pub mod launcher;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod specs;
pub mod worker;

pub use alloc::{
    avail_worker_ids, count_persistent_gens, gen_work, sim_work, AllocSpecs, Allocator,
    GiveSimWorkFirst, PersistentGen, WorkMap, WorkUnit,
};
pub use comms::{CalcStatus, CalcType, ManSignal, WorkMeta};
pub use error::EnsembleError;
pub use history::History;
pub use launcher::{Job, JobSpec, JobState, Launcher, LocalLauncher};
pub use manager::ExitFlag;
pub use registry::{WorkerId, WorkerRegistry};
pub use runtime::Runtime;
pub use schema::{DType, FieldDef, Frame, Schema, Value};
pub use specs::{
    Blob, CalcResult, ExitCriteria, GenSpecs, Generator, PersisInfo, RunConfig, SimSpecs,
    Simulator,
};
pub use worker::support::{PersistentComm, SessionMsg};
pub use worker::CalcContext;

use crate::history::snapshot;
use crate::manager::Manager;
use crate::runtime::WorkerSetup;
use log::{error, warn};
use std::sync::Arc;

/// What a finished run hands back.
#[derive(Debug)]
pub struct RunOutput {
    pub history: History,
    pub persis_info: PersisInfo,
    pub flag: ExitFlag,
}

/// One full run of the coordinator: specs in, history out.
pub struct Ensemble {
    sim_specs: SimSpecs,
    gen_specs: GenSpecs,
    exit_criteria: ExitCriteria,
    alloc_specs: AllocSpecs,
    persis_info: PersisInfo,
    config: RunConfig,
    history0: Option<Frame>,
}

impl Ensemble {
    pub fn new(sim_specs: SimSpecs, gen_specs: GenSpecs, exit_criteria: ExitCriteria) -> Self {
        Self {
            sim_specs,
            gen_specs,
            exit_criteria,
            alloc_specs: AllocSpecs::default(),
            persis_info: PersisInfo::new(),
            config: RunConfig::default(),
            history0: None,
        }
    }

    pub fn alloc_specs(mut self, alloc_specs: AllocSpecs) -> Self {
        self.alloc_specs = alloc_specs;
        self
    }

    pub fn persis_info(mut self, persis_info: PersisInfo) -> Self {
        self.persis_info = persis_info;
        self
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Prepend a previous run's history. Every seed row must be returned.
    pub fn seed_history(mut self, history0: Frame) -> Self {
        self.history0 = Some(history0);
        self
    }

    /// Run the ensemble to completion.
    ///
    /// On success the trimmed history, the final per-worker scratch, and
    /// the exit flag come back. On an error the current history is dumped
    /// beside the output directory before the error is returned; if
    /// configured, the fleet is sent a kill first.
    pub fn run(self) -> Result<RunOutput, EnsembleError> {
        let Ensemble {
            sim_specs,
            gen_specs,
            exit_criteria,
            alloc_specs,
            persis_info,
            config,
            history0,
        } = self;

        if config.nworkers == 0 {
            return Err(EnsembleError::Spec("a run needs at least one worker".into()));
        }
        if let Some(path) = &config.log_file {
            logging::init_file_logging(path)?;
        }

        let hist = History::new(
            &sim_specs.out,
            &gen_specs.out,
            &alloc_specs.out,
            history0.as_ref(),
        )?;
        for name in sim_specs.inputs.iter().chain(gen_specs.inputs.iter()) {
            if !hist.schema().contains(name) {
                return Err(EnsembleError::Spec(format!(
                    "input field '{}' is not in the history schema",
                    name
                )));
            }
        }
        exit_criteria.validate(hist.schema())?;

        let sim_specs = Arc::new(sim_specs);
        let gen_specs = Arc::new(gen_specs);
        let mut links = Vec::with_capacity(config.nworkers);
        let mut setups = Vec::with_capacity(config.nworkers);
        for w in 1..=config.nworkers {
            let (manager_end, worker_end) = comms::link(w);
            links.push(manager_end);
            setups.push(WorkerSetup {
                id: w,
                link: worker_end,
                sim_specs: sim_specs.clone(),
                gen_specs: gen_specs.clone(),
                launcher: config.launcher.clone(),
                dump_dir: config.output_dir.clone(),
            });
        }

        let handle = Runtime::run(setups);
        let mut manager = Manager::new(
            hist,
            links,
            sim_specs,
            gen_specs,
            alloc_specs,
            exit_criteria,
            config.clone(),
            persis_info,
        );

        match manager.run() {
            Ok(flag) => {
                let abandoned = handle.shutdown(config.worker_timeout);
                if abandoned > 0 {
                    warn!("{} workers were abandoned at shutdown", abandoned);
                }
                let (history, persis_info) = manager.into_output();
                Ok(RunOutput {
                    history,
                    persis_info,
                    flag,
                })
            }
            Err(err) => {
                error!("manager failed: {}; dumping history", err);
                let path = config.output_dir.join(format!(
                    "{}_{}.csv",
                    snapshot::AT_ABORT_STEM,
                    manager.history().sim_count()
                ));
                if let Err(dump_err) = snapshot::save_frame(&path, manager.history().trim()) {
                    error!("history dump failed: {}", dump_err);
                }
                if config.abort_on_exception {
                    manager.broadcast_abort();
                }
                handle.shutdown(config.worker_timeout);
                Err(err)
            }
        }
    }
}
