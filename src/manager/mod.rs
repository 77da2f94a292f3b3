//! The manager loop: drain completions, allocate, dispatch, terminate.
//!
//! The manager runs single-threaded on the calling thread and never
//! suspends on user code. Each iteration drains every pending worker
//! message (rescanning until a full pass over the active workers finds
//! none), runs the optional queue-update hook, invokes the allocator when
//! at least one worker is idle, and dispatches the returned units with a
//! termination re-check before each send. Already-dispatched units are
//! allowed to complete their round trip during the bounded final drain.


use crate::alloc::AllocSpecs;
use crate::alloc::WorkUnit;
use crate::comms::{
    CalcType, CommError, ManSignal, ManagerLink, ManagerMsg, Packet, ResultEnvelope, WorkerMsg,
};
use crate::error::EnsembleError;
use crate::history::{snapshot, History, SIM_ID};
use crate::registry::{WorkerId, WorkerRegistry};
use crate::specs::{Blob, ExitCriteria, GenSpecs, PersisInfo, RunConfig, SimSpecs};
use log::{debug, info, warn};
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitFlag {
    /// An exit criterion was met and the fleet wound down cleanly.
    Clean = 0,
    /// The run aborted on an error; the history was dumped first.
    Aborted = 1,
    /// The wallclock limit expired with work possibly still in flight.
    Timeout = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    Criteria,
    Timeout,
}

/// Pause between empty probe passes, so a fully-busy fleet does not spin
/// the manager core.
const IDLE_PAUSE: Duration = Duration::from_millis(1);

pub(crate) struct Manager {
    hist: History,
    registry: WorkerRegistry,
    links: Vec<ManagerLink>,
    sim_specs: Arc<SimSpecs>,
    gen_specs: Arc<GenSpecs>,
    alloc_specs: AllocSpecs,
    exit_criteria: ExitCriteria,
    config: RunConfig,
    persis_info: PersisInfo,
    queue_data: Blob,
    start: Instant,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hist: History,
        links: Vec<ManagerLink>,
        sim_specs: Arc<SimSpecs>,
        gen_specs: Arc<GenSpecs>,
        alloc_specs: AllocSpecs,
        exit_criteria: ExitCriteria,
        config: RunConfig,
        persis_info: PersisInfo,
    ) -> Self {
        let registry = WorkerRegistry::new(links.len());
        Self {
            hist,
            registry,
            links,
            sim_specs,
            gen_specs,
            alloc_specs,
            exit_criteria,
            config,
            persis_info,
            queue_data: Blob::new(),
            start: Instant::now(),
        }
    }

    pub(crate) fn history(&self) -> &History {
        &self.hist
    }

    pub(crate) fn into_output(self) -> (History, PersisInfo) {
        (self.hist, self.persis_info)
    }

    /// Best-effort kill-and-finish broadcast for the abort path.
    pub(crate) fn broadcast_abort(&self) {
        for link in &self.links {
            let _ = link.send(Packet::signal(ManSignal::Kill));
            let _ = link.send(Packet::signal(ManSignal::Finish));
        }
    }

    /// Run the ensemble to completion.
    pub(crate) fn run(&mut self) -> Result<ExitFlag, EnsembleError> {
        info!(
            "manager started with {} workers; exit criteria {:?}",
            self.links.len(),
            self.exit_criteria
        );
        self.send_initial_info()?;

        let reason = loop {
            if let Some(reason) = self.termination_test() {
                break reason;
            }
            let drained = self.receive_from_workers()?;
            self.update_queue();
            let mut dispatched = 0;
            if self.registry.any_idle() {
                let alloc = self.alloc_specs.f.clone();
                let work = alloc
                    .allocate(
                        &self.registry,
                        &self.hist,
                        &self.sim_specs,
                        &self.gen_specs,
                        &mut self.persis_info,
                    )
                    .map_err(EnsembleError::Alloc)?;
                for (w, unit) in work {
                    if self.termination_test().is_some() {
                        break;
                    }
                    self.dispatch(w, unit)?;
                    dispatched += 1;
                }
            }
            if drained == 0 && dispatched == 0 {
                std::thread::sleep(IDLE_PAUSE);
            }
        };

        self.finalize(reason)
    }

    /// Broadcast the sim-in and gen-in schemas so workers know the rows
    /// they will receive.
    fn send_initial_info(&self) -> Result<(), EnsembleError> {
        let sim_in = self
            .hist
            .schema()
            .project(&self.sim_specs.inputs)
            .map_err(|e| EnsembleError::Spec(e.to_string()))?;
        let gen_in = self
            .hist
            .schema()
            .project(&self.gen_specs.inputs)
            .map_err(|e| EnsembleError::Spec(e.to_string()))?;
        for link in &self.links {
            link.send(Packet {
                tag: CalcType::Sim.tag(),
                msg: ManagerMsg::Schema(sim_in.clone()),
            })?;
            link.send(Packet {
                tag: CalcType::Gen.tag(),
                msg: ManagerMsg::Schema(gen_in.clone()),
            })?;
        }
        Ok(())
    }

    /// Nonzero when the run should stop. Wallclock is checked first so a
    /// slow loop still honors its deadline.
    fn termination_test(&self) -> Option<StopReason> {
        if let Some(limit) = self.exit_criteria.elapsed_wallclock_time {
            if self.start.elapsed().as_secs_f64() >= limit {
                debug!("term test tripped: elapsed_wallclock_time");
                return Some(StopReason::Timeout);
            }
        }
        if let Some(sim_max) = self.exit_criteria.sim_max {
            if self.hist.given_count() >= sim_max + self.hist.offset() {
                debug!("term test tripped: sim_max");
                return Some(StopReason::Criteria);
            }
        }
        if let Some(gen_max) = self.exit_criteria.gen_max {
            if self.hist.index() >= gen_max + self.hist.offset() {
                debug!("term test tripped: gen_max");
                return Some(StopReason::Criteria);
            }
        }
        if let Some((field, threshold)) = &self.exit_criteria.stop_val {
            if self.hist.stop_value_reached(field, *threshold) {
                debug!("term test tripped: stop_val");
                return Some(StopReason::Criteria);
            }
        }
        None
    }

    /// Drain every pending worker message, rescanning the active workers in
    /// id order until a full pass finds none. A drain over empty channels
    /// is a no-op. Returns the number of messages applied.
    fn receive_from_workers(&mut self) -> Result<usize, EnsembleError> {
        let mut handled = 0;
        let mut new_stuff = true;
        while new_stuff && self.registry.any_active() {
            new_stuff = false;
            for w in self.registry.active_ids() {
                if let Some(msg) = self.links[w - 1].try_recv()? {
                    new_stuff = true;
                    handled += 1;
                    self.handle_msg(w, msg)?;
                }
            }
        }
        self.save_periodic()?;
        Ok(handled)
    }

    fn handle_msg(&mut self, w: WorkerId, msg: WorkerMsg) -> Result<(), EnsembleError> {
        let envelope = match msg {
            WorkerMsg::Result(envelope) => *envelope,
            WorkerMsg::Malformed => {
                warn!("undecodable message from worker {}; requesting a dump", w);
                self.recover_via_dump(w)?
            }
            WorkerMsg::DumpPath(path) => {
                return Err(EnsembleError::Comm(CommError::Protocol(format!(
                    "unsolicited dump path {} from worker {}",
                    path.display(),
                    w
                ))));
            }
        };
        self.apply_result(w, envelope)
    }

    /// Dump-file recovery: ask the worker to serialize its pending result,
    /// then read and delete the file.
    fn recover_via_dump(&mut self, w: WorkerId) -> Result<ResultEnvelope, EnsembleError> {
        self.links[w - 1].send(Packet::signal(ManSignal::ReqPickleDump))?;
        let deadline = Instant::now() + self.config.worker_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EnsembleError::Comm(CommError::Protocol(format!(
                    "worker {} never replied to the dump request",
                    w
                ))));
            }
            match self.links[w - 1].recv_timeout(remaining)? {
                Some(WorkerMsg::DumpPath(path)) => {
                    let file = File::open(&path)?;
                    let envelope: ResultEnvelope = serde_json::from_reader(file)?;
                    let _ = std::fs::remove_file(&path);
                    info!(
                        "recovered result from worker {} via {}",
                        w,
                        path.display()
                    );
                    return Ok(envelope);
                }
                Some(_) => {
                    return Err(EnsembleError::Comm(CommError::Protocol(format!(
                        "worker {} replied to the dump request with something else",
                        w
                    ))));
                }
                None => {}
            }
        }
    }

    /// Apply one worker result: update the registry, ingest or append rows,
    /// release reservations, and merge the worker's scratch.
    fn apply_result(
        &mut self,
        w: WorkerId,
        envelope: ResultEnvelope,
    ) -> Result<(), EnsembleError> {
        if envelope.worker_id != w {
            return Err(EnsembleError::Comm(CommError::Protocol(format!(
                "result stamped for worker {} arrived on worker {}'s channel",
                envelope.worker_id, w
            ))));
        }
        debug!(
            "worker {}: {} result, status {:?}",
            w, envelope.calc_type, envelope.calc_status
        );

        self.registry.mark_idle(w);
        if envelope.calc_status.is_finished_persistent() {
            self.registry.clear_persistent(w);
        } else {
            match envelope.calc_type {
                CalcType::Sim => self.hist.ingest_sim_result(
                    &envelope.meta.h_rows,
                    envelope.calc_out.as_ref(),
                    envelope.calc_status,
                )?,
                CalcType::Gen => {
                    if let Some(out) = &envelope.calc_out {
                        self.hist.append_gen_output(w, out)?;
                    }
                }
            }
            if envelope.meta.persistent {
                // Now a waiting persistent worker.
                self.registry.set_persistent(w, envelope.calc_type);
            }
        }
        if !envelope.meta.blocking.is_empty() {
            self.registry.release_blocking(&envelope.meta.blocking);
        }
        if let Some(blob) = envelope.persis {
            self.persis_info.entry(w).or_default().extend(blob);
        }
        Ok(())
    }

    fn update_queue(&mut self) {
        if let Some(update) = self.config.queue_update.clone() {
            if !self.hist.is_empty() {
                let data = std::mem::take(&mut self.queue_data);
                self.queue_data = update(&self.hist, &self.gen_specs, data);
            }
        }
    }

    /// Validate and send one work unit, then update the registry and the
    /// history to match.
    fn dispatch(&mut self, w: WorkerId, unit: WorkUnit) -> Result<(), EnsembleError> {
        if w == 0 || w > self.links.len() {
            return Err(EnsembleError::Dispatch(format!(
                "allocator targeted nonexistent worker {}",
                w
            )));
        }
        if !self.registry.is_idle(w) {
            return Err(EnsembleError::Dispatch(format!(
                "allocator requested work for already active worker {}",
                w
            )));
        }
        for &b in &unit.meta.blocking {
            if b == 0 || b > self.links.len() || b == w || !self.registry.is_idle(b) {
                return Err(EnsembleError::Dispatch(format!(
                    "worker {} cannot be blocked for worker {}",
                    b, w
                )));
            }
        }
        match unit.calc {
            CalcType::Sim => {
                for &row in &unit.meta.h_rows {
                    if row >= self.hist.index() {
                        return Err(EnsembleError::Dispatch(format!(
                            "sim work references row {} beyond the history",
                            row
                        )));
                    }
                    if self.hist.is_given(row) {
                        return Err(EnsembleError::Dispatch(format!(
                            "sim work references row {} that was already dispatched",
                            row
                        )));
                    }
                }
            }
            CalcType::Gen if unit.meta.persistent => {
                for &row in &unit.meta.h_rows {
                    if row >= self.hist.index()
                        || !self.hist.is_returned(row)
                        || self.hist.is_given_back(row)
                    {
                        return Err(EnsembleError::Dispatch(format!(
                            "hand-back references row {} that is not awaiting hand-back",
                            row
                        )));
                    }
                }
            }
            CalcType::Gen => {}
        }

        let rows_frame = if unit.meta.h_rows.is_empty() {
            None
        } else {
            Some(self.hist.slice(&unit.h_fields, &unit.meta.h_rows)?)
        };

        debug!("sending {} work unit to worker {}", unit.calc, w);
        let calc = unit.calc;
        let meta = unit.meta.clone();
        self.links[w - 1].send(Packet {
            tag: calc.tag(),
            msg: ManagerMsg::Work(unit),
        })?;
        if let Some(frame) = rows_frame {
            self.links[w - 1].send(Packet {
                tag: calc.tag(),
                msg: ManagerMsg::Rows(frame),
            })?;
        }

        self.registry.mark_active(w, calc);
        if meta.persistent {
            self.registry.set_persistent(w, calc);
        }
        if !meta.blocking.is_empty() {
            self.registry.reserve(&meta.blocking);
        }
        match calc {
            CalcType::Sim => self.hist.mark_dispatched(&meta.h_rows, w),
            CalcType::Gen => {
                if meta.persistent && !meta.h_rows.is_empty() {
                    self.hist.mark_given_back(&meta.h_rows);
                }
            }
        }
        Ok(())
    }

    /// Periodic snapshots; existing files are never overwritten.
    fn save_periodic(&mut self) -> Result<(), EnsembleError> {
        if let Some(k) = self.sim_specs.save_every_k {
            if let Some(path) = snapshot::save_every_k(
                &self.config.output_dir,
                snapshot::AFTER_SIM_STEM,
                self.hist.trim(),
                self.hist.sim_count(),
                k,
            )? {
                info!("saved history to {}", path.display());
            }
        }
        if let Some(k) = self.gen_specs.save_every_k {
            if let Some(path) = snapshot::save_every_k(
                &self.config.output_dir,
                snapshot::AFTER_GEN_STEM,
                self.hist.trim(),
                self.hist.index(),
                k,
            )? {
                info!("saved history to {}", path.display());
            }
        }
        Ok(())
    }

    /// Wind the fleet down: drain in-flight work within the worker timeout,
    /// close persistent sessions, then broadcast the finish signal.
    fn finalize(&mut self, reason: StopReason) -> Result<ExitFlag, EnsembleError> {
        let flag = match reason {
            StopReason::Criteria => ExitFlag::Clean,
            StopReason::Timeout => ExitFlag::Timeout,
        };

        let deadline = Instant::now() + self.config.worker_timeout;
        while self.registry.any_active() {
            self.receive_from_workers()?;
            if !self.registry.any_active() {
                break;
            }
            if Instant::now() >= deadline {
                if flag == ExitFlag::Timeout {
                    info!(
                        "wallclock termination: a last attempt was made to receive \
                         completed work"
                    );
                }
                warn!(
                    "{} workers still active at shutdown",
                    self.registry.active_ids().len()
                );
                break;
            }
            std::thread::sleep(IDLE_PAUSE);
        }

        self.stop_persistent_sessions()?;

        for link in &self.links {
            let _ = link.send(Packet::signal(ManSignal::Finish));
        }
        info!(
            "manager total time: {:.3}s",
            self.start.elapsed().as_secs_f64()
        );
        Ok(flag)
    }

    /// Hand any remaining evaluated rows back to their waiting persistent
    /// generators, then end each session and receive its closing result.
    fn stop_persistent_sessions(&mut self) -> Result<(), EnsembleError> {
        let waiting: Vec<WorkerId> = self
            .registry
            .persistent_ids()
            .into_iter()
            .filter(|&w| self.registry.is_idle(w))
            .collect();
        if waiting.is_empty() {
            return Ok(());
        }

        for &w in &waiting {
            if self.registry.slot(w).and_then(|s| s.persis_state) == Some(CalcType::Gen) {
                let rows = self.hist.returned_not_given_back(w);
                if !rows.is_empty() {
                    self.final_hand_back(w, rows)?;
                }
            }
            let _ = self.links[w - 1].send(Packet::signal(ManSignal::PersisStop));
        }

        let deadline = Instant::now() + self.config.worker_timeout;
        for &w in &waiting {
            loop {
                let open = self
                    .registry
                    .slot(w)
                    .map(|s| s.persis_state.is_some())
                    .unwrap_or(false);
                if !open {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("persistent worker {} did not close its session", w);
                    break;
                }
                if let Some(msg) = self.links[w - 1].recv_timeout(remaining)? {
                    self.handle_msg(w, msg)?;
                }
            }
        }
        Ok(())
    }

    /// The closing hand-back: evaluated rows the allocator never got to
    /// return travel to the generator ahead of the session stop.
    fn final_hand_back(&mut self, w: WorkerId, rows: Vec<usize>) -> Result<(), EnsembleError> {
        let mut fields = self.sim_specs.inputs.clone();
        fields.extend(self.sim_specs.out.iter().map(|f| f.name.clone()));
        fields.push(SIM_ID.to_string());

        let frame = self.hist.slice(&fields, &rows)?;
        let unit = WorkUnit {
            calc: CalcType::Gen,
            h_fields: fields,
            meta: crate::comms::WorkMeta {
                h_rows: rows.clone(),
                persistent: true,
                blocking: Vec::new(),
            },
            persis: self.persis_info.get(&w).cloned().unwrap_or_default(),
        };
        debug!("final hand-back of {} rows to worker {}", rows.len(), w);
        self.links[w - 1].send(Packet {
            tag: CalcType::Gen.tag(),
            msg: ManagerMsg::Work(unit),
        })?;
        self.links[w - 1].send(Packet {
            tag: CalcType::Gen.tag(),
            msg: ManagerMsg::Rows(frame),
        })?;
        self.hist.mark_given_back(&rows);
        Ok(())
    }
}
