//! The per-worker event loop.
//!
//! A worker receives its input schemas at startup, then serves one message
//! at a time: control signals on the stop tag, work units on the
//! calculation tags. Callbacks run synchronously on the worker thread;
//! persistent callbacks keep exchanging messages with the manager through
//! the session channel on their context.

pub mod support;

use crate::comms::{
    CalcStatus, CalcType, ManSignal, ManagerMsg, Packet, ResultEnvelope, WorkMeta, WorkerLink,
    WorkerMsg,
};
use crate::launcher::Launcher;
use crate::registry::WorkerId;
use crate::runtime::{Runtime, WorkerSetup};
use crate::schema::Frame;
use crate::specs::CalcResult;
use log::{debug, error, warn};
use std::fs::File;
use std::time::Duration;
use support::PersistentComm;

/// How often a waiting worker re-checks its kill signal.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a callback sees of the worker hosting it.
pub struct CalcContext<'a> {
    worker_id: WorkerId,
    launcher: Option<&'a dyn Launcher>,
    comm: Option<PersistentComm<'a>>,
    link: &'a WorkerLink,
}

impl<'a> CalcContext<'a> {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// The launcher handle, when the run was configured with one.
    pub fn launcher(&self) -> Option<&'a dyn Launcher> {
        self.launcher
    }

    /// The session channel; present only for persistent dispatches.
    pub fn session(&mut self) -> Option<&mut PersistentComm<'a>> {
        self.comm.as_mut()
    }

    /// Non-blocking check for a manager signal, for callbacks that poll a
    /// running job. A kill signal is consumed; a finish signal is reported
    /// and left on the queue for the event loop. Anything else stays
    /// queued.
    pub fn check_manager_signal(&self) -> Option<ManSignal> {
        match self.link.try_recv() {
            Ok(Some(packet)) => match packet.msg {
                ManagerMsg::Signal(ManSignal::Kill) => Some(ManSignal::Kill),
                ManagerMsg::Signal(ManSignal::Finish) => {
                    self.link.push_back(packet);
                    Some(ManSignal::Finish)
                }
                _ => {
                    self.link.push_back(packet);
                    None
                }
            },
            _ => None,
        }
    }
}

/// Blocking receive that honors the kill signal. `None` means killed or
/// disconnected.
fn recv_or_kill(link: &WorkerLink) -> Option<Packet> {
    loop {
        match link.recv_timeout(POLL_INTERVAL) {
            Ok(Some(packet)) => return Some(packet),
            Ok(None) => {
                if Runtime::kill_in_progress() {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
}

pub(crate) fn worker_main(setup: WorkerSetup) {
    let WorkerSetup {
        id,
        link,
        sim_specs,
        gen_specs,
        launcher,
        dump_dir,
    } = setup;

    // Startup broadcasts: the sim-in and gen-in schemas, in that order.
    let mut schemas_seen = 0;
    while schemas_seen < 2 {
        match recv_or_kill(&link) {
            Some(Packet {
                msg: ManagerMsg::Schema(_),
                ..
            }) => schemas_seen += 1,
            Some(other) => {
                // Work can only follow the broadcasts; anything earlier is
                // a protocol bug worth seeing in the log.
                warn!("worker {}: unexpected pre-schema packet {:?}", id, other.tag);
            }
            None => return,
        }
    }

    let mut last_sent: Option<ResultEnvelope> = None;

    loop {
        if Runtime::kill_in_progress() {
            break;
        }
        let packet = match recv_or_kill(&link) {
            Some(p) => p,
            None => break,
        };

        match packet.msg {
            ManagerMsg::Signal(ManSignal::Finish) => {
                debug!("worker {}: finish signal", id);
                break;
            }
            ManagerMsg::Signal(ManSignal::Kill) => {
                // No job is running at loop level; kills matter only to a
                // callback polling through its context.
                debug!("worker {}: kill signal outside a calculation", id);
            }
            ManagerMsg::Signal(ManSignal::ReqPickleDump) => {
                match &last_sent {
                    Some(envelope) => {
                        let path = dump_dir.join(format!("ensemble_worker_{}_dump.json", id));
                        match File::create(&path)
                            .map_err(anyhow::Error::from)
                            .and_then(|f| {
                                serde_json::to_writer(f, envelope).map_err(anyhow::Error::from)
                            }) {
                            Ok(()) => {
                                if link.send(WorkerMsg::DumpPath(path)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => error!("worker {}: dump failed: {}", id, err),
                        }
                    }
                    None => error!("worker {}: dump requested with no result to dump", id),
                }
            }
            ManagerMsg::Signal(ManSignal::ReqResend) => {
                if let Some(envelope) = &last_sent {
                    if link
                        .send(WorkerMsg::Result(Box::new(envelope.clone())))
                        .is_err()
                    {
                        break;
                    }
                }
            }
            ManagerMsg::Signal(ManSignal::PersisStop) => {
                // No persistent session is waiting at loop level.
                debug!("worker {}: stray persistent stop", id);
            }
            ManagerMsg::Work(unit) => {
                let rows = if unit.meta.h_rows.is_empty() {
                    None
                } else {
                    match recv_or_kill(&link) {
                        Some(Packet {
                            msg: ManagerMsg::Rows(frame),
                            ..
                        }) => Some(frame),
                        Some(other) => {
                            error!(
                                "worker {}: expected row slice, got {:?}",
                                id, other.tag
                            );
                            break;
                        }
                        None => break,
                    }
                };

                let envelope = run_calc(
                    id,
                    &link,
                    launcher.as_deref(),
                    &*sim_specs.f,
                    &*gen_specs.f,
                    unit,
                    rows,
                );
                last_sent = Some(envelope.clone());
                if link.send(WorkerMsg::Result(Box::new(envelope))).is_err() {
                    break;
                }
            }
            ManagerMsg::Schema(_) | ManagerMsg::Rows(_) => {
                warn!("worker {}: stray {:?} packet", id, packet.tag);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_calc(
    worker_id: WorkerId,
    link: &WorkerLink,
    launcher: Option<&dyn Launcher>,
    sim: &dyn crate::specs::Simulator,
    gen: &dyn crate::specs::Generator,
    unit: crate::alloc::WorkUnit,
    rows: Option<Frame>,
) -> ResultEnvelope {
    let mut persis = unit.persis.clone();
    let comm = if unit.meta.persistent {
        Some(PersistentComm::new(link, worker_id, unit.calc))
    } else {
        None
    };
    let mut ctx = CalcContext {
        worker_id,
        launcher,
        comm,
        link,
    };

    debug!("worker {}: running {} calculation", worker_id, unit.calc);
    let outcome: anyhow::Result<CalcResult> = match unit.calc {
        CalcType::Sim => {
            let input = rows.unwrap_or_else(|| Frame::new(crate::schema::Schema::empty()));
            sim.simulate(&input, &mut persis, &mut ctx)
        }
        CalcType::Gen => gen.generate(rows.as_ref(), &mut persis, &mut ctx),
    };

    // A session that saw a stop signal reports the session's closing
    // status, whatever the callback returned.
    let session_status = ctx.comm.as_ref().and_then(PersistentComm::finish_status);

    let meta = WorkMeta {
        h_rows: unit.meta.h_rows,
        persistent: unit.meta.persistent,
        blocking: unit.meta.blocking,
    };

    match outcome {
        Ok(result) => {
            let mut status = if result.status == CalcStatus::Unset {
                CalcStatus::WorkerDone
            } else {
                result.status
            };
            if let Some(s) = session_status {
                status = s;
            }
            ResultEnvelope {
                worker_id,
                calc_type: unit.calc,
                calc_status: status,
                calc_out: result.out,
                meta,
                persis: Some(persis),
            }
        }
        Err(err) => {
            error!("worker {}: {} callback failed: {:#}", worker_id, unit.calc, err);
            ResultEnvelope {
                worker_id,
                calc_type: unit.calc,
                calc_status: CalcStatus::JobFailed,
                calc_out: None,
                meta,
                persis: Some(persis),
            }
        }
    }
}
