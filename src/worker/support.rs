//! The session channel persistent callbacks exchange messages through.
//!
//! A persistent callback alternates `send` (partial output up to the
//! manager) with `recv` (block for the handed-back evaluations or a stop).
//! Stops that must also end the worker are pushed back onto the incoming
//! queue so the event loop sees them after the callback returns.

use crate::alloc::WorkUnit;
use crate::comms::{
    CalcStatus, CalcType, CommError, ManSignal, ManagerMsg, Packet, ResultEnvelope, WorkMeta,
    WorkerLink, WorkerMsg,
};
use crate::registry::WorkerId;
use crate::runtime::Runtime;
use crate::schema::Frame;
use log::warn;
use std::cell::Cell;

/// What a blocking session receive produced.
#[derive(Debug)]
pub enum SessionMsg {
    /// Handed-back work and, when the unit references rows, their slice.
    Work {
        unit: WorkUnit,
        rows: Option<Frame>,
    },
    /// The session is over; the callback should wrap up and return.
    Stop,
}

/// Worker-side endpoint of one persistent session.
pub struct PersistentComm<'a> {
    link: &'a WorkerLink,
    worker_id: WorkerId,
    calc: CalcType,
    finish: Cell<Option<CalcStatus>>,
}

impl<'a> PersistentComm<'a> {
    pub(crate) fn new(link: &'a WorkerLink, worker_id: WorkerId, calc: CalcType) -> Self {
        Self {
            link,
            worker_id,
            calc,
            finish: Cell::new(None),
        }
    }

    fn finished_status(&self) -> CalcStatus {
        match self.calc {
            CalcType::Sim => CalcStatus::FinishedPersistentSim,
            CalcType::Gen => CalcStatus::FinishedPersistentGen,
        }
    }

    /// The status the session ended with, once a stop has been seen.
    pub fn finish_status(&self) -> Option<CalcStatus> {
        self.finish.get()
    }

    /// Send partial output to the manager. The envelope keeps the session
    /// alive: persistent flag set, status unset.
    pub fn send(&self, out: Frame) -> Result<(), CommError> {
        self.link.send(WorkerMsg::Result(Box::new(ResultEnvelope {
            worker_id: self.worker_id,
            calc_type: self.calc,
            calc_status: CalcStatus::Unset,
            calc_out: Some(out),
            meta: WorkMeta {
                h_rows: Vec::new(),
                persistent: true,
                blocking: Vec::new(),
            },
            persis: None,
        })))
    }

    /// Block until the manager hands work back or stops the session.
    pub fn recv(&self) -> Result<SessionMsg, CommError> {
        loop {
            let packet = match self.link.recv_timeout(crate::worker::POLL_INTERVAL) {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    if Runtime::kill_in_progress() {
                        self.finish.set(Some(CalcStatus::ManSignalKill));
                        return Ok(SessionMsg::Stop);
                    }
                    continue;
                }
                Err(err) => {
                    self.finish.set(Some(CalcStatus::ManSignalKill));
                    return Err(err);
                }
            };
            match packet.msg {
                ManagerMsg::Signal(ManSignal::PersisStop) => {
                    self.finish.set(Some(self.finished_status()));
                    return Ok(SessionMsg::Stop);
                }
                ManagerMsg::Signal(ManSignal::Finish) => {
                    // The whole worker must stop: report the finish here
                    // and let the event loop consume it next.
                    self.finish.set(Some(CalcStatus::ManSignalFinish));
                    self.link.push_back(packet);
                    return Ok(SessionMsg::Stop);
                }
                ManagerMsg::Signal(ManSignal::Kill) => {
                    self.finish.set(Some(CalcStatus::ManSignalKill));
                    return Ok(SessionMsg::Stop);
                }
                ManagerMsg::Signal(sig) => {
                    warn!(
                        "worker {}: ignoring {:?} inside a persistent session",
                        self.worker_id, sig
                    );
                }
                ManagerMsg::Work(unit) => {
                    let rows = if unit.meta.h_rows.is_empty() {
                        None
                    } else {
                        self.recv_rows()?
                    };
                    return Ok(SessionMsg::Work { unit, rows });
                }
                ManagerMsg::Schema(_) | ManagerMsg::Rows(_) => {
                    warn!(
                        "worker {}: stray {:?} packet inside a persistent session",
                        self.worker_id, packet.tag
                    );
                }
            }
        }
    }

    fn recv_rows(&self) -> Result<Option<Frame>, CommError> {
        loop {
            match self.link.recv_timeout(crate::worker::POLL_INTERVAL)? {
                Some(Packet {
                    msg: ManagerMsg::Rows(frame),
                    ..
                }) => return Ok(Some(frame)),
                Some(other) => {
                    return Err(CommError::Protocol(format!(
                        "worker {}: expected row slice in session, got {:?}",
                        self.worker_id, other.tag
                    )))
                }
                None => {
                    if Runtime::kill_in_progress() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Send partial output, then block for the reply.
    pub fn send_recv(&self, out: Frame) -> Result<SessionMsg, CommError> {
        self.send(out)?;
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::{link, Tag};
    use crate::schema::Schema;

    fn empty_frame() -> Frame {
        Frame::new(Schema::empty())
    }

    #[test]
    fn send_marks_the_session_persistent_with_unset_status() {
        let (mgr, wrk) = link(1);
        let session = PersistentComm::new(&wrk, 1, CalcType::Gen);
        session.send(empty_frame()).unwrap();
        match mgr.try_recv().unwrap().unwrap() {
            WorkerMsg::Result(envelope) => {
                assert_eq!(envelope.calc_type, CalcType::Gen);
                assert_eq!(envelope.calc_status, CalcStatus::Unset);
                assert!(envelope.meta.persistent);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn persis_stop_ends_the_session_with_finished_status() {
        let (mgr, wrk) = link(1);
        mgr.send(Packet::signal(ManSignal::PersisStop)).unwrap();
        let session = PersistentComm::new(&wrk, 1, CalcType::Gen);
        assert!(matches!(session.recv().unwrap(), SessionMsg::Stop));
        assert_eq!(
            session.finish_status(),
            Some(CalcStatus::FinishedPersistentGen)
        );
    }

    #[test]
    fn finish_is_reported_and_left_for_the_event_loop() {
        let (mgr, wrk) = link(1);
        mgr.send(Packet::signal(ManSignal::Finish)).unwrap();
        let session = PersistentComm::new(&wrk, 1, CalcType::Sim);
        assert!(matches!(session.recv().unwrap(), SessionMsg::Stop));
        assert_eq!(session.finish_status(), Some(CalcStatus::ManSignalFinish));
        // The finish packet is back on the queue for the event loop.
        let next = wrk.try_recv().unwrap().unwrap();
        assert_eq!(next.tag, Tag::Stop);
        assert!(matches!(
            next.msg,
            ManagerMsg::Signal(ManSignal::Finish)
        ));
    }

    #[test]
    fn handed_back_work_arrives_with_its_rows() {
        use crate::comms::WorkMeta;

        let (mgr, wrk) = link(1);
        let unit = WorkUnit {
            calc: CalcType::Gen,
            h_fields: vec![],
            meta: WorkMeta {
                h_rows: vec![0, 1],
                persistent: true,
                blocking: vec![],
            },
            persis: Default::default(),
        };
        mgr.send(Packet {
            tag: Tag::EvalGen,
            msg: ManagerMsg::Work(unit),
        })
        .unwrap();
        mgr.send(Packet {
            tag: Tag::EvalGen,
            msg: ManagerMsg::Rows(empty_frame()),
        })
        .unwrap();

        let session = PersistentComm::new(&wrk, 1, CalcType::Gen);
        match session.recv().unwrap() {
            SessionMsg::Work { unit, rows } => {
                assert_eq!(unit.meta.h_rows, vec![0, 1]);
                assert!(rows.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.finish_status().is_none());
    }
}
