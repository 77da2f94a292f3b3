//! Message tags, calculation statuses, and the paired channel endpoints
//! linking the manager with each worker.
//!
//! Each worker is connected to the manager by one duplex FIFO link built
//! from a pair of `std::sync::mpsc` channels. The manager side probes
//! without blocking; the worker side receives with a poll interval so the
//! runtime's kill signal is honored, and supports pushing a packet back
//! onto the front of its queue (used by persistent callbacks that observe a
//! signal the event loop must handle).
//!
//! Tags travel as tags: the tag of a packet always matches the kind of work
//! or control payload it carries.

use crate::alloc::WorkUnit;
use crate::registry::WorkerId;
use crate::schema::{Frame, Schema};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Stable message tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Tag {
    Unset = 0,
    EvalSim = 1,
    EvalGen = 2,
    Stop = 3,
}

/// The two kinds of user calculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalcType {
    Sim,
    Gen,
}

impl CalcType {
    pub fn tag(self) -> Tag {
        match self {
            Self::Sim => Tag::EvalSim,
            Self::Gen => Tag::EvalGen,
        }
    }
}

impl Display for CalcType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sim => write!(f, "sim"),
            Self::Gen => write!(f, "gen"),
        }
    }
}

/// Status a worker reports with each calculation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum CalcStatus {
    Unset = 0,
    WorkerDone = 1,
    WorkerKill = 2,
    WorkerKillOnErr = 3,
    WorkerKillOnTimeout = 4,
    JobFailed = 5,
    ManSignalFinish = 6,
    ManSignalKill = 7,
    FinishedPersistentSim = 8,
    FinishedPersistentGen = 9,
}

impl CalcStatus {
    /// Integer code recorded in a `calc_status` history column.
    pub fn code(self) -> i64 {
        self as i32 as i64
    }

    pub fn is_finished_persistent(self) -> bool {
        matches!(self, Self::FinishedPersistentSim | Self::FinishedPersistentGen)
    }
}

/// Control payloads the manager sends on the stop tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManSignal {
    /// The run is over; exit the event loop.
    Finish,
    /// Kill any running launcher job, keep serving work.
    Kill,
    /// Resend the last result. Reserved; no manager path issues it.
    ReqResend,
    /// Serialize the last result to a file and reply with its path.
    ReqPickleDump,
    /// End the current persistent session.
    PersisStop,
}

/// Routing metadata attached to work units and echoed back with results.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkMeta {
    /// History rows this unit refers to; results apply positionally.
    pub h_rows: Vec<usize>,
    /// The worker enters (or stays in) persistent mode.
    pub persistent: bool,
    /// Workers reserved for the duration of this unit.
    pub blocking: Vec<WorkerId>,
}

/// A worker's reply to one dispatched calculation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub worker_id: WorkerId,
    pub calc_type: CalcType,
    pub calc_status: CalcStatus,
    pub calc_out: Option<Frame>,
    pub meta: WorkMeta,
    pub persis: Option<crate::specs::Blob>,
}

/// Manager-to-worker payloads.
#[derive(Clone, Debug)]
pub enum ManagerMsg {
    /// Startup broadcast of an input-field schema.
    Schema(Schema),
    Work(WorkUnit),
    /// The history slice announced by the preceding work unit.
    Rows(Frame),
    Signal(ManSignal),
}

/// One manager-to-worker delivery.
#[derive(Clone, Debug)]
pub struct Packet {
    pub tag: Tag,
    pub msg: ManagerMsg,
}

impl Packet {
    pub fn signal(sig: ManSignal) -> Self {
        Self {
            tag: Tag::Stop,
            msg: ManagerMsg::Signal(sig),
        }
    }
}

/// Worker-to-manager deliveries.
///
/// `Malformed` is the channel contract's in-band report of a frame the
/// transport could not decode; receiving it triggers the dump-file recovery
/// protocol.
#[derive(Debug)]
pub enum WorkerMsg {
    Result(Box<ResultEnvelope>),
    /// Reply to `ReqPickleDump`: where the serialized result was written.
    DumpPath(PathBuf),
    Malformed,
}

#[derive(Debug)]
pub enum CommError {
    /// The peer end of this worker's link is gone.
    Disconnected(WorkerId),
    /// The recovery protocol got a reply it cannot use.
    Protocol(String),
}

impl Display for CommError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(w) => write!(f, "link to worker {} disconnected", w),
            Self::Protocol(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CommError {}

/// Manager-side end of one worker link.
pub struct ManagerLink {
    worker_id: WorkerId,
    tx: Sender<Packet>,
    rx: Receiver<WorkerMsg>,
}

impl ManagerLink {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn send(&self, packet: Packet) -> Result<(), CommError> {
        self.tx
            .send(packet)
            .map_err(|_| CommError::Disconnected(self.worker_id))
    }

    /// Non-blocking probe-and-receive. `Ok(None)` means nothing pending.
    pub fn try_recv(&self) -> Result<Option<WorkerMsg>, CommError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CommError::Disconnected(self.worker_id)),
        }
    }

    /// Blocking receive bounded by `timeout`. `Ok(None)` means the timeout
    /// elapsed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerMsg>, CommError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected(self.worker_id)),
        }
    }
}

/// Worker-side end of the link.
///
/// Not `Sync`: a link belongs to exactly one worker thread.
pub struct WorkerLink {
    worker_id: WorkerId,
    tx: Sender<WorkerMsg>,
    rx: Receiver<Packet>,
    pushed: RefCell<VecDeque<Packet>>,
}

impl WorkerLink {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn send(&self, msg: WorkerMsg) -> Result<(), CommError> {
        self.tx
            .send(msg)
            .map_err(|_| CommError::Disconnected(self.worker_id))
    }

    /// Return `packet` to the front of the incoming queue; the next receive
    /// hands it back first.
    pub fn push_back(&self, packet: Packet) {
        self.pushed.borrow_mut().push_front(packet);
    }

    pub fn try_recv(&self) -> Result<Option<Packet>, CommError> {
        if let Some(packet) = self.pushed.borrow_mut().pop_front() {
            return Ok(Some(packet));
        }
        match self.rx.try_recv() {
            Ok(packet) => Ok(Some(packet)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CommError::Disconnected(self.worker_id)),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Packet>, CommError> {
        if let Some(packet) = self.pushed.borrow_mut().pop_front() {
            return Ok(Some(packet));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected(self.worker_id)),
        }
    }
}

/// Build the duplex link for worker `worker_id`.
pub fn link(worker_id: WorkerId) -> (ManagerLink, WorkerLink) {
    let (to_worker, from_manager) = channel();
    let (to_manager, from_worker) = channel();
    (
        ManagerLink {
            worker_id,
            tx: to_worker,
            rx: from_worker,
        },
        WorkerLink {
            worker_id,
            tx: to_manager,
            rx: from_manager,
            pushed: RefCell::new(VecDeque::new()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_fifo_per_direction() {
        let (mgr, wrk) = link(1);
        mgr.send(Packet::signal(ManSignal::Kill)).unwrap();
        mgr.send(Packet::signal(ManSignal::Finish)).unwrap();
        let first = wrk.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        let second = wrk.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert!(matches!(first.msg, ManagerMsg::Signal(ManSignal::Kill)));
        assert!(matches!(second.msg, ManagerMsg::Signal(ManSignal::Finish)));
    }

    #[test]
    fn push_back_takes_priority_over_the_queue() {
        let (mgr, wrk) = link(1);
        mgr.send(Packet::signal(ManSignal::Kill)).unwrap();
        wrk.push_back(Packet::signal(ManSignal::Finish));
        let first = wrk.try_recv().unwrap().unwrap();
        assert!(matches!(first.msg, ManagerMsg::Signal(ManSignal::Finish)));
        let second = wrk.try_recv().unwrap().unwrap();
        assert!(matches!(second.msg, ManagerMsg::Signal(ManSignal::Kill)));
    }

    #[test]
    fn manager_probe_is_non_blocking_and_idempotent() {
        let (mgr, wrk) = link(2);
        assert!(mgr.try_recv().unwrap().is_none());
        assert!(mgr.try_recv().unwrap().is_none());
        wrk.send(WorkerMsg::Malformed).unwrap();
        assert!(matches!(
            mgr.try_recv().unwrap(),
            Some(WorkerMsg::Malformed)
        ));
        assert!(mgr.try_recv().unwrap().is_none());
    }

    #[test]
    fn disconnect_is_reported() {
        let (mgr, wrk) = link(3);
        drop(wrk);
        assert!(matches!(
            mgr.try_recv(),
            Err(CommError::Disconnected(3))
        ));
    }
}
