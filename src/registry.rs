//! The manager's model of each worker's activity state.
//!
//! Workers are numbered `1..=N`; id `0` is the manager itself and never
//! appears here. A worker is either idle, running a calculation, or
//! reserved by another worker's blocking set.

use crate::comms::CalcType;
use std::fmt;

pub type WorkerId = usize;

/// What a worker slot is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Calc(CalcType),
    /// Reserved by another worker's blocking set; receives no work.
    Reserved,
}

#[derive(Clone, Debug)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    pub active: Activity,
    /// `Some(tag)` while the worker hosts a persistent session of that kind.
    pub persis_state: Option<CalcType>,
    pub blocked: bool,
}

impl WorkerSlot {
    pub fn is_idle(&self) -> bool {
        self.active == Activity::Idle
    }
}

/// Fixed-size registry of all worker slots.
pub struct WorkerRegistry {
    slots: Vec<WorkerSlot>,
}

impl WorkerRegistry {
    pub fn new(nworkers: usize) -> Self {
        let slots = (1..=nworkers)
            .map(|worker_id| WorkerSlot {
                worker_id,
                active: Activity::Idle,
                persis_state: None,
                blocked: false,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    pub fn slot(&self, w: WorkerId) -> Option<&WorkerSlot> {
        if w == 0 {
            return None;
        }
        self.slots.get(w - 1)
    }

    fn slot_mut(&mut self, w: WorkerId) -> &mut WorkerSlot {
        assert!(w >= 1 && w <= self.slots.len(), "no such worker {}", w);
        &mut self.slots[w - 1]
    }

    pub fn is_idle(&self, w: WorkerId) -> bool {
        self.slot(w).map(WorkerSlot::is_idle).unwrap_or(false)
    }

    /// Ids of idle workers, in increasing order.
    pub fn idle_ids(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|s| s.is_idle())
            .map(|s| s.worker_id)
            .collect()
    }

    /// Ids of workers with an outstanding dispatch or reservation.
    pub fn active_ids(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|s| !s.is_idle())
            .map(|s| s.worker_id)
            .collect()
    }

    pub fn any_idle(&self) -> bool {
        self.slots.iter().any(WorkerSlot::is_idle)
    }

    pub fn any_active(&self) -> bool {
        self.slots.iter().any(|s| !s.is_idle())
    }

    /// Ids of workers hosting a persistent session, waiting or active.
    pub fn persistent_ids(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|s| s.persis_state.is_some())
            .map(|s| s.worker_id)
            .collect()
    }

    pub fn mark_active(&mut self, w: WorkerId, calc: CalcType) {
        let slot = self.slot_mut(w);
        assert!(slot.is_idle(), "worker {} already active", w);
        slot.active = Activity::Calc(calc);
    }

    pub fn mark_idle(&mut self, w: WorkerId) {
        self.slot_mut(w).active = Activity::Idle;
    }

    pub fn set_persistent(&mut self, w: WorkerId, calc: CalcType) {
        self.slot_mut(w).persis_state = Some(calc);
    }

    pub fn clear_persistent(&mut self, w: WorkerId) {
        self.slot_mut(w).persis_state = None;
    }

    /// Reserve `ids` for the duration of another worker's unit. Every id
    /// must be idle.
    pub fn reserve(&mut self, ids: &[WorkerId]) {
        for &id in ids {
            let slot = self.slot_mut(id);
            assert!(slot.is_idle(), "worker {} is active and cannot be blocked", id);
            slot.blocked = true;
            slot.active = Activity::Reserved;
        }
    }

    /// Release a blocking reservation; the listed workers become idle.
    pub fn release_blocking(&mut self, ids: &[WorkerId]) {
        for &id in ids {
            let slot = self.slot_mut(id);
            slot.blocked = false;
            slot.active = Activity::Idle;
        }
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_all_idle() {
        let reg = WorkerRegistry::new(3);
        assert_eq!(reg.idle_ids(), vec![1, 2, 3]);
        assert!(reg.active_ids().is_empty());
        assert!(reg.slot(0).is_none());
    }

    #[test]
    fn activity_round_trip() {
        let mut reg = WorkerRegistry::new(2);
        reg.mark_active(1, CalcType::Sim);
        assert_eq!(reg.idle_ids(), vec![2]);
        assert_eq!(reg.active_ids(), vec![1]);
        reg.mark_idle(1);
        assert_eq!(reg.idle_ids(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn double_dispatch_panics() {
        let mut reg = WorkerRegistry::new(1);
        reg.mark_active(1, CalcType::Sim);
        reg.mark_active(1, CalcType::Gen);
    }

    #[test]
    fn reservation_blocks_and_release_idles() {
        let mut reg = WorkerRegistry::new(4);
        reg.mark_active(2, CalcType::Sim);
        reg.reserve(&[3, 4]);
        assert_eq!(reg.idle_ids(), vec![1]);
        let slot = reg.slot(3).unwrap();
        assert!(slot.blocked);
        assert_eq!(slot.active, Activity::Reserved);
        reg.release_blocking(&[3, 4]);
        reg.mark_idle(2);
        assert_eq!(reg.idle_ids(), vec![1, 2, 3, 4]);
        assert!(!reg.slot(3).unwrap().blocked);
    }

    #[test]
    fn persistent_state_survives_idling() {
        let mut reg = WorkerRegistry::new(2);
        reg.mark_active(1, CalcType::Gen);
        reg.set_persistent(1, CalcType::Gen);
        reg.mark_idle(1);
        assert_eq!(reg.persistent_ids(), vec![1]);
        assert!(reg.is_idle(1));
        reg.clear_persistent(1);
        assert!(reg.persistent_ids().is_empty());
    }
}
