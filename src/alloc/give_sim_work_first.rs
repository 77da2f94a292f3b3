//! The default allocator: simulation work first, generation when the queue
//! runs dry.

use super::{avail_worker_ids, gen_work, sim_work, Allocator, WorkMap};
use crate::comms::CalcType;
use crate::history::History;
use crate::registry::{Activity, WorkerRegistry};
use crate::schema::Value;
use crate::specs::{GenSpecs, PersisInfo, SimSpecs};

/// Give every idle worker simulation work on undispatched rows, highest
/// `priority` first when that field exists, oldest first otherwise. Once no
/// simulation work remains, give generation work, keeping at most
/// `num_active_gens` generator calls in flight.
#[derive(Clone, Debug)]
pub struct GiveSimWorkFirst {
    /// Points handed to one simulator per unit.
    pub batch: usize,
    /// Cap on concurrently running generator calls.
    pub num_active_gens: usize,
}

impl Default for GiveSimWorkFirst {
    fn default() -> Self {
        Self {
            batch: 1,
            num_active_gens: 1,
        }
    }
}

impl GiveSimWorkFirst {
    fn pending_rows(&self, hist: &History) -> Vec<usize> {
        let mut rows = hist.undispatched_rows();
        if let Some(column) = hist.trim().column("priority") {
            rows.sort_by(|&a, &b| {
                let pa = match column.get(a) {
                    Value::Float(v) => v,
                    Value::Int(v) => v as f64,
                    _ => f64::NEG_INFINITY,
                };
                let pb = match column.get(b) {
                    Value::Float(v) => v,
                    Value::Int(v) => v as f64,
                    _ => f64::NEG_INFINITY,
                };
                pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        rows
    }
}

impl Allocator for GiveSimWorkFirst {
    fn allocate(
        &self,
        registry: &WorkerRegistry,
        hist: &History,
        sim_specs: &SimSpecs,
        gen_specs: &GenSpecs,
        persis_info: &mut PersisInfo,
    ) -> anyhow::Result<WorkMap> {
        let mut map = WorkMap::new();
        let mut pending = self.pending_rows(hist).into_iter();
        let mut active_gens = registry
            .iter()
            .filter(|s| s.active == Activity::Calc(CalcType::Gen))
            .count();

        for w in avail_worker_ids(registry, None) {
            let rows: Vec<usize> = pending.by_ref().take(self.batch.max(1)).collect();
            let scratch = persis_info.get(&w).cloned().unwrap_or_default();
            if !rows.is_empty() {
                sim_work(&mut map, w, sim_specs.inputs.clone(), rows, scratch);
            } else if active_gens < self.num_active_gens {
                active_gens += 1;
                gen_work(&mut map, w, gen_specs.inputs.clone(), Vec::new(), scratch, false);
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::test_support::seeded_history;
    use crate::history::History;
    use crate::schema::{DType, FieldDef};
    use crate::specs::{Blob, CalcResult, GenSpecs, SimSpecs};

    fn specs() -> (SimSpecs, GenSpecs) {
        let sim = SimSpecs::new(
            |_: &crate::schema::Frame,
             _: &mut Blob,
             _: &mut crate::worker::CalcContext<'_>|
             -> anyhow::Result<CalcResult> { Ok(CalcResult::empty()) },
            &["x"],
            vec![FieldDef::new("f", DType::Float)],
        );
        let gen = GenSpecs::new(
            |_: Option<&crate::schema::Frame>,
             _: &mut Blob,
             _: &mut crate::worker::CalcContext<'_>|
             -> anyhow::Result<CalcResult> { Ok(CalcResult::empty()) },
            &[],
            vec![FieldDef::new("x", DType::Float)],
        );
        (sim, gen)
    }

    #[test]
    fn sims_before_gens_and_one_gen_cap() {
        let (sim, gen) = specs();
        let hist = seeded_history(&[1.0, 2.0]);
        let registry = WorkerRegistry::new(4);
        let mut persis = PersisInfo::new();
        let alloc = GiveSimWorkFirst::default();
        let map = alloc
            .allocate(&registry, &hist, &sim, &gen, &mut persis)
            .unwrap();

        // Two sim units for the two pending rows, then one capped gen call.
        assert_eq!(map.len(), 3);
        assert_eq!(map[&1].calc, CalcType::Sim);
        assert_eq!(map[&1].meta.h_rows, vec![0]);
        assert_eq!(map[&2].calc, CalcType::Sim);
        assert_eq!(map[&2].meta.h_rows, vec![1]);
        assert_eq!(map[&3].calc, CalcType::Gen);
        assert!(map.get(&4).is_none());
    }

    #[test]
    fn priority_field_orders_sim_dispatch() {
        let (sim, gen) = specs();
        let mut hist = History::new(
            &[FieldDef::new("f", DType::Float)],
            &[
                FieldDef::new("x", DType::Float),
                FieldDef::new("priority", DType::Float),
            ],
            &[],
            None,
        )
        .unwrap();
        let schema = crate::schema::Schema::new(vec![
            FieldDef::new("x", DType::Float),
            FieldDef::new("priority", DType::Float),
        ])
        .unwrap();
        let out = crate::schema::Frame::from_rows(
            schema,
            vec![
                vec![Value::Float(0.0), Value::Float(1.0)],
                vec![Value::Float(1.0), Value::Float(9.0)],
            ],
        )
        .unwrap();
        hist.append_gen_output(1, &out).unwrap();

        let registry = WorkerRegistry::new(1);
        let mut persis = PersisInfo::new();
        let map = GiveSimWorkFirst::default()
            .allocate(&registry, &hist, &sim, &gen, &mut persis)
            .unwrap();
        assert_eq!(map[&1].meta.h_rows, vec![1]);
    }

    #[test]
    fn batching_groups_rows_per_worker() {
        let (sim, gen) = specs();
        let hist = seeded_history(&[1.0, 2.0, 3.0]);
        let registry = WorkerRegistry::new(1);
        let mut persis = PersisInfo::new();
        let alloc = GiveSimWorkFirst {
            batch: 3,
            num_active_gens: 1,
        };
        let map = alloc
            .allocate(&registry, &hist, &sim, &gen, &mut persis)
            .unwrap();
        assert_eq!(map[&1].meta.h_rows, vec![0, 1, 2]);
    }
}
