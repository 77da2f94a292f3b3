//! Allocator that drives a single persistent generator.

use super::{avail_worker_ids, count_persistent_gens, gen_work, sim_work, Allocator, WorkMap};
use crate::history::{History, SIM_ID};
use crate::registry::WorkerRegistry;
use crate::specs::{GenSpecs, PersisInfo, SimSpecs};

/// Give simulation work when possible, but otherwise start up to one
/// persistent generator. Once every point the generator requested has been
/// evaluated, the results are handed back to it.
#[derive(Clone, Debug, Default)]
pub struct PersistentGen {
    /// Hold hand-backs until this many evaluations exist, so the generator
    /// sees its whole initial sample at once.
    pub initial_sample: usize,
}

impl PersistentGen {
    /// Fields shipped back to the generator with evaluated points: the
    /// simulator's inputs and outputs plus the row key.
    fn hand_back_fields(sim_specs: &SimSpecs) -> Vec<String> {
        let mut fields = sim_specs.inputs.clone();
        fields.extend(sim_specs.out.iter().map(|f| f.name.clone()));
        fields.push(SIM_ID.to_string());
        fields
    }
}

impl Allocator for PersistentGen {
    fn allocate(
        &self,
        registry: &WorkerRegistry,
        hist: &History,
        sim_specs: &SimSpecs,
        gen_specs: &GenSpecs,
        persis_info: &mut PersisInfo,
    ) -> anyhow::Result<WorkMap> {
        let mut map = WorkMap::new();
        let mut gen_count = count_persistent_gens(registry);

        // Waiting persistent generators: hand back whatever has returned.
        for w in avail_worker_ids(registry, Some(true)) {
            if hist.sim_count() < self.initial_sample {
                continue;
            }
            let rows = hist.returned_not_given_back(w);
            if !rows.is_empty() {
                let scratch = persis_info.get(&w).cloned().unwrap_or_default();
                gen_work(
                    &mut map,
                    w,
                    Self::hand_back_fields(sim_specs),
                    rows,
                    scratch,
                    true,
                );
            }
        }

        let mut pending = hist.undispatched_rows().into_iter();
        for w in avail_worker_ids(registry, Some(false)) {
            let scratch = persis_info.get(&w).cloned().unwrap_or_default();
            if let Some(row) = pending.next() {
                sim_work(&mut map, w, sim_specs.inputs.clone(), vec![row], scratch);
            } else if gen_count == 0 {
                gen_count += 1;
                gen_work(
                    &mut map,
                    w,
                    gen_specs.inputs.clone(),
                    Vec::new(),
                    scratch,
                    true,
                );
            }
        }

        Ok(map)
    }
}
