//! Desired-versus-actual diff for one reconciliation pass.

use std::collections::{BTreeSet, HashSet};

use fleet_id::{InstanceId, MachineId};

use crate::provider::Instance;
use crate::state::{Life, MachineRecord};

/// What one pass has to do, computed from scratch every time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationView {
    /// Alive machines with no instance recorded.
    pub unprovisioned: Vec<MachineId>,

    /// Running instances no live machine record accounts for.
    pub to_stop: Vec<InstanceId>,

    /// Running instances recorded on a live machine.
    pub known: usize,

    /// Live machines whose recorded instance the provider doesn't list.
    pub missing: Vec<(MachineId, InstanceId)>,
}

impl ReconciliationView {
    /// Passes run one at a time, so no start is in flight while this runs.
    pub fn compute(machines: &[MachineRecord], instances: &[Instance]) -> Self {
        // Dying machines keep their instance until they are dead.
        let live: Vec<&MachineRecord> = machines.iter().filter(|m| m.life != Life::Dead).collect();

        let recorded: HashSet<&InstanceId> =
            live.iter().filter_map(|m| m.instance_id.as_ref()).collect();
        let running: HashSet<&InstanceId> = instances.iter().map(|i| &i.id).collect();

        let unprovisioned = live
            .iter()
            .filter(|m| m.life == Life::Alive && m.instance_id.is_none())
            .map(|m| m.id.clone())
            .collect();

        // An instance is adopted only through the machine record, never by
        // the machine id it was started for.
        let to_stop: BTreeSet<InstanceId> = instances
            .iter()
            .filter(|i| !recorded.contains(&i.id))
            .map(|i| i.id.clone())
            .collect();

        let missing = live
            .iter()
            .filter_map(|m| {
                let id = m.instance_id.as_ref()?;
                (!running.contains(id)).then(|| (m.id.clone(), id.clone()))
            })
            .collect();

        Self {
            unprovisioned,
            known: instances.len() - to_stop.len(),
            to_stop: to_stop.into_iter().collect(),
            missing,
        }
    }

    /// True when the pass has nothing to start or stop.
    pub fn is_converged(&self) -> bool {
        self.unprovisioned.is_empty() && self.to_stop.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Job;

    fn machine(index: u64, life: Life, instance: Option<&str>) -> MachineRecord {
        MachineRecord {
            id: MachineId::from_index(index),
            life,
            instance_id: instance.map(|i| InstanceId::parse(i).unwrap()),
            jobs: vec![Job::HostUnits],
            agent_version: None,
        }
    }

    fn instance(id: &str, machine: u64) -> Instance {
        Instance {
            id: InstanceId::parse(id).unwrap(),
            machine_id: MachineId::from_index(machine),
        }
    }

    fn ids(v: &[&str]) -> Vec<InstanceId> {
        v.iter().map(|i| InstanceId::parse(i).unwrap()).collect()
    }

    #[test]
    fn test_unprovisioned_alive_machine() {
        let view = ReconciliationView::compute(
            &[machine(0, Life::Alive, None)],
            &[]
        );
        assert_eq!(view.unprovisioned, vec![MachineId::from_index(0)]);
        assert!(view.to_stop.is_empty());
        assert!(!view.is_converged());
    }

    #[test]
    fn test_unknown_instance_is_stopped() {
        let view = ReconciliationView::compute(&[], &[instance("i-7", 3)]);
        assert!(view.unprovisioned.is_empty());
        assert_eq!(view.to_stop, ids(&["i-7"]));
    }

    #[test]
    fn test_unrecorded_instance_is_not_adopted() {
        // Started for machine 0, but the write-back never happened.
        let view = ReconciliationView::compute(
            &[machine(0, Life::Alive, None)],
            &[instance("i-0", 0)]
        );
        assert_eq!(view.unprovisioned, vec![MachineId::from_index(0)]);
        assert_eq!(view.to_stop, ids(&["i-0"]));
    }

    #[test]
    fn test_dead_and_dying_machines() {
        let view = ReconciliationView::compute(
            &[
                machine(0, Life::Dying, Some("i-0")),
                machine(1, Life::Dead, Some("i-1")),
                machine(2, Life::Dying, None),
            ],
            &[instance("i-0", 0), instance("i-1", 1)]
        );
        assert!(view.unprovisioned.is_empty());
        assert_eq!(view.to_stop, ids(&["i-1"]));
        assert_eq!(view.known, 1);
    }


    #[test]
    fn test_converged_with_missing_instance() {
        let view = ReconciliationView::compute(
            &[machine(0, Life::Alive, Some("i-0"))],
            &[]
        );
        assert!(view.is_converged());
        assert_eq!(
            view.missing,
            vec![(MachineId::from_index(0), InstanceId::parse("i-0").unwrap())]
        );
    }
}
