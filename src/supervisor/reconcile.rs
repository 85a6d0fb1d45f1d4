use nix::unistd::Pid;

use crate::registry::{WorkerProcess, WorkerRegistry};

/// One corrective step toward the target pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Spawn { slot: usize },
    /// Ask the worker to finish its current job and exit.
    Drain { pid: Pid, slot: usize },
}

/// Minimal set of actions converging the registry on `target` workers.
///
/// Drains come first, highest slot first. An active worker is drained when
/// its slot is out of range or when there are still more active workers
/// than `target`. Spawns then fill free slots in `[0, target)` from the
/// bottom, skipping slots still held by draining workers; those get refilled
/// once the draining worker's exit comes in.
pub fn plan(target: usize, registry: &WorkerRegistry) -> Vec<Action> {
    let mut active: Vec<&WorkerProcess> = registry.active().collect();
    active.sort_unstable_by(|a, b| b.slot.cmp(&a.slot));

    let mut actions = Vec::new();
    let mut remaining = active.len();
    for worker in active {
        if worker.slot >= target || remaining > target {
            actions.push(Action::Drain {
                pid: worker.pid,
                slot: worker.slot,
            });
            remaining -= 1;
        }
    }

    let missing = target.saturating_sub(remaining);
    if missing > 0 {
        let occupied = registry.occupied_slots();
        actions.extend(
            (0..target)
                .filter(|slot| !occupied.contains(slot))
                .take(missing)
                .map(|slot| Action::Spawn { slot }),
        );
    }
    actions
}
