//! Resource allocation policy.
//!
//! The coordinator only sees the [`Allocator`] trait. The default
//! implementation, [`HierarchicalAllocator`], hands out each worker's free
//! resources to frameworks in the order chosen by a pluggable [`Sorter`];
//! [`DrfSorter`] (dominant resource fairness) is the default sorter.
//!
//! The allocator owns its sorter: dropping the allocator releases both.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use minicluster_id::{FrameworkId, WorkerId};
use tracing::{debug, warn};

use crate::resources::Resources;

/// Resources offered to one framework on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub framework_id: FrameworkId,
    pub worker_id: WorkerId,
    pub resources: Resources,
}

/// Allocator interface used by the coordinator.
pub trait Allocator: Send + Sync {
    fn name(&self) -> &str;

    fn add_worker(&self, worker_id: WorkerId, total: Resources);

    /// Removes a worker and returns its outstanding allocations to the policy.
    fn remove_worker(&self, worker_id: &WorkerId);

    fn add_framework(&self, framework_id: FrameworkId);

    /// Removes a framework and frees everything allocated to it.
    fn remove_framework(&self, framework_id: &FrameworkId);

    /// Returns resources a framework no longer uses.
    fn release(&self, framework_id: &FrameworkId, worker_id: &WorkerId, resources: &Resources);

    /// Offers all currently free resources.
    fn allocate(&self) -> Vec<Offer>;
}

// =============================================================================
// Sorter policy
// =============================================================================

/// Fairness policy deciding which framework is offered resources next.
pub trait Sorter: Send {
    fn add(&mut self, client: FrameworkId);

    fn remove(&mut self, client: &FrameworkId);

    fn allocated(&mut self, client: &FrameworkId, resources: &Resources);

    fn unallocated(&mut self, client: &FrameworkId, resources: &Resources);

    /// Updates the cluster total used to compute shares.
    fn set_total(&mut self, total: Resources);

    /// Clients in the order they should receive offers.
    fn sort(&self) -> Vec<FrameworkId>;
}

#[derive(Debug)]
struct Client {
    allocation: Resources,
    seq: u64,
}

/// Dominant resource fairness.
///
/// A client's dominant share is its largest allocated fraction of any
/// resource. Clients with the lowest dominant share go first; ties go to the
/// client added earliest.
#[derive(Debug, Default)]
pub struct DrfSorter {
    clients: BTreeMap<FrameworkId, Client>,
    total: Resources,
    next_seq: u64,
}

impl DrfSorter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dominant_share(&self, client: &FrameworkId) -> f64 {
        self.clients
            .get(client)
            .map(|c| self.share_of(&c.allocation))
            .unwrap_or(0.0)
    }

    fn share_of(&self, allocation: &Resources) -> f64 {
        allocation
            .iter()
            .filter_map(|(name, used)| {
                let total = self.total.get(name)?;
                (total > 0.0).then(|| used / total)
            })
            .fold(0.0, f64::max)
    }
}

impl Sorter for DrfSorter {
    fn add(&mut self, client: FrameworkId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.clients.entry(client).or_insert(Client {
            allocation: Resources::new(),
            seq,
        });
    }

    fn remove(&mut self, client: &FrameworkId) {
        self.clients.remove(client);
    }

    fn allocated(&mut self, client: &FrameworkId, resources: &Resources) {
        if let Some(c) = self.clients.get_mut(client) {
            c.allocation += resources;
        }
    }

    fn unallocated(&mut self, client: &FrameworkId, resources: &Resources) {
        if let Some(c) = self.clients.get_mut(client) {
            c.allocation -= resources;
        }
    }

    fn set_total(&mut self, total: Resources) {
        self.total = total;
    }

    fn sort(&self) -> Vec<FrameworkId> {
        let mut order: Vec<(f64, u64, FrameworkId)> = self
            .clients
            .iter()
            .map(|(id, c)| (self.share_of(&c.allocation), c.seq, *id))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        order.into_iter().map(|(_, _, id)| id).collect()
    }
}

// =============================================================================
// Hierarchical allocator
// =============================================================================

#[derive(Debug, Default)]
struct WorkerSlot {
    total: Resources,
    allocated: Resources,
}

struct AllocatorState {
    policy: Box<dyn Sorter>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    allocations: BTreeMap<(FrameworkId, WorkerId), Resources>,
}

impl AllocatorState {
    fn refresh_total(&mut self) {
        let mut total = Resources::new();
        for slot in self.workers.values() {
            total += &slot.total;
        }
        self.policy.set_total(total);
    }

    fn free(&mut self, framework_id: &FrameworkId, worker_id: &WorkerId, resources: &Resources) {
        if let Some(slot) = self.workers.get_mut(worker_id) {
            slot.allocated -= resources;
        }
        if let Some(held) = self.allocations.get_mut(&(*framework_id, *worker_id)) {
            *held -= resources;
            if held.is_empty() {
                self.allocations.remove(&(*framework_id, *worker_id));
            }
        }
        self.policy.unallocated(framework_id, resources);
    }
}

/// Offers each worker's free resources to the framework the policy ranks first.
pub struct HierarchicalAllocator {
    state: Mutex<AllocatorState>,
}

impl HierarchicalAllocator {
    pub fn new(policy: Box<dyn Sorter>) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                policy,
                workers: BTreeMap::new(),
                allocations: BTreeMap::new(),
            }),
        }
    }

    /// Allocator backed by a fresh [`DrfSorter`].
    pub fn with_drf() -> Self {
        Self::new(Box::new(DrfSorter::new()))
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HierarchicalAllocator {
    fn default() -> Self {
        Self::with_drf()
    }
}

impl Allocator for HierarchicalAllocator {
    fn name(&self) -> &str {
        "hierarchical-drf"
    }

    fn add_worker(&self, worker_id: WorkerId, total: Resources) {
        let mut state = self.lock();
        debug!(worker_id = %worker_id, resources = %total, "Allocator added worker");
        state.workers.insert(
            worker_id,
            WorkerSlot {
                total,
                allocated: Resources::new(),
            },
        );
        state.refresh_total();
    }

    fn remove_worker(&self, worker_id: &WorkerId) {
        let mut state = self.lock();
        if state.workers.remove(worker_id).is_none() {
            warn!(worker_id = %worker_id, "Allocator asked to remove unknown worker");
            return;
        }

        let held: Vec<_> = state
            .allocations
            .iter()
            .filter(|((_, w), _)| w == worker_id)
            .map(|((f, w), r)| (*f, *w, r.clone()))
            .collect();
        for (framework_id, worker_id, resources) in held {
            state.policy.unallocated(&framework_id, &resources);
            state.allocations.remove(&(framework_id, worker_id));
        }

        state.refresh_total();
        debug!(worker_id = %worker_id, "Allocator removed worker");
    }

    fn add_framework(&self, framework_id: FrameworkId) {
        self.lock().policy.add(framework_id);
    }

    fn remove_framework(&self, framework_id: &FrameworkId) {
        let mut state = self.lock();
        let held: Vec<_> = state
            .allocations
            .iter()
            .filter(|((f, _), _)| f == framework_id)
            .map(|((_, w), r)| (*w, r.clone()))
            .collect();
        for (worker_id, resources) in held {
            state.free(framework_id, &worker_id, &resources);
        }
        state.policy.remove(framework_id);
    }

    fn release(&self, framework_id: &FrameworkId, worker_id: &WorkerId, resources: &Resources) {
        self.lock().free(framework_id, worker_id, resources);
    }

    fn allocate(&self) -> Vec<Offer> {
        let mut state = self.lock();
        let mut offers = Vec::new();

        let worker_ids: Vec<WorkerId> = state.workers.keys().copied().collect();
        for worker_id in worker_ids {
            let Some(framework_id) = state.policy.sort().into_iter().next() else {
                break;
            };

            let Some(slot) = state.workers.get_mut(&worker_id) else {
                continue;
            };
            let mut free = slot.total.clone();
            free -= &slot.allocated;
            if free.is_empty() {
                continue;
            }
            slot.allocated += &free;

            *state
                .allocations
                .entry((framework_id, worker_id))
                .or_default() += &free;
            state.policy.allocated(&framework_id, &free);

            offers.push(Offer {
                framework_id,
                worker_id,
                resources: free,
            });
        }

        offers
    }
}
