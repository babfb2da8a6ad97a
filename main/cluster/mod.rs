//! The cluster resource model: topology, per-host socket occupancy, the
//! global free-processor pool, and the waiting/execution queues.

pub mod host;
pub mod xunit;

use procset::ProcSet;

use crate::database::{Heatmap, PairSpeedup};
use crate::error::SimError;
use crate::jobs::Job;
use host::Host;
use xunit::ExecUnit;

#[derive(Debug, Clone)]
pub struct Cluster {
    pub nodes: u32,
    pub socket_conf: Vec<u32>,
    /// Hosts in creation order; processor IDs are contiguous per host,
    /// socket by socket.
    pub hosts: Vec<Host>,
    /// The cluster-wide pool of free processors; the single source of truth
    /// for reservations.
    pub total_procs: ProcSet,
    pub waiting_queue: Vec<Job>,
    pub execution_list: Vec<ExecUnit>,
    /// Current simulated time.
    pub makespan: f64,
}

impl Cluster {
    pub fn new(nodes: u32, socket_conf: Vec<u32>) -> Self {
        let mut cluster = Self {
            nodes,
            socket_conf,
            hosts: Vec::new(),
            total_procs: ProcSet::new(),
            waiting_queue: Vec::new(),
            execution_list: Vec::new(),
            makespan: 0.0,
        };
        cluster.setup();
        cluster
    }

    /// (Re)build the hosts and free pool; empties the queues and resets the
    /// clock.
    pub fn setup(&mut self) {
        assert!(!self.socket_conf.is_empty());
        self.hosts.clear();

        let mut next_id = 0u32;
        for n in 0..self.nodes {
            let mut spans = Vec::with_capacity(self.socket_conf.len());
            for &cores in &self.socket_conf {
                spans.push(ProcSet::from_range(next_id, next_id + cores - 1));
                next_id += cores;
            }
            self.hosts.push(Host::new(format!("host{n}"), spans));
        }

        self.total_procs = if next_id == 0 {
            ProcSet::new()
        } else {
            ProcSet::from_range(0, next_id - 1)
        };
        self.waiting_queue.clear();
        self.execution_list.clear();
        self.makespan = 0.0;
    }

    pub fn cores_per_node(&self) -> u32 {
        self.socket_conf.iter().sum()
    }

    pub fn half_node_cores(&self) -> u32 {
        (self.cores_per_node() / 2).max(1)
    }

    pub fn total_cores(&self) -> u32 {
        self.nodes * self.cores_per_node()
    }

    pub fn get_idle_cores(&self) -> u32 {
        self.total_procs.len()
    }

    /// Fraction of processors currently in use.
    pub fn utilization(&self) -> f64 {
        1.0 - f64::from(self.get_idle_cores()) / f64::from(self.total_cores())
    }

    /// The socket configuration of an exclusive placement.
    pub fn full_socket_allocation(&self) -> Vec<u32> {
        self.socket_conf.clone()
    }

    /// The socket configuration of a half-node placement: half of each
    /// socket.
    pub fn half_socket_allocation(&self) -> Vec<u32> {
        self.socket_conf.iter().map(|&c| (c / 2).max(1)).collect()
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Hosts able to contribute `socket_conf[i]` free cores on each socket,
    /// in insertion order, stopping once the accumulated cores cover
    /// `req_cores`. Empty when the demand cannot be covered.
    pub fn find_suitable_nodes(
        &self,
        req_cores: u32,
        socket_conf: &[u32],
    ) -> Vec<(String, Vec<ProcSet>)> {
        let cores_per_host: u32 = socket_conf.iter().sum();
        let mut remaining = i64::from(req_cores);
        let mut to_be_allocated = Vec::new();

        for host in &self.hosts {
            if remaining <= 0 {
                break;
            }
            let fits = host.is_idle()
                || socket_conf
                    .iter()
                    .zip(&host.sockets)
                    .all(|(&want, free)| want <= free.len());
            if fits {
                let psets = socket_conf
                    .iter()
                    .enumerate()
                    .map(|(i, &want)| host.sockets[i].take(want))
                    .collect();
                to_be_allocated.push((host.name.clone(), psets));
                remaining -= i64::from(cores_per_host);
            }
        }

        if remaining <= 0 {
            to_be_allocated
        } else {
            Vec::new()
        }
    }

    /// Whole idle nodes from the free pool covering at least `req_cores`,
    /// or `None` when not enough fully-free nodes exist. Used by spread and
    /// pair placements, which carve half-node slices out of the result.
    pub fn assign_nodes(&self, req_cores: u32) -> Option<ProcSet> {
        let mut picked = ProcSet::new();
        let mut got = 0u32;
        for host in &self.hosts {
            if got >= req_cores {
                break;
            }
            if host.is_idle() {
                let span = host.span();
                debug_assert!(self.total_procs.is_superset(&span));
                got += span.len();
                picked |= &span;
            }
        }
        (got >= req_cores).then_some(picked)
    }

    /// Reserve `cores` for `sig`: subtract from the free pool and from each
    /// owning host's sockets. Returns the per-host slices, in host order.
    pub fn reserve(&mut self, sig: &str, cores: &ProcSet) -> Vec<(String, ProcSet)> {
        debug_assert!(self.total_procs.is_superset(cores));
        self.total_procs -= cores;

        let mut parts = Vec::new();
        for host in &mut self.hosts {
            let part = &host.span() & cores;
            if !part.is_empty() {
                host.reserve(sig, &part);
                parts.push((host.name.clone(), part));
            }
        }
        parts
    }

    /// Return `cores` held by `sig` to the free pool and the owning hosts.
    pub fn release(&mut self, sig: &str, cores: &ProcSet) {
        for host in &mut self.hosts {
            let part = &host.span() & cores;
            if !part.is_empty() {
                host.release(sig, &part);
            }
        }
        self.total_procs |= cores;
    }

    /// Re-attribute already-reserved `cores` from one signature to another
    /// on every owning host. The free pool is untouched.
    pub fn transfer(&mut self, from_sig: &str, cores: &ProcSet, to_sig: &str) {
        for host in &mut self.hosts {
            let part = &host.span() & cores;
            if !part.is_empty() {
                host.transfer(from_sig, &part, to_sig);
            }
        }
    }

    /// Host names owning any of `cores`, in host order.
    pub fn hosts_of(&self, cores: &ProcSet) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| !(&h.span() & cores).is_empty())
            .map(|h| h.name.clone())
            .collect()
    }

    /// Split `cores` into per-host slices, in host order.
    pub fn split_by_host(&self, cores: &ProcSet) -> Vec<(String, ProcSet)> {
        self.hosts
            .iter()
            .filter_map(|h| {
                let part = &h.span() & cores;
                (!part.is_empty()).then(|| (h.name.clone(), part))
            })
            .collect()
    }

    /// Indexes of execution units that still carry an idle tail.
    pub fn nonfilled_xunits(&self) -> impl Iterator<Item = usize> + '_ {
        self.execution_list
            .iter()
            .enumerate()
            .filter(|(_, unit)| !unit.is_filled())
            .map(|(i, _)| i)
    }

    /// Index of the execution unit containing `job_id`.
    pub fn xunit_of(&self, job_id: i64) -> Option<usize> {
        self.execution_list.iter().position(|u| u.contains(job_id))
    }
}

/// Re-scale `job`'s remaining time for co-execution next to `co_job_name`,
/// per the heatmap. Returns `Ok(false)` when the pairing is unknown (the
/// caller skips it); fails only on a non-convergent factor.
pub fn ratio_rem_time(heatmap: &Heatmap, job: &mut Job, co_job_name: &str) -> Result<bool, SimError> {
    match heatmap.get(&job.job_name, co_job_name) {
        PairSpeedup::Defined(speedup) => {
            job.rescale_speedup(speedup)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
