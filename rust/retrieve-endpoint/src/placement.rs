/// Where the endpoints of a parallel retrieve cursor live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPlacement {
    /// One endpoint on the coordinator itself.
    Coordinator,
    /// One endpoint on a single worker.
    SingleWorker(u32),
    /// One endpoint on each listed worker.
    Workers(Vec<u32>),
    /// One endpoint on every worker.
    AllWorkers,
}

/// Which process is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Coordinator,
    Worker(u32),
}

impl EndpointPlacement {
    /// Whether `role` declares an endpoint under this placement.
    pub fn hosts_endpoint(&self, role: ProcessRole) -> bool {
        match (self, role) {
            (Self::Coordinator, ProcessRole::Coordinator) => true,
            (Self::SingleWorker(id), ProcessRole::Worker(w)) => *id == w,
            (Self::Workers(ids), ProcessRole::Worker(w)) => ids.contains(&w),
            (Self::AllWorkers, ProcessRole::Worker(_)) => true,
            _ => false,
        }
    }

    /// Number of READY acks the coordinator should wait for.
    ///
    /// An endpoint on the coordinator needs no ack.
    pub fn expected_endpoints(&self, worker_count: u32) -> usize {
        match self {
            Self::Coordinator => 0,
            Self::SingleWorker(id) => usize::from(*id < worker_count),
            Self::Workers(ids) => {
                let mut ids: Vec<u32> = ids.iter().copied().filter(|&w| w < worker_count).collect();
                ids.sort_unstable();
                ids.dedup();
                ids.len()
            }
            Self::AllWorkers => worker_count as usize,
        }
    }
}
