//! Resource requests and reservations.

use serde::{Deserialize, Serialize};

/// Resources a stage declares in the call graph.
///
/// Zero means "use the job manager's default"; a negative value means
/// "as much as the job manager allows".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// Requested threads.
    pub threads: i32,
    /// Requested resident memory in GB.
    pub mem_gb: i32,
    /// Requested virtual memory in GB.
    pub vmem_gb: i32,
    /// Special scheduler resource name, remapped through `MRO_JOBRESOURCES`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special: Option<String>,
}

impl ResourceRequest {
    /// Creates a request for the given threads and memory.
    #[must_use]
    pub fn new(threads: i32, mem_gb: i32) -> Self {
        Self {
            threads,
            mem_gb,
            ..Self::default()
        }
    }

    /// Sets the virtual memory request.
    #[must_use]
    pub fn with_vmem_gb(mut self, vmem_gb: i32) -> Self {
        self.vmem_gb = vmem_gb;
        self
    }

    /// Sets the special resource name.
    #[must_use]
    pub fn with_special(mut self, special: impl Into<String>) -> Self {
        self.special = Some(special.into());
        self
    }
}

/// A normalised reservation granted by a job manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    /// Reserved threads.
    pub threads: u32,
    /// Reserved resident memory in GB.
    pub mem_gb: u32,
    /// Reserved virtual memory in GB, zero when unlimited.
    pub vmem_gb: u32,
    /// Special scheduler resource, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special: Option<String>,
}

impl JobResources {
    /// Creates a reservation for the given threads and memory.
    #[must_use]
    pub fn new(threads: u32, mem_gb: u32) -> Self {
        Self {
            threads,
            mem_gb,
            ..Self::default()
        }
    }

    /// Reserved memory in MB, the unit of the local memory semaphore.
    #[must_use]
    pub fn mem_mb(&self) -> u64 {
        u64::from(self.mem_gb) * 1024
    }
}
