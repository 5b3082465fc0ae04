//! conductor-provider
//!
//! The infrastructure-provider boundary: an `InstanceDriver` trait abstracts
//! over whatever cloud SDK actually starts and stops VMs. This crate defines
//! the instance lifecycle alphabet (`InstanceState`) and the driver contract;
//! it does not implement a real cloud SDK (out of scope — see spec §1).

use std::collections::BTreeMap;
use std::fmt;

/// Tagged variant over the provider's VM lifecycle. `READY` is a
/// conductor-level refinement of `RUNNING` (the database port answers TCP);
/// no provider ever reports it directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceState {
    Nonexistent,
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Ready,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Nonexistent => "NONEXISTENT",
            InstanceState::Pending => "PENDING",
            InstanceState::Running => "RUNNING",
            InstanceState::ShuttingDown => "SHUTTING_DOWN",
            InstanceState::Terminated => "TERMINATED",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Ready => "READY",
        };
        f.write_str(s)
    }
}

/// Map a provider state code onto `InstanceState`. Codes follow the
/// well-known EC2-style convention: 0 pending, 16 running, 32 shutting-down,
/// 48 terminated, 64 stopping, 80 stopped.
pub fn state_from_code(code: u16) -> Option<InstanceState> {
    match code {
        0 => Some(InstanceState::Pending),
        16 => Some(InstanceState::Running),
        32 => Some(InstanceState::ShuttingDown),
        48 => Some(InstanceState::Terminated),
        64 => Some(InstanceState::Stopping),
        80 => Some(InstanceState::Stopped),
        _ => None,
    }
}

/// One instance as reported by the provider, before any conductor-level
/// refinement (READY promotion happens in `conductor-minion`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
}

/// Error surfaced by a failed provider RPC. Best-effort: the poller logs
/// this and retries on the next tick; it never aborts the loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderError {
    pub instance_id: String,
    pub message: String,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error for {}: {}", self.instance_id, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Error raised when discovery finds an instance with no `Name` tag. This is
/// fatal at discovery time: every minion must have a name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnnamedInstance {
    pub instance_id: String,
}

impl fmt::Display for UnnamedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance {} has no Name tag", self.instance_id)
    }
}

impl std::error::Error for UnnamedInstance {}

/// Abstraction over the cloud provider's instance API. Implementations are
/// constructor-injected (never a process-wide global).
pub trait InstanceDriver: Send + Sync {
    /// List live instances matching all of `tags`. Instances in the
    /// TERMINATED state are omitted by the implementation. An instance
    /// without a `Name` tag is a discovery-time error.
    fn list_by_tags(&self, tags: &BTreeMap<String, String>) -> Result<Vec<Instance>, UnnamedInstance>;

    /// Re-describe a single instance (used by `Minion::refresh`).
    fn describe(&self, instance_id: &str) -> Result<Instance, ProviderError>;

    /// Idempotent start/stop. Best-effort: failures are surfaced as
    /// `ProviderError` and never panic.
    fn start(&self, instance_id: &str) -> Result<(), ProviderError>;
    fn stop(&self, instance_id: &str) -> Result<(), ProviderError>;
}
