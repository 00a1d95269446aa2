//! VM identities, states and records.
//!
//! A [`VmRecord`] is the supervisor's internal view of one managed VM. It is
//! created and mutated only by the lifecycle engine; callers only ever see a
//! [`VmSnapshot`], which omits the driver handle and the ledger token.

pub mod backend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::ReservationToken;

pub use backend::{HostHandle, HypervisorDriver, RuntimeInfo};

/// Unique VM identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("vm-{}", uuid::Uuid::new_v4().simple()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// VM lifecycle state.
///
/// ```text
/// Pending  -> Running | Failed
/// Running  -> Stopping
/// Stopping -> Stopped | Failed
/// Stopped  -> Destroyed
/// Failed   -> Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Reservation held, driver provisioning in progress.
    Pending,
    /// Driver reported the VM up; handle held.
    Running,
    /// Teardown in progress; handle held.
    Stopping,
    /// Torn down cleanly.
    Stopped,
    /// Provisioning or teardown failed.
    Failed,
    /// Removed; kept only as a tombstone.
    Destroyed,
}

impl VmState {
    /// Whether the transition `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Destroyed)
                | (Failed, Destroyed)
        )
    }

    /// States in which host capacity is reserved.
    pub fn holds_reservation(self) -> bool {
        matches!(self, VmState::Pending | VmState::Running | VmState::Stopping)
    }

    /// States in which the driver handle is held.
    pub fn holds_handle(self) -> bool {
        matches!(self, VmState::Running | VmState::Stopping)
    }

    /// States in which a driver call is in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, VmState::Pending | VmState::Stopping)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Pending => write!(f, "pending"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Failed => write!(f, "failed"),
            VmState::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(VmState::Pending),
            "running" => Ok(VmState::Running),
            "stopping" => Ok(VmState::Stopping),
            "stopped" => Ok(VmState::Stopped),
            "failed" => Ok(VmState::Failed),
            "destroyed" => Ok(VmState::Destroyed),
            other => Err(format!("unknown VM state: {}", other)),
        }
    }
}

/// Record of a VM in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique id.
    pub id: VmId,
    /// Caller-supplied label.
    pub name: String,
    /// Reserved memory in MiB.
    pub memory_mb: u32,
    /// Reserved vCPUs.
    pub vcpus: u32,
    /// Lifecycle state.
    pub state: VmState,
    /// Driver handle, present while Running or Stopping.
    #[serde(default)]
    pub host_handle: Option<HostHandle>,
    /// Ledger token, present while capacity is held.
    #[serde(default)]
    pub reservation: Option<ReservationToken>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last state change.
    pub last_transition_at: DateTime<Utc>,
    /// Failure that moved the VM to Failed.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl VmRecord {
    /// Create a Pending record holding `reservation`.
    pub fn pending(id: VmId, name: String, reservation: ReservationToken) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            memory_mb: reservation.memory_mb(),
            vcpus: reservation.vcpus(),
            state: VmState::Pending,
            host_handle: None,
            reservation: Some(reservation),
            created_at: now,
            last_transition_at: now,
            last_error: None,
        }
    }

    /// Move to `next`, stamping the transition time.
    ///
    /// Callers check the edge with [`VmState::can_transition_to`] first.
    pub(crate) fn set_state(&mut self, next: VmState) {
        self.state = next;
        self.last_transition_at = Utc::now();
    }

    /// Caller-visible copy of this record.
    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            memory_mb: self.memory_mb,
            vcpus: self.vcpus,
            state: self.state,
            created_at: self.created_at,
            last_transition_at: self.last_transition_at,
            last_error: self.last_error.clone(),
            runtime: None,
        }
    }
}

/// Caller-visible view of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    /// Unique id.
    pub id: VmId,
    /// Caller-supplied label.
    pub name: String,
    /// Reserved memory in MiB.
    pub memory_mb: u32,
    /// Reserved vCPUs.
    pub vcpus: u32,
    /// Lifecycle state.
    pub state: VmState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last state change.
    pub last_transition_at: DateTime<Utc>,
    /// Failure that moved the VM to Failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Live metrics from the driver, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Capacity, ResourceLedger};

    #[test]
    fn test_transition_graph() {
        use VmState::*;
        let all = [Pending, Running, Stopping, Stopped, Failed, Destroyed];
        let allowed = [
            (Pending, Running),
            (Pending, Failed),
            (Running, Stopping),
            (Stopping, Stopped),
            (Stopping, Failed),
            (Stopped, Destroyed),
            (Failed, Destroyed),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }

        // No resurrection.
        assert!(all.iter().all(|s| !Destroyed.can_transition_to(*s)));
    }

    #[test]
    fn test_state_round_trips_through_display() {
        use VmState::*;
        for state in [Pending, Running, Stopping, Stopped, Failed, Destroyed] {
            assert_eq!(state.to_string().parse::<VmState>().unwrap(), state);
        }
        assert!("paused".parse::<VmState>().is_err());
    }

    #[test]
    fn test_snapshot_hides_handle() {
        let ledger = ResourceLedger::new(Capacity::new(512, 2));
        let token = ledger.try_reserve(128, 1).unwrap();
        let mut record = VmRecord::pending(VmId::generate(), "a".into(), token);
        record.host_handle = Some(HostHandle::Pid(4242));
        record.set_state(VmState::Running);

        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert!(json.get("host_handle").is_none());
        assert!(json.get("reservation").is_none());
        assert_eq!(json["state"], "running");
        assert_eq!(json["memory_mb"], 128);
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = VmId::generate();
        let b = VmId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("vm-"));
    }
}
