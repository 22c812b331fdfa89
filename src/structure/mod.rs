//! Core structural data model: service identity, wire addressing, peer
//! records and participant/system state enums shared by every other module.

pub mod labels;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use labels::{match_labels, match_media_type, LabelKind, MatchingLabel};

/// Deterministic, wire-stable hash of a participant name, used as the
/// `participantId` half of an [`Endpoint`] address. FNV-1a is used instead of
/// the standard library's randomized `SipHash` because the value must be
/// identical across every peer and across process restarts.
pub fn hash_participant_name(name: &str) -> u64 {
  const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
  const FNV_PRIME: u64 = 0x100000001b3;
  let mut hash = FNV_OFFSET_BASIS;
  for byte in name.as_bytes() {
    hash ^= *byte as u64;
    hash = hash.wrapping_mul(FNV_PRIME);
  }
  hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
  Link,
  Controller,
  SimulationController,
  InternalController,
  RequestReply,
  Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
  Can,
  Lin,
  Ethernet,
  FlexRay,
  Data,
  Rpc,
  Undefined,
}

/// Identity of a controller instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
  pub participant_name: String,
  pub network_name: String,
  pub service_name: String,
  pub service_type: ServiceType,
  pub network_type: NetworkType,
  pub service_id: u32,
  pub supplemental_data: HashMap<String, String>,
}

impl ServiceDescriptor {
  pub fn endpoint(&self) -> Endpoint {
    Endpoint {
      participant_id: hash_participant_name(&self.participant_name),
      service_id: self.service_id,
    }
  }

  pub fn supplemental(&self, key: &str) -> Option<&str> {
    self.supplemental_data.get(key).map(String::as_str)
  }
}

/// Wire address of a service: `(participantId, serviceId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
  pub participant_id: u64,
  pub service_id: u32,
}

/// A peer's connection-establishment record, cached by every other
/// participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
  pub participant_name: String,
  pub participant_id: u64,
  pub acceptor_uris: Vec<String>,
  pub capabilities: String,
}

impl PeerInfo {
  pub fn new(participant_name: impl Into<String>, acceptor_uris: Vec<String>, capabilities: impl Into<String>) -> Self {
    let participant_name = participant_name.into();
    let participant_id = hash_participant_name(&participant_name);
    PeerInfo { participant_name, participant_id, acceptor_uris, capabilities: capabilities.into() }
  }
}

/// Participant lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
  Invalid,
  ServicesCreated,
  CommunicationInitializing,
  CommunicationInitialized,
  ReadyToRun,
  Running,
  Paused,
  Stopping,
  Stopped,
  ShuttingDown,
  Shutdown,
  Aborting,
  Error,
}

impl std::fmt::Display for ParticipantState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self:?}")
  }
}

/// Aggregated system state over the required-participant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemState {
  Invalid,
  ServicesCreated,
  CommunicationInitializing,
  CommunicationInitialized,
  ReadyToRun,
  Running,
  Paused,
  Stopping,
  Stopped,
  ShuttingDown,
  Shutdown,
  Aborting,
  Error,
}

impl Default for SystemState {
  fn default() -> Self {
    SystemState::Invalid
  }
}

impl std::fmt::Display for SystemState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self:?}")
  }
}

/// One participant's self-reported status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
  pub participant_name: String,
  pub state: ParticipantState,
  pub enter_reason: String,
  /// Nanoseconds since the Unix epoch.
  pub enter_time: i64,
  pub refresh_time: i64,
}

impl ParticipantStatus {
  pub fn invalid(participant_name: impl Into<String>) -> Self {
    ParticipantStatus {
      participant_name: participant_name.into(),
      state: ParticipantState::Invalid,
      enter_reason: String::new(),
      enter_time: 0,
      refresh_time: 0,
    }
  }
}
