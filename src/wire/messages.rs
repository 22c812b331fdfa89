//! Wire message kinds and framing: every message begins with a
//! fixed `{total_length: u32 LE, kind: u8}` header followed by a
//! kind-specific body.

use std::collections::HashMap;

use crate::error::CodecError;
use crate::structure::{
  NetworkType, ParticipantStatus as DomainParticipantStatus, PeerInfo, ServiceDescriptor, ServiceType,
};

use super::buffer::{WireReader, WireWriter};
use super::protocol_version::ProtocolVersion;

pub const FRAME_HEADER_LEN: usize = 5; // u32 length + u8 kind
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireKind {
  ParticipantAnnouncement = 1,
  ParticipantAnnouncementReply = 2,
  KnownParticipants = 3,
  PeerAnnouncement = 4,
  PeerShutdown = 5,
  ServiceDiscoveryEvent = 6,
  DataMessage = 7,
  FunctionCall = 8,
  FunctionCallResponse = 9,
  NextSimTask = 10,
  ParticipantStatus = 11,
  WorkflowConfiguration = 12,
  ParticipantNotification = 13,
}

impl WireKind {
  fn from_u8(v: u8) -> Result<Self, CodecError> {
    use WireKind::*;
    Ok(match v {
      1 => ParticipantAnnouncement,
      2 => ParticipantAnnouncementReply,
      3 => KnownParticipants,
      4 => PeerAnnouncement,
      5 => PeerShutdown,
      6 => ServiceDiscoveryEvent,
      7 => DataMessage,
      8 => FunctionCall,
      9 => FunctionCallResponse,
      10 => NextSimTask,
      11 => ParticipantStatus,
      12 => WorkflowConfiguration,
      13 => ParticipantNotification,
      other => return Err(CodecError::UnknownKind(other)),
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
  Success,
  Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAnnouncement {
  pub peer_info: PeerInfo,
  pub protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAnnouncementReply {
  pub status: HandshakeStatus,
  pub protocol_version: ProtocolVersion,
  pub remote_peer_info: PeerInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownParticipants {
  pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerAnnouncement {
  pub new_peer: PeerInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerShutdown {
  pub participant_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDiscoveryEventKind {
  ServiceCreated,
  ServiceRemoved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDiscoveryEvent {
  pub kind: ServiceDiscoveryEventKind,
  pub descriptor: ServiceDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
  pub network: String,
  /// Nanoseconds since the Unix epoch (sync) or a virtual-time count (autonomous sender's choice).
  pub timestamp: i64,
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
  pub network: String,
  pub call_uuid: u128,
  pub argument_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallStatus {
  Success,
  ServerNotReachable,
  UndefinedError,
  InternalServerError,
  Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallResponse {
  pub network: String,
  pub call_uuid: u128,
  pub status: RpcCallStatus,
  pub result_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSimTask {
  pub time_point_ns: i64,
  pub duration_ns: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfiguration {
  pub required_participants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantNotificationKind {
  Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantNotification {
  pub kind: ParticipantNotificationKind,
}

/// The full set of messages that can appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  ParticipantAnnouncement(ParticipantAnnouncement),
  ParticipantAnnouncementReply(ParticipantAnnouncementReply),
  KnownParticipants(KnownParticipants),
  PeerAnnouncement(PeerAnnouncement),
  PeerShutdown(PeerShutdown),
  ServiceDiscoveryEvent(ServiceDiscoveryEvent),
  DataMessage(DataMessage),
  FunctionCall(FunctionCall),
  FunctionCallResponse(FunctionCallResponse),
  NextSimTask(NextSimTask),
  ParticipantStatus(DomainParticipantStatus),
  WorkflowConfiguration(WorkflowConfiguration),
  ParticipantNotification(ParticipantNotification),
}

impl Message {
  fn kind(&self) -> WireKind {
    match self {
      Message::ParticipantAnnouncement(_) => WireKind::ParticipantAnnouncement,
      Message::ParticipantAnnouncementReply(_) => WireKind::ParticipantAnnouncementReply,
      Message::KnownParticipants(_) => WireKind::KnownParticipants,
      Message::PeerAnnouncement(_) => WireKind::PeerAnnouncement,
      Message::PeerShutdown(_) => WireKind::PeerShutdown,
      Message::ServiceDiscoveryEvent(_) => WireKind::ServiceDiscoveryEvent,
      Message::DataMessage(_) => WireKind::DataMessage,
      Message::FunctionCall(_) => WireKind::FunctionCall,
      Message::FunctionCallResponse(_) => WireKind::FunctionCallResponse,
      Message::NextSimTask(_) => WireKind::NextSimTask,
      Message::ParticipantStatus(_) => WireKind::ParticipantStatus,
      Message::WorkflowConfiguration(_) => WireKind::WorkflowConfiguration,
      Message::ParticipantNotification(_) => WireKind::ParticipantNotification,
    }
  }

  /// Encode the full frame (header + body) for sending.
  pub fn encode_frame(&self, protocol_version: ProtocolVersion) -> Vec<u8> {
    let mut body = WireWriter::new(protocol_version);
    encode_body(self, &mut body);
    let body_bytes = body.into_bytes();

    let mut frame = WireWriter::new(protocol_version);
    frame.write_u32((FRAME_HEADER_LEN + body_bytes.len()) as u32);
    frame.write_u8(self.kind() as u8);
    let mut out = frame.into_bytes();
    out.extend_from_slice(&body_bytes);
    out
  }

  /// Decode a full frame (header + body) previously produced by
  /// `encode_frame`. `frame` must contain exactly one frame's worth of bytes.
  pub fn decode_frame(frame: &[u8], protocol_version: ProtocolVersion) -> Result<Message, CodecError> {
    let mut header = WireReader::new(frame, protocol_version);
    let total_length = header.read_u32()?;
    if total_length > MAX_FRAME_LEN {
      return Err(CodecError::FrameTooLarge(total_length));
    }
    let kind = WireKind::from_u8(header.read_u8()?)?;
    let body = &frame[FRAME_HEADER_LEN..];
    let mut r = WireReader::new(body, protocol_version);
    decode_body(kind, &mut r)
  }

  /// Peek just the `total_length` from the start of a byte accumulator,
  /// without consuming anything — used by the receive path to know how many
  /// bytes still need to arrive before a frame can be dispatched.
  pub fn peek_frame_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
      return None;
    }
    let mut r = WireReader::new(buf, ProtocolVersion::CURRENT);
    r.read_u32().ok()
  }

  /// The `network` routing key this message is addressed to, if any, for
  /// `RouterTable::dispatch_to_network`. Messages outside the pub/sub and
  /// RPC families carry no such key and are handled directly by the
  /// participant instead of being routed through the network table.
  pub fn routing_network(&self) -> Option<&str> {
    match self {
      Message::DataMessage(m) => Some(&m.network),
      Message::FunctionCall(m) => Some(&m.network),
      Message::FunctionCallResponse(m) => Some(&m.network),
      _ => None,
    }
  }
}

fn encode_peer_info(w: &mut WireWriter, peer: &PeerInfo) {
  w.write_str(&peer.participant_name);
  w.write_u64(peer.participant_id);
  w.write_vec(&peer.acceptor_uris, |w, uri| w.write_str(uri));
  w.write_str(&peer.capabilities);
}

fn decode_peer_info(r: &mut WireReader) -> Result<PeerInfo, CodecError> {
  let participant_name = r.read_str()?;
  let participant_id = r.read_u64()?;
  let acceptor_uris = r.read_vec(|r| r.read_str())?;
  let capabilities = r.read_str()?;
  Ok(PeerInfo { participant_name, participant_id, acceptor_uris, capabilities })
}

fn encode_service_type(w: &mut WireWriter, t: ServiceType) {
  w.write_u8(match t {
    ServiceType::Link => 0,
    ServiceType::Controller => 1,
    ServiceType::SimulationController => 2,
    ServiceType::InternalController => 3,
    ServiceType::RequestReply => 4,
    ServiceType::Undefined => 5,
  });
}

fn decode_service_type(r: &mut WireReader) -> Result<ServiceType, CodecError> {
  Ok(match r.read_u8()? {
    0 => ServiceType::Link,
    1 => ServiceType::Controller,
    2 => ServiceType::SimulationController,
    3 => ServiceType::InternalController,
    4 => ServiceType::RequestReply,
    5 => ServiceType::Undefined,
    v => return Err(CodecError::UnknownDiscriminant { type_name: "ServiceType", value: v as u32 }),
  })
}

fn encode_network_type(w: &mut WireWriter, t: NetworkType) {
  w.write_u8(match t {
    NetworkType::Can => 0,
    NetworkType::Lin => 1,
    NetworkType::Ethernet => 2,
    NetworkType::FlexRay => 3,
    NetworkType::Data => 4,
    NetworkType::Rpc => 5,
    NetworkType::Undefined => 6,
  });
}

fn decode_network_type(r: &mut WireReader) -> Result<NetworkType, CodecError> {
  Ok(match r.read_u8()? {
    0 => NetworkType::Can,
    1 => NetworkType::Lin,
    2 => NetworkType::Ethernet,
    3 => NetworkType::FlexRay,
    4 => NetworkType::Data,
    5 => NetworkType::Rpc,
    6 => NetworkType::Undefined,
    v => return Err(CodecError::UnknownDiscriminant { type_name: "NetworkType", value: v as u32 }),
  })
}

fn encode_service_descriptor(w: &mut WireWriter, d: &ServiceDescriptor) {
  w.write_str(&d.participant_name);
  w.write_str(&d.network_name);
  w.write_str(&d.service_name);
  encode_service_type(w, d.service_type);
  encode_network_type(w, d.network_type);
  w.write_u32(d.service_id);
  w.write_string_map(&d.supplemental_data);
}

fn decode_service_descriptor(r: &mut WireReader) -> Result<ServiceDescriptor, CodecError> {
  Ok(ServiceDescriptor {
    participant_name: r.read_str()?,
    network_name: r.read_str()?,
    service_name: r.read_str()?,
    service_type: decode_service_type(r)?,
    network_type: decode_network_type(r)?,
    service_id: r.read_u32()?,
    supplemental_data: r.read_string_map()?,
  })
}

fn encode_participant_state(w: &mut WireWriter, s: crate::structure::ParticipantState) {
  use crate::structure::ParticipantState::*;
  w.write_u8(match s {
    Invalid => 0,
    ServicesCreated => 1,
    CommunicationInitializing => 2,
    CommunicationInitialized => 3,
    ReadyToRun => 4,
    Running => 5,
    Paused => 6,
    Stopping => 7,
    Stopped => 8,
    ShuttingDown => 9,
    Shutdown => 10,
    Aborting => 11,
    Error => 12,
  });
}

fn decode_participant_state(r: &mut WireReader) -> Result<crate::structure::ParticipantState, CodecError> {
  use crate::structure::ParticipantState::*;
  Ok(match r.read_u8()? {
    0 => Invalid,
    1 => ServicesCreated,
    2 => CommunicationInitializing,
    3 => CommunicationInitialized,
    4 => ReadyToRun,
    5 => Running,
    6 => Paused,
    7 => Stopping,
    8 => Stopped,
    9 => ShuttingDown,
    10 => Shutdown,
    11 => Aborting,
    12 => Error,
    v => return Err(CodecError::UnknownDiscriminant { type_name: "ParticipantState", value: v as u32 }),
  })
}

fn encode_body(msg: &Message, w: &mut WireWriter) {
  match msg {
    Message::ParticipantAnnouncement(m) => {
      encode_peer_info(w, &m.peer_info);
      w.write_u16(m.protocol_version.major);
      w.write_u16(m.protocol_version.minor);
    }
    Message::ParticipantAnnouncementReply(m) => {
      w.write_u8(match m.status {
        HandshakeStatus::Success => 0,
        HandshakeStatus::Failed => 1,
      });
      w.write_u16(m.protocol_version.major);
      w.write_u16(m.protocol_version.minor);
      encode_peer_info(w, &m.remote_peer_info);
    }
    Message::KnownParticipants(m) => {
      w.write_vec(&m.peers, encode_peer_info);
    }
    Message::PeerAnnouncement(m) => {
      encode_peer_info(w, &m.new_peer);
    }
    Message::PeerShutdown(m) => {
      w.write_str(&m.participant_name);
    }
    Message::ServiceDiscoveryEvent(m) => {
      w.write_u8(match m.kind {
        ServiceDiscoveryEventKind::ServiceCreated => 0,
        ServiceDiscoveryEventKind::ServiceRemoved => 1,
      });
      encode_service_descriptor(w, &m.descriptor);
    }
    Message::DataMessage(m) => {
      w.write_str(&m.network);
      w.write_timestamp_nanos(m.timestamp);
      w.write_bytes(&m.data);
    }
    Message::FunctionCall(m) => {
      w.write_str(&m.network);
      w.write_u128(m.call_uuid);
      w.write_bytes(&m.argument_data);
    }
    Message::FunctionCallResponse(m) => {
      w.write_str(&m.network);
      w.write_u128(m.call_uuid);
      w.write_u8(match m.status {
        RpcCallStatus::Success => 0,
        RpcCallStatus::ServerNotReachable => 1,
        RpcCallStatus::UndefinedError => 2,
        RpcCallStatus::InternalServerError => 3,
        RpcCallStatus::Timeout => 4,
      });
      w.write_bytes(&m.result_data);
    }
    Message::NextSimTask(m) => {
      w.write_i64(m.time_point_ns);
      w.write_i64(m.duration_ns);
    }
    Message::ParticipantStatus(m) => {
      w.write_str(&m.participant_name);
      encode_participant_state(w, m.state);
      w.write_str(&m.enter_reason);
      w.write_i64(m.enter_time);
      w.write_i64(m.refresh_time);
    }
    Message::WorkflowConfiguration(m) => {
      w.write_vec(&m.required_participants, |w, name| w.write_str(name));
    }
    Message::ParticipantNotification(m) => {
      w.write_u8(match m.kind {
        ParticipantNotificationKind::Shutdown => 0,
      });
    }
  }
}

fn decode_body(kind: WireKind, r: &mut WireReader) -> Result<Message, CodecError> {
  Ok(match kind {
    WireKind::ParticipantAnnouncement => {
      let peer_info = decode_peer_info(r)?;
      let major = r.read_u16()?;
      let minor = r.read_u16()?;
      Message::ParticipantAnnouncement(ParticipantAnnouncement {
        peer_info,
        protocol_version: ProtocolVersion { major, minor },
      })
    }
    WireKind::ParticipantAnnouncementReply => {
      let status = match r.read_u8()? {
        0 => HandshakeStatus::Success,
        1 => HandshakeStatus::Failed,
        v => return Err(CodecError::UnknownDiscriminant { type_name: "HandshakeStatus", value: v as u32 }),
      };
      let major = r.read_u16()?;
      let minor = r.read_u16()?;
      let remote_peer_info = decode_peer_info(r)?;
      Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
        status,
        protocol_version: ProtocolVersion { major, minor },
        remote_peer_info,
      })
    }
    WireKind::KnownParticipants => {
      let peers = r.read_vec(decode_peer_info)?;
      Message::KnownParticipants(KnownParticipants { peers })
    }
    WireKind::PeerAnnouncement => {
      let new_peer = decode_peer_info(r)?;
      Message::PeerAnnouncement(PeerAnnouncement { new_peer })
    }
    WireKind::PeerShutdown => {
      let participant_name = r.read_str()?;
      Message::PeerShutdown(PeerShutdown { participant_name })
    }
    WireKind::ServiceDiscoveryEvent => {
      let kind = match r.read_u8()? {
        0 => ServiceDiscoveryEventKind::ServiceCreated,
        1 => ServiceDiscoveryEventKind::ServiceRemoved,
        v => return Err(CodecError::UnknownDiscriminant { type_name: "ServiceDiscoveryEventKind", value: v as u32 }),
      };
      let descriptor = decode_service_descriptor(r)?;
      Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent { kind, descriptor })
    }
    WireKind::DataMessage => {
      let network = r.read_str()?;
      let timestamp = r.read_timestamp_nanos()?;
      let data = r.read_bytes()?;
      Message::DataMessage(DataMessage { network, timestamp, data })
    }
    WireKind::FunctionCall => {
      let network = r.read_str()?;
      let call_uuid = r.read_u128()?;
      let argument_data = r.read_bytes()?;
      Message::FunctionCall(FunctionCall { network, call_uuid, argument_data })
    }
    WireKind::FunctionCallResponse => {
      let network = r.read_str()?;
      let call_uuid = r.read_u128()?;
      let status = match r.read_u8()? {
        0 => RpcCallStatus::Success,
        1 => RpcCallStatus::ServerNotReachable,
        2 => RpcCallStatus::UndefinedError,
        3 => RpcCallStatus::InternalServerError,
        4 => RpcCallStatus::Timeout,
        v => return Err(CodecError::UnknownDiscriminant { type_name: "RpcCallStatus", value: v as u32 }),
      };
      let result_data = r.read_bytes()?;
      Message::FunctionCallResponse(FunctionCallResponse { network, call_uuid, status, result_data })
    }
    WireKind::NextSimTask => {
      let time_point_ns = r.read_i64()?;
      let duration_ns = r.read_i64()?;
      Message::NextSimTask(NextSimTask { time_point_ns, duration_ns })
    }
    WireKind::ParticipantStatus => {
      let participant_name = r.read_str()?;
      let state = decode_participant_state(r)?;
      let enter_reason = r.read_str()?;
      let enter_time = r.read_i64()?;
      let refresh_time = r.read_i64()?;
      Message::ParticipantStatus(DomainParticipantStatus { participant_name, state, enter_reason, enter_time, refresh_time })
    }
    WireKind::WorkflowConfiguration => {
      let required_participants = r.read_vec(|r| r.read_str())?;
      Message::WorkflowConfiguration(WorkflowConfiguration { required_participants })
    }
    WireKind::ParticipantNotification => {
      let kind = match r.read_u8()? {
        0 => ParticipantNotificationKind::Shutdown,
        v => return Err(CodecError::UnknownDiscriminant { type_name: "ParticipantNotificationKind", value: v as u32 }),
      };
      Message::ParticipantNotification(ParticipantNotification { kind })
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::{ParticipantState, ServiceType};
  use hex_literal::hex;

  fn sample_descriptor() -> ServiceDescriptor {
    let mut supplemental = HashMap::new();
    supplemental.insert("controllerType".to_string(), "DataPublisher".to_string());
    ServiceDescriptor {
      participant_name: "Ego".into(),
      network_name: "pub-uuid-1".into(),
      service_name: "Pub1".into(),
      service_type: ServiceType::Controller,
      network_type: NetworkType::Data,
      service_id: 3,
      supplemental_data: supplemental,
    }
  }

  fn round_trip(msg: Message) {
    let encoded = msg.encode_frame(ProtocolVersion::CURRENT);
    let decoded = Message::decode_frame(&encoded, ProtocolVersion::CURRENT).unwrap();
    assert_eq!(msg, decoded);
  }

  #[test]
  fn participant_announcement_round_trips() {
    round_trip(Message::ParticipantAnnouncement(ParticipantAnnouncement {
      peer_info: PeerInfo::new("Ego", vec!["silkit://127.0.0.1:8500".into()], "{}".into()),
      protocol_version: ProtocolVersion::CURRENT,
    }));
  }

  #[test]
  fn known_participants_round_trips_with_multiple_peers() {
    round_trip(Message::KnownParticipants(KnownParticipants {
      peers: vec![
        PeerInfo::new("A", vec!["silkit://h1:1".into()], "".into()),
        PeerInfo::new("B", vec!["local:///tmp/b.sock".into()], "".into()),
      ],
    }));
  }

  #[test]
  fn service_discovery_event_round_trips() {
    round_trip(Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent {
      kind: ServiceDiscoveryEventKind::ServiceCreated,
      descriptor: sample_descriptor(),
    }));
  }

  #[test]
  fn data_message_round_trips() {
    round_trip(Message::DataMessage(DataMessage {
      network: "pub-uuid-1".into(),
      timestamp: 10_000_000_000,
      data: hex!("01 02 03").to_vec(),
    }));
  }

  #[test]
  fn function_call_and_response_round_trip() {
    round_trip(Message::FunctionCall(FunctionCall {
      network: "client-uuid-1".into(),
      call_uuid: 0x1122_3344_5566_7788_99AA_BBCC_DDEE_FF00,
      argument_data: vec![0x05],
    }));
    round_trip(Message::FunctionCallResponse(FunctionCallResponse {
      network: "client-uuid-1".into(),
      call_uuid: 0x1122_3344_5566_7788_99AA_BBCC_DDEE_FF00,
      status: RpcCallStatus::Success,
      result_data: vec![0x69],
    }));
  }

  #[test]
  fn next_sim_task_round_trips() {
    round_trip(Message::NextSimTask(NextSimTask { time_point_ns: 1_000_000, duration_ns: 1_000_000 }));
  }

  #[test]
  fn participant_status_round_trips() {
    round_trip(Message::ParticipantStatus(DomainParticipantStatus {
      participant_name: "Ego".into(),
      state: ParticipantState::Running,
      enter_reason: "step completed".into(),
      enter_time: 123,
      refresh_time: 456,
    }));
  }

  #[test]
  fn workflow_configuration_round_trips() {
    round_trip(Message::WorkflowConfiguration(WorkflowConfiguration {
      required_participants: vec!["A".into(), "B".into()],
    }));
  }

  #[test]
  fn unknown_kind_is_rejected() {
    let mut bad = vec![0u8; 5];
    bad[0..4].copy_from_slice(&5u32.to_le_bytes());
    bad[4] = 200;
    assert!(matches!(
      Message::decode_frame(&bad, ProtocolVersion::CURRENT),
      Err(CodecError::UnknownKind(200))
    ));
  }

  #[test]
  fn peek_frame_length_reads_header_only() {
    let msg = Message::PeerShutdown(PeerShutdown { participant_name: "X".into() });
    let frame = msg.encode_frame(ProtocolVersion::CURRENT);
    assert_eq!(Message::peek_frame_length(&frame[..4]), Some(frame.len() as u32));
  }
}
