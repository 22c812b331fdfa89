//! The participant arena: owns the connection
//! manager, service discovery, system state tracker, lifecycle state machine
//! and the endpoint router. Controllers (`DataPublisher`, `RpcClient`, ...)
//! hold only an `Endpoint` plus a handle back into this arena, rather than a
//! cyclic owning reference.

pub mod lifecycle;
pub mod router;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use mio_06::Token;

use crate::discovery::{DiscoveryEventKind, ServiceDiscovery};
use crate::error::{VasioError, VasioResult};
use crate::orchestration::SystemStateTracker;
use crate::structure::{hash_participant_name, Endpoint, ParticipantState, PeerInfo};
use crate::timesync::{StepHandlerKind, SyncMode, TimeSyncService};
use crate::transport::{parse_acceptor_uri, ConnectionManager, TransportEvent};
use crate::wire::messages::{
  HandshakeStatus, ParticipantAnnouncement, ParticipantAnnouncementReply, ServiceDiscoveryEvent, ServiceDiscoveryEventKind,
};
use crate::wire::{Message, ProtocolVersion};

use lifecycle::ParticipantLifecycle;
use router::{RouterTable, ServiceHandler};

/// A service-id value reserved for "whole participant" discovery broadcasts,
/// which are not addressed to any one local endpoint.
const DISCOVERY_SENDER_SERVICE_ID: u32 = u32::MAX;

/// Identifies a registered timeout poller (see [`ParticipantHandle::register_timeout_poller`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutPollerId(pub(crate) u64);

/// Everything a controller (publisher, subscriber, RPC client/server) needs
/// from its owning participant, without holding a concrete `Participant`
/// back-reference.
pub trait ParticipantHandle: Send + Sync {
  fn participant_name(&self) -> String;
  fn participant_id(&self) -> u64;
  fn allocate_service_id(&self) -> u32;
  fn discovery(&self) -> Arc<ServiceDiscovery>;
  /// Sends `msg` to every connected peer and, if it carries a
  /// [`Message::routing_network`], dispatches it to this participant's own
  /// locally-registered endpoints on that network too (minus `from` itself),
  /// so a publisher/subscriber or RPC client/server pair
  /// hosted on the *same* participant still see each other's traffic
  /// without a wire round-trip.
  fn broadcast(&self, msg: &Message, from: Endpoint);
  fn register_network(&self, network: &str, endpoint: Endpoint);
  fn unregister_network(&self, network: &str, endpoint: Endpoint);
  fn register_endpoint(&self, endpoint: Endpoint, handler: Box<dyn ServiceHandler>);
  fn unregister_endpoint(&self, endpoint: Endpoint);
  /// Monotonic-ish wall clock, nanoseconds since the Unix epoch. Autonomous
  /// (unsynchronized) controllers stamp outgoing messages with this.
  fn now_ns(&self) -> i64;

  /// Registers a closure invoked once per [`Participant::tick`] with the
  /// participant's current `now_ns`, for controllers like `RpcClient` that
  /// need to expire local state on a time domain but, being free-standing,
  /// have no tick loop of their own to drive it.
  fn register_timeout_poller(&self, poller: Box<dyn FnMut(i64) + Send>) -> TimeoutPollerId;
  fn unregister_timeout_poller(&self, id: TimeoutPollerId);

  /// Records a freshly created local service and broadcasts the
  /// corresponding `ServiceDiscoveryEvent` so every connected peer's
  /// discovery cache learns about it.
  fn announce_service_created(&self, desc: crate::structure::ServiceDescriptor) {
    self.discovery().notify_service_created(desc.clone());
    let from = Endpoint { participant_id: self.participant_id(), service_id: DISCOVERY_SENDER_SERVICE_ID };
    let event = Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent { kind: ServiceDiscoveryEventKind::ServiceCreated, descriptor: desc });
    self.broadcast(&event, from);
  }

  /// Symmetric with [`Self::announce_service_created`]; called on controller
  /// teardown.
  fn announce_service_removed(&self, desc: &crate::structure::ServiceDescriptor) {
    self.discovery().notify_service_removed(desc);
    let from = Endpoint { participant_id: self.participant_id(), service_id: DISCOVERY_SENDER_SERVICE_ID };
    let event = Message::ServiceDiscoveryEvent(ServiceDiscoveryEvent { kind: ServiceDiscoveryEventKind::ServiceRemoved, descriptor: desc.clone() });
    self.broadcast(&event, from);
  }
}

pub struct Participant {
  name: String,
  participant_id: u64,
  manager: ConnectionManager,
  discovery: Arc<ServiceDiscovery>,
  system_state: SystemStateTracker,
  lifecycle: ParticipantLifecycle,
  router: RouterTable,
  peers_by_name: HashMap<String, Token>,
  next_service_id: u32,
  communication_ready_handler: Option<Box<dyn FnOnce() + Send>>,
  time_sync: Option<TimeSyncService>,
  step_handler: StepHandlerKind,
  step_in_progress: bool,
  timeout_pollers: HashMap<u64, Box<dyn FnMut(i64) + Send>>,
  next_poller_id: u64,
}

impl Participant {
  pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> VasioResult<Self> {
    let name = name.into();
    let participant_id = hash_participant_name(&name);
    let manager = ConnectionManager::bind(listen_addr)?;
    Ok(Participant {
      lifecycle: ParticipantLifecycle::new(name.clone()),
      name,
      participant_id,
      manager,
      discovery: ServiceDiscovery::new(),
      system_state: SystemStateTracker::new(),
      router: RouterTable::new(),
      peers_by_name: HashMap::new(),
      next_service_id: 0,
      communication_ready_handler: None,
      time_sync: None,
      step_handler: StepHandlerKind::default(),
      step_in_progress: false,
      timeout_pollers: HashMap::new(),
      next_poller_id: 0,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn listen_addr(&self) -> SocketAddr {
    self.manager.listen_addr()
  }

  pub fn lifecycle(&self) -> &ParticipantLifecycle {
    &self.lifecycle
  }

  pub fn system_state_tracker(&self) -> &SystemStateTracker {
    &self.system_state
  }

  pub fn discovery(&self) -> Arc<ServiceDiscovery> {
    self.discovery.clone()
  }

  pub fn set_communication_ready_handler(&mut self, f: impl FnOnce() + Send + 'static) {
    self.communication_ready_handler = Some(Box::new(f));
  }

  /// Dials the registry, announces itself, and waits for `KnownParticipants`
  /// so the caller can proceed to dial the mesh.
  pub fn join_via_registry(&mut self, registry_uri: &str, acceptor_uris: Vec<String>, capabilities: String) -> VasioResult<Token> {
    let addr = parse_acceptor_uri(registry_uri)?;
    let token = self.manager.connect(addr)?;
    let announcement = Message::ParticipantAnnouncement(ParticipantAnnouncement {
      peer_info: PeerInfo::new(self.name.clone(), acceptor_uris, capabilities),
      protocol_version: ProtocolVersion::CURRENT,
    });
    self.manager.send(token, &announcement)?;
    Ok(token)
  }

  pub fn tick(&mut self, timeout: Option<Duration>) -> VasioResult<()> {
    let events = self.manager.poll(timeout)?;
    for event in events {
      match event {
        TransportEvent::Accepted(token) => debug!("participant '{}': accepted connection {token:?}", self.name),
        TransportEvent::FramesReceived(token, frames) => {
          for frame in frames {
            self.handle_frame(token, frame)?;
          }
        }
        TransportEvent::PeerClosed(token) => self.handle_peer_closed(token),
      }
    }
    self.try_advance_step();
    self.drive_timeout_pollers();
    Ok(())
  }

  fn drive_timeout_pollers(&mut self) {
    if self.timeout_pollers.is_empty() {
      return;
    }
    let now_ns = self.now_ns();
    for poller in self.timeout_pollers.values_mut() {
      poller(now_ns);
    }
  }

  fn handle_frame(&mut self, token: Token, msg: Message) -> VasioResult<()> {
    match msg {
      Message::ParticipantAnnouncement(announcement) => self.handle_incoming_announcement(token, announcement),
      Message::ParticipantAnnouncementReply(reply) => self.handle_announcement_reply(token, reply),
      Message::KnownParticipants(known) => {
        for peer in known.peers {
          self.dial_peer(peer)?;
        }
        Ok(())
      }
      Message::PeerAnnouncement(announcement) => self.dial_peer(announcement.new_peer),
      Message::PeerShutdown(shutdown) => {
        self.forget_peer(&shutdown.participant_name);
        Ok(())
      }
      Message::ServiceDiscoveryEvent(event) => {
        let kind = match event.kind {
          ServiceDiscoveryEventKind::ServiceCreated => DiscoveryEventKind::ServiceCreated,
          ServiceDiscoveryEventKind::ServiceRemoved => DiscoveryEventKind::ServiceRemoved,
        };
        self.discovery.handle_remote_event(kind, event.descriptor);
        Ok(())
      }
      Message::DataMessage(_) | Message::FunctionCall(_) | Message::FunctionCallResponse(_) => {
        // Remote traffic has no local sending endpoint; the sentinel is
        // never equal to a real `Endpoint`, so it never suppresses delivery.
        let from = Endpoint { participant_id: 0, service_id: DISCOVERY_SENDER_SERVICE_ID };
        let network = msg.routing_network().expect("matched variant always carries a routing network").to_string();
        self.router.dispatch_to_network(&network, from, &msg);
        Ok(())
      }
      Message::NextSimTask(task) => {
        let peer_name = self.manager.peer(token).and_then(|p| p.participant_name()).map(str::to_string);
        match (&mut self.time_sync, peer_name) {
          (Some(sync), Some(peer_name)) => sync.on_peer_next_sim_task(peer_name, task),
          (Some(_), None) => warn!("participant '{}': NextSimTask from an un-named peer on {token:?}", self.name),
          (None, _) => trace_unhandled("received NextSimTask but no TimeSyncService is configured"),
        }
        self.try_advance_step();
        Ok(())
      }
      Message::ParticipantStatus(status) => {
        self.system_state.update_participant_status(status);
        Ok(())
      }
      Message::WorkflowConfiguration(wf) => {
        if let Some(sync) = &mut self.time_sync {
          for required in &wf.required_participants {
            if *required != self.name {
              sync.add_coordinated_peer(required.clone());
            }
          }
        }
        self.system_state.update_required_participants(wf.required_participants);
        Ok(())
      }
      Message::ParticipantNotification(_) => {
        self.forget_peer_by_token(token);
        Ok(())
      }
    }
  }

  fn handle_incoming_announcement(&mut self, token: Token, announcement: ParticipantAnnouncement) -> VasioResult<()> {
    let negotiated = ProtocolVersion::negotiate(ProtocolVersion::CURRENT, announcement.protocol_version);
    if self.peers_by_name.contains_key(&announcement.peer_info.participant_name) {
      warn!("participant '{}': rejecting duplicate peer name '{}'", self.name, announcement.peer_info.participant_name);
      let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
        status: HandshakeStatus::Failed,
        protocol_version: negotiated,
        remote_peer_info: self.self_peer_info(vec![]),
      });
      self.manager.send(token, &reply)?;
      self.manager.drop_peer(token);
      return Ok(());
    }

    let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
      status: HandshakeStatus::Success,
      protocol_version: negotiated,
      remote_peer_info: self.self_peer_info(vec![]),
    });
    self.manager.send(token, &reply)?;
    self.adopt_peer(token, announcement.peer_info);
    Ok(())
  }

  fn handle_announcement_reply(&mut self, token: Token, reply: ParticipantAnnouncementReply) -> VasioResult<()> {
    if reply.status == HandshakeStatus::Failed {
      warn!("participant '{}': handshake rejected by remote on {token:?}", self.name);
      self.manager.drop_peer(token);
      return Ok(());
    }
    self.adopt_peer(token, reply.remote_peer_info);
    Ok(())
  }

  fn adopt_peer(&mut self, token: Token, peer_info: PeerInfo) {
    if let Some(peer) = self.manager.peer_mut(token) {
      peer.mark_established(ProtocolVersion::CURRENT, peer_info.clone());
    }
    info!("participant '{}': peer '{}' established on {token:?}", self.name, peer_info.participant_name);
    self.peers_by_name.insert(peer_info.participant_name, token);
  }

  fn dial_peer(&mut self, peer_info: PeerInfo) -> VasioResult<()> {
    if peer_info.participant_name == self.name || self.peers_by_name.contains_key(&peer_info.participant_name) {
      return Ok(());
    }
    let Some(uri) = peer_info.acceptor_uris.first() else {
      warn!("participant '{}': peer '{}' advertised no acceptor URIs", self.name, peer_info.participant_name);
      return Ok(());
    };
    let addr = parse_acceptor_uri(uri)?;
    let token = self.manager.connect(addr)?;
    let announcement = Message::ParticipantAnnouncement(ParticipantAnnouncement {
      peer_info: self.self_peer_info(vec![]),
      protocol_version: ProtocolVersion::CURRENT,
    });
    self.manager.send(token, &announcement)?;
    Ok(())
  }

  fn handle_peer_closed(&mut self, token: Token) {
    if let Some(name) = self.peers_by_name.iter().find(|(_, t)| **t == token).map(|(n, _)| n.clone()) {
      self.forget_peer(&name);
    }
  }

  fn forget_peer_by_token(&mut self, token: Token) {
    self.manager.drop_peer(token);
    self.handle_peer_closed(token);
  }

  fn forget_peer(&mut self, participant_name: &str) {
    self.peers_by_name.remove(participant_name);
    self.discovery.on_peer_shutdown(participant_name);
    self.system_state.remove_participant(participant_name);
    if let Some(sync) = &mut self.time_sync {
      sync.remove_coordinated_peer(participant_name);
    }
  }

  fn self_peer_info(&self, acceptor_uris: Vec<String>) -> PeerInfo {
    PeerInfo::new(self.name.clone(), acceptor_uris, String::new())
  }

  /// Entered exactly once, between `CommunicationInitialized` and
  /// `ReadyToRun`. Consumes the stored handler so it cannot re-fire.
  pub fn run_communication_ready_handler(&mut self) {
    if let Some(handler) = self.communication_ready_handler.take() {
      handler();
    }
  }

  /// Creates this participant's `TimeSyncService`, coordinating with every
  /// currently-known peer from the outset.
  pub fn create_time_sync_service(&mut self, mode: SyncMode, initial_duration_ns: i64) -> VasioResult<()> {
    let mut sync = TimeSyncService::new(mode, initial_duration_ns)?;
    for peer_name in self.peers_by_name.keys() {
      sync.add_coordinated_peer(peer_name.clone());
    }
    self.time_sync = Some(sync);
    Ok(())
  }

  pub fn time_sync(&self) -> Option<&TimeSyncService> {
    self.time_sync.as_ref()
  }

  pub fn set_step_duration(&mut self, new_duration_ns: i64) -> VasioResult<()> {
    self
      .time_sync
      .as_mut()
      .ok_or_else(|| VasioError::Configuration("no TimeSyncService configured".into()))?
      .set_step_duration(new_duration_ns)
  }

  /// Installs a blocking step handler, invoked synchronously from [`Self::tick`]
  /// every time the barrier releases.
  pub fn set_blocking_step_handler(&mut self, handler: impl FnMut(i64, i64) + Send + 'static) {
    self.step_handler = StepHandlerKind::Blocking(Box::new(handler));
  }

  /// Installs an async step handler: it is invoked on barrier release but the
  /// step is not considered complete until the caller separately invokes
  /// [`Self::complete_simulation_step`].
  pub fn set_async_step_handler(&mut self, handler: impl FnMut(i64, i64) + Send + 'static) {
    self.step_handler = StepHandlerKind::Async(Box::new(handler));
  }

  /// Completes an in-flight async step, broadcasting the resulting
  /// `NextSimTask`. A no-op if no async step is outstanding.
  pub fn complete_simulation_step(&mut self) -> VasioResult<()> {
    if !matches!(self.step_handler, StepHandlerKind::Async(_)) || !self.step_in_progress {
      return Ok(());
    }
    self.finish_step()
  }

  /// Checks the barrier and, if satisfied and no step is currently in
  /// flight, invokes the configured step handler. For a blocking handler the
  /// step completes and broadcasts immediately; for an async handler the
  /// caller must later call [`Self::complete_simulation_step`].
  fn try_advance_step(&mut self) {
    if self.step_in_progress {
      return;
    }
    let Some(sync) = &self.time_sync else { return };
    if !sync.barrier_satisfied() {
      return;
    }
    let now_ns = sync.current_now_ns();
    let duration_ns = sync.pending_step_duration_ns();

    match &mut self.step_handler {
      StepHandlerKind::None => {
        if let Err(e) = self.finish_step() {
          warn!("participant '{}': failed to broadcast NextSimTask: {e}", self.name);
        }
      }
      StepHandlerKind::Blocking(handler) => {
        handler(now_ns, duration_ns);
        if let Err(e) = self.finish_step() {
          warn!("participant '{}': failed to broadcast NextSimTask: {e}", self.name);
        }
      }
      StepHandlerKind::Async(handler) => {
        self.step_in_progress = true;
        handler(now_ns, duration_ns);
      }
    }
  }

  fn finish_step(&mut self) -> VasioResult<()> {
    let Some(sync) = &mut self.time_sync else { return Ok(()) };
    let task = sync.complete_step();
    self.step_in_progress = false;
    let msg = Message::NextSimTask(task);
    self.manager.broadcast(&msg, None);
    Ok(())
  }

  /// Drives the lifecycle state machine forward and broadcasts the resulting
  /// `ParticipantStatus`, also folding it into this participant's own
  /// view of the aggregate system state. Auto-invokes the communication-ready
  /// handler on the `CommunicationInitialized -> ReadyToRun` edge.
  pub fn transition_lifecycle(&mut self, new_state: ParticipantState, reason: impl Into<String>) {
    let was_initialized = self.lifecycle.state() == ParticipantState::CommunicationInitialized;
    self.lifecycle.transition(new_state, reason, self.now_ns());
    if was_initialized && new_state == ParticipantState::ReadyToRun {
      self.run_communication_ready_handler();
    }
    self.broadcast_status();
  }

  pub fn pause_lifecycle(&mut self, reason: impl Into<String>) -> VasioResult<()> {
    self.lifecycle.pause(reason, self.now_ns())?;
    self.broadcast_status();
    Ok(())
  }

  pub fn resume_lifecycle(&mut self, reason: impl Into<String>) -> VasioResult<()> {
    self.lifecycle.resume(reason, self.now_ns())?;
    self.broadcast_status();
    Ok(())
  }

  fn broadcast_status(&mut self) {
    let status = self.lifecycle.status();
    self.system_state.update_participant_status(status.clone());
    self.manager.broadcast(&Message::ParticipantStatus(status), None);
  }

  fn now_ns(&self) -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
  }

  pub fn allocate_service_id(&mut self) -> u32 {
    let id = self.next_service_id;
    self.next_service_id += 1;
    id
  }

  pub fn endpoint(&self, service_id: u32) -> Endpoint {
    Endpoint { participant_id: self.participant_id, service_id }
  }

  pub fn router_mut(&mut self) -> &mut RouterTable {
    &mut self.router
  }

  pub fn register_timeout_poller(&mut self, poller: Box<dyn FnMut(i64) + Send>) -> TimeoutPollerId {
    let id = self.next_poller_id;
    self.next_poller_id += 1;
    self.timeout_pollers.insert(id, poller);
    TimeoutPollerId(id)
  }

  pub fn unregister_timeout_poller(&mut self, id: TimeoutPollerId) {
    self.timeout_pollers.remove(&id.0);
  }

  pub fn into_shared(self) -> SharedParticipant {
    SharedParticipant(Arc::new(Mutex::new(self)))
  }
}

fn trace_unhandled(reason: &str) {
  log::trace!("{reason}");
}

/// Thread-safe handle wrapping a `Participant`, used by controllers that
/// need `Arc<dyn ParticipantHandle>`: no global state, just an
/// instance-scoped arena shared by reference.
#[derive(Clone)]
pub struct SharedParticipant(Arc<Mutex<Participant>>);

impl SharedParticipant {
  pub fn lock(&self) -> std::sync::MutexGuard<'_, Participant> {
    self.0.lock().unwrap()
  }
}

impl ParticipantHandle for SharedParticipant {
  fn participant_name(&self) -> String {
    self.lock().name.clone()
  }

  fn participant_id(&self) -> u64 {
    self.lock().participant_id
  }

  fn allocate_service_id(&self) -> u32 {
    self.lock().allocate_service_id()
  }

  fn discovery(&self) -> Arc<ServiceDiscovery> {
    self.lock().discovery()
  }

  fn broadcast(&self, msg: &Message, from: Endpoint) {
    let mut participant = self.lock();
    participant.manager.broadcast(msg, None);
    if let Some(network) = msg.routing_network() {
      participant.router.dispatch_to_network(network, from, msg);
    }
  }

  fn register_network(&self, network: &str, endpoint: Endpoint) {
    self.lock().router.register_network(network, endpoint);
  }

  fn unregister_network(&self, network: &str, endpoint: Endpoint) {
    self.lock().router.unregister_network(network, endpoint);
  }

  fn register_endpoint(&self, endpoint: Endpoint, handler: Box<dyn ServiceHandler>) {
    self.lock().router.register_endpoint(endpoint, handler);
  }

  fn unregister_endpoint(&self, endpoint: Endpoint) {
    self.lock().router.unregister_endpoint(endpoint);
  }

  fn now_ns(&self) -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
  }

  fn register_timeout_poller(&self, poller: Box<dyn FnMut(i64) + Send>) -> TimeoutPollerId {
    self.lock().register_timeout_poller(poller)
  }

  fn unregister_timeout_poller(&self, id: TimeoutPollerId) {
    self.lock().unregister_timeout_poller(id);
  }
}

