//! RPC routing: clients discover servers by function name, servers
//! discover clients and construct one internal router per discovered client
//! UUID, and calls are correlated by a random `callUuid`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::discovery::{
  DiscoveryEventKind, ServiceDiscovery, SpecificHandlerQuery, CONTROLLER_TYPE_RPC_CLIENT, CONTROLLER_TYPE_RPC_SERVER,
  SUPPL_KEY_CONTROLLER_TYPE, SUPPL_KEY_LABELS, SUPPL_KEY_MEDIA_TYPE, SUPPL_KEY_RPC_CLIENT_FUNCTION_NAME,
  SUPPL_KEY_RPC_CLIENT_UUID, SUPPL_KEY_RPC_SERVER_FUNCTION_NAME,
};
use crate::participant::router::ServiceHandler;
use crate::participant::{ParticipantHandle, TimeoutPollerId};
use crate::structure::{match_media_type, Endpoint, MatchingLabel, NetworkType, ServiceDescriptor, ServiceType};
pub use crate::wire::messages::RpcCallStatus;
use crate::wire::messages::{FunctionCall, FunctionCallResponse};
use crate::wire::Message;

fn new_uuid_string() -> String {
  format!("{:032x}", rand::random::<u128>())
}

/// Issued by [`RpcClient::call`]/[`RpcClient::call_with_timeout`]; matched
/// against the corresponding `FunctionCallResponse` by `call_uuid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandle {
  pub call_uuid: u128,
  pub client_uuid: String,
  pub user_context: u64,
}

/// Delivered to a client's result handler exactly once per call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCallResultEvent {
  pub timestamp: i64,
  pub user_context: u64,
  pub status: RpcCallStatus,
  pub result_data: Vec<u8>,
}

struct PendingCall {
  user_context: u64,
  /// Virtual- or wall-clock deadline, in whatever time domain the caller
  /// passed to `call_with_timeout` -- the participant's own time domain.
  deadline_ns: Option<i64>,
}

pub type ResultHandler = dyn FnMut(RpcCallResultEvent) + Send;

struct ClientHandler {
  pending: Arc<Mutex<HashMap<u128, PendingCall>>>,
  on_result: Arc<Mutex<ResultHandler>>,
}

impl ServiceHandler for ClientHandler {
  fn receive(&mut self, _from: Endpoint, msg: &Message) {
    let Message::FunctionCallResponse(resp) = msg else { return };
    let pending = {
      let mut map = self.pending.lock().unwrap();
      map.remove(&resp.call_uuid)
    };
    let Some(pending) = pending else {
      trace!("RpcClient: dropping late response for unknown or already-resolved call {:#x}", resp.call_uuid);
      return;
    };
    (self.on_result.lock().unwrap())(RpcCallResultEvent {
      timestamp: 0,
      user_context: pending.user_context,
      status: resp.status,
      result_data: resp.result_data.clone(),
    });
  }
}

/// `RpcClient::Call` discovers servers by `function_name`/`media_type`/
/// `labels` and routes calls to all matching `RpcServerInternal`s.
pub struct RpcClient {
  handle: Arc<dyn ParticipantHandle>,
  descriptor: ServiceDescriptor,
  endpoint: Endpoint,
  client_uuid: String,
  discovery_handler_id: crate::discovery::HandlerId,
  known_servers: Arc<Mutex<HashSet<Endpoint>>>,
  pending: Arc<Mutex<HashMap<u128, PendingCall>>>,
  on_result: Arc<Mutex<ResultHandler>>,
  timeout_poller_id: TimeoutPollerId,
}

/// Drains every pending call whose deadline has elapsed as of `now_ns` from
/// `pending` and delivers a `Timeout` result for each through `on_result`.
/// Shared by `RpcClient::poll_timeouts` and the poller registered with the
/// owning participant so both the manual and the tick-driven path agree.
fn deliver_expired_calls(pending: &Mutex<HashMap<u128, PendingCall>>, on_result: &Mutex<ResultHandler>, now_ns: i64) {
  let mut expired = Vec::new();
  pending.lock().unwrap().retain(|_, pending| {
    let Some(deadline) = pending.deadline_ns else { return true };
    if deadline > now_ns {
      return true;
    }
    expired.push(RpcCallResultEvent {
      timestamp: now_ns,
      user_context: pending.user_context,
      status: RpcCallStatus::Timeout,
      result_data: Vec::new(),
    });
    false
  });
  if expired.is_empty() {
    return;
  }
  let mut on_result = on_result.lock().unwrap();
  for event in expired {
    (on_result)(event);
  }
}

impl RpcClient {
  pub fn create(
    handle: Arc<dyn ParticipantHandle>,
    function_name: impl Into<String>,
    media_type: impl Into<String>,
    labels: Vec<MatchingLabel>,
    on_result: impl FnMut(RpcCallResultEvent) + Send + 'static,
  ) -> Self {
    let function_name = function_name.into();
    let media_type = media_type.into();
    let service_id = handle.allocate_service_id();
    let endpoint = Endpoint { participant_id: handle.participant_id(), service_id };
    let client_uuid = new_uuid_string();

    let mut supplemental = std::collections::HashMap::new();
    supplemental.insert(SUPPL_KEY_CONTROLLER_TYPE.to_string(), CONTROLLER_TYPE_RPC_CLIENT.to_string());
    supplemental.insert(SUPPL_KEY_RPC_CLIENT_FUNCTION_NAME.to_string(), function_name.clone());
    supplemental.insert(SUPPL_KEY_RPC_CLIENT_UUID.to_string(), client_uuid.clone());
    supplemental.insert(SUPPL_KEY_MEDIA_TYPE.to_string(), media_type.clone());
    supplemental.insert(SUPPL_KEY_LABELS.to_string(), crate::discovery::encode_labels(&labels));

    let descriptor = ServiceDescriptor {
      participant_name: handle.participant_name(),
      network_name: client_uuid.clone(),
      service_name: format!("RpcClient{service_id}"),
      service_type: ServiceType::RequestReply,
      network_type: NetworkType::Rpc,
      service_id,
      supplemental_data: supplemental,
    };

    let pending: Arc<Mutex<HashMap<u128, PendingCall>>> = Arc::new(Mutex::new(HashMap::new()));
    let on_result: Arc<Mutex<ResultHandler>> = Arc::new(Mutex::new(on_result));
    handle.register_network(&client_uuid, endpoint);
    handle.register_endpoint(endpoint, Box::new(ClientHandler { pending: pending.clone(), on_result: on_result.clone() }));

    let known_servers: Arc<Mutex<HashSet<Endpoint>>> = Arc::new(Mutex::new(HashSet::new()));
    let known_servers_cb = known_servers.clone();
    let expected_media_type = media_type.clone();

    let discovery_handler_id = handle.discovery().register_specific_handler(
      SpecificHandlerQuery {
        controller_type: CONTROLLER_TYPE_RPC_SERVER,
        match_key: SUPPL_KEY_RPC_SERVER_FUNCTION_NAME,
        match_value: function_name.clone(),
        labels,
      },
      move |kind, desc| {
        if !match_media_type(&expected_media_type, desc.supplemental(SUPPL_KEY_MEDIA_TYPE).unwrap_or("")) {
          return;
        }
        let server_endpoint = desc.endpoint();
        match kind {
          DiscoveryEventKind::ServiceCreated => {
            known_servers_cb.lock().unwrap().insert(server_endpoint);
          }
          DiscoveryEventKind::ServiceRemoved => {
            known_servers_cb.lock().unwrap().remove(&server_endpoint);
          }
        }
      },
    );

    handle.announce_service_created(descriptor.clone());

    let poller_pending = pending.clone();
    let poller_on_result = on_result.clone();
    let timeout_poller_id = handle.register_timeout_poller(Box::new(move |now_ns| {
      deliver_expired_calls(&poller_pending, &poller_on_result, now_ns);
    }));

    RpcClient {
      handle,
      descriptor,
      endpoint,
      client_uuid,
      discovery_handler_id,
      known_servers,
      pending,
      on_result,
      timeout_poller_id,
    }
  }

  pub fn client_uuid(&self) -> &str {
    &self.client_uuid
  }

  fn has_known_server(&self) -> bool {
    !self.known_servers.lock().unwrap().is_empty()
  }

  /// Fire-and-forget call with no timeout. Delivers `ServerNotReachable`
  /// synchronously to the result handler if no server was discovered yet.
  pub fn call(&self, data: Vec<u8>, user_context: u64) -> CallHandle {
    self.call_with_deadline(data, user_context, None)
  }

  /// Arms a timeout at `now_ns + timeout_ns`, delivered through the result
  /// handler once the owning participant's tick passes that deadline.
  pub fn call_with_timeout(&self, data: Vec<u8>, timeout_ns: i64, user_context: u64, now_ns: i64) -> CallHandle {
    self.call_with_deadline(data, user_context, Some(now_ns + timeout_ns))
  }

  fn call_with_deadline(&self, data: Vec<u8>, user_context: u64, deadline_ns: Option<i64>) -> CallHandle {
    let call_uuid = rand::random::<u128>();
    let call_handle = CallHandle { call_uuid, client_uuid: self.client_uuid.clone(), user_context };

    if !self.has_known_server() {
      trace!("RpcClient '{}': no server discovered yet, call {:#x} resolves immediately", self.client_uuid, call_uuid);
      (self.on_result.lock().unwrap())(RpcCallResultEvent {
        timestamp: self.handle.now_ns(),
        user_context,
        status: RpcCallStatus::ServerNotReachable,
        result_data: Vec::new(),
      });
      return call_handle;
    }

    self.pending.lock().unwrap().insert(call_uuid, PendingCall { user_context, deadline_ns });
    let msg = Message::FunctionCall(FunctionCall { network: self.client_uuid.clone(), call_uuid, argument_data: data });
    self.handle.broadcast(&msg, self.endpoint);
    call_handle
  }

  /// Delivers a `Timeout` result for every pending call whose deadline has
  /// elapsed as of `now_ns` through the client's result handler, and
  /// discards them. Also driven automatically once per tick of the owning
  /// participant; call this directly only to force an expiry check off-tick
  /// (e.g. in tests).
  pub fn poll_timeouts(&self, now_ns: i64) {
    deliver_expired_calls(&self.pending, &self.on_result, now_ns);
  }
}

impl Drop for RpcClient {
  fn drop(&mut self) {
    self.handle.unregister_timeout_poller(self.timeout_poller_id);
    self.handle.discovery().unregister_specific_handler(self.discovery_handler_id);
    self.handle.announce_service_removed(&self.descriptor);
    self.handle.unregister_network(&self.client_uuid, self.endpoint);
    self.handle.unregister_endpoint(self.endpoint);
  }
}

pub type CallHandler = dyn FnMut(&[u8]) -> Vec<u8> + Send;

struct RpcServerInternalHandler {
  handle: Arc<dyn ParticipantHandle>,
  endpoint: Endpoint,
  call_handler: Arc<Mutex<Option<Box<CallHandler>>>>,
}

impl ServiceHandler for RpcServerInternalHandler {
  fn receive(&mut self, _from: Endpoint, msg: &Message) {
    let Message::FunctionCall(call) = msg else { return };
    let mut guard = self.call_handler.lock().unwrap();
    let (status, result_data) = match guard.as_mut() {
      Some(f) => (RpcCallStatus::Success, f(&call.argument_data)),
      None => {
        warn!("RpcServerInternal on network '{}': call arrived with no call handler installed", call.network);
        (RpcCallStatus::InternalServerError, Vec::new())
      }
    };
    drop(guard);
    let response =
      Message::FunctionCallResponse(FunctionCallResponse { network: call.network.clone(), call_uuid: call.call_uuid, status, result_data });
    self.handle.broadcast(&response, self.endpoint);
  }
}

/// `RpcServer::create` discovers clients by `function_name`; a fresh internal
/// router is created per discovered client UUID.
pub struct RpcServer {
  handle: Arc<dyn ParticipantHandle>,
  descriptor: ServiceDescriptor,
  discovery_handler_id: crate::discovery::HandlerId,
  call_handler: Arc<Mutex<Option<Box<CallHandler>>>>,
  internals: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl RpcServer {
  pub fn create(
    handle: Arc<dyn ParticipantHandle>,
    function_name: impl Into<String>,
    media_type: impl Into<String>,
    labels: Vec<MatchingLabel>,
  ) -> Self {
    let function_name = function_name.into();
    let media_type = media_type.into();
    let service_id = handle.allocate_service_id();

    let mut supplemental = std::collections::HashMap::new();
    supplemental.insert(SUPPL_KEY_CONTROLLER_TYPE.to_string(), CONTROLLER_TYPE_RPC_SERVER.to_string());
    supplemental.insert(SUPPL_KEY_RPC_SERVER_FUNCTION_NAME.to_string(), function_name.clone());
    supplemental.insert(SUPPL_KEY_MEDIA_TYPE.to_string(), media_type.clone());
    supplemental.insert(SUPPL_KEY_LABELS.to_string(), crate::discovery::encode_labels(&labels));

    let descriptor = ServiceDescriptor {
      participant_name: handle.participant_name(),
      network_name: format!("rpc-server-{service_id}"),
      service_name: format!("RpcServer{service_id}"),
      service_type: ServiceType::RequestReply,
      network_type: NetworkType::Rpc,
      service_id,
      supplemental_data: supplemental,
    };

    let call_handler: Arc<Mutex<Option<Box<CallHandler>>>> = Arc::new(Mutex::new(None));
    let internals: Arc<Mutex<HashMap<String, Endpoint>>> = Arc::new(Mutex::new(HashMap::new()));

    let handle_cb = handle.clone();
    let internals_cb = internals.clone();
    let call_handler_cb = call_handler.clone();
    let expected_media_type = media_type.clone();

    let discovery_handler_id = handle.discovery().register_specific_handler(
      SpecificHandlerQuery {
        controller_type: CONTROLLER_TYPE_RPC_CLIENT,
        match_key: SUPPL_KEY_RPC_CLIENT_FUNCTION_NAME,
        match_value: function_name.clone(),
        labels,
      },
      move |kind, desc| {
        if !match_media_type(&expected_media_type, desc.supplemental(SUPPL_KEY_MEDIA_TYPE).unwrap_or("")) {
          return;
        }
        let Some(client_uuid) = desc.supplemental(SUPPL_KEY_RPC_CLIENT_UUID) else {
          warn!("RpcClient announcement missing clientUUID, ignoring");
          return;
        };
        match kind {
          DiscoveryEventKind::ServiceCreated => {
            if internals_cb.lock().unwrap().contains_key(client_uuid) {
              return;
            }
            let internal_service_id = handle_cb.allocate_service_id();
            let internal_endpoint = Endpoint { participant_id: handle_cb.participant_id(), service_id: internal_service_id };
            handle_cb.register_network(client_uuid, internal_endpoint);
            handle_cb.register_endpoint(
              internal_endpoint,
              Box::new(RpcServerInternalHandler { handle: handle_cb.clone(), endpoint: internal_endpoint, call_handler: call_handler_cb.clone() }),
            );
            internals_cb.lock().unwrap().insert(client_uuid.to_string(), internal_endpoint);
          }
          DiscoveryEventKind::ServiceRemoved => {
            if let Some(internal_endpoint) = internals_cb.lock().unwrap().remove(client_uuid) {
              handle_cb.unregister_network(client_uuid, internal_endpoint);
              handle_cb.unregister_endpoint(internal_endpoint);
            }
          }
        }
      },
    );

    handle.announce_service_created(descriptor.clone());

    RpcServer { handle, descriptor, discovery_handler_id, call_handler, internals }
  }

  /// Installs the function invoked for each incoming call. Absence of a
  /// handler at call time yields `InternalServerError`.
  pub fn set_call_handler(&self, f: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
    *self.call_handler.lock().unwrap() = Some(Box::new(f));
  }

  pub fn known_client_count(&self) -> usize {
    self.internals.lock().unwrap().len()
  }
}

impl Drop for RpcServer {
  fn drop(&mut self) {
    self.handle.discovery().unregister_specific_handler(self.discovery_handler_id);
    self.handle.announce_service_removed(&self.descriptor);
    for (client_uuid, endpoint) in self.internals.lock().unwrap().drain() {
      self.handle.unregister_network(&client_uuid, endpoint);
      self.handle.unregister_endpoint(endpoint);
    }
  }
}
