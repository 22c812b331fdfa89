//! Service discovery: a participant-owned singleton tracking which
//! controllers exist locally and which have been announced by peers, plus a
//! registry of predicate-matched callbacks ("specific handlers").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::structure::{match_labels, LabelKind, MatchingLabel, ServiceDescriptor};

/// Supplemental-data key constants, mirroring the reference
/// `supplKeyDataPublisher*`/`supplKeyRpcClient*` string constants.
pub const SUPPL_KEY_CONTROLLER_TYPE: &str = "controllerType";
pub const SUPPL_KEY_MEDIA_TYPE: &str = "mediaType";
pub const SUPPL_KEY_LABELS: &str = "labels";
pub const SUPPL_KEY_DATA_PUBLISHER_TOPIC: &str = "DataPublisherTopic";
pub const SUPPL_KEY_DATA_PUBLISHER_PUB_UUID: &str = "DataPublisherPubUuid";
pub const SUPPL_KEY_RPC_CLIENT_FUNCTION_NAME: &str = "RpcClientFunctionName";
pub const SUPPL_KEY_RPC_CLIENT_UUID: &str = "RpcClientUuid";
pub const SUPPL_KEY_RPC_SERVER_FUNCTION_NAME: &str = "RpcServerFunctionName";

pub const CONTROLLER_TYPE_DATA_PUBLISHER: &str = "DataPublisher";
pub const CONTROLLER_TYPE_RPC_CLIENT: &str = "RpcClient";
pub const CONTROLLER_TYPE_RPC_SERVER: &str = "RpcServer";

/// Encodes labels as `key=value:kind;...` for storage as one supplemental
/// string value (`supplementalData` is `map<string,string>`, not a richer
/// structure, so the label list has to ride inside a single entry).
pub fn encode_labels(labels: &[MatchingLabel]) -> String {
  labels
    .iter()
    .map(|l| format!("{}={}:{}", l.key, l.value, if l.kind == LabelKind::Mandatory { "M" } else { "O" }))
    .collect::<Vec<_>>()
    .join(";")
}

pub fn decode_labels(encoded: &str) -> Vec<MatchingLabel> {
  if encoded.is_empty() {
    return Vec::new();
  }
  encoded
    .split(';')
    .filter_map(|entry| {
      let (kv, kind) = entry.rsplit_once(':')?;
      let (key, value) = kv.split_once('=')?;
      let kind = if kind == "M" { LabelKind::Mandatory } else { LabelKind::Optional };
      Some(MatchingLabel::new(key, value, kind))
    })
    .collect()
}

pub fn labels_of(desc: &ServiceDescriptor) -> Vec<MatchingLabel> {
  desc.supplemental(SUPPL_KEY_LABELS).map(decode_labels).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
  ServiceCreated,
  ServiceRemoved,
}

/// The triple a caller registers interest with ("specific handlers").
pub struct SpecificHandlerQuery {
  pub controller_type: &'static str,
  /// Which supplemental key holds the value to compare (`DataPublisherTopic`,
  /// `RpcClientFunctionName`, ...).
  pub match_key: &'static str,
  pub match_value: String,
  pub labels: Vec<MatchingLabel>,
}

type Callback = dyn FnMut(DiscoveryEventKind, &ServiceDescriptor) + Send;

struct SpecificHandler {
  id: u64,
  query: SpecificHandlerQuery,
  callback: Arc<Mutex<Callback>>,
}

impl SpecificHandler {
  fn matches(&self, desc: &ServiceDescriptor) -> bool {
    desc.supplemental(SUPPL_KEY_CONTROLLER_TYPE) == Some(self.query.controller_type)
      && desc.supplemental(self.query.match_key) == Some(self.query.match_value.as_str())
      && match_labels(&self.query.labels, &labels_of(desc))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct ServiceDiscovery {
  local_announcements: Mutex<Vec<ServiceDescriptor>>,
  remote_cache: Mutex<HashMap<String, Vec<ServiceDescriptor>>>,
  handlers: Mutex<Vec<SpecificHandler>>,
  next_handler_id: AtomicU64,
}

impl ServiceDiscovery {
  pub fn new() -> Arc<Self> {
    Arc::new(ServiceDiscovery::default())
  }

  pub fn local_announcements(&self) -> Vec<ServiceDescriptor> {
    self.local_announcements.lock().unwrap().clone()
  }

  pub fn remote_services_of(&self, participant_name: &str) -> Vec<ServiceDescriptor> {
    self.remote_cache.lock().unwrap().get(participant_name).cloned().unwrap_or_default()
  }

  pub fn notify_service_created(&self, desc: ServiceDescriptor) {
    self.local_announcements.lock().unwrap().push(desc.clone());
    self.invoke_handlers(DiscoveryEventKind::ServiceCreated, &desc);
  }

  pub fn notify_service_removed(&self, desc: &ServiceDescriptor) {
    self.local_announcements.lock().unwrap().retain(|d| d != desc);
    self.invoke_handlers(DiscoveryEventKind::ServiceRemoved, desc);
  }

  /// Applies a remote `ServiceDiscoveryEvent` to `remote_cache` and runs any
  /// matching specific handlers.
  pub fn handle_remote_event(&self, kind: DiscoveryEventKind, desc: ServiceDescriptor) {
    {
      let mut cache = self.remote_cache.lock().unwrap();
      let entry = cache.entry(desc.participant_name.clone()).or_default();
      match kind {
        DiscoveryEventKind::ServiceCreated => entry.push(desc.clone()),
        DiscoveryEventKind::ServiceRemoved => entry.retain(|d| d != &desc),
      }
    }
    self.invoke_handlers(kind, &desc);
  }

  /// Purges everything cached for a peer that disconnected, synthesizing
  /// `ServiceRemoved` for each of its descriptors.
  pub fn on_peer_shutdown(&self, participant_name: &str) -> Vec<ServiceDescriptor> {
    let removed = self.remote_cache.lock().unwrap().remove(participant_name).unwrap_or_default();
    for desc in &removed {
      self.invoke_handlers(DiscoveryEventKind::ServiceRemoved, desc);
    }
    removed
  }

  pub fn register_specific_handler(
    &self,
    query: SpecificHandlerQuery,
    callback: impl FnMut(DiscoveryEventKind, &ServiceDescriptor) + Send + 'static,
  ) -> HandlerId {
    let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
    self.handlers.lock().unwrap().push(SpecificHandler { id, query, callback: Arc::new(Mutex::new(callback)) });
    HandlerId(id)
  }

  pub fn unregister_specific_handler(&self, id: HandlerId) {
    self.handlers.lock().unwrap().retain(|h| h.id != id.0);
  }

  /// Copy-on-iterate: the handler snapshot is cloned out from under the
  /// lock so a callback may register or unregister a handler reentrantly.
  fn invoke_handlers(&self, kind: DiscoveryEventKind, desc: &ServiceDescriptor) {
    let snapshot: Vec<(Arc<Mutex<Callback>>, bool)> = {
      let handlers = self.handlers.lock().unwrap();
      handlers.iter().map(|h| (h.callback.clone(), h.matches(desc))).collect()
    };
    for (callback, matched) in snapshot {
      if !matched {
        continue;
      }
      trace!("discovery: dispatching {kind:?} for {}/{} to a specific handler", desc.participant_name, desc.service_name);
      (callback.lock().unwrap())(kind, desc);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structure::{NetworkType, ServiceType};
  use std::collections::HashMap as StdHashMap;
  use std::sync::Mutex as StdMutex;

  fn publisher_descriptor(participant: &str, topic: &str, pub_uuid: &str, labels: &[MatchingLabel]) -> ServiceDescriptor {
    let mut supplemental = StdHashMap::new();
    supplemental.insert(SUPPL_KEY_CONTROLLER_TYPE.to_string(), CONTROLLER_TYPE_DATA_PUBLISHER.to_string());
    supplemental.insert(SUPPL_KEY_DATA_PUBLISHER_TOPIC.to_string(), topic.to_string());
    supplemental.insert(SUPPL_KEY_DATA_PUBLISHER_PUB_UUID.to_string(), pub_uuid.to_string());
    supplemental.insert(SUPPL_KEY_MEDIA_TYPE.to_string(), "A".to_string());
    supplemental.insert(SUPPL_KEY_LABELS.to_string(), encode_labels(labels));
    ServiceDescriptor {
      participant_name: participant.into(),
      network_name: pub_uuid.into(),
      service_name: "Pub1".into(),
      service_type: ServiceType::Controller,
      network_type: NetworkType::Data,
      service_id: 1,
      supplemental_data: supplemental,
    }
  }

  #[test]
  fn labels_round_trip_through_supplemental_encoding() {
    let labels = vec![
      MatchingLabel::new("k1", "v1", LabelKind::Mandatory),
      MatchingLabel::new("k2", "v2", LabelKind::Optional),
    ];
    let encoded = encode_labels(&labels);
    assert_eq!(decode_labels(&encoded), labels);
  }

  #[test]
  fn remote_event_invokes_matching_specific_handler() {
    let discovery = ServiceDiscovery::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen2 = seen.clone();
    discovery.register_specific_handler(
      SpecificHandlerQuery {
        controller_type: CONTROLLER_TYPE_DATA_PUBLISHER,
        match_key: SUPPL_KEY_DATA_PUBLISHER_TOPIC,
        match_value: "T".into(),
        labels: vec![],
      },
      move |kind, desc| seen2.lock().unwrap().push((kind, desc.participant_name.clone())),
    );

    let desc = publisher_descriptor("Other", "T", "uuid-1", &[]);
    discovery.handle_remote_event(DiscoveryEventKind::ServiceCreated, desc.clone());
    assert_eq!(*seen.lock().unwrap(), vec![(DiscoveryEventKind::ServiceCreated, "Other".to_string())]);

    discovery.on_peer_shutdown("Other");
    assert_eq!(
      *seen.lock().unwrap(),
      vec![(DiscoveryEventKind::ServiceCreated, "Other".to_string()), (DiscoveryEventKind::ServiceRemoved, "Other".to_string())]
    );
  }

  #[test]
  fn handler_does_not_fire_on_topic_mismatch() {
    let discovery = ServiceDiscovery::new();
    let seen = Arc::new(StdMutex::new(0u32));
    let seen2 = seen.clone();
    discovery.register_specific_handler(
      SpecificHandlerQuery {
        controller_type: CONTROLLER_TYPE_DATA_PUBLISHER,
        match_key: SUPPL_KEY_DATA_PUBLISHER_TOPIC,
        match_value: "Wanted".into(),
        labels: vec![],
      },
      move |_, _| *seen2.lock().unwrap() += 1,
    );
    let desc = publisher_descriptor("Other", "Different", "uuid-1", &[]);
    discovery.handle_remote_event(DiscoveryEventKind::ServiceCreated, desc);
    assert_eq!(*seen.lock().unwrap(), 0);
  }

  #[test]
  fn unregister_stops_future_dispatch() {
    let discovery = ServiceDiscovery::new();
    let seen = Arc::new(StdMutex::new(0u32));
    let seen2 = seen.clone();
    let id = discovery.register_specific_handler(
      SpecificHandlerQuery { controller_type: CONTROLLER_TYPE_DATA_PUBLISHER, match_key: SUPPL_KEY_DATA_PUBLISHER_TOPIC, match_value: "T".into(), labels: vec![] },
      move |_, _| *seen2.lock().unwrap() += 1,
    );
    discovery.unregister_specific_handler(id);
    let desc = publisher_descriptor("Other", "T", "uuid-1", &[]);
    discovery.handle_remote_event(DiscoveryEventKind::ServiceCreated, desc);
    assert_eq!(*seen.lock().unwrap(), 0);
  }
}
