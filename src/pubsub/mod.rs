//! Data pub/sub: publishers announce a topic/mediaType/label triple
//! through service discovery; subscribers watch for matching announcements
//! and wire up a direct `network`-keyed router registration per match.

use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::discovery::{
  DiscoveryEventKind, ServiceDiscovery, SpecificHandlerQuery, CONTROLLER_TYPE_DATA_PUBLISHER, SUPPL_KEY_CONTROLLER_TYPE,
  SUPPL_KEY_DATA_PUBLISHER_PUB_UUID, SUPPL_KEY_DATA_PUBLISHER_TOPIC, SUPPL_KEY_LABELS, SUPPL_KEY_MEDIA_TYPE,
};
use crate::participant::router::ServiceHandler;
use crate::participant::ParticipantHandle;
use crate::structure::{match_media_type, Endpoint, MatchingLabel, NetworkType, ServiceDescriptor, ServiceType};
use crate::wire::messages::DataMessage;
use crate::wire::Message;

fn pub_uuid(handle: &dyn ParticipantHandle, service_id: u32) -> String {
  format!("{:016x}-{service_id:x}", handle.participant_id())
}

/// A data source announced to the bus under `topic`/`media_type`/`labels`.
pub struct DataPublisher {
  handle: Arc<dyn ParticipantHandle>,
  descriptor: ServiceDescriptor,
  network: String,
  endpoint: Endpoint,
}

impl DataPublisher {
  pub fn create(
    handle: Arc<dyn ParticipantHandle>,
    topic: impl Into<String>,
    media_type: impl Into<String>,
    labels: Vec<MatchingLabel>,
  ) -> Self {
    let service_id = handle.allocate_service_id();
    let endpoint = Endpoint { participant_id: handle.participant_id(), service_id };
    let network = pub_uuid(handle.as_ref(), service_id);

    let mut supplemental = std::collections::HashMap::new();
    supplemental.insert(SUPPL_KEY_CONTROLLER_TYPE.to_string(), CONTROLLER_TYPE_DATA_PUBLISHER.to_string());
    supplemental.insert(SUPPL_KEY_DATA_PUBLISHER_TOPIC.to_string(), topic.into());
    supplemental.insert(SUPPL_KEY_DATA_PUBLISHER_PUB_UUID.to_string(), network.clone());
    supplemental.insert(SUPPL_KEY_MEDIA_TYPE.to_string(), media_type.into());
    supplemental.insert(SUPPL_KEY_LABELS.to_string(), crate::discovery::encode_labels(&labels));

    let descriptor = ServiceDescriptor {
      participant_name: handle.participant_name(),
      network_name: network.clone(),
      service_name: format!("DataPublisher{service_id}"),
      service_type: ServiceType::Controller,
      network_type: NetworkType::Data,
      service_id,
      supplemental_data: supplemental,
    };

    handle.announce_service_created(descriptor.clone());
    DataPublisher { handle, descriptor, network, endpoint }
  }

  pub fn topic(&self) -> &str {
    self.descriptor.supplemental(SUPPL_KEY_DATA_PUBLISHER_TOPIC).unwrap_or("")
  }

  /// Broadcasts `data` on this publisher's network to every connected peer.
  /// Peers without a matching subscriber simply have nowhere to route it.
  pub fn publish(&self, data: Vec<u8>) {
    trace!("DataPublisher '{}': publishing {} bytes on {}", self.topic(), data.len(), self.network);
    let msg = Message::DataMessage(DataMessage { network: self.network.clone(), timestamp: self.handle.now_ns(), data });
    self.handle.broadcast(&msg, self.endpoint);
  }
}

impl Drop for DataPublisher {
  fn drop(&mut self) {
    self.handle.announce_service_removed(&self.descriptor);
    self.handle.unregister_endpoint(self.endpoint);
  }
}

pub type DataHandler = dyn FnMut(&[u8], i64) + Send;

struct SubscriberHandler {
  callback: Arc<Mutex<DataHandler>>,
}

impl ServiceHandler for SubscriberHandler {
  fn receive(&mut self, _from: Endpoint, msg: &Message) {
    if let Message::DataMessage(data) = msg {
      (self.callback.lock().unwrap())(&data.data, data.timestamp);
    }
  }
}

/// Watches for `DataPublisher`s matching `topic`/`media_type`/`labels` and
/// wires up network routing for each one discovered; one subscriber
/// can end up receiving from several publishers if more than one matches.
pub struct DataSubscriber {
  handle: Arc<dyn ParticipantHandle>,
  handler_id: crate::discovery::HandlerId,
  endpoint: Endpoint,
  media_type: String,
  joined_networks: Arc<Mutex<Vec<String>>>,
}

impl DataSubscriber {
  pub fn create(
    handle: Arc<dyn ParticipantHandle>,
    topic: impl Into<String>,
    media_type: impl Into<String>,
    labels: Vec<MatchingLabel>,
    on_data: impl FnMut(&[u8], i64) + Send + 'static,
  ) -> Self {
    let service_id = handle.allocate_service_id();
    let endpoint = Endpoint { participant_id: handle.participant_id(), service_id };
    let media_type = media_type.into();
    let callback: Arc<Mutex<DataHandler>> = Arc::new(Mutex::new(on_data));
    handle.register_endpoint(endpoint, Box::new(SubscriberHandler { callback }));

    let joined_networks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let joined_for_callback = joined_networks.clone();
    let handle_for_callback = handle.clone();
    let expected_media_type = media_type.clone();

    let handler_id = handle.discovery().register_specific_handler(
      SpecificHandlerQuery {
        controller_type: CONTROLLER_TYPE_DATA_PUBLISHER,
        match_key: SUPPL_KEY_DATA_PUBLISHER_TOPIC,
        match_value: topic.into(),
        labels,
      },
      move |kind, desc| {
        if !match_media_type(&expected_media_type, desc.supplemental(SUPPL_KEY_MEDIA_TYPE).unwrap_or("")) {
          return;
        }
        let Some(network) = desc.supplemental(SUPPL_KEY_DATA_PUBLISHER_PUB_UUID) else {
          warn!("DataPublisher announcement missing pubUUID, ignoring");
          return;
        };
        match kind {
          DiscoveryEventKind::ServiceCreated => {
            handle_for_callback.register_network(network, endpoint);
            joined_for_callback.lock().unwrap().push(network.to_string());
          }
          DiscoveryEventKind::ServiceRemoved => {
            handle_for_callback.unregister_network(network, endpoint);
            joined_for_callback.lock().unwrap().retain(|n| n != network);
          }
        }
      },
    );

    DataSubscriber { handle, handler_id, endpoint, media_type, joined_networks }
  }

  pub fn media_type(&self) -> &str {
    &self.media_type
  }

  pub fn joined_network_count(&self) -> usize {
    self.joined_networks.lock().unwrap().len()
  }
}

impl Drop for DataSubscriber {
  fn drop(&mut self) {
    self.handle.discovery().unregister_specific_handler(self.handler_id);
    for network in self.joined_networks.lock().unwrap().drain(..) {
      self.handle.unregister_network(&network, self.endpoint);
    }
    self.handle.unregister_endpoint(self.endpoint);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::discovery::ServiceDiscovery;
  use crate::participant::router::RouterTable;
  use crate::participant::TimeoutPollerId;
  use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
  use std::sync::Mutex as StdMutex;

  struct FakeHandle {
    participant_id: u64,
    discovery: Arc<ServiceDiscovery>,
    router: StdMutex<RouterTable>,
    broadcasts: StdMutex<Vec<Message>>,
    next_service_id: AtomicU32,
    next_poller_id: AtomicU64,
  }

  impl FakeHandle {
    fn new(participant_id: u64, discovery: Arc<ServiceDiscovery>) -> Arc<Self> {
      Arc::new(FakeHandle {
        participant_id,
        discovery,
        router: StdMutex::new(RouterTable::new()),
        broadcasts: StdMutex::new(Vec::new()),
        next_service_id: AtomicU32::new(0),
        next_poller_id: AtomicU64::new(0),
      })
    }
  }

  impl ParticipantHandle for FakeHandle {
    fn participant_name(&self) -> String {
      format!("P{}", self.participant_id)
    }
    fn participant_id(&self) -> u64 {
      self.participant_id
    }
    fn allocate_service_id(&self) -> u32 {
      self.next_service_id.fetch_add(1, Ordering::Relaxed)
    }
    fn discovery(&self) -> Arc<ServiceDiscovery> {
      self.discovery.clone()
    }
    fn broadcast(&self, msg: &Message, from: Endpoint) {
      self.broadcasts.lock().unwrap().push(msg.clone());
      if let Some(network) = msg.routing_network() {
        self.router.lock().unwrap().dispatch_to_network(network, from, msg);
      }
    }
    fn register_network(&self, network: &str, endpoint: Endpoint) {
      self.router.lock().unwrap().register_network(network, endpoint);
    }
    fn unregister_network(&self, network: &str, endpoint: Endpoint) {
      self.router.lock().unwrap().unregister_network(network, endpoint);
    }
    fn register_endpoint(&self, endpoint: Endpoint, handler: Box<dyn ServiceHandler>) {
      self.router.lock().unwrap().register_endpoint(endpoint, handler);
    }
    fn unregister_endpoint(&self, endpoint: Endpoint) {
      self.router.lock().unwrap().unregister_endpoint(endpoint);
    }
    fn now_ns(&self) -> i64 {
      0
    }
    fn register_timeout_poller(&self, _poller: Box<dyn FnMut(i64) + Send>) -> TimeoutPollerId {
      TimeoutPollerId(self.next_poller_id.fetch_add(1, Ordering::Relaxed))
    }
    fn unregister_timeout_poller(&self, _id: TimeoutPollerId) {}
  }

  /// Publisher and subscriber sides each own their own router/discovery, as
  /// they would in separate processes; relaying the one captured
  /// `ServiceDiscoveryEvent` broadcast frame stands in for the wire hop, and
  /// relaying the captured `DataMessage` broadcast stands in for the
  /// subscriber's own `Participant::handle_frame` dispatch.
  #[test]
  fn subscriber_joins_network_on_matching_publisher_and_receives_publish() {
    let publisher_concrete = FakeHandle::new(1, ServiceDiscovery::new());
    let subscriber_concrete = FakeHandle::new(2, ServiceDiscovery::new());
    let publisher_dyn: Arc<dyn ParticipantHandle> = publisher_concrete.clone();
    let subscriber_dyn: Arc<dyn ParticipantHandle> = subscriber_concrete.clone();

    let received = Arc::new(StdMutex::new(Vec::new()));
    let received2 = received.clone();
    let _subscriber = DataSubscriber::create(subscriber_dyn, "Speed", "A", vec![], move |data, _ts| {
      received2.lock().unwrap().push(data.to_vec());
    });

    let publisher = DataPublisher::create(publisher_dyn, "Speed", "A", vec![]);
    // Relay the ServiceDiscoveryEvent the publisher's own announce broadcast
    // just produced, as the subscriber's participant would on receipt.
    let announce = publisher_concrete.broadcasts.lock().unwrap().last().cloned().expect("create should announce");
    let Message::ServiceDiscoveryEvent(ref event) = announce else { panic!("expected ServiceDiscoveryEvent") };
    subscriber_concrete.discovery.handle_remote_event(DiscoveryEventKind::ServiceCreated, event.descriptor.clone());

    publisher.publish(vec![1, 2, 3]);
    let msg = publisher_concrete.broadcasts.lock().unwrap().last().cloned().expect("publish should broadcast");
    let Message::DataMessage(ref data) = msg else { panic!("expected DataMessage") };
    let from = Endpoint { participant_id: 0, service_id: 0 };
    subscriber_concrete.router.lock().unwrap().dispatch_to_network(&data.network, from, &msg);

    assert_eq!(*received.lock().unwrap(), vec![vec![1, 2, 3]]);
    assert_eq!(_subscriber.joined_network_count(), 1);
  }

  #[test]
  fn subscriber_ignores_publisher_with_mismatched_media_type() {
    let publisher_concrete = FakeHandle::new(1, ServiceDiscovery::new());
    let subscriber_concrete = FakeHandle::new(2, ServiceDiscovery::new());
    let publisher_dyn: Arc<dyn ParticipantHandle> = publisher_concrete.clone();
    let subscriber_dyn: Arc<dyn ParticipantHandle> = subscriber_concrete.clone();

    let subscriber = DataSubscriber::create(subscriber_dyn, "Speed", "B", vec![], |_, _| {});
    let publisher = DataPublisher::create(publisher_dyn, "Speed", "A", vec![]);
    let announce = publisher_concrete.broadcasts.lock().unwrap().last().cloned().expect("create should announce");
    let Message::ServiceDiscoveryEvent(ref event) = announce else { panic!("expected ServiceDiscoveryEvent") };
    subscriber_concrete.discovery.handle_remote_event(DiscoveryEventKind::ServiceCreated, event.descriptor.clone());

    assert_eq!(subscriber.joined_network_count(), 0);
  }
}
