//! Endpoint-addressed dispatch table: inbound wire messages are
//! routed either to a specific `(participantId, serviceId)` endpoint or to
//! every local service registered under a `network` key (the pub/sub
//! `pubUUID` or RPC `clientUUID` routing string).

use std::collections::HashMap;

use log::trace;

use crate::structure::Endpoint;
use crate::wire::Message;

/// A local service capable of receiving routed messages. Implemented by the
/// internal pieces of pub/sub, RPC and discovery; kept intentionally narrow
/// (one method) so any controller can be boxed as a trait object without an
/// inheritance hierarchy.
pub trait ServiceHandler: Send {
  fn receive(&mut self, from: Endpoint, msg: &Message);
}

#[derive(Default)]
pub struct RouterTable {
  by_endpoint: HashMap<Endpoint, Box<dyn ServiceHandler>>,
  by_network: HashMap<String, Vec<Endpoint>>,
}

impl RouterTable {
  pub fn new() -> Self {
    RouterTable::default()
  }

  pub fn register_endpoint(&mut self, endpoint: Endpoint, handler: Box<dyn ServiceHandler>) {
    self.by_endpoint.insert(endpoint, handler);
  }

  pub fn unregister_endpoint(&mut self, endpoint: Endpoint) {
    self.by_endpoint.remove(&endpoint);
    for endpoints in self.by_network.values_mut() {
      endpoints.retain(|e| *e != endpoint);
    }
  }

  pub fn register_network(&mut self, network: impl Into<String>, endpoint: Endpoint) {
    self.by_network.entry(network.into()).or_default().push(endpoint);
  }

  pub fn unregister_network(&mut self, network: &str, endpoint: Endpoint) {
    if let Some(endpoints) = self.by_network.get_mut(network) {
      endpoints.retain(|e| *e != endpoint);
      if endpoints.is_empty() {
        self.by_network.remove(network);
      }
    }
  }

  pub fn dispatch_to_endpoint(&mut self, endpoint: Endpoint, from: Endpoint, msg: &Message) {
    if let Some(handler) = self.by_endpoint.get_mut(&endpoint) {
      handler.receive(from, msg);
    } else {
      trace!("no handler registered for endpoint {endpoint:?}, dropping message");
    }
  }

  /// Delivers to every endpoint registered on `network`, except `from`
  /// itself: a participant never observes its own sends.
  pub fn dispatch_to_network(&mut self, network: &str, from: Endpoint, msg: &Message) {
    let Some(targets) = self.by_network.get(network).cloned() else {
      return;
    };
    for endpoint in targets {
      if endpoint == from {
        continue;
      }
      self.dispatch_to_endpoint(endpoint, from, msg);
    }
  }

  pub fn network_endpoints(&self, network: &str) -> &[Endpoint] {
    self.by_network.get(network).map(Vec::as_slice).unwrap_or(&[])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::messages::{DataMessage, PeerShutdown};
  use std::sync::{Arc, Mutex};

  struct RecordingHandler {
    received: Arc<Mutex<Vec<Endpoint>>>,
  }

  impl ServiceHandler for RecordingHandler {
    fn receive(&mut self, from: Endpoint, _msg: &Message) {
      self.received.lock().unwrap().push(from);
    }
  }

  #[test]
  fn dispatch_to_endpoint_invokes_registered_handler() {
    let mut router = RouterTable::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let ep = Endpoint { participant_id: 1, service_id: 1 };
    router.register_endpoint(ep, Box::new(RecordingHandler { received: received.clone() }));

    let from = Endpoint { participant_id: 2, service_id: 1 };
    let msg = Message::PeerShutdown(PeerShutdown { participant_name: "X".into() });
    router.dispatch_to_endpoint(ep, from, &msg);
    assert_eq!(*received.lock().unwrap(), vec![from]);
  }

  #[test]
  fn network_dispatch_excludes_sender() {
    let mut router = RouterTable::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let publisher = Endpoint { participant_id: 1, service_id: 1 };
    let subscriber = Endpoint { participant_id: 2, service_id: 5 };
    router.register_network("pub-uuid", publisher);
    router.register_network("pub-uuid", subscriber);
    router.register_endpoint(publisher, Box::new(RecordingHandler { received: received.clone() }));
    router.register_endpoint(subscriber, Box::new(RecordingHandler { received: received.clone() }));

    let msg = Message::DataMessage(DataMessage { network: "pub-uuid".into(), timestamp: 0, data: vec![1] });
    router.dispatch_to_network("pub-uuid", publisher, &msg);
    assert_eq!(*received.lock().unwrap(), vec![subscriber]);
  }

  #[test]
  fn unregister_network_removes_single_endpoint_without_affecting_others() {
    let mut router = RouterTable::new();
    let a = Endpoint { participant_id: 1, service_id: 1 };
    let b = Endpoint { participant_id: 2, service_id: 1 };
    router.register_network("net", a);
    router.register_network("net", b);
    router.unregister_network("net", a);
    assert_eq!(router.network_endpoints("net"), &[b]);
  }
}
