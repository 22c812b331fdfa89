//! The registry: a participant-free broker. Listens on one or more
//! transport URIs, introduces newly-joined peers to the peers it already
//! knows, and tells survivors when someone leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use mio_06::Token;

use crate::error::VasioResult;
use crate::structure::PeerInfo;
use crate::transport::{parse_acceptor_uri, ConnectionManager, TransportEvent};
use crate::wire::messages::{
  HandshakeStatus, KnownParticipants, ParticipantAnnouncementReply, PeerAnnouncement, PeerShutdown,
};
use crate::wire::{Message, ProtocolVersion};

const REGISTRY_NAME: &str = "vasio-registry";

/// Registry-side bookkeeping about a peer that has completed its handshake.
struct ConnectedPeer {
  info: PeerInfo,
}

pub struct Registry {
  manager: ConnectionManager,
  connected: HashMap<Token, ConnectedPeer>,
  names: HashMap<String, Token>,
  on_all_connected: Option<Box<dyn Fn() + Send>>,
  on_all_disconnected: Option<Box<dyn Fn() + Send>>,
  expected_peer_count: Option<usize>,
  has_fired_all_connected: bool,
}

impl Registry {
  pub fn bind(listen_addr: SocketAddr) -> VasioResult<Self> {
    let manager = ConnectionManager::bind(listen_addr)?;
    Ok(Registry {
      manager,
      connected: HashMap::new(),
      names: HashMap::new(),
      on_all_connected: None,
      on_all_disconnected: None,
      expected_peer_count: None,
      has_fired_all_connected: false,
    })
  }

  pub fn bind_uri(uri: &str) -> VasioResult<Self> {
    Registry::bind(parse_acceptor_uri(uri)?)
  }

  pub fn listen_addr(&self) -> SocketAddr {
    self.manager.listen_addr()
  }

  pub fn set_expected_peer_count(&mut self, n: usize) {
    self.expected_peer_count = Some(n);
  }

  pub fn set_all_connected_handler(&mut self, f: impl Fn() + Send + 'static) {
    self.on_all_connected = Some(Box::new(f));
  }

  pub fn set_all_disconnected_handler(&mut self, f: impl Fn() + Send + 'static) {
    self.on_all_disconnected = Some(Box::new(f));
  }

  /// Run one reactor tick. Returns normally when `timeout` elapses with
  /// nothing to do; callers loop this from `run`.
  pub fn tick(&mut self, timeout: Option<Duration>) -> VasioResult<()> {
    let events = self.manager.poll(timeout)?;
    for event in events {
      match event {
        TransportEvent::Accepted(token) => {
          debug!("registry: accepted connection {token:?}");
        }
        TransportEvent::FramesReceived(token, frames) => {
          for frame in frames {
            self.handle_frame(token, frame)?;
          }
        }
        TransportEvent::PeerClosed(token) => {
          self.handle_disconnect(token);
        }
      }
    }
    Ok(())
  }

  /// Blocks the calling thread, driving the reactor loop forever.
  pub fn run(&mut self) -> VasioResult<()> {
    loop {
      self.tick(Some(Duration::from_millis(200)))?;
    }
  }

  fn handle_frame(&mut self, token: Token, msg: Message) -> VasioResult<()> {
    match msg {
      Message::ParticipantAnnouncement(announcement) => self.handle_announcement(token, announcement),
      Message::ParticipantNotification(_) => {
        self.handle_disconnect(token);
        Ok(())
      }
      other => {
        warn!("registry: ignoring unexpected message from {token:?}: {other:?}");
        Ok(())
      }
    }
  }

  fn handle_announcement(
    &mut self,
    token: Token,
    announcement: crate::wire::messages::ParticipantAnnouncement,
  ) -> VasioResult<()> {
    let negotiated = ProtocolVersion::negotiate(ProtocolVersion::CURRENT, announcement.protocol_version);
    let peer_info = announcement.peer_info;

    if self.names.contains_key(&peer_info.participant_name) {
      warn!(
        "registry: rejecting duplicate participant name '{}' on {token:?}",
        peer_info.participant_name
      );
      let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
        status: HandshakeStatus::Failed,
        protocol_version: negotiated,
        remote_peer_info: registry_identity(),
      });
      self.manager.send(token, &reply)?;
      self.manager.drop_peer(token);
      return Ok(());
    }

    let reply = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
      status: HandshakeStatus::Success,
      protocol_version: negotiated,
      remote_peer_info: registry_identity(),
    });
    self.manager.send(token, &reply)?;

    let known = Message::KnownParticipants(KnownParticipants {
      peers: self.connected.values().map(|p| p.info.clone()).collect(),
    });
    self.manager.send(token, &known)?;

    let announce_new = Message::PeerAnnouncement(PeerAnnouncement { new_peer: peer_info.clone() });
    self.manager.broadcast(&announce_new, Some(token));

    info!("registry: participant '{}' joined as {token:?}", peer_info.participant_name);
    self.names.insert(peer_info.participant_name.clone(), token);
    self.connected.insert(token, ConnectedPeer { info: peer_info });

    if !self.has_fired_all_connected {
      if let Some(expected) = self.expected_peer_count {
        if self.connected.len() >= expected {
          self.has_fired_all_connected = true;
          if let Some(cb) = &self.on_all_connected {
            cb();
          }
        }
      }
    }
    Ok(())
  }

  fn handle_disconnect(&mut self, token: Token) {
    self.manager.drop_peer(token);
    let Some(peer) = self.connected.remove(&token) else {
      return;
    };
    self.names.remove(&peer.info.participant_name);
    info!("registry: participant '{}' disconnected", peer.info.participant_name);

    let shutdown = Message::PeerShutdown(PeerShutdown { participant_name: peer.info.participant_name });
    self.manager.broadcast(&shutdown, None);

    if self.connected.is_empty() {
      if let Some(cb) = &self.on_all_disconnected {
        cb();
      }
    }
  }
}

/// The registry has no `ServiceDescriptor`s of its own; this is a stable,
/// empty identity used only to fill the reply's `remotePeerInfo` field.
fn registry_identity() -> PeerInfo {
  PeerInfo::new(REGISTRY_NAME, Vec::new(), String::new())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::messages::ParticipantAnnouncement;
  use std::net::TcpStream as StdTcpStream;

  fn free_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
  }

  #[test_log::test]
  fn second_join_receives_first_as_known_participant() {
    let mut registry = Registry::bind(free_addr()).unwrap();
    let addr = registry.listen_addr();

    let std_a = StdTcpStream::connect(addr).unwrap();
    std_a.set_nonblocking(true).unwrap();
    registry.tick(Some(Duration::from_millis(50))).unwrap();

    let mut mio_a = mio_06::net::TcpStream::from_stream(std_a).unwrap();
    send_announcement(&mut mio_a, "A");
    registry.tick(Some(Duration::from_millis(50))).unwrap();

    let std_b = StdTcpStream::connect(addr).unwrap();
    std_b.set_nonblocking(true).unwrap();
    registry.tick(Some(Duration::from_millis(50))).unwrap();
    let mut mio_b = mio_06::net::TcpStream::from_stream(std_b).unwrap();
    send_announcement(&mut mio_b, "B");
    registry.tick(Some(Duration::from_millis(50))).unwrap();

    assert_eq!(registry.connected.len(), 2);
    assert!(registry.names.contains_key("A"));
    assert!(registry.names.contains_key("B"));
  }

  fn send_announcement(stream: &mut mio_06::net::TcpStream, name: &str) {
    use std::io::Write;
    let msg = Message::ParticipantAnnouncement(ParticipantAnnouncement {
      peer_info: PeerInfo::new(name, vec![], String::new()),
      protocol_version: ProtocolVersion::CURRENT,
    });
    let frame = msg.encode_frame(ProtocolVersion::CURRENT);
    stream.write_all(&frame).unwrap();
  }
}
