//! Owns the listening socket and every peer connection, and turns mio
//! readiness events into application-level [`TransportEvent`]s.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio_06::net::{TcpListener, TcpStream};
use mio_06::{Events, Poll, PollOpt, Ready, Token};

use crate::error::{VasioError, VasioResult};
use crate::wire::Message;

use super::peer::Peer;

const LISTENER_TOKEN: Token = Token(0);
const FIRST_PEER_TOKEN: usize = 1;

pub enum TransportEvent {
  Accepted(Token),
  FramesReceived(Token, Vec<Message>),
  PeerClosed(Token),
}

/// Parses a `silkit://host:port` acceptor URI into a socket address. Any
/// other scheme is rejected. `local://` (Unix-domain-socket) acceptors are
/// named alongside `silkit://` in the wire-transport description but are not
/// implemented yet -- see the "Known gap" note in DESIGN.md under
/// `src/transport`.
pub fn parse_acceptor_uri(uri: &str) -> VasioResult<SocketAddr> {
  let rest = uri
    .strip_prefix("silkit://")
    .ok_or_else(|| VasioError::Configuration(format!("unsupported acceptor URI scheme: {uri}")))?;
  rest
    .parse()
    .map_err(|_| VasioError::Configuration(format!("malformed acceptor URI: {uri}")))
}

pub struct ConnectionManager {
  poll: Poll,
  listener: TcpListener,
  listen_addr: SocketAddr,
  peers: HashMap<Token, Peer>,
  next_token: usize,
}

impl ConnectionManager {
  pub fn bind(listen_addr: SocketAddr) -> VasioResult<Self> {
    let listener = TcpListener::bind(&listen_addr).map_err(VasioError::Io)?;
    let listen_addr = listener.local_addr().map_err(VasioError::Io)?;
    let poll = Poll::new().map_err(VasioError::Io)?;
    poll
      .register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())
      .map_err(VasioError::Io)?;
    info!("vasio transport listening on {listen_addr}");
    Ok(ConnectionManager { poll, listener, listen_addr, peers: HashMap::new(), next_token: FIRST_PEER_TOKEN })
  }

  pub fn listen_addr(&self) -> SocketAddr {
    self.listen_addr
  }

  pub fn connect(&mut self, addr: SocketAddr) -> VasioResult<Token> {
    let stream = TcpStream::connect(&addr).map_err(VasioError::Io)?;
    Ok(self.adopt_stream(stream))
  }

  fn adopt_stream(&mut self, stream: TcpStream) -> Token {
    let token = Token(self.next_token);
    self.next_token += 1;
    self
      .poll
      .register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge())
      .unwrap_or_else(|e| error!("failed to register peer {token:?} with poller: {e}"));
    self.peers.insert(token, Peer::new(token, stream));
    token
  }

  pub fn peer(&self, token: Token) -> Option<&Peer> {
    self.peers.get(&token)
  }

  pub fn peer_mut(&mut self, token: Token) -> Option<&mut Peer> {
    self.peers.get_mut(&token)
  }

  pub fn peers(&self) -> impl Iterator<Item = (&Token, &Peer)> {
    self.peers.iter()
  }

  pub fn send(&mut self, token: Token, msg: &Message) -> VasioResult<()> {
    let peer = self
      .peers
      .get_mut(&token)
      .ok_or_else(|| VasioError::Transport(format!("send to unknown peer {token:?}")))?;
    peer.queue_send(msg)?;
    if !peer.flush_send()? {
      self.reregister_for_write(token);
    }
    Ok(())
  }

  pub fn broadcast(&mut self, msg: &Message, exclude: Option<Token>) {
    let targets: Vec<Token> = self.peers.keys().copied().filter(|t| Some(*t) != exclude).collect();
    for token in targets {
      if let Err(e) = self.send(token, msg) {
        warn!("broadcast to {token:?} failed: {e}");
      }
    }
  }

  fn reregister_for_write(&mut self, token: Token) {
    if let Some(peer) = self.peers.get(&token) {
      if let Err(e) = self.poll.reregister(
        peer.as_mio_source(),
        token,
        Ready::readable() | Ready::writable(),
        PollOpt::edge(),
      ) {
        error!("failed to reregister peer {token:?} for write readiness: {e}");
      }
    }
  }

  pub fn drop_peer(&mut self, token: Token) {
    if let Some(mut peer) = self.peers.remove(&token) {
      peer.shutdown();
    }
  }

  /// Block up to `timeout` for readiness, translating mio events into
  /// [`TransportEvent`]s. Accept-loop runs to exhaustion on each wakeup.
  pub fn poll(&mut self, timeout: Option<Duration>) -> VasioResult<Vec<TransportEvent>> {
    let mut events = Events::with_capacity(256);
    self.poll.poll(&mut events, timeout).map_err(VasioError::Io)?;

    let mut out = Vec::new();
    for event in &events {
      if event.token() == LISTENER_TOKEN {
        self.accept_pending(&mut out);
        continue;
      }
      let token = event.token();
      if event.readiness().is_writable() {
        if let Some(peer) = self.peers.get_mut(&token) {
          match peer.flush_send() {
            Ok(_) => {}
            Err(e) => {
              warn!("dropping peer {token:?} after write error: {e}");
              self.drop_peer(token);
              out.push(TransportEvent::PeerClosed(token));
              continue;
            }
          }
        }
      }
      if event.readiness().is_readable() {
        let result = self.peers.get_mut(&token).map(Peer::on_readable);
        match result {
          Some(Ok(frames)) => {
            if !frames.is_empty() {
              out.push(TransportEvent::FramesReceived(token, frames));
            }
          }
          Some(Err(e)) => {
            debug!("peer {token:?} disconnected: {e}");
            self.drop_peer(token);
            out.push(TransportEvent::PeerClosed(token));
          }
          None => {}
        }
      }
    }
    Ok(out)
  }

  fn accept_pending(&mut self, out: &mut Vec<TransportEvent>) {
    loop {
      match self.listener.accept() {
        Ok((stream, addr)) => {
          let token = self.adopt_stream(stream);
          debug!("accepted connection from {addr} as {token:?}");
          out.push(TransportEvent::Accepted(token));
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
        Err(e) => {
          error!("accept() failed: {e}");
          break;
        }
      }
    }
  }
}
