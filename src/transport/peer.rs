//! A single peer-to-peer TCP connection: framing, a bounded send buffer and
//! a receive accumulator that assembles whole [`Message`] frames out of
//! however the kernel happens to chunk the stream.

use std::io::{self, ErrorKind, Read, Write};

use log::{debug, trace, warn};
use mio_06::net::TcpStream;
use mio_06::Token;

use crate::error::{VasioError, VasioResult};
use crate::structure::PeerInfo;
use crate::wire::{BackpressurePolicy, Message, ProtocolVersion, RingBuffer, FRAME_HEADER_LEN};

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Lifecycle stage of one connection, mirroring the handshake below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
  /// TCP connected, `ParticipantAnnouncement` not yet exchanged both ways.
  Handshaking,
  Established,
}

pub struct Peer {
  pub token: Token,
  stream: TcpStream,
  state: PeerState,
  send_buffer: RingBuffer,
  recv_accum: Vec<u8>,
  backpressure: BackpressurePolicy,
  protocol_version: ProtocolVersion,
  /// Filled in once the handshake completes.
  pub peer_info: Option<PeerInfo>,
  write_interest: bool,
}

impl Peer {
  pub fn new(token: Token, stream: TcpStream) -> Self {
    Peer {
      token,
      stream,
      state: PeerState::Handshaking,
      send_buffer: RingBuffer::new(INITIAL_BUFFER_CAPACITY),
      recv_accum: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
      backpressure: BackpressurePolicy::default(),
      protocol_version: ProtocolVersion::CURRENT,
      peer_info: None,
      write_interest: false,
    }
  }

  pub fn state(&self) -> PeerState {
    self.state
  }

  pub fn mark_established(&mut self, protocol_version: ProtocolVersion, peer_info: PeerInfo) {
    self.protocol_version = protocol_version;
    self.peer_info = Some(peer_info);
    self.state = PeerState::Established;
  }

  pub fn participant_name(&self) -> Option<&str> {
    self.peer_info.as_ref().map(|p| p.participant_name.as_str())
  }

  /// True if the previous `flush_send` left unsent bytes queued, meaning the
  /// reactor should keep this peer registered for write-readiness.
  pub fn wants_write(&self) -> bool {
    self.write_interest
  }

  pub fn queue_send(&mut self, msg: &Message) -> VasioResult<()> {
    let frame = msg.encode_frame(self.protocol_version);
    if frame.len() > self.send_buffer.free_space() {
      let additional = frame.len() - self.send_buffer.free_space();
      self.backpressure.admit_growth(&self.send_buffer, additional)?;
    }
    self.send_buffer.write(&frame);
    self.write_interest = true;
    Ok(())
  }

  /// Drain as much of the send buffer as the socket will currently accept.
  /// Returns `true` once the buffer is fully flushed.
  pub fn flush_send(&mut self) -> VasioResult<bool> {
    let mut scratch = vec![0u8; self.send_buffer.size()];
    loop {
      let pending = self.send_buffer.size();
      if pending == 0 {
        self.write_interest = false;
        return Ok(true);
      }
      if scratch.len() < pending {
        scratch.resize(pending, 0);
      }
      let chunk = &mut scratch[..pending];
      let copied = self.send_buffer.peek(chunk);
      debug_assert!(copied);
      match self.stream.write(chunk) {
        Ok(0) => {
          return Err(VasioError::Transport("peer closed connection during write".into()));
        }
        Ok(n) => {
          self.send_buffer.advance_r_pos(n);
          if n < pending {
            self.write_interest = true;
            return Ok(false);
          }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
          self.write_interest = true;
          return Ok(false);
        }
        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
        Err(e) => return Err(VasioError::Io(e)),
      }
    }
  }

  /// Pull everything currently available from the socket into the receive
  /// accumulator, then peel off every complete frame it now contains.
  pub fn on_readable(&mut self) -> VasioResult<Vec<Message>> {
    let mut chunk = [0u8; 8192];
    loop {
      match self.stream.read(&mut chunk) {
        Ok(0) => {
          return Err(VasioError::Transport("peer closed connection".into()));
        }
        Ok(n) => self.recv_accum.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
        Err(e) => return Err(VasioError::Io(e)),
      }
    }
    self.drain_complete_frames()
  }

  fn drain_complete_frames(&mut self) -> VasioResult<Vec<Message>> {
    let mut out = Vec::new();
    let mut consumed = 0usize;
    loop {
      let remaining = &self.recv_accum[consumed..];
      if remaining.len() < FRAME_HEADER_LEN {
        break;
      }
      let total_length = match Message::peek_frame_length(remaining) {
        Some(len) => len as usize,
        None => break,
      };
      if remaining.len() < total_length {
        break;
      }
      let frame = &remaining[..total_length];
      match Message::decode_frame(frame, self.protocol_version) {
        Ok(msg) => out.push(msg),
        Err(e) => {
          warn!("discarding malformed frame from peer {:?}: {e}", self.token);
        }
      }
      consumed += total_length;
    }
    if consumed > 0 {
      self.recv_accum.drain(..consumed);
      trace!("peer {:?}: consumed {consumed} bytes, {} remain buffered", self.token, self.recv_accum.len());
    }
    Ok(out)
  }

  pub fn shutdown(&mut self) {
    if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
      if e.kind() != ErrorKind::NotConnected {
        debug!("error shutting down peer {:?}: {e}", self.token);
      }
    }
  }

  pub fn as_mio_source(&self) -> &TcpStream {
    &self.stream
  }

  pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
    self.stream.local_addr()
  }

  pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
    self.stream.peer_addr()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::wire::messages::{HandshakeStatus, ParticipantAnnouncementReply};
  use std::net::TcpListener as StdTcpListener;

  fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    client.set_nonblocking(true).unwrap();
    (TcpStream::from_stream(server).unwrap(), TcpStream::from_stream(client).unwrap())
  }

  #[test]
  fn queued_frame_flushes_and_is_parsed_on_the_other_end() -> anyhow::Result<()> {
    let (server_stream, client_stream) = connected_pair();
    let mut server = Peer::new(Token(1), server_stream);
    let mut client = Peer::new(Token(2), client_stream);

    let msg = Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
      status: HandshakeStatus::Success,
      protocol_version: ProtocolVersion::CURRENT,
      remote_peer_info: PeerInfo::new("Ego", vec![], "".into()),
    });
    server.queue_send(&msg)?;
    assert!(server.flush_send()?);

    std::thread::sleep(std::time::Duration::from_millis(20));
    let received = client.on_readable()?;
    assert_eq!(received, vec![msg]);
    Ok(())
  }
}
