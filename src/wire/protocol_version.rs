//! The handshake-exchanged protocol version. Peers agree to use the lower of
//! the two for subsequent ser/des, ported from the reference `ProtocolVersion`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
  pub major: u16,
  pub minor: u16,
}

impl ProtocolVersion {
  pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

  /// The version two handshaking peers should use for all subsequent frames:
  /// always the lower of the two announced versions.
  pub fn negotiate(local: ProtocolVersion, remote: ProtocolVersion) -> ProtocolVersion {
    local.min(remote)
  }
}

impl Default for ProtocolVersion {
  fn default() -> Self {
    ProtocolVersion::CURRENT
  }
}
