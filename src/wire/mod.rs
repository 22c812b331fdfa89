//! Binary wire protocol: framing, elementary codec, protocol version
//! negotiation and the concrete message catalogue.

pub mod buffer;
pub mod messages;
pub mod protocol_version;
pub mod ring_buffer;

pub use buffer::{ReadCursorGuard, WireReader, WireWriter};
pub use messages::{Message, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use protocol_version::ProtocolVersion;
pub use ring_buffer::{BackpressurePolicy, RingBuffer};
