//! vasio: registry-mediated discovery, pub/sub and RPC routing, and
//! virtual-time synchronization for distributed simulation participants.

pub mod config;
pub mod discovery;
pub mod error;
pub mod orchestration;
pub mod participant;
pub mod pubsub;
pub mod registry;
pub mod rpc;
pub mod structure;
pub mod timesync;
pub mod transport;
pub mod wire;

pub use error::{CodecError, VasioError, VasioResult};
pub use participant::{Participant, ParticipantHandle, SharedParticipant};
pub use structure::{Endpoint, ParticipantState, ParticipantStatus, ServiceDescriptor, SystemState};
