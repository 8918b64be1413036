//! External writer: the JSON protocol, the one-shot server that answers it, and the
//! gateway that locates and invokes a writer process.

pub mod gateway;
pub mod protocol;
pub mod resolve;
pub mod server;

pub use gateway::BridgeGateway;
pub use protocol::{BridgeErrorBody, BridgeRequest, BridgeResponse};
pub use resolve::{resolve_candidates, BridgeCandidate, CandidateKind, Resolution};
