//! Clients for the collaborators this service drives: audio nodes and the voice gateway.

/// Voice gateway client (join and leave voice channels).
pub mod gateway;
/// Audio node client (player lifecycle and health checks).
pub mod node;
/// In-memory node client for unit tests.
#[cfg(test)]
pub(crate) mod fake;
