//! skywatch - the central arbiter of the Skywatch control plane
//!
//! Every device daemon and operator client registers with this process. It
//! is deliberately thin: domain commands travel peer-to-peer on separate
//! connections, and the arbiter is consulted only for what must be global —
//! who holds priority, the aggregated BOP word, the observatory state
//! machine, authentication, and the `status_info` scatter/gather.

pub mod arbiter;
pub mod ephem;
pub mod server;
pub mod telemetry;

pub use arbiter::Arbiter;
pub use server::Server;
