//! TGP Session Layer
//!
//! Peering sessions between neighbouring gateways:
//! - [`PeerSession`]: `Idle → Connecting → Established → Failed` with OPEN
//!   capability exchange and hold-time liveness.
//! - [`Timers`]: cancellable register/cancel timers driving keepalives.
//! - [`PeerLink`]: framed message links ([`TcpLink`], [`MemoryLink`]).
//! - [`SessionWorker`]: one task per session reporting [`SessionEvent`]s.

pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod timer;
pub mod transport;
pub mod worker;

pub use config::{Backoff, SessionConfig};
pub use error::SessionError;
pub use events::SessionEvent;
pub use session::{PeerIdentity, PeerSession, SessionInput, SessionState};
pub use timer::Timers;
pub use transport::{connect_with_backoff, MemoryLink, PeerLink, TcpLink};
pub use worker::SessionWorker;
