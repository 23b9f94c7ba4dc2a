mod auth;
mod bridge;
mod gateway;
mod socket;
mod ticker;

pub use auth::{AuthError, StaticTokenVerifier, TokenVerifier};
pub use bridge::{Bridge, LoopbackHub, RelayBridge};
pub use gateway::{ConnectionId, FanoutGateway};
pub use socket::serve;
pub use ticker::spawn_ticker;
