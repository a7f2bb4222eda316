pub mod channel;
pub mod error;
pub mod events;

pub use channel::{SignalingChannel, SubscriptionHandle};
pub use error::{Result, SocketError};
