pub mod call;
pub mod presence;
pub mod relay;

pub use call::CallService;
pub use presence::{ConnectionHandle, EventSender, PresenceRegistry};
pub use relay::Relay;
