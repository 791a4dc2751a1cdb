pub mod hub;
pub mod session;

pub use hub::{Hub, Payload, Subscription};
pub use session::{Authenticator, CloseReason, SessionConfig, SessionContext, TopicAccess};
