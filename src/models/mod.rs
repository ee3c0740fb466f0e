mod audit;
mod delivery_log;
mod dlq;
mod group;
mod message;
mod provider;
mod routing_rule;
mod user;

pub use audit::*;
pub use delivery_log::*;
pub use dlq::*;
pub use group::*;
pub use message::*;
pub use provider::*;
pub use routing_rule::*;
pub use user::*;
