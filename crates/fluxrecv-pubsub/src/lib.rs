pub mod adc;
pub mod auth;
pub mod error;
pub mod handoff;
pub mod http_client;
mod lease;
pub mod memory;
pub mod message;
pub mod names;
pub mod subscription;
pub mod transport;

pub use error::{Code, PubsubError};
pub use handoff::{handoff, HandoffReceiver, HandoffSender, Rejected};
pub use message::Message;
pub use names::{SubscriptionName, TopicName};
pub use subscription::{ReceiveSettings, Subscription, SubscriptionManager};
pub use transport::{PullTransport, ReceivedMessage, SubscriptionConfig};
