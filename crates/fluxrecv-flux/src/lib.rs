pub mod error;
pub mod forwarder;
pub mod http_client;
pub mod notifier;

pub use error::{FluxError, ForwardError};
pub use forwarder::{Forwarder, DEFAULT_SYNC_TIMEOUT};
pub use http_client::{FluxApiClient, DEFAULT_API_BASE};
pub use notifier::ChangeNotifier;
