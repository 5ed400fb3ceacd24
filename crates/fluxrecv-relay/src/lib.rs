pub mod dispatch;
pub mod error;
pub mod relay;

pub use dispatch::{DispatchLoop, DispatchState, DispatchStats, Disposition};
pub use error::{DispatchError, RelayError};
pub use relay::{Relay, DEFAULT_HANDOFF_CAPACITY};
