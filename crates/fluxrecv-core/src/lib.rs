pub mod change;
pub mod error;
pub mod notification;

pub use change::{branch_name, translate, Change, ChangeKind, GitUpdate, BRANCH_REF_PREFIX};
pub use error::CoreError;
pub use notification::{Notification, RefUpdate, RefUpdateEvent, UpdateType};
