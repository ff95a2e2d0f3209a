//! Keeping the configuration cache in sync with an external store.
pub mod diff;
pub mod event;
pub mod synchronizer;

pub use diff::diff_dumps;
pub use event::{ChangeEvent, EntityKind, EntityPath, EventType, StoreNotification, DEFAULT_ROOT};
pub use synchronizer::{ConfigSynchronizer, SyncHandle, apply_event, full_load};
