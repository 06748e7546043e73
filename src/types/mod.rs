pub mod event;
pub mod group;

pub use event::{Event, EventId};
pub use group::{ConsumerIdentity, ConsumerInfo, GroupCreation, PendingEntry, StartPosition};
