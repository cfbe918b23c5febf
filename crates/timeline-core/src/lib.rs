// timeline-core: time periods, timed storage, and the timeline synchronizer.
//
// The synchronizer walks sync requests across a source timeline in
// fixed-size chunks and uploads whatever the destination timeline does not
// already hold.  Everything stateful lives inside one actor task; callers
// talk to it through a handle.

pub mod period;
pub mod storage;
pub mod sync;

pub use agent_proto::time::{self, Time};
pub use period::Period;
pub use storage::{CancelProbe, DataState, Item, TimelineSink, TimelineSource, VfsStorage};
pub use sync::{SyncConfig, SyncRequest, SyncRequestStatus, SyncStatusReport, Synchronizer};
