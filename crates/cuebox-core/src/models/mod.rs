//! Plain data shared by the scheduler, the runtime and the front ends.

pub mod command;
pub mod media;
pub mod snapshot;

pub use command::{Command, Input};
pub use media::{Format, MediaFile};
pub use snapshot::{Snapshot, Sounding, ThemeSummary};
