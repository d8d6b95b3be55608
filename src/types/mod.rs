//! Typed views of QMP wire objects.

mod event;
mod greeting;
mod reply;

pub use event::{Event, Timestamp};
pub use greeting::{CAPABILITY_OOB, Greeting, QmpInfo, QmpVersion, QmpVersionNumber};
pub use reply::ErrorBody;
