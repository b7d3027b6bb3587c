pub mod event;

pub use event::{Event, EventDestination, EventDirection, EventFlags, EventPayload, WellKnownFlag};
