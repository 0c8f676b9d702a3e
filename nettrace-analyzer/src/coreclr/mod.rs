//! Well-known CoreCLR event payloads and the provider/event-id dispatcher
//! that recognizes them inside an event stream.

pub mod events;
pub mod eventpipe;

pub use events::{
    CoreClrEvent, GcAllocationKind, GcAllocationTickEvent, MethodJittingStartedEvent,
    MethodLoadUnloadEvent,
};
pub use eventpipe::{classify_event, decode_event, DecodedEvent, KnownEvent};
