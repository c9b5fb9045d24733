pub mod envelope;
pub mod push_event;

pub use envelope::{CorrelationId, Envelope, StreamEventKind};
pub use push_event::PushEvent;
