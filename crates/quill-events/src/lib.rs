//! Typed stream events and the wire codec for the generation event stream.
mod stream_event;
mod stream_frame_codec;

pub use stream_event::{JobId, StreamEvent, StreamEventKind};
pub use stream_frame_codec::{decode_stream_frame, StreamFrame, StreamFrameAssembler};
