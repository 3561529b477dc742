//! Streaming company search.
//!
//! The search endpoints answer with an event stream of JSON frames tagged by
//! `type`. A [`StreamConsumer`] opens the stream, feeds each frame through a
//! [`SearchVariant`] reducer and reports to a [`SearchObserver`]:
//!
//! - `on_progress` for every non-terminal frame, in arrival order
//! - exactly one of `on_complete` (on `final_summary`) or `on_error` (server
//!   error frame, malformed frame, transport failure, or timeout)
//!
//! The consumer closes the stream itself once the search settles. A reader
//! blocked on a quiet server notices on its next bounded read.
//!
//! # Module structure
//! - `sse` - event-stream line framing
//! - `event` - shared frame types and terminal classification
//! - `consumer` - the state machine and the threads driving it
//! - `broad`, `direct` - the two search variants
//! - `transport` - HTTP push channel

mod broad;
mod consumer;
mod direct;
mod error;
mod event;
pub mod sse;
mod transport;

pub use broad::{AccumulatedResult, BroadSearch, BroadUpdate, TableNote, TableProgress, TableResult};
pub use consumer::{
    Callbacks, CancelHandle, Completed, Phase, SearchHandle, SearchObserver, SearchVariant,
    Session, Settlement, StreamConsumer,
};
pub use direct::{AwardeeSummary, CigDetail, CigMiss, CigProgress, DirectSearch, DirectUpdate};
pub use error::{ErrorKind, StreamError};
pub use event::{FinalSummary, Frame, Record, SearchRequest, decode_frame};
pub use transport::{HttpTransport, Transport, stream_url};
