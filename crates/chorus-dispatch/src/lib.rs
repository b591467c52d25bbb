//! Batch dispatch for Chorus.
//!
//! A [`Dispatcher`] sends one prompt to every configured provider adapter at
//! once, supervises each call independently, and appends one
//! [`ResultRecord`] per outcome to a [`ResultSink`]. Prompts come from a
//! [`PromptSource`]; progress is broadcast as [`DispatchEvent`]s.

pub mod dispatcher;
pub mod events;
pub mod prompt;
pub mod sink;

pub use chorus_types::ResultRecord;
pub use dispatcher::{BatchReport, Dispatcher, SinkFailure};
pub use events::{DispatchEvent, EventEmitter, InvocationState};
pub use prompt::{Category, CategoryCatalog, PromptSource, TopicPromptSource};
pub use sink::{JsonlSink, MemorySink, RecordFilter, ResultSink};
