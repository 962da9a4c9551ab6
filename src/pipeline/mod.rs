//! Inbound mail pipeline.
//!
//! Every object under the new-mail prefix flows through:
//! 1. `Mailbox::get()`: fetch and decrypt
//! 2. `HeaderExtractor::extract()`: envelope sender, recipients, virus verdict
//! 3. `DeliveryRelay`: submit to the local MTA or quarantine to disk
//! 4. `Disposition::decide()`: delete the source or keep it

pub mod headers;
pub mod processor;
pub mod types;

pub use headers::{ExtractedHeaders, HeaderExtractor, VirusVerdict};
pub use processor::{Pipeline, PipelineSettings};
pub use types::{Disposition, MessageReport, MessageState, PassReport, Selection};
