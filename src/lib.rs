//! fetchses: drain SES-delivered mail from an object store into a local MTA.

pub mod alert;
pub mod config;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod pipeline;
pub mod relay;
