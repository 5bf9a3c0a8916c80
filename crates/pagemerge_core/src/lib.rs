pub mod anchor;
pub mod attachments;
pub mod client;
pub mod comments;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod markup;
pub mod matcher;
pub mod merge;
pub mod pipeline;
pub mod publish;
pub mod textindex;
