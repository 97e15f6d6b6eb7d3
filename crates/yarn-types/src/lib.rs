//! Core twtxt types shared by every yarn crate: the feed lexer and parser,
//! the twt model with its content hash, formatting, and pod configuration.

pub mod config;
pub mod error;
pub mod format;
pub mod lextwt;
pub mod twt;
pub mod urls;

pub use config::Config;
pub use error::ParseError;
pub use format::{FmtOpts, Format};
pub use lextwt::{FeedFile, parse_file, parse_line, parse_text};
pub use twt::{FeedLookup, SplitTwts, Twt, Twter, sort_twts, split_twts};

/// Software name advertised in user agents and `/info`.
pub const SOFTWARE: &str = "yarnd";

/// Crate version, shared by every workspace member.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
