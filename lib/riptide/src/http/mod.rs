pub mod parse;
pub mod serve;

pub use parse::{HttpMessage, MAX_HEADERS, MAX_QUERY_VAR};
pub use serve::{status_text, ServeOpts};
