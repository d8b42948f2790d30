pub mod generate;
pub mod parse;

pub use generate::generate_event;
pub use parse::{extract_uid, parse_events};
