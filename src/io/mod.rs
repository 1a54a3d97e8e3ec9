//! Low-level file helpers and pull sources.

pub mod fsutil;
pub mod source;

pub use fsutil::{copy_file, move_file, read_json, remove_if_exists, write_json_atomic};
pub use source::{Locator, PullSource, open_locator, parse_locator};
