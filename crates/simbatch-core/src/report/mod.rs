pub mod console;
pub mod json;

pub use console::{format_summary, print_summary};
pub use json::write_summary_json;
