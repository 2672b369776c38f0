//! Tab-separated tables as the pipeline tools write them.

use csv::{Reader, ReaderBuilder, Trim};

/// Last line of a complete table; anything after it is ignored.
pub const DONE_MARKER: &str = "**done**";

/// A reader over the rows before the `**done**` trailer. The first row is
/// the header. Fields are trimmed and never quoted.
pub fn reader(content: &str) -> Reader<&[u8]> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .quoting(false)
        .trim(Trim::All)
        .from_reader(body(content).as_bytes())
}

fn body(content: &str) -> &str {
    if content.starts_with(DONE_MARKER) {
        return "";
    }
    match content.find(&format!("\n{DONE_MARKER}")) {
        Some(end) => &content[..=end],
        None => content,
    }
}

/// 1-based line a read error points at, or 0 when the reader did not say.
pub fn error_line(err: &csv::Error) -> usize {
    err.position().map_or(0, |pos| pos.line() as usize)
}
