//! Splitting scripts into independently executable batches.

/// Default batch separator.
pub const DEFAULT_BATCH_SEPARATOR: &str = "GO";

/// Lines starting with this marker never reach the database.
pub const COMMENT_MARKER: &str = "--";

/// Split a script on lines holding only `separator` (case-insensitive).
///
/// Comment lines are dropped and batches left empty are skipped, so a
/// section made only of comments produces nothing.
pub fn split_batches(script: &str, separator: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in script.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(separator) {
            flush(&mut current, &mut batches);
        } else if !trimmed.starts_with(COMMENT_MARKER) {
            current.push(line);
        }
    }
    flush(&mut current, &mut batches);

    batches
}

fn flush(current: &mut Vec<&str>, batches: &mut Vec<String>) {
    let batch = current.join("\n");
    current.clear();

    let batch = batch.trim();
    if !batch.is_empty() {
        batches.push(batch.to_string());
    }
}
