use crate::types::{to_index, ChangeRecord, ChangeType};

/// Orders a file's changes by `start_line`, highest first.
///
/// The sort is stable: records sharing a `start_line` keep their submission
/// order.
pub fn sort_descending(changes: &mut [ChangeRecord]) {
    changes.sort_by(|left, right| right.start_line.cmp(&left.start_line));
}

/// Number of lines an untracked file needs so every change lands in range.
pub fn required_len(changes: &[ChangeRecord]) -> usize {
    changes.iter().map(ChangeRecord::reach).max().unwrap_or(0)
}

/// Applies `changes` to `lines` and returns the resulting buffer.
///
/// `changes` must already be validated and sorted with
/// [`sort_descending`]; applying the highest ranges first keeps every
/// pending lower range at its submitted offset. Out-of-range positions are
/// clamped to the buffer length.
pub fn apply_line_changes(lines: &[String], changes: &[ChangeRecord]) -> Vec<String> {
    apply_line_changes_with(lines.to_vec(), changes, |_, _, text| text.clone())
}

/// [`apply_line_changes`] over arbitrary line values.
///
/// `make(change, line, text)` builds the value spliced in for
/// `changes[change].new_lines[line]`, so callers can tell which record each
/// line of the result came from.
pub fn apply_line_changes_with<T, F>(
    mut lines: Vec<T>,
    changes: &[ChangeRecord],
    mut make: F,
) -> Vec<T>
where
    F: FnMut(usize, usize, &String) -> T,
{
    for (index, change) in changes.iter().enumerate() {
        let len = lines.len();
        let start = to_index(change.start_line).min(len);
        let end = match change.change_type {
            ChangeType::Insert => start,
            ChangeType::Remove | ChangeType::Update => to_index(change.end_line).clamp(start, len),
        };
        let added: &[String] = match change.change_type {
            ChangeType::Remove => &[],
            ChangeType::Insert | ChangeType::Update => &change.new_lines,
        };
        let replacement = added.iter().enumerate().map(|(line, text)| make(index, line, text));
        lines.splice(start..end, replacement);
    }
    lines
}
