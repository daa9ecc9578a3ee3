//! Incremental text deltas for streaming decoded output.

/// Computes the suffix of `current` that differs from `previous`.
pub fn extract_delta(previous: &str, current: &str) -> String {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest.to_owned();
    }

    let prefix_bytes: usize = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    current[prefix_bytes..].to_owned()
}

/// Remembers what has been emitted so each decode step yields only new text.
#[derive(Debug, Default, Clone)]
pub struct DeltaTracker {
    previous: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text to emit for the latest full decode.
    ///
    /// Until `is_final`, anything from the first `U+FFFD` onwards is held back: a multi-byte
    /// character split across tokens decodes as a replacement character until its tail arrives.
    pub fn advance(&mut self, current: &str, is_final: bool) -> String {
        let mut delta = extract_delta(&self.previous, current);
        if delta.is_empty() {
            self.previous = current.to_owned();
            return delta;
        }

        if !is_final {
            if let Some(idx) = delta.find(char::REPLACEMENT_CHARACTER) {
                delta.truncate(idx);
                self.previous.push_str(&delta);
                return delta;
            }
        }

        self.previous = current.to_owned();
        delta
    }

    pub fn snapshot(&self) -> &str {
        &self.previous
    }
}
