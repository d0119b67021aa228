//! Bounded console log collector

/// Marker appended once when the log budget is exhausted
pub const TRUNCATION_MARKER: &str = "[logs truncated]";

/// Collects `console.*` lines in order up to a byte budget
///
/// The first line that does not fit is dropped along with every later one,
/// and [`TRUNCATION_MARKER`] is appended exactly once.
#[derive(Debug, Clone)]
pub struct LogCollector {
    buffer: String,
    max_bytes: usize,
    truncated: bool,
}

impl LogCollector {
    /// Create a collector with a byte budget
    pub fn new(max_bytes: usize) -> Self {
        LogCollector {
            buffer: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    /// Append a line
    pub fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }

        let separator = usize::from(!self.buffer.is_empty());
        if self.buffer.len() + separator + line.len() > self.max_bytes {
            self.truncated = true;
            if separator == 1 {
                self.buffer.push('\n');
            }
            self.buffer.push_str(TRUNCATION_MARKER);
            return;
        }

        if separator == 1 {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
    }

    /// Whether lines were dropped
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Collected output, lines separated by `\n`
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Consume the collector
    pub fn into_string(self) -> String {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_in_order() {
        let mut logs = LogCollector::new(1024);
        logs.push("first");
        logs.push("second");
        assert_eq!(logs.as_str(), "first\nsecond");
        assert!(!logs.is_truncated());
    }

    #[test]
    fn test_truncation_marker_once() {
        let mut logs = LogCollector::new(12);
        logs.push("12345");
        logs.push("67890");
        logs.push("this does not fit");
        logs.push("x");
        logs.push("y");

        assert_eq!(logs.as_str(), "12345\n67890\n[logs truncated]");
        assert!(logs.is_truncated());
        assert_eq!(logs.as_str().matches(TRUNCATION_MARKER).count(), 1);
    }

    #[test]
    fn test_first_line_too_large() {
        let mut logs = LogCollector::new(4);
        logs.push("too long");
        logs.push("ok");
        assert_eq!(logs.into_string(), TRUNCATION_MARKER);
    }
}
