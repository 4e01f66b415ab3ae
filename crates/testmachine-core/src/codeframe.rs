//! Source excerpts for failure reports.

const LINES_ABOVE: usize = 2;
const LINES_BELOW: usize = 3;

/// 1-based position inside a source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    #[must_use]
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Render the lines around `location` with a marker on the failing line and
/// a caret under the failing column.
///
/// Returns an empty string when the line is outside the source.
#[must_use]
pub fn code_frame(source: &str, location: Location) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if location.line == 0 || location.line > lines.len() {
        return String::new();
    }

    let start = location.line.saturating_sub(LINES_ABOVE).max(1);
    let end = (location.line + LINES_BELOW).min(lines.len());
    let gutter = end.to_string().len();

    let mut out = Vec::with_capacity(end - start + 2);
    for number in start..=end {
        let text = lines[number - 1];
        let marker = if number == location.line { '>' } else { ' ' };
        let sep = if text.is_empty() { " |" } else { " | " };
        out.push(format!("{marker} {number:>gutter$}{sep}{text}"));

        if number == location.line && location.column > 0 {
            let padding: String = text
                .chars()
                .take(location.column - 1)
                .map(|c| if c == '\t' { '\t' } else { ' ' })
                .collect();
            out.push(format!("  {:>gutter$} | {padding}^", ""));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "const a = 1;\nconst b = 2;\nthrow new Error('x');\nconst c = 3;\n";

    #[test]
    fn test_frame_marks_line_and_column() {
        let frame = code_frame(SOURCE, Location::new(3, 7));
        let expected = [
            "  1 | const a = 1;",
            "  2 | const b = 2;",
            "> 3 | throw new Error('x');",
            "    |       ^",
            "  4 | const c = 3;",
        ]
        .join("\n");
        assert_eq!(frame, expected);
    }

    #[test]
    fn test_frame_without_column() {
        let frame = code_frame(SOURCE, Location::new(1, 0));
        assert!(frame.starts_with("> 1 | const a = 1;"));
        assert!(!frame.contains('^'));
    }

    #[test]
    fn test_frame_out_of_range() {
        assert_eq!(code_frame(SOURCE, Location::new(42, 1)), "");
        assert_eq!(code_frame("", Location::new(1, 1)), "");
    }
}
