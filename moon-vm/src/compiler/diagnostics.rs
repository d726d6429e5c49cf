use super::CompileError;

/// Formats a compile error with the offending source line underneath.
pub fn render_source_error(source: &str, err: &CompileError) -> String {
    let line_text = source
        .lines()
        .nth(err.line.saturating_sub(1) as usize)
        .filter(|_| err.line > 0);
    match line_text {
        Some(text) => {
            let indent = text.len() - text.trim_start().len();
            let marked = text.trim().chars().count().max(1);
            format!(
                "error: {}\n --> {}:{}\n  |\n{:>3} | {text}\n  | {}{}",
                err.kind,
                err.file,
                err.line,
                err.line,
                " ".repeat(indent),
                "^".repeat(marked)
            )
        }
        None => format!("error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileErrorKind;

    #[test]
    fn underlines_trimmed_source_line() {
        let err = CompileError::new(
            "demo.moon",
            2,
            CompileErrorKind::UndefinedIdentifier("y".to_string()),
        );
        let text = render_source_error("local x = 1\n  x = y\n", &err);
        assert_eq!(
            text,
            "error: undefined identifier 'y'\n --> demo.moon:2\n  |\n  2 |   x = y\n  |   ^^^^^"
        );
    }

    #[test]
    fn falls_back_without_line() {
        let err = CompileError::new("demo.moon", 0, CompileErrorKind::UnexpectedEof);
        assert_eq!(
            render_source_error("", &err),
            "error: demo.moon(0): unexpected end of file"
        );
    }
}
