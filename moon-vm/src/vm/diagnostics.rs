use super::VmError;

pub fn render_vm_error(err: &VmError, source: Option<&str>) -> String {
    let mut out = format!("runtime error: {err}");
    if let Some(line) = err.line
        && let Some(line_text) = source.and_then(|source| {
            source
                .lines()
                .nth(line.saturating_sub(1) as usize)
                .map(str::to_string)
        })
    {
        out.push_str(&format!("\n{line:>3} | {line_text}\n    | ^"));
    }
    out
}
