#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionEntry {
    pub offset: u32,
    /// String pool id of the function name.
    pub name: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: u32,
    /// String pool id of the source file name.
    pub file: u32,
    pub line: u32,
}

/// Offset-sorted tables mapping code ranges to function names and source lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub functions: Vec<FunctionEntry>,
    pub lines: Vec<LineEntry>,
}

impl DebugInfo {
    pub fn function_for_offset(&self, offset: usize) -> Option<&FunctionEntry> {
        let index = self
            .functions
            .partition_point(|entry| entry.offset as usize <= offset);
        index.checked_sub(1).map(|index| &self.functions[index])
    }

    pub fn line_for_offset(&self, offset: usize) -> Option<&LineEntry> {
        let index = self
            .lines
            .partition_point(|entry| entry.offset as usize <= offset);
        index.checked_sub(1).map(|index| &self.lines[index])
    }
}

#[derive(Default)]
pub struct DebugInfoBuilder {
    functions: Vec<FunctionEntry>,
    lines: Vec<LineEntry>,
}

impl DebugInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_function(&mut self, offset: u32, name: u32) {
        let entry = FunctionEntry { offset, name };
        match self.functions.last_mut() {
            Some(last) if *last == entry => {}
            Some(last) if last.offset == offset => *last = entry,
            _ => self.functions.push(entry),
        }
    }

    pub fn mark_line(&mut self, offset: u32, file: u32, line: u32) {
        let entry = LineEntry { offset, file, line };
        match self.lines.last_mut() {
            Some(last) if last.file == file && last.line == line => {}
            Some(last) if last.offset == offset => *last = entry,
            _ => self.lines.push(entry),
        }
    }

    pub fn finish(mut self) -> DebugInfo {
        self.functions.sort_by_key(|entry| entry.offset);
        self.lines.sort_by_key(|entry| entry.offset);
        DebugInfo {
            functions: self.functions,
            lines: self.lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_duplicate_lines_collapse() {
        let mut builder = DebugInfoBuilder::new();
        builder.mark_line(0, 0, 1);
        builder.mark_line(4, 0, 1);
        builder.mark_line(8, 0, 2);
        builder.mark_line(8, 0, 3);
        let info = builder.finish();
        assert_eq!(
            info.lines,
            vec![
                LineEntry {
                    offset: 0,
                    file: 0,
                    line: 1
                },
                LineEntry {
                    offset: 8,
                    file: 0,
                    line: 3
                },
            ]
        );
    }

    #[test]
    fn lookup_picks_closest_preceding_entry() {
        let mut builder = DebugInfoBuilder::new();
        builder.mark_function(10, 2);
        builder.mark_function(0, 1);
        builder.mark_line(0, 0, 1);
        builder.mark_line(6, 0, 4);
        let info = builder.finish();

        assert_eq!(info.function_for_offset(3).map(|f| f.name), Some(1));
        assert_eq!(info.function_for_offset(12).map(|f| f.name), Some(2));
        assert_eq!(info.line_for_offset(5).map(|l| l.line), Some(1));
        assert_eq!(info.line_for_offset(6).map(|l| l.line), Some(4));
        assert!(DebugInfo::default().line_for_offset(0).is_none());
    }
}
