use std::fmt::Write;

/// Indentation-aware text buffer for generated C.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    text: String,
    indent: usize,
    at_line_start: bool,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            indent: 0,
            at_line_start: true,
        }
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn exdent(&mut self) {
        debug_assert!(self.indent > 0);
        self.indent = self.indent.saturating_sub(1);
    }

    fn pad(&mut self) {
        if self.at_line_start {
            for _ in 0..self.indent {
                self.text.push_str("    ");
            }
            self.at_line_start = false;
        }
    }

    pub fn push(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.pad();
        self.text.push_str(s);
    }

    /// Append a full line, indented, with a trailing newline.
    pub fn line(&mut self, s: &str) {
        self.push(s);
        self.newline();
    }

    pub fn line_fmt(&mut self, args: std::fmt::Arguments<'_>) {
        self.pad();
        // Writing into a String cannot fail.
        let _ = self.text.write_fmt(args);
        self.newline();
    }

    pub fn newline(&mut self) {
        self.text.push('\n');
        self.at_line_start = true;
    }

    pub fn append_raw(&mut self, s: &str) {
        self.text.push_str(s);
        self.at_line_start = s.ends_with('\n');
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn finish(self) -> String {
        self.text
    }
}

/// `line_fmt` with `format_args!` inline.
#[macro_export]
macro_rules! cline {
    ($buf:expr, $($arg:tt)*) => {
        $buf.line_fmt(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indentation() {
        let mut b = CodeBuffer::new();
        b.line("void f(void) {");
        b.indent();
        b.line("return;");
        b.exdent();
        b.line("}");
        assert_eq!(b.finish(), "void f(void) {\n    return;\n}\n");
    }

    #[test]
    fn test_cline_macro() {
        let mut b = CodeBuffer::new();
        cline!(b, "int x = {};", 5);
        assert_eq!(b.finish(), "int x = 5;\n");
    }
}
