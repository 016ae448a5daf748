//! Diagnostic collection and reporting.

use std::fmt;

use crate::source::SourcePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        }
    }
}

/// A single reported condition, pinned to the [`SourcePos`] that produced it.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub pos: SourcePos,
    pub message: String,
}

impl Diagnostic {
    /// Render the provenance trail followed by `: Error: <message>` (or
    /// `: Warning: ...`) on the leaf line.
    pub fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.pos.print(out, 0)?;
        writeln!(out, ": {}: {}", self.severity.label(), self.message)
    }
}

/// Where input filters report lexical problems. Filters treat the sink as
/// opaque; reporting never interrupts reading.
pub trait DiagnosticSink {
    fn warning(&mut self, pos: SourcePos, message: &str);
    fn error(&mut self, pos: SourcePos, message: &str);
}

/// A sink that collects diagnostics for later rendering.
#[derive(Debug, Default)]
pub struct Diagnostics {
    diags: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    /// How many diagnostics are this severe or greater?
    pub fn count_more_severe_than(&self, severity: Severity) -> usize {
        self.diags.iter().filter(|d| d.severity >= severity).count()
    }

    pub fn has_errors(&self) -> bool {
        self.count_more_severe_than(Severity::Error) > 0
    }

    pub fn has_warnings(&self) -> bool {
        self.count_more_severe_than(Severity::Warning) > 0
    }

    pub fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for diag in &self.diags {
            diag.render(out)?;
        }
        Ok(())
    }

    pub fn render_to_string(&self) -> String {
        let mut s = String::new();
        let _ = self.render(&mut s);
        s
    }
}

impl DiagnosticSink for Diagnostics {
    fn warning(&mut self, pos: SourcePos, message: &str) {
        self.diags.push(Diagnostic {
            severity: Severity::Warning,
            pos,
            message: message.to_owned(),
        });
    }

    fn error(&mut self, pos: SourcePos, message: &str) {
        self.diags.push(Diagnostic {
            severity: Severity::Error,
            pos,
            message: message.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;

    #[test]
    fn rendering_appends_the_message_to_the_leaf_frame() {
        let mut diags = Diagnostics::new();
        let pos = SourcePos::new(None, Source::top_level_file("k.s"), 3, 9);
        diags.error(pos.clone(), "unknown instruction");
        diags.warning(pos, "value truncated");

        insta::assert_snapshot!(diags.render_to_string(), @r"
        k.s:3:9: Error: unknown instruction
        k.s:3:9: Warning: value truncated
        ");
        assert!(diags.has_errors());
        assert_eq!(diags.count_more_severe_than(Severity::Error), 1);
        assert_eq!(diags.count_more_severe_than(Severity::Warning), 2);
    }
}
