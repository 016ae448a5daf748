//! The source-position graph.
//!
//! Every logical line the assembler consumes can be traced back to a chain of
//! include → macro-substitution → repetition frames. The nodes of that chain
//! are immutable and reference-shared: a diagnostic captured deep inside a
//! macro expansion stays printable long after the filter that produced it is
//! gone. Children only ever point at strictly older nodes, so the graph is a
//! DAG and plain reference counting is enough.

use std::{fmt, rc::Rc};

use crate::text::Text;

/// A shared handle to a [`Source`] node.
pub type SourceRef = Rc<Source>;

/// A shared handle to a [`MacroSubst`] frame.
pub type MacroSubstRef = Rc<MacroSubst>;

/// Where a stretch of input text came from.
#[derive(Debug)]
pub enum Source {
    /// A text file. The top-level source and stdin are files too; stdin is a
    /// file with an empty path.
    File(FileSource),
    /// Lines that come from the body of a macro.
    Macro(MacroSource),
    /// A single pass of a repeated block.
    Repeat(RepeatSource),
}

#[derive(Debug)]
pub struct FileSource {
    /// The source that included this file, `None` for the top-level source.
    pub parent: Option<SourceRef>,
    /// Line of the include directive in the parent.
    pub line_no: u64,
    /// Column of the include directive in the parent.
    pub col_no: u64,
    /// Path as written; empty for stdin.
    pub path: Text,
}

#[derive(Debug)]
pub struct MacroSource {
    /// The invocation that substituted the macro body.
    pub substituted_at: MacroSubstRef,
    /// The source of the macro content itself.
    pub source: SourceRef,
}

#[derive(Debug)]
pub struct RepeatSource {
    pub inner: SourceRef,
    /// 0-based iteration ordinal.
    pub iteration: u64,
    pub total: u64,
}

impl Source {
    /// The top-level source: a file with no parent.
    pub fn top_level_file(path: impl Into<Text>) -> SourceRef {
        Rc::new(Source::File(FileSource {
            parent: None,
            line_no: 0,
            col_no: 0,
            path: path.into(),
        }))
    }

    /// The standard input pseudo-file.
    pub fn stdin() -> SourceRef {
        Source::top_level_file("")
    }

    /// A file included at `pos`. When the include happens inside a macro
    /// expansion the parent is wrapped in a [`Source::Macro`] node so the
    /// trail keeps the invocation stack.
    pub fn file_included_at(pos: &SourcePos, path: impl Into<Text>) -> SourceRef {
        let parent = match &pos.macro_subst {
            None => pos.source.clone(),
            Some(subst) => Source::macro_content(subst.clone(), pos.source.clone()),
        };
        Rc::new(Source::File(FileSource {
            parent: Some(parent),
            line_no: pos.line_no,
            col_no: pos.col_no,
            path: path.into(),
        }))
    }

    /// Marks `source` as being macro content substituted at `substituted_at`.
    pub fn macro_content(substituted_at: MacroSubstRef, source: SourceRef) -> SourceRef {
        Rc::new(Source::Macro(MacroSource {
            substituted_at,
            source,
        }))
    }

    /// A single pass of a repetition over `inner`.
    pub fn repetition(inner: SourceRef, iteration: u64, total: u64) -> SourceRef {
        Rc::new(Source::Repeat(RepeatSource {
            inner,
            iteration,
            total,
        }))
    }
}

/// One frame of the macro-invocation stack: which source invoked the macro,
/// and where.
#[derive(Debug)]
pub struct MacroSubst {
    pub parent: Option<MacroSubstRef>,
    pub source: SourceRef,
    pub line_no: u64,
    pub col_no: u64,
}

impl MacroSubst {
    pub fn new(pos: &SourcePos) -> MacroSubstRef {
        Rc::new(MacroSubst {
            parent: pos.macro_subst.clone(),
            source: pos.source.clone(),
            line_no: pos.line_no,
            col_no: pos.col_no,
        })
    }
}

/// A resolved `(line, column)` pair in some original source. Both are
/// 1-based; a column of 0 means "unknown" and is omitted when printing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCol {
    pub line_no: u64,
    pub col_no: u64,
}

/// One entry of a per-logical-line column translation table.
///
/// `position` is the 0-based offset in the produced logical line where the
/// original line `line_no` starts contributing characters. The entry at index
/// 0 may carry a negative position: statement splitting at `;` leaves earlier
/// bytes of the physical line behind, and the negative offset accounts for
/// them so columns keep resolving into the physical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTrans {
    pub position: isize,
    pub line_no: u64,
}

/// Resolve a 0-based byte offset in a logical line back to the original
/// `(line, column)` through its translation table.
///
/// The table is sorted by `position`; the match is the greatest entry with
/// `position <= offset`.
pub fn translate_pos(col_trans: &[LineTrans], position: usize) -> LineCol {
    debug_assert!(!col_trans.is_empty());
    let idx = col_trans.partition_point(|t| t.position <= position as isize);
    let entry = col_trans[idx.saturating_sub(1)];
    LineCol {
        line_no: entry.line_no,
        col_no: (position as isize - entry.position + 1) as u64,
    }
}

/// A complete origin: the macro-invocation stack, the source node, the
/// resolved line/column, and optionally the position of an expression whose
/// (deferred) evaluation raised the diagnostic.
#[derive(Debug, Clone)]
pub struct SourcePos {
    pub macro_subst: Option<MacroSubstRef>,
    pub source: SourceRef,
    pub line_no: u64,
    pub col_no: u64,
    pub expr_from: Option<Box<SourcePos>>,
}

impl SourcePos {
    pub fn new(
        macro_subst: Option<MacroSubstRef>,
        source: SourceRef,
        line_no: u64,
        col_no: u64,
    ) -> Self {
        SourcePos {
            macro_subst,
            source,
            line_no,
            col_no,
            expr_from: None,
        }
    }

    /// Render the full provenance trail. The leaf `path:line[:col]` frame is
    /// printed without a trailing newline so the caller can append the
    /// diagnostic message on the same line.
    pub fn print(&self, out: &mut dyn fmt::Write, indent_level: u32) -> fmt::Result {
        if indent_level == MAX_INDENT {
            print_indent(out, indent_level)?;
            out.write_str("Can't print all tree trace due to too big depth level\n")?;
            return Ok(());
        }

        self.print_expr_chain(out, indent_level)?;
        self.print_macro_chain(out, indent_level)?;
        self.print_source_chain(out, indent_level)
    }

    /// Convenience used by the diagnostics renderer and tests.
    pub fn to_trail_string(&self) -> String {
        let mut s = String::new();
        // writing into a String cannot fail
        let _ = self.print(&mut s, 0);
        s
    }

    fn print_expr_chain(&self, out: &mut dyn fmt::Write, indent_level: u32) -> fmt::Result {
        let mut this_pos = self;
        let mut first_depth = true;
        while let Some(expr) = this_pos.expr_from.as_deref() {
            print_indent(out, indent_level)?;
            if let Source::File(file) = &*expr.source {
                if file.parent.is_none() {
                    out.write_str(if first_depth {
                        "Expression evaluation from "
                    } else {
                        "                      from "
                    })?;
                    write_file_name(out, &file.path)?;
                    write!(out, ":{}", expr.line_no)?;
                    if expr.col_no != 0 {
                        write!(out, ":{}:", expr.col_no)?;
                    }
                    out.write_str("\n")?;
                    first_depth = false;
                    this_pos = expr;
                    continue;
                }
            }
            first_depth = true;
            out.write_str("Expression evaluation from\n")?;
            let mut nested = expr.clone();
            nested.expr_from = None;
            nested.print(out, indent_level + 1)?;
            out.write_str("\n")?;
            this_pos = expr;
        }
        Ok(())
    }

    fn print_macro_chain(&self, out: &mut dyn fmt::Write, indent_level: u32) -> fmt::Result {
        let mut cur_macro = self.macro_subst.clone();
        let mut first_depth = true;
        while let Some(m) = cur_macro {
            let parent_macro = m.parent.clone();
            let trailer: &str = if parent_macro.is_some() { ";\n" } else { ":\n" };

            match &*m.source {
                Source::Macro(ms) => {
                    print_indent(out, indent_level)?;
                    out.write_str("In macro substituted from macro content:\n")?;
                    let macro_pos = SourcePos::new(
                        Some(ms.substituted_at.clone()),
                        ms.source.clone(),
                        m.line_no,
                        m.col_no,
                    );
                    macro_pos.print(out, indent_level + 1)?;
                    out.write_str(trailer)?;
                    first_depth = true;
                }
                Source::File(file) if file.parent.is_none() => {
                    print_indent(out, indent_level)?;
                    out.write_str(if first_depth {
                        "In macro substituted from "
                    } else {
                        "                     from "
                    })?;
                    write_file_name(out, &file.path)?;
                    write!(out, ":{}:{}", m.line_no, m.col_no)?;
                    out.write_str(trailer)?;
                    first_depth = false;
                }
                // invocation site sits in an included file or a repetition:
                // print it as a nested trail
                _ => {
                    if first_depth {
                        print_indent(out, indent_level)?;
                        out.write_str("In macro substituted from\n")?;
                    }
                    let next_pos = SourcePos::new(None, m.source.clone(), m.line_no, m.col_no);
                    next_pos.print(out, indent_level + 1)?;
                    out.write_str(trailer)?;
                    first_depth = true;
                }
            }

            cur_macro = parent_macro;
        }
        Ok(())
    }

    fn print_source_chain(&self, out: &mut dyn fmt::Write, indent_level: u32) -> fmt::Result {
        let mut cur_source = self.source.clone();
        loop {
            let next = match &*cur_source {
                Source::Repeat(rep) => rep.inner.clone(),
                _ => break,
            };
            cur_source = next;
        }

        match &*cur_source {
            Source::Macro(ms) => {
                print_repeats(out, self.source.clone(), indent_level)?;
                print_indent(out, indent_level)?;
                out.write_str("In macro content:\n")?;
                let macro_pos = SourcePos::new(
                    Some(ms.substituted_at.clone()),
                    ms.source.clone(),
                    self.line_no,
                    self.col_no,
                );
                macro_pos.print(out, indent_level + 1)
            }
            Source::File(leaf) => {
                if leaf.parent.is_some() {
                    self.print_include_chain(out, &cur_source, indent_level)?;
                }
                print_repeats(out, self.source.clone(), indent_level)?;
                print_indent(out, indent_level)?;
                write_file_name(out, &leaf.path)?;
                write!(out, ":{}", self.line_no)?;
                if self.col_no != 0 {
                    write!(out, ":{}", self.col_no)?;
                }
                Ok(())
            }
            Source::Repeat(_) => unreachable!("repetitions were unwrapped above"),
        }
    }

    fn print_include_chain(
        &self,
        out: &mut dyn fmt::Write,
        start: &SourceRef,
        indent_level: u32,
    ) -> fmt::Result {
        let mut cur_file = start.clone();
        let mut first_depth = true;
        loop {
            let (parent, inc_line, inc_col) = match &*cur_file {
                Source::File(f) => match &f.parent {
                    Some(p) => (p.clone(), f.line_no, f.col_no),
                    None => break,
                },
                _ => break,
            };

            let parent_unwrapped = print_repeats(out, parent.clone(), indent_level)?;
            if !first_depth {
                // repetition frames interrupt the "from" continuation
                first_depth = !Rc::ptr_eq(&parent, &parent_unwrapped);
            }

            print_indent(out, indent_level)?;
            match &*parent_unwrapped {
                Source::Macro(ms) => {
                    out.write_str("In file included from macro content:\n")?;
                    let macro_pos = SourcePos::new(
                        Some(ms.substituted_at.clone()),
                        ms.source.clone(),
                        inc_line,
                        inc_col,
                    );
                    macro_pos.print(out, indent_level + 1)?;
                    out.write_str(":\n")?;
                    break;
                }
                Source::File(pf) => {
                    out.write_str(if first_depth {
                        "In file included from "
                    } else {
                        "                 from "
                    })?;
                    write_file_name(out, &pf.path)?;
                    write!(out, ":{}:{}", inc_line, inc_col)?;
                    out.write_str(if pf.parent.is_some() { ",\n" } else { ":\n" })?;
                    first_depth = false;
                    cur_file = parent_unwrapped.clone();
                }
                Source::Repeat(_) => unreachable!("repetitions were unwrapped above"),
            }
        }
        Ok(())
    }
}

const MAX_INDENT: u32 = 10;

fn print_indent(out: &mut dyn fmt::Write, indent_level: u32) -> fmt::Result {
    for _ in 0..indent_level {
        out.write_str("    ")?;
    }
    Ok(())
}

fn write_file_name(out: &mut dyn fmt::Write, path: &Text) -> fmt::Result {
    if path.is_empty() {
        out.write_str("<stdin>")
    } else {
        out.write_str(path.as_str())
    }
}

/// Print the repetition frames wrapped around `source`, returning the first
/// non-repetition node.
fn print_repeats(
    out: &mut dyn fmt::Write,
    source: SourceRef,
    indent_level: u32,
) -> Result<SourceRef, fmt::Error> {
    let mut cur = source;
    let mut first_depth = true;
    loop {
        let next = match &*cur {
            Source::Repeat(rep) => {
                print_indent(out, indent_level)?;
                out.write_str(if first_depth {
                    "In repetition "
                } else {
                    "              "
                })?;
                writeln!(out, "{}/{}:", rep.iteration + 1, rep.total)?;
                rep.inner.clone()
            }
            _ => break,
        };
        cur = next;
        first_depth = false;
    }
    Ok(cur)
}
