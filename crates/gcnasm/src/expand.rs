//! Driving the input-filter stack.
//!
//! The [`LineExpander`] owns a stack of input filters and understands the
//! structural directives that shape the stream: `.include` pushes a nested
//! stream filter, `.macro`/`.endm` records a definition, invoking a defined
//! macro pushes an expansion filter, and `.rept`/`.irp`/`.irpc`/`.endr`
//! record and replay repetition bodies. Everything else is handed through as
//! a fully expanded logical line; parsing those lines (mnemonics, symbols,
//! expressions) is the assembler's business, not ours.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{
    diagnostics::DiagnosticSink,
    input::{FilterKind, InputError, InputFilter, StreamInputFilter},
    macros::{
        IrpDef, IrpInputFilter, MacroArg, MacroArgMap, MacroDef, MacroInputFilter, RepeatDef,
        RepeatInputFilter, extract_sym_name,
    },
    source::{LineTrans, SourcePos},
};

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Expands includes, macros, and repetitions into a stream of logical lines.
pub struct LineExpander {
    filters: Vec<Box<dyn InputFilter>>,
    macros: HashMap<String, Rc<MacroDef>>,
    macro_count: u64,
    include_dirs: Vec<PathBuf>,
    recording: Option<Recording>,
}

struct Recording {
    kind: RecordingKind,
    nesting: u32,
}

enum RecordingKind {
    Macro { name: String, def: MacroDef },
    Rept(RepeatDef),
    Irp(IrpDef),
}

impl LineExpander {
    /// Expand the given top-level file.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<LineExpander, ExpandError> {
        let filter = StreamInputFilter::open(path.as_ref())?;
        let mut expander = LineExpander::with_filter(Box::new(filter));
        if let Some(dir) = path.as_ref().parent() {
            expander.include_dirs.push(dir.to_path_buf());
        }
        Ok(expander)
    }

    /// Expand an arbitrary stream; an empty name displays as `<stdin>`.
    pub fn from_stream(stream: impl io::Read + 'static, name: &str) -> LineExpander {
        LineExpander::with_filter(Box::new(StreamInputFilter::from_stream(stream, name)))
    }

    /// Expand in-memory source text.
    pub fn from_str(src: &str, name: &str) -> LineExpander {
        LineExpander::from_stream(io::Cursor::new(src.as_bytes().to_vec()), name)
    }

    fn with_filter(filter: Box<dyn InputFilter>) -> LineExpander {
        LineExpander {
            filters: vec![filter],
            macros: HashMap::new(),
            macro_count: 0,
            include_dirs: Vec::new(),
            recording: None,
        }
    }

    /// Add a directory searched by `.include`.
    pub fn add_include_dir(&mut self, dir: impl Into<PathBuf>) {
        self.include_dirs.push(dir.into());
    }

    /// The next fully expanded logical line, or `None` once all input is
    /// exhausted.
    pub fn read_line(
        &mut self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<String>, ExpandError> {
        loop {
            let Some(filter) = self.filters.last_mut() else {
                if let Some(rec) = self.recording.take() {
                    let (what, pos) = match rec.kind {
                        RecordingKind::Macro { def, .. } => ("macro", def.pos().clone()),
                        RecordingKind::Rept(def) => ("repetition", def.pos().clone()),
                        RecordingKind::Irp(def) => ("repetition", def.pos().clone()),
                    };
                    sink.error(pos, &format!("Unterminated {what} definition"));
                }
                return Ok(None);
            };

            let line = match filter.read_line(sink)? {
                Some((line, trans)) => Some((line.to_vec(), trans.to_vec())),
                None => None,
            };
            let Some((bytes, col_trans)) = line else {
                self.filters.pop();
                continue;
            };

            if self.recording.is_some() {
                self.record_line(&bytes, &col_trans);
                continue;
            }

            let text = String::from_utf8_lossy(&bytes).into_owned();
            let Some((word_start, word)) = first_word(&text) else {
                return Ok(Some(text));
            };
            let rest = &text[word_start + word.len()..];
            let lower = word.to_ascii_lowercase();
            let pos = self.current_pos(word_start);

            match lower.as_str() {
                ".include" => self.handle_include(rest, pos, sink)?,
                ".macro" => self.start_macro(rest, pos, sink),
                ".endm" | ".endmacro" => {
                    sink.error(pos, "'.endm' without an open macro definition");
                }
                ".rept" => self.start_rept(rest, pos, sink),
                ".irp" => self.start_irp(rest, pos, false, sink),
                ".irpc" => self.start_irp(rest, pos, true, sink),
                ".endr" => {
                    sink.error(pos, "'.endr' without an open repetition");
                }
                ".exitm" => {
                    if self.filters.last().map(|f| f.kind()) == Some(FilterKind::MacroSubst) {
                        self.filters.pop();
                    } else {
                        sink.error(pos, "'.exitm' outside of a macro expansion");
                    }
                }
                _ => {
                    let invokes = self.macros.get(&lower).cloned();
                    match invokes {
                        // a word followed by ':' is a label, not an invocation
                        Some(mac) if !rest.trim_start().starts_with(':') => {
                            self.invoke_macro(mac, rest, pos, sink);
                        }
                        _ => return Ok(Some(text)),
                    }
                }
            }
        }
    }

    /// Expand everything, returning the produced lines.
    pub fn expand_all(&mut self, sink: &mut dyn DiagnosticSink) -> Result<Vec<String>, ExpandError> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line(sink)? {
            lines.push(line);
        }
        Ok(lines)
    }

    fn current_pos(&self, offset: usize) -> SourcePos {
        let filter = self.filters.last().expect("a filter produced this line");
        filter.source_pos(offset)
    }

    fn record_line(&mut self, bytes: &[u8], col_trans: &[LineTrans]) {
        let text = String::from_utf8_lossy(bytes);
        let word = first_word(&text)
            .map(|(_, w)| w.to_ascii_lowercase())
            .unwrap_or_default();
        let rec = self.recording.as_mut().expect("recording in progress");

        let closes = match &rec.kind {
            RecordingKind::Macro { .. } => matches!(word.as_str(), ".endm" | ".endmacro"),
            RecordingKind::Rept(_) | RecordingKind::Irp(_) => word == ".endr",
        };
        if closes {
            if rec.nesting == 0 {
                self.finish_recording();
                return;
            }
            rec.nesting -= 1;
        } else {
            let opens = match &rec.kind {
                RecordingKind::Macro { .. } => word == ".macro",
                RecordingKind::Rept(_) | RecordingKind::Irp(_) => {
                    matches!(word.as_str(), ".rept" | ".irp" | ".irpc")
                }
            };
            if opens {
                rec.nesting += 1;
            }
        }

        let filter = self.filters.last().expect("a filter produced this line");
        let (macro_subst, source) = (filter.macro_subst(), filter.source());
        match &mut rec.kind {
            RecordingKind::Macro { def, .. } => def.add_line(macro_subst, source, col_trans, bytes),
            RecordingKind::Rept(def) => def.add_line(macro_subst, source, col_trans, bytes),
            RecordingKind::Irp(def) => def.add_line(macro_subst, source, col_trans, bytes),
        }
    }

    fn finish_recording(&mut self) {
        match self.recording.take().expect("recording in progress").kind {
            RecordingKind::Macro { name, def } => {
                tracing::debug!(name = %name, "macro defined");
                self.macros.insert(name, Rc::new(def));
            }
            RecordingKind::Rept(def) => {
                if def.repeats_num() > 0 {
                    self.filters
                        .push(Box::new(RepeatInputFilter::new(Rc::new(def))));
                }
            }
            RecordingKind::Irp(def) => {
                if def.repeats_num() > 0 {
                    self.filters.push(Box::new(IrpInputFilter::new(Rc::new(def))));
                }
            }
        }
    }

    fn handle_include(
        &mut self,
        rest: &str,
        pos: SourcePos,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<(), ExpandError> {
        let Some(path) = parse_quoted(rest) else {
            sink.error(pos, "Expected a quoted file name after '.include'");
            return Ok(());
        };
        let resolved = self.resolve_include(&path);
        tracing::debug!(path = %resolved.display(), "including file");
        let filter = StreamInputFilter::include(&pos, &resolved)?;
        self.filters.push(Box::new(filter));
        Ok(())
    }

    fn resolve_include(&self, path: &str) -> PathBuf {
        let raw = PathBuf::from(path);
        if raw.is_absolute() || raw.exists() {
            return raw;
        }
        for dir in &self.include_dirs {
            let candidate = dir.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
        raw
    }

    fn start_macro(&mut self, rest: &str, pos: SourcePos, sink: &mut dyn DiagnosticSink) {
        let rest = rest.trim_start();
        let name = str_sym_name(rest);
        if name.is_empty() {
            sink.error(pos, "Expected a macro name after '.macro'");
            return;
        }
        let mut args = Vec::new();
        for token in list_tokens(&rest[name.len()..]) {
            let (arg_name, def_value) = match token.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (token.as_str(), None),
            };
            if str_sym_name(arg_name) != arg_name || arg_name.is_empty() {
                sink.error(pos.clone(), &format!("Invalid macro argument '{token}'"));
                continue;
            }
            args.push(MacroArg {
                name: arg_name.into(),
                def_value: def_value.map(Into::into),
            });
        }
        self.recording = Some(Recording {
            kind: RecordingKind::Macro {
                name: name.to_ascii_lowercase(),
                def: MacroDef::new(pos, args),
            },
            nesting: 0,
        });
    }

    fn start_rept(&mut self, rest: &str, pos: SourcePos, sink: &mut dyn DiagnosticSink) {
        let count = match parse_count(rest.trim()) {
            Some(n) => n,
            None => {
                sink.error(pos.clone(), "Expected a repeat count after '.rept'");
                0
            }
        };
        self.recording = Some(Recording {
            kind: RecordingKind::Rept(RepeatDef::new(pos, count)),
            nesting: 0,
        });
    }

    fn start_irp(
        &mut self,
        rest: &str,
        pos: SourcePos,
        irpc: bool,
        sink: &mut dyn DiagnosticSink,
    ) {
        let rest = rest.trim_start();
        let symbol = str_sym_name(rest);
        if symbol.is_empty() {
            sink.error(
                pos,
                if irpc {
                    "Expected a symbol after '.irpc'"
                } else {
                    "Expected a symbol after '.irp'"
                },
            );
            return;
        }
        let values = list_tokens(&rest[symbol.len()..]);
        let def = if irpc {
            IrpDef::new_chars(
                pos,
                symbol.into(),
                values.first().map(|s| s.as_str()).unwrap_or("").into(),
            )
        } else {
            IrpDef::new_list(pos, symbol.into(), values.iter().map(|s| s.as_str().into()).collect())
        };
        self.recording = Some(Recording {
            kind: RecordingKind::Irp(def),
            nesting: 0,
        });
    }

    fn invoke_macro(
        &mut self,
        mac: Rc<MacroDef>,
        rest: &str,
        pos: SourcePos,
        sink: &mut dyn DiagnosticSink,
    ) {
        let values = list_tokens(rest);
        if values.len() > mac.args().len() {
            sink.error(pos.clone(), "Too many arguments for macro invocation");
        }
        let pairs = mac
            .args()
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                let value = values
                    .get(i)
                    .map(|v| v.as_str().into())
                    .or_else(|| arg.def_value.clone())
                    .unwrap_or_default();
                (arg.name.clone(), value)
            })
            .collect();
        let count = self.macro_count;
        self.macro_count += 1;
        tracing::debug!(invocation = count, "expanding macro");
        self.filters.push(Box::new(MacroInputFilter::new(
            mac,
            &pos,
            MacroArgMap::from_pairs(pairs),
            count,
        )));
    }
}

/// The first word of a line: its byte offset and text. Words cover
/// directive names, macro names, and labels alike.
fn first_word(line: &str) -> Option<(usize, &str)> {
    let start = line.find(|c: char| c != ' ')?;
    let rest = &line[start..];
    let word = str_sym_name(rest);
    if word.is_empty() { None } else { Some((start, word)) }
}

fn str_sym_name(s: &str) -> &str {
    let len = extract_sym_name(s.as_bytes()).len();
    &s[..len]
}

/// Split a comma/space separated value list; double-quoted entries keep
/// their inner spaces.
fn list_tokens(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'"' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            out.push(s[start..i].to_owned());
            if i < bytes.len() {
                i += 1;
            }
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b' ' && bytes[i] != b',' {
                i += 1;
            }
            out.push(s[start..i].to_owned());
        }
    }
    out
}

fn parse_quoted(s: &str) -> Option<String> {
    let s = s.trim();
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.to_owned())
}

fn parse_count(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;

    fn expand(src: &str) -> (Vec<String>, Diagnostics) {
        let mut expander = LineExpander::from_str(src, "t.s");
        let mut sink = Diagnostics::new();
        let lines = expander.expand_all(&mut sink).unwrap();
        (lines, sink)
    }

    #[test]
    fn plain_lines_pass_through() {
        let (lines, sink) = expand("s_mov_b32 s0, s1\ns_endpgm\n");
        assert!(sink.is_empty());
        assert_eq!(lines, ["s_mov_b32 s0, s1", "s_endpgm"]);
    }

    #[test]
    fn macro_definition_and_invocation() {
        let src = ".macro osc x\nmov \\x, \\@\n.endm\nosc r5\nosc r7\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["mov r5, 0", "mov r7, 1"]);
    }

    #[test]
    fn macro_arguments_fall_back_to_defaults() {
        let src = ".macro ld dst, src=r0\nmov \\dst, \\src\n.endm\nld r1\nld r2, r9\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["mov r1, r0", "mov r2, r9"]);
    }

    #[test]
    fn rept_replays_the_body() {
        let (lines, sink) = expand(".rept 3\nnop\n.endr\ndone\n");
        assert!(sink.is_empty());
        assert_eq!(lines, ["nop", "nop", "nop", "done"]);
    }

    #[test]
    fn rept_zero_skips_the_body() {
        let (lines, sink) = expand(".rept 0\nnop\n.endr\ndone\n");
        assert!(sink.is_empty());
        assert_eq!(lines, ["done"]);
    }

    #[test]
    fn irp_and_irpc() {
        let src = ".irp reg, r2, r3\npush \\reg\n.endr\n.irpc c, ab\nflag_\\c\n.endr\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["push r2", "push r3", "flag_a", "flag_b"]);
    }

    #[test]
    fn nested_repetitions_record_whole_bodies() {
        let src = ".rept 2\n.rept 2\nx\n.endr\n.endr\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["x", "x", "x", "x"]);
    }

    #[test]
    fn macro_expansion_inside_macro() {
        let src = "\
.macro inner v
ld \\v
.endm
.macro outer a
inner \\a
inner \\a
.endm
outer r8
";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["ld r8", "ld r8"]);
    }

    #[test]
    fn exitm_stops_the_expansion() {
        let src = ".macro m\none\n.exitm\ntwo\n.endm\nm\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["one"]);
    }

    #[test]
    fn unterminated_macro_definition_is_reported() {
        let (lines, sink) = expand(".macro broken\nnop\n");
        assert!(lines.is_empty());
        assert_eq!(sink.diagnostics().len(), 1);
        assert!(
            sink.diagnostics()[0]
                .message
                .contains("Unterminated macro definition")
        );
    }

    #[test]
    fn stray_endm_is_reported() {
        let (lines, sink) = expand(".endm\nok\n");
        assert_eq!(lines, ["ok"]);
        assert!(sink.has_errors());
    }

    #[test]
    fn diagnostics_inside_macros_point_at_the_body() {
        // an unterminated string inside a macro body is reported when the
        // body is recorded (the stream filter sees it first)
        let src = ".macro s\nmov \"oops\n.endm\ns\n";
        let (_, sink) = expand(src);
        assert_eq!(sink.diagnostics().len(), 1);
        let rendered = sink.render_to_string();
        assert!(rendered.contains("Warning: Unterminated string"));
    }

    #[test]
    fn macro_names_are_case_insensitive() {
        let src = ".macro OSC x\nmov \\x\n.endm\nosc r1\nOSC r2\n";
        let (lines, sink) = expand(src);
        assert!(sink.is_empty());
        assert_eq!(lines, ["mov r1", "mov r2"]);
    }
}
