//! Stream input filtering.
//!
//! A [`StreamInputFilter`] turns a raw byte stream into logical lines:
//! comments are blanked out to spaces, whitespace runs collapse to a single
//! space, strings pass through verbatim, `\`-newline joins physical lines,
//! and `;` splits one physical line into several logical ones. Alongside
//! every line the filter produces a [`LineTrans`] table so any column of the
//! normalised output can be resolved back to its original line and column.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use crate::{
    diagnostics::DiagnosticSink,
    source::{LineCol, LineTrans, MacroSubstRef, Source, SourcePos, SourceRef, translate_pos},
    text::Text,
};

/// Minimum (and initial) size of a stream filter's line buffer; longer lines
/// grow it geometrically.
const PARSER_LINE_MAX_SIZE: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("can't open include file \"{path}\"")]
    IncludeNotFound {
        path: Text,
        #[source]
        error: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What kind of filter sits on the input stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Stream,
    MacroSubst,
    Repeat,
}

/// One element of the assembler's input stack.
///
/// `read_line` yields the next logical line together with its column
/// translation table, or `None` at end of input. The remaining methods
/// expose the provenance state for the line most recently produced.
pub trait InputFilter {
    fn read_line(
        &mut self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<(&[u8], &[LineTrans])>, InputError>;

    fn col_translations(&self) -> &[LineTrans];
    fn source(&self) -> &SourceRef;
    fn macro_subst(&self) -> Option<&MacroSubstRef>;
    fn line_no(&self) -> u64;
    fn kind(&self) -> FilterKind;

    /// Resolve a 0-based offset in the current logical line.
    fn translate_pos(&self, position: usize) -> LineCol {
        translate_pos(self.col_translations(), position)
    }

    /// The full source position of an offset in the current logical line.
    fn source_pos(&self, position: usize) -> SourcePos {
        let lc = self.translate_pos(position);
        SourcePos::new(
            self.macro_subst().cloned(),
            self.source().clone(),
            lc.line_no,
            lc.col_no,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    Normal,
    LineComment,
    BlockComment,
    String,
    LString,
}

/// `isspace` over the bytes the lexer cares about. Newline counts: it ends
/// whitespace runs and is then handled explicitly.
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Reads logical lines from a byte stream (a file, stdin, or anything
/// `Read`).
impl std::fmt::Debug for StreamInputFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInputFilter")
            .field("source", &self.source)
            .field("buffer", &self.buffer)
            .field("pos", &self.pos)
            .field("line_no", &self.line_no)
            .field("mode", &self.mode)
            .field("stmt_pos", &self.stmt_pos)
            .field("col_translations", &self.col_translations)
            .field("comment_start", &self.comment_start)
            .field("line_start", &self.line_start)
            .field("line_end", &self.line_end)
            .finish()
    }
}

pub struct StreamInputFilter {
    source: SourceRef,
    stream: Box<dyn Read>,
    buffer: Vec<u8>,
    pos: usize,
    line_no: u64,
    mode: LineMode,
    /// Bytes consumed from the current physical line by earlier statements
    /// split off at `;`.
    stmt_pos: usize,
    col_translations: Vec<LineTrans>,
    /// Where the currently open block comment started, for the EOF report.
    comment_start: Option<LineCol>,
    /// Start of the most recently produced line in `buffer`.
    line_start: usize,
    /// End of the most recently produced line in `buffer`.
    line_end: usize,
}

impl StreamInputFilter {
    /// Open the top-level source file.
    pub fn open(path: impl AsRef<Path>) -> Result<StreamInputFilter, InputError> {
        let path = path.as_ref();
        let text: Text = path.display().to_string().into();
        let file = File::open(path).map_err(|error| InputError::IncludeNotFound {
            path: text.clone(),
            error,
        })?;
        Ok(StreamInputFilter::with_source(
            Source::top_level_file(text),
            Box::new(file),
        ))
    }

    /// Open a file included at `pos`; the new source keeps the include chain.
    pub fn include(pos: &SourcePos, path: impl AsRef<Path>) -> Result<StreamInputFilter, InputError> {
        let path = path.as_ref();
        let text: Text = path.display().to_string().into();
        let file = File::open(path).map_err(|error| InputError::IncludeNotFound {
            path: text.clone(),
            error,
        })?;
        Ok(StreamInputFilter::with_source(
            Source::file_included_at(pos, text),
            Box::new(file),
        ))
    }

    /// Read from an arbitrary stream under the given display name. An empty
    /// name reads as `<stdin>` in diagnostics.
    pub fn from_stream(stream: impl Read + 'static, name: impl Into<Text>) -> StreamInputFilter {
        StreamInputFilter::with_source(Source::top_level_file(name), Box::new(stream))
    }

    fn with_source(source: SourceRef, stream: Box<dyn Read>) -> StreamInputFilter {
        StreamInputFilter {
            source,
            stream,
            buffer: Vec::with_capacity(PARSER_LINE_MAX_SIZE),
            pos: 0,
            line_no: 1,
            mode: LineMode::Normal,
            stmt_pos: 0,
            col_translations: Vec::new(),
            comment_start: None,
            line_start: 0,
            line_end: 0,
        }
    }

    fn pos_for(&self, lc: LineCol) -> SourcePos {
        SourcePos::new(None, self.source.clone(), lc.line_no, lc.col_no)
    }

    fn do_read_line(&mut self, sink: &mut dyn DiagnosticSink) -> Result<bool, InputError> {
        self.col_translations.clear();
        let mut end_of_line = false;
        let mut line_start = self.pos;
        // start of the current physical line, in (possibly shifted) buffer
        // coordinates; goes negative after a compaction shrank the prefix
        let mut join_start = self.pos as isize;
        let mut dest_pos = self.pos;
        let mut backslash = 0usize;
        let mut prev_asterisk = false;
        let mut asterisk = false;
        self.col_translations.push(LineTrans {
            position: -(self.stmt_pos as isize),
            line_no: self.line_no,
        });

        while !end_of_line {
            match self.mode {
                LineMode::Normal => {
                    if self.pos < self.buffer.len()
                        && !is_space(self.buffer[self.pos])
                        && self.buffer[self.pos] != b';'
                    {
                        // copy a run of non-blank characters in place
                        loop {
                            backslash = usize::from(self.buffer[self.pos] == b'\\');
                            if self.buffer[self.pos] == b'*'
                                && dest_pos > 0
                                && self.buffer[dest_pos - 1] == b'/'
                            {
                                self.comment_start = Some(LineCol {
                                    line_no: self.line_no,
                                    col_no: (self.pos as isize - 1 - join_start) as u64
                                        + self.stmt_pos as u64
                                        + 1,
                                });
                                self.buffer[dest_pos - 1] = b' ';
                                self.buffer[dest_pos] = b' ';
                                dest_pos += 1;
                                self.mode = LineMode::BlockComment;
                                self.pos += 1;
                                prev_asterisk = false;
                                asterisk = false;
                                break;
                            }
                            if self.buffer[self.pos] == b'#' {
                                self.buffer[dest_pos] = b' ';
                                dest_pos += 1;
                                self.mode = LineMode::LineComment;
                                self.pos += 1;
                                break;
                            }

                            let old = self.buffer[self.pos];
                            self.buffer[dest_pos] = old;
                            dest_pos += 1;
                            self.pos += 1;

                            if old == b'"' {
                                self.mode = LineMode::String;
                                break;
                            } else if old == b'\'' {
                                self.mode = LineMode::LString;
                                break;
                            }

                            if !(self.pos < self.buffer.len()
                                && !is_space(self.buffer[self.pos])
                                && self.buffer[self.pos] != b';')
                            {
                                break;
                            }
                        }
                    }
                    if self.pos < self.buffer.len() {
                        if self.buffer[self.pos] == b'\n' {
                            self.line_no += 1;
                            end_of_line = backslash == 0;
                            if backslash != 0 {
                                // line continuation: drop the backslash and
                                // record the seam
                                dest_pos -= 1;
                                if (dest_pos - line_start) as isize
                                    == self.col_translations.last().map(|t| t.position).unwrap_or(-1)
                                {
                                    self.col_translations.pop();
                                }
                                self.col_translations.push(LineTrans {
                                    position: (dest_pos - line_start) as isize,
                                    line_no: self.line_no,
                                });
                            }
                            self.stmt_pos = 0;
                            self.pos += 1;
                            join_start = self.pos as isize;
                            backslash = 0;
                        } else if self.buffer[self.pos] == b';' && self.mode == LineMode::Normal {
                            // statement separator: the rest of the physical
                            // line becomes the next logical line
                            end_of_line = true;
                            self.pos += 1;
                            self.stmt_pos += (self.pos as isize - join_start) as usize;
                            join_start = self.pos as isize;
                            backslash = 0;
                        } else if self.mode == LineMode::Normal {
                            // a whitespace run collapses to a single space
                            backslash = 0;
                            loop {
                                self.buffer[dest_pos] = b' ';
                                dest_pos += 1;
                                self.pos += 1;
                                if !(self.pos < self.buffer.len()
                                    && self.buffer[self.pos] != b'\n'
                                    && is_space(self.buffer[self.pos]))
                                {
                                    break;
                                }
                            }
                        }
                    }
                }
                LineMode::LineComment => {
                    while self.pos < self.buffer.len() && self.buffer[self.pos] != b'\n' {
                        backslash = usize::from(self.buffer[self.pos] == b'\\');
                        self.pos += 1;
                        self.buffer[dest_pos] = b' ';
                        dest_pos += 1;
                    }
                    if self.pos < self.buffer.len() {
                        self.line_no += 1;
                        end_of_line = backslash == 0;
                        if backslash != 0 {
                            dest_pos -= 1;
                            if (dest_pos - line_start) as isize
                                == self.col_translations.last().map(|t| t.position).unwrap_or(-1)
                            {
                                self.col_translations.pop();
                            }
                            self.col_translations.push(LineTrans {
                                position: (dest_pos - line_start) as isize,
                                line_no: self.line_no,
                            });
                        } else {
                            self.mode = LineMode::Normal;
                        }
                        self.pos += 1;
                        join_start = self.pos as isize;
                        backslash = 0;
                        self.stmt_pos = 0;
                    }
                }
                LineMode::BlockComment => {
                    while self.pos < self.buffer.len()
                        && self.buffer[self.pos] != b'\n'
                        && (!asterisk || self.buffer[self.pos] != b'/')
                    {
                        backslash = usize::from(self.buffer[self.pos] == b'\\');
                        prev_asterisk = asterisk;
                        asterisk = self.buffer[self.pos] == b'*';
                        self.pos += 1;
                        self.buffer[dest_pos] = b' ';
                        dest_pos += 1;
                    }
                    if self.pos < self.buffer.len() {
                        if asterisk && self.buffer[self.pos] == b'/' {
                            self.pos += 1;
                            self.buffer[dest_pos] = b' ';
                            dest_pos += 1;
                            self.mode = LineMode::Normal;
                            self.comment_start = None;
                        } else {
                            // newline inside the comment
                            self.line_no += 1;
                            end_of_line = backslash == 0;
                            if backslash != 0 {
                                asterisk = prev_asterisk;
                                prev_asterisk = false;
                                dest_pos -= 1;
                                if (dest_pos - line_start) as isize
                                    == self.col_translations.last().map(|t| t.position).unwrap_or(-1)
                                {
                                    self.col_translations.pop();
                                }
                                self.col_translations.push(LineTrans {
                                    position: (dest_pos - line_start) as isize,
                                    line_no: self.line_no,
                                });
                            }
                            self.pos += 1;
                            join_start = self.pos as isize;
                            backslash = 0;
                            self.stmt_pos = 0;
                        }
                    }
                }
                LineMode::String | LineMode::LString => {
                    let quote = if self.mode == LineMode::String {
                        b'"'
                    } else {
                        b'\''
                    };
                    while self.pos < self.buffer.len()
                        && self.buffer[self.pos] != b'\n'
                        && ((backslash & 1) != 0 || self.buffer[self.pos] != quote)
                    {
                        if self.buffer[self.pos] == b'\\' {
                            backslash += 1;
                        } else {
                            backslash = 0;
                        }
                        self.buffer[dest_pos] = self.buffer[self.pos];
                        dest_pos += 1;
                        self.pos += 1;
                    }
                    if self.pos < self.buffer.len() {
                        if (backslash & 1) == 0 && self.buffer[self.pos] == quote {
                            self.pos += 1;
                            self.mode = LineMode::Normal;
                            self.buffer[dest_pos] = quote;
                            dest_pos += 1;
                        } else {
                            self.line_no += 1;
                            end_of_line = (backslash & 1) == 0;
                            if backslash & 1 != 0 {
                                // the backslash escaped the newline
                                dest_pos -= 1;
                                self.col_translations.push(LineTrans {
                                    position: (dest_pos - line_start) as isize,
                                    line_no: self.line_no,
                                });
                            } else {
                                let lc = LineCol {
                                    line_no: self.line_no,
                                    col_no: (self.pos as isize - join_start) as u64
                                        + self.stmt_pos as u64
                                        + 1,
                                };
                                sink.warning(
                                    self.pos_for(lc),
                                    "Unterminated string: newline inserted",
                                );
                                // the newline terminates the string
                                self.mode = LineMode::Normal;
                            }
                            self.pos += 1;
                            join_start = self.pos as isize;
                            self.stmt_pos = 0;
                        }
                        backslash = 0;
                    }
                }
            }

            if end_of_line {
                break;
            }

            if self.pos >= self.buffer.len() {
                // the in-progress line hit the buffer tail: shift it to the
                // front, grow if needed, then pull fresh bytes
                if line_start != 0 {
                    self.buffer.copy_within(line_start..self.pos, 0);
                    dest_pos -= line_start;
                    join_start -= self.pos as isize - dest_pos as isize;
                    self.pos = dest_pos;
                    line_start = 0;
                }
                if self.pos == self.buffer.len() {
                    let grown = PARSER_LINE_MAX_SIZE.max(self.pos + (self.pos >> 1));
                    self.buffer.resize(grown, 0);
                }

                let read = loop {
                    match self.stream.read(&mut self.buffer[self.pos..]) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                };
                self.buffer.truncate(self.pos + read);
                if read == 0 {
                    // end of input
                    if self.mode == LineMode::BlockComment {
                        if let Some(lc) = self.comment_start.take() {
                            sink.error(self.pos_for(lc), "Unterminated multi-line comment");
                        }
                    }
                    if dest_pos - line_start == 0 {
                        return Ok(false);
                    }
                    break;
                }
            }
        }

        self.line_start = line_start;
        self.line_end = dest_pos;
        Ok(true)
    }
}

impl InputFilter for StreamInputFilter {
    fn read_line(
        &mut self,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<(&[u8], &[LineTrans])>, InputError> {
        if self.do_read_line(sink)? {
            Ok(Some((
                &self.buffer[self.line_start..self.line_end],
                &self.col_translations,
            )))
        } else {
            Ok(None)
        }
    }

    fn col_translations(&self) -> &[LineTrans] {
        &self.col_translations
    }

    fn source(&self) -> &SourceRef {
        &self.source
    }

    fn macro_subst(&self) -> Option<&MacroSubstRef> {
        None
    }

    fn line_no(&self) -> u64 {
        self.line_no
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;

    fn filter(src: &str) -> StreamInputFilter {
        StreamInputFilter::from_stream(io::Cursor::new(src.as_bytes().to_vec()), "t.s")
    }

    /// Collect all logical lines with their translation tables.
    fn read_all(src: &str) -> (Vec<(String, Vec<LineTrans>)>, Diagnostics) {
        let mut f = filter(src);
        let mut sink = Diagnostics::new();
        let mut lines = Vec::new();
        while let Some((line, trans)) = f.read_line(&mut sink).unwrap() {
            lines.push((String::from_utf8_lossy(line).into_owned(), trans.to_vec()));
        }
        (lines, sink)
    }

    fn lt(position: isize, line_no: u64) -> LineTrans {
        LineTrans { position, line_no }
    }

    #[test]
    fn line_continuation_joins_physical_lines() {
        let (lines, sink) = read_all("abc \\\n def");
        assert!(sink.is_empty());
        assert_eq!(lines.len(), 1);
        let (text, trans) = &lines[0];
        assert_eq!(text, "abc  def");
        assert_eq!(trans, &[lt(0, 1), lt(4, 2)]);
        // column 6 of the joined line is the 'd' at column 2 of line 2
        assert_eq!(
            translate_pos(trans, 5),
            LineCol {
                line_no: 2,
                col_no: 2
            }
        );
    }

    #[test]
    fn statement_splitting_keeps_the_physical_line_number() {
        let (lines, sink) = read_all("mov r0, r1 ; add r2, r3\n");
        assert!(sink.is_empty());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "mov r0, r1 ");
        assert_eq!(lines[0].1, vec![lt(0, 1)]);
        assert_eq!(lines[1].0, " add r2, r3");
        assert_eq!(lines[1].1, vec![lt(-12, 1)]);
        // first byte of the second statement resolves to column 13
        assert_eq!(
            translate_pos(&lines[1].1, 0),
            LineCol {
                line_no: 1,
                col_no: 13
            }
        );
    }

    #[test]
    fn comments_become_spaces() {
        let (lines, sink) = read_all("a#xy\nb /*c*/ d\n");
        assert!(sink.is_empty());
        assert_eq!(lines[0].0, "a   ");
        assert_eq!(lines[1].0, "b       d");
    }

    #[test]
    fn block_comment_spans_lines() {
        let (lines, sink) = read_all("a /* one\ntwo */ b\n");
        assert!(sink.is_empty());
        // the newline inside the comment still ends the logical line
        assert_eq!(lines[0].0, "a       ");
        assert_eq!(lines[1].0, "       b");
        assert_eq!(lines[1].1, vec![lt(0, 2)]);
    }

    #[test]
    fn unterminated_block_comment_is_reported_at_its_opener() {
        let (lines, sink) = read_all("a /* b\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, "a     ");
        let diags = sink.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "Unterminated multi-line comment");
        assert_eq!(diags[0].pos.line_no, 1);
        assert_eq!(diags[0].pos.col_no, 3);
    }

    #[test]
    fn strings_pass_through_verbatim() {
        let (lines, sink) = read_all("x \"a  b # c\" y\n");
        assert!(sink.is_empty());
        assert_eq!(lines[0].0, "x \"a  b # c\" y");
    }

    #[test]
    fn escaped_quote_does_not_close_the_string() {
        let (lines, sink) = read_all("\"a\\\"b\" z\n");
        assert!(sink.is_empty());
        assert_eq!(lines[0].0, "\"a\\\"b\" z");
    }

    #[test]
    fn unterminated_string_warns() {
        let (_, sink) = read_all("mov \"abc\nnop\n");
        let diags = sink.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "Unterminated string: newline inserted");
    }

    #[test]
    fn empty_lines_are_yielded() {
        let (lines, _) = read_all("\n\nend\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0, "");
        assert_eq!(lines[1].0, "");
        assert_eq!(lines[2].0, "end");
        assert_eq!(lines[2].1, vec![lt(0, 3)]);
    }

    #[test]
    fn long_lines_grow_the_buffer() {
        let word = "a".repeat(2000);
        let src = format!("{word} {word}\nnext\n");
        let (lines, sink) = read_all(&src);
        assert!(sink.is_empty());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0.len(), 4001);
        assert_eq!(lines[1].0, "next");
        assert_eq!(lines[1].1, vec![lt(0, 2)]);
    }

    #[test]
    fn continuation_inside_line_comment() {
        let (lines, sink) = read_all("one #cc\\\ntwo\nthree\n");
        assert!(sink.is_empty());
        // the continuation glues the commented-out tail of line 2 on as well
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1.len(), 2);
        assert_eq!(lines[0].1[1].line_no, 2);
        assert_eq!(lines[1].0, "three");
    }

    #[test]
    fn missing_file_fails_with_include_error() {
        let err = StreamInputFilter::open("no/such/file.s").unwrap_err();
        assert!(matches!(err, InputError::IncludeNotFound { .. }));
    }
}
