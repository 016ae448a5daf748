//! Macro and repetition machinery.
//!
//! Definitions are recorded line by line while the assembler reads a
//! `.macro`/`.rept`/`.irp` body: the recorder keeps the raw bytes, the
//! column-translation entries of every recorded line, and a compact table of
//! which source produced which stretch of lines. Once closed, a definition is
//! immutable and shared by every expansion.
//!
//! Expansion filters replay a recorded body, substituting `\name`, `\@`, and
//! `\()` while rebuilding a column-translation table for each produced line
//! so diagnostics inside an expansion still point at the definition site.

use std::rc::Rc;

use crate::{
    diagnostics::DiagnosticSink,
    input::{FilterKind, InputError, InputFilter},
    source::{LineTrans, MacroSubst, MacroSubstRef, Source, SourcePos, SourceRef},
    text::Text,
};

/// A formal parameter of a macro.
#[derive(Debug, Clone)]
pub struct MacroArg {
    pub name: Text,
    pub def_value: Option<Text>,
}

/// Identifier characters as the macro substitutor sees them. The scan is
/// greedy and stops at the first byte outside this set.
fn is_sym_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'$')
}

fn is_sym_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || matches!(b, b'_' | b'.' | b'$')
}

/// The longest identifier prefix of `bytes`; empty when the first byte
/// cannot start one.
pub(crate) fn extract_sym_name(bytes: &[u8]) -> &[u8] {
    if bytes.is_empty() || !is_sym_start(bytes[0]) {
        return &bytes[..0];
    }
    let len = bytes.iter().take_while(|&&b| is_sym_char(b)).count();
    &bytes[..len]
}

/// Macro arguments for one invocation, sorted by name for binary search.
#[derive(Debug, Default)]
pub struct MacroArgMap(Vec<(Text, Text)>);

impl MacroArgMap {
    pub fn from_pairs(mut pairs: Vec<(Text, Text)>) -> MacroArgMap {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        MacroArgMap(pairs)
    }

    fn get(&self, name: &[u8]) -> Option<&Text> {
        self.0
            .binary_search_by(|(k, _)| k.as_bytes().cmp(name))
            .ok()
            .map(|idx| &self.0[idx].1)
    }
}

/// A recorded macro definition.
#[derive(Debug)]
pub struct MacroDef {
    pos: SourcePos,
    args: Vec<MacroArg>,
    content: Vec<u8>,
    col_translations: Vec<LineTrans>,
    source_translations: Vec<MacroSourceTrans>,
    content_line_no: u64,
}

#[derive(Debug)]
struct MacroSourceTrans {
    line_no: u64,
    source: SourceRef,
}

impl MacroDef {
    pub fn new(pos: SourcePos, args: Vec<MacroArg>) -> MacroDef {
        MacroDef {
            pos,
            args,
            content: Vec::new(),
            col_translations: Vec::new(),
            source_translations: Vec::new(),
            content_line_no: 0,
        }
    }

    pub fn pos(&self) -> &SourcePos {
        &self.pos
    }

    pub fn args(&self) -> &[MacroArg] {
        &self.args
    }

    /// Append one recorded body line.
    ///
    /// Consecutive lines from the same `(source, macro_subst)` pair share a
    /// single source-translation entry; when a macro substitution is in
    /// effect the recorded source is wrapped in a [`Source::Macro`] node so
    /// distinct invocation stacks stay distinguishable.
    pub fn add_line(
        &mut self,
        macro_subst: Option<&MacroSubstRef>,
        source: &SourceRef,
        col_trans: &[LineTrans],
        line: &[u8],
    ) {
        self.content.extend_from_slice(line);
        if line.last() != Some(&b'\n') {
            self.content.push(b'\n');
        }
        self.col_translations.extend_from_slice(col_trans);

        match macro_subst {
            None => {
                let differs = match self.source_translations.last() {
                    Some(last) => !Rc::ptr_eq(&last.source, source),
                    None => true,
                };
                if differs {
                    self.source_translations.push(MacroSourceTrans {
                        line_no: self.content_line_no,
                        source: source.clone(),
                    });
                }
            }
            Some(subst) => {
                let differs = match self.source_translations.last() {
                    Some(last) => match &*last.source {
                        Source::Macro(ms) => {
                            !Rc::ptr_eq(&ms.source, source)
                                || !Rc::ptr_eq(&ms.substituted_at, subst)
                        }
                        _ => true,
                    },
                    None => true,
                };
                if differs {
                    self.source_translations.push(MacroSourceTrans {
                        line_no: self.content_line_no,
                        source: Source::macro_content(subst.clone(), source.clone()),
                    });
                }
            }
        }
        self.content_line_no += 1;
    }
}

/// A recorded repetition body.
#[derive(Debug)]
pub struct RepeatDef {
    pos: SourcePos,
    repeats_num: u64,
    content: Vec<u8>,
    col_translations: Vec<LineTrans>,
    source_translations: Vec<RepeatSourceTrans>,
    content_line_no: u64,
}

#[derive(Debug)]
struct RepeatSourceTrans {
    line_no: u64,
    macro_subst: Option<MacroSubstRef>,
    source: SourceRef,
}

impl RepeatDef {
    pub fn new(pos: SourcePos, repeats_num: u64) -> RepeatDef {
        RepeatDef {
            pos,
            repeats_num,
            content: Vec::new(),
            col_translations: Vec::new(),
            source_translations: Vec::new(),
            content_line_no: 0,
        }
    }

    pub fn pos(&self) -> &SourcePos {
        &self.pos
    }

    pub fn repeats_num(&self) -> u64 {
        self.repeats_num
    }

    pub fn add_line(
        &mut self,
        macro_subst: Option<&MacroSubstRef>,
        source: &SourceRef,
        col_trans: &[LineTrans],
        line: &[u8],
    ) {
        self.content.extend_from_slice(line);
        if line.last() != Some(&b'\n') {
            self.content.push(b'\n');
        }
        self.col_translations.extend_from_slice(col_trans);

        let differs = match self.source_translations.last() {
            Some(last) => {
                !Rc::ptr_eq(&last.source, source) || !option_rc_eq(&last.macro_subst, macro_subst)
            }
            None => true,
        };
        if differs {
            self.source_translations.push(RepeatSourceTrans {
                line_no: self.content_line_no,
                macro_subst: macro_subst.cloned(),
                source: source.clone(),
            });
        }
        self.content_line_no += 1;
    }
}

fn option_rc_eq(a: &Option<MacroSubstRef>, b: Option<&MacroSubstRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// A recorded `.irp`/`.irpc` body: a repetition that substitutes its symbol
/// with the current list element (or string character).
#[derive(Debug)]
pub struct IrpDef {
    base: RepeatDef,
    irpc: bool,
    symbol: Text,
    values: Vec<Text>,
}

impl IrpDef {
    /// One pass per element of `values`.
    pub fn new_list(pos: SourcePos, symbol: Text, values: Vec<Text>) -> IrpDef {
        let repeats = values.len() as u64;
        IrpDef {
            base: RepeatDef::new(pos, repeats),
            irpc: false,
            symbol,
            values,
        }
    }

    /// One pass per character of `value`; an empty string still runs once,
    /// substituting nothing.
    pub fn new_chars(pos: SourcePos, symbol: Text, value: Text) -> IrpDef {
        let repeats = value.len().max(1) as u64;
        IrpDef {
            base: RepeatDef::new(pos, repeats),
            irpc: true,
            symbol,
            values: vec![value],
        }
    }

    pub fn pos(&self) -> &SourcePos {
        self.base.pos()
    }

    pub fn repeats_num(&self) -> u64 {
        self.base.repeats_num
    }

    pub fn add_line(
        &mut self,
        macro_subst: Option<&MacroSubstRef>,
        source: &SourceRef,
        col_trans: &[LineTrans],
        line: &[u8],
    ) {
        self.base.add_line(macro_subst, source, col_trans, line);
    }
}

/// Threshold in content coordinates at which the next column-translation
/// entry of a recorded body takes effect within the current line.
fn col_trans_threshold(
    col_trans: &[LineTrans],
    cur: usize,
    line_pos: usize,
    next_line_pos: usize,
) -> usize {
    if cur + 1 != col_trans.len() {
        let p = col_trans[cur + 1].position;
        if p > 0 { p as usize + line_pos } else { next_line_pos }
    } else {
        usize::MAX
    }
}

/// Raw threshold used while skipping entries consumed by a substitution.
fn raw_threshold(col_trans: &[LineTrans], cur: usize) -> usize {
    if cur + 1 != col_trans.len() {
        let p = col_trans[cur + 1].position;
        if p >= 0 { p as usize } else { usize::MAX }
    } else {
        usize::MAX
    }
}

/// Replays a recorded macro body, substituting arguments and the invocation
/// counter.
pub struct MacroInputFilter {
    mac: Rc<MacroDef>,
    arg_map: MacroArgMap,
    macro_count: u64,
    source: SourceRef,
    macro_subst: MacroSubstRef,
    line_no: u64,
    pos: usize,
    content_line_no: u64,
    source_trans_index: usize,
    /// Offset already consumed from the current original line by previous
    /// output lines; keeps continuation-adjusted columns correct after
    /// substitution.
    real_line_pos: i64,
    cur_col_trans: usize,
    buffer: Vec<u8>,
    col_translations: Vec<LineTrans>,
}

impl MacroInputFilter {
    pub fn new(
        mac: Rc<MacroDef>,
        pos: &SourcePos,
        arg_map: MacroArgMap,
        macro_count: u64,
    ) -> MacroInputFilter {
        let source = mac
            .source_translations
            .first()
            .map(|t| t.source.clone())
            .unwrap_or_else(|| pos.source.clone());
        let macro_subst = MacroSubst::new(pos);
        let line_no = mac.col_translations.first().map(|t| t.line_no).unwrap_or(0);
        let real_line_pos = mac
            .col_translations
            .first()
            .map(|t| -(t.position as i64))
            .unwrap_or(0);
        MacroInputFilter {
            mac,
            arg_map,
            macro_count,
            source,
            macro_subst,
            line_no,
            pos: 0,
            content_line_no: 0,
            source_trans_index: 0,
            real_line_pos,
            cur_col_trans: 0,
            buffer: Vec::with_capacity(300),
            col_translations: Vec::new(),
        }
    }

    fn next_line(&mut self) -> Option<(&[u8], &[LineTrans])> {
        self.buffer.clear();
        self.col_translations.clear();
        let mac = Rc::clone(&self.mac);
        let col_trans = &mac.col_translations;
        let content = &mac.content;
        let content_size = content.len();
        if self.pos == content_size {
            return None;
        }

        let mut next_line_pos = self.pos;
        while next_line_pos < content_size && content[next_line_pos] != b'\n' {
            next_line_pos += 1;
        }

        let line_pos = self.pos;
        let mut dest_pos = 0usize;
        let mut to_copy_pos = self.pos;
        let mut dest_line_start = 0usize;
        self.col_translations.push(LineTrans {
            position: -(self.real_line_pos as isize),
            line_no: col_trans[self.cur_col_trans].line_no,
        });
        let mut threshold =
            col_trans_threshold(col_trans, self.cur_col_trans, line_pos, next_line_pos);

        while self.pos < content_size && content[self.pos] != b'\n' {
            if self.pos >= threshold {
                self.cur_col_trans += 1;
                self.col_translations.push(LineTrans {
                    position: (dest_pos + self.pos - to_copy_pos) as isize,
                    line_no: col_trans[self.cur_col_trans].line_no,
                });
                if col_trans[self.cur_col_trans].position >= 0 {
                    self.real_line_pos = 0;
                    dest_line_start = dest_pos + self.pos - to_copy_pos;
                }
                threshold =
                    col_trans_threshold(col_trans, self.cur_col_trans, line_pos, next_line_pos);
            }
            if content[self.pos] != b'\\' {
                self.pos += 1;
                continue;
            }

            // flush the bytes pending before the backslash
            if self.pos > to_copy_pos {
                self.buffer.extend_from_slice(&content[to_copy_pos..self.pos]);
                dest_pos += self.pos - to_copy_pos;
            }
            self.pos += 1;
            let mut skip_col_trans = true;
            if self.pos < content_size {
                if content[self.pos] == b'('
                    && self.pos + 1 < content_size
                    && content[self.pos + 1] == b')'
                {
                    // explicit separator between a name and following text
                    self.pos += 2;
                } else {
                    let sym = extract_sym_name(&content[self.pos..]);
                    if let Some(value) = (!sym.is_empty())
                        .then(|| self.arg_map.get(sym))
                        .flatten()
                    {
                        self.buffer.extend_from_slice(value.as_bytes());
                        dest_pos += value.len();
                        self.pos += sym.len();
                    } else if content[self.pos] == b'@' {
                        let num = self.macro_count.to_string();
                        self.pos += 1;
                        self.buffer.extend_from_slice(num.as_bytes());
                        dest_pos += num.len();
                    } else {
                        // unknown reference stays verbatim
                        self.buffer.push(b'\\');
                        dest_pos += 1;
                        skip_col_trans = false;
                    }
                }
            }
            to_copy_pos = self.pos;
            if skip_col_trans {
                // entries covered by the substituted text collapse away
                while self.pos > threshold {
                    self.cur_col_trans += 1;
                    if col_trans[self.cur_col_trans].position >= 0 {
                        self.real_line_pos = 0;
                        dest_line_start = dest_pos + self.pos - to_copy_pos;
                    }
                    threshold = raw_threshold(col_trans, self.cur_col_trans);
                }
            }
        }
        if self.pos > to_copy_pos {
            self.buffer.extend_from_slice(&content[to_copy_pos..self.pos]);
        }

        let line_size = self.buffer.len();
        if self.pos < content_size {
            if self.cur_col_trans + 1 != col_trans.len() {
                self.cur_col_trans += 1;
                if col_trans[self.cur_col_trans].position >= 0 {
                    self.real_line_pos = 0;
                } else {
                    self.real_line_pos += (line_size - dest_line_start + 1) as i64;
                }
            }
            self.pos += 1;
        }
        self.line_no = col_trans[self.cur_col_trans].line_no;

        if self.source_trans_index + 1 < mac.source_translations.len() {
            let next = &mac.source_translations[self.source_trans_index + 1];
            if next.line_no == self.content_line_no {
                self.source = next.source.clone();
                self.source_trans_index += 1;
            }
        }
        self.content_line_no += 1;
        Some((&self.buffer, &self.col_translations))
    }
}

impl InputFilter for MacroInputFilter {
    fn read_line(
        &mut self,
        _sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<(&[u8], &[LineTrans])>, InputError> {
        Ok(self.next_line())
    }

    fn col_translations(&self) -> &[LineTrans] {
        &self.col_translations
    }

    fn source(&self) -> &SourceRef {
        &self.source
    }

    fn macro_subst(&self) -> Option<&MacroSubstRef> {
        Some(&self.macro_subst)
    }

    fn line_no(&self) -> u64 {
        self.line_no
    }

    fn kind(&self) -> FilterKind {
        FilterKind::MacroSubst
    }
}

/// Replays a recorded body N times without substitution.
pub struct RepeatInputFilter {
    repeat: Rc<RepeatDef>,
    repeat_count: u64,
    content_line_no: u64,
    source_trans_index: usize,
    cur_col_trans: usize,
    pos: usize,
    line_no: u64,
    line_start: usize,
    line_end: usize,
    source: SourceRef,
    macro_subst: Option<MacroSubstRef>,
    col_translations: Vec<LineTrans>,
}

impl RepeatInputFilter {
    pub fn new(repeat: Rc<RepeatDef>) -> RepeatInputFilter {
        let (inner, macro_subst) = match repeat.source_translations.first() {
            Some(t) => (t.source.clone(), t.macro_subst.clone()),
            None => (repeat.pos.source.clone(), None),
        };
        let source = Source::repetition(inner, 0, repeat.repeats_num);
        let line_no = repeat
            .col_translations
            .first()
            .map(|t| t.line_no)
            .unwrap_or(0);
        RepeatInputFilter {
            repeat,
            repeat_count: 0,
            content_line_no: 0,
            source_trans_index: 0,
            cur_col_trans: 0,
            pos: 0,
            line_no,
            line_start: 0,
            line_end: 0,
            source,
            macro_subst,
            col_translations: Vec::new(),
        }
    }

    fn next_line(&mut self) -> Option<(&[u8], &[LineTrans])> {
        let rep = Rc::clone(&self.repeat);
        let col_trans = &rep.col_translations;
        let content_size = rep.content.len();
        if self.pos == content_size {
            // one pass done; rewind for the next iteration
            self.repeat_count += 1;
            if self.repeat_count == rep.repeats_num || content_size == 0 {
                return None;
            }
            self.source_trans_index = 0;
            self.cur_col_trans = 0;
            self.line_no = col_trans[0].line_no;
            self.pos = 0;
            self.content_line_no = 0;
            self.source = Source::repetition(
                rep.source_translations[0].source.clone(),
                self.repeat_count,
                rep.repeats_num,
            );
            self.macro_subst = rep.source_translations[0].macro_subst.clone();
        }

        let old_pos = self.pos;
        while self.pos < content_size && rep.content[self.pos] != b'\n' {
            self.pos += 1;
        }
        self.line_start = old_pos;
        self.line_end = self.pos;
        if self.pos < content_size {
            self.pos += 1;
        }

        let old_cur = self.cur_col_trans;
        self.cur_col_trans += 1;
        while self.cur_col_trans < col_trans.len() && col_trans[self.cur_col_trans].position > 0 {
            self.cur_col_trans += 1;
        }
        self.col_translations.clear();
        self.col_translations
            .extend_from_slice(&col_trans[old_cur..self.cur_col_trans]);

        self.line_no = if self.cur_col_trans < col_trans.len() {
            col_trans[self.cur_col_trans].line_no
        } else {
            col_trans[0].line_no
        };
        if self.source_trans_index + 1 < rep.source_translations.len() {
            let next = &rep.source_translations[self.source_trans_index + 1];
            if next.line_no == self.content_line_no {
                self.macro_subst = next.macro_subst.clone();
                self.source_trans_index += 1;
                self.source =
                    Source::repetition(next.source.clone(), self.repeat_count, rep.repeats_num);
            }
        }
        self.content_line_no += 1;
        Some((
            &self.repeat.content[self.line_start..self.line_end],
            &self.col_translations,
        ))
    }
}

impl InputFilter for RepeatInputFilter {
    fn read_line(
        &mut self,
        _sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<(&[u8], &[LineTrans])>, InputError> {
        Ok(self.next_line())
    }

    fn col_translations(&self) -> &[LineTrans] {
        &self.col_translations
    }

    fn source(&self) -> &SourceRef {
        &self.source
    }

    fn macro_subst(&self) -> Option<&MacroSubstRef> {
        self.macro_subst.as_ref()
    }

    fn line_no(&self) -> u64 {
        self.line_no
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Repeat
    }
}

/// Replays a recorded body once per list element (`.irp`) or string
/// character (`.irpc`), substituting the bound symbol.
pub struct IrpInputFilter {
    irp: Rc<IrpDef>,
    repeat_count: u64,
    content_line_no: u64,
    source_trans_index: usize,
    cur_col_trans: usize,
    pos: usize,
    line_no: u64,
    real_line_pos: i64,
    source: SourceRef,
    macro_subst: Option<MacroSubstRef>,
    buffer: Vec<u8>,
    col_translations: Vec<LineTrans>,
}

impl IrpInputFilter {
    pub fn new(irp: Rc<IrpDef>) -> IrpInputFilter {
        let (inner, macro_subst) = match irp.base.source_translations.first() {
            Some(t) => (t.source.clone(), t.macro_subst.clone()),
            None => (irp.base.pos.source.clone(), None),
        };
        let source = Source::repetition(inner, 0, irp.base.repeats_num);
        let line_no = irp
            .base
            .col_translations
            .first()
            .map(|t| t.line_no)
            .unwrap_or(0);
        let real_line_pos = irp
            .base
            .col_translations
            .first()
            .map(|t| -(t.position as i64))
            .unwrap_or(0);
        IrpInputFilter {
            irp,
            repeat_count: 0,
            content_line_no: 0,
            source_trans_index: 0,
            cur_col_trans: 0,
            pos: 0,
            line_no,
            real_line_pos,
            source,
            macro_subst,
            buffer: Vec::with_capacity(300),
            col_translations: Vec::new(),
        }
    }

    fn next_line(&mut self) -> Option<(&[u8], &[LineTrans])> {
        self.buffer.clear();
        self.col_translations.clear();
        let irp = Rc::clone(&self.irp);
        let base = &irp.base;
        let col_trans = &base.col_translations;
        let content = &base.content;
        let content_size = content.len();
        if self.pos == content_size {
            self.repeat_count += 1;
            if self.repeat_count == base.repeats_num || content_size == 0 {
                return None;
            }
            self.source_trans_index = 0;
            self.cur_col_trans = 0;
            self.line_no = col_trans[0].line_no;
            self.real_line_pos = -(col_trans[0].position as i64);
            self.pos = 0;
            self.content_line_no = 0;
            self.source = Source::repetition(
                base.source_translations[0].source.clone(),
                self.repeat_count,
                base.repeats_num,
            );
            self.macro_subst = base.source_translations[0].macro_subst.clone();
        }

        let symbol = irp.symbol.as_bytes();
        let sym_value: &Text = if !irp.irpc {
            &irp.values[self.repeat_count as usize]
        } else {
            &irp.values[0]
        };

        let mut next_line_pos = self.pos;
        while next_line_pos < content_size && content[next_line_pos] != b'\n' {
            next_line_pos += 1;
        }

        let line_pos = self.pos;
        let mut dest_pos = 0usize;
        let mut to_copy_pos = self.pos;
        let mut dest_line_start = 0usize;
        self.col_translations.push(LineTrans {
            position: -(self.real_line_pos as isize),
            line_no: col_trans[self.cur_col_trans].line_no,
        });
        let mut threshold =
            col_trans_threshold(col_trans, self.cur_col_trans, line_pos, next_line_pos);

        while self.pos < content_size && content[self.pos] != b'\n' {
            if self.pos >= threshold {
                self.cur_col_trans += 1;
                self.col_translations.push(LineTrans {
                    position: (dest_pos + self.pos - to_copy_pos) as isize,
                    line_no: col_trans[self.cur_col_trans].line_no,
                });
                if col_trans[self.cur_col_trans].position >= 0 {
                    self.real_line_pos = 0;
                    dest_line_start = dest_pos + self.pos - to_copy_pos;
                }
                threshold =
                    col_trans_threshold(col_trans, self.cur_col_trans, line_pos, next_line_pos);
            }
            if content[self.pos] != b'\\' {
                self.pos += 1;
                continue;
            }

            if self.pos > to_copy_pos {
                self.buffer.extend_from_slice(&content[to_copy_pos..self.pos]);
                dest_pos += self.pos - to_copy_pos;
            }
            self.pos += 1;
            let mut skip_col_trans = true;
            if self.pos < content_size {
                if content[self.pos] == b'('
                    && self.pos + 1 < content_size
                    && content[self.pos + 1] == b')'
                {
                    self.pos += 2;
                } else {
                    let sym = extract_sym_name(&content[self.pos..]);
                    if sym == symbol {
                        if !irp.irpc {
                            self.buffer.extend_from_slice(sym_value.as_bytes());
                            dest_pos += sym_value.len();
                        } else if !sym_value.is_empty() {
                            self.buffer
                                .push(sym_value.as_bytes()[self.repeat_count as usize]);
                            dest_pos += 1;
                        }
                        self.pos += sym.len();
                    } else {
                        self.buffer.push(b'\\');
                        dest_pos += 1;
                        skip_col_trans = false;
                    }
                }
            }
            to_copy_pos = self.pos;
            if skip_col_trans {
                while self.pos > threshold {
                    self.cur_col_trans += 1;
                    if col_trans[self.cur_col_trans].position >= 0 {
                        self.real_line_pos = 0;
                        dest_line_start = dest_pos + self.pos - to_copy_pos;
                    }
                    threshold = raw_threshold(col_trans, self.cur_col_trans);
                }
            }
        }
        if self.pos > to_copy_pos {
            self.buffer.extend_from_slice(&content[to_copy_pos..self.pos]);
        }

        let line_size = self.buffer.len();
        if self.pos < content_size {
            if self.cur_col_trans != col_trans.len() {
                self.cur_col_trans += 1;
                if self.cur_col_trans != col_trans.len() {
                    if col_trans[self.cur_col_trans].position >= 0 {
                        self.real_line_pos = 0;
                    } else {
                        self.real_line_pos += (line_size - dest_line_start + 1) as i64;
                    }
                }
            }
            self.pos += 1;
        }
        self.line_no = if self.cur_col_trans < col_trans.len() {
            col_trans[self.cur_col_trans].line_no
        } else {
            col_trans[0].line_no
        };

        if self.source_trans_index + 1 < base.source_translations.len() {
            let next = &base.source_translations[self.source_trans_index + 1];
            if next.line_no == self.content_line_no {
                self.macro_subst = next.macro_subst.clone();
                self.source_trans_index += 1;
                self.source =
                    Source::repetition(next.source.clone(), self.repeat_count, base.repeats_num);
            }
        }
        self.content_line_no += 1;
        Some((&self.buffer, &self.col_translations))
    }
}

impl InputFilter for IrpInputFilter {
    fn read_line(
        &mut self,
        _sink: &mut dyn DiagnosticSink,
    ) -> Result<Option<(&[u8], &[LineTrans])>, InputError> {
        Ok(self.next_line())
    }

    fn col_translations(&self) -> &[LineTrans] {
        &self.col_translations
    }

    fn source(&self) -> &SourceRef {
        &self.source
    }

    fn macro_subst(&self) -> Option<&MacroSubstRef> {
        self.macro_subst.as_ref()
    }

    fn line_no(&self) -> u64 {
        self.line_no
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Repeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{diagnostics::Diagnostics, source::translate_pos};

    fn body_pos() -> SourcePos {
        SourcePos::new(None, Source::top_level_file("m.s"), 1, 1)
    }

    fn simple_trans(line_no: u64) -> Vec<LineTrans> {
        vec![LineTrans {
            position: 0,
            line_no,
        }]
    }

    fn drain(filter: &mut dyn InputFilter) -> Vec<String> {
        let mut sink = Diagnostics::new();
        let mut out = Vec::new();
        while let Some((line, _)) = filter.read_line(&mut sink).unwrap() {
            out.push(String::from_utf8_lossy(line).into_owned());
        }
        out
    }

    fn macro_with_body(args: Vec<MacroArg>, lines: &[(&str, u64)]) -> MacroDef {
        let mut def = MacroDef::new(body_pos(), args);
        let src = Source::top_level_file("m.s");
        for (line, line_no) in lines {
            def.add_line(None, &src, &simple_trans(*line_no), line.as_bytes());
        }
        def
    }

    #[test]
    fn substitutes_arguments_and_the_invocation_counter() {
        let def = macro_with_body(
            vec![MacroArg {
                name: "x".into(),
                def_value: None,
            }],
            &[("mov \\x, \\@", 2)],
        );
        let arg_map = MacroArgMap::from_pairs(vec![("x".into(), "r5".into())]);
        let mut filter = MacroInputFilter::new(Rc::new(def), &body_pos(), arg_map, 7);

        assert_eq!(drain(&mut filter), ["mov r5, 7"]);
    }

    #[test]
    fn unknown_references_stay_verbatim() {
        let def = macro_with_body(Vec::new(), &[("jmp \\nowhere", 2)]);
        let mut filter =
            MacroInputFilter::new(Rc::new(def), &body_pos(), MacroArgMap::default(), 0);

        assert_eq!(drain(&mut filter), ["jmp \\nowhere"]);
    }

    #[test]
    fn separator_splits_name_from_following_text() {
        let def = macro_with_body(
            vec![MacroArg {
                name: "n".into(),
                def_value: None,
            }],
            &[("lab\\n\\()x:", 2)],
        );
        let arg_map = MacroArgMap::from_pairs(vec![("n".into(), "5".into())]);
        let mut filter = MacroInputFilter::new(Rc::new(def), &body_pos(), arg_map, 0);

        assert_eq!(drain(&mut filter), ["lab5x:"]);
    }

    #[test]
    fn argument_name_scan_is_greedy() {
        // `\xy` must not match argument `x`
        let def = macro_with_body(
            vec![MacroArg {
                name: "x".into(),
                def_value: None,
            }],
            &[("mov \\xy", 2)],
        );
        let arg_map = MacroArgMap::from_pairs(vec![("x".into(), "r5".into())]);
        let mut filter = MacroInputFilter::new(Rc::new(def), &body_pos(), arg_map, 0);

        assert_eq!(drain(&mut filter), ["mov \\xy"]);
    }

    #[test]
    fn expansion_is_deterministic() {
        let make = || {
            let def = macro_with_body(
                vec![MacroArg {
                    name: "a".into(),
                    def_value: None,
                }],
                &[("add \\a, \\a", 2), ("sub \\a, 1", 3)],
            );
            let arg_map = MacroArgMap::from_pairs(vec![("a".into(), "v[3:4]".into())]);
            MacroInputFilter::new(Rc::new(def), &body_pos(), arg_map, 1)
        };
        assert_eq!(drain(&mut make()), drain(&mut make()));
    }

    #[test]
    fn columns_resolve_into_the_body_after_substitution() {
        let def = macro_with_body(
            vec![MacroArg {
                name: "val".into(),
                def_value: None,
            }],
            &[("or \\val, r1", 4)],
        );
        let arg_map = MacroArgMap::from_pairs(vec![("val".into(), "r20".into())]);
        let mut filter = MacroInputFilter::new(Rc::new(def), &body_pos(), arg_map, 0);
        let mut sink = Diagnostics::new();
        let (line, trans) = filter.read_line(&mut sink).unwrap().unwrap();
        assert_eq!(line, b"or r20, r1");
        // the leading "or " is untouched body text
        let lc = translate_pos(trans, 0);
        assert_eq!((lc.line_no, lc.col_no), (4, 1));
    }

    #[test]
    fn repeat_replays_body_with_iteration_sources() {
        let mut def = RepeatDef::new(body_pos(), 3);
        let src = Source::top_level_file("r.s");
        def.add_line(None, &src, &simple_trans(2), b"inc r0");
        let mut filter = RepeatInputFilter::new(Rc::new(def));
        let mut sink = Diagnostics::new();

        for iteration in 0..3u64 {
            let (line, _) = filter.read_line(&mut sink).unwrap().unwrap();
            assert_eq!(line, b"inc r0");
            match &**filter.source() {
                Source::Repeat(rep) => {
                    assert_eq!(rep.iteration, iteration);
                    assert_eq!(rep.total, 3);
                }
                other => panic!("expected a repetition source, got {other:?}"),
            }
        }
        assert!(filter.read_line(&mut sink).unwrap().is_none());
    }

    #[test]
    fn irp_substitutes_each_list_element() {
        let mut def = IrpDef::new_list(
            body_pos(),
            "reg".into(),
            vec!["r2".into(), "r3".into(), "r4".into()],
        );
        let src = Source::top_level_file("i.s");
        def.add_line(None, &src, &simple_trans(2), b"push \\reg");
        let mut filter = IrpInputFilter::new(Rc::new(def));

        assert_eq!(drain(&mut filter), ["push r2", "push r3", "push r4"]);
    }

    #[test]
    fn irpc_substitutes_each_character() {
        let mut def = IrpDef::new_chars(body_pos(), "c".into(), "xyz".into());
        let src = Source::top_level_file("i.s");
        def.add_line(None, &src, &simple_trans(2), b"flag_\\c = 1");
        let mut filter = IrpInputFilter::new(Rc::new(def));

        assert_eq!(drain(&mut filter), ["flag_x = 1", "flag_y = 1", "flag_z = 1"]);
    }

    #[test]
    fn irpc_over_empty_string_runs_once() {
        let mut def = IrpDef::new_chars(body_pos(), "c".into(), "".into());
        let src = Source::top_level_file("i.s");
        def.add_line(None, &src, &simple_trans(2), b"marker\\c");
        let mut filter = IrpInputFilter::new(Rc::new(def));

        assert_eq!(drain(&mut filter), ["marker"]);
    }

    #[test]
    fn recorder_coalesces_source_runs() {
        let mut def = MacroDef::new(body_pos(), Vec::new());
        let a = Source::top_level_file("a.s");
        let b = Source::top_level_file("b.s");
        def.add_line(None, &a, &simple_trans(1), b"one");
        def.add_line(None, &a, &simple_trans(2), b"two");
        def.add_line(None, &b, &simple_trans(1), b"three");
        assert_eq!(def.source_translations.len(), 2);
        assert_eq!(def.source_translations[0].line_no, 0);
        assert_eq!(def.source_translations[1].line_no, 2);
    }

    #[test]
    fn recorder_distinguishes_invocation_stacks() {
        let mut def = MacroDef::new(body_pos(), Vec::new());
        let src = Source::top_level_file("a.s");
        let subst1 = MacroSubst::new(&SourcePos::new(None, src.clone(), 1, 1));
        let subst2 = MacroSubst::new(&SourcePos::new(None, src.clone(), 9, 1));
        def.add_line(Some(&subst1), &src, &simple_trans(1), b"one");
        def.add_line(Some(&subst1), &src, &simple_trans(2), b"two");
        def.add_line(Some(&subst2), &src, &simple_trans(3), b"three");
        assert_eq!(def.source_translations.len(), 2);
    }
}
