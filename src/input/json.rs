//! Incremental JSON-to-markup reader, doubling as the format detector.
//!
//! The reader consumes the stream character by character, buffering what
//! it reads while the input could still turn out to be XML or a log. The
//! first significant token decides: `<` switches to XML, `[` followed by
//! a date-shaped value switches to log, `{` or any other `[` commits to
//! JSON, and anything else (or a decode error) falls through to the
//! log/CSV detectors with the buffered prefix replayed.
//!
//! Objects nest named tags, arrays repeat the member name per element,
//! and an `_attr` object becomes XML attributes on its parent tag.

use std::io::BufRead;

use crate::input::xmlwrite::XmlWriter;

/// What one top-level read produced.
#[derive(Debug)]
pub enum ReadOutcome {
    /// One complete JSON value was written to the writer.
    Value,
    Eof,
    /// The stream is XML; the prefix read so far must be replayed.
    SwitchXml(String),
    /// The stream looks like a log; the prefix must be replayed.
    SwitchLog(String),
    /// Not JSON (or broken JSON); try log, then CSV, with the prefix.
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
    LessThan,
    Comma,
    Colon,
    Str,
    Value,
    Linefeed,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    ReadColon,
    ReadValue,
}

enum JErr {
    /// Unexpected EOF, illegal control byte, or an unexpected token.
    Decode(String),
}

type JResult<T> = std::result::Result<T, JErr>;

pub struct JsonReader {
    top_tag: String,
    possibly_xml: bool,
    possibly_log: bool,
    back_buffer: String,
    pushback: Option<u8>,
    unget_tokens: Vec<(Tok, String)>,
    char_count: usize,
    line_count: usize,
}

impl JsonReader {
    pub fn new(top_tag: &str) -> Self {
        JsonReader {
            top_tag: top_tag.to_string(),
            possibly_xml: true,
            possibly_log: true,
            back_buffer: String::new(),
            pushback: None,
            unget_tokens: Vec::new(),
            char_count: 0,
            line_count: 1,
        }
    }

    /// Read one top-level value, writing its markup into `writer`.
    pub fn read_value(
        &mut self,
        rdr: &mut dyn BufRead,
        writer: &mut XmlWriter,
    ) -> ReadOutcome {
        match self.read_top(rdr, writer) {
            Ok(outcome) => outcome,
            Err(JErr::Decode(_)) => ReadOutcome::Fail(self.take_prefix()),
        }
    }

    /// The consumed-but-unprocessed prefix to replay into the next
    /// detector, including any pushed-back byte.
    fn take_prefix(&mut self) -> String {
        let mut prefix = std::mem::take(&mut self.back_buffer);
        if let Some(b) = self.pushback.take() {
            prefix.push(b as char);
        }
        prefix
    }

    fn read_top(&mut self, rdr: &mut dyn BufRead, writer: &mut XmlWriter) -> JResult<ReadOutcome> {
        loop {
            let (token, value) = self.next_token(rdr)?;
            match token {
                Tok::OpenBrace => {
                    self.possibly_xml = false;
                    self.possibly_log = false;
                    let top = self.top_tag.clone();
                    self.parse_object(rdr, writer, &top, false)?;
                    return Ok(ReadOutcome::Value);
                }

                Tok::OpenBracket => {
                    if !self.possibly_log {
                        return Err(self.unexpected("read_top", token, &value));
                    }
                    let (mut tok, mut val) = self.next_token(rdr)?;
                    while tok == Tok::Linefeed {
                        (tok, val) = self.next_token(rdr)?;
                    }
                    if looks_like_date(&val) {
                        // Something like [2015-10-10 ... : a log4j-style log.
                        return Ok(ReadOutcome::SwitchLog(self.take_prefix()));
                    }
                    // A top-level (unnamed) array.
                    self.unget_tokens.push((tok, val));
                    self.possibly_xml = false;
                    self.possibly_log = false;
                    let top = if self.top_tag.is_empty() {
                        "arr".to_string()
                    } else {
                        self.top_tag.clone()
                    };
                    writer.push_tag(&top);
                    self.parse_array(rdr, writer, "row")?;
                    writer.pop_tag();
                    return Ok(ReadOutcome::Value);
                }

                Tok::LessThan => {
                    if !self.possibly_xml {
                        return Err(self.unexpected("read_top", token, &value));
                    }
                    return Ok(ReadOutcome::SwitchXml(self.take_prefix()));
                }

                Tok::Eof => return Ok(ReadOutcome::Eof),
                Tok::Linefeed => {}

                _ => return Err(self.unexpected("read_top", token, &value)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Character input

    fn getch(&mut self, rdr: &mut dyn BufRead) -> JResult<Option<u8>> {
        loop {
            let b = match self.pushback.take() {
                Some(b) => Some(b),
                None => {
                    let mut byte = [0u8; 1];
                    match rdr.read(&mut byte) {
                        Ok(0) => None,
                        Ok(_) => Some(byte[0]),
                        Err(e) => return Err(JErr::Decode(e.to_string())),
                    }
                }
            };
            let Some(b) = b else { return Ok(None) };
            if self.possibly_xml || self.possibly_log {
                self.back_buffer.push(b as char);
            }
            self.char_count += 1;
            if b == b'\n' {
                self.line_count += 1;
            }
            if b == b'\r' {
                continue; // ignore
            }
            if b < 0x10 && b != b'\n' {
                // JSON disallows control characters; this detects
                // truncated or binary input.
                return Err(JErr::Decode(format!("illegal character 0x{:02x}", b)));
            }
            return Ok(Some(b));
        }
    }

    fn ungetch(&mut self, b: u8) {
        self.pushback = Some(b);
        if (self.possibly_xml || self.possibly_log) && !self.back_buffer.is_empty() {
            self.back_buffer.pop();
        }
    }

    // ------------------------------------------------------------------
    // Tokens

    fn next_token(&mut self, rdr: &mut dyn BufRead) -> JResult<(Tok, String)> {
        if let Some(t) = self.unget_tokens.pop() {
            return Ok(t);
        }
        loop {
            let Some(b) = self.getch(rdr)? else {
                return Ok((Tok::Eof, String::new()));
            };
            match b {
                b' ' => continue,
                b'{' => return Ok((Tok::OpenBrace, String::new())),
                b'}' => return Ok((Tok::CloseBrace, String::new())),
                b'<' => return Ok((Tok::LessThan, String::new())),
                b':' => return Ok((Tok::Colon, String::new())),
                b',' => return Ok((Tok::Comma, String::new())),
                b'[' => return Ok((Tok::OpenBracket, String::new())),
                b']' => return Ok((Tok::CloseBracket, String::new())),
                b'"' | b'\'' => {
                    let s = self.read_string(rdr, b)?;
                    return Ok((Tok::Str, s));
                }
                b'\n' => return Ok((Tok::Linefeed, String::new())),
                b if b < 32 => continue,
                b => {
                    let s = self.read_bare_value(rdr, b)?;
                    return Ok((Tok::Value, s));
                }
            }
        }
    }

    fn read_string(&mut self, rdr: &mut dyn BufRead, quote: u8) -> JResult<String> {
        let mut s = String::new();
        let mut escaped = false;
        loop {
            let Some(b) = self.getch(rdr)? else {
                return Err(JErr::Decode("unexpected EOF in string".to_string()));
            };
            match b {
                b'"' | b'\'' => {
                    if b == quote && !escaped {
                        return Ok(s);
                    }
                    s.push(b as char);
                }
                b'r' => s.push(if escaped { '\r' } else { 'r' }),
                b'n' => s.push(if escaped { '\n' } else { 'n' }),
                b't' => s.push(if escaped { '\t' } else { 't' }),
                b'\\' => {
                    if escaped {
                        s.push('\\');
                        escaped = false;
                    } else {
                        escaped = true;
                    }
                    continue;
                }
                b => {
                    if escaped {
                        s.push('\\');
                    }
                    s.push(b as char);
                }
            }
            escaped = false;
        }
    }

    fn read_bare_value(&mut self, rdr: &mut dyn BufRead, initial: u8) -> JResult<String> {
        let mut s = String::new();
        s.push(initial as char);
        loop {
            let Some(b) = self.getch(rdr)? else {
                return Ok(s);
            };
            match b {
                b'\n' | b' ' | b',' | b'}' | b']' | b':' => {
                    self.ungetch(b);
                    return Ok(s);
                }
                b'\\' => continue,
                b => s.push(b as char),
            }
        }
    }

    fn unexpected(&self, function: &str, token: Tok, value: &str) -> JErr {
        JErr::Decode(format!(
            "Unexpected token: char={}, line={}, function={}, token={:?}({})",
            self.char_count, self.line_count, function, token, value
        ))
    }

    // ------------------------------------------------------------------
    // Structure

    fn parse_object(
        &mut self,
        rdr: &mut dyn BufRead,
        writer: &mut XmlWriter,
        first_name: &str,
        leave_tag_open: bool,
    ) -> JResult<()> {
        let mut state = State::Start;
        let mut opened = false;
        let mut name = first_name.to_string();
        let mut get_attributes = false;

        loop {
            let (token, value) = self.next_token(rdr)?;
            match token {
                Tok::Str | Tok::Value => match state {
                    // Non-JSON {x: value} identifiers are accepted as names.
                    State::Start => {
                        if !name.is_empty() && value == "_attr" && !get_attributes {
                            get_attributes = true;
                        } else {
                            if !name.is_empty() {
                                if opened {
                                    writer.pop_tag();
                                }
                                writer.push_tag(&make_tag(&name));
                                opened = true;
                            }
                            name = value;
                        }
                        state = State::ReadColon;
                    }
                    State::ReadValue => {
                        get_attributes = false; // e.g. _attr: 1 instead of _attr: {...}
                        writer.add_data(&make_tag(&name), &value);
                        name.clear();
                        state = State::Start;
                    }
                    _ => return Err(self.unexpected("parse_object", token, &value)),
                },

                Tok::Colon => {
                    if state != State::ReadColon {
                        return Err(self.unexpected("parse_object", token, &value));
                    }
                    state = State::ReadValue;
                }

                Tok::OpenBrace => {
                    if state != State::ReadValue {
                        return Err(self.unexpected("parse_object", token, &value));
                    }
                    if get_attributes {
                        let attributes = self.parse_attributes(rdr)?;
                        if opened {
                            writer.pop_tag();
                        }
                        writer.push_tag_with_attributes(&make_tag(&name), &attributes);
                        opened = true;
                        get_attributes = false;
                    } else {
                        self.parse_object(rdr, writer, &name, leave_tag_open)?;
                    }
                    name.clear();
                    state = State::Start;
                }

                Tok::OpenBracket => {
                    if state != State::ReadValue {
                        return Err(self.unexpected("parse_object", token, &value));
                    }
                    get_attributes = false;
                    let member = name.clone();
                    self.parse_array(rdr, writer, &member)?;
                    name.clear();
                    state = State::Start;
                }

                Tok::Comma => {
                    if state != State::Start {
                        return Err(self.unexpected("parse_object", token, &value));
                    }
                }

                Tok::CloseBrace => {
                    if state != State::Start {
                        return Err(self.unexpected("parse_object", token, &value));
                    }
                    if !name.is_empty() {
                        // No members were read; emit the tag with no content.
                        if opened {
                            writer.pop_tag();
                        }
                        writer.push_tag(&make_tag(&name));
                        opened = true;
                    }
                    break;
                }

                Tok::Linefeed => {}

                Tok::Eof => return Err(JErr::Decode("unexpected EOF".to_string())),

                _ => return Err(self.unexpected("parse_object", token, &value)),
            }
        }

        if opened && !leave_tag_open {
            writer.pop_tag();
        }
        Ok(())
    }

    fn parse_attributes(&mut self, rdr: &mut dyn BufRead) -> JResult<String> {
        let mut state = State::Start;
        let mut accum = String::new();
        let mut name = String::new();
        loop {
            let (token, value) = self.next_token(rdr)?;
            match token {
                Tok::Str | Tok::Value => match state {
                    State::Start => {
                        name = value;
                        state = State::ReadColon;
                    }
                    State::ReadValue => {
                        if value.contains('"') {
                            return Err(self.unexpected("parse_attributes", token, &value));
                        }
                        accum.push_str(&format!(" {}=\"{}\"", name, value));
                        state = State::Start;
                    }
                    _ => return Err(self.unexpected("parse_attributes", token, &value)),
                },
                Tok::Colon => {
                    if state != State::ReadColon {
                        return Err(self.unexpected("parse_attributes", token, &value));
                    }
                    state = State::ReadValue;
                }
                Tok::Comma => {
                    if state != State::Start {
                        return Err(self.unexpected("parse_attributes", token, &value));
                    }
                }
                Tok::CloseBrace => {
                    if state != State::Start {
                        return Err(self.unexpected("parse_attributes", token, &value));
                    }
                    return Ok(accum);
                }
                Tok::Linefeed => {}
                Tok::Eof => return Err(JErr::Decode("unexpected EOF".to_string())),
                _ => return Err(self.unexpected("parse_attributes", token, &value)),
            }
        }
    }

    /// Arrays become repeated tags, the way XML repeats element names.
    fn parse_array(
        &mut self,
        rdr: &mut dyn BufRead,
        writer: &mut XmlWriter,
        repeated_name: &str,
    ) -> JResult<()> {
        let mut element_number = 0usize;
        loop {
            let elt = if repeated_name.is_empty() {
                element_number.to_string()
            } else {
                make_tag(repeated_name)
            };
            let (token, value) = self.next_token(rdr)?;
            match token {
                Tok::Value | Tok::Str => {
                    writer.add_data(&make_tag(&elt), &value);
                    element_number += 1;
                }
                Tok::OpenBrace => {
                    self.parse_object(rdr, writer, &elt, false)?;
                    element_number += 1;
                }
                Tok::OpenBracket => {
                    writer.push_tag(&elt);
                    element_number += 1;
                    self.parse_array(rdr, writer, "")?;
                    writer.pop_tag();
                }
                Tok::CloseBracket => break,
                Tok::Comma | Tok::Linefeed => {}
                Tok::Eof => return Err(JErr::Decode("unexpected EOF".to_string())),
                _ => return Err(self.unexpected("parse_array", token, &value)),
            }
        }
        Ok(())
    }
}

/// Parse a balanced embedded JSON object out of a byte slice (log
/// messages). Returns false when the slice is not valid JSON.
pub fn parse_embedded(bytes: &[u8], writer: &mut XmlWriter, leave_outer_open: bool) -> bool {
    let mut rdr = std::io::Cursor::new(bytes);
    let mut reader = JsonReader::new("");
    reader.possibly_xml = false;
    reader.possibly_log = false;
    // The slice must begin with an object.
    match reader.next_token(&mut rdr) {
        Ok((Tok::OpenBrace, _)) => {}
        _ => return false,
    }
    reader
        .parse_object(&mut rdr, writer, "", leave_outer_open)
        .is_ok()
}

fn make_tag(s: &str) -> String {
    // Deal with markup-hostile leading characters.
    if s.starts_with(['<', '/', '!', '?']) {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

fn looks_like_date(value: &str) -> bool {
    let parts: Vec<&str> = value.splitn(3, '-').collect();
    parts.len() == 3
        && parts[0].chars().next().is_some_and(|c| c.is_ascii_digit())
        && parts
            .iter()
            .all(|p| p.chars().next().is_some_and(|c| c.is_ascii_digit()))
}
