//! CSV/TSV input: each record becomes `<table><row><Name>v</Name>...`.
//!
//! The delimiter is TAB when the first line has two or more TAB-separated
//! fields, comma otherwise. Quoted fields absorb delimiters and newlines;
//! a backslash escapes the byte after it. With a header, the first line
//! names the columns; otherwise (and for extra fields) positional names
//! are invented.

use std::collections::VecDeque;
use std::io::BufRead;

use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::input::get_line;
use crate::input::xmlwrite::XmlWriter;
use crate::text;

fn parse_csv_line(line: &str, delimiter: &str) -> Vec<String> {
    text::split(line, delimiter, "\"", true)
        .iter()
        .map(|field| text::unquote(field))
        .collect()
}

/// Returns false when there is no input at all (the caller reports the
/// unrecognized-format error).
pub fn run(
    mut back_lines: VecDeque<String>,
    rdr: &mut dyn BufRead,
    engine: &mut Engine<'_>,
    header: bool,
) -> Result<bool> {
    let mut writer = XmlWriter::new();

    let mut next_line = |line: &mut String| -> Result<bool> {
        if let Some(l) = back_lines.pop_front() {
            *line = l;
            return Ok(true);
        }
        Ok(get_line(rdr, line)?)
    };

    let mut first_line = String::new();
    if !next_line(&mut first_line)? {
        return Ok(false);
    }
    text::trim_trailing(&mut first_line);

    let mut delimiter = "\t";
    let mut first_line_parts = parse_csv_line(&first_line, delimiter);
    if first_line_parts.len() < 2 {
        delimiter = ",";
        first_line_parts = parse_csv_line(&first_line, delimiter);
    }
    debug!(
        delimiter = if delimiter == "\t" { "tab" } else { "comma" },
        header, "input detected as csv"
    );

    let mut field_names: Vec<String> = Vec::new();
    if header {
        field_names = first_line_parts;
        for name in &mut field_names {
            // Markup-hostile field names are quoted; control separators
            // become underscores.
            if name.starts_with(['<', '/', '!', '?']) {
                *name = format!("\"{}\"", name);
            }
            *name = name.replace(['\t', '\n', '\r'], "_");
        }
        first_line.clear();
    }

    writer.push_tag("table");
    let mut line = String::new();
    loop {
        // Assemble one logical record, joining lines while inside quotes.
        line.clear();
        let mut line_part = String::new();
        let mut eof = false;
        let mut in_quotes = false;
        loop {
            if !first_line.is_empty() {
                line_part = std::mem::take(&mut first_line);
            } else if !next_line(&mut line_part)? {
                eof = true;
                break;
            }
            let bytes = line_part.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'\\' {
                    i += 1;
                } else if bytes[i] == b'"' {
                    in_quotes = !in_quotes;
                }
                i += 1;
            }
            line.push_str(&line_part);
            if in_quotes {
                line.push('\n');
            } else {
                break;
            }
        }
        if eof {
            break;
        }
        text::trim_trailing(&mut line);
        let values = parse_csv_line(&line, delimiter);

        writer.push_tag("row");
        for i in 0..field_names.len().max(values.len()) {
            if i == field_names.len() {
                // Invent a positional name (also for excess values),
                // prefixing underscores until unique.
                let mut name = (i + 1).to_string();
                while field_names.contains(&name) {
                    name = format!("_{}", name);
                }
                field_names.push(name);
            }
            if i < values.len() {
                writer.add_data(&field_names[i], &values[i]);
            } else {
                writer.add_data(&field_names[i], "");
            }
        }
        writer.pop_tag();

        engine.feed_str(&writer.take())?;
        if engine.parse_stopped() {
            return Ok(true);
        }
    }

    writer.pop_tag();
    engine.feed_str(&writer.take())?;
    engine.finish()?;
    Ok(true)
}
