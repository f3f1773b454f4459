//! Log-line input: timestamp/level/category/message records.
//!
//! A line whose leading fields parse as a date (or date + time) starts a
//! record; other lines continue the previous record's message. `TRACE
//! START`/`TRACE END` records open and close a grouping tag built from
//! the START message's embedded JSON; `TRACE ROOT` closes everything. A
//! balanced `{...}` (optionally `label:{...}`) inside a message is parsed
//! as embedded JSON and removed from the message text.

use std::collections::VecDeque;
use std::io::BufRead;

use tracing::debug;

use crate::engine::Engine;
use crate::error::Result;
use crate::input::json;
use crate::input::xmlwrite::XmlWriter;
use crate::input::get_line;
use crate::text;
use crate::value::DateTime;

pub enum LogOutcome {
    Parsed,
    /// Not a log; the lines consumed while deciding, for the CSV parser.
    NotLog(VecDeque<String>),
}

/// Split one line into its tentative record fields. `None` when the line
/// does not start a record.
pub fn parse_log_line(line: &str) -> Option<(DateTime, String, String, String)> {
    let (parts, positions) = text::split_with_positions(line, " []", "", false);
    let num_parts = parts.len();
    let starts_digit = |i: usize| {
        parts
            .get(i)
            .and_then(|p: &String| p.bytes().next())
            .is_some_and(|b| b.is_ascii_digit())
    };

    let mut curr = 0;
    let mut dt = DateTime::error_value();
    if num_parts == 1 && starts_digit(0) {
        dt = DateTime::from_string(&parts[0], "");
        curr = 1;
    } else if num_parts >= 2 {
        if starts_digit(0) && !starts_digit(1) {
            dt = DateTime::from_string(&parts[0], "");
            curr = 1;
        } else if starts_digit(0) && starts_digit(1) {
            dt = DateTime::from_string(&parts[0], &parts[1]);
            curr = 2;
        }
    }
    if dt.error {
        return None;
    }

    let level = if curr < num_parts {
        let l = parts[curr].clone();
        curr += 1;
        l
    } else {
        String::new()
    };

    // Categories are separated from the message by " - ".
    let category = if curr + 1 < num_parts && parts[curr + 1] == "-" {
        let c = parts[curr].clone();
        curr += 2;
        c
    } else {
        String::new()
    };

    let msg = if curr < num_parts {
        line[positions[curr]..].to_string()
    } else {
        String::new()
    };

    Some((dt, level, category, msg))
}

/// Parse the stream (with any detector prefix already chained in front)
/// as a log, emitting one `<log>` record per entry.
pub fn run(rdr: &mut dyn BufRead, engine: &mut Engine<'_>) -> Result<LogOutcome> {
    let mut writer = XmlWriter::new();
    let mut open_group_depths: Vec<usize> = Vec::new();
    let mut back_lines: VecDeque<String> = VecDeque::new();

    // Seek the first log line, allowing a few leading non-log lines.
    let mut next: Option<(DateTime, String, String, String)> = None;
    let mut line = String::new();
    let mut lines_to_seek = 10;
    while lines_to_seek > 0 {
        lines_to_seek -= 1;
        if !get_line(rdr, &mut line)? {
            break;
        }
        if let Some(parsed) = parse_log_line(&line) {
            next = Some(parsed);
            break;
        }
        back_lines.push_back(line.clone());
    }
    if next.is_none() || lines_to_seek == 0 {
        return Ok(LogOutcome::NotLog(back_lines));
    }
    debug!("input detected as log");

    while let Some((dt, level, category, mut msg)) = next.take() {
        // Append continuation lines until the next record starts.
        loop {
            if !get_line(rdr, &mut line)? {
                break;
            }
            if let Some(parsed) = parse_log_line(&line) {
                next = Some(parsed);
                break;
            }
            msg.push('\n');
            msg.push_str(&line);
        }

        let mut handled = false;
        if level == "TRACE" {
            match category.as_str() {
                "START" => {
                    let depth_before = writer.open_depth();
                    extract_embedded_json(&mut msg, &mut writer, true);
                    open_group_depths.push(depth_before);
                    handled = true;
                }
                "END" => {
                    if let Some(depth) = open_group_depths.pop() {
                        while writer.open_depth() > depth {
                            writer.pop_tag();
                        }
                    }
                    handled = true;
                }
                "ROOT" => {
                    // Safeguard for unbalanced START/END: return to zero
                    // depth.
                    open_group_depths.clear();
                    writer.pop_all();
                    handled = true;
                }
                _ => {}
            }
        }

        if !handled {
            writer.push_tag("log");
            writer.add_data("time", &dt.to_display(true));
            writer.add_data("level", &level);
            writer.add_data("category", &category);
            extract_embedded_json(&mut msg, &mut writer, false);
            let escaped = msg.replace('\\', "\\\\");
            writer.add_data("msg", text::trim_whitespace(&escaped));
            writer.pop_tag();
        }

        engine.feed_str(&writer.take())?;
        if engine.parse_stopped() {
            return Ok(LogOutcome::Parsed);
        }
    }

    writer.pop_all();
    engine.feed_str(&writer.take())?;
    engine.finish()?;
    Ok(LogOutcome::Parsed)
}

/// Find a balanced `{...}` (with optional `label:` prefix) in the
/// message, parse it as JSON into the writer, and remove it from the
/// message. Invalid or absent JSON leaves the message untouched.
fn extract_embedded_json(msg: &mut String, writer: &mut XmlWriter, leave_outer_open: bool) {
    let bytes = msg.as_bytes();
    let mut depth = 0i32;
    let mut beg: Option<usize> = None;
    let mut end: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'{' {
            if depth == 0 {
                beg = Some(i);
            }
            depth += 1;
        } else if b == b'}' {
            if depth == 0 {
                return; // brace out of order
            }
            depth -= 1;
            if depth == 0 {
                end = Some(i);
                break;
            }
        }
    }
    let (Some(mut beg), Some(end)) = (beg, end) else {
        return;
    };

    // An identifier and colon preceding the object, like foo:{a:1}, wraps
    // the expression as {foo:{a:1}}.
    let mut label = String::new();
    {
        let mut found_colon = false;
        let mut in_label = false;
        let mut end_label = 0usize;
        let mut pos = beg as i64 - 1;
        while pos >= 0 {
            let b = bytes[pos as usize];
            if b == b':' {
                if found_colon {
                    break;
                }
                found_colon = true;
            } else if b.is_ascii_alphanumeric() || b == b'_' {
                if !in_label {
                    if !found_colon {
                        break; // no label, which is fine
                    }
                    in_label = true;
                    end_label = pos as usize;
                }
            } else if in_label {
                break;
            } else if !b.is_ascii_whitespace() {
                break;
            }
            pos -= 1;
        }
        if in_label {
            let label_start = (pos + 1) as usize;
            label = msg[label_start..=end_label].to_string();
            beg = label_start;
        }
    }

    let span = msg[beg..=end].to_string();
    let reformed = if label.is_empty() {
        span.clone()
    } else {
        format!("{{{}}}", span)
    };

    if json::parse_embedded(reformed.as_bytes(), writer, leave_outer_open) {
        msg.replace_range(beg..=end, "");
    }
}
