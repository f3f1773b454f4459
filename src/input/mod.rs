//! Input unification: auto-detect the format and pump the stream into
//! the engine as one stream of tag events.
//!
//! Detection order is JSON → XML → log → CSV. The JSON reader doubles as
//! the detector; whatever prefix it consumed before deciding is replayed
//! into the winning parser.

pub mod csv;
pub mod json;
pub mod log;
pub mod xmlwrite;

use std::io::{BufRead, Read};

use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use json::{JsonReader, ReadOutcome};
use xmlwrite::XmlWriter;

/// Read one line, tolerating LF, CR, and CRLF endings. Returns false only
/// at end of input with nothing read.
pub fn get_line(rdr: &mut dyn BufRead, line: &mut String) -> std::io::Result<bool> {
    line.clear();
    let mut read_any = false;
    loop {
        let mut byte = [0u8; 1];
        let n = rdr.read(&mut byte)?;
        if n == 0 {
            return Ok(read_any);
        }
        read_any = true;
        match byte[0] {
            b'\n' => return Ok(true),
            b'\r' => {
                // Consume a following LF if present.
                let buf = rdr.fill_buf()?;
                if buf.first() == Some(&b'\n') {
                    rdr.consume(1);
                }
                return Ok(true);
            }
            b => line.push(b as char),
        }
    }
}

/// Drive the whole input stream through the engine.
pub fn pump(engine: &mut Engine<'_>, rdr: &mut dyn BufRead, input_header: bool) -> Result<()> {
    let mut writer = XmlWriter::new();
    let mut json = JsonReader::new("json");
    loop {
        match json.read_value(rdr, &mut writer) {
            ReadOutcome::Value => {
                engine.feed_str(&writer.take())?;
                if engine.parse_stopped() {
                    return Ok(());
                }
            }
            ReadOutcome::Eof => {
                engine.feed_str(&writer.take())?;
                engine.finish()?;
                return Ok(());
            }
            ReadOutcome::SwitchXml(prefix) => {
                debug!("input detected as xml");
                engine.feed_str(&prefix)?;
                let mut buf = [0u8; 65536];
                loop {
                    let n = rdr.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    engine.feed(&buf[..n])?;
                    if engine.parse_stopped() {
                        break;
                    }
                }
                engine.finish()?;
                return Ok(());
            }
            ReadOutcome::SwitchLog(prefix) | ReadOutcome::Fail(prefix) => {
                return run_log_then_csv(prefix, rdr, engine, input_header);
            }
        }
    }
}

fn run_log_then_csv(
    prefix: String,
    rdr: &mut dyn BufRead,
    engine: &mut Engine<'_>,
    input_header: bool,
) -> Result<()> {
    // Replay the detector's prefix ahead of the remaining stream.
    let mut chained = std::io::Cursor::new(prefix.into_bytes()).chain(rdr);
    match log::run(&mut chained, engine)? {
        log::LogOutcome::Parsed => Ok(()),
        log::LogOutcome::NotLog(back_lines) => {
            if csv::run(back_lines, &mut chained, engine, input_header)? {
                Ok(())
            } else {
                Err(Error::input(
                    "Input not recognized as json, xml, csv/tsv, or log",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_line_endings() {
        let mut rdr = std::io::Cursor::new(b"a\nb\r\nc\rd".to_vec());
        let mut line = String::new();
        assert!(get_line(&mut rdr, &mut line).unwrap());
        assert_eq!(line, "a");
        assert!(get_line(&mut rdr, &mut line).unwrap());
        assert_eq!(line, "b");
        assert!(get_line(&mut rdr, &mut line).unwrap());
        assert_eq!(line, "c");
        assert!(get_line(&mut rdr, &mut line).unwrap());
        assert_eq!(line, "d");
        assert!(!get_line(&mut rdr, &mut line).unwrap());
    }
}
