//! Top-level orchestration: argument expansion, join-side loading, pass
//! sequencing, and output wiring.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::engine::context::PassType;
use crate::engine::rows::{hash_values, IndexedRows, Row};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::input;
use crate::output::RowPrinter;
use crate::query::spec::{spec_flags, QuerySpec};
use crate::query::{parse_query, ParsedQuery};
use crate::text;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    /// The query asked for the usage banner.
    Usage,
}

/// Expand `@file` / `file@` argument-inclusion tokens recursively. File
/// contents split on whitespace; unquoted `#` starts a comment.
pub fn expand_args(raw: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    expand_into(&mut out, raw)?;
    Ok(out)
}

fn expand_into(out: &mut Vec<String>, args: &[String]) -> Result<()> {
    for arg in args {
        if arg.starts_with('@') || arg.ends_with('@') {
            let file = if let Some(stripped) = arg.strip_prefix('@') {
                stripped
            } else {
                &arg[..arg.len() - 1]
            };
            if file.is_empty() {
                return Err(Error::parse("Missing argument-inclusion filename after @"));
            }
            let f = File::open(file).map_err(|_| {
                Error::lookup(format!(
                    "Argument-inclusion filename could not be opened: {}",
                    file
                ))
            })?;
            let mut rdr = BufReader::new(f);
            let mut line = String::new();
            while input::get_line(&mut rdr, &mut line)? {
                // Truncate at an unquoted comment character.
                let uncommented = text::split(&line, "#", "{\"'", true);
                if let Some(head) = uncommented.first() {
                    let tokens: Vec<String> = text::split_simple(head, " ")
                        .into_iter()
                        .filter(|t| !t.is_empty())
                        .collect();
                    expand_into(out, &tokens)?;
                }
            }
        } else {
            out.push(arg.clone());
        }
    }
    Ok(())
}

/// Run a query against its configured input, writing CSV to `out`.
pub fn run(
    raw_args: &[String],
    out: &mut dyn Write,
    cancel: Arc<AtomicBool>,
) -> Result<RunOutcome> {
    let args = expand_args(raw_args)?;
    let parsed = parse_query(&args)?;
    if parsed.spec.borrow().is_flag_set(spec_flags::SHOW_USAGE) {
        return Ok(RunOutcome::Usage);
    }
    run_parsed(parsed, out, cancel)
}

fn run_parsed(
    parsed: ParsedQuery,
    out: &mut dyn Write,
    cancel: Arc<AtomicBool>,
) -> Result<RunOutcome> {
    let spec = parsed.spec;
    let mut engine = Engine::new(spec.clone(), cancel.clone());
    if let Some((pivot_column, names)) = parsed.pivot_binding {
        engine.query.pivoter.bind_columns(pivot_column, &names)?;
    }

    if spec.borrow().is_flag_set(spec_flags::LEFT_SIDE_OF_JOIN) {
        let indexed = load_indexed_join(&spec, cancel.clone())?;
        engine.set_indexed_join(indexed);
    }

    let sink: Rc<RefCell<&mut dyn Write>> = Rc::new(RefCell::new(out));

    let echo_mode = {
        let s = spec.borrow();
        s.num_value_columns() == 0 && !s.is_flag_set(spec_flags::HAS_PIVOT)
    };
    if echo_mode {
        // No output columns: echo the input markup through.
        let echo_sink = sink.clone();
        engine.set_echo(Box::new(move |bytes| {
            let _ = echo_sink.borrow_mut().write_all(bytes);
        }));
    } else {
        let mut printer = RowPrinter::new(sink.clone(), spec.clone());
        engine.set_row_callback(Box::new(move |row, repeat| {
            printer.print(row, repeat);
        }));
    }

    do_passes(&mut engine, &spec, &cancel)?;
    Ok(RunOutcome::Done)
}

fn do_passes(
    engine: &mut Engine<'_>,
    spec: &Rc<RefCell<QuerySpec>>,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    use std::sync::atomic::Ordering;
    let header = spec.borrow().input.header;
    for pass in engine.pass_types() {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        engine.reset(pass);
        match pass {
            PassType::GatherData => {
                let mut rdr = open_input(spec, true)?;
                input::pump(engine, &mut rdr, header)?;
                engine.check_unreferenced()?;
            }
            PassType::Main => {
                let mut rdr = open_input(spec, false)?;
                input::pump(engine, &mut rdr, header)?;
                engine.check_unreferenced()?;
            }
            PassType::StoredValues => {
                engine.output_stored_rows();
            }
            PassType::NotSet => {}
        }
    }
    Ok(())
}

fn open_input(spec: &Rc<RefCell<QuerySpec>>, disallow_stdin: bool) -> Result<Box<dyn BufRead>> {
    let filename = spec.borrow().input.filename.clone();
    if !filename.is_empty() {
        let f = File::open(&filename)
            .map_err(|_| Error::lookup(format!("Input file could not be opened: {}", filename)))?;
        return Ok(Box::new(BufReader::new(f)));
    }
    if disallow_stdin {
        return Err(Error::runtime(
            "Given query requires two passes, so stdin cannot be used as an input",
        ));
    }
    Ok(Box::new(BufReader::new(std::io::stdin())))
}

/// Load the right side of the join: run a second query spec built from
/// the recorded join pieces and hash its rows on the Indexed columns.
fn load_indexed_join(
    spec: &Rc<RefCell<QuerySpec>>,
    cancel: Arc<AtomicBool>,
) -> Result<IndexedRows> {
    let right = Rc::new(RefCell::new(QuerySpec::new()));
    {
        let main = spec.borrow();
        let mut r = right.borrow_mut();
        if main.join.columns.is_empty() {
            return Err(Error::parse("Missing joined path references"));
        }
        r.input.header = main.join.header;
        r.input.filename = main.join.filename.clone();
        r.input.path_refs = main.join.path_refs.clone();
        r.case_sensitive = main.case_sensitive;
        r.flags |= main.join.flags | spec_flags::RIGHT_SIDE_OF_JOIN;
        for column in &main.join.columns {
            let col = column.clone();
            r.insert_column(col, None);
        }
        r.flags |= spec_flags::COLUMNS_ADDED;
    }

    // Column indices are assigned now, so the Indexed positions are known.
    let indices = spec.borrow().indexed_join_columns();

    let buckets: Rc<RefCell<IndexMap<u64, Vec<Row>>>> = Rc::new(RefCell::new(IndexMap::new()));
    {
        let mut engine = Engine::new(right.clone(), cancel);
        let sink = buckets.clone();
        let key_indices = indices.clone();
        engine.set_row_callback(Box::new(move |row: &[Value], _repeat| {
            // Hash on the equality columns; false positives are fine since
            // the where filter rechecks values.
            let key: Vec<Value> = key_indices.iter().map(|&i| row[i].clone()).collect();
            let hash = hash_values(&key);
            sink.borrow_mut()
                .entry(hash)
                .or_default()
                .push(row.to_vec());
        }));

        let header = right.borrow().input.header;
        for pass in engine.pass_types() {
            engine.reset(pass);
            match pass {
                PassType::StoredValues => engine.output_stored_rows(),
                _ => {
                    let mut rdr = open_input(&right, false)?;
                    input::pump(&mut engine, &mut rdr, header)?;
                    engine.check_unreferenced()?;
                }
            }
        }
    }

    let buckets = Rc::try_unwrap(buckets)
        .map_err(|_| Error::runtime("join index still shared"))?
        .into_inner();
    let mut indexed = IndexedRows::new();
    let mut total = 0usize;
    for (hash, rows) in buckets {
        total += rows.len();
        indexed.insert(hash, Rc::new(rows));
    }
    debug!(rows = total, buckets = indexed.len(), "join index loaded");
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_string(args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        run(&args, &mut out, Arc::new(AtomicBool::new(false)))?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_usage() {
        let args = vec!["--help".to_string()];
        let mut out = Vec::new();
        let outcome = run(&args, &mut out, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(outcome, RunOutcome::Usage);
    }

    #[test]
    fn test_missing_input_file() {
        let err = run_to_string(&["--in=/nonexistent/path.csv", "a"]).unwrap_err();
        assert!(err.message().contains("could not be opened"));
    }

    #[test]
    fn test_missing_arg_file() {
        let args = vec!["@/nonexistent/args.txt".to_string()];
        let mut out = Vec::new();
        let err = run(&args, &mut out, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(err.message().contains("Argument-inclusion"));
    }

    #[test]
    fn test_bare_at_rejected() {
        let args = vec!["@".to_string()];
        let mut out = Vec::new();
        let err = run(&args, &mut out, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(err.message().contains("Missing argument-inclusion"));
    }
}
