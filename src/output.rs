//! CSV emission.
//!
//! The header row lists Output column names in declaration order. Every
//! cell is rendered by type (precision-10 reals with trailing zeros
//! trimmed, `YYYY-MM-DD[ HH:MM:SS[.ffff]]` date-times, `true`/`false`
//! booleans), unescaped, and CSV-quoted when needed.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::query::spec::QuerySpec;
use crate::text;
use crate::value::{flags as value_flags, Value, DEFAULT_PRECISION};

pub struct RowPrinter<'o> {
    out: Rc<RefCell<&'o mut dyn Write>>,
    spec: Rc<RefCell<QuerySpec>>,
    header_pending: bool,
}

impl<'o> RowPrinter<'o> {
    pub fn new(out: Rc<RefCell<&'o mut dyn Write>>, spec: Rc<RefCell<QuerySpec>>) -> Self {
        let header_pending = spec.borrow().output.header;
        RowPrinter {
            out,
            spec,
            header_pending,
        }
    }

    /// Print one output row (`repeat` times). Write failures are ignored,
    /// as befits a filter writing to a possibly closed pipe.
    pub fn print(&mut self, row: &[Value], repeat: usize) {
        let spec = self.spec.borrow();
        let mut out = self.out.borrow_mut();

        if self.header_pending {
            let mut first = true;
            for column in &spec.columns {
                let col = column.borrow();
                if !col.is_output() {
                    continue;
                }
                if !first {
                    let _ = out.write_all(b",");
                }
                first = false;
                let _ = out.write_all(text::format_for_csv(&col.name).as_bytes());
            }
            let _ = out.write_all(b"\n");
            self.header_pending = false;
        }

        for _ in 0..repeat {
            let mut first = true;
            for column in &spec.columns {
                let col = column.borrow();
                if !col.is_output() {
                    continue;
                }
                let value_idx = col.value_idx.expect("output column has slot");
                let rendered = row
                    .get(value_idx)
                    .map(|v| v.to_display(value_flags::SUBSECOND_TIMES, DEFAULT_PRECISION))
                    .unwrap_or_default();
                if !first {
                    let _ = out.write_all(b",");
                }
                first = false;
                let _ = out.write_all(text::format_for_csv(&rendered).as_bytes());
            }
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse_query;

    fn printer_output(args: &[&str], rows: &[Vec<Value>]) -> String {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let parsed = parse_query(&args).expect("parse");
        let mut buf: Vec<u8> = Vec::new();
        {
            let sink: Rc<RefCell<&mut dyn Write>> = Rc::new(RefCell::new(&mut buf));
            let mut printer = RowPrinter::new(sink, parsed.spec.clone());
            for row in rows {
                printer.print(row, 1);
            }
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_header_and_rows() {
        let out = printer_output(
            &["name:a", "n:int[b]"],
            &[
                vec![Value::Str("x".into()), Value::Int(1)],
                vec![Value::Str("y".into()), Value::Int(2)],
            ],
        );
        assert_eq!(out, "name,n\nx,1\ny,2\n");
    }

    #[test]
    fn test_no_header() {
        let out = printer_output(
            &["name:a", "--outheader=false"],
            &[vec![Value::Str("x".into())]],
        );
        assert_eq!(out, "x\n");
    }

    #[test]
    fn test_cells_quoted() {
        let out = printer_output(
            &["name:a", "--outheader=false"],
            &[vec![Value::Str("a,b".into())]],
        );
        assert_eq!(out, "\"a,b\"\n");
    }

    #[test]
    fn test_entities_unescaped() {
        let out = printer_output(
            &["name:a", "--outheader=false"],
            &[vec![Value::Str("1 &lt; 2".into())]],
        );
        assert_eq!(out, "1 < 2\n");
    }

    #[test]
    fn test_real_precision() {
        let out = printer_output(
            &["v:real[a]", "--outheader=false"],
            &[vec![Value::Real(2.5)], vec![Value::Real(3.0)]],
        );
        assert_eq!(out, "2.5\n3.0\n");
    }

    #[test]
    fn test_boolean_rendering() {
        let out = printer_output(
            &["v:bool[a]", "--outheader=false"],
            &[vec![Value::Bool(true)], vec![Value::Bool(false)]],
        );
        assert_eq!(out, "true\nfalse\n");
    }
}
