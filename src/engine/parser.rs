//! The streaming tag scanner and pass state.
//!
//! [`Engine::feed`] is push-based: callers hand it byte chunks (from a
//! file, stdin, or a format unifier synthesizing markup) and it scans
//! complete tags, drives the matcher, and lets the row engine emit rows.
//! Unconsumed bytes are carried between feeds; a single tag longer than
//! the buffer bound is fatal.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::debug;

use crate::engine::context::{Context, PassType};
use crate::engine::executor::{RowCallback, RowEngine};
use crate::engine::matcher::{MatchType, Matcher};
use crate::engine::path::PathMatcher;
use crate::engine::rows::IndexedRows;
use crate::error::{Error, Result};
use crate::query::spec::{spec_flags, QuerySpec};
use crate::text;

/// Bound on a single tag, including attributes.
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Sink for echoed input when no output columns are defined.
pub type EchoCallback<'a> = Box<dyn FnMut(&[u8]) + 'a>;

pub struct Engine<'a> {
    spec: Rc<RefCell<QuerySpec>>,
    ctx: Rc<RefCell<Context>>,
    pub query: RowEngine<'a>,
    matcher: Matcher,
    buf: Vec<u8>,
    found_root: bool,
    echo: Option<EchoCallback<'a>>,
}

impl<'a> Engine<'a> {
    pub fn new(spec: Rc<RefCell<QuerySpec>>, cancel: Arc<AtomicBool>) -> Self {
        let ctx = Rc::new(RefCell::new(Context::new(cancel)));
        let query = RowEngine::new(ctx.clone(), spec.clone());
        let matcher = Matcher::new(ctx.clone(), Vec::new());
        Engine {
            spec,
            ctx,
            query,
            matcher,
            buf: Vec::new(),
            found_root: true,
            echo: None,
        }
    }

    pub fn context(&self) -> Rc<RefCell<Context>> {
        self.ctx.clone()
    }

    pub fn spec(&self) -> Rc<RefCell<QuerySpec>> {
        self.spec.clone()
    }

    pub fn set_row_callback(&mut self, callback: RowCallback<'a>) {
        self.query.set_row_callback(callback);
    }

    pub fn set_indexed_join(&mut self, indexed_join: IndexedRows) {
        self.query.set_indexed_join(indexed_join);
    }

    /// Echo raw input to the callback (used when the query defines no
    /// output columns).
    pub fn set_echo(&mut self, echo: EchoCallback<'a>) {
        self.echo = Some(echo);
    }

    /// The pass plan: a gather pass only for jagged pivots, a main pass
    /// always, a stored-values pass unless the query streams.
    pub fn pass_types(&self) -> Vec<PassType> {
        let mut passes = Vec::new();
        if self.spec.borrow().is_flag_set(spec_flags::GATHER_DATA_PASS_REQUIRED)
            || self.query.pivoter.require_prepass()
        {
            passes.push(PassType::GatherData);
        }
        passes.push(PassType::Main);
        if !self.spec.borrow().streaming() {
            passes.push(PassType::StoredValues);
        }
        passes
    }

    /// Rebind path matchers and reset all per-pass state. The query spec
    /// itself is not re-parsed.
    pub fn reset(&mut self, pass: PassType) {
        debug!(?pass, "pass reset");
        let last_pass = *self.pass_types().last().expect("at least one pass");

        self.buf.clear();
        self.found_root = self.spec.borrow().root_node_num == 0;

        let paths: Vec<PathMatcher> = self
            .spec
            .borrow()
            .input
            .path_refs
            .values()
            .map(|path_ref| PathMatcher::new(path_ref.clone()))
            .collect();

        {
            let mut ctx = self.ctx.borrow_mut();
            ctx.reset(pass);
            ctx.case_sensitive = self.spec.borrow().case_sensitive;
        }
        self.matcher = Matcher::new(self.ctx.clone(), paths);
        self.query.reset(pass, last_pass);
    }

    pub fn output_stored_rows(&mut self) {
        self.query.output_stored_rows();
    }

    /// Fatal if any path or declared pivot column never matched.
    pub fn check_unreferenced(&self) -> Result<()> {
        self.matcher.check_unreferenced()?;
        self.query.check_unreferenced()
    }

    pub fn parse_stopped(&self) -> bool {
        self.query.parse_stopped()
    }

    pub fn feed_str(&mut self, s: &str) -> Result<()> {
        self.feed(s.as_bytes())
    }

    /// Consume a chunk of markup. Tags split across chunks are carried
    /// until complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.query.parse_stopped() {
            return Ok(());
        }
        self.buf.extend_from_slice(bytes);
        self.scan_available()
    }

    /// Flush any trailing text after the final tag.
    pub fn finish(&mut self) -> Result<()> {
        if !self.buf.is_empty() && !self.query.parse_stopped() {
            let text = std::mem::take(&mut self.buf);
            self.redirect(&text, true);
            self.count_lines(&text);
        }
        self.buf.clear();
        Ok(())
    }

    fn scan_available(&mut self) -> Result<()> {
        let mut pos = 0;
        loop {
            if self.query.parse_stopped() {
                self.buf.clear();
                return Ok(());
            }

            let Some(lt) = find_byte(&self.buf, pos, b'<') else {
                // All text; flush it and wait for more.
                let text = self.buf[pos..].to_vec();
                self.redirect(&text, true);
                self.count_lines(&text);
                self.buf.clear();
                return Ok(());
            };

            if lt > pos {
                let text = self.buf[pos..lt].to_vec();
                self.redirect(&text, true);
                self.count_lines(&text);
            }

            let Some(gt) = find_byte(&self.buf, lt + 1, b'>') else {
                // Incomplete tag; keep it for the next feed.
                if self.buf.len() - lt > DEFAULT_BUFFER_SIZE {
                    return Err(Error::input(format!(
                        "Either input is not an XML file or an XML tag exceeds {} characters",
                        DEFAULT_BUFFER_SIZE
                    )));
                }
                self.buf.drain(..lt);
                return Ok(());
            };

            let tag = self.buf[lt..=gt].to_vec();
            self.count_lines(&tag);
            self.process_tag(&tag)?;
            pos = gt + 1;
            if pos >= self.buf.len() {
                self.buf.clear();
                return Ok(());
            }
        }
    }

    fn process_tag(&mut self, tag: &[u8]) -> Result<()> {
        // Strip the brackets and surrounding whitespace.
        let mut label = &tag[1..tag.len() - 1];
        while !label.is_empty() && is_tag_space(label[0]) {
            label = &label[1..];
        }
        while !label.is_empty() && is_tag_space(label[label.len() - 1]) {
            label = &label[..label.len() - 1];
        }
        if label.is_empty() {
            return Err(Error::input(format!(
                "Invalid XML tag: {}",
                String::from_utf8_lossy(tag)
            )));
        }

        // Processing instructions and comments are skipped.
        if label[0] == b'?' || label[0] == b'!' {
            self.echo_bytes(tag);
            return Ok(());
        }

        let self_terminating = label[label.len() - 1] == b'/';
        if self_terminating {
            label = &label[..label.len() - 1];
            while !label.is_empty() && is_tag_space(label[label.len() - 1]) {
                label = &label[..label.len() - 1];
            }
        }
        if label.is_empty() {
            return Err(Error::input(format!(
                "Invalid XML tag: {}",
                String::from_utf8_lossy(tag)
            )));
        }

        let attributes_used = self
            .spec
            .borrow()
            .is_flag_set(spec_flags::ATTRIBUTES_USED);

        let end_tag = label[0] == b'/';
        if end_tag {
            if attributes_used {
                self.pop_attributes();
            }
            self.handle_end_tag(&label[1..], tag)?;
            self.echo_bytes(tag);
            return Ok(());
        }

        // Attributes are present when a quote appears in the tag.
        let has_attributes = label.iter().any(|&b| b == b'"' || b == b'\'');

        let mut name: Vec<u8> = label.to_vec();
        if has_attributes {
            let words = text::split(&String::from_utf8_lossy(label), " ", "\"", false);
            if attributes_used {
                let mut attr_cnt = 0;
                for word in words.iter().skip(1) {
                    let pieces = text::split(word, "=", "\"", false);
                    if pieces.len() != 2 {
                        return Err(Error::input(format!(
                            "Invalid XML tag: {}",
                            String::from_utf8_lossy(tag)
                        )));
                    }
                    let attr_name = pieces[0].clone();
                    let value = &pieces[1];
                    let quoted = (value.starts_with('"') && value.ends_with('"'))
                        || (value.starts_with('\'') && value.ends_with('\''));
                    if !quoted || value.len() < 2 {
                        return Err(Error::input(format!(
                            "Invalid XML tag: {}",
                            String::from_utf8_lossy(tag)
                        )));
                    }
                    let trimmed = value[1..value.len() - 1].to_string();
                    self.ctx.borrow_mut().attr_stack.push((attr_name, trimmed));
                    attr_cnt += 1;
                }
                self.ctx.borrow_mut().attr_count_stack.push(attr_cnt);
            }
            if let Some(first) = words.first() {
                name = first.as_bytes().to_vec();
            }
        } else if attributes_used {
            self.ctx.borrow_mut().attr_count_stack.push(0);
        }

        self.handle_start_tag(&name, tag)?;

        if self_terminating {
            if attributes_used {
                self.pop_attributes();
            }
            self.handle_end_tag(&name, tag)?;
        }

        self.echo_bytes(tag);
        Ok(())
    }

    fn handle_start_tag(&mut self, name: &[u8], raw_tag: &[u8]) -> Result<()> {
        let root_node_num = self.spec.borrow().root_node_num;
        let num_nodes = {
            let mut ctx = self.ctx.borrow_mut();
            ctx.num_nodes += 1;
            ctx.num_nodes
        };
        if root_node_num != 0 && !self.found_root && num_nodes == root_node_num {
            self.found_root = true;
        }
        if !self.found_root {
            return Ok(());
        }

        self.ctx.borrow_mut().curr_depth += 1;

        if self
            .spec
            .borrow()
            .is_flag_set(spec_flags::NODE_STACK_REQUIRED)
        {
            let num_nodes = self.ctx.borrow().num_nodes;
            self.ctx.borrow_mut().node_stack.push(
                crate::engine::context::NodeInfo {
                    name: String::from_utf8_lossy(name).into_owned(),
                    node_start: num_nodes,
                },
            );
        }

        if self.ctx.borrow().appending_values {
            self.redirect(raw_tag, false);
            self.ctx.borrow_mut().appending_values = false;
        }

        self.matcher.match_start_tag(name);
        Ok(())
    }

    fn handle_end_tag(&mut self, name: &[u8], raw_tag: &[u8]) -> Result<()> {
        if !self.found_root {
            return Ok(());
        }

        let root_node_num = self.spec.borrow().root_node_num;
        let depth_now = {
            let mut ctx = self.ctx.borrow_mut();
            ctx.curr_depth -= 1;
            ctx.curr_depth
        };
        if depth_now == 0 && root_node_num != 0 {
            self.found_root = false;
            self.query.stop_parse();
        }

        self.query.on_end_tag();

        self.ctx.borrow_mut().appending_values = false;

        let matched_end_tag = self.matcher.match_end_tag(name);

        if self.ctx.borrow().appending_values {
            self.redirect(raw_tag, false);
        }

        if matched_end_tag && self.matcher.match_type() == MatchType::AllMatched {
            self.matcher.commit_match();
            self.query.emit_row();
        }

        if self
            .spec
            .borrow()
            .is_flag_set(spec_flags::NODE_STACK_REQUIRED)
        {
            self.ctx.borrow_mut().node_stack.pop();
        }

        if self.ctx.borrow().cancelled() {
            self.query.stop_parse();
        }
        Ok(())
    }

    fn pop_attributes(&mut self) {
        let mut ctx = self.ctx.borrow_mut();
        if let Some(cnt) = ctx.attr_count_stack.pop() {
            for _ in 0..cnt {
                ctx.attr_stack.pop();
            }
        }
    }

    /// Send bytes to the matched-value accumulators (and echo text).
    fn redirect(&mut self, bytes: &[u8], echo: bool) {
        if self.ctx.borrow().appending_values || !echo {
            let s = String::from_utf8_lossy(bytes);
            for path in &mut self.matcher.paths {
                path.append_value(&s);
            }
        }
        if echo {
            self.echo_bytes(bytes);
        }
    }

    fn echo_bytes(&mut self, bytes: &[u8]) {
        if let Some(echo) = &mut self.echo {
            echo(bytes);
        }
    }

    fn count_lines(&mut self, bytes: &[u8]) {
        if !self
            .spec
            .borrow()
            .is_flag_set(spec_flags::LINE_NUM_USED)
        {
            return;
        }
        let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
        if newlines > 0 {
            self.ctx.borrow_mut().num_lines += newlines;
        }
    }
}

fn find_byte(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from.min(haystack.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
}

fn is_tag_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_query;
    use crate::value::Value;

    fn engine_for(args: &[&str]) -> Engine<'static> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let parsed = parse_query(&args).expect("parse");
        let mut engine = Engine::new(parsed.spec, Arc::new(AtomicBool::new(false)));
        if let Some((column, names)) = parsed.pivot_binding {
            engine
                .query
                .pivoter
                .bind_columns(column, &names)
                .expect("bind pivot");
        }
        engine
    }

    fn run_collect(args: &[&str], input: &str) -> Vec<Vec<String>> {
        let rows: Rc<RefCell<Vec<Vec<String>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = rows.clone();
        let mut engine = engine_for(args);
        engine.set_row_callback(Box::new(move |row: &[Value], repeat| {
            for _ in 0..repeat {
                sink.borrow_mut()
                    .push(row.iter().map(|v| v.to_display(0, 10)).collect());
            }
        }));
        for pass in engine.pass_types() {
            engine.reset(pass);
            match pass {
                PassType::StoredValues => engine.output_stored_rows(),
                _ => {
                    engine.feed_str(input).expect("feed");
                    engine.finish().expect("finish");
                    engine.check_unreferenced().expect("all paths matched");
                }
            }
        }
        let out = rows.borrow().clone();
        out
    }

    #[test]
    fn test_simple_projection() {
        let rows = run_collect(
            &["name", "age"],
            "<people><p><name>ann</name><age>3</age></p>\
             <p><name>bob</name><age>5</age></p></people>",
        );
        assert_eq!(rows, vec![vec!["ann", "3"], vec!["bob", "5"]]);
    }

    #[test]
    fn test_split_feeds() {
        let input = "<r><a>1</a></r><r><a>2</a></r>";
        let rows: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = rows.clone();
        let mut engine = engine_for(&["a"]);
        engine.set_row_callback(Box::new(move |row: &[Value], _| {
            sink.borrow_mut().push(row[0].to_display(0, 10));
        }));
        engine.reset(PassType::Main);
        // Feed byte-by-byte to exercise tag reassembly.
        for b in input.as_bytes() {
            engine.feed(&[*b]).expect("feed");
        }
        engine.finish().expect("finish");
        assert_eq!(rows.borrow().clone(), vec!["1", "2"]);
    }

    #[test]
    fn test_self_terminating_with_attributes() {
        let rows = run_collect(
            &["x:item..id"],
            "<list><item id=\"a\"/><item id=\"b\"/></list>",
        );
        assert_eq!(rows, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_pi_and_comments_skipped() {
        let rows = run_collect(
            &["a"],
            "<?xml version=\"1.0\"?><!-- note --><r><a>ok</a></r>",
        );
        assert_eq!(rows, vec![vec!["ok"]]);
    }

    #[test]
    fn test_first_n_stops() {
        let rows = run_collect(
            &["a", "first[2]"],
            "<r><a>1</a></r><r><a>2</a></r><r><a>3</a></r>",
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_where_filter() {
        let rows = run_collect(
            &["a", "where[a==\"keep\"]"],
            "<r><a>drop</a></r><r><a>keep</a></r><r><a>drop</a></r>",
        );
        assert_eq!(rows, vec![vec!["keep"]]);
    }

    #[test]
    fn test_aggregation() {
        let rows = run_collect(
            &["k", "total:sum[v]"],
            "<r><k>x</k><v>1</v></r><r><k>x</k><v>2</v></r><r><k>y</k><v>5</v></r>",
        );
        assert_eq!(rows, vec![vec!["x", "3.0"], vec!["y", "5.0"]]);
    }

    #[test]
    fn test_distinct() {
        let rows = run_collect(
            &["a", "--distinct"],
            "<r><a>x</a></r><r><a>x</a></r><r><a>y</a></r>",
        );
        assert_eq!(rows, vec![vec!["x"], vec!["y"]]);
    }

    #[test]
    fn test_sort_and_top() {
        let rows = run_collect(
            &["a", "sort[a]", "top[2]"],
            "<r><a>c</a></r><r><a>a</a></r><r><a>b</a></r>",
        );
        assert_eq!(rows, vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_sort_descending_string() {
        let rows = run_collect(
            &["a", "sort[-a]"],
            "<r><a>b</a></r><r><a>c</a></r><r><a>a</a></r>",
        );
        assert_eq!(rows, vec![vec!["c"], vec!["b"], vec!["a"]]);
    }

    #[test]
    fn test_numeric_sort_negation() {
        let rows = run_collect(
            &["n", "sort[-int[n]]"],
            "<r><n>2</n></r><r><n>10</n></r><r><n>5</n></r>",
        );
        assert_eq!(rows, vec![vec!["10"], vec!["5"], vec!["2"]]);
    }

    #[test]
    fn test_nested_value_capture() {
        let rows = run_collect(
            &["b"],
            "<r><b>plain</b></r>",
        );
        assert_eq!(rows, vec![vec!["plain"]]);
    }

    #[test]
    fn test_unmatched_path_is_fatal() {
        let mut engine = engine_for(&["nosuch"]);
        engine.reset(PassType::Main);
        engine.feed_str("<r><a>1</a></r>").unwrap();
        engine.finish().unwrap();
        assert!(engine.check_unreferenced().is_err());
    }

    #[test]
    fn test_root_directive() {
        // root[2]: activate at the second start tag, stop at its close.
        let rows = run_collect(
            &["a", "root[2]"],
            "<top><sub><a>in</a></sub><a>out</a></top>",
        );
        assert_eq!(rows, vec![vec!["in"]]);
    }

    #[test]
    fn test_tag_too_long() {
        let mut engine = engine_for(&["a"]);
        engine.reset(PassType::Main);
        let huge = format!("<{}", "x".repeat(DEFAULT_BUFFER_SIZE + 2));
        assert!(engine.feed_str(&huge).is_err());
    }

    #[test]
    fn test_rownum() {
        let rows = run_collect(
            &["a", "n:rownum[]"],
            "<r><a>x</a></r><r><a>y</a></r>",
        );
        assert_eq!(rows, vec![vec!["x", "1"], vec!["y", "2"]]);
    }

    #[test]
    fn test_pivot_end_to_end() {
        // Repeated ItemData children pivot into one row per record.
        let rows = run_collect(
            &["id", "A,B:pivot[ItemData..ItemOid,ItemData..value]"],
            "<recs>\
               <rec><id>1</id><ItemData ItemOid=\"A\" value=\"10\"/>\
                    <ItemData ItemOid=\"B\" value=\"20\"/></rec>\
               <rec><id>2</id><ItemData ItemOid=\"A\" value=\"30\"/>\
                    <ItemData ItemOid=\"B\" value=\"40\"/></rec>\
             </recs>",
        );
        assert_eq!(
            rows,
            vec![
                vec!["1", "10", "20"],
                vec!["2", "30", "40"],
            ]
        );
    }
}
