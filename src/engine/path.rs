//! Per-path matching over the tag event stream.
//!
//! A path spec parses into a list of tag atoms. Atoms consume start tags
//! by incrementing a per-atom relative parse depth and release them on end
//! tags. A wildcard tolerates both 0+ matches (skippable when the next
//! atom matches the current tag) and 1+ matches (absorbing intermediate
//! tags). The first atom is always a wildcard, inserted if absent.

use std::cell::RefCell;

use crate::engine::context::Context;
use crate::query::eval::Evaluator;
use crate::query::expr::{path_flags, PathRefHandle};
use crate::text;

/// Shared per-row match bookkeeping across all paths.
#[derive(Debug)]
pub struct RowMatchState {
    pub match_order: i32,
    pub curr_parse_depth: i32,
    pub searching_for_end_tag_cnt: i32,
}

impl RowMatchState {
    pub fn new() -> Self {
        RowMatchState {
            match_order: 0,
            curr_parse_depth: 0,
            searching_for_end_tag_cnt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.match_order = 0;
        self.curr_parse_depth = 0;
        self.searching_for_end_tag_cnt = 0;
    }
}

impl Default for RowMatchState {
    fn default() -> Self {
        RowMatchState::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Uninitialized,
    SearchingForStartTag,
    CompletingStartTag,
    SearchingForEndTag,
    FoundEndTag,
}

pub mod pm_flags {
    pub const EXISTS_IN_INPUT: u32 = 0x1;
    pub const NO_DATA: u32 = 0x2;
    pub const SYNC: u32 = 0x4;
}

#[derive(Debug)]
struct TagAtom {
    name: String,
    wildcard: bool,
    relative_parse_depth: i32,
}

fn taglist_match_start(
    atoms: &mut [TagAtom],
    idx: usize,
    tag: &[u8],
    curr_parse_depth: i32,
    complete: &mut bool,
    cs: bool,
) -> bool {
    let last = idx + 1 == atoms.len();
    let depth = atoms[idx].relative_parse_depth;

    if depth > 0 {
        if !last {
            // Advance to the next unmatched position if it matches.
            if taglist_match_start(atoms, idx + 1, tag, curr_parse_depth - depth, complete, cs) {
                return true;
            }
            if atoms[idx].wildcard && atoms[idx + 1].relative_parse_depth == 0 {
                // Stay at this wildcard.
                if curr_parse_depth > 0 {
                    atoms[idx].relative_parse_depth += 1;
                }
                return true;
            }
        }
        return false;
    }

    // 0+ wildcard: skip it when the next atom matches the current tag.
    if atoms[idx].wildcard && !last && text::eq_fold_bytes(tag, &atoms[idx + 1].name, cs) {
        if curr_parse_depth > 0 {
            atoms[idx].relative_parse_depth += 1;
        }
        let depth = atoms[idx].relative_parse_depth;
        return taglist_match_start(atoms, idx + 1, tag, curr_parse_depth - depth, complete, cs);
    }

    // 1+ wildcard, or a literal match at the current position.
    if atoms[idx].wildcard || text::eq_fold_bytes(tag, &atoms[idx].name, cs) {
        if curr_parse_depth > 0 {
            atoms[idx].relative_parse_depth += 1;
        }
        if last {
            *complete = true;
        }
        return true;
    }
    false
}

fn taglist_match_end(atoms: &mut [TagAtom], idx: usize, tag: &[u8], cs: bool) -> bool {
    if idx + 1 < atoms.len() && atoms[idx + 1].relative_parse_depth > 0 {
        return taglist_match_end(atoms, idx + 1, tag, cs);
    }
    if atoms[idx].relative_parse_depth > 0
        && (atoms[idx].wildcard || text::eq_fold_bytes(tag, &atoms[idx].name, cs))
    {
        atoms[idx].relative_parse_depth -= 1;
        return true;
    }
    false
}

fn taglist_reset(atoms: &mut [TagAtom], idx: usize, rollback_depth: i32) {
    if rollback_depth == -1 {
        atoms[idx].relative_parse_depth = 0;
        if idx + 1 < atoms.len() {
            taglist_reset(atoms, idx + 1, -1);
        }
    } else if rollback_depth < atoms[idx].relative_parse_depth {
        atoms[idx].relative_parse_depth = rollback_depth;
        if idx + 1 < atoms.len() {
            taglist_reset(atoms, idx + 1, -1);
        }
    } else if idx + 1 < atoms.len() {
        let remaining = rollback_depth - atoms[idx].relative_parse_depth;
        taglist_reset(atoms, idx + 1, remaining);
    }
}

fn taglist_relative_depth(atoms: &[TagAtom], idx: usize, include_initial_wildcard: bool) -> i32 {
    if idx + 1 == atoms.len() {
        return 1;
    }
    let initial_wildcard = idx == 0 && atoms[idx].wildcard;
    let skip = initial_wildcard && !include_initial_wildcard;
    let own = if skip {
        0
    } else {
        atoms[idx].relative_parse_depth
    };
    own + taglist_relative_depth(atoms, idx + 1, false)
}

/// The matcher state for one path reference.
#[derive(Debug)]
pub struct PathMatcher {
    pub flags: u32,
    pub path_ref: PathRefHandle,
    tags: Vec<TagAtom>,
    pub match_state: MatchState,
    pub match_order: i32,
    mismatch_depth: i32,
}

impl PathMatcher {
    pub fn new(path_ref: PathRefHandle) -> Self {
        let (spec, ref_flags) = {
            let pr = path_ref.borrow();
            (pr.path_spec.clone(), pr.flags)
        };
        let mut tag_names = text::split(&spec, ".", "{}", false);
        if tag_names.first().map(|t| t.as_str()) != Some("*") {
            tag_names.insert(0, "*".to_string());
        }
        let tags = tag_names
            .into_iter()
            .map(|mut name| {
                let wildcard = name == "*";
                if name.starts_with('{') && name.ends_with('}') {
                    name = name[1..name.len() - 1].to_string();
                }
                TagAtom {
                    name,
                    wildcard,
                    relative_parse_depth: 0,
                }
            })
            .collect();

        let mut flags = 0;
        if ref_flags & path_flags::NO_DATA != 0 {
            flags |= pm_flags::NO_DATA;
        }
        if ref_flags & path_flags::SYNC != 0 {
            flags |= pm_flags::SYNC;
        }

        PathMatcher {
            flags,
            path_ref,
            tags,
            match_state: MatchState::Uninitialized,
            match_order: -1,
            mismatch_depth: 0,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn match_start_tag(
        &mut self,
        tag: &[u8],
        row: &mut RowMatchState,
        ctx: &RefCell<Context>,
    ) -> bool {
        if self.match_state == MatchState::FoundEndTag
            || self.match_state == MatchState::SearchingForEndTag
        {
            return false;
        }

        let cs = ctx.borrow().case_sensitive;
        let mut complete = false;
        if self.mismatch_depth > 0 {
            self.mismatch_depth += 1;
            return false;
        }
        if !taglist_match_start(
            &mut self.tags,
            0,
            tag,
            row.curr_parse_depth,
            &mut complete,
            cs,
        ) {
            self.mismatch_depth += 1;
            return false;
        }
        if !complete {
            self.match_state = MatchState::CompletingStartTag;
            return false;
        }

        // Matched a start tag. Match order discovers the relationship
        // among the paths; a repeat match pulls the shared order back so
        // later paths resynchronize.
        if self.match_order == -1 {
            self.match_order = row.match_order;
            row.match_order += 1;
        } else if self.match_order < row.match_order {
            row.match_order = self.match_order + 1;
        }

        self.path_ref.borrow_mut().clear_text();
        self.match_state = MatchState::SearchingForEndTag;
        row.searching_for_end_tag_cnt += 1;
        ctx.borrow_mut().relative_depth = taglist_relative_depth(&self.tags, 0, false);

        let start_exprs = self.path_ref.borrow().start_match_exprs.clone();
        if !start_exprs.is_empty() {
            let evaluator = Evaluator::new(ctx);
            for expr in &start_exprs {
                evaluator.immed_evaluate(expr);
            }
        }

        self.flags |= pm_flags::EXISTS_IN_INPUT;
        self.path_ref.borrow_mut().flags |= path_flags::MATCHED;
        true
    }

    pub fn match_end_tag(
        &mut self,
        tag: &[u8],
        row: &mut RowMatchState,
        ctx: &RefCell<Context>,
    ) -> bool {
        if self.mismatch_depth > 0 {
            self.mismatch_depth -= 1;
            return false;
        }
        let cs = ctx.borrow().case_sensitive;
        if !taglist_match_end(&mut self.tags, 0, tag, cs) {
            return false;
        }
        if self.match_state != MatchState::SearchingForEndTag {
            return false;
        }

        {
            let mut pr = self.path_ref.borrow_mut();
            let trimmed = text::trim_whitespace(pr.text()).to_string();
            pr.value = crate::value::Value::Str(trimmed);
        }
        debug_assert!(row.searching_for_end_tag_cnt > 0);
        row.searching_for_end_tag_cnt -= 1;
        self.match_state = MatchState::FoundEndTag;
        ctx.borrow_mut().relative_depth = taglist_relative_depth(&self.tags, 0, false);

        let end_exprs = self.path_ref.borrow().end_match_exprs.clone();
        if !end_exprs.is_empty() {
            let evaluator = Evaluator::new(ctx);
            for expr in &end_exprs {
                evaluator.immed_evaluate(expr);
            }
        }
        true
    }

    pub fn is_matched(&self) -> bool {
        if self.match_state == MatchState::SearchingForEndTag {
            return false;
        }
        let pr = self.path_ref.borrow();
        if !pr.has_flag(path_flags::MATCHED) && pr.text().is_empty() {
            return false;
        }
        true
    }

    pub fn rollback(&mut self, set_parse_depth: i32, match_order: i32) {
        if self.match_order >= match_order {
            self.clear_values(true);
            self.mismatch_depth = 0;
            self.start_match();
            if !self.tags.is_empty() {
                self.tags[0].relative_parse_depth = set_parse_depth;
                if self.tags.len() > 1 {
                    taglist_reset(&mut self.tags, 1, -1);
                }
            }
        }
    }

    pub fn reset(&mut self, parse_depth: i32, match_order_start: i32) {
        if self.match_order >= match_order_start {
            self.clear_values(true);
        }
        taglist_reset(&mut self.tags, 0, parse_depth);
    }

    pub fn clear_values(&mut self, hard_clear: bool) {
        self.path_ref.borrow_mut().flags &= !path_flags::MATCHED;
        self.path_ref.borrow_mut().clear_text();
        if hard_clear {
            self.match_order = -1;
            self.start_match();
        }
    }

    pub fn start_match(&mut self) {
        self.match_state = MatchState::SearchingForStartTag;
    }

    /// Append matched text; text only accumulates between a complete start
    /// match and its end tag, and never for no-data paths.
    pub fn append_value(&mut self, value: &str) {
        if !self.has_flag(pm_flags::NO_DATA)
            && self.match_state == MatchState::SearchingForEndTag
            && !value.is_empty()
        {
            self.path_ref.borrow_mut().append_text(value);
        }
    }

    /// Fatal when the path never matched anything in the input.
    pub fn check_unreferenced(&self) -> crate::error::Result<()> {
        if !self.has_flag(pm_flags::EXISTS_IN_INPUT) {
            let pr = self.path_ref.borrow();
            let side = if pr.has_flag(path_flags::JOINED) {
                "joined "
            } else {
                ""
            };
            return Err(crate::error::Error::lookup(format!(
                "Path not matched in {}input: {}",
                side, pr.path_spec
            )));
        }
        Ok(())
    }

    /// If the captured value is an XML subtree, strip the first-order
    /// indentation from its subsequent lines.
    pub fn remove_value_indents(&mut self) {
        let current = self.path_ref.borrow().text().to_string();
        if !current.starts_with('<') {
            return;
        }
        let Some(nl) = current.find('\n') else { return };
        let indent_length = current[nl + 1..]
            .bytes()
            .take_while(|b| b.is_ascii_whitespace())
            .count() as i32
            - 2;
        if indent_length <= 0 {
            return;
        }
        let mut out = String::with_capacity(current.len());
        for (i, line) in current.lines().enumerate() {
            if i == 0 {
                out.push_str(line);
            } else {
                let strip = line
                    .bytes()
                    .take_while(|b| b.is_ascii_whitespace())
                    .count()
                    .min(indent_length as usize);
                out.push('\n');
                out.push_str(&line[strip..]);
            }
        }
        self.path_ref.borrow_mut().value = crate::value::Value::Str(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::PathRef;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn ctx() -> RefCell<Context> {
        RefCell::new(Context::new(Arc::new(AtomicBool::new(false))))
    }

    fn path(spec: &str) -> PathMatcher {
        PathMatcher::new(PathRef::new(spec, 0))
    }

    fn start(p: &mut PathMatcher, row: &mut RowMatchState, c: &RefCell<Context>, tag: &str) -> bool {
        row.curr_parse_depth += 1;
        p.match_start_tag(tag.as_bytes(), row, c)
    }

    fn end(p: &mut PathMatcher, row: &mut RowMatchState, c: &RefCell<Context>, tag: &str) -> bool {
        let r = p.match_end_tag(tag.as_bytes(), row, c);
        row.curr_parse_depth -= 1;
        r
    }

    #[test]
    fn test_simple_match() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("b");
        p.start_match();

        // <root><a><b>text</b></a></root> with path *.b
        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(!start(&mut p, &mut row, &c, "a"));
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("text");
        assert!(end(&mut p, &mut row, &c, "b"));
        assert_eq!(p.path_ref.borrow().text(), "text");
        assert!(p.is_matched());
    }

    #[test]
    fn test_dotted_path() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("a.b");
        p.start_match();

        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(!start(&mut p, &mut row, &c, "a"));
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("v");
        assert!(end(&mut p, &mut row, &c, "b"));
        assert!(p.is_matched());
    }

    #[test]
    fn test_no_match_for_wrong_tag() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("a.b");
        p.start_match();

        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(!start(&mut p, &mut row, &c, "x"));
        // b under x does not satisfy a.b
        assert!(!start(&mut p, &mut row, &c, "b"));
        assert!(!p.is_matched());
    }

    #[test]
    fn test_wildcard_in_middle() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("a.*.c");
        p.start_match();

        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(!start(&mut p, &mut row, &c, "a"));
        assert!(!start(&mut p, &mut row, &c, "anything"));
        assert!(start(&mut p, &mut row, &c, "c"));
    }

    #[test]
    fn test_rematch_after_end() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("b");
        p.start_match();

        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("one");
        assert!(end(&mut p, &mut row, &c, "b"));

        // A second <b> only matches after the row is committed.
        p.start_match();
        p.path_ref.borrow_mut().clear_text();
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("two");
        assert!(end(&mut p, &mut row, &c, "b"));
        assert_eq!(p.path_ref.borrow().text(), "two");
    }

    #[test]
    fn test_no_data_path_skips_text() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let pr = PathRef::new("b", path_flags::NO_DATA);
        let mut p = PathMatcher::new(pr);
        p.start_match();

        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("ignored");
        assert_eq!(p.path_ref.borrow().text(), "");
    }

    #[test]
    fn test_match_order_assignment() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p1 = path("a");
        let mut p2 = path("b");
        p1.start_match();
        p2.start_match();

        row.curr_parse_depth += 1; // root
        p1.match_start_tag(b"root", &mut row, &c);
        p2.match_start_tag(b"root", &mut row, &c);

        row.curr_parse_depth += 1;
        assert!(p1.match_start_tag(b"a", &mut row, &c));
        p2.match_start_tag(b"a", &mut row, &c);
        p1.match_end_tag(b"a", &mut row, &c);
        p2.match_end_tag(b"a", &mut row, &c);
        row.curr_parse_depth -= 1;

        row.curr_parse_depth += 1;
        p1.match_start_tag(b"b", &mut row, &c);
        assert!(p2.match_start_tag(b"b", &mut row, &c));

        assert_eq!(p1.match_order, 0);
        assert_eq!(p2.match_order, 1);
    }

    #[test]
    fn test_unreferenced_check() {
        let p = path("never");
        assert!(p.check_unreferenced().is_err());
    }

    #[test]
    fn test_trailing_whitespace_trimmed_on_end() {
        let c = ctx();
        let mut row = RowMatchState::new();
        let mut p = path("b");
        p.start_match();
        assert!(!start(&mut p, &mut row, &c, "root"));
        assert!(start(&mut p, &mut row, &c, "b"));
        p.append_value("  padded \n");
        assert!(end(&mut p, &mut row, &c, "b"));
        assert_eq!(p.path_ref.borrow().text(), "padded");
    }
}
