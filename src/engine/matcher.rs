//! Drives all path matchers over the tag event stream and decides when a
//! row is complete.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::context::Context;
use crate::engine::path::{pm_flags, MatchState, PathMatcher, RowMatchState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    NotAllMatched,
    AllMatched,
}

pub struct Matcher {
    ctx: Rc<RefCell<Context>>,
    pub paths: Vec<PathMatcher>,
    row_state: RowMatchState,
}

impl Matcher {
    pub fn new(ctx: Rc<RefCell<Context>>, paths: Vec<PathMatcher>) -> Self {
        let mut matcher = Matcher {
            ctx,
            paths,
            row_state: RowMatchState::new(),
        };
        matcher.reset();
        matcher
    }

    pub fn match_start_tag(&mut self, tag: &[u8]) -> bool {
        let mut match_detected = false;

        if !self.paths.is_empty() {
            self.row_state.curr_parse_depth += 1;
            for path in &mut self.paths {
                match_detected |= path.match_start_tag(tag, &mut self.row_state, &self.ctx);
            }

            if match_detected {
                // Reset any sequentially later matches to keep emission in
                // sync.
                for path in &mut self.paths {
                    path.reset(self.row_state.curr_parse_depth, self.row_state.match_order);
                }
            }
        }

        let appending = self.row_state.searching_for_end_tag_cnt > 0;
        if appending {
            self.ctx.borrow_mut().appending_values = true;
        }
        match_detected
    }

    pub fn match_end_tag(&mut self, tag: &[u8]) -> bool {
        let mut match_detected = false;
        if !self.paths.is_empty() {
            for path in &mut self.paths {
                match_detected |= path.match_end_tag(tag, &mut self.row_state, &self.ctx);
            }
            self.row_state.curr_parse_depth -= 1;
        }
        let appending = self.row_state.searching_for_end_tag_cnt > 0;
        if appending {
            self.ctx.borrow_mut().appending_values = true;
        }
        match_detected
    }

    /// Snapshot the matched values and re-arm every path for the next row.
    pub fn commit_match(&mut self) {
        for path in &mut self.paths {
            path.remove_value_indents();
            path.start_match();
        }
    }

    /// A row is ready when every path is matched. A matched sync path
    /// short-circuits the check; a no-data path with no end-match
    /// expressions counts as matched from its start tag.
    pub fn match_type(&self) -> MatchType {
        let mut all_matched = !self.paths.is_empty();
        for path in &self.paths {
            if path.has_flag(pm_flags::SYNC) && path.is_matched() {
                all_matched = true;
                break; // nothing else needed on a sync match
            }
            let relaxed_no_data = path.has_flag(pm_flags::NO_DATA)
                && path.path_ref.borrow().end_match_exprs.is_empty()
                && path.match_state == MatchState::SearchingForEndTag;
            if relaxed_no_data || path.is_matched() {
                all_matched = true;
            } else {
                all_matched = false;
            }
            if !all_matched {
                break;
            }
        }
        if all_matched {
            MatchType::AllMatched
        } else {
            MatchType::NotAllMatched
        }
    }

    /// Invalidate the row in progress.
    pub fn rollback(&mut self) {
        self.row_state.match_order = 0;
        let depth = self.row_state.curr_parse_depth;
        for path in &mut self.paths {
            path.rollback(depth, -1);
        }
    }

    pub fn reset(&mut self) {
        self.row_state.reset();
        for path in &mut self.paths {
            path.reset(-1, -1);
        }

        // Paths always begin with a wildcard meaning "match 1 or more", so
        // wrap the document in an outer tag. This also lets several
        // concatenated documents stream as one.
        self.match_start_tag(b"__root");
    }

    pub fn check_unreferenced(&self) -> crate::error::Result<()> {
        for path in &self.paths {
            path.check_unreferenced()?;
        }
        Ok(())
    }
}
