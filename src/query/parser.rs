//! The query parser: turns the ordered argument list into a validated
//! [`QuerySpec`].
//!
//! Each argument is one column spec or directive: an optional `name[,
//! name...]:` prefix followed by an expression. Parsing runs in two
//! passes — a first pass over all arguments collects explicit column names
//! so barewords anywhere can bind to them, a second pass builds the
//! expression trees. A post-parse phase resolves forward column
//! references, wires immediate expressions to their path refs, validates
//! aggregate composition, and hoists join-pure subtrees into synthesized
//! join columns.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::query::expr::{
    arg, col_flags, expr_flags, num_args, Column, ColumnHandle, Expr, ExprRef, PathRef,
    PathRefHandle,
};
use crate::query::lexer::{Lexer, Token, TokenKind};
use crate::query::ops::{self, flags as op_flags, Opcode};
use crate::query::spec::{spec_flags, QuerySpec};
use crate::query::types;
use crate::text;
use crate::value::{parse_boolean, parse_real, TypeTag, Value};

/// The result of parsing: the shared spec plus the pivot column binding
/// (the pivot's declared output names), if any.
#[derive(Debug)]
pub struct ParsedQuery {
    pub spec: Rc<RefCell<QuerySpec>>,
    pub pivot_binding: Option<(ColumnHandle, Vec<String>)>,
}

pub fn parse_query(column_specs: &[String]) -> Result<ParsedQuery> {
    let mut parser = ColumnParser::new();
    let pivot_binding = parser.parse_column_specs(column_specs)?;
    Ok(ParsedQuery {
        spec: Rc::new(RefCell::new(parser.spec)),
        pivot_binding,
    })
}

struct ColumnParser {
    spec: QuerySpec,
    tokens: Option<Lexer>,
    current_column: Option<ColumnHandle>,
    current_column_names: Vec<String>,
    all_column_names: Vec<String>,
    /// Every expression node, in parse (pre-)order.
    exprs: Vec<ExprRef>,
}

impl ColumnParser {
    fn new() -> Self {
        ColumnParser {
            spec: QuerySpec::new(),
            tokens: None,
            current_column: None,
            current_column_names: Vec::new(),
            all_column_names: Vec::new(),
            exprs: Vec::new(),
        }
    }

    fn parse_column_specs(
        &mut self,
        column_specs: &[String],
    ) -> Result<Option<(ColumnHandle, Vec<String>)>> {
        // First pass: collect names so barewords in any argument can bind
        // to explicitly named columns, and note name overrides for the
        // in/join/pivot directives.
        let mut names_per_column = Vec::new();
        let mut overrides_per_column = Vec::new();
        for column_spec in column_specs {
            let (names, explicit) = self.parse_column_names(column_spec)?;
            for name in &names {
                self.all_column_names
                    .push(if explicit { name.clone() } else { String::new() });
            }
            let names = if explicit { names } else { Vec::new() };
            overrides_per_column.push(self.handle_column_name_overrides(&names));
            names_per_column.push(names);
        }

        // Second pass: parse the expressions and add the columns.
        let mut pivot_column_names = Vec::new();
        for (idx, column_spec) in column_specs.iter().enumerate() {
            let (override_name, override_opcode) = overrides_per_column[idx].clone();
            self.current_column_names = std::mem::take(&mut names_per_column[idx]);
            let column = self.parse_column_expr(column_spec)?;
            if !override_name.is_empty() {
                column.borrow_mut().name = override_name;
            }
            if override_opcode == Some(Opcode::Pivot) {
                pivot_column_names = self.current_column_names.clone();
            }
            self.spec.insert_column(column, None);
            self.current_column_names.clear();
        }

        self.post_process_refs()?;

        let pivot_binding = match self.spec.pivot_column.clone() {
            Some(column) => Some((column, pivot_column_names)),
            None => None,
        };

        let columns = self.spec.columns.clone();
        for column in &columns {
            let expr = column.borrow().expr.clone();
            self.validate_structure_and_hoist(&expr)?;
            if expr
                .borrow()
                .has_flag(expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF)
            {
                let hoisted = self.hoist_join_expr(&expr);
                column.borrow_mut().expr = hoisted;
            }
        }

        self.index_join_equalities();

        self.spec.flags |= spec_flags::COLUMNS_ADDED;
        debug!(
            columns = self.spec.columns.len(),
            path_refs = self.spec.input.path_refs.len(),
            join_path_refs = self.spec.join.path_refs.len(),
            "query parsed"
        );
        Ok(pivot_binding)
    }

    // ------------------------------------------------------------------
    // Token plumbing

    fn lookahead(&mut self, n: usize) -> Token {
        self.tokens.as_mut().expect("lexer active").lookahead(n)
    }

    fn next_tok(&mut self) -> Token {
        self.tokens.as_mut().expect("lexer active").next_token()
    }

    fn expect_next(&mut self, kind: TokenKind) -> Result<Token> {
        let token = self.next_tok();
        expect(&token, kind, TokenKind::None)?;
        Ok(token)
    }

    fn expect_next_or(&mut self, kind: TokenKind, alternative: TokenKind) -> Result<Token> {
        let token = self.next_tok();
        expect(&token, kind, alternative)?;
        Ok(token)
    }

    // ------------------------------------------------------------------
    // Column names

    /// Parse the optional `name[, name...]:` prefix. On return the lexer
    /// is positioned after the prefix (or rewound to the start when there
    /// is none and the whole spec becomes the default name).
    fn parse_column_names(&mut self, column_spec: &str) -> Result<(Vec<String>, bool)> {
        self.tokens = Some(Lexer::new(column_spec));
        let mut explicit = false;
        let mut names: Vec<String> = Vec::new();
        let mut expect_more = false;
        let mut found_colon = false;
        loop {
            let mut name = String::new();
            match self.lookahead(0).kind {
                TokenKind::Id | TokenKind::StringLiteral | TokenKind::Spread => {
                    name = self.next_tok().text;
                }
                TokenKind::LBrace => {
                    self.expect_next(TokenKind::LBrace)?;
                    name = self.parse_unquoted_string(TokenKind::RBrace, TokenKind::None);
                    self.expect_next(TokenKind::RBrace)?;
                }
                _ => {}
            }
            if name.is_empty() {
                if expect_more {
                    return Err(Error::parse("Expected a column name after comma"));
                }
                break;
            }
            if names.contains(&name) {
                return Err(Error::parse(format!("Duplicate column name: {}", name)));
            }
            names.push(name);
            match self.lookahead(0).kind {
                TokenKind::Comma => {
                    self.next_tok();
                    explicit = true;
                    expect_more = true;
                }
                TokenKind::Colon => {
                    self.next_tok();
                    explicit = true;
                    found_colon = true;
                    expect_more = false;
                }
                _ => {
                    expect_more = false;
                }
            }
            if !expect_more {
                break;
            }
        }

        if !found_colon {
            // We were looking at expression tokens, not names; rewind and
            // use the full spec text as the default name.
            self.tokens = Some(Lexer::new(column_spec));
            explicit = false;
            names.clear();
            if self.spec.get_column_index(column_spec).is_some() {
                return Err(Error::parse(format!("Duplicate column: {}", column_spec)));
            }
            names.push(column_spec.to_string());
        }

        for name in &names {
            if self.spec.get_column_index(name).is_some() {
                return Err(Error::parse(format!("Duplicate column name: {}", name)));
            }
        }

        Ok((names, explicit))
    }

    /// Peek for a top-level in/join/pivot call; those columns get internal
    /// names, and a `name:` prefix renames the scope instead.
    fn handle_column_name_overrides(
        &mut self,
        column_names: &[String],
    ) -> (String, Option<Opcode>) {
        let is_function_call = self.lookahead(0).kind == TokenKind::Id
            || matches!(
                self.lookahead(1).kind,
                TokenKind::LBracket | TokenKind::LParen
            );
        if !is_function_call {
            return (String::new(), None);
        }
        let head = self.lookahead(0).text;
        let opcode = ops::lookup(&head).ok().map(|op| op.opcode);
        match opcode {
            Some(Opcode::In) => {
                if let Some(name) = column_names.first().filter(|n| !n.is_empty()) {
                    self.spec.input.scope_name = name.clone();
                }
                ("__column_in".to_string(), opcode)
            }
            Some(Opcode::Join) => {
                if let Some(name) = column_names.first().filter(|n| !n.is_empty()) {
                    self.spec.join.scope_name = name.clone();
                }
                ("__column_join".to_string(), opcode)
            }
            Some(Opcode::Pivot) => ("__column_pivot".to_string(), opcode),
            _ => (String::new(), opcode),
        }
    }

    fn parse_column_expr(&mut self, column_spec: &str) -> Result<ColumnHandle> {
        let (column_names, _) = self.parse_column_names(column_spec)?;
        let column_name = column_names[0].clone();

        let expr = Expr::new();
        self.parse_expr(&expr, None, false)?;
        self.expect_next(TokenKind::End)?;

        let column = Column::new(column_name, expr.clone(), 0);
        self.current_column = Some(column.clone());

        types::infer(&expr);
        self.postprocess_column_exprs(&expr, 0, false)?;

        self.tokens = None;
        self.current_column = None;
        Ok(column)
    }

    // ------------------------------------------------------------------
    // Expressions

    fn parse_expr(&mut self, expr: &ExprRef, parent: Option<&ExprRef>, unary: bool) -> Result<()> {
        let mut infix = false;
        let mut is_first_token = true;
        loop {
            let tok0 = self.lookahead(0);
            let tok1 = self.lookahead(1);
            match tok0.kind {
                // Braces distinguish quoted column/path references from
                // string literals.
                TokenKind::LBrace => self.parse_ref(expr)?,

                TokenKind::LBracket => {
                    self.expect_next(TokenKind::LBracket)?;
                    self.parse_expr(expr, None, false)?;
                    self.expect_next(TokenKind::RBracket)?;
                }

                TokenKind::LParen => {
                    self.expect_next(TokenKind::LParen)?;
                    self.parse_expr(expr, None, false)?;
                    self.expect_next(TokenKind::RParen)?;
                }

                // Options are functions: --x, --x=true, --x=1,2
                TokenKind::Option => {
                    self.expect_next(TokenKind::Option)?;
                    self.parse_function_call(expr, TokenKind::Assign, TokenKind::End, true)?;
                }

                TokenKind::Id => {
                    if tok0.is_boolean_literal() {
                        self.parse_literal(expr)?;
                    } else if tok1.kind == TokenKind::LParen {
                        self.parse_function_call(expr, TokenKind::LParen, TokenKind::RParen, false)?;
                    } else if tok1.kind == TokenKind::LBracket {
                        self.parse_function_call(
                            expr,
                            TokenKind::LBracket,
                            TokenKind::RBracket,
                            false,
                        )?;
                    } else {
                        self.parse_ref(expr)?;
                    }
                }

                TokenKind::Not => self.parse_unary_operator(expr)?,

                TokenKind::Minus => {
                    if infix {
                        self.parse_infix_operator(expr, parent)?;
                    } else {
                        self.parse_unary_operator(expr)?;
                    }
                }

                TokenKind::Mult => {
                    if infix {
                        self.parse_infix_operator(expr, parent)?;
                    } else if tok1.kind == TokenKind::Dot {
                        self.parse_ref(expr)?;
                    } else {
                        return Err(unexpected(TokenKind::Mult));
                    }
                }

                TokenKind::NumberLiteral | TokenKind::StringLiteral => self.parse_literal(expr)?,

                TokenKind::End => return Err(Error::parse("Missing expression")),

                kind => {
                    if kind == TokenKind::Error {
                        return Err(Error::parse(format!(
                            "Unexpected token \"{}\"",
                            tok0.text
                        )));
                    } else if kind == TokenKind::Plus && is_first_token {
                        return Err(Error::parse("Positive operator not supported; use abs()"));
                    } else if kind.is_infix() && !is_first_token {
                        self.parse_infix_operator(expr, parent)?;
                    } else {
                        return Err(unexpected(kind));
                    }
                }
            }
            is_first_token = false;
            infix = self.lookahead(0).kind.is_infix();
            if unary || !infix {
                break;
            }
        }
        Ok(())
    }

    fn parse_literal(&mut self, expr: &ExprRef) -> Result<()> {
        expr.borrow_mut().set_op(ops::by_opcode(Opcode::Literal));
        let token = self.next_tok();
        if token.kind == TokenKind::NumberLiteral {
            expr.borrow_mut()
                .set_value_and_type(Value::Real(parse_real(&token.text).0));
            return Ok(());
        }
        let (b, exact) = parse_boolean(&token.text);
        if exact {
            expr.borrow_mut().set_value_and_type(Value::Bool(b));
            return Ok(());
        }
        if token.kind == TokenKind::StringLiteral {
            expr.borrow_mut().set_value_and_type(Value::Str(token.text));
            return Ok(());
        }
        expect(&token, TokenKind::NumberLiteral, TokenKind::StringLiteral)?;
        Ok(())
    }

    fn parse_ref(&mut self, expr: &ExprRef) -> Result<()> {
        expr.borrow_mut().set_op(ops::by_opcode(Opcode::PathRef));

        let mut path_spec = String::new();
        let mut joined_path_ref = false;
        while self.lookahead(0).kind != TokenKind::End {
            if path_spec.is_empty()
                && self.lookahead(0).kind == TokenKind::Id
                && self.lookahead(1).kind == TokenKind::Scope
            {
                // Scoped reference, e.g. right::ref; peel off the scope.
                let token = self.expect_next(TokenKind::Id)?;
                self.expect_next(TokenKind::Scope)?;
                let cs = self.spec.case_sensitive;
                if text::eq_fold(&token.text, &self.spec.join.scope_name, cs) {
                    if !self.spec.is_flag_set(spec_flags::LEFT_SIDE_OF_JOIN) {
                        return Err(Error::parse(
                            "Can't reference joined paths without a join directive",
                        ));
                    }
                    joined_path_ref = true;
                } else if text::eq_fold(&token.text, &self.spec.input.scope_name, cs) {
                    // The input scope name adds no information; path refs
                    // default to the main input.
                } else {
                    return Err(Error::parse(format!("Unknown scope name: {}", token.text)));
                }
            }
            if self.lookahead(0).kind == TokenKind::LBrace {
                path_spec.push_str(&self.expect_next(TokenKind::LBrace)?.text);
                path_spec.push_str(&self.parse_unquoted_string(TokenKind::RBrace, TokenKind::None));
                path_spec.push_str(&self.expect_next(TokenKind::RBrace)?.text);
            } else if !path_spec.is_empty() && self.lookahead(0).kind == TokenKind::NumberLiteral {
                path_spec.push_str(&self.expect_next(TokenKind::NumberLiteral)?.text);
            } else {
                path_spec.push_str(&self.expect_next_or(TokenKind::Id, TokenKind::Mult)?.text);
            }
            // Keep going over '.'-led tokens (including reals like .1) but
            // stop at .. (attribute) and ... (spread).
            let look = self.lookahead(0);
            let bytes = look.text.as_bytes();
            if bytes.first() != Some(&b'.') || bytes.get(1) == Some(&b'.') {
                break;
            }
            path_spec.push_str(&self.next_tok().text);
        }

        let tags = text::split(&path_spec, ".", "{}", false);
        for tag in &tags {
            if tag.starts_with('{') && !tag.ends_with('}') {
                return Err(Error::parse(format!("Unbalanced braces: {}", path_spec)));
            }
        }

        if !joined_path_ref && self.is_bindable_column_name(&path_spec) {
            expr.borrow_mut().set_op(ops::by_opcode(Opcode::ColumnRef));
            // Column references resolve after all columns are parsed;
            // record the name with a placeholder column.
            let temp = Column::new(path_spec, Expr::new(), 0);
            expr.borrow_mut().column_ref = Some(temp);
        } else {
            let path_ref = self.intern_path_ref(&path_spec, joined_path_ref);
            expr.borrow_mut().path_ref = Some(path_ref);
        }
        Ok(())
    }

    /// Duplicate path specs share a single reference within a scope.
    fn intern_path_ref(&mut self, path_spec: &str, joined: bool) -> PathRefHandle {
        use crate::query::expr::path_flags;
        let registry = if joined {
            &mut self.spec.join.path_refs
        } else {
            &mut self.spec.input.path_refs
        };
        if let Some(existing) = registry.get(path_spec) {
            return existing.clone();
        }
        let flags = if joined { path_flags::JOINED } else { 0 };
        let path_ref = PathRef::new(path_spec, flags);
        registry.insert(path_spec.to_string(), path_ref.clone());
        path_ref
    }

    fn is_bindable_column_name(&self, name: &str) -> bool {
        let cs = self.spec.case_sensitive;
        // Don't bind against the column being declared: in `a:a`, the
        // right-hand `a` stays a path reference.
        for column_name in &self.current_column_names {
            if text::eq_fold(name, column_name, cs) {
                return false;
            }
        }
        self.all_column_names
            .iter()
            .any(|column_name| text::eq_fold(name, column_name, cs))
    }

    fn parse_unary_operator(&mut self, expr: &ExprRef) -> Result<()> {
        let token = self.expect_next_or(TokenKind::Not, TokenKind::Minus)?;
        let op = if token.kind == TokenKind::Not {
            ops::by_opcode(Opcode::Not)
        } else {
            ops::by_opcode(Opcode::Neg)
        };
        expr.borrow_mut().set_op(op);
        let child = Expr::new();
        expr.borrow_mut().args.push(child.clone());
        self.parse_expr(&child, Some(expr), true)
    }

    fn parse_infix_operator(&mut self, expr: &ExprRef, parent: Option<&ExprRef>) -> Result<()> {
        let token = self.next_tok();
        let mut op = ops::lookup(&token.text)?;
        if op.opcode == Opcode::Neg {
            op = ops::by_opcode(Opcode::Sub);
        }

        // The parsed-so-far expression becomes the left child.
        let left = Rc::new(RefCell::new(expr.borrow().clone()));
        {
            let mut e = expr.borrow_mut();
            e.clear();
            e.set_op(op);
            e.args.push(left);
        }

        if op.opcode == Opcode::Attr {
            // The attribute name arrives as an identifier but is stored as
            // a string literal.
            let token = self.expect_next(TokenKind::Id)?;
            let right = Expr::new();
            right.borrow_mut().set_op(ops::by_opcode(Opcode::Literal));
            right.borrow_mut().set_value_and_type(Value::Str(token.text));
            expr.borrow_mut().args.push(right);
        } else {
            let right = Expr::new();
            expr.borrow_mut().args.push(right.clone());
            self.parse_expr(&right, Some(expr), false)?;
        }

        // Opcodes encode precedence; rewrite when the parent binds at
        // least as tightly. With input 1*2+3 the tree is currently
        //      * <- parent
        //    1   + <- expr
        //       2 3
        // which must become
        //      +
        //    *   3
        //   1 2
        if let Some(parent) = parent {
            debug_assert!(parent.borrow().op.has_flag(op_flags::BINARY_INFIX));
            if parent.borrow().opcode() <= op.opcode {
                let save_top = parent.borrow().clone();
                let left_of_expr = expr.borrow().args[0].clone();
                let save_left = left_of_expr.borrow().clone();
                let expr_guts = expr.borrow().clone();
                *parent.borrow_mut() = expr_guts;
                *left_of_expr.borrow_mut() = save_top;
                *expr.borrow_mut() = save_left;
            }
        }
        Ok(())
    }

    fn parse_function_call(
        &mut self,
        expr: &ExprRef,
        start_token: TokenKind,
        end_token: TokenKind,
        start_token_optional: bool,
    ) -> Result<()> {
        let name = self.expect_next(TokenKind::Id)?;
        let op = ops::lookup(&name.text)?;
        expr.borrow_mut().set_op(op);

        let mut token = name;
        if !start_token_optional || self.lookahead(0).kind == start_token {
            token = self.expect_next(start_token)?;
        }
        if self.lookahead(0).kind == TokenKind::Comma {
            return Err(unexpected(TokenKind::Comma));
        }
        if self.lookahead(0).kind == end_token {
            self.expect_next(end_token)?;
        } else {
            while token.kind != end_token && token.kind != TokenKind::End {
                let arg_expr = Expr::new();
                expr.borrow_mut().args.push(arg_expr.clone());
                let nargs = num_args(expr);
                let kind = self.lookahead(0).kind;
                let unquoted = kind != TokenKind::StringLiteral
                    && kind != TokenKind::NumberLiteral
                    && ((nargs == 1 && op.has_flag(op_flags::UNQUOTED_STRING_FIRST_ARG))
                        || (nargs == 2 && op.has_flag(op_flags::UNQUOTED_STRING_SECOND_ARG)));
                if unquoted {
                    let s = self.parse_unquoted_string(end_token, TokenKind::Comma);
                    arg_expr.borrow_mut().set_op(ops::by_opcode(Opcode::Literal));
                    arg_expr.borrow_mut().set_value_and_type(Value::Str(s));
                } else {
                    self.parse_expr(&arg_expr, None, false)?;
                }
                token = self.expect_next_or(TokenKind::Comma, end_token)?;
            }
            expect(&token, end_token, TokenKind::None)?;
        }

        // min/max are overloaded: one argument means the aggregate.
        let nargs = num_args(expr);
        let opcode = expr.borrow().opcode();
        if nargs == 1 && opcode == Opcode::Min {
            expr.borrow_mut().set_op(ops::by_opcode(Opcode::MinAggr));
        }
        if nargs == 1 && opcode == Opcode::Max {
            expr.borrow_mut().set_op(ops::by_opcode(Opcode::MaxAggr));
        }

        let op = expr.borrow().op;
        if nargs < op.min_args || nargs > op.max_args {
            return Err(Error::parse(format!(
                "Wrong number of arguments for {}",
                op.name
            )));
        }
        Ok(())
    }

    /// Accumulate raw token text until the end token (file paths, tag
    /// names).
    fn parse_unquoted_string(&mut self, end_token: TokenKind, alternative: TokenKind) -> String {
        let mut s = String::new();
        loop {
            let kind = self.lookahead(0).kind;
            if kind == TokenKind::End || kind == end_token {
                break;
            }
            if alternative != TokenKind::None && kind == alternative {
                break;
            }
            s.push_str(&self.next_tok().text);
        }
        s
    }

    // ------------------------------------------------------------------
    // Post-processing

    fn postprocess_column_exprs(
        &mut self,
        expr: &ExprRef,
        depth: usize,
        no_data_parent: bool,
    ) -> Result<()> {
        use crate::query::expr::path_flags;

        let op = expr.borrow().op;

        if op.has_flag(op_flags::TOP_LEVEL_ONLY) && depth > 0 {
            return Err(Error::parse(format!(
                "Top-level expression only: {}",
                op.name
            )));
        }

        if op.has_flag(op_flags::ONCE_ONLY) {
            for seen in &self.exprs {
                if seen.borrow().opcode() == op.opcode {
                    return Err(Error::parse(format!(
                        "Expression can only be used once: {}",
                        op.name
                    )));
                }
            }
        }

        self.exprs.push(expr.clone());

        if op.is_aggregate() {
            if let Some(column) = &self.current_column {
                column.borrow_mut().flags |= col_flags::AGGREGATE;
            }
            expr.borrow_mut().flags |= expr_flags::SUBTREE_CONTAINS_AGGREGATE;
            self.spec.flags |= spec_flags::AGGREGATES_EXIST;
            expr.borrow_mut().aggr_idx = self.spec.aggr_count;
            self.spec.aggr_count += 1;
        }

        if op.has_flag(op_flags::GATHER_DATA) {
            self.spec.flags |= spec_flags::GATHER_DATA_PASS_REQUIRED;
        }

        let nargs = num_args(expr);
        match op.opcode {
            Opcode::PathRef => {
                let path_ref = expr.borrow().path_ref.clone().expect("path ref set");
                let joined = path_ref.borrow().has_flag(path_flags::JOINED);
                expr.borrow_mut().flags |= if joined {
                    expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF
                } else {
                    expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF
                };
                let mut pr = path_ref.borrow_mut();
                if no_data_parent {
                    pr.flags |= path_flags::NO_DATA;
                } else {
                    // AppendData voids NoData once all references are seen.
                    pr.flags |= path_flags::APPEND_DATA;
                    pr.flags &= !path_flags::NO_DATA;
                }
            }

            Opcode::Case => {
                if nargs == 0 || arg(expr, 0).borrow().value.as_bool() {
                    self.spec.case_sensitive = true;
                }
            }

            Opcode::Attr => {
                self.spec.flags |= spec_flags::ATTRIBUTES_USED;
            }

            Opcode::LineNum => {
                self.spec.flags |= spec_flags::LINE_NUM_USED;
            }

            Opcode::Distinct => {
                self.spec.flags |= spec_flags::DISTINCT_USED;
            }

            Opcode::First => {
                self.spec.first_n_rows = arg(expr, 0).borrow().value.as_int().max(0) as usize;
                self.spec.flags |= spec_flags::FIRST_N_ROWS;
            }

            Opcode::Top => {
                self.spec.top_n_rows = arg(expr, 0).borrow().value.as_int().max(0) as usize;
                self.spec.flags |= spec_flags::TOP_N_ROWS;
            }

            Opcode::Pivot => {
                self.spec.pivot_column = self.current_column.clone();
                self.spec.flags |= spec_flags::HAS_PIVOT;
                if self.spec.pivot_column.as_ref().is_some_and(|c| {
                    c.borrow().expr.borrow().args.len() == 3
                        && arg(&c.borrow().expr, 2).borrow().value.as_bool()
                }) {
                    // Jagged pivots discover column names in a prepass.
                    self.spec.flags |= spec_flags::GATHER_DATA_PASS_REQUIRED;
                }
            }

            Opcode::Sort => {
                self.spec.sort_column = self.current_column.clone();
                for i in 0..nargs {
                    let a = arg(expr, i);
                    let ab = a.borrow();
                    self.spec.reversed_string_sorts.push(
                        (ab.ty == TypeTag::Unknown || ab.ty == TypeTag::String)
                            && ab.opcode() == Opcode::Neg,
                    );
                }
            }

            Opcode::InputHeader => {
                self.spec.input.header = nargs == 0 || arg(expr, 0).borrow().value.as_bool();
            }

            Opcode::JoinHeader => {
                self.spec.join.header = nargs == 0 || arg(expr, 0).borrow().value.as_bool();
            }

            Opcode::OutputHeader => {
                self.spec.output.header = nargs == 0 || arg(expr, 0).borrow().value.as_bool();
            }

            Opcode::Help => {
                self.spec.flags |= spec_flags::SHOW_USAGE;
            }

            Opcode::In => {
                self.spec.input.filename = arg(expr, 0).borrow().value.as_str();
            }

            Opcode::Join => {
                self.spec.join.filename = arg(expr, 0).borrow().value.as_str();
                if nargs == 2 {
                    self.spec.join.outer = arg(expr, 1).borrow().value.as_bool();
                }
                self.spec.flags |= spec_flags::LEFT_SIDE_OF_JOIN;
            }

            Opcode::Sync => {
                let path_ref = arg(expr, 0).borrow().path_ref.clone();
                match path_ref {
                    Some(pr) => pr.borrow_mut().flags |= path_flags::SYNC,
                    None => {
                        return Err(Error::parse("sync requires a path reference argument"));
                    }
                }
            }

            Opcode::Root => {
                self.spec.root_node_num = arg(expr, 0).borrow().value.as_int().max(0) as usize;
            }

            _ => {}
        }

        if depth == 0 {
            if let Some(column) = &self.current_column {
                if !op.is_directive() {
                    column.borrow_mut().flags |= col_flags::OUTPUT;
                }
                if op.opcode == Opcode::Where {
                    expr.borrow_mut().change_type(TypeTag::Boolean);
                    column.borrow_mut().flags |= col_flags::FILTER;
                }
            }
            if op.opcode != Opcode::Pivot {
                if self.current_column_names.len() > 1 {
                    return Err(Error::parse(
                        "Multiple column names only valid for pivot function",
                    ));
                }
                if self.current_column_names.len() == 1 && self.current_column_names[0] == "..." {
                    return Err(Error::parse(
                        "Column name spread (...) only valid for pivot function",
                    ));
                }
            }
        }

        let no_data = op.has_flag(op_flags::NO_DATA);
        for i in 0..num_args(expr) {
            self.postprocess_column_exprs(&arg(expr, i), depth + 1, no_data)?;
        }
        Ok(())
    }

    /// Runs after all columns are parsed: resolves column references and
    /// wires immediate expressions to their path refs.
    fn post_process_refs(&mut self) -> Result<()> {
        use crate::query::expr::path_flags;

        if self.spec.input.path_refs.is_empty() {
            if self.spec.is_flag_set(spec_flags::LEFT_SIDE_OF_JOIN) {
                return Err(Error::parse(
                    "A join requires at least one input path reference",
                ));
            }
            if self.spec.sort_column.is_some() {
                return Err(Error::parse(
                    "A sort requires at least one input path reference",
                ));
            }
            if self.spec.is_flag_set(spec_flags::DISTINCT_USED) {
                return Err(Error::parse(
                    "Use of distinct requires at least one input path reference",
                ));
            }
        }

        if self.spec.join.path_refs.is_empty()
            && self.spec.is_flag_set(spec_flags::LEFT_SIDE_OF_JOIN)
        {
            return Err(Error::parse(
                "A join requires at least one joined path reference",
            ));
        }

        for path_ref in self.spec.input.path_refs.values() {
            let mut pr = path_ref.borrow_mut();
            if pr.has_flag(path_flags::APPEND_DATA) {
                pr.flags &= !path_flags::NO_DATA;
            }
        }

        let exprs = self.exprs.clone();
        for expr in &exprs {
            let op = expr.borrow().op;
            if op.has_flag(op_flags::IMMED_EVALUATE) {
                let path_ref = arg(expr, 0).borrow().path_ref.clone();
                let path_ref = path_ref
                    .ok_or_else(|| Error::parse("First argument must be a path reference"))?;
                let joined = path_ref.borrow().has_flag(path_flags::JOINED);
                if op.has_flag(op_flags::START_MATCH_EVAL) {
                    path_ref.borrow_mut().start_match_exprs.push(expr.clone());
                } else {
                    path_ref.borrow_mut().end_match_exprs.push(expr.clone());
                }
                if joined {
                    self.spec.join.flags |= spec_flags::NODE_STACK_REQUIRED;
                } else {
                    self.spec.flags |= spec_flags::NODE_STACK_REQUIRED;
                }
            }

            if expr.borrow().opcode() == Opcode::ColumnRef {
                self.resolve_column_ref(expr)?;
            }
        }
        Ok(())
    }

    /// Replace a placeholder reference with the real column, following
    /// direct column-to-column chains and rejecting cycles.
    fn resolve_column_ref(&mut self, expr: &ExprRef) -> Result<()> {
        let col_name = expr
            .borrow()
            .column_ref
            .as_ref()
            .expect("placeholder column ref")
            .borrow()
            .name
            .clone();
        let mut column = self
            .spec
            .get_column(&col_name)
            .ok_or_else(|| Error::parse(format!("Unknown column: {}", col_name)))?;
        let mut hops = 0;
        loop {
            let next = {
                let col = column.borrow();
                let expr = col.expr.borrow();
                expr.column_ref.clone()
            };
            let Some(next_ref) = next else { break };
            let next_name = next_ref.borrow().name.clone();
            let next_column = self
                .spec
                .get_column(&next_name)
                .ok_or_else(|| Error::parse(format!("Unknown column: {}", next_name)))?;
            hops += 1;
            if next_column.borrow().name == col_name || hops > self.spec.columns.len() {
                return Err(Error::parse(format!(
                    "Circular column reference: {}",
                    col_name
                )));
            }
            column = next_column;
        }
        expr.borrow_mut().column_ref = Some(column);
        Ok(())
    }

    /// After hoisting, find `where[A==B]` predicates where exactly one
    /// side is a joined column; mark that column Indexed and record the
    /// opposite side as a join equality key.
    fn index_join_equalities(&mut self) {
        let exprs = self.exprs.clone();
        for expr in &exprs {
            if expr.borrow().opcode() != Opcode::Where {
                continue;
            }
            let pred = arg(expr, 0);
            if pred.borrow().opcode() == Opcode::Eq {
                for eq_operand in 0..=1 {
                    let side = arg(&pred, eq_operand);
                    let column = side.borrow().column_ref.clone();
                    if let Some(column) = column {
                        if column.borrow().has_flag(col_flags::JOINED_COLUMN) {
                            column.borrow_mut().flags |= col_flags::INDEXED;
                            self.spec
                                .join
                                .equality_exprs
                                .push(arg(&pred, 1 - eq_operand));
                            break;
                        }
                    }
                }
            }
            expr.borrow_mut().flags |= expr_flags::JOIN_EQUALITY_WHERE;
        }
    }

    // ------------------------------------------------------------------
    // Structure validation and join hoisting

    fn validate_structure_and_hoist(&mut self, expr: &ExprRef) -> Result<()> {
        if expr.borrow().has_flag(expr_flags::VISITED) {
            // Column references make the traversal DAG-like.
            return Ok(());
        }
        expr.borrow_mut().flags |= expr_flags::VISITED;

        let op = expr.borrow().op;

        if expr.borrow().opcode() == Opcode::ColumnRef {
            let column_expr = expr
                .borrow()
                .column_ref
                .as_ref()
                .expect("resolved column ref")
                .borrow()
                .expr
                .clone();
            self.validate_structure_and_hoist(&column_expr)?;
            rollup_flags(expr, &column_expr)?;
        } else {
            for i in 0..num_args(expr) {
                let child = arg(expr, i);
                self.validate_structure_and_hoist(&child)?;
                rollup_flags(expr, &child)?;
            }
        }

        // Join-pure subtrees must be hoisted before they meet an aggregate
        // or mix with input paths; accumulate the largest such subtree.
        let e_flags = expr.borrow().flags;
        if e_flags & expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF != 0
            && (e_flags & expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF != 0 || op.is_aggregate())
        {
            for i in 0..num_args(expr) {
                let child = arg(expr, i);
                if child
                    .borrow()
                    .has_flag(expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF)
                {
                    let new_child = self.hoist_join_expr(&child);
                    expr.borrow_mut().args[i] = new_child;
                }
            }
            expr.borrow_mut().flags &= !expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF;
        }

        // Aggregations erase input path dependencies.
        if op.is_aggregate() {
            expr.borrow_mut().flags &= !expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF;
        }

        // foo+sum[bar] is unsupported (literals are fine: 1+sum[bar]).
        // Sort is exempt; its arguments mix freely.
        let e_flags = expr.borrow().flags;
        if op.opcode != Opcode::Sort
            && e_flags & expr_flags::SUBTREE_CONTAINS_AGGREGATE != 0
            && e_flags & expr_flags::SUBTREE_CONTAINS_PATH_REF != 0
        {
            return Err(Error::parse(
                "Columns can't be functions of both aggregates and non-aggregates",
            ));
        }
        Ok(())
    }

    /// Move a join-pure subtree into a synthesized join column and return
    /// a reference to it.
    fn hoist_join_expr(&mut self, expr: &ExprRef) -> ExprRef {
        debug_assert!(!expr
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF));
        debug_assert!(expr
            .borrow()
            .has_flag(expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF));

        let column_num = self.spec.join.columns.len() + 1;
        let column_name = format!("__joincolumn_{}", column_num);
        let column = Column::new(
            column_name,
            expr.clone(),
            col_flags::OUTPUT | col_flags::JOINED_COLUMN,
        );
        self.spec.join.columns.push(column.clone());

        let new_expr = Expr::new();
        new_expr
            .borrow_mut()
            .set_op(ops::by_opcode(Opcode::ColumnRef));
        new_expr.borrow_mut().ty = expr.borrow().ty;
        new_expr.borrow_mut().column_ref = Some(column);
        new_expr
    }
}

fn rollup_flags(parent: &ExprRef, child: &ExprRef) -> Result<()> {
    let child_flags = child.borrow().flags;
    if child_flags & expr_flags::SUBTREE_CONTAINS_AGGREGATE != 0 {
        if parent.borrow().op.is_aggregate() {
            return Err(Error::parse("Aggregate functions cannot be composed"));
        }
        parent.borrow_mut().flags |= expr_flags::SUBTREE_CONTAINS_AGGREGATE;
    }
    if child_flags & expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF != 0 {
        parent.borrow_mut().flags |= expr_flags::SUBTREE_CONTAINS_INPUT_PATH_REF;
    }
    if child_flags & expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF != 0 {
        parent.borrow_mut().flags |= expr_flags::SUBTREE_CONTAINS_JOIN_PATH_REF;
    }
    Ok(())
}

fn expect(token: &Token, kind: TokenKind, alternative: TokenKind) -> Result<()> {
    if token.kind == kind || (alternative != TokenKind::None && token.kind == alternative) {
        return Ok(());
    }
    if alternative != TokenKind::None {
        Err(Error::parse(format!(
            "Expected \"{}\" or \"{}\", got \"{}\"",
            kind.describe(""),
            alternative.describe(""),
            token.kind.describe(&token.text)
        )))
    } else {
        Err(Error::parse(format!(
            "Expected \"{}\", got \"{}\"",
            kind.describe(""),
            token.kind.describe(&token.text)
        )))
    }
}

fn unexpected(kind: TokenKind) -> Error {
    Error::parse(format!("Unexpected \"{}\"", kind.describe("")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ParsedQuery> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_query(&args)
    }

    fn parse_ok(args: &[&str]) -> ParsedQuery {
        parse(args).expect("query should parse")
    }

    #[test]
    fn test_simple_path_columns() {
        let q = parse_ok(&["a", "b.c"]);
        let spec = q.spec.borrow();
        assert_eq!(spec.columns.len(), 2);
        assert_eq!(spec.input.path_refs.len(), 2);
        assert!(spec.columns[0].borrow().is_output());
        assert_eq!(spec.num_value_columns(), 2);
    }

    #[test]
    fn test_duplicate_path_refs_share() {
        let q = parse_ok(&["a", "x:a"]);
        assert_eq!(q.spec.borrow().input.path_refs.len(), 1);
    }

    #[test]
    fn test_named_column_and_reference() {
        let q = parse_ok(&["name:a.b", "upper[name]"]);
        let spec = q.spec.borrow();
        assert_eq!(spec.columns.len(), 2);
        // The second column's upper() arg resolved to a column ref.
        let second = spec.columns[1].borrow().expr.clone();
        let arg0 = arg(&second, 0);
        assert_eq!(arg0.borrow().opcode(), Opcode::ColumnRef);
        assert!(arg0.borrow().column_ref.is_some());
    }

    #[test]
    fn test_directive_forms() {
        let q = parse_ok(&["--in=orders.csv", "a", "--first=5", "top[3]"]);
        let spec = q.spec.borrow();
        assert_eq!(spec.input.filename, "orders.csv");
        assert_eq!(spec.first_n_rows, 5);
        assert_eq!(spec.top_n_rows, 3);
        assert!(spec.is_flag_set(spec_flags::FIRST_N_ROWS));
        assert!(spec.is_flag_set(spec_flags::TOP_N_ROWS));
    }

    #[test]
    fn test_directive_columns_are_not_output() {
        let q = parse_ok(&["a", "first[2]"]);
        let spec = q.spec.borrow();
        assert!(!spec.columns[1].borrow().is_output());
        assert_eq!(spec.num_value_columns(), 1);
    }

    #[test]
    fn test_where_becomes_filter() {
        let q = parse_ok(&["a", "where[a==\"x\"]"]);
        let spec = q.spec.borrow();
        let filter = spec.columns[1].borrow();
        assert!(filter.is_filter());
        assert!(!filter.is_output());
        assert_eq!(filter.expr.borrow().ty, TypeTag::Boolean);
    }

    #[test]
    fn test_infix_precedence() {
        // 1*2+3 must parse as (1*2)+3.
        let q = parse_ok(&["x:1*2+3"]);
        let spec = q.spec.borrow();
        let expr = spec.columns[0].borrow().expr.clone();
        assert_eq!(expr.borrow().opcode(), Opcode::Add);
        assert_eq!(arg(&expr, 0).borrow().opcode(), Opcode::Mul);

        // 1+2*3 stays 1+(2*3).
        let q = parse_ok(&["y:1+2*3"]);
        let spec = q.spec.borrow();
        let expr = spec.columns[0].borrow().expr.clone();
        assert_eq!(expr.borrow().opcode(), Opcode::Add);
        assert_eq!(arg(&expr, 1).borrow().opcode(), Opcode::Mul);
    }

    #[test]
    fn test_aggregate_column() {
        let q = parse_ok(&["total:sum[amount]"]);
        let spec = q.spec.borrow();
        assert!(spec.aggregated());
        assert!(spec.columns[0].borrow().is_aggregate());
        assert_eq!(spec.aggr_count, 1);
    }

    #[test]
    fn test_min_overload() {
        let q = parse_ok(&["m:min[a]", "n:min[a,b]"]);
        let spec = q.spec.borrow();
        assert_eq!(
            spec.columns[0].borrow().expr.borrow().opcode(),
            Opcode::MinAggr
        );
        assert_eq!(spec.columns[1].borrow().expr.borrow().opcode(), Opcode::Min);
    }

    #[test]
    fn test_aggregate_composition_rejected() {
        let err = parse(&["sum[count[a]]"]).unwrap_err();
        assert!(err.message().contains("cannot be composed"));
    }

    #[test]
    fn test_aggregate_path_mix_rejected() {
        let err = parse(&["a&sum[b]"]).unwrap_err();
        assert!(err.message().contains("aggregates and non-aggregates"));
    }

    #[test]
    fn test_literal_plus_aggregate_allowed() {
        assert!(parse(&["x:1+sum[b]"]).is_ok());
    }

    #[test]
    fn test_once_only() {
        let err = parse(&["a", "first[1]", "first[2]"]).unwrap_err();
        assert!(err.message().contains("can only be used once"));
    }

    #[test]
    fn test_top_level_only() {
        let err = parse(&["x:1+first[2]"]).unwrap_err();
        assert!(err.message().contains("Top-level expression only"));
    }

    #[test]
    fn test_wrong_arity() {
        let err = parse(&["len[a,b]"]).unwrap_err();
        assert!(err.message().contains("Wrong number of arguments"));
    }

    #[test]
    fn test_unknown_function() {
        let err = parse(&["frobnicate[a]"]).unwrap_err();
        assert!(err.message().contains("Unrecognized function"));
    }

    #[test]
    fn test_sort_requires_path_refs() {
        let err = parse(&["x:1", "sort[x]"]).unwrap_err();
        assert!(err.message().contains("sort requires"));
    }

    #[test]
    fn test_distinct_requires_path_refs() {
        let err = parse(&["x:1", "--distinct"]).unwrap_err();
        assert!(err.message().contains("distinct requires"));
    }

    #[test]
    fn test_join_scope_requires_join() {
        let err = parse(&["right::a"]).unwrap_err();
        assert!(err.message().contains("without a join directive"));
    }

    #[test]
    fn test_unknown_scope() {
        let err = parse(&["join[f.csv]", "a", "where[a==right::a]", "bogus::b"]).unwrap_err();
        assert!(err.message().contains("Unknown scope name"));
    }

    #[test]
    fn test_join_hoists_pure_join_column() {
        let q = parse_ok(&["join[r.csv]", "a", "b:right::z", "where[a==right::k]"]);
        let spec = q.spec.borrow();
        // right::z and right::k both hoisted into synthesized join columns.
        assert_eq!(spec.join.columns.len(), 2);
        let b = spec.columns.iter().find(|c| c.borrow().name == "b").unwrap();
        assert_eq!(b.borrow().expr.borrow().opcode(), Opcode::ColumnRef);
        // The where equality marked one join column Indexed and recorded
        // the main-side key expression.
        assert_eq!(spec.join.equality_exprs.len(), 1);
        assert_eq!(spec.indexed_join_columns().len(), 1);
    }

    #[test]
    fn test_sync_flags_path() {
        use crate::query::expr::path_flags;
        let q = parse_ok(&["a", "sync[a]"]);
        let spec = q.spec.borrow();
        let pr = spec.input.path_refs.get("a").unwrap();
        assert!(pr.borrow().has_flag(path_flags::SYNC));
    }

    #[test]
    fn test_immediate_exprs_attach_to_path() {
        let q = parse_ok(&["d:depth[a]", "a"]);
        let spec = q.spec.borrow();
        let pr = spec.input.path_refs.get("a").unwrap();
        assert_eq!(pr.borrow().start_match_exprs.len(), 1);
        assert!(spec.is_flag_set(spec_flags::NODE_STACK_REQUIRED));
    }

    #[test]
    fn test_attribute_operator() {
        let q = parse_ok(&["a..href"]);
        let spec = q.spec.borrow();
        assert!(spec.is_flag_set(spec_flags::ATTRIBUTES_USED));
        let expr = spec.columns[0].borrow().expr.clone();
        assert_eq!(expr.borrow().opcode(), Opcode::Attr);
        // The path argument never needs text content.
        let pr = spec.input.path_refs.get("a").unwrap();
        use crate::query::expr::path_flags;
        assert!(pr.borrow().has_flag(path_flags::NO_DATA));
    }

    #[test]
    fn test_braced_path_atoms() {
        let q = parse_ok(&["{weird.name}.x"]);
        let spec = q.spec.borrow();
        assert!(spec.input.path_refs.contains_key("{weird.name}.x"));
    }

    #[test]
    fn test_unbalanced_braces() {
        let err = parse(&["{a.b"]).unwrap_err();
        assert!(
            err.message().contains("Unbalanced braces")
                || err.message().contains("Expected")
        );
    }

    #[test]
    fn test_multi_names_only_for_pivot() {
        let err = parse(&["a,b:c"]).unwrap_err();
        assert!(err.message().contains("only valid for pivot"));
    }

    #[test]
    fn test_spread_only_for_pivot() {
        let err = parse(&["...:c"]).unwrap_err();
        assert!(err.message().contains("only valid for pivot"));
    }

    #[test]
    fn test_pivot_binding() {
        let q = parse_ok(&["a,b,...:pivot[names,vals]", "k"]);
        let (column, names) = q.pivot_binding.expect("pivot bound");
        assert_eq!(column.borrow().name, "__column_pivot");
        assert_eq!(names, vec!["a", "b", "..."]);
    }

    #[test]
    fn test_circular_column_reference() {
        let err = parse(&["a:b", "b:a"]).unwrap_err();
        assert!(err.message().contains("Circular column reference"));
    }

    #[test]
    fn test_case_directive() {
        let q = parse_ok(&["--case", "A", "a"]);
        let spec = q.spec.borrow();
        assert!(spec.case_sensitive);
        // With case sensitivity on, A and a are distinct paths.
        assert_eq!(spec.input.path_refs.len(), 2);
    }

    #[test]
    fn test_help_flag() {
        let q = parse_ok(&["--help"]);
        assert!(q.spec.borrow().is_flag_set(spec_flags::SHOW_USAGE));
    }

    #[test]
    fn test_scope_rename() {
        let q = parse_ok(&["j:join[r.csv]", "a", "x:j::k", "where[a==j::k]"]);
        let spec = q.spec.borrow();
        assert_eq!(spec.join.scope_name, "j");
        assert!(!spec.join.columns.is_empty());
    }

    #[test]
    fn test_missing_expression() {
        assert!(parse(&[""]).is_err());
    }

    #[test]
    fn test_leading_plus_rejected() {
        let err = parse(&["+a"]).unwrap_err();
        assert!(err.message().contains("Positive operator"));
    }

    #[test]
    fn test_string_escape_in_literal() {
        let q = parse_ok(&["x:\"a\\\"b\""]);
        let spec = q.spec.borrow();
        let expr = spec.columns[0].borrow().expr.clone();
        assert_eq!(expr.borrow().value.as_str(), "a\"b");
    }

    #[test]
    fn test_concat_types() {
        let q = parse_ok(&["x:\"$\"&round[1.5,2]&\"K\""]);
        let spec = q.spec.borrow();
        let expr = spec.columns[0].borrow().expr.clone();
        assert_eq!(expr.borrow().ty, TypeTag::String);
    }
}
