// File: src/parser.rs
//
// Pratt parser for Pluto source.
//
// The unusual part of the grammar is pattern calls: a call is a bare
// sequence of literal identifiers and arguments, e.g. `slice $xs from 1
// to n`. After a prefix expression is parsed, if it can begin a call
// and the next token can be part of one, the parser switches into
// pattern parsing and collects the rest of the call.

use crate::ast::{Arm, DefItem, EmittedItem, Expr, PatternPart, Stmt};
use crate::errors::{PlutoError, SourceLocation};
use crate::lexer::{Token, TokenKind};

/* Precedence ladder, lowest binds loosest */
const LOWEST: u8 = 0;
const ASSIGN: u8 = 1;
const OR: u8 = 2;
const AND: u8 = 3;
const BIT_OR: u8 = 4;
const BIT_AND: u8 = 5;
const EQUALS: u8 = 6;
const COMPARE: u8 = 7;
const SUM: u8 = 8;
const PRODUCT: u8 = 9;
const EXP: u8 = 10;
const PREFIX: u8 = 11;
const METHOD_CALL: u8 = 12;
const INDEX: u8 = 13;

fn precedence_of(kind: &TokenKind) -> u8 {
    match kind {
        TokenKind::Operator(op) => match op.as_str() {
            "=" | ":=" | "+=" | "-=" | "*=" | "/=" | "%=" | "//=" | "**=" | "|=" | "&=" | "&&="
            | "||=" => ASSIGN,
            "||" => OR,
            "&&" => AND,
            "|" => BIT_OR,
            "&" => BIT_AND,
            "==" | "!=" => EQUALS,
            "<" | ">" | "<=" | ">=" => COMPARE,
            "+" | "-" => SUM,
            "*" | "/" | "%" => PRODUCT,
            "**" | "//" => EXP,
            "::" => METHOD_CALL,
            _ => LOWEST,
        },
        TokenKind::Punct(':') => METHOD_CALL,
        TokenKind::Punct('.') => INDEX,
        TokenKind::Punct('[') => INDEX,
        _ => LOWEST,
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    pub errors: Vec<PlutoError>,
    file: Option<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, errors: Vec::new(), file: None }
    }

    pub fn with_file(mut self, file: String) -> Self {
        self.file = Some(file);
        self
    }

    pub fn parse(&mut self) -> Vec<Stmt> {
        let mut program = Vec::new();

        while !self.at_eof() {
            if self.current_is_punct(';') {
                self.advance();
                continue;
            }

            let before = self.pos;

            if let Some(stmt) = self.parse_statement() {
                program.push(stmt);
            }

            // Always make progress, even through unparseable input
            if self.pos == before {
                self.advance();
            }
        }

        program
    }

    /* Token plumbing */

    fn current(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos + 1).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.current(), TokenKind::Eof)
    }

    fn location(&self) -> SourceLocation {
        let loc = self
            .tokens
            .get(self.pos)
            .map(|t| SourceLocation::new(t.line, t.column))
            .unwrap_or_else(SourceLocation::unknown);

        match &self.file {
            Some(file) => loc.with_file(file.clone()),
            None => loc,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let location = self.location();
        self.errors.push(PlutoError::parse(message, location));
    }

    fn current_is_punct(&self, c: char) -> bool {
        matches!(self.current(), TokenKind::Punct(p) if *p == c)
    }

    fn current_is_op(&self, op: &str) -> bool {
        matches!(self.current(), TokenKind::Operator(o) if o == op)
    }

    fn current_is_keyword(&self, word: &str) -> bool {
        matches!(self.current(), TokenKind::Keyword(k) if k == word)
    }

    fn expect_punct(&mut self, c: char) -> bool {
        if self.current_is_punct(c) {
            self.advance();
            true
        } else {
            self.error(format!("expected `{}`, found {:?}", c, self.current()));
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> bool {
        if self.current_is_keyword(word) {
            self.advance();
            true
        } else {
            self.error(format!("expected `{}`, found {:?}", word, self.current()));
            false
        }
    }

    /// Consume a single inserted semicolon when the token after it is
    /// interesting — lets `}` and `else` sit on separate lines.
    fn skip_semi_before_keyword(&mut self, words: &[&str]) {
        if self.current_is_punct(';') {
            if let TokenKind::Keyword(next) = self.peek() {
                if words.contains(&next.as_str()) {
                    self.advance();
                }
            }
        }
    }

    /* Statements */

    fn parse_statement(&mut self) -> Option<Stmt> {
        match self.current().clone() {
            TokenKind::Keyword(word) => match word.as_str() {
                "return" => {
                    self.advance();
                    let value = if self.current_is_punct(';') || self.current_is_punct('}') {
                        None
                    } else {
                        Some(self.parse_expression(LOWEST)?)
                    };
                    self.end_statement();
                    Some(Stmt::Return(value))
                }
                "next" => {
                    self.advance();
                    self.end_statement();
                    Some(Stmt::Next)
                }
                "break" => {
                    self.advance();
                    self.end_statement();
                    Some(Stmt::Break)
                }
                "def" => self.parse_def(false),
                "init" => self.parse_def(true),
                "class" => self.parse_class(),
                "use" => self.parse_use(true),
                "import" => self.parse_use(false),
                _ => self.parse_expression_statement(),
            },
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_expression_statement(&mut self) -> Option<Stmt> {
        let expr = self.parse_expression(LOWEST)?;
        self.end_statement();
        Some(Stmt::Expression(expr))
    }

    fn end_statement(&mut self) {
        if self.current_is_punct(';') {
            self.advance();
        }
    }

    fn parse_def(&mut self, is_init: bool) -> Option<Stmt> {
        self.advance();
        let pattern = self.parse_def_pattern()?;

        if pattern.is_empty() {
            self.error("expected at least one item in a pattern");
            return None;
        }

        let body = self.parse_block()?;
        self.end_statement();

        if is_init {
            Some(Stmt::InitDef { pattern, body })
        } else {
            Some(Stmt::FunctionDef { pattern, body })
        }
    }

    /// A definition pattern runs from `def`/`init` to the opening brace
    fn parse_def_pattern(&mut self) -> Option<Vec<DefItem>> {
        let mut pattern = Vec::new();

        while !self.current_is_punct('{') && !self.at_eof() {
            match self.current().clone() {
                TokenKind::Ident(name) => pattern.push(DefItem::Ident(name)),
                TokenKind::Keyword(word) => pattern.push(DefItem::Ident(word)),
                TokenKind::Param(name) => pattern.push(DefItem::Param(name)),
                other => {
                    self.error(format!("unexpected {:?} in a definition pattern", other));
                    return None;
                }
            }
            self.advance();
        }

        Some(pattern)
    }

    fn parse_class(&mut self) -> Option<Stmt> {
        self.advance();

        let name = match self.current().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                self.error(format!("expected a class name, found {:?}", other));
                return None;
            }
        };

        let parent = if self.current_is_keyword("extends") {
            self.advance();
            match self.current().clone() {
                TokenKind::Ident(parent) => {
                    self.advance();
                    Some(parent)
                }
                other => {
                    self.error(format!("expected a parent class name, found {:?}", other));
                    return None;
                }
            }
        } else {
            None
        };

        let body = self.parse_block()?;
        self.end_statement();

        Some(Stmt::ClassDef { name, parent, body })
    }

    fn parse_use(&mut self, is_use: bool) -> Option<Stmt> {
        self.advance();

        match self.current().clone() {
            TokenKind::Str(path) => {
                self.advance();
                self.end_statement();
                if is_use {
                    Some(Stmt::Use(path))
                } else {
                    Some(Stmt::Import(path))
                }
            }
            other => {
                self.error(format!("expected a package path string, found {:?}", other));
                None
            }
        }
    }

    /// Parse `{ statements }`; the current token must be the brace
    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        if !self.expect_punct('{') {
            return None;
        }

        let mut statements = Vec::new();

        while !self.current_is_punct('}') && !self.at_eof() {
            if self.current_is_punct(';') {
                self.advance();
                continue;
            }

            let before = self.pos;

            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            }

            if self.pos == before {
                self.advance();
            }
        }

        self.expect_punct('}');
        Some(statements)
    }

    /* Expressions */

    fn parse_expression(&mut self, precedence: u8) -> Option<Expr> {
        let was_param = matches!(self.current(), TokenKind::Param(_));
        let mut left = self.parse_prefix()?;

        // Pattern-call detection: `print $x`, `5 to 10`, `$a to $b`
        if self.can_begin_call(&left) && self.can_continue_call() {
            let first = if was_param {
                PatternPart::Arg(left)
            } else if let Expr::Identifier(name) = &left {
                PatternPart::Ident(name.clone())
            } else {
                PatternPart::Arg(left)
            };

            left = self.parse_call_with(Some(first))?;
        }

        while !self.current_is_punct(';') && precedence < precedence_of(self.current()) {
            left = self.parse_infix(left)?;
        }

        Some(left)
    }

    fn can_begin_call(&self, left: &Expr) -> bool {
        matches!(
            left,
            Expr::Identifier(_)
                | Expr::Number(_)
                | Expr::Boolean(_)
                | Expr::Str(_)
                | Expr::Char(_)
                | Expr::Null
                | Expr::Array(_)
                | Expr::Tuple(_)
                | Expr::Map(_)
                | Expr::BlockLiteral { .. }
        )
    }

    /// Can the current token continue a pattern call?
    fn can_continue_call(&self) -> bool {
        match self.current() {
            TokenKind::Param(_)
            | TokenKind::Ident(_)
            | TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::CharLit(_) => true,
            TokenKind::Keyword(word) => {
                // `if`, `while`, `for` and `match` never begin an
                // argument, so `while` headers like `while (x) {` don't
                // parse as calls
                !matches!(word.as_str(), "if" | "while" | "for" | "match" | "elif" | "else")
            }
            TokenKind::Operator(op) => op == "!",
            TokenKind::Punct(c) => matches!(c, '(' | '{'),
            _ => false,
        }
    }

    fn parse_call_with(&mut self, first: Option<PatternPart>) -> Option<Expr> {
        let mut pattern = Vec::new();

        if let Some(first) = first {
            pattern.push(first);
        }

        pattern.extend(self.parse_call_pattern()?);

        if pattern.is_empty() {
            self.error("expected at least one item in a pattern");
            return None;
        }

        Some(Expr::Call { pattern })
    }

    /// Collect pattern items until a token that cannot continue a call
    fn parse_call_pattern(&mut self) -> Option<Vec<PatternPart>> {
        let mut pattern = Vec::new();

        while self.can_continue_call() {
            match self.current().clone() {
                TokenKind::Ident(name) => {
                    pattern.push(PatternPart::Ident(name));
                    self.advance();
                }
                TokenKind::Param(name) => {
                    pattern.push(PatternPart::Arg(Expr::Identifier(name)));
                    self.advance();
                }
                TokenKind::Keyword(word)
                    if !matches!(word.as_str(), "true" | "false" | "null" | "try" | "emit") =>
                {
                    // Keywords are allowed as pattern literals
                    pattern.push(PatternPart::Ident(word));
                    self.advance();
                }
                _ => {
                    let arg = self.parse_prefix()?;
                    pattern.push(PatternPart::Arg(arg));
                }
            }
        }

        Some(pattern)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        match self.current().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Some(Expr::Identifier(name))
            }
            TokenKind::Param(name) => {
                // A parameter reference inside a function body
                self.advance();
                Some(Expr::Identifier(name))
            }
            TokenKind::Number(n) => {
                self.advance();
                Some(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(Expr::Str(s))
            }
            TokenKind::CharLit(c) => {
                self.advance();
                Some(Expr::Char(c))
            }
            TokenKind::Keyword(word) => self.parse_keyword_prefix(&word),
            TokenKind::Operator(op) if matches!(op.as_str(), "-" | "+" | "!") => {
                self.advance();
                let right = self.parse_expression(PREFIX)?;
                Some(Expr::Prefix { op, right: Box::new(right) })
            }
            TokenKind::Punct('(') => self.parse_grouped(),
            TokenKind::Punct('[') => self.parse_array_or_map(),
            TokenKind::Punct('{') => self.parse_block_literal(),
            TokenKind::Punct('\\') => {
                // Explicit call marker, mostly for zero-argument
                // patterns: `\greet`
                self.advance();
                self.parse_call_with(None)
            }
            other => {
                self.error(format!("unexpected token {:?}", other));
                None
            }
        }
    }

    fn parse_keyword_prefix(&mut self, word: &str) -> Option<Expr> {
        match word {
            "true" | "false" => {
                self.advance();
                Some(Expr::Boolean(word == "true"))
            }
            "null" => {
                self.advance();
                Some(Expr::Null)
            }
            "if" => self.parse_if(),
            "while" => self.parse_while(),
            "for" => self.parse_for(),
            "match" => self.parse_match(),
            "try" => self.parse_try(),
            "emit" => self.parse_emission(),
            other => {
                self.error(format!("unexpected keyword `{}`", other));
                None
            }
        }
    }

    fn parse_grouped(&mut self) -> Option<Expr> {
        self.advance();

        if self.current_is_punct(')') {
            self.advance();
            return Some(Expr::Tuple(Vec::new()));
        }

        let first = self.parse_expression(LOWEST)?;

        if self.current_is_punct(',') {
            let mut elements = vec![first];

            while self.current_is_punct(',') {
                self.advance();
                if self.current_is_punct(')') {
                    break;
                }
                elements.push(self.parse_expression(LOWEST)?);
            }

            self.expect_punct(')');
            return Some(Expr::Tuple(elements));
        }

        self.expect_punct(')');
        Some(first)
    }

    fn parse_array_or_map(&mut self) -> Option<Expr> {
        self.advance();

        // `[:]` is the empty map
        if self.current_is_punct(':') {
            self.advance();
            self.expect_punct(']');
            return Some(Expr::Map(Vec::new()));
        }

        if self.current_is_punct(']') {
            self.advance();
            return Some(Expr::Array(Vec::new()));
        }

        // Map literals are detected by the `:` after the first key;
        // keys parse above the method-call precedence so the colon is
        // left for us
        if matches!(self.peek(), TokenKind::Punct(':')) {
            let mut pairs = Vec::new();

            loop {
                let key = self.parse_expression(METHOD_CALL)?;
                if !self.expect_punct(':') {
                    return None;
                }
                let value = self.parse_expression(LOWEST)?;
                pairs.push((key, value));

                if self.current_is_punct(',') {
                    self.advance();
                    if self.current_is_punct(']') {
                        break;
                    }
                } else {
                    break;
                }
            }

            self.expect_punct(']');
            return Some(Expr::Map(pairs));
        }

        let mut elements = vec![self.parse_expression(LOWEST)?];

        while self.current_is_punct(',') {
            self.advance();
            if self.current_is_punct(']') {
                break;
            }
            elements.push(self.parse_expression(LOWEST)?);
        }

        self.expect_punct(']');
        Some(Expr::Array(elements))
    }

    /// `{ |a, b| -> stmts }` or `{ stmts }`
    fn parse_block_literal(&mut self) -> Option<Expr> {
        self.advance();
        let mut params = Vec::new();

        if self.current_is_op("|") {
            self.advance();

            while !self.current_is_op("|") && !self.at_eof() {
                match self.current().clone() {
                    TokenKind::Ident(name) => {
                        params.push(name);
                        self.advance();
                    }
                    TokenKind::Punct(',') => self.advance(),
                    other => {
                        self.error(format!("unexpected {:?} in block parameters", other));
                        return None;
                    }
                }
            }

            if !self.current_is_op("|") {
                self.error("unterminated block parameter list");
                return None;
            }
            self.advance();

            if self.current_is_op("->") {
                self.advance();
            }
        }

        let mut body = Vec::new();

        while !self.current_is_punct('}') && !self.at_eof() {
            if self.current_is_punct(';') {
                self.advance();
                continue;
            }

            let before = self.pos;

            if let Some(stmt) = self.parse_statement() {
                body.push(stmt);
            }

            if self.pos == before {
                self.advance();
            }
        }

        self.expect_punct('}');
        Some(Expr::BlockLiteral { params, body })
    }

    fn parse_if(&mut self) -> Option<Expr> {
        self.advance();

        if !self.expect_punct('(') {
            return None;
        }
        let condition = self.parse_expression(LOWEST)?;
        if !self.expect_punct(')') {
            return None;
        }

        let consequence = self.parse_block()?;

        self.skip_semi_before_keyword(&["else", "elif"]);

        let alternative = if self.current_is_keyword("else") {
            self.advance();
            Some(self.parse_block()?)
        } else if self.current_is_keyword("elif") {
            // An elif chain becomes a nested if inside a synthetic
            // block; parse_if skips the leading keyword either way
            let nested = self.parse_if()?;
            Some(vec![Stmt::Expression(nested)])
        } else {
            None
        };

        Some(Expr::If { condition: Box::new(condition), consequence, alternative })
    }

    fn parse_while(&mut self) -> Option<Expr> {
        self.advance();

        if !self.expect_punct('(') {
            return None;
        }
        let condition = self.parse_expression(LOWEST)?;
        if !self.expect_punct(')') {
            return None;
        }

        let body = self.parse_block()?;
        Some(Expr::While { condition: Box::new(condition), body })
    }

    /// `for (x : collection) { … }`
    fn parse_for(&mut self) -> Option<Expr> {
        self.advance();

        if !self.expect_punct('(') {
            return None;
        }

        let var = match self.current().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                self.error(format!("expected a loop variable, found {:?}", other));
                return None;
            }
        };

        if !self.expect_punct(':') {
            return None;
        }

        let collection = self.parse_expression(LOWEST)?;

        if !self.expect_punct(')') {
            return None;
        }

        let body = self.parse_block()?;
        Some(Expr::For { var, collection: Box::new(collection), body })
    }

    fn parse_match(&mut self) -> Option<Expr> {
        self.advance();

        if !self.expect_punct('(') {
            return None;
        }
        let subject = self.parse_expression(LOWEST)?;
        if !self.expect_punct(')') {
            return None;
        }

        let arms = self.parse_arms()?;
        Some(Expr::Match { subject: Box::new(subject), arms })
    }

    fn parse_try(&mut self) -> Option<Expr> {
        self.advance();
        let body = self.parse_block()?;

        self.skip_semi_before_keyword(&["catch"]);

        if !self.expect_keyword("catch") {
            return None;
        }
        if !self.expect_punct('(') {
            return None;
        }

        let err_name = match self.current().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            other => {
                self.error(format!("expected an error binding name, found {:?}", other));
                return None;
            }
        };

        if !self.expect_punct(')') {
            return None;
        }

        let arms = self.parse_arms()?;
        Some(Expr::Try { body, err_name, arms })
    }

    /// `{ exprs => body, * => body }` for match and catch
    fn parse_arms(&mut self) -> Option<Vec<Arm>> {
        if !self.expect_punct('{') {
            return None;
        }

        let mut arms = Vec::new();

        while !self.current_is_punct('}') && !self.at_eof() {
            if self.current_is_punct(';') || self.current_is_punct(',') {
                self.advance();
                continue;
            }

            let exprs = if self.current_is_op("*") {
                self.advance();
                None
            } else {
                let mut list = vec![self.parse_expression(LOWEST)?];

                while self.current_is_punct(',') {
                    self.advance();
                    list.push(self.parse_expression(LOWEST)?);
                }

                Some(list)
            };

            if !self.current_is_op("=>") {
                self.error(format!("expected `=>` in an arm, found {:?}", self.current()));
                return None;
            }
            self.advance();

            let body = if self.current_is_punct('{') {
                self.parse_block()?
            } else {
                vec![self.parse_statement()?]
            };

            arms.push(Arm { exprs, body });
        }

        self.expect_punct('}');
        Some(arms)
    }

    /// `emit (LOAD_CONST 0, DUP, expr)` — raw bytecode inline
    fn parse_emission(&mut self) -> Option<Expr> {
        self.advance();

        if !self.expect_punct('(') {
            return None;
        }

        let mut items = Vec::new();

        while !self.current_is_punct(')') && !self.at_eof() {
            if self.current_is_punct(',') {
                self.advance();
                continue;
            }

            match self.current().clone() {
                TokenKind::Ident(name)
                    if name.chars().all(|c| c.is_ascii_uppercase() || c == '_') =>
                {
                    self.advance();

                    let arg = match self.current() {
                        TokenKind::Number(n) => {
                            let arg = *n as u16;
                            self.advance();
                            Some(arg)
                        }
                        _ => None,
                    };

                    items.push(EmittedItem::Instruction { name, arg });
                }
                _ => {
                    let expr = self.parse_expression(LOWEST)?;
                    items.push(EmittedItem::Expr(expr));
                }
            }
        }

        self.expect_punct(')');
        Some(Expr::Emission(items))
    }

    /* Infix expressions */

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        match self.current().clone() {
            TokenKind::Operator(op) => match op.as_str() {
                "=" => {
                    self.advance();
                    let value = self.parse_expression(LOWEST)?;
                    Some(Expr::Assign { name: Box::new(left), value: Box::new(value) })
                }
                ":=" => {
                    self.advance();
                    let value = self.parse_expression(LOWEST)?;
                    Some(Expr::Declare { name: Box::new(left), value: Box::new(value) })
                }
                "::" => {
                    self.advance();
                    let pattern = self.parse_call_pattern()?;

                    if pattern.is_empty() {
                        self.error("expected a pattern after `::`");
                        return None;
                    }

                    Some(Expr::QualifiedCall { base: Box::new(left), pattern })
                }
                "+=" | "-=" | "*=" | "/=" | "%=" | "//=" | "**=" | "|=" | "&=" | "&&=" | "||=" => {
                    // Shorthand assignment desugars in the parser
                    self.advance();
                    let right = self.parse_expression(LOWEST)?;
                    let inner_op = op[..op.len() - 1].to_string();

                    Some(Expr::Assign {
                        name: Box::new(left.clone()),
                        value: Box::new(Expr::Infix {
                            op: inner_op,
                            left: Box::new(left),
                            right: Box::new(right),
                        }),
                    })
                }
                _ => {
                    let precedence = precedence_of(self.current());
                    self.advance();
                    let right = self.parse_expression(precedence)?;
                    Some(Expr::Infix { op, left: Box::new(left), right: Box::new(right) })
                }
            },
            TokenKind::Punct('.') => {
                self.advance();
                let right = self.parse_expression(INDEX)?;
                Some(Expr::Dot { left: Box::new(left), right: Box::new(right) })
            }
            TokenKind::Punct('[') => {
                self.advance();
                let index = self.parse_expression(LOWEST)?;
                self.expect_punct(']');
                Some(Expr::Index { collection: Box::new(left), index: Box::new(index) })
            }
            TokenKind::Punct(':') => {
                self.advance();
                let pattern = self.parse_call_pattern()?;

                if pattern.is_empty() {
                    self.error("expected a pattern after `:`");
                    return None;
                }

                Some(Expr::MethodCall { receiver: Box::new(left), pattern })
            }
            other => {
                self.error(format!("no infix parser for {:?}", other));
                None
            }
        }
    }
}
