//! Recursive descent parser with precedence climbing.
//!
//! Precedence, lowest to highest: `or` < `and` < equality < comparison <
//! term < factor < unary < call < primary.
//!
//! Besides building the AST, the parser enforces the language's layout:
//! globals before `on_` functions before helper functions, helper functions
//! only after their first call site, blocks opened by ` {` and closed at the
//! enclosing indentation, every statement at exactly `depth * 4` spaces,
//! binary operators surrounded by exactly one space, no consecutive blank
//! lines, and a mandatory blank line between top-level items.

use std::collections::HashSet;

use grug_core::Type;

use crate::ast::*;
use crate::error::{CompileError, Result, bail, ensure};
use crate::tokenizer::{SPACES_PER_INDENT, Token, TokenKind, tokenize};

const MAX_PARSING_DEPTH: usize = 100;
const MAX_CALL_ARGUMENTS: usize = 69;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    indentation: usize,
    depth: usize,
    /// Helper names seen at call sites so far; a helper definition must
    /// appear after its first use.
    called_helper_fn_names: HashSet<String>,
}

impl Parser {
    pub fn new(source: &str) -> Result<Parser> {
        Ok(Parser {
            tokens: tokenize(source)?,
            pos: 0,
            indentation: 0,
            depth: 0,
            called_helper_fn_names: HashSet::new(),
        })
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self, ahead: usize) -> Result<&Token> {
        match self.tokens.get(self.pos + ahead) {
            Some(token) => Ok(token),
            None => bail!("Unexpected end of the file"),
        }
    }

    fn peek_kind(&self, ahead: usize) -> TokenKind {
        self.tokens
            .get(self.pos + ahead)
            .map(|t| t.kind)
            // Newline is unreachable in every lookahead that uses the
            // default; it just has to be something no branch matches.
            .unwrap_or(TokenKind::Newline)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Result<Token> {
        let token = self.peek(0)?.clone();
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        let token = self.peek(0)?;
        ensure!(
            token.kind == kind,
            line token.line,
            "Expected token type {}, but got {} on line {}",
            kind.name(),
            token.kind.name(),
            token.line
        );
        self.advance()
    }

    fn consume_space(&mut self) -> Result<()> {
        self.expect(TokenKind::Space)?;
        Ok(())
    }

    fn consume_newline(&mut self) -> Result<()> {
        self.expect(TokenKind::Newline)?;
        Ok(())
    }

    fn consume_indentation(&mut self) -> Result<()> {
        let token = self.peek(0)?;
        ensure!(
            token.kind == TokenKind::Indentation,
            line token.line,
            "Expected token type {}, but got {} on line {}",
            TokenKind::Indentation.name(),
            token.kind.name(),
            token.line
        );
        let expected = self.indentation * SPACES_PER_INDENT;
        ensure!(
            token.text.len() == expected,
            line token.line,
            "Expected {} spaces, but got {} spaces on line {}",
            expected,
            token.text.len(),
            token.line
        );
        self.pos += 1;
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        ensure!(
            self.depth < MAX_PARSING_DEPTH,
            "There is a function that contains more than {} levels of nested expressions",
            MAX_PARSING_DEPTH
        );
        Ok(())
    }

    fn leave(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }

    // ---- Expressions ----

    fn parse_i32(&self, token: &Token) -> Result<i32> {
        // The minus symbol tokenizes separately, so the text is always an
        // unsigned decimal.
        match token.text.parse::<i32>() {
            Ok(n) => Ok(n),
            Err(_) => Err(CompileError::at_line(
                token.line,
                format!(
                    "The i32 {} is too big, which has a maximum value of {}",
                    token.text,
                    i32::MAX
                ),
            )),
        }
    }

    fn parse_f32(&self, token: &Token) -> Result<f32> {
        let value: f32 = match token.text.parse() {
            Ok(value) => value,
            Err(_) => bail!(line token.line, "The f32 {} is malformed", token.text),
        };
        ensure!(
            value.is_finite(),
            line token.line,
            "The f32 {} is too big",
            token.text
        );
        // "0.0000000001" parses to a subnormal-or-zero value; flag the ones
        // that collapsed to zero without being written as zero.
        let all_zero_digits = token.text.bytes().all(|b| b == b'0' || b == b'.');
        ensure!(
            value != 0.0 || all_zero_digits,
            line token.line,
            "The f32 {} is too close to zero",
            token.text
        );
        Ok(value)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        self.enter()?;
        let token = self.peek(0)?.clone();

        let expr = match token.kind {
            TokenKind::OpenParen => {
                self.pos += 1;
                let inner = self.parse_expression()?;
                self.expect(TokenKind::CloseParen)?;
                Expr::new(ExprKind::Parenthesized(Box::new(inner)))
            }
            TokenKind::True => {
                self.pos += 1;
                Expr::new(ExprKind::True)
            }
            TokenKind::False => {
                self.pos += 1;
                Expr::new(ExprKind::False)
            }
            TokenKind::StringLit => {
                self.pos += 1;
                Expr::new(ExprKind::StringLit(token.text))
            }
            TokenKind::Word => {
                self.pos += 1;
                Expr::new(ExprKind::Identifier(token.text))
            }
            TokenKind::I32Lit => {
                self.pos += 1;
                Expr::new(ExprKind::I32(self.parse_i32(&token)?))
            }
            TokenKind::F32Lit => {
                self.pos += 1;
                Expr::new(ExprKind::F32 {
                    value: self.parse_f32(&token)?,
                    text: token.text,
                })
            }
            kind => bail!(
                line token.line,
                "Expected a primary expression token, but got token type {} on line {}",
                kind.name(),
                token.line
            ),
        };

        self.leave();
        Ok(expr)
    }

    fn parse_call(&mut self) -> Result<Expr> {
        self.enter()?;
        let expr = self.parse_primary()?;

        if self.peek_kind(0) != TokenKind::OpenParen {
            self.leave();
            return Ok(expr);
        }
        let line = self.line();
        self.pos += 1;

        let name = match expr.kind {
            ExprKind::Identifier(name) => name,
            _ => bail!(
                line line,
                "Unexpected open parenthesis after a non-identifier expression on line {}",
                line
            ),
        };

        if name.starts_with("helper_") {
            self.called_helper_fn_names.insert(name.clone());
        }

        let mut args = Vec::new();
        if self.peek_kind(0) == TokenKind::CloseParen {
            self.pos += 1;
            self.leave();
            return Ok(Expr::new(ExprKind::Call { name, args }));
        }

        loop {
            ensure!(
                args.len() < MAX_CALL_ARGUMENTS,
                "There are more than {} arguments to a function call, exceeding the maximum",
                MAX_CALL_ARGUMENTS
            );
            args.push(self.parse_expression()?);

            if self.peek_kind(0) != TokenKind::Comma {
                self.expect(TokenKind::CloseParen)?;
                break;
            }
            self.pos += 1;
            self.consume_space()?;
        }

        self.leave();
        Ok(Expr::new(ExprKind::Call { name, args }))
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.enter()?;
        let kind = self.peek_kind(0);
        if kind == TokenKind::Minus || kind == TokenKind::Not {
            self.pos += 1;
            let op = if kind == TokenKind::Not {
                self.consume_space()?;
                UnaryOp::Not
            } else {
                UnaryOp::Neg
            };
            let operand = Box::new(self.parse_unary()?);
            self.leave();
            return Ok(Expr::new(ExprKind::Unary { op, operand }));
        }

        let expr = self.parse_call()?;
        self.leave();
        Ok(expr)
    }

    /// One precedence level: `parse_next` while the lookahead is
    /// ` <operator> `.
    fn parse_binary_level(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        parse_next: fn(&mut Parser) -> Result<Expr>,
    ) -> Result<Expr> {
        self.enter()?;
        let mut expr = parse_next(self)?;

        while self.peek_kind(0) == TokenKind::Space {
            let next = self.peek_kind(1);
            let Some(&(_, op)) = ops.iter().find(|(kind, _)| *kind == next) else {
                break;
            };
            self.pos += 2;
            self.consume_space()?;
            let rhs = parse_next(self)?;
            expr = Expr::new(ExprKind::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            });
        }

        self.leave();
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
            Parser::parse_unary,
        )
    }

    fn parse_term(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
            Parser::parse_factor,
        )
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[
                (TokenKind::Ge, BinaryOp::Ge),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Lt, BinaryOp::Lt),
            ],
            Parser::parse_term,
        )
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_binary_level(
            &[(TokenKind::Eq, BinaryOp::Eq), (TokenKind::Ne, BinaryOp::Ne)],
            Parser::parse_comparison,
        )
    }

    fn parse_logical_level(
        &mut self,
        kind: TokenKind,
        op: LogicalOp,
        parse_next: fn(&mut Parser) -> Result<Expr>,
    ) -> Result<Expr> {
        self.enter()?;
        let mut expr = parse_next(self)?;

        while self.peek_kind(0) == TokenKind::Space && self.peek_kind(1) == kind {
            self.pos += 2;
            self.consume_space()?;
            let rhs = parse_next(self)?;
            expr = Expr::new(ExprKind::Logical {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            });
        }

        self.leave();
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_logical_level(TokenKind::And, LogicalOp::And, Parser::parse_equality)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_logical_level(TokenKind::Or, LogicalOp::Or, Parser::parse_and)
    }

    // Recursive descent parsing inspired by the Crafting Interpreters book:
    // https://craftinginterpreters.com/parsing-expressions.html
    fn parse_expression(&mut self) -> Result<Expr> {
        self.enter()?;
        let expr = self.parse_or()?;
        self.leave();
        Ok(expr)
    }

    // ---- Statements ----

    fn parse_type_word(&mut self) -> Result<(Type, String)> {
        let token = self.expect(TokenKind::Word)?;
        Ok((Type::parse(&token.text), token.text))
    }

    fn parse_local_variable(&mut self) -> Result<VariableStatement> {
        let name_line = self.line();
        let name = self.advance()?.text;

        let mut declared_type = None;
        if self.peek_kind(0) == TokenKind::Colon {
            self.pos += 1;

            ensure!(
                name != "me",
                "The local variable 'me' has to have its name changed to something else, since grug already declares that variable"
            );

            self.consume_space()?;
            let token = self.peek(0)?;
            ensure!(
                token.kind == TokenKind::Word,
                line token.line,
                "Expected a word token after the colon on line {}",
                name_line
            );
            let (ty, type_name) = self.parse_type_word()?;
            ensure!(
                ty != Type::Resource,
                "The variable '{}' can't have 'resource' as its type",
                name
            );
            ensure!(
                ty != Type::Entity,
                "The variable '{}' can't have 'entity' as its type",
                name
            );
            declared_type = Some((ty, type_name));
        }

        ensure!(
            self.peek_kind(0) == TokenKind::Space,
            line name_line,
            "The variable '{}' was not assigned a value on line {}",
            name,
            name_line
        );
        self.consume_space()?;
        self.expect(TokenKind::Assign)?;

        ensure!(
            name != "me",
            "Assigning a new value to the entity's 'me' variable is not allowed"
        );

        self.consume_space()?;
        let value = self.parse_expression()?;

        Ok(VariableStatement { name, declared_type, value })
    }

    fn parse_global_variable(&mut self) -> Result<GlobalVariable> {
        let name_line = self.line();
        let name = self.advance()?.text;

        ensure!(
            name != "me",
            "The global variable 'me' has to have its name changed to something else, since grug already declares that variable"
        );

        self.expect(TokenKind::Colon)?;
        self.consume_space()?;
        let (ty, type_name) = self.parse_type_word()?;
        ensure!(
            ty != Type::Resource,
            "The global variable '{}' can't have 'resource' as its type",
            name
        );
        ensure!(
            ty != Type::Entity,
            "The global variable '{}' can't have 'entity' as its type",
            name
        );

        ensure!(
            self.peek_kind(0) == TokenKind::Space,
            line name_line,
            "The global variable '{}' was not assigned a value on line {}",
            name,
            name_line
        );
        self.consume_space()?;
        self.expect(TokenKind::Assign)?;
        self.consume_space()?;
        let value = self.parse_expression()?;

        Ok(GlobalVariable { name, ty, type_name, value })
    }

    fn parse_if_statement(&mut self) -> Result<Statement> {
        self.enter()?;
        self.consume_space()?;
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;

        let mut else_body = Vec::new();
        if self.peek_kind(0) == TokenKind::Space {
            self.pos += 1;
            self.expect(TokenKind::Else)?;

            if self.peek_kind(0) == TokenKind::Space && self.peek_kind(1) == TokenKind::If {
                self.pos += 2;
                else_body.push(self.parse_if_statement()?);
            } else {
                else_body = self.parse_block()?;
            }
        }

        self.leave();
        Ok(Statement::If { condition, then_body, else_body })
    }

    fn parse_while_statement(&mut self) -> Result<Statement> {
        self.enter()?;
        self.consume_space()?;
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        self.leave();
        Ok(Statement::While { condition, body })
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        self.enter()?;
        let token = self.peek(0)?.clone();

        let statement = match token.kind {
            TokenKind::Word => match self.peek_kind(1) {
                TokenKind::OpenParen => Statement::Call(self.parse_call()?),
                TokenKind::Colon | TokenKind::Space => {
                    Statement::Variable(self.parse_local_variable()?)
                }
                _ => bail!(
                    line token.line,
                    "Expected '(', or ':', or ' =' after the word '{}' on line {}",
                    token.text,
                    token.line
                ),
            },
            TokenKind::If => {
                self.pos += 1;
                self.parse_if_statement()?
            }
            TokenKind::Return => {
                self.pos += 1;
                if self.peek_kind(0) == TokenKind::Newline {
                    Statement::Return(None)
                } else {
                    self.consume_space()?;
                    Statement::Return(Some(self.parse_expression()?))
                }
            }
            TokenKind::While => {
                self.pos += 1;
                self.parse_while_statement()?
            }
            TokenKind::Break => {
                self.pos += 1;
                Statement::Break
            }
            TokenKind::Continue => {
                self.pos += 1;
                Statement::Continue
            }
            TokenKind::Comment => {
                self.pos += 1;
                Statement::Comment(token.text)
            }
            kind => bail!(
                line token.line,
                "Expected a statement token, but got token type {} on line {}",
                kind.name(),
                token.line
            ),
        };

        self.leave();
        Ok(statement)
    }

    fn is_end_of_block(&mut self) -> Result<bool> {
        debug_assert!(self.indentation > 0);
        let token = self.peek(0)?;
        match token.kind {
            TokenKind::CloseBrace => Ok(true),
            TokenKind::Newline => Ok(false),
            TokenKind::Indentation => {
                Ok(token.text.len() == (self.indentation - 1) * SPACES_PER_INDENT)
            }
            _ => bail!(
                line token.line,
                "Expected indentation, or an empty line, or '}}', but got '{}' on line {}",
                token.text,
                token.line
            ),
        }
    }

    /// Parse ` {` newline, the indented statements, and the closing brace at
    /// the enclosing indentation.
    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        self.enter()?;
        self.consume_space()?;
        self.expect(TokenKind::OpenBrace)?;
        self.consume_newline()?;

        self.indentation += 1;

        let mut statements = Vec::new();
        let mut seen_newline = false;
        let mut newline_allowed = false;

        loop {
            if self.is_end_of_block()? {
                break;
            }

            if self.peek_kind(0) == TokenKind::Newline {
                let line = self.line();
                ensure!(newline_allowed, line line, "Unexpected empty line, on line {}", line);
                self.pos += 1;
                seen_newline = true;
                // Consecutive empty lines are not allowed
                newline_allowed = false;
                statements.push(Statement::EmptyLine);
            } else {
                newline_allowed = true;
                self.consume_indentation()?;
                statements.push(self.parse_statement()?);
                self.consume_newline()?;
            }
        }

        if seen_newline && !newline_allowed {
            let line = self.line();
            bail!(line line, "Unexpected empty line, on line {}", line);
        }

        self.indentation -= 1;
        if self.indentation > 0 {
            self.consume_indentation()?;
        }
        self.expect(TokenKind::CloseBrace)?;

        self.leave();
        Ok(statements)
    }

    // ---- Functions ----

    fn parse_params(&mut self) -> Result<Vec<FnParam>> {
        let mut params = Vec::new();

        loop {
            let name = self.expect(TokenKind::Word)?.text;
            self.expect(TokenKind::Colon)?;
            self.consume_space()?;
            let (ty, type_name) = self.parse_type_word()?;
            ensure!(
                ty != Type::Resource,
                "The argument '{}' can't have 'resource' as its type",
                name
            );
            ensure!(
                ty != Type::Entity,
                "The argument '{}' can't have 'entity' as its type",
                name
            );
            params.push(FnParam { name, ty, type_name });

            // Every argument after the first one starts with a comma
            if self.peek_kind(0) != TokenKind::Comma {
                break;
            }
            self.pos += 1;
            self.consume_space()?;
        }

        Ok(params)
    }

    fn is_empty_function(body: &[Statement]) -> bool {
        body.iter()
            .all(|s| matches!(s, Statement::EmptyLine | Statement::Comment(_)))
    }

    fn parse_on_fn(&mut self) -> Result<OnFn> {
        let name = self.advance()?.text;
        self.expect(TokenKind::OpenParen)?;

        let params = if self.peek_kind(0) == TokenKind::Word {
            self.parse_params()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::CloseParen)?;

        self.indentation = 0;
        let body = self.parse_block()?;
        ensure!(!Parser::is_empty_function(&body), "{}() can't be empty", name);

        Ok(OnFn {
            name,
            params,
            body,
            calls_helper_fn: false,
            contains_while_loop: false,
        })
    }

    fn parse_helper_fn(&mut self) -> Result<HelperFn> {
        let name = self.advance()?.text;

        ensure!(
            self.called_helper_fn_names.contains(&name),
            "{}() is defined before the first time it gets called",
            name
        );

        self.expect(TokenKind::OpenParen)?;
        let params = if self.peek_kind(0) == TokenKind::Word {
            self.parse_params()?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::CloseParen)?;

        let mut return_type = Type::Void;
        let mut return_type_name = None;
        ensure!(
            self.peek_kind(0) == TokenKind::Space,
            line self.line(),
            "Expected a space after the ')' of {}()",
            name
        );
        if self.peek_kind(1) == TokenKind::Word {
            self.pos += 1;
            let (ty, type_name) = self.parse_type_word()?;
            ensure!(
                ty != Type::Resource,
                "The function '{}' can't have 'resource' as its return type",
                name
            );
            ensure!(
                ty != Type::Entity,
                "The function '{}' can't have 'entity' as its return type",
                name
            );
            return_type = ty;
            return_type_name = Some(type_name);
        }

        self.indentation = 0;
        let body = self.parse_block()?;
        ensure!(!Parser::is_empty_function(&body), "{}() can't be empty", name);

        Ok(HelperFn { name, params, return_type, return_type_name, body })
    }

    // ---- Top level ----

    pub fn parse(mut self) -> Result<GrugFileAst> {
        let mut ast = GrugFileAst::default();

        let mut seen_on_fn = false;
        let mut seen_newline = false;
        let mut newline_allowed = false;
        let mut newline_required = false;
        let mut just_seen_global = false;

        while !self.is_at_end() {
            let token = self.peek(0)?.clone();

            if token.kind == TokenKind::Word && self.peek_kind(1) == TokenKind::Colon {
                ensure!(
                    !seen_on_fn,
                    "Move the global variable '{}' so it is above the on_ functions",
                    token.text
                );
                // An empty line between two globals is optional
                ensure!(
                    !newline_required || just_seen_global,
                    line token.line,
                    "Expected an empty line, on line {}",
                    token.line
                );

                let global = self.parse_global_variable()?;
                newline_allowed = true;
                newline_required = true;
                just_seen_global = true;

                ast.globals.push(global);
                ast.layout.push(TopLevel::GlobalVariable(ast.globals.len() - 1));
                self.consume_newline()?;
            } else if token.kind == TokenKind::Word
                && token.text.starts_with("on_")
                && self.peek_kind(1) == TokenKind::OpenParen
            {
                ensure!(
                    ast.helper_fns.is_empty(),
                    "{}() must be defined before all helper_ functions",
                    token.text
                );
                ensure!(
                    !newline_required,
                    line token.line,
                    "Expected an empty line, on line {}",
                    token.line
                );

                let fn_ = self.parse_on_fn()?;
                ensure!(
                    !ast.on_fns.iter().any(|f| f.name == fn_.name),
                    "The function '{}' was defined several times in the same file",
                    fn_.name
                );
                seen_on_fn = true;
                newline_allowed = true;
                newline_required = true;
                just_seen_global = false;

                ast.on_fns.push(fn_);
                ast.layout.push(TopLevel::OnFn(ast.on_fns.len() - 1));
                self.consume_newline()?;
            } else if token.kind == TokenKind::Word
                && token.text.starts_with("helper_")
                && self.peek_kind(1) == TokenKind::OpenParen
            {
                ensure!(
                    !newline_required,
                    line token.line,
                    "Expected an empty line, on line {}",
                    token.line
                );

                let fn_ = self.parse_helper_fn()?;
                ensure!(
                    ast.helper_fn(&fn_.name).is_none(),
                    "The function '{}' was defined several times in the same file",
                    fn_.name
                );
                newline_allowed = true;
                newline_required = true;
                just_seen_global = false;

                ast.helper_fns.push(fn_);
                ast.layout.push(TopLevel::HelperFn(ast.helper_fns.len() - 1));
                self.consume_newline()?;
            } else if token.kind == TokenKind::Newline {
                ensure!(
                    newline_allowed,
                    line token.line,
                    "Unexpected empty line, on line {}",
                    token.line
                );
                seen_newline = true;
                // Consecutive empty lines are not allowed
                newline_allowed = false;
                newline_required = false;
                just_seen_global = false;

                ast.layout.push(TopLevel::EmptyLine);
                self.pos += 1;
            } else if token.kind == TokenKind::Comment {
                newline_allowed = true;
                // newline_required and just_seen_global deliberately keep
                // whatever state they had

                ast.layout.push(TopLevel::Comment(token.text));
                self.pos += 1;
                self.consume_newline()?;
            } else {
                bail!(
                    line token.line,
                    "Unexpected token '{}' on line {}",
                    token.text,
                    token.line
                );
            }
        }

        if seen_newline && !newline_allowed {
            bail!("Unexpected empty line at the end of the file");
        }

        debug_assert_eq!(self.depth, 0);
        Ok(ast)
    }
}

/// Parse a whole source file.
pub fn parse(source: &str) -> Result<GrugFileAst> {
    Parser::new(source)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "on_start() {\n    play()\n}\n";

    #[test]
    fn test_minimal_on_fn() {
        let ast = parse(MINIMAL).unwrap();
        assert_eq!(ast.on_fns.len(), 1);
        assert_eq!(ast.on_fns[0].name, "on_start");
        assert_eq!(ast.on_fns[0].body.len(), 1);
    }

    #[test]
    fn test_empty_function_rejected() {
        let err = parse("on_start() {\n}\n").unwrap_err();
        assert!(err.msg.contains("can't be empty"), "{}", err.msg);
    }

    #[test]
    fn test_globals_before_on_fns() {
        let source = "on_start() {\n    play()\n}\n\nhealth: i32 = 10\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("above the on_ functions"), "{}", err.msg);
    }

    #[test]
    fn test_on_fns_before_helpers() {
        let source = "helper_f() {\n    play()\n}\n\non_start() {\n    helper_f()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("must be defined before all helper_ functions") || err.msg.contains("defined before the first time"), "{}", err.msg);
    }

    #[test]
    fn test_helper_forward_reference_enforced() {
        // helper_g is never called before (or after) its definition
        let source = "on_start() {\n    play()\n}\n\nhelper_g() {\n    play()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(
            err.msg.contains("is defined before the first time it gets called"),
            "{}",
            err.msg
        );
    }

    #[test]
    fn test_helper_after_use_accepted() {
        let source = "on_start() {\n    helper_g()\n}\n\nhelper_g() {\n    play()\n}\n";
        let ast = parse(source).unwrap();
        assert_eq!(ast.helper_fns.len(), 1);
    }

    #[test]
    fn test_blank_line_required_between_fns() {
        let source = "on_a() {\n    play()\n}\non_b() {\n    play()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("Expected an empty line"), "{}", err.msg);
    }

    #[test]
    fn test_blank_line_between_globals_optional() {
        let source = "a: i32 = 1\nb: i32 = 2\n";
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_consecutive_blank_lines_rejected() {
        let source = "on_a() {\n    play()\n}\n\n\non_b() {\n    play()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("Unexpected empty line"), "{}", err.msg);
    }

    #[test]
    fn test_trailing_blank_line_rejected() {
        let source = "on_a() {\n    play()\n}\n\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("Unexpected empty line"), "{}", err.msg);
    }

    #[test]
    fn test_indentation_must_match_depth() {
        let source = "on_start() {\n        play()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("Expected 4 spaces, but got 8 spaces"), "{}", err.msg);
    }

    #[test]
    fn test_operators_require_surrounding_spaces() {
        let source = "on_start() {\n    x: i32 = 1+2\n}\n";
        // "1+2" parses as the primary `1`, then `+` is unexpected
        assert!(parse(source).is_err());
    }

    #[test]
    fn test_precedence_climbing() {
        let source = "on_start() {\n    x: i32 = 1 + 2 * 3\n}\n";
        let ast = parse(source).unwrap();
        let Statement::Variable(var) = &ast.on_fns[0].body[0] else {
            panic!("expected variable statement");
        };
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = &var.value.kind else {
            panic!("expected + at the root, got {:?}", var.value.kind);
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_else_if_chains() {
        let source = concat!(
            "on_start() {\n",
            "    if a {\n",
            "        play()\n",
            "    } else if b {\n",
            "        play()\n",
            "    } else {\n",
            "        play()\n",
            "    }\n",
            "}\n",
        );
        let ast = parse(source).unwrap();
        let Statement::If { else_body, .. } = &ast.on_fns[0].body[0] else {
            panic!("expected if");
        };
        assert_eq!(else_body.len(), 1);
        assert!(matches!(else_body[0], Statement::If { .. }));
    }

    #[test]
    fn test_local_me_rejected() {
        let source = "on_start() {\n    me: i32 = 1\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("grug already declares that variable"), "{}", err.msg);
    }

    #[test]
    fn test_assign_to_me_rejected() {
        let source = "on_start() {\n    me = 1\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("not allowed"), "{}", err.msg);
    }

    #[test]
    fn test_resource_type_rejected_for_locals() {
        let source = "on_start() {\n    r: resource = \"a.wav\"\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("can't have 'resource' as its type"), "{}", err.msg);
    }

    #[test]
    fn test_i32_overflow_rejected() {
        let source = "on_start() {\n    x: i32 = 2147483648\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("too big"), "{}", err.msg);
    }

    #[test]
    fn test_duplicate_on_fn_rejected() {
        let source = "on_a() {\n    play()\n}\n\non_a() {\n    play()\n}\n";
        let err = parse(source).unwrap_err();
        assert!(err.msg.contains("defined several times"), "{}", err.msg);
    }

    #[test]
    fn test_helper_return_type() {
        let source = "on_start() {\n    helper_f()\n}\n\nhelper_f() i32 {\n    return 1\n}\n";
        let ast = parse(source).unwrap();
        assert_eq!(ast.helper_fns[0].return_type, grug_core::Type::I32);
    }

    #[test]
    fn test_deeply_nested_expression_rejected() {
        let mut expr = String::new();
        for _ in 0..60 {
            expr.push('(');
        }
        expr.push('1');
        for _ in 0..60 {
            expr.push(')');
        }
        let source = format!("on_start() {{\n    x: i32 = {}\n}}\n", expr);
        let err = parse(&source).unwrap_err();
        assert!(err.msg.contains("levels of nested expressions"), "{}", err.msg);
    }

    #[test]
    fn test_while_break_continue() {
        let source = concat!(
            "on_start() {\n",
            "    while true {\n",
            "        if a {\n",
            "            break\n",
            "        }\n",
            "        continue\n",
            "    }\n",
            "}\n",
        );
        let ast = parse(source).unwrap();
        let Statement::While { body, .. } = &ast.on_fns[0].body[0] else {
            panic!("expected while");
        };
        assert!(matches!(body.last(), Some(Statement::Continue)));
    }

    #[test]
    fn test_comments_are_statements() {
        let source = "on_start() {\n    # setup\n    play()\n}\n";
        let ast = parse(source).unwrap();
        assert!(matches!(&ast.on_fns[0].body[0], Statement::Comment(c) if c == "setup"));
    }
}
