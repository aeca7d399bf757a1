//! Recursive-descent parser for Vader.
//!
//! Expressions are parsed with classic precedence climbing, lowest layer
//! first: logical, comparison, additive, multiplicative, unary, struct
//! instantiation, member/call/index chains, primaries. Statements are
//! identifier-led declarations, assignments (an expression reinterpreted
//! when `=` follows), `for`, `return`, or plain expressions.
//!
//! File inclusion is a stream stack, not an array splice: `@load` resolves
//! the target through the injected [`ModuleLoader`], lexes it, and pushes
//! the tokens as a child stream. The cursor leaves a child stream when it
//! reaches its end-of-input token, so the parser sees one continuous
//! sequence.
//!
//! There is no resynchronization: the first structural error records a
//! diagnostic and unwinds the unit.

use std::collections::HashSet;

use crate::ast::{
    ArrayDim, BinOp, Block, Declaration, ElseBody, Expr, ExprKind, FieldDef, FieldInit, FnExpr,
    ForStmt, IfExpr, Param, Program, Prop, Stmt, StmtKind, TypeExpr, TypeExprKind, UnaryOp,
};
use crate::diagnostic::{Diagnostic, Diagnostics};
use crate::error::CoreError;
use crate::lexer::{Token, TokenKind, lex};
use crate::loader::ModuleLoader;
use crate::span::{SourceMap, Span};

/// Parse a whole program starting from `entry`, pulling in `@load` targets
/// through `loader`. All files land in one flat statement list, in splice
/// order.
pub fn parse_program(
    entry: &str,
    loader: &mut dyn ModuleLoader,
    files: &mut SourceMap,
    diagnostics: &mut Diagnostics,
) -> Result<Program, CoreError> {
    let module = loader.resolve(entry, None)?;
    let file = files.add(module.name.clone());
    let tokens = lex(file, &module.content, diagnostics)?;

    let mut loaded = HashSet::new();
    loaded.insert(module.key);

    let mut parser = Parser {
        cursor: TokenCursor::new(tokens),
        loader,
        files,
        diagnostics,
        loaded,
    };
    parser.parse_program()
}

// ---------------------------------------------------------------------
// Token cursor with a stream stack
// ---------------------------------------------------------------------

struct Frame {
    tokens: Vec<Token>,
    pos: usize,
}

impl Frame {
    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }
}

/// Cursor over a stack of token streams. The bottom frame is the entry
/// file; `@load` pushes child frames. A child frame is popped as soon as
/// its end-of-input token becomes current, so `current`/`peek` never see a
/// child's end marker.
struct TokenCursor {
    frames: Vec<Frame>,
    previous: Option<Token>,
}

impl TokenCursor {
    fn new(tokens: Vec<Token>) -> TokenCursor {
        TokenCursor {
            frames: vec![Frame { tokens, pos: 0 }],
            previous: None,
        }
    }

    fn pop_finished(&mut self) {
        while self.frames.len() > 1 && self.frames.last().unwrap().current().kind == TokenKind::Eof
        {
            self.frames.pop();
        }
    }

    fn current(&self) -> &Token {
        self.frames.last().unwrap().current()
    }

    /// One token of lookahead, reaching into the parent stream when the
    /// current frame is about to end.
    fn peek_next(&self) -> &Token {
        let mut topmost = true;
        for frame in self.frames.iter().rev() {
            // one past the cursor in the innermost frame; the enclosing
            // frames contribute their current token
            let pos = if topmost { frame.pos + 1 } else { frame.pos };
            topmost = false;
            let token = &frame.tokens[pos.min(frame.tokens.len() - 1)];
            if token.kind != TokenKind::Eof {
                return token;
            }
        }
        // only the root's end-of-input remains
        let root = &self.frames[0];
        &root.tokens[root.tokens.len() - 1]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        let frame = self.frames.last_mut().unwrap();
        if frame.pos < frame.tokens.len() - 1 {
            frame.pos += 1;
        }
        self.pop_finished();
        self.previous = Some(token.clone());
        token
    }

    fn push_stream(&mut self, tokens: Vec<Token>) {
        debug_assert!(!tokens.is_empty(), "lexer always appends end-of-input");
        self.frames.push(Frame { tokens, pos: 0 });
        self.pop_finished();
    }

    fn prev_span(&self) -> Span {
        self.previous
            .as_ref()
            .map(|t| t.span)
            .unwrap_or_else(|| self.current().span)
    }
}

// ---------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------

struct Parser<'a> {
    cursor: TokenCursor,
    loader: &'a mut dyn ModuleLoader,
    files: &'a mut SourceMap,
    diagnostics: &'a mut Diagnostics,
    loaded: HashSet<String>,
}

impl<'a> Parser<'a> {
    fn parse_program(&mut self) -> Result<Program, CoreError> {
        let mut statements = Vec::new();
        while self.cursor.current().kind != TokenKind::Eof {
            if let Some(stmt) = self.parse_statement()? {
                statements.push(stmt);
            }
        }
        Ok(Program { statements })
    }

    /// Parse one statement. Returns `None` when the "statement" was a
    /// `@load` splice, which contributes tokens rather than a node.
    fn parse_statement(&mut self) -> Result<Option<Stmt>, CoreError> {
        // Pending decorators are threaded explicitly; `@file` is an
        // expression-position decorator and falls through to expression
        // parsing below.
        let mut intrinsic = false;
        while self.cursor.current().kind == TokenKind::Decorator {
            let decorator = self.cursor.current().text.clone();
            match decorator.as_str() {
                "load" => {
                    if intrinsic {
                        let span = self.cursor.current().span;
                        return Err(self.error("expected a declaration after '@intrinsic'", span));
                    }
                    let at = self.cursor.advance();
                    let path = self.expect(TokenKind::Str, "a quoted path after '@load'")?;
                    self.splice_load(&path.text, at.span)?;
                    // the splice may have been the last thing in its
                    // statement list
                    if matches!(
                        self.cursor.current().kind,
                        TokenKind::Eof | TokenKind::RBrace
                    ) {
                        return Ok(None);
                    }
                    continue;
                }
                "intrinsic" => {
                    self.cursor.advance();
                    intrinsic = true;
                }
                "file" => break,
                other => {
                    let span = self.cursor.current().span;
                    return Err(self.error(format!("unknown decorator '@{other}'"), span));
                }
            }
        }

        let stmt = match self.cursor.current().kind {
            TokenKind::Return => self.parse_return()?,
            TokenKind::For => self.parse_for()?,
            _ => self.parse_simple_statement(intrinsic)?,
        };

        if intrinsic && !matches!(&stmt.kind, StmtKind::Declaration(d) if d.intrinsic) {
            return Err(self.error("expected a declaration after '@intrinsic'", stmt.span));
        }
        Ok(Some(stmt))
    }

    /// Declaration, assignment or expression statement; also used for the
    /// `init` and `step` slots of `for`.
    fn parse_simple_statement(&mut self, intrinsic: bool) -> Result<Stmt, CoreError> {
        if self.cursor.current().kind == TokenKind::Identifier
            && matches!(
                self.cursor.peek_next().kind,
                TokenKind::Colon | TokenKind::ColonColon | TokenKind::ColonEq
            )
        {
            return self.parse_declaration(intrinsic);
        }

        let expr = self.parse_expression()?;
        let start = expr.span;
        match self.cursor.current().kind {
            TokenKind::Eq => {
                self.check_assignable(&expr)?;
                self.cursor.advance();
                let value = self.parse_expression()?;
                let span = start.to(value.span);
                Ok(Stmt {
                    kind: StmtKind::Assignment {
                        target: expr,
                        value,
                    },
                    span,
                })
            }
            TokenKind::PlusEq | TokenKind::MinusEq => {
                self.check_assignable(&expr)?;
                let op = if self.cursor.current().kind == TokenKind::PlusEq {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                self.cursor.advance();
                let rhs = self.parse_expression()?;
                let span = start.to(rhs.span);
                let value = Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(expr.clone()),
                        rhs: Box::new(rhs),
                    },
                    span,
                };
                Ok(Stmt {
                    kind: StmtKind::Assignment {
                        target: expr,
                        value,
                    },
                    span,
                })
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                self.check_assignable(&expr)?;
                let op = if self.cursor.current().kind == TokenKind::PlusPlus {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let tail = self.cursor.advance();
                let span = start.to(tail.span);
                let one = Expr {
                    kind: ExprKind::Integer(1),
                    span: tail.span,
                };
                let value = Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(expr.clone()),
                        rhs: Box::new(one),
                    },
                    span,
                };
                Ok(Stmt {
                    kind: StmtKind::Assignment {
                        target: expr,
                        value,
                    },
                    span,
                })
            }
            _ => Ok(Stmt {
                kind: StmtKind::Expression(expr),
                span: start,
            }),
        }
    }

    fn check_assignable(&mut self, expr: &Expr) -> Result<(), CoreError> {
        match &expr.kind {
            ExprKind::Identifier(_) | ExprKind::Access { .. } => Ok(()),
            _ => Err(self.error("invalid assignment target", expr.span)),
        }
    }

    fn parse_declaration(&mut self, intrinsic: bool) -> Result<Stmt, CoreError> {
        let name_tok = self.expect(TokenKind::Identifier, "a declaration name")?;
        let name = name_tok.text.clone();
        let name_span = name_tok.span;

        let (annotation, mutable) = match self.cursor.current().kind {
            TokenKind::ColonColon => {
                self.cursor.advance();
                (None, false)
            }
            TokenKind::ColonEq => {
                self.cursor.advance();
                (None, true)
            }
            TokenKind::Colon => {
                self.cursor.advance();
                let annotation = self.parse_type_expr()?;
                match self.cursor.current().kind {
                    TokenKind::Colon => {
                        self.cursor.advance();
                        (Some(annotation), false)
                    }
                    TokenKind::Eq => {
                        self.cursor.advance();
                        (Some(annotation), true)
                    }
                    _ => {
                        let span = self.cursor.current().span;
                        return Err(
                            self.error("expected ':' or '=' after the type annotation", span)
                        );
                    }
                }
            }
            _ => {
                let span = self.cursor.current().span;
                return Err(self.error("expected ':' in declaration", span));
            }
        };

        let value = self.parse_expression()?;

        if let ExprKind::Fn(fn_expr) = &value.kind {
            if intrinsic && fn_expr.body.is_some() {
                return Err(self.error(
                    "an '@intrinsic' function must not have a body",
                    value.span,
                ));
            }
            if !intrinsic && fn_expr.body.is_none() {
                return Err(self.error("function declaration requires a body", value.span));
            }
        } else if intrinsic {
            return Err(self.error(
                "'@intrinsic' applies only to function declarations",
                value.span,
            ));
        }

        let span = name_span.to(value.span);
        Ok(Stmt {
            kind: StmtKind::Declaration(Declaration {
                name,
                name_span,
                annotation,
                mutable,
                value,
                intrinsic,
            }),
            span,
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, CoreError> {
        let kw = self.cursor.advance();
        let value = if self.starts_expression() {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let span = match &value {
            Some(v) => kw.span.to(v.span),
            None => kw.span,
        };
        Ok(Stmt {
            kind: StmtKind::Return { value },
            span,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, CoreError> {
        let kw = self.cursor.advance();
        let parenthesized = self.eat(TokenKind::LParen);

        let init = self.parse_simple_statement(false)?;
        self.expect(TokenKind::Semi, "';' after the loop initializer")?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::Semi, "';' after the loop condition")?;
        let step = self.parse_simple_statement(false)?;
        if parenthesized {
            self.expect(TokenKind::RParen, "')' after the loop header")?;
        }
        let body = self.parse_block()?;
        let span = kw.span.to(body.span);
        Ok(Stmt {
            kind: StmtKind::For(Box::new(ForStmt {
                init,
                condition,
                step,
                body,
            })),
            span,
        })
    }

    fn parse_block(&mut self) -> Result<Block, CoreError> {
        let open = self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while !matches!(
            self.cursor.current().kind,
            TokenKind::RBrace | TokenKind::Eof
        ) {
            if let Some(stmt) = self.parse_statement()? {
                statements.push(stmt);
            }
        }
        let close = self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Block {
            statements,
            span: open.span.to(close.span),
        })
    }

    // -----------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------

    fn parse_type_expr(&mut self) -> Result<TypeExpr, CoreError> {
        if self.cursor.current().kind == TokenKind::LBracket {
            let start = self.cursor.current().span;
            let dims = self.parse_array_dims()?;
            let elem = self.parse_type_expr()?;
            let span = start.to(elem.span);
            return Ok(TypeExpr {
                kind: TypeExprKind::Array {
                    dims,
                    elem: Box::new(elem),
                },
                span,
            });
        }
        let name = self.expect(TokenKind::Identifier, "a type name")?;
        Ok(TypeExpr {
            kind: TypeExprKind::Named(name.text.clone()),
            span: name.span,
        })
    }

    fn parse_array_dims(&mut self) -> Result<Vec<ArrayDim>, CoreError> {
        let mut dims = Vec::new();
        while self.cursor.current().kind == TokenKind::LBracket {
            self.cursor.advance();
            let dim = match self.cursor.current().kind {
                TokenKind::RBracket => ArrayDim::Inferred,
                TokenKind::Identifier if self.cursor.current().text == "_" => {
                    self.cursor.advance();
                    ArrayDim::Inferred
                }
                TokenKind::Integer => {
                    let tok = self.cursor.advance();
                    ArrayDim::Fixed(self.integer_value(&tok)?)
                }
                _ => {
                    let span = self.cursor.current().span;
                    return Err(self.error("expected an array length, '_' or ']'", span));
                }
            };
            self.expect(TokenKind::RBracket, "']' after the array dimension")?;
            dims.push(dim);
        }
        Ok(dims)
    }

    // -----------------------------------------------------------------
    // Expressions, lowest precedence first
    // -----------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expr, CoreError> {
        self.parse_logical()
    }

    fn parse_logical(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.cursor.current().kind {
                TokenKind::Amp => BinOp::BitAnd,
                TokenKind::Pipe => BinOp::BitOr,
                TokenKind::AmpAmp => BinOp::And,
                TokenKind::PipePipe => BinOp::Or,
                _ => break,
            };
            self.cursor.advance();
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.cursor.current().kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::BangEq => BinOp::Ne,
                _ => break,
            };
            self.cursor.advance();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.cursor.current().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                TokenKind::Percent => BinOp::Rem,
                _ => break,
            };
            self.cursor.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.cursor.current().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.cursor.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        let op = match self.cursor.current().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let tok = self.cursor.advance();
            let operand = self.parse_unary()?;
            let span = tok.span.to(operand.span);
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_struct_instantiation()
    }

    /// `TypeName { ... }` is always preferred over reading the identifier
    /// as a plain expression followed by a block.
    fn parse_struct_instantiation(&mut self) -> Result<Expr, CoreError> {
        if self.cursor.current().kind == TokenKind::Identifier
            && self.cursor.peek_next().kind == TokenKind::LBrace
        {
            let name_tok = self.cursor.advance();
            self.cursor.advance(); // '{'
            let mut inits = Vec::new();
            while !matches!(
                self.cursor.current().kind,
                TokenKind::RBrace | TokenKind::Eof
            ) {
                let init = self.parse_field_init()?;
                inits.push(init);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            let close = self.expect(TokenKind::RBrace, "'}' after struct fields")?;
            return Ok(Expr {
                kind: ExprKind::StructLiteral {
                    name: name_tok.text.clone(),
                    name_span: name_tok.span,
                    inits,
                },
                span: name_tok.span.to(close.span),
            });
        }
        self.parse_postfix()
    }

    fn parse_field_init(&mut self) -> Result<FieldInit, CoreError> {
        // `.field = expr`, `field: expr`, or a positional expression.
        if self.cursor.current().kind == TokenKind::Dot {
            let dot = self.cursor.advance();
            let name = self.expect(TokenKind::Identifier, "a field name after '.'")?;
            self.expect(TokenKind::Eq, "'=' after the field name")?;
            let value = self.parse_expression()?;
            let span = dot.span.to(value.span);
            return Ok(FieldInit {
                name: Some(name.text.clone()),
                value,
                span,
            });
        }
        if self.cursor.current().kind == TokenKind::Identifier
            && self.cursor.peek_next().kind == TokenKind::Colon
        {
            let name = self.cursor.advance();
            self.cursor.advance(); // ':'
            let value = self.parse_expression()?;
            let span = name.span.to(value.span);
            return Ok(FieldInit {
                name: Some(name.text.clone()),
                value,
                span,
            });
        }
        let value = self.parse_expression()?;
        let span = value.span;
        Ok(FieldInit {
            name: None,
            value,
            span,
        })
    }

    /// Member/call/index chains. `.name(` is reinterpreted as a call with
    /// the receiver as first argument; the decision is made only once the
    /// opening parenthesis is actually seen.
    fn parse_postfix(&mut self) -> Result<Expr, CoreError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.cursor.current().kind {
                TokenKind::Dot => {
                    self.cursor.advance();
                    let name = self.expect(TokenKind::Identifier, "a member name after '.'")?;
                    if self.cursor.current().kind == TokenKind::LParen {
                        self.cursor.advance();
                        let mut args = vec![expr];
                        self.parse_call_args(&mut args)?;
                        let close = self.cursor.prev_span();
                        let span = args[0].span.to(close);
                        expr = Expr {
                            kind: ExprKind::Call {
                                callee: name.text.clone(),
                                callee_span: name.span,
                                args,
                            },
                            span,
                        };
                    } else {
                        expr = push_prop(
                            expr,
                            Prop::Field {
                                name: name.text.clone(),
                                span: name.span,
                            },
                        );
                    }
                }
                TokenKind::LBracket => {
                    let open = self.cursor.advance();
                    let index = self.parse_expression()?;
                    let close = self.expect(TokenKind::RBracket, "']' after the index")?;
                    expr = push_prop(
                        expr,
                        Prop::Index {
                            index,
                            span: open.span.to(close.span),
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self, args: &mut Vec<Expr>) -> Result<(), CoreError> {
        while !matches!(
            self.cursor.current().kind,
            TokenKind::RParen | TokenKind::Eof
        ) {
            args.push(self.parse_expression()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')' after call arguments")?;
        Ok(())
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        let token = self.cursor.current().clone();
        match token.kind {
            TokenKind::Integer => {
                self.cursor.advance();
                let value = self.integer_value(&token)?;
                Ok(Expr {
                    kind: ExprKind::Integer(value),
                    span: token.span,
                })
            }
            TokenKind::Float => {
                self.cursor.advance();
                let text = token.text.replace('_', "");
                let value = text.parse::<f64>().map_err(|_| {
                    self.error("malformed float literal", token.span)
                })?;
                Ok(Expr {
                    kind: ExprKind::Float(value),
                    span: token.span,
                })
            }
            TokenKind::Str => {
                self.cursor.advance();
                Ok(Expr {
                    kind: ExprKind::Str(token.text.clone()),
                    span: token.span,
                })
            }
            TokenKind::True | TokenKind::False => {
                self.cursor.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(token.kind == TokenKind::True),
                    span: token.span,
                })
            }
            TokenKind::Identifier => {
                self.cursor.advance();
                if self.cursor.current().kind == TokenKind::LParen {
                    self.cursor.advance();
                    let mut args = Vec::new();
                    self.parse_call_args(&mut args)?;
                    let span = token.span.to(self.cursor.prev_span());
                    return Ok(Expr {
                        kind: ExprKind::Call {
                            callee: token.text.clone(),
                            callee_span: token.span,
                            args,
                        },
                        span,
                    });
                }
                Ok(Expr {
                    kind: ExprKind::Identifier(token.text.clone()),
                    span: token.span,
                })
            }
            TokenKind::LParen => {
                self.cursor.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Fn => self.parse_fn_expr(),
            TokenKind::Struct => self.parse_struct_decl(),
            TokenKind::If => {
                let if_expr = self.parse_if()?;
                Ok(if_expr)
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::Decorator if token.text == "file" => {
                self.cursor.advance();
                self.expect(TokenKind::LParen, "'(' after '@file'")?;
                let path = self.expect(TokenKind::Str, "a quoted path")?;
                let close = self.expect(TokenKind::RParen, "')'")?;
                let from = self.files.name(token.span.file).to_string();
                let module = self
                    .loader
                    .resolve(&path.text, Some(&from))
                    .map_err(|err| {
                        let span = token.span.to(close.span);
                        self.error(err.to_string(), span)
                    })?;
                Ok(Expr {
                    kind: ExprKind::Str(module.content),
                    span: token.span.to(close.span),
                })
            }
            _ => Err(self.error("expected an expression", token.span)),
        }
    }

    fn parse_fn_expr(&mut self) -> Result<Expr, CoreError> {
        let kw = self.cursor.advance();
        self.expect(TokenKind::LParen, "'(' after 'fn'")?;
        let mut params = Vec::new();
        while !matches!(
            self.cursor.current().kind,
            TokenKind::RParen | TokenKind::Eof
        ) {
            let name = self.expect(TokenKind::Identifier, "a parameter name")?;
            self.expect(TokenKind::Colon, "':' after the parameter name")?;
            let ty = self.parse_type_expr()?;
            let span = name.span.to(ty.span);
            params.push(Param {
                name: name.text.clone(),
                ty,
                span,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;
        self.expect(TokenKind::Arrow, "'->' before the return type")?;
        let return_type = self.parse_type_expr()?;
        let body = if self.cursor.current().kind == TokenKind::LBrace {
            Some(self.parse_block()?)
        } else {
            None
        };
        let end = match &body {
            Some(b) => b.span,
            None => return_type.span,
        };
        let span = kw.span.to(end);
        Ok(Expr {
            kind: ExprKind::Fn(Box::new(FnExpr {
                params,
                return_type,
                body,
            })),
            span,
        })
    }

    fn parse_struct_decl(&mut self) -> Result<Expr, CoreError> {
        let kw = self.cursor.advance();
        self.expect(TokenKind::LBrace, "'{' after 'struct'")?;
        let mut fields = Vec::new();
        while !matches!(
            self.cursor.current().kind,
            TokenKind::RBrace | TokenKind::Eof
        ) {
            let name = self.expect(TokenKind::Identifier, "a field name")?;
            self.expect(TokenKind::Colon, "':' after the field name")?;
            let ty = self.parse_type_expr()?;
            let span = name.span.to(ty.span);
            fields.push(FieldDef {
                name: name.text.clone(),
                ty,
                span,
            });
            // separators are optional between fields
            self.eat(TokenKind::Comma);
        }
        let close = self.expect(TokenKind::RBrace, "'}' after struct fields")?;
        Ok(Expr {
            kind: ExprKind::StructDecl(fields),
            span: kw.span.to(close.span),
        })
    }

    fn parse_if(&mut self) -> Result<Expr, CoreError> {
        let kw = self.cursor.advance();
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;
        let mut end = then_body.span;
        let else_body = match self.cursor.current().kind {
            TokenKind::Elif => {
                let elif_span = self.cursor.current().span;
                let chained = self.parse_if_chain_from_elif()?;
                end = chained.1;
                Some(ElseBody::Elif(Box::new(chained.0), elif_span))
            }
            TokenKind::Else => {
                self.cursor.advance();
                let block = self.parse_block()?;
                end = block.span;
                Some(ElseBody::Else(block))
            }
            _ => None,
        };
        Ok(Expr {
            kind: ExprKind::If(Box::new(IfExpr {
                condition,
                then_body,
                else_body,
            })),
            span: kw.span.to(end),
        })
    }

    fn parse_if_chain_from_elif(&mut self) -> Result<(IfExpr, Span), CoreError> {
        self.cursor.advance(); // 'elif'
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;
        let mut end = then_body.span;
        let else_body = match self.cursor.current().kind {
            TokenKind::Elif => {
                let elif_span = self.cursor.current().span;
                let chained = self.parse_if_chain_from_elif()?;
                end = chained.1;
                Some(ElseBody::Elif(Box::new(chained.0), elif_span))
            }
            TokenKind::Else => {
                self.cursor.advance();
                let block = self.parse_block()?;
                end = block.span;
                Some(ElseBody::Else(block))
            }
            _ => None,
        };
        Ok((
            IfExpr {
                condition,
                then_body,
                else_body,
            },
            end,
        ))
    }

    fn parse_array_literal(&mut self) -> Result<Expr, CoreError> {
        let start = self.cursor.current().span;
        let dims = self.parse_array_dims()?;
        let elem = self.parse_type_expr()?;
        let ty_span = start.to(elem.span);
        let ty = TypeExpr {
            kind: TypeExprKind::Array {
                dims: dims.clone(),
                elem: Box::new(elem),
            },
            span: ty_span,
        };

        let mut items = Vec::new();
        let mut end = ty_span;
        if self.cursor.current().kind == TokenKind::LBrace {
            self.cursor.advance();
            while !matches!(
                self.cursor.current().kind,
                TokenKind::RBrace | TokenKind::Eof
            ) {
                items.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            let close = self.expect(TokenKind::RBrace, "'}' after array items")?;
            end = close.span;
        }

        // The outer dimension and the initializer must agree here, at parse
        // time; this never defers to resolution.
        match dims.first() {
            Some(ArrayDim::Fixed(n)) => {
                if !items.is_empty() && items.len() as u64 != *n {
                    let span = start.to(end);
                    return Err(self.error(
                        format!(
                            "array literal declares length {n} but has {} item(s)",
                            items.len()
                        ),
                        span,
                    ));
                }
            }
            Some(ArrayDim::Inferred) | None => {
                if items.is_empty() {
                    let span = start.to(end);
                    return Err(self.error(
                        "array length cannot be inferred without an initializer",
                        span,
                    ));
                }
            }
        }

        Ok(Expr {
            kind: ExprKind::ArrayLiteral { ty, items },
            span: start.to(end),
        })
    }

    // -----------------------------------------------------------------
    // Support
    // -----------------------------------------------------------------

    /// Resolve and splice an `@load` target. Repeated loads of the same key
    /// are a no-op.
    fn splice_load(&mut self, identifier: &str, at: Span) -> Result<(), CoreError> {
        let from = self.files.name(at.file).to_string();
        let module = self
            .loader
            .resolve(identifier, Some(&from))
            .map_err(|err| self.error(err.to_string(), at))?;
        if !self.loaded.insert(module.key.clone()) {
            return Ok(());
        }
        let file = self.files.add(module.name.clone());
        let tokens = lex(file, &module.content, self.diagnostics)?;
        self.cursor.push_stream(tokens);
        Ok(())
    }

    fn integer_value(&mut self, token: &Token) -> Result<u64, CoreError> {
        let text = token.text.replace('_', "");
        let parsed = if let Some(rest) = text.strip_prefix("0x") {
            u64::from_str_radix(rest, 16)
        } else if let Some(rest) = text.strip_prefix("0o") {
            u64::from_str_radix(rest, 8)
        } else if let Some(rest) = text.strip_prefix("0b") {
            u64::from_str_radix(rest, 2)
        } else {
            text.parse::<u64>()
        };
        parsed.map_err(|_| self.error("integer literal out of range", token.span))
    }

    fn starts_expression(&self) -> bool {
        match self.cursor.current().kind {
            TokenKind::Integer
            | TokenKind::Float
            | TokenKind::Str
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Identifier
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Bang
            | TokenKind::Minus
            | TokenKind::Fn
            | TokenKind::Struct
            | TokenKind::If => true,
            TokenKind::Decorator => self.cursor.current().text == "file",
            _ => false,
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.cursor.current().kind == kind {
            self.cursor.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, CoreError> {
        if self.cursor.current().kind == kind {
            Ok(self.cursor.advance())
        } else {
            let span = self.cursor.current().span;
            Err(self.error(format!("expected {what}"), span))
        }
    }

    fn error(&mut self, message: impl Into<String>, span: Span) -> CoreError {
        let message = message.into();
        self.diagnostics
            .report(Diagnostic::error(message.clone(), span).with_code("E0100"));
        CoreError::Parse {
            location: self.files.display(span),
            message,
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = lhs.span.to(rhs.span);
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    }
}

fn push_prop(expr: Expr, prop: Prop) -> Expr {
    let prop_end = match &prop {
        Prop::Field { span, .. } => *span,
        Prop::Index { span, .. } => *span,
    };
    match expr.kind {
        ExprKind::Access { base, mut props } => {
            let span = expr.span.to(prop_end);
            props.push(prop);
            Expr {
                kind: ExprKind::Access { base, props },
                span,
            }
        }
        _ => {
            let span = expr.span.to(prop_end);
            Expr {
                kind: ExprKind::Access {
                    base: Box::new(expr),
                    props: vec![prop],
                },
                span,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn parse_source(source: &str) -> Program {
        let mut loader = MemoryLoader::new();
        loader.insert("main", source);
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        parse_program("main", &mut loader, &mut files, &mut diags).expect("parse should succeed")
    }

    fn parse_error(source: &str) -> CoreError {
        let mut loader = MemoryLoader::new();
        loader.insert("main", source);
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let err = parse_program("main", &mut loader, &mut files, &mut diags)
            .expect_err("parse should fail");
        assert!(diags.has_errors(), "parse failure must leave a diagnostic");
        err
    }

    #[test]
    fn parses_declaration_forms() {
        let program = parse_source("a :: 1 b := 2 c : u8 : 3 d : u8 = 4");
        assert_eq!(program.statements.len(), 4);
        let decls: Vec<_> = program
            .statements
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Declaration(d) => (d.name.as_str(), d.mutable, d.annotation.is_some()),
                other => panic!("expected declaration, found {other:?}"),
            })
            .collect();
        assert_eq!(
            decls,
            [
                ("a", false, false),
                ("b", true, false),
                ("c", false, true),
                ("d", true, true)
            ]
        );
    }

    #[test]
    fn precedence_folds_left() {
        let program = parse_source("x :: 1 + 2 * 3 < 4 && 5 == 6");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        // top node is the logical layer
        let ExprKind::Binary { op, lhs, .. } = &decl.value.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinOp::And);
        let ExprKind::Binary { op: cmp, lhs: add, .. } = &lhs.kind else {
            panic!("expected comparison under &&");
        };
        assert_eq!(*cmp, BinOp::Lt);
        let ExprKind::Binary { op: plus, rhs: mul, .. } = &add.kind else {
            panic!("expected addition under <");
        };
        assert_eq!(*plus, BinOp::Add);
        let ExprKind::Binary { op: times, .. } = &mul.kind else {
            panic!("expected multiplication under +");
        };
        assert_eq!(*times, BinOp::Mul);
    }

    #[test]
    fn assignment_reinterpretation() {
        let program = parse_source("p := Point{x: 1} p.x = 9 p.x += 1 i := 0 i++");
        assert!(matches!(
            program.statements[1].kind,
            StmtKind::Assignment { .. }
        ));
        // compound assignment desugars to target = target op rhs
        let StmtKind::Assignment { value, .. } = &program.statements[2].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            value.kind,
            ExprKind::Binary { op: BinOp::Add, .. }
        ));
        let StmtKind::Assignment { target, .. } = &program.statements[4].kind else {
            panic!("expected increment to desugar to assignment");
        };
        assert!(matches!(target.kind, ExprKind::Identifier(_)));
    }

    #[test]
    fn struct_instantiation_named_and_positional() {
        let program = parse_source("a := Point{x: 1, y: 2} b := Point{3, 4} c := Pair{.l = 5}");
        for (idx, named) in [(0usize, true), (1, false), (2, true)] {
            let StmtKind::Declaration(decl) = &program.statements[idx].kind else {
                panic!("expected declaration");
            };
            let ExprKind::StructLiteral { inits, .. } = &decl.value.kind else {
                panic!("expected struct literal");
            };
            assert_eq!(inits[0].name.is_some(), named);
        }
    }

    #[test]
    fn dot_chains_and_ufcs() {
        let program = parse_source("v := p.pos[2].x w := p.norm(q)");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        let ExprKind::Access { props, .. } = &decl.value.kind else {
            panic!("expected dot expression");
        };
        assert_eq!(props.len(), 3);
        assert!(matches!(props[0], Prop::Field { .. }));
        assert!(matches!(props[1], Prop::Index { .. }));
        assert!(matches!(props[2], Prop::Field { .. }));

        let StmtKind::Declaration(decl) = &program.statements[1].kind else {
            panic!("expected declaration");
        };
        let ExprKind::Call { callee, args, .. } = &decl.value.kind else {
            panic!("expected UFCS call");
        };
        assert_eq!(callee, "norm");
        assert_eq!(args.len(), 2, "receiver becomes the first argument");
        assert!(matches!(args[0].kind, ExprKind::Identifier(_)));
    }

    #[test]
    fn if_elif_else_chain() {
        let program = parse_source("x := if a < 1 { 1 } elif a < 2 { 2 } else { 3 }");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        let ExprKind::If(if_expr) = &decl.value.kind else {
            panic!("expected if expression");
        };
        let Some(ElseBody::Elif(elif, _)) = &if_expr.else_body else {
            panic!("expected elif arm");
        };
        assert!(matches!(elif.else_body, Some(ElseBody::Else(_))));
    }

    #[test]
    fn for_with_and_without_parens() {
        let program =
            parse_source("f :: fn() -> void { for (i := 0; i < 3; i++) { } for j := 0; j < 3; j++ { } }");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        let ExprKind::Fn(fn_expr) = &decl.value.kind else {
            panic!("expected fn expression");
        };
        let body = fn_expr.body.as_ref().unwrap();
        assert_eq!(body.statements.len(), 2);
        assert!(matches!(body.statements[0].kind, StmtKind::For(_)));
        assert!(matches!(body.statements[1].kind, StmtKind::For(_)));
    }

    #[test]
    fn array_literal_length_agreement() {
        parse_source("a := [3]u32{1, 2, 3} b := [_]u32{1, 2} c := []u32{9} d := [4]u32");
        let err = parse_error("bad := [3]u32{1, 2}");
        assert!(matches!(err, CoreError::Parse { .. }));
        let err = parse_error("bad := [_]u32");
        assert!(matches!(err, CoreError::Parse { .. }));
    }

    #[test]
    fn load_splices_child_stream() {
        let mut loader = MemoryLoader::new();
        loader.insert("main", "@load \"other\"\nx :: helper()");
        loader.insert("other", "helper :: fn() -> u32 { return 7 }");
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let program = parse_program("main", &mut loader, &mut files, &mut diags).expect("parse");
        assert_eq!(files.len(), 2);
        assert_eq!(program.statements.len(), 2);
        let StmtKind::Declaration(first) = &program.statements[0].kind else {
            panic!("expected spliced declaration first");
        };
        assert_eq!(first.name, "helper");
    }

    #[test]
    fn load_deduplicates_by_key() {
        let mut loader = MemoryLoader::new();
        loader.insert("main", "@load \"util\"\n@load \"util\"\nx :: 1");
        loader.insert("util", "u :: 2");
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let program = parse_program("main", &mut loader, &mut files, &mut diags).expect("parse");
        // the second @load is a no-op
        assert_eq!(program.statements.len(), 2);
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn file_decorator_embeds_content() {
        let mut loader = MemoryLoader::new();
        loader.insert("main", "text :: @file(\"banner\")");
        loader.insert("banner", "hello vader");
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let program = parse_program("main", &mut loader, &mut files, &mut diags).expect("parse");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(decl.value.kind, ExprKind::Str("hello vader".into()));
    }

    #[test]
    fn intrinsic_decorator_requires_bodyless_fn() {
        let program = parse_source("@intrinsic print :: fn(s: string) -> void");
        let StmtKind::Declaration(decl) = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        assert!(decl.intrinsic);

        let err = parse_error("@intrinsic bad :: fn() -> void { }");
        assert!(matches!(err, CoreError::Parse { .. }));
        let err = parse_error("bad :: fn() -> void");
        assert!(matches!(err, CoreError::Parse { .. }));
    }

    #[test]
    fn first_error_aborts() {
        let err = parse_error("x :: ");
        assert!(matches!(err, CoreError::Parse { .. }));
    }

    #[test]
    fn missing_module_is_reported() {
        let mut loader = MemoryLoader::new();
        loader.insert("main", "@load \"ghost\"\n");
        let mut files = SourceMap::new();
        let mut diags = Diagnostics::new();
        let err = parse_program("main", &mut loader, &mut files, &mut diags)
            .expect_err("load should fail");
        assert!(matches!(err, CoreError::Parse { .. }));
        assert!(diags.has_errors());
    }
}
