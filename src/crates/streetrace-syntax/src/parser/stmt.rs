//! Statement parsing for flow bodies and event handlers.

use crate::ast::{
    CallStmt, EscalationHandler, EventHandler, ForLoop, HandlerEvent, HandlerTiming, IfBlock,
    MatchBlock, MatchCase, RunStmt, Stmt,
};
use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::source::Span;
use crate::token::{Keyword, TokenKind};

use super::{ParseResult, Parser};

impl Parser {
    /// `NEWLINE INDENT stmt* DEDENT` — the body of a flow or block form.
    pub(super) fn parse_indented_body(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(&TokenKind::Indent)?;
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(&TokenKind::Dedent) || self.check(&TokenKind::Eof) {
                break;
            }
            body.push(self.parse_stmt()?);
        }
        self.expect(&TokenKind::Dedent)?;
        Ok(body)
    }

    /// `do NEWLINE INDENT stmt* DEDENT end` — bodies of for/parallel/loop/
    /// failure blocks.
    fn parse_do_block(&mut self) -> ParseResult<(Vec<Stmt>, Span)> {
        self.expect_keyword(Keyword::Do)?;
        self.expect_newline()?;
        let body = self.parse_indented_body()?;
        let end = self.expect_keyword(Keyword::End)?;
        self.expect_newline()?;
        Ok((body, end))
    }

    pub(super) fn parse_stmt(&mut self) -> ParseResult<Stmt> {
        match self.peek_kind() {
            TokenKind::Variable(_) => self.parse_assignment_or_target(),
            TokenKind::Keyword(Keyword::Run) => {
                let stmt = self.parse_run_stmt(None)?;
                self.expect_newline()?;
                Ok(stmt)
            }
            TokenKind::Keyword(Keyword::Call) => {
                let stmt = self.parse_call_stmt(None)?;
                self.expect_newline()?;
                Ok(stmt)
            }
            TokenKind::Keyword(Keyword::Return) => {
                let start = self.next_span();
                let value = self.parse_expr()?;
                let span = start.covering(value.span());
                self.expect_newline()?;
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Keyword(Keyword::Push) => {
                let start = self.next_span();
                let value = self.parse_expr()?;
                self.expect_keyword(Keyword::To)?;
                let token = self.next();
                let TokenKind::Variable(target) = token.kind else {
                    return Err(self.unexpected(&token, "a `$list` variable"));
                };
                let span = start.covering(token.span);
                self.expect_newline()?;
                Ok(Stmt::Push {
                    value,
                    target,
                    span,
                })
            }
            TokenKind::Keyword(Keyword::Escalate) => {
                let start = self.next_span();
                let mut span = start;
                // `escalate human` routes to a person; the optional trailing
                // expression is the message either way.
                if self.check_keyword(Keyword::Human) {
                    span = span.covering(self.next_span());
                }
                let message = if self.check(&TokenKind::Newline)
                    || self.check(&TokenKind::Dedent)
                    || self.check(&TokenKind::Eof)
                {
                    None
                } else {
                    let expr = self.parse_expr()?;
                    span = span.covering(expr.span());
                    Some(expr)
                };
                self.expect_newline()?;
                Ok(Stmt::Escalate { message, span })
            }
            TokenKind::Keyword(Keyword::Log) => {
                let start = self.next_span();
                let message = self.parse_expr()?;
                let span = start.covering(message.span());
                self.expect_newline()?;
                Ok(Stmt::Log { message, span })
            }
            TokenKind::Keyword(Keyword::Notify) => {
                let start = self.next_span();
                let message = self.parse_expr()?;
                let span = start.covering(message.span());
                self.expect_newline()?;
                Ok(Stmt::Notify { message, span })
            }
            TokenKind::Keyword(Keyword::For) => self.parse_for_loop(),
            TokenKind::Keyword(Keyword::Parallel) => {
                let start = self.next_span();
                let (body, end) = self.parse_do_block()?;
                Ok(Stmt::Parallel {
                    body,
                    span: start.covering(end),
                })
            }
            TokenKind::Keyword(Keyword::Loop) => self.parse_loop_block(),
            TokenKind::Keyword(Keyword::Match) => self.parse_match_block(),
            TokenKind::Keyword(Keyword::If) => self.parse_if_block(),
            TokenKind::Keyword(Keyword::Failure) => {
                let start = self.next_span();
                let (body, end) = self.parse_do_block()?;
                Ok(Stmt::Failure {
                    body,
                    span: start.covering(end),
                })
            }
            TokenKind::Keyword(Keyword::Mask) => {
                let start = self.next_span();
                let (target, end) = self.parse_name()?;
                let span = start.covering(end);
                self.expect_newline()?;
                Ok(Stmt::Mask { target, span })
            }
            TokenKind::Keyword(Keyword::Block) => {
                let start = self.next_span();
                self.expect_keyword(Keyword::If)?;
                let (condition, end) = self.parse_name()?;
                let span = start.covering(end);
                self.expect_newline()?;
                Ok(Stmt::BlockIf { condition, span })
            }
            TokenKind::Keyword(Keyword::Warn) => {
                let start = self.next_span();
                self.expect_keyword(Keyword::If)?;
                let (condition, end) = self.parse_name()?;
                let span = start.covering(end);
                self.expect_newline()?;
                Ok(Stmt::WarnIf { condition, span })
            }
            TokenKind::Keyword(Keyword::Retry) => {
                let start = self.next_span();
                self.expect_keyword(Keyword::With)?;
                let message = self.parse_expr()?;
                let mut span = start.covering(message.span());
                let condition = if self.eat_keyword(Keyword::If) {
                    let cond = self.parse_expr()?;
                    span = span.covering(cond.span());
                    Some(cond)
                } else {
                    None
                };
                self.expect_newline()?;
                Ok(Stmt::RetryWith {
                    message,
                    condition,
                    span,
                })
            }
            _ => {
                let token = self.peek().clone();
                Err(self.unexpected(&token, "a statement"))
            }
        }
    }

    /// `$x = ...` or `$x.a.b = ...` — the right-hand side may be a run or
    /// call statement, which then assigns into the target.
    fn parse_assignment_or_target(&mut self) -> ParseResult<Stmt> {
        let token = self.next();
        let TokenKind::Variable(base) = token.kind else {
            return Err(self.unexpected(&token, "a `$variable`"));
        };
        let start = token.span;

        let mut path: Vec<String> = Vec::new();
        let mut end = start;
        while self.check(&TokenKind::Dot) {
            self.next();
            let part = self.next();
            match part.kind {
                TokenKind::Ident(name) => path.push(name),
                TokenKind::DottedName(dotted) => {
                    path.extend(dotted.split('.').map(str::to_string));
                }
                TokenKind::Keyword(kw) => path.push(kw.as_str().to_string()),
                _ => return Err(self.unexpected(&part, "a property name")),
            }
            end = part.span;
        }

        self.expect(&TokenKind::Eq)?;

        // `$x = run ...` / `$x = call ...` keep statement semantics.
        if path.is_empty() {
            if self.check_keyword(Keyword::Run) {
                let stmt = self.parse_run_stmt(Some(base))?;
                self.expect_newline()?;
                return Ok(stmt);
            }
            if self.check_keyword(Keyword::Call) {
                let stmt = self.parse_call_stmt(Some(base))?;
                self.expect_newline()?;
                return Ok(stmt);
            }
        }

        let value = self.parse_expr()?;
        let span = start.covering(end).covering(value.span());
        self.expect_newline()?;
        if path.is_empty() {
            Ok(Stmt::Assignment {
                target: base,
                value,
                span,
            })
        } else {
            Ok(Stmt::PropertyAssignment {
                base,
                path,
                value,
                span,
            })
        }
    }

    /// `run agent X [with expr][, on escalate ...]` or `run flow_name ...`.
    fn parse_run_stmt(&mut self, target: Option<String>) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Run)?;
        let is_flow = !self.eat_keyword(Keyword::Agent);
        let (name, mut end) = self.parse_name()?;

        let input = if self.eat_keyword(Keyword::With) {
            let expr = self.parse_expr()?;
            end = expr.span();
            Some(expr)
        } else {
            None
        };

        let on_escalate = if self.check(&TokenKind::Comma) {
            self.next();
            self.expect_keyword(Keyword::On)?;
            self.expect_keyword(Keyword::Escalate)?;
            let handler_token = self.next();
            let handler = match handler_token.kind {
                TokenKind::Keyword(Keyword::Return) => {
                    let expr = self.parse_expr()?;
                    end = expr.span();
                    EscalationHandler::Return(expr)
                }
                TokenKind::Keyword(Keyword::Continue) => {
                    end = handler_token.span;
                    EscalationHandler::Continue
                }
                TokenKind::Keyword(Keyword::Abort) => {
                    end = handler_token.span;
                    EscalationHandler::Abort
                }
                _ => {
                    return Err(self.unexpected(
                        &handler_token,
                        "`return <expr>`, `continue` or `abort`",
                    ));
                }
            };
            Some(handler)
        } else {
            None
        };

        Ok(Stmt::Run(RunStmt {
            target,
            name,
            is_flow,
            input,
            on_escalate,
            span: start.covering(end),
        }))
    }

    /// `call llm prompt_name [with expr] [using model "m"]`.
    fn parse_call_stmt(&mut self, target: Option<String>) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Call)?;
        self.expect_keyword(Keyword::Llm)?;
        let (prompt, mut end) = self.parse_name()?;

        let input = if self.eat_keyword(Keyword::With) {
            let expr = self.parse_expr()?;
            end = expr.span();
            Some(expr)
        } else {
            None
        };

        let model = if self.eat_keyword(Keyword::Using) {
            self.expect_keyword(Keyword::Model)?;
            let token = self.next();
            let value = match token.kind {
                TokenKind::Str(v) | TokenKind::Ident(v) | TokenKind::ProviderModel(v) => v,
                _ => return Err(self.unexpected(&token, "a model name")),
            };
            end = token.span;
            Some(value)
        } else {
            None
        };

        Ok(Stmt::Call(CallStmt {
            target,
            prompt,
            input,
            model,
            span: start.covering(end),
        }))
    }

    fn parse_for_loop(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::For)?;
        let token = self.next();
        let TokenKind::Variable(variable) = token.kind else {
            return Err(self.unexpected(&token, "a `$variable` to bind"));
        };
        self.expect_keyword(Keyword::In)?;
        let iterable = self.parse_expr()?;
        let (body, end) = self.parse_do_block()?;
        Ok(Stmt::For(ForLoop {
            variable,
            iterable,
            body,
            span: start.covering(end),
        }))
    }

    fn parse_loop_block(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Loop)?;
        let max_iterations = if matches!(self.peek_kind(), TokenKind::Ident(name) if name == "max")
        {
            self.next();
            let token = self.next();
            let TokenKind::Int(n) = token.kind else {
                return Err(self.unexpected(&token, "an iteration limit"));
            };
            if n <= 0 {
                return Err(Diagnostic::error(
                    ErrorCode::ParseError,
                    "loop limit must be a positive integer",
                    token.span,
                ));
            }
            Some(n as u32)
        } else {
            None
        };
        let (body, end) = self.parse_do_block()?;
        Ok(Stmt::Loop {
            max_iterations,
            body,
            span: start.covering(end),
        })
    }

    /// ```text
    /// match $expr
    ///     when "pattern" -> stmt
    ///     else -> stmt
    /// end
    /// ```
    fn parse_match_block(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Match)?;
        let scrutinee = self.parse_expr()?;
        self.expect_newline()?;
        self.expect(&TokenKind::Indent)?;

        let mut cases = Vec::new();
        let mut else_body = None;
        loop {
            self.skip_newlines();
            if self.check(&TokenKind::Dedent) || self.check(&TokenKind::Eof) {
                break;
            }
            if self.check_keyword(Keyword::When) {
                let case_start = self.next_span();
                let token = self.next();
                let TokenKind::Str(pattern) = token.kind else {
                    return Err(self.unexpected(&token, "a quoted pattern"));
                };
                self.expect(&TokenKind::Arrow)?;
                let stmt = self.parse_stmt()?;
                let span = case_start.covering(stmt.span());
                cases.push(MatchCase {
                    pattern,
                    body: vec![stmt],
                    span,
                });
            } else if self.check_keyword(Keyword::Else) {
                self.next();
                self.expect(&TokenKind::Arrow)?;
                let stmt = self.parse_stmt()?;
                else_body = Some(vec![stmt]);
            } else {
                let token = self.peek().clone();
                return Err(self.unexpected(&token, "`when` or `else`"));
            }
        }
        self.expect(&TokenKind::Dedent)?;
        let end = self.expect_keyword(Keyword::End)?;
        self.expect_newline()?;

        Ok(Stmt::Match(MatchBlock {
            scrutinee,
            cases,
            else_body,
            span: start.covering(end),
        }))
    }

    /// Block form `if cond:` + indented body, or inline `if cond: stmt`.
    fn parse_if_block(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::If)?;
        let condition = self.parse_expr()?;
        self.expect(&TokenKind::Colon)?;
        if self.check(&TokenKind::Newline) {
            self.next();
            let body = self.parse_indented_body()?;
            let end = body.last().map(Stmt::span).unwrap_or(condition.span());
            return Ok(Stmt::If(IfBlock {
                condition,
                body,
                span: start.covering(end),
            }));
        }
        let stmt = self.parse_stmt()?;
        let span = start.covering(stmt.span());
        Ok(Stmt::If(IfBlock {
            condition,
            body: vec![stmt],
            span,
        }))
    }

    /// `(on|after) <event> do ... end` at file scope.
    pub(super) fn parse_event_handler(&mut self) -> ParseResult<EventHandler> {
        let (timing, start) = if self.check_keyword(Keyword::On) {
            (HandlerTiming::On, self.next_span())
        } else {
            let span = self.expect_keyword(Keyword::After)?;
            (HandlerTiming::After, span)
        };
        let (event_name, event_span) = self.parse_name()?;
        let event = match event_name.as_str() {
            "start" => HandlerEvent::Start,
            "input" => HandlerEvent::Input,
            "output" => HandlerEvent::Output,
            "tool_call" => HandlerEvent::ToolCall,
            "tool_result" => HandlerEvent::ToolResult,
            other => {
                return Err(Diagnostic::error(
                    ErrorCode::ParseError,
                    format!("unknown event `{other}`"),
                    event_span,
                )
                .with_help(
                    "expected `start`, `input`, `output`, `tool_call` or `tool_result`",
                ));
            }
        };
        let (body, end) = self.parse_do_block()?;
        Ok(EventHandler {
            timing,
            event,
            body,
            span: start.covering(end),
        })
    }
}
