//! Expression parsing.
//!
//! Standard precedence climbing: `or` < `and` < `not` < comparison <
//! additive < multiplicative < unary minus < atoms. Keywords are not valid
//! atoms (except literals and `filter`), which is what lets `do`, `to` and
//! `with` terminate an expression without lookahead.

use crate::ast::{BinOp, Expr, LiteralValue, UnOp};
use crate::source::Span;
use crate::token::{Keyword, TokenKind};

use super::{ParseResult, Parser};

impl Parser {
    pub(super) fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            let span = left.span().covering(right.span());
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            let span = left.span().covering(right.span());
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.check_keyword(Keyword::Not) {
            let start = self.next_span();
            let operand = self.parse_not()?;
            let span = start.covering(operand.span());
            return Ok(Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq => BinOp::Eq,
            TokenKind::NotEq => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Ge => BinOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_additive()?;
        let span = left.span().covering(right.span());
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            span,
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            let span = left.span().covering(right.span());
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            let span = left.span().covering(right.span());
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        if self.check(&TokenKind::Minus) {
            let start = self.next_span();
            let operand = self.parse_unary()?;
            let span = start.covering(operand.span());
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Int(v) => {
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Int(*v),
                    span,
                })
            }
            TokenKind::Float(v) => {
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Float(*v),
                    span,
                })
            }
            TokenKind::Str(v) | TokenKind::TripleStr(v) => {
                let value = v.clone();
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Str(value),
                    span,
                })
            }
            TokenKind::Keyword(Keyword::True) => {
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Bool(true),
                    span,
                })
            }
            TokenKind::Keyword(Keyword::False) => {
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Bool(false),
                    span,
                })
            }
            TokenKind::Keyword(Keyword::Null) => {
                let span = self.next_span();
                Ok(Expr::Literal {
                    value: LiteralValue::Null,
                    span,
                })
            }
            TokenKind::Variable(name) => {
                let name = name.clone();
                let start = self.next_span();
                self.parse_property_chain(
                    Expr::Var {
                        name,
                        span: start,
                    },
                    start,
                )
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                let start = self.next_span();
                if self.check(&TokenKind::LParen) {
                    return self.parse_call_args(name, start);
                }
                self.parse_property_chain(
                    Expr::Name {
                        name,
                        span: start,
                    },
                    start,
                )
            }
            TokenKind::DottedName(dotted) => {
                let parts: Vec<String> = dotted.split('.').map(str::to_string).collect();
                let start = self.next_span();
                let base = Expr::Name {
                    name: parts[0].clone(),
                    span: start,
                };
                Ok(Expr::Property {
                    base: Box::new(base),
                    path: parts[1..].to_vec(),
                    span: start,
                })
            }
            TokenKind::Dot => {
                // `.prop` — implicit property of the filtered element.
                let start = self.next_span();
                let part = self.next();
                let path = match part.kind {
                    TokenKind::Ident(name) => vec![name],
                    TokenKind::DottedName(dotted) => {
                        dotted.split('.').map(str::to_string).collect()
                    }
                    TokenKind::Keyword(kw) => vec![kw.as_str().to_string()],
                    _ => return Err(self.unexpected(&part, "a property name")),
                };
                Ok(Expr::ImplicitProperty {
                    path,
                    span: start.covering(part.span),
                })
            }
            TokenKind::Keyword(Keyword::Filter) => {
                let start = self.next_span();
                let list = self.parse_atom()?;
                self.expect_keyword(Keyword::Where)?;
                let condition = self.parse_or()?;
                let span = start.covering(condition.span());
                Ok(Expr::Filter {
                    list: Box::new(list),
                    condition: Box::new(condition),
                    span,
                })
            }
            TokenKind::LParen => {
                self.next();
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_list_literal(),
            TokenKind::LBrace => self.parse_object_literal(),
            _ => Err(self.unexpected(&token, "an expression")),
        }
    }

    /// Fold `.a.b` segments following a variable or name into a single
    /// `Property` node.
    fn parse_property_chain(&mut self, base: Expr, start: Span) -> ParseResult<Expr> {
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
        if path.is_empty() {
            return Ok(base);
        }
        Ok(Expr::Property {
            base: Box::new(base),
            path,
            span: start.covering(end),
        })
    }

    fn parse_call_args(&mut self, name: String, start: Span) -> ParseResult<Expr> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let end = self.expect(&TokenKind::RParen)?;
        Ok(Expr::Call {
            name,
            args,
            span: start.covering(end),
        })
    }

    fn parse_list_literal(&mut self) -> ParseResult<Expr> {
        let start = self.expect(&TokenKind::LBracket)?;
        let mut elements = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                // Allow a trailing comma before the closing bracket.
                if self.check(&TokenKind::RBracket) {
                    break;
                }
            }
        }
        let end = self.expect(&TokenKind::RBracket)?;
        Ok(Expr::List {
            elements,
            span: start.covering(end),
        })
    }

    fn parse_object_literal(&mut self) -> ParseResult<Expr> {
        let start = self.expect(&TokenKind::LBrace)?;
        let mut entries = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let key_token = self.next();
                let key = match key_token.kind {
                    TokenKind::Str(k) => k,
                    TokenKind::Ident(k) => k,
                    TokenKind::Keyword(kw) => kw.as_str().to_string(),
                    _ => return Err(self.unexpected(&key_token, "an object key")),
                };
                self.expect(&TokenKind::Colon)?;
                let value = self.parse_expr()?;
                entries.push((key, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }
        let end = self.expect(&TokenKind::RBrace)?;
        Ok(Expr::Object {
            entries,
            span: start.covering(end),
        })
    }
}
