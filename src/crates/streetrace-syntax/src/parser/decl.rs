//! Top-level declaration parsing.

use crate::ast::{
    AgentDef, BackoffKind, BaseType, Decl, EscalationCondition, EscalationOp, FlowDef, ImportKind,
    ImportStmt, LiteralValue, ModelDef, PolicyDef, PreserveItem, PromptDef, RetryPolicyDef,
    SchemaDef, SchemaField, TimeUnit, TimeoutPolicyDef, ToolAuth, ToolDef, ToolKind, TypeExpr,
};
use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::source::Span;
use crate::token::{Keyword, TokenKind};

use super::{ParseResult, Parser};

impl Parser {
    pub(super) fn parse_decl(&mut self) -> ParseResult<Decl> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Import) => self.parse_import().map(Decl::Import),
            TokenKind::Keyword(Keyword::Model) => self.parse_model().map(Decl::Model),
            TokenKind::Keyword(Keyword::Schema) => self.parse_schema().map(Decl::Schema),
            TokenKind::Keyword(Keyword::Tool) => self.parse_tool().map(Decl::Tool),
            TokenKind::Keyword(Keyword::Prompt) => self.parse_prompt().map(Decl::Prompt),
            TokenKind::Keyword(Keyword::Agent) => self.parse_agent().map(Decl::Agent),
            TokenKind::Keyword(Keyword::Flow) => self.parse_flow().map(Decl::Flow),
            TokenKind::Keyword(Keyword::Policy) => self.parse_policy().map(Decl::Policy),
            TokenKind::Keyword(Keyword::Retry) => self.parse_retry_policy().map(Decl::RetryPolicy),
            TokenKind::Keyword(Keyword::Timeout) => {
                self.parse_timeout_policy().map(Decl::TimeoutPolicy)
            }
            TokenKind::Keyword(Keyword::On) | TokenKind::Keyword(Keyword::After) => {
                self.parse_event_handler().map(Decl::EventHandler)
            }
            _ => {
                let token = self.peek().clone();
                Err(self.unexpected(&token, "a declaration"))
            }
        }
    }

    fn parse_import(&mut self) -> ParseResult<ImportStmt> {
        let start = self.expect_keyword(Keyword::Import)?;
        if let TokenKind::LocalPath(path) = self.peek_kind().clone() {
            let end = self.next_span();
            self.expect_newline()?;
            return Ok(ImportStmt {
                kind: ImportKind::Local { path },
                span: start.covering(end),
            });
        }
        let (name, _) = self.parse_name()?;
        self.expect_keyword(Keyword::From)?;
        let token = self.next();
        let kind = match token.kind {
            TokenKind::Keyword(Keyword::Streetrace) => ImportKind::Streetrace { name },
            TokenKind::PipUri(uri) => ImportKind::Pip { name, uri },
            TokenKind::McpUri(uri) => ImportKind::Mcp { name, uri },
            _ => {
                return Err(self.unexpected(&token, "`streetrace`, a `pip://` or `mcp://` source"));
            }
        };
        let span = start.covering(token.span);
        self.expect_newline()?;
        Ok(ImportStmt { kind, span })
    }

    fn parse_model(&mut self) -> ParseResult<ModelDef> {
        let start = self.expect_keyword(Keyword::Model)?;
        let (name, name_span) = self.parse_name()?;
        if self.eat(&TokenKind::Eq) {
            let token = self.next();
            let provider_model = match token.kind {
                TokenKind::ProviderModel(id) => id,
                TokenKind::DottedName(id) => id,
                TokenKind::Str(id) => id,
                _ => return Err(self.unexpected(&token, "a `provider/model` id")),
            };
            self.expect_newline()?;
            return Ok(ModelDef {
                name,
                provider_model: Some(provider_model),
                properties: Vec::new(),
                span: start.covering(token.span),
            });
        }
        self.expect(&TokenKind::Colon)?;
        self.expect_newline()?;
        let (properties, end) = self.parse_property_block(name_span)?;
        Ok(ModelDef {
            name,
            provider_model: None,
            properties,
            span: start.covering(end),
        })
    }

    /// An indented block of `key: value` lines shared by long-form models
    /// and tools.
    fn parse_property_block(
        &mut self,
        fallback: Span,
    ) -> ParseResult<(Vec<(String, LiteralValue)>, Span)> {
        self.expect(&TokenKind::Indent)?;
        let mut properties = Vec::new();
        let mut end = fallback;
        while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
            let (key, _) = self.parse_name()?;
            self.expect(&TokenKind::Colon)?;
            let (value, vspan) = self.parse_property_value()?;
            end = vspan;
            properties.push((key, value));
            self.expect_newline()?;
            self.skip_newlines();
        }
        self.expect(&TokenKind::Dedent)?;
        Ok((properties, end))
    }

    /// Property values are literals, or bare names taken as strings
    /// (`provider: anthropic`).
    fn parse_property_value(&mut self) -> ParseResult<(LiteralValue, Span)> {
        let token = self.next();
        let value = match token.kind {
            TokenKind::Int(v) => LiteralValue::Int(v),
            TokenKind::Float(v) => LiteralValue::Float(v),
            TokenKind::Str(v) | TokenKind::TripleStr(v) => LiteralValue::Str(v),
            TokenKind::Keyword(Keyword::True) => LiteralValue::Bool(true),
            TokenKind::Keyword(Keyword::False) => LiteralValue::Bool(false),
            TokenKind::Keyword(Keyword::Null) => LiteralValue::Null,
            TokenKind::Ident(v)
            | TokenKind::DottedName(v)
            | TokenKind::ProviderModel(v) => LiteralValue::Str(v),
            TokenKind::Keyword(kw) => LiteralValue::Str(kw.as_str().to_string()),
            _ => return Err(self.unexpected(&token, "a value")),
        };
        Ok((value, token.span))
    }

    fn parse_schema(&mut self) -> ParseResult<SchemaDef> {
        let start = self.expect_keyword(Keyword::Schema)?;
        let (name, name_span) = self.parse_name()?;
        self.expect(&TokenKind::Colon)?;
        self.expect_newline()?;
        self.expect(&TokenKind::Indent)?;
        let mut fields = Vec::new();
        let mut end = name_span;
        while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
            let (field_name, fstart) = self.parse_name()?;
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type_expr()?;
            end = ty.span;
            fields.push(SchemaField {
                name: field_name,
                ty,
                span: fstart.covering(end),
            });
            self.expect_newline()?;
            self.skip_newlines();
        }
        self.expect(&TokenKind::Dedent)?;
        Ok(SchemaDef {
            name,
            fields,
            span: start.covering(end),
        })
    }

    fn parse_type_expr(&mut self) -> ParseResult<TypeExpr> {
        let (name, start) = self.parse_name()?;
        if name == "list" && self.check(&TokenKind::LBracket) {
            self.next();
            let (elem, _) = self.parse_name()?;
            let base = self.base_type(&elem, start)?;
            let end = self.expect(&TokenKind::RBracket)?;
            let is_optional = self.eat(&TokenKind::Question);
            return Ok(TypeExpr {
                base,
                is_list: true,
                is_optional,
                span: start.covering(end),
            });
        }
        let base = self.base_type(&name, start)?;
        let mut span = start;
        let is_optional = if self.check(&TokenKind::Question) {
            span = span.covering(self.next_span());
            true
        } else {
            false
        };
        Ok(TypeExpr {
            base,
            is_list: false,
            is_optional,
            span,
        })
    }

    fn base_type(&self, name: &str, span: Span) -> ParseResult<BaseType> {
        BaseType::from_name(name).ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::ParseError,
                format!("unknown type `{name}`"),
                span,
            )
            .with_help("expected one of `bool`, `int`, `float`, `string`, `object`")
        })
    }

    fn parse_tool(&mut self) -> ParseResult<ToolDef> {
        let start = self.expect_keyword(Keyword::Tool)?;
        let (name, name_span) = self.parse_name()?;
        if self.eat(&TokenKind::Eq) {
            let token = self.next();
            let (kind, end) = match token.kind {
                TokenKind::Keyword(Keyword::Mcp) => {
                    let url_token = self.next();
                    let TokenKind::Str(url) = url_token.kind else {
                        return Err(self.unexpected(&url_token, "a quoted URL"));
                    };
                    let mut end = url_token.span;
                    let auth = if self.eat_keyword(Keyword::With) {
                        self.expect_keyword(Keyword::Auth)?;
                        let kind_token = self.next();
                        let value_token = self.next();
                        let TokenKind::Str(value) = value_token.kind else {
                            return Err(self.unexpected(&value_token, "a quoted credential"));
                        };
                        end = value_token.span;
                        match kind_token.kind {
                            TokenKind::Keyword(Keyword::Bearer) => Some(ToolAuth::Bearer(value)),
                            TokenKind::Keyword(Keyword::Basic) => Some(ToolAuth::Basic(value)),
                            _ => {
                                return Err(
                                    self.unexpected(&kind_token, "`bearer` or `basic`")
                                );
                            }
                        }
                    } else {
                        None
                    };
                    (ToolKind::Mcp { url, auth }, end)
                }
                TokenKind::Keyword(Keyword::Builtin) => {
                    let ref_token = self.next();
                    let reference = match ref_token.kind {
                        TokenKind::DottedName(r) | TokenKind::Ident(r) => r,
                        TokenKind::Keyword(kw) => kw.as_str().to_string(),
                        _ => return Err(self.unexpected(&ref_token, "a builtin reference")),
                    };
                    (ToolKind::Builtin { reference }, ref_token.span)
                }
                _ => return Err(self.unexpected(&token, "`mcp` or `builtin`")),
            };
            self.expect_newline()?;
            return Ok(ToolDef {
                name,
                kind,
                span: start.covering(end),
            });
        }
        self.expect(&TokenKind::Colon)?;
        self.expect_newline()?;
        let (properties, end) = self.parse_property_block(name_span)?;
        Ok(ToolDef {
            name,
            kind: ToolKind::Custom { properties },
            span: start.covering(end),
        })
    }

    fn parse_retry_policy(&mut self) -> ParseResult<RetryPolicyDef> {
        let start = self.expect_keyword(Keyword::Retry)?;
        let (name, _) = self.parse_name()?;
        self.expect(&TokenKind::Eq)?;
        let times_token = self.next();
        let TokenKind::Int(times) = times_token.kind else {
            return Err(self.unexpected(&times_token, "a retry count"));
        };
        if times <= 0 {
            return Err(Diagnostic::error(
                ErrorCode::ParseError,
                "retry count must be a positive integer",
                times_token.span,
            ));
        }
        self.expect_keyword(Keyword::Times)?;
        self.expect(&TokenKind::Comma)?;
        let backoff_token = self.next();
        let backoff = match backoff_token.kind {
            TokenKind::Keyword(Keyword::Exponential) => BackoffKind::Exponential,
            TokenKind::Keyword(Keyword::Linear) => BackoffKind::Linear,
            TokenKind::Keyword(Keyword::Fixed) => BackoffKind::Fixed,
            _ => {
                return Err(
                    self.unexpected(&backoff_token, "`exponential`, `linear` or `fixed`")
                );
            }
        };
        let end = self.expect_keyword(Keyword::Backoff)?;
        self.expect_newline()?;
        Ok(RetryPolicyDef {
            name,
            times: times as u32,
            backoff,
            span: start.covering(end),
        })
    }

    fn parse_timeout_policy(&mut self) -> ParseResult<TimeoutPolicyDef> {
        let start = self.expect_keyword(Keyword::Timeout)?;
        let (name, _) = self.parse_name()?;
        self.expect(&TokenKind::Eq)?;
        let value_token = self.next();
        let TokenKind::Int(value) = value_token.kind else {
            return Err(self.unexpected(&value_token, "a duration value"));
        };
        let unit_token = self.next();
        let unit = match unit_token.kind {
            TokenKind::Keyword(Keyword::Seconds) => TimeUnit::Seconds,
            TokenKind::Keyword(Keyword::Minutes) => TimeUnit::Minutes,
            TokenKind::Keyword(Keyword::Hours) => TimeUnit::Hours,
            _ => {
                return Err(self.unexpected(&unit_token, "`seconds`, `minutes` or `hours`"));
            }
        };
        self.expect_newline()?;
        Ok(TimeoutPolicyDef {
            name,
            value: value as u64,
            unit,
            span: start.covering(unit_token.span),
        })
    }

    fn parse_policy(&mut self) -> ParseResult<PolicyDef> {
        let start = self.expect_keyword(Keyword::Policy)?;
        let (name, name_span) = self.parse_name()?;
        self.expect(&TokenKind::Colon)?;
        self.expect_newline()?;
        self.expect(&TokenKind::Indent)?;

        let mut trigger = None;
        let mut strategy = None;
        let mut preserve = Vec::new();
        let mut end = name_span;

        while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
            let (key, key_span) = self.parse_name()?;
            self.expect(&TokenKind::Colon)?;
            match key.as_str() {
                "trigger" => {
                    let expr = self.parse_expr()?;
                    end = expr.span();
                    trigger = Some(expr);
                }
                "strategy" => {
                    let (value, vspan) = self.parse_name()?;
                    end = vspan;
                    strategy = Some(value);
                }
                "preserve" => {
                    loop {
                        let (item, ispan) = self.parse_preserve_item()?;
                        end = ispan;
                        preserve.push(item);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                other => {
                    return Err(Diagnostic::error(
                        ErrorCode::ParseError,
                        format!("unknown policy property `{other}`"),
                        key_span,
                    )
                    .with_help("expected `trigger`, `strategy` or `preserve`"));
                }
            }
            self.expect_newline()?;
            self.skip_newlines();
        }
        self.expect(&TokenKind::Dedent)?;
        Ok(PolicyDef {
            name,
            trigger,
            strategy,
            preserve,
            span: start.covering(end),
        })
    }

    fn parse_preserve_item(&mut self) -> ParseResult<(PreserveItem, Span)> {
        let token = self.next();
        match token.kind {
            TokenKind::Variable(name) => Ok((PreserveItem::Var(name), token.span)),
            TokenKind::Keyword(Keyword::Last) => {
                let count_token = self.next();
                let TokenKind::Int(count) = count_token.kind else {
                    return Err(self.unexpected(&count_token, "a message count"));
                };
                let end = self.expect_keyword(Keyword::Messages)?;
                Ok((PreserveItem::LastMessages(count as u32), token.span.covering(end)))
            }
            TokenKind::Keyword(Keyword::Tool) => {
                let end = self.expect_keyword(Keyword::Results)?;
                Ok((PreserveItem::ToolResults, token.span.covering(end)))
            }
            _ => Err(self.unexpected(
                &token,
                "`$variable`, `last N messages` or `tool results`",
            )),
        }
    }

    fn parse_prompt(&mut self) -> ParseResult<PromptDef> {
        let start = self.expect_keyword(Keyword::Prompt)?;
        let (name, name_span) = self.parse_name()?;
        let mut end = name_span;

        let mut model = None;
        let mut expecting = None;
        let mut inherit = None;
        let mut escalation = None;

        loop {
            match self.peek_kind() {
                TokenKind::Keyword(Keyword::Using) => {
                    self.next();
                    self.expect_keyword(Keyword::Model)?;
                    let token = self.next();
                    let value = match token.kind {
                        TokenKind::Str(v) | TokenKind::Ident(v) | TokenKind::ProviderModel(v) => v,
                        _ => return Err(self.unexpected(&token, "a model name")),
                    };
                    end = token.span;
                    model = Some(value);
                }
                TokenKind::Keyword(Keyword::Expecting) => {
                    self.next();
                    let (schema, sspan) = self.parse_name()?;
                    end = sspan;
                    let mut value = schema;
                    if self.check(&TokenKind::LBracket) {
                        self.next();
                        end = self.expect(&TokenKind::RBracket)?;
                        value.push_str("[]");
                    }
                    expecting = Some(value);
                }
                TokenKind::Keyword(Keyword::Inherit) => {
                    self.next();
                    let token = self.next();
                    let value = match token.kind {
                        TokenKind::Variable(v) => v,
                        TokenKind::Ident(v) => v,
                        _ => return Err(self.unexpected(&token, "a prompt to inherit")),
                    };
                    end = token.span;
                    inherit = Some(value);
                }
                TokenKind::Keyword(Keyword::Escalate) => {
                    let estart = self.next_span();
                    self.expect_keyword(Keyword::If)?;
                    let op_token = self.next();
                    let op = match op_token.kind {
                        TokenKind::Tilde => EscalationOp::Normalized,
                        TokenKind::EqEq => EscalationOp::Eq,
                        TokenKind::NotEq => EscalationOp::Ne,
                        TokenKind::Keyword(Keyword::Contains) => EscalationOp::Contains,
                        _ => {
                            return Err(
                                self.unexpected(&op_token, "`~`, `==`, `!=` or `contains`")
                            );
                        }
                    };
                    let value_token = self.next();
                    let TokenKind::Str(value) = value_token.kind else {
                        return Err(self.unexpected(&value_token, "a quoted value"));
                    };
                    end = value_token.span;
                    escalation = Some(EscalationCondition {
                        op,
                        value,
                        span: estart.covering(end),
                    });
                }
                _ => break,
            }
        }

        let body = if self.eat(&TokenKind::Colon) {
            let token = self.next();
            let text = match token.kind {
                TokenKind::TripleStr(text) | TokenKind::Str(text) => text,
                _ => return Err(self.unexpected(&token, "a prompt body")),
            };
            end = token.span;
            Some(text.trim().to_string())
        } else {
            None
        };
        self.expect_newline()?;

        Ok(PromptDef {
            name,
            body,
            model,
            expecting,
            inherit,
            escalation,
            span: start.covering(end),
        })
    }

    fn parse_agent(&mut self) -> ParseResult<AgentDef> {
        let start = self.expect_keyword(Keyword::Agent)?;
        let name = if self.check(&TokenKind::Colon) {
            None
        } else {
            Some(self.parse_name()?.0)
        };
        self.expect(&TokenKind::Colon)?;

        let mut agent = AgentDef {
            name,
            tools: Vec::new(),
            instruction: None,
            inline_prompt: None,
            produces: None,
            description: None,
            history: None,
            model: None,
            retry: None,
            timeout: None,
            delegate: Vec::new(),
            agent_tools: Vec::new(),
            span: start,
        };
        let mut end = start;

        if self.check(&TokenKind::Newline) {
            // Block form.
            self.next();
            self.expect(&TokenKind::Indent)?;
            while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
                end = self.parse_agent_property(&mut agent)?;
                self.expect_newline()?;
                self.skip_newlines();
            }
            self.expect(&TokenKind::Dedent)?;
        } else {
            // Short form: `agent: tools fs; instruction greet`.
            loop {
                end = self.parse_agent_property(&mut agent)?;
                if !self.eat(&TokenKind::Semicolon) {
                    break;
                }
            }
            self.expect_newline()?;
        }

        agent.span = start.covering(end);
        Ok(agent)
    }

    fn parse_agent_property(&mut self, agent: &mut AgentDef) -> ParseResult<Span> {
        let (key, key_span) = self.parse_name()?;
        let end = match key.as_str() {
            "tools" => {
                let (names, span) = self.parse_name_list()?;
                agent.tools = names;
                span
            }
            "instruction" => {
                let (value, span) = self.parse_name()?;
                agent.instruction = Some(value);
                span
            }
            "prompt" => {
                let token = self.next();
                let text = match token.kind {
                    TokenKind::TripleStr(text) | TokenKind::Str(text) => text,
                    _ => return Err(self.unexpected(&token, "a prompt body")),
                };
                agent.inline_prompt = Some(text.trim().to_string());
                token.span
            }
            "produces" => {
                let (value, mut span) = self.parse_name()?;
                let mut value = value;
                if self.check(&TokenKind::LBracket) {
                    self.next();
                    span = self.expect(&TokenKind::RBracket)?;
                    value.push_str("[]");
                }
                agent.produces = Some(value);
                span
            }
            "description" => {
                let token = self.next();
                let TokenKind::Str(text) = token.kind else {
                    return Err(self.unexpected(&token, "a quoted description"));
                };
                agent.description = Some(text);
                token.span
            }
            "history" => {
                let (value, span) = self.parse_name()?;
                if value != "truncate" && value != "summarize" {
                    return Err(Diagnostic::error(
                        ErrorCode::ParseError,
                        format!("unknown history strategy `{value}`"),
                        span,
                    )
                    .with_help("expected `truncate` or `summarize`"));
                }
                agent.history = Some(value);
                span
            }
            "model" => {
                let token = self.next();
                let value = match token.kind {
                    TokenKind::Str(v)
                    | TokenKind::Ident(v)
                    | TokenKind::ProviderModel(v) => v,
                    TokenKind::Keyword(kw) => kw.as_str().to_string(),
                    _ => return Err(self.unexpected(&token, "a model name")),
                };
                agent.model = Some(value);
                token.span
            }
            "retry" => {
                let (value, span) = self.parse_name()?;
                agent.retry = Some(value);
                span
            }
            "timeout" => {
                let (value, span) = self.parse_name()?;
                agent.timeout = Some(value);
                span
            }
            "delegate" => {
                let (names, span) = self.parse_name_list()?;
                agent.delegate = names;
                span
            }
            "use" => {
                // `use agents a, b`
                let (next, next_span) = self.parse_name()?;
                if next != "agents" {
                    return Err(Diagnostic::error(
                        ErrorCode::ParseError,
                        format!("expected `agents` after `use`, found `{next}`"),
                        next_span,
                    ));
                }
                let (names, span) = self.parse_name_list()?;
                agent.agent_tools = names;
                span
            }
            other => {
                return Err(Diagnostic::error(
                    ErrorCode::ParseError,
                    format!("unknown agent property `{other}`"),
                    key_span,
                ));
            }
        };
        Ok(end)
    }

    fn parse_name_list(&mut self) -> ParseResult<(Vec<String>, Span)> {
        let (first, mut span) = self.parse_name()?;
        let mut names = vec![first];
        while self.eat(&TokenKind::Comma) {
            let (next, nspan) = self.parse_name()?;
            span = nspan;
            names.push(next);
        }
        Ok((names, span))
    }

    fn parse_flow(&mut self) -> ParseResult<FlowDef> {
        let start = self.expect_keyword(Keyword::Flow)?;
        let (name, name_span) = self.parse_name()?;
        self.expect(&TokenKind::Colon)?;
        self.expect_newline()?;
        let body = self.parse_indented_body()?;
        let end = body.last().map(|s| s.span()).unwrap_or(name_span);
        Ok(FlowDef {
            name,
            body,
            span: start.covering(end),
        })
    }
}
