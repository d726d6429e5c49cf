use std::collections::VecDeque;
use std::rc::Rc;

use super::ast::{
    BinaryOp, Branch, CallArg, Expr, ExprKind, FunctionBody, LocalName, PrefixOp, TableEntry,
};
use super::lexer::{Lexer, Token, TokenKind, number_value};
use super::{CompileError, CompileErrorKind};

/// Binding strength of infix operators, weakest first.
mod precedence {
    pub const NONE: u8 = 0;
    pub const ASSIGN: u8 = 1;
    pub const OR: u8 = 2;
    pub const AND: u8 = 3;
    pub const EQUALITY: u8 = 4;
    pub const RELATIONAL: u8 = 5;
    pub const ADDITION: u8 = 6;
    pub const MULTIPLICATION: u8 = 7;
    pub const EXPONENT: u8 = 8;
    pub const PREFIX: u8 = 9;
    pub const POSTFIX: u8 = 10;
}

type PrefixRule<'a> = fn(&mut Parser<'a>, Token) -> Result<Expr, CompileError>;
type InfixParse<'a> = fn(&mut Parser<'a>, Expr, Token) -> Result<Expr, CompileError>;
type StatementRule<'a> = fn(&mut Parser<'a>, Token) -> Result<Expr, CompileError>;

#[derive(Clone, Copy)]
struct InfixRule<'a> {
    precedence: u8,
    parse: InfixParse<'a>,
}

fn prefix_rule<'a>(kind: TokenKind) -> Option<PrefixRule<'a>> {
    let rule: PrefixRule<'a> = match kind {
        TokenKind::Number => Parser::parse_number,
        TokenKind::String => Parser::parse_string,
        TokenKind::Identifier => Parser::parse_identifier,
        TokenKind::Nil => Parser::parse_nil,
        TokenKind::True | TokenKind::False => Parser::parse_bool,
        TokenKind::Minus | TokenKind::Not => Parser::parse_prefix_operator,
        TokenKind::LParen => Parser::parse_group,
        TokenKind::LBrace => Parser::parse_table,
        TokenKind::Function => Parser::parse_function,
        _ => return None,
    };
    Some(rule)
}

fn infix_rule<'a>(kind: TokenKind) -> Option<InfixRule<'a>> {
    let (precedence, parse): (u8, InfixParse<'a>) = match kind {
        TokenKind::Assign => (precedence::ASSIGN, Parser::parse_assign),
        TokenKind::Or => (precedence::OR, Parser::parse_binary),
        TokenKind::And => (precedence::AND, Parser::parse_binary),
        TokenKind::EqualEqual | TokenKind::NotEqual => (precedence::EQUALITY, Parser::parse_binary),
        TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::DotDot => (precedence::RELATIONAL, Parser::parse_binary),
        TokenKind::Plus | TokenKind::Minus => (precedence::ADDITION, Parser::parse_binary),
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
            (precedence::MULTIPLICATION, Parser::parse_binary)
        }
        TokenKind::Caret => (precedence::EXPONENT, Parser::parse_binary),
        TokenKind::LParen => (precedence::POSTFIX, Parser::parse_call),
        TokenKind::Dot | TokenKind::Colon => (precedence::POSTFIX, Parser::parse_field),
        TokenKind::LBracket => (precedence::POSTFIX, Parser::parse_index),
        _ => return None,
    };
    Some(InfixRule { precedence, parse })
}

fn statement_rule<'a>(kind: TokenKind) -> Option<StatementRule<'a>> {
    let rule: StatementRule<'a> = match kind {
        TokenKind::Semicolon => Parser::parse_empty_statement,
        TokenKind::Do => Parser::parse_do,
        TokenKind::Function => Parser::parse_function_statement,
        TokenKind::Return => Parser::parse_return,
        TokenKind::Break => Parser::parse_break,
        TokenKind::Local => Parser::parse_local,
        TokenKind::If => Parser::parse_if,
        TokenKind::While => Parser::parse_while,
        TokenKind::Repeat => Parser::parse_repeat,
        TokenKind::For => Parser::parse_for,
        TokenKind::DoubleColon => Parser::parse_unsupported,
        _ => return None,
    };
    Some(rule)
}

fn binary_op(kind: TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Mod,
        TokenKind::Caret => BinaryOp::Pow,
        TokenKind::DotDot => BinaryOp::Concat,
        TokenKind::EqualEqual => BinaryOp::Eq,
        TokenKind::NotEqual => BinaryOp::Neq,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEqual => BinaryOp::Lte,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEqual => BinaryOp::Gte,
        TokenKind::And => BinaryOp::And,
        TokenKind::Or => BinaryOp::Or,
        _ => return None,
    };
    Some(op)
}

fn is_right_associative(kind: TokenKind) -> bool {
    matches!(kind, TokenKind::Assign | TokenKind::Caret)
}

/// Tokens that close a block; `return` takes no value in front of them.
const BLOCK_END: [TokenKind; 5] = [
    TokenKind::End,
    TokenKind::Else,
    TokenKind::ElseIf,
    TokenKind::Until,
    TokenKind::Eof,
];

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    buffer: VecDeque<Token>,
    file: Rc<str>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, file: Rc<str>) -> Self {
        Self {
            lexer: Lexer::new(source, file.clone()),
            buffer: VecDeque::new(),
            file,
        }
    }

    /// Parses a whole chunk into a block expression.
    pub fn parse_program(&mut self) -> Result<Expr, CompileError> {
        let body = self.parse_block(&[TokenKind::Eof])?;
        self.expect(TokenKind::Eof)?;
        Ok(Expr::new(ExprKind::Block(body), 1))
    }

    pub fn parse_statement(&mut self) -> Result<Expr, CompileError> {
        let kind = self.peek_kind(0)?;
        if let Some(rule) = statement_rule(kind) {
            let token = self.take()?;
            return rule(self, token);
        }
        let expr = self.parse_expression(precedence::NONE)?;
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(expr)
    }

    pub fn parse_expression(&mut self, min_precedence: u8) -> Result<Expr, CompileError> {
        let token = self.take()?;
        let Some(prefix) = prefix_rule(token.kind) else {
            return Err(self.expected_error("expression", &token));
        };
        let mut left = prefix(self, token)?;

        loop {
            let kind = self.peek_kind(0)?;
            let Some(rule) = infix_rule(kind) else {
                break;
            };
            if rule.precedence <= min_precedence {
                break;
            }
            let token = self.take()?;
            left = (rule.parse)(self, left, token)?;
        }
        Ok(left)
    }

    fn parse_block(&mut self, terminators: &[TokenKind]) -> Result<Vec<Expr>, CompileError> {
        let mut body = Vec::new();
        loop {
            let kind = self.peek_kind(0)?;
            if kind == TokenKind::Eof || terminators.contains(&kind) {
                return Ok(body);
            }
            body.push(self.parse_statement()?);
        }
    }

    fn parse_number(&mut self, token: Token) -> Result<Expr, CompileError> {
        let value = number_value(&token.text).ok_or_else(|| {
            CompileError::new(
                self.file.clone(),
                token.line,
                CompileErrorKind::InvalidNumber(token.text.clone()),
            )
        })?;
        Ok(Expr::new(ExprKind::Number(value), token.line))
    }

    fn parse_string(&mut self, token: Token) -> Result<Expr, CompileError> {
        Ok(Expr::new(ExprKind::String(token.text), token.line))
    }

    fn parse_identifier(&mut self, token: Token) -> Result<Expr, CompileError> {
        Ok(Expr::new(ExprKind::Identifier(token.text), token.line))
    }

    fn parse_nil(&mut self, token: Token) -> Result<Expr, CompileError> {
        Ok(Expr::new(ExprKind::Nil, token.line))
    }

    fn parse_bool(&mut self, token: Token) -> Result<Expr, CompileError> {
        let value = token.kind == TokenKind::True;
        Ok(Expr::new(ExprKind::Bool(value), token.line))
    }

    fn parse_prefix_operator(&mut self, token: Token) -> Result<Expr, CompileError> {
        let op = if token.kind == TokenKind::Not {
            PrefixOp::Not
        } else {
            PrefixOp::Neg
        };
        let operand = self.parse_expression(precedence::PREFIX)?;
        Ok(Expr::new(
            ExprKind::Prefix {
                op,
                operand: operand.boxed(),
            },
            token.line,
        ))
    }

    fn parse_group(&mut self, _token: Token) -> Result<Expr, CompileError> {
        let expr = self.parse_expression(precedence::NONE)?;
        self.expect(TokenKind::RParen)?;
        Ok(expr)
    }

    fn parse_table(&mut self, token: Token) -> Result<Expr, CompileError> {
        let mut entries = Vec::new();
        loop {
            if self.match_and_take(TokenKind::RBrace)? {
                break;
            }
            let entry = if self.match_and_take(TokenKind::LBracket)? {
                let key = self.parse_expression(precedence::NONE)?;
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Assign)?;
                let value = self.parse_expression(precedence::ASSIGN)?;
                TableEntry::Keyed { key, value }
            } else if self.peek_kind(0)? == TokenKind::Identifier
                && self.peek_kind(1)? == TokenKind::Assign
            {
                let name = self.take()?;
                self.take()?;
                let key = Expr::new(ExprKind::String(name.text), name.line);
                let value = self.parse_expression(precedence::ASSIGN)?;
                TableEntry::Keyed { key, value }
            } else {
                TableEntry::Positional(self.parse_expression(precedence::ASSIGN)?)
            };
            entries.push(entry);

            if self.match_and_take(TokenKind::Comma)? || self.match_and_take(TokenKind::Semicolon)? {
                continue;
            }
            let found = self.take()?;
            if found.kind != TokenKind::RBrace {
                return Err(self.expected_one_of_error(TokenKind::Comma, TokenKind::RBrace, &found));
            }
            break;
        }
        Ok(Expr::new(ExprKind::Table(entries), token.line))
    }

    fn parse_function(&mut self, token: Token) -> Result<Expr, CompileError> {
        let name = if self.peek_kind(0)? == TokenKind::Identifier {
            Some(self.take()?.text)
        } else {
            None
        };
        let function = self.parse_function_body(name)?;
        Ok(Expr::new(
            ExprKind::Function {
                local: false,
                function,
            },
            token.line,
        ))
    }

    fn parse_function_body(&mut self, name: Option<String>) -> Result<FunctionBody, CompileError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        let mut rest = None;
        if !self.match_and_take(TokenKind::RParen)? {
            loop {
                if self.match_and_take(TokenKind::Ellipsis)? {
                    rest = Some(self.expect(TokenKind::Identifier)?.text);
                    self.expect(TokenKind::RParen)?;
                    break;
                }
                params.push(self.expect(TokenKind::Identifier)?.text);
                if self.match_and_take(TokenKind::Comma)? {
                    continue;
                }
                let found = self.take()?;
                if found.kind != TokenKind::RParen {
                    return Err(self.expected_one_of_error(
                        TokenKind::Comma,
                        TokenKind::RParen,
                        &found,
                    ));
                }
                break;
            }
        }
        let body = self.parse_block(&[TokenKind::End])?;
        self.expect(TokenKind::End)?;
        Ok(FunctionBody {
            name,
            params,
            rest,
            body,
        })
    }

    fn parse_binary(&mut self, left: Expr, token: Token) -> Result<Expr, CompileError> {
        let Some(rule) = infix_rule(token.kind) else {
            return Err(self.expected_error("operator", &token));
        };
        let Some(op) = binary_op(token.kind) else {
            return Err(self.expected_error("operator", &token));
        };
        let right = self.parse_expression(self.right_binding(token.kind, rule.precedence))?;
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                left: left.boxed(),
                right: right.boxed(),
            },
            token.line,
        ))
    }

    fn parse_assign(&mut self, target: Expr, token: Token) -> Result<Expr, CompileError> {
        if !target.is_storable() {
            return Err(CompileError::new(
                self.file.clone(),
                token.line,
                CompileErrorKind::LeftSideMustBeStorable,
            ));
        }
        let value =
            self.parse_expression(self.right_binding(TokenKind::Assign, precedence::ASSIGN))?;
        Ok(Expr::new(
            ExprKind::Assign {
                target: target.boxed(),
                value: value.boxed(),
            },
            token.line,
        ))
    }

    fn right_binding(&self, kind: TokenKind, precedence: u8) -> u8 {
        if is_right_associative(kind) {
            precedence - 1
        } else {
            precedence
        }
    }

    fn parse_call(&mut self, callee: Expr, token: Token) -> Result<Expr, CompileError> {
        let mut args = Vec::new();
        if !self.match_and_take(TokenKind::RParen)? {
            loop {
                let splat = self.match_and_take(TokenKind::Ellipsis)?;
                let value = self.parse_expression(precedence::NONE)?;
                args.push(CallArg { value, splat });
                if self.match_and_take(TokenKind::Comma)? {
                    continue;
                }
                let found = self.take()?;
                if found.kind != TokenKind::RParen {
                    return Err(self.expected_one_of_error(
                        TokenKind::Comma,
                        TokenKind::RParen,
                        &found,
                    ));
                }
                break;
            }
        }
        Ok(Expr::new(
            ExprKind::Call {
                callee: callee.boxed(),
                args,
            },
            token.line,
        ))
    }

    fn parse_field(&mut self, target: Expr, token: Token) -> Result<Expr, CompileError> {
        let name = self.expect(TokenKind::Identifier)?.text;
        Ok(Expr::new(
            ExprKind::Field {
                target: target.boxed(),
                name,
            },
            token.line,
        ))
    }

    fn parse_index(&mut self, target: Expr, token: Token) -> Result<Expr, CompileError> {
        let index = self.parse_expression(precedence::NONE)?;
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(
            ExprKind::Index {
                target: target.boxed(),
                index: index.boxed(),
            },
            token.line,
        ))
    }

    fn parse_empty_statement(&mut self, token: Token) -> Result<Expr, CompileError> {
        Ok(Expr::new(ExprKind::Block(Vec::new()), token.line))
    }

    fn parse_do(&mut self, token: Token) -> Result<Expr, CompileError> {
        let body = self.parse_block(&[TokenKind::End])?;
        self.expect(TokenKind::End)?;
        Ok(Expr::new(ExprKind::Scope(body), token.line))
    }

    fn parse_function_statement(&mut self, token: Token) -> Result<Expr, CompileError> {
        let expr = self.parse_function(token)?;
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(expr)
    }

    fn parse_return(&mut self, token: Token) -> Result<Expr, CompileError> {
        let kind = self.peek_kind(0)?;
        let value = if kind == TokenKind::Semicolon || BLOCK_END.contains(&kind) {
            None
        } else {
            Some(self.parse_expression(precedence::NONE)?.boxed())
        };
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(Expr::new(ExprKind::Return(value), token.line))
    }

    fn parse_break(&mut self, token: Token) -> Result<Expr, CompileError> {
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(Expr::new(ExprKind::Break, token.line))
    }

    fn parse_local(&mut self, token: Token) -> Result<Expr, CompileError> {
        if self.match_and_take(TokenKind::Function)? {
            let name = self.expect(TokenKind::Identifier)?.text;
            let function = self.parse_function_body(Some(name))?;
            return Ok(Expr::new(
                ExprKind::Function {
                    local: true,
                    function,
                },
                token.line,
            ));
        }

        let mut names = Vec::new();
        loop {
            let name = self.expect(TokenKind::Identifier)?.text;
            let read_only = if self.match_and_take(TokenKind::Less)? {
                let attribute = self.expect(TokenKind::Identifier)?;
                if attribute.text != "const" {
                    return Err(self.expected_error("'const'", &attribute));
                }
                self.expect(TokenKind::Greater)?;
                true
            } else {
                false
            };
            names.push(LocalName { name, read_only });
            if !self.match_and_take(TokenKind::Comma)? {
                break;
            }
        }

        let mut values = Vec::new();
        if self.match_and_take(TokenKind::Assign)? {
            loop {
                values.push(self.parse_expression(precedence::ASSIGN)?);
                if !self.match_and_take(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(Expr::new(ExprKind::Local { names, values }, token.line))
    }

    fn parse_if(&mut self, token: Token) -> Result<Expr, CompileError> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        loop {
            let condition = self.parse_expression(precedence::NONE)?;
            self.expect(TokenKind::Then)?;
            let body = self.parse_block(&[TokenKind::ElseIf, TokenKind::Else, TokenKind::End])?;
            branches.push(Branch { condition, body });

            let next = self.take()?;
            match next.kind {
                TokenKind::ElseIf => continue,
                TokenKind::Else => {
                    otherwise = Some(self.parse_block(&[TokenKind::End])?);
                    self.expect(TokenKind::End)?;
                    break;
                }
                TokenKind::End => break,
                _ => return Err(self.expected_error("'end'", &next)),
            }
        }
        Ok(Expr::new(
            ExprKind::If {
                branches,
                otherwise,
            },
            token.line,
        ))
    }

    fn parse_while(&mut self, token: Token) -> Result<Expr, CompileError> {
        let condition = self.parse_expression(precedence::NONE)?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_block(&[TokenKind::End])?;
        self.expect(TokenKind::End)?;
        Ok(Expr::new(
            ExprKind::While {
                condition: condition.boxed(),
                body,
            },
            token.line,
        ))
    }

    fn parse_repeat(&mut self, token: Token) -> Result<Expr, CompileError> {
        let body = self.parse_block(&[TokenKind::Until])?;
        self.expect(TokenKind::Until)?;
        let condition = self.parse_expression(precedence::NONE)?;
        self.match_and_take(TokenKind::Semicolon)?;
        Ok(Expr::new(
            ExprKind::RepeatUntil {
                body,
                condition: condition.boxed(),
            },
            token.line,
        ))
    }

    fn parse_for(&mut self, token: Token) -> Result<Expr, CompileError> {
        let variable = self.expect(TokenKind::Identifier)?.text;
        self.expect(TokenKind::Assign)?;
        let start = self.parse_expression(precedence::ASSIGN)?;
        self.expect(TokenKind::Comma)?;
        let limit = self.parse_expression(precedence::ASSIGN)?;
        let step = if self.match_and_take(TokenKind::Comma)? {
            Some(self.parse_expression(precedence::ASSIGN)?.boxed())
        } else {
            None
        };
        self.expect(TokenKind::Do)?;
        let body = self.parse_block(&[TokenKind::End])?;
        self.expect(TokenKind::End)?;
        Ok(Expr::new(
            ExprKind::NumericFor {
                variable,
                start: start.boxed(),
                limit: limit.boxed(),
                step,
                body,
            },
            token.line,
        ))
    }

    fn parse_unsupported(&mut self, token: Token) -> Result<Expr, CompileError> {
        Err(CompileError::new(
            self.file.clone(),
            token.line,
            CompileErrorKind::UnsupportedExpression(format!("{token} statement")),
        ))
    }

    fn fill(&mut self, count: usize) -> Result<(), CompileError> {
        while self.buffer.len() < count {
            let token = self.lexer.next_token()?;
            self.buffer.push_back(token);
        }
        Ok(())
    }

    fn peek(&mut self, distance: usize) -> Result<&Token, CompileError> {
        self.fill(distance + 1)?;
        self.buffer
            .get(distance)
            .ok_or_else(|| CompileError::new(self.file.clone(), 0, CompileErrorKind::UnexpectedEof))
    }

    fn peek_kind(&mut self, distance: usize) -> Result<TokenKind, CompileError> {
        self.peek(distance).map(|token| token.kind)
    }

    fn take(&mut self) -> Result<Token, CompileError> {
        self.fill(1)?;
        let token = self
            .buffer
            .pop_front()
            .ok_or_else(|| CompileError::new(self.file.clone(), 0, CompileErrorKind::UnexpectedEof))?;
        // Eof repeats forever.
        if token.kind == TokenKind::Eof {
            self.buffer.push_front(token.clone());
        }
        Ok(token)
    }

    fn match_and_take(&mut self, kind: TokenKind) -> Result<bool, CompileError> {
        if self.peek_kind(0)? == kind {
            self.take()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        let token = self.take()?;
        if token.kind != kind {
            return Err(self.expected_error(kind.describe(), &token));
        }
        Ok(token)
    }

    fn expected_error(&self, expected: &str, found: &Token) -> CompileError {
        CompileError::new(
            self.file.clone(),
            found.line,
            CompileErrorKind::ExpectedButFound {
                expected: expected.to_string(),
                found: found.to_string(),
            },
        )
    }

    fn expected_one_of_error(&self, first: TokenKind, second: TokenKind, found: &Token) -> CompileError {
        CompileError::new(
            self.file.clone(),
            found.line,
            CompileErrorKind::ExpectedOneOfButFound {
                first: first.describe().to_string(),
                second: second.describe().to_string(),
                found: found.to_string(),
            },
        )
    }
}
