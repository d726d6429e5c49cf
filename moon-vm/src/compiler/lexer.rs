use std::fmt;
use std::rc::Rc;

use super::{CompileError, CompileErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Identifier,
    Number,
    String,
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    If,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
    Ellipsis,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    NotEqual,
    DotDot,
    DoubleColon,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,
    Less,
    Greater,
    Hash,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Assign,
    Colon,
    Comma,
    Semicolon,
    Dot,
    Eof,
}

impl TokenKind {
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::And => "'and'",
            TokenKind::Break => "'break'",
            TokenKind::Do => "'do'",
            TokenKind::Else => "'else'",
            TokenKind::ElseIf => "'elseif'",
            TokenKind::End => "'end'",
            TokenKind::False => "'false'",
            TokenKind::For => "'for'",
            TokenKind::Function => "'function'",
            TokenKind::If => "'if'",
            TokenKind::Local => "'local'",
            TokenKind::Nil => "'nil'",
            TokenKind::Not => "'not'",
            TokenKind::Or => "'or'",
            TokenKind::Repeat => "'repeat'",
            TokenKind::Return => "'return'",
            TokenKind::Then => "'then'",
            TokenKind::True => "'true'",
            TokenKind::Until => "'until'",
            TokenKind::While => "'while'",
            TokenKind::Ellipsis => "'...'",
            TokenKind::LessEqual => "'<='",
            TokenKind::GreaterEqual => "'>='",
            TokenKind::EqualEqual => "'=='",
            TokenKind::NotEqual => "'~='",
            TokenKind::DotDot => "'..'",
            TokenKind::DoubleColon => "'::'",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Caret => "'^'",
            TokenKind::Percent => "'%'",
            TokenKind::Less => "'<'",
            TokenKind::Greater => "'>'",
            TokenKind::Hash => "'#'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::Assign => "'='",
            TokenKind::Colon => "':'",
            TokenKind::Comma => "','",
            TokenKind::Semicolon => "';'",
            TokenKind::Dot => "'.'",
            TokenKind::Eof => "end of file",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw text; for strings, the contents with escapes decoded.
    pub text: String,
    pub line: u32,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Identifier | TokenKind::Number => write!(f, "'{}'", self.text),
            TokenKind::String => write!(f, "\"{}\"", self.text),
            kind => f.write_str(kind.describe()),
        }
    }
}

/// Longest first.
const OPERATORS: &[(&str, TokenKind)] = &[
    ("...", TokenKind::Ellipsis),
    ("<=", TokenKind::LessEqual),
    (">=", TokenKind::GreaterEqual),
    ("==", TokenKind::EqualEqual),
    ("~=", TokenKind::NotEqual),
    ("..", TokenKind::DotDot),
    ("::", TokenKind::DoubleColon),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("^", TokenKind::Caret),
    ("%", TokenKind::Percent),
    ("<", TokenKind::Less),
    (">", TokenKind::Greater),
    ("#", TokenKind::Hash),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    ("{", TokenKind::LBrace),
    ("}", TokenKind::RBrace),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("=", TokenKind::Assign),
    (":", TokenKind::Colon),
    (",", TokenKind::Comma),
    (";", TokenKind::Semicolon),
    (".", TokenKind::Dot),
];

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "and" => TokenKind::And,
        "break" => TokenKind::Break,
        "do" => TokenKind::Do,
        "else" => TokenKind::Else,
        "elseif" => TokenKind::ElseIf,
        "end" => TokenKind::End,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "function" => TokenKind::Function,
        "if" => TokenKind::If,
        "local" => TokenKind::Local,
        "nil" => TokenKind::Nil,
        "not" => TokenKind::Not,
        "or" => TokenKind::Or,
        "repeat" => TokenKind::Repeat,
        "return" => TokenKind::Return,
        "then" => TokenKind::Then,
        "true" => TokenKind::True,
        "until" => TokenKind::Until,
        "while" => TokenKind::While,
        _ => return None,
    };
    Some(kind)
}

/// Value of a number token's text, decimal or `0x` hexadecimal.
pub fn number_value(text: &str) -> Option<f64> {
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|value| value as f64);
    }
    text.parse::<f64>().ok()
}

/// Produces one token per call; buffering is the parser's job.
pub struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    line: u32,
    file: Rc<str>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: Rc<str>) -> Self {
        Self {
            source,
            pos: 0,
            line: 1,
            file,
        }
    }

    pub fn next_token(&mut self) -> Result<Token, CompileError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let Some(ch) = self.current() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line,
            });
        };

        if ch.is_ascii_digit() || (ch == '.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            return self.consume_number();
        }
        if ch == '"' || ch == '\'' {
            return self.consume_string(ch);
        }
        if is_ident_start(ch) {
            let text = self.consume_ident();
            let kind = keyword(&text).unwrap_or(TokenKind::Identifier);
            return Ok(Token { kind, text, line });
        }

        let rest = self.rest();
        for (op, kind) in OPERATORS {
            if rest.starts_with(op) {
                self.pos += op.len();
                return Ok(Token {
                    kind: *kind,
                    text: (*op).to_string(),
                    line,
                });
            }
        }
        Err(self.error(CompileErrorKind::UnexpectedCharacter(ch)))
    }

    fn rest(&self) -> &'a str {
        self.source.get(self.pos..).unwrap_or("")
    }

    fn current(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.file.clone(), self.line, kind)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.rest().starts_with("--") => {
                    self.pos += 2;
                    if self.rest().starts_with("[[") {
                        self.pos += 2;
                        self.skip_block_comment()?;
                    } else {
                        while let Some(ch) = self.current() {
                            if ch == '\n' {
                                break;
                            }
                            self.advance();
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), CompileError> {
        loop {
            if self.rest().starts_with("]]") {
                self.pos += 2;
                return Ok(());
            }
            if self.advance().is_none() {
                return Err(self.error(CompileErrorKind::UnterminatedComment));
            }
        }
    }

    fn consume_number(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        let start = self.pos;
        let rest = self.rest();
        if rest.starts_with("0x") || rest.starts_with("0X") {
            self.pos += 2;
            while self.current().is_some_and(|ch| ch.is_ascii_hexdigit()) {
                self.advance();
            }
        } else {
            while self.current().is_some_and(|ch| ch.is_ascii_digit()) {
                self.advance();
            }
            if self.current() == Some('.') && self.peek_at(1) != Some('.') {
                self.advance();
                while self.current().is_some_and(|ch| ch.is_ascii_digit()) {
                    self.advance();
                }
            }
            if matches!(self.current(), Some('e' | 'E')) {
                self.advance();
                if matches!(self.current(), Some('+' | '-')) {
                    self.advance();
                }
                while self.current().is_some_and(|ch| ch.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        // `12abc` is one malformed token, not a number followed by a name.
        while self.current().is_some_and(is_ident_continue) {
            self.advance();
        }

        let text = self.source[start..self.pos].to_string();
        if number_value(&text).is_none() {
            return Err(self.error(CompileErrorKind::InvalidNumber(text)));
        }
        Ok(Token {
            kind: TokenKind::Number,
            text,
            line,
        })
    }

    fn consume_string(&mut self, quote: char) -> Result<Token, CompileError> {
        let line = self.line;
        self.advance();
        let mut text = String::new();
        loop {
            let Some(ch) = self.advance() else {
                return Err(self.error(CompileErrorKind::UnterminatedString));
            };
            match ch {
                '\n' => return Err(self.error(CompileErrorKind::UnterminatedString)),
                '\\' => {
                    let Some(escaped) = self.advance() else {
                        return Err(self.error(CompileErrorKind::UnterminatedString));
                    };
                    let decoded = match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        '\\' => '\\',
                        '"' => '"',
                        '\'' => '\'',
                        '0' => '\0',
                        'b' => '\u{8}',
                        'f' => '\u{c}',
                        other => return Err(self.error(CompileErrorKind::InvalidEscape(other))),
                    };
                    text.push(decoded);
                }
                ch if ch == quote => break,
                ch => text.push(ch),
            }
        }
        Ok(Token {
            kind: TokenKind::String,
            text,
            line,
        })
    }

    fn consume_ident(&mut self) -> String {
        let start = self.pos;
        while self.current().is_some_and(is_ident_continue) {
            self.advance();
        }
        self.source[start..self.pos].to_string()
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphabetic()
}

fn is_ident_continue(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, Rc::from("test"));
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().expect("token");
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push(token.kind);
        }
    }

    #[test]
    fn operators_use_longest_match() {
        assert_eq!(
            kinds("a ... b .. c . d <= >= == ~= = ::"),
            vec![
                TokenKind::Identifier,
                TokenKind::Ellipsis,
                TokenKind::Identifier,
                TokenKind::DotDot,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::Assign,
                TokenKind::DoubleColon,
            ]
        );
    }

    #[test]
    fn keywords_and_comments() {
        assert_eq!(
            kinds("local x -- trailing\n--[[ block\ncomment ]] return x"),
            vec![
                TokenKind::Local,
                TokenKind::Identifier,
                TokenKind::Return,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn numbers_and_lines() {
        let mut lexer = Lexer::new("1.5\n0x1F\n2e3 .5", Rc::from("test"));
        let first = lexer.next_token().expect("first");
        assert_eq!((first.text.as_str(), first.line), ("1.5", 1));
        let hex = lexer.next_token().expect("hex");
        assert_eq!(number_value(&hex.text), Some(31.0));
        assert_eq!(hex.line, 2);
        let exp = lexer.next_token().expect("exp");
        assert_eq!(number_value(&exp.text), Some(2000.0));
        let fraction = lexer.next_token().expect("fraction");
        assert_eq!(number_value(&fraction.text), Some(0.5));
    }

    #[test]
    fn number_before_concat_stops_at_dots() {
        assert_eq!(
            kinds("1..x"),
            vec![TokenKind::Number, TokenKind::DotDot, TokenKind::Identifier]
        );
    }

    #[test]
    fn string_escapes_are_decoded() {
        let mut lexer = Lexer::new(r#"'a\tb\n' "q\"""#, Rc::from("test"));
        assert_eq!(lexer.next_token().expect("single").text, "a\tb\n");
        assert_eq!(lexer.next_token().expect("double").text, "q\"");
    }

    #[test]
    fn malformed_input_reports_line() {
        let mut lexer = Lexer::new("\n\"open", Rc::from("bad.moon"));
        let err = lexer.next_token().expect_err("unterminated");
        assert_eq!(err.kind, CompileErrorKind::UnterminatedString);
        assert_eq!(err.line, 2);

        let mut lexer = Lexer::new("12abc", Rc::from("bad.moon"));
        let err = lexer.next_token().expect_err("bad number");
        assert_eq!(err.kind, CompileErrorKind::InvalidNumber("12abc".to_string()));

        let mut lexer = Lexer::new("@", Rc::from("bad.moon"));
        let err = lexer.next_token().expect_err("bad char");
        assert_eq!(err.kind, CompileErrorKind::UnexpectedCharacter('@'));

        let mut lexer = Lexer::new("--[[ never closed", Rc::from("bad.moon"));
        let err = lexer.next_token().expect_err("bad comment");
        assert_eq!(err.kind, CompileErrorKind::UnterminatedComment);
    }
}
