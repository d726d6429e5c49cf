use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assembler::AssemblerError;
use crate::program::Program;

pub mod ast;
mod codegen;
mod context;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod scope;

pub use ast::Expr;
pub use parser::Parser;

/// A compilation failure. Compilation stops at the first one; no partial
/// program is produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{file}({line}): {kind}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub kind: CompileErrorKind,
}

impl CompileError {
    pub fn new(file: impl AsRef<str>, line: u32, kind: CompileErrorKind) -> Self {
        Self {
            file: file.as_ref().to_string(),
            line,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unterminated string")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("malformed number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("expected {expected} but found {found}")]
    ExpectedButFound { expected: String, found: String },
    #[error("expected {first} or {second} but found {found}")]
    ExpectedOneOfButFound {
        first: String,
        second: String,
        found: String,
    },
    #[error("undefined identifier '{0}'")]
    UndefinedIdentifier(String),
    #[error("identifier '{0}' is already defined in this scope")]
    IdentifierAlreadyDefined(String),
    #[error("can't modify read-only variable '{0}'")]
    CantModifyReadOnly(String),
    #[error("unresolved jump: {0}")]
    UnresolvedJump(String),
    #[error("left side of assignment must be storable")]
    LeftSideMustBeStorable,
    #[error("function is never used")]
    FunctionNeverUsed,
    #[error("too many arguments: {0}")]
    TooManyArguments(usize),
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),
    #[error("table constructor mixes keyed and positional entries")]
    MixedTableConstructor,
    #[error("stack delta mismatch: expected {expected}, got {actual}")]
    StackMismatch { expected: i32, actual: i32 },
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
}

/// Compiler switches. Every field has a default, so a partial JSON document
/// is a valid configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    pub generate_debug_info: bool,
    /// Store root-level `local` and `local function` declarations in the
    /// global table instead of the top-level frame.
    pub root_declarations_global: bool,
    /// Resolve undefined names through the global table instead of failing.
    pub use_implicit_globals: bool,
    pub file_name: String,
    /// Names the host installs as globals before running the program.
    pub globals: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            generate_debug_info: true,
            root_declarations_global: false,
            use_implicit_globals: false,
            file_name: "<source>".to_string(),
            globals: Vec::new(),
        }
    }
}

impl CompilerOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_globals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.globals.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Parses a chunk without folding it.
pub fn parse_source(source: &str, options: &CompilerOptions) -> Result<Expr, CompileError> {
    let file: Rc<str> = Rc::from(options.file_name.as_str());
    let mut parser = Parser::new(source, file);
    parser.parse_program()
}

/// Indented dump of the folded tree.
pub fn dump_ast(source: &str, options: &CompilerOptions) -> Result<String, CompileError> {
    let tree = parse_source(source, options)?.fold();
    let mut out = String::new();
    tree.print(&mut out, 0);
    Ok(out)
}

pub fn compile_source(source: &str, options: &CompilerOptions) -> Result<Program, CompileError> {
    let tree = parse_source(source, options)?;
    let tree = tree.fold();
    debug!(file = %options.file_name, "parsed and folded source");
    let program = codegen::generate(&tree, options)?;
    debug!(
        code_len = program.code.len(),
        numbers = program.numbers.len(),
        strings = program.strings.len(),
        "compiled program"
    );
    Ok(program)
}
