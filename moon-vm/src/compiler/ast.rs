use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Concat => "..",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "~=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    /// Evaluates literal arithmetic; only these operators fold.
    fn fold_numbers(self, left: f64, right: f64) -> Option<f64> {
        let value = match self {
            BinaryOp::Add => left + right,
            BinaryOp::Sub => left - right,
            BinaryOp::Mul => left * right,
            BinaryOp::Div => left / right,
            BinaryOp::Mod => left % right,
            BinaryOp::Pow => left.powf(right),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalName {
    pub name: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    /// Declared name, used for binding and debug info. `None` for literals.
    pub name: Option<String>,
    pub params: Vec<String>,
    /// Name bound to the array of trailing arguments (`...rest`).
    pub rest: Option<String>,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableEntry {
    Keyed { key: Expr, value: Expr },
    Positional(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub value: Expr,
    pub splat: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: Expr,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Identifier(String),
    Number(f64),
    String(String),
    Nil,
    Bool(bool),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Prefix {
        op: PrefixOp,
        operand: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// Statements sharing the enclosing lexical scope.
    Block(Vec<Expr>),
    /// `do ... end`: statements in a scope of their own.
    Scope(Vec<Expr>),
    Local {
        names: Vec<LocalName>,
        values: Vec<Expr>,
    },
    Function {
        local: bool,
        function: FunctionBody,
    },
    If {
        branches: Vec<Branch>,
        otherwise: Option<Vec<Expr>>,
    },
    While {
        condition: Box<Expr>,
        body: Vec<Expr>,
    },
    RepeatUntil {
        body: Vec<Expr>,
        condition: Box<Expr>,
    },
    NumericFor {
        variable: String,
        start: Box<Expr>,
        limit: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Vec<Expr>,
    },
    Break,
    Return(Option<Box<Expr>>),
    Table(Vec<TableEntry>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        target: Box<Expr>,
        name: String,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<CallArg>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

impl Expr {
    pub fn new(kind: ExprKind, line: u32) -> Self {
        Self { kind, line }
    }

    pub fn boxed(self) -> Box<Expr> {
        Box::new(self)
    }

    pub fn is_storable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Identifier(_) | ExprKind::Index { .. } | ExprKind::Field { .. }
        )
    }

    /// Simplifies children first, then this node. Folding a folded tree is a no-op.
    pub fn fold(self) -> Expr {
        let line = self.line;
        let kind = match self.kind {
            ExprKind::Binary { op, left, right } => {
                let left = left.fold();
                let right = right.fold();
                if let (ExprKind::Number(a), ExprKind::Number(b)) = (&left.kind, &right.kind)
                    && let Some(value) = op.fold_numbers(*a, *b)
                {
                    ExprKind::Number(value)
                } else {
                    ExprKind::Binary {
                        op,
                        left: left.boxed(),
                        right: right.boxed(),
                    }
                }
            }
            ExprKind::Prefix { op, operand } => {
                let operand = operand.fold();
                match (op, &operand.kind) {
                    (PrefixOp::Neg, ExprKind::Number(value)) => ExprKind::Number(-value),
                    _ => ExprKind::Prefix {
                        op,
                        operand: operand.boxed(),
                    },
                }
            }
            ExprKind::Assign { target, value } => ExprKind::Assign {
                target: target.fold().boxed(),
                value: value.fold().boxed(),
            },
            ExprKind::Block(body) => ExprKind::Block(fold_all(body)),
            ExprKind::Scope(body) => ExprKind::Scope(fold_all(body)),
            ExprKind::Local { names, values } => ExprKind::Local {
                names,
                values: fold_all(values),
            },
            ExprKind::Function { local, function } => ExprKind::Function {
                local,
                function: FunctionBody {
                    body: fold_all(function.body),
                    ..function
                },
            },
            ExprKind::If {
                branches,
                otherwise,
            } => ExprKind::If {
                branches: branches
                    .into_iter()
                    .map(|branch| Branch {
                        condition: branch.condition.fold(),
                        body: fold_all(branch.body),
                    })
                    .collect(),
                otherwise: otherwise.map(fold_all),
            },
            ExprKind::While { condition, body } => ExprKind::While {
                condition: condition.fold().boxed(),
                body: fold_all(body),
            },
            ExprKind::RepeatUntil { body, condition } => ExprKind::RepeatUntil {
                body: fold_all(body),
                condition: condition.fold().boxed(),
            },
            ExprKind::NumericFor {
                variable,
                start,
                limit,
                step,
                body,
            } => ExprKind::NumericFor {
                variable,
                start: start.fold().boxed(),
                limit: limit.fold().boxed(),
                step: step.map(|step| step.fold().boxed()),
                body: fold_all(body),
            },
            ExprKind::Return(value) => ExprKind::Return(value.map(|value| value.fold().boxed())),
            ExprKind::Table(entries) => ExprKind::Table(
                entries
                    .into_iter()
                    .map(|entry| match entry {
                        TableEntry::Keyed { key, value } => TableEntry::Keyed {
                            key: key.fold(),
                            value: value.fold(),
                        },
                        TableEntry::Positional(value) => TableEntry::Positional(value.fold()),
                    })
                    .collect(),
            ),
            ExprKind::Index { target, index } => ExprKind::Index {
                target: target.fold().boxed(),
                index: index.fold().boxed(),
            },
            ExprKind::Field { target, name } => ExprKind::Field {
                target: target.fold().boxed(),
                name,
            },
            ExprKind::Call { callee, args } => ExprKind::Call {
                callee: callee.fold().boxed(),
                args: args
                    .into_iter()
                    .map(|arg| CallArg {
                        value: arg.value.fold(),
                        splat: arg.splat,
                    })
                    .collect(),
            },
            leaf => leaf,
        };
        Expr::new(kind, line)
    }

    /// Indented tree dump, one node per line.
    pub fn print(&self, out: &mut String, indent: usize) {
        let pad = " ".repeat(indent);
        let _ = match &self.kind {
            ExprKind::Identifier(name) => writeln!(out, "{pad}identifier: {name}"),
            ExprKind::Number(value) => writeln!(out, "{pad}number: {value}"),
            ExprKind::String(value) => writeln!(out, "{pad}string: {value:?}"),
            ExprKind::Nil => writeln!(out, "{pad}nil"),
            ExprKind::Bool(value) => writeln!(out, "{pad}{value}"),
            ExprKind::Binary { op, left, right } => {
                let _ = writeln!(out, "{pad}operator {}", op.symbol());
                left.print(out, indent + 2);
                right.print(out, indent + 2);
                Ok(())
            }
            ExprKind::Prefix { op, operand } => {
                let symbol = match op {
                    PrefixOp::Neg => "-",
                    PrefixOp::Not => "not",
                };
                let _ = writeln!(out, "{pad}prefix {symbol}");
                operand.print(out, indent + 2);
                Ok(())
            }
            ExprKind::Assign { target, value } => {
                let _ = writeln!(out, "{pad}assign");
                target.print(out, indent + 2);
                value.print(out, indent + 2);
                Ok(())
            }
            ExprKind::Block(body) => {
                print_all(body, out, indent);
                Ok(())
            }
            ExprKind::Scope(body) => {
                let _ = writeln!(out, "{pad}do");
                print_all(body, out, indent + 2);
                Ok(())
            }
            ExprKind::Local { names, values } => {
                let _ = writeln!(out, "{pad}local");
                for (index, local) in names.iter().enumerate() {
                    let attribute = if local.read_only { " <const>" } else { "" };
                    let _ = writeln!(out, "{pad}-{}{attribute}", local.name);
                    if let Some(value) = values.get(index) {
                        value.print(out, indent + 2);
                    }
                }
                Ok(())
            }
            ExprKind::Function { local, function } => {
                let prefix = if *local { "local function" } else { "function" };
                let name = function.name.as_deref().unwrap_or("<anonymous>");
                let _ = writeln!(out, "{pad}{prefix} {name}");
                let _ = writeln!(out, "{pad}-arguments: {}", function.params.join(", "));
                if let Some(rest) = &function.rest {
                    let _ = writeln!(out, "{pad}-rest: {rest}");
                }
                print_all(&function.body, out, indent + 2);
                Ok(())
            }
            ExprKind::If {
                branches,
                otherwise,
            } => {
                for (index, branch) in branches.iter().enumerate() {
                    let keyword = if index == 0 { "if" } else { "elseif" };
                    let _ = writeln!(out, "{pad}{keyword}");
                    branch.condition.print(out, indent + 2);
                    let _ = writeln!(out, "{pad}then");
                    print_all(&branch.body, out, indent + 2);
                }
                if let Some(body) = otherwise {
                    let _ = writeln!(out, "{pad}else");
                    print_all(body, out, indent + 2);
                }
                Ok(())
            }
            ExprKind::While { condition, body } => {
                let _ = writeln!(out, "{pad}while");
                condition.print(out, indent + 2);
                let _ = writeln!(out, "{pad}do");
                print_all(body, out, indent + 2);
                Ok(())
            }
            ExprKind::RepeatUntil { body, condition } => {
                let _ = writeln!(out, "{pad}repeat");
                print_all(body, out, indent + 2);
                let _ = writeln!(out, "{pad}until");
                condition.print(out, indent + 2);
                Ok(())
            }
            ExprKind::NumericFor {
                variable,
                start,
                limit,
                step,
                body,
            } => {
                let _ = writeln!(out, "{pad}for {variable}");
                start.print(out, indent + 2);
                limit.print(out, indent + 2);
                if let Some(step) = step {
                    step.print(out, indent + 2);
                }
                let _ = writeln!(out, "{pad}do");
                print_all(body, out, indent + 2);
                Ok(())
            }
            ExprKind::Break => writeln!(out, "{pad}break"),
            ExprKind::Return(value) => {
                let _ = writeln!(out, "{pad}return");
                if let Some(value) = value {
                    value.print(out, indent + 2);
                }
                Ok(())
            }
            ExprKind::Table(entries) => {
                let _ = writeln!(out, "{pad}table");
                for entry in entries {
                    match entry {
                        TableEntry::Keyed { key, value } => {
                            let _ = writeln!(out, "{pad}-key");
                            key.print(out, indent + 2);
                            let _ = writeln!(out, "{pad}-value");
                            value.print(out, indent + 2);
                        }
                        TableEntry::Positional(value) => value.print(out, indent + 2),
                    }
                }
                Ok(())
            }
            ExprKind::Index { target, index } => {
                let _ = writeln!(out, "{pad}index");
                target.print(out, indent + 2);
                index.print(out, indent + 2);
                Ok(())
            }
            ExprKind::Field { target, name } => {
                let _ = writeln!(out, "{pad}field .{name}");
                target.print(out, indent + 2);
                Ok(())
            }
            ExprKind::Call { callee, args } => {
                let _ = writeln!(out, "{pad}call");
                callee.print(out, indent + 2);
                for arg in args {
                    if arg.splat {
                        let _ = writeln!(out, "{pad}-splat");
                    }
                    arg.value.print(out, indent + 2);
                }
                Ok(())
            }
        };
    }
}

fn fold_all(body: Vec<Expr>) -> Vec<Expr> {
    body.into_iter().map(Expr::fold).collect()
}

fn print_all(body: &[Expr], out: &mut String, indent: usize) {
    for statement in body {
        statement.print(out, indent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(value: f64) -> Expr {
        Expr::new(ExprKind::Number(value), 1)
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary {
                op,
                left: left.boxed(),
                right: right.boxed(),
            },
            1,
        )
    }

    #[test]
    fn nested_arithmetic_folds_to_one_literal() {
        let tree = binary(
            BinaryOp::Add,
            number(1.0),
            binary(BinaryOp::Mul, number(2.0), number(3.0)),
        );
        let folded = tree.fold();
        assert_eq!(folded.kind, ExprKind::Number(7.0));
        assert_eq!(folded.clone().fold(), folded);
    }

    #[test]
    fn negated_literal_folds_but_comparisons_do_not() {
        let negated = Expr::new(
            ExprKind::Prefix {
                op: PrefixOp::Neg,
                operand: number(4.0).boxed(),
            },
            1,
        );
        assert_eq!(negated.fold().kind, ExprKind::Number(-4.0));

        let comparison = binary(BinaryOp::Lt, number(1.0), number(2.0));
        assert_eq!(comparison.clone().fold(), comparison);
    }

    #[test]
    fn folding_stops_at_non_literals() {
        let tree = binary(
            BinaryOp::Add,
            Expr::new(ExprKind::Identifier("x".to_string()), 1),
            binary(BinaryOp::Sub, number(5.0), number(2.0)),
        );
        let folded = tree.fold();
        let ExprKind::Binary { right, .. } = &folded.kind else {
            panic!("expected binary, got {folded:?}");
        };
        assert_eq!(right.kind, ExprKind::Number(3.0));
        assert_eq!(folded.clone().fold(), folded);
    }

    #[test]
    fn print_renders_indented_tree() {
        let tree = binary(
            BinaryOp::Add,
            Expr::new(ExprKind::Identifier("x".to_string()), 1),
            number(2.0),
        );
        let mut out = String::new();
        tree.print(&mut out, 0);
        assert_eq!(out, "operator +\n  identifier: x\n  number: 2\n");
    }
}
