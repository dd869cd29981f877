//! Recursive-descent parser for cell expressions.
//!
//! ```text
//! expression := [ident "="] pipe
//! pipe       := additive ("|" call)*
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/") unary)*
//! unary      := "-" unary | primary
//! primary    := number | string | "true" | "false" | "null"
//!             | ident | ident "(" [arg ("," arg)*] ")" | "(" pipe ")"
//! arg        := [ident "="] pipe
//! ```

use super::{Argument, Call, Expr, Expression, PIPE_ARGUMENT};
use crate::document::NodeId;
use crate::error::{Error, Result};
use crate::value::Value;

/// Deepest call tree an expression may produce, and the deepest syntactic
/// nesting the parser will descend into.
pub const MAX_DEPTH: usize = 100;

/// Parse expression text for the cell `id`.
///
/// Blank text yields `Ok(None)`: the cell simply contributes nothing.
pub fn parse(id: &NodeId, text: &str) -> Result<Option<Expression>> {
    let tokens = tokenize(text)?;
    if matches!(tokens.first(), Some(token) if token.kind == TokenKind::End) {
        return Ok(None);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let target = parser.target();
    let root = parser.pipe()?;
    parser.expect_end()?;

    Ok(Some(Expression::new(id.clone(), target, root.expr)))
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Integer(i64),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Equals,
    Pipe,
    Plus,
    Minus,
    Star,
    Slash,
    End,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{}'", name),
            TokenKind::Integer(i) => format!("number {}", i),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Equals => "'='".to_string(),
            TokenKind::Pipe => "'|'".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::End => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

fn parse_error(line: usize, column: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        line,
        column,
        message: message.into(),
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let (mut line, mut column) = (1, 1);

    while let Some(&c) = chars.peek() {
        let (start_line, start_column) = (line, column);
        let mut advance = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
            let c = chars.next();
            if c == Some('\n') {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
            c
        };

        let kind = match c {
            c if c.is_whitespace() => {
                advance(&mut chars);
                continue;
            }
            '(' | ')' | ',' | '=' | '|' | '+' | '-' | '*' | '/' => {
                advance(&mut chars);
                match c {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    ',' => TokenKind::Comma,
                    '=' => TokenKind::Equals,
                    '|' => TokenKind::Pipe,
                    '+' => TokenKind::Plus,
                    '-' => TokenKind::Minus,
                    '*' => TokenKind::Star,
                    _ => TokenKind::Slash,
                }
            }
            '"' | '\'' => {
                let quote = c;
                advance(&mut chars);
                let mut literal = String::new();
                loop {
                    match advance(&mut chars) {
                        None => {
                            return Err(parse_error(
                                start_line,
                                start_column,
                                "unterminated string",
                            ));
                        }
                        Some('\\') => match advance(&mut chars) {
                            Some('n') => literal.push('\n'),
                            Some('t') => literal.push('\t'),
                            Some(escaped) => literal.push(escaped),
                            None => {
                                return Err(parse_error(
                                    start_line,
                                    start_column,
                                    "unterminated string",
                                ));
                            }
                        },
                        Some(c) if c == quote => break,
                        Some(c) => literal.push(c),
                    }
                }
                TokenKind::Str(literal)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    let exponent_sign = (c == '-' || c == '+')
                        && literal.ends_with(['e', 'E']);
                    if c.is_ascii_digit() || exponent_sign {
                        literal.push(c);
                    } else if c == '.' || c == 'e' || c == 'E' {
                        is_float = true;
                        literal.push(c);
                    } else {
                        break;
                    }
                    advance(&mut chars);
                }
                let integer = if is_float { None } else { literal.parse::<i64>().ok() };
                match integer {
                    Some(i) => TokenKind::Integer(i),
                    None => TokenKind::Number(literal.parse::<f64>().map_err(|_| {
                        parse_error(
                            start_line,
                            start_column,
                            format!("invalid number '{}'", literal),
                        )
                    })?),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        advance(&mut chars);
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(name)
            }
            other => {
                return Err(parse_error(
                    start_line,
                    start_column,
                    format!("unexpected character '{}'", other),
                ));
            }
        };

        tokens.push(Token {
            kind,
            line: start_line,
            column: start_column,
        });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        line,
        column,
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Descend one syntactic nesting level (parentheses, call arguments,
    /// unary minus).
    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        self.check(self.depth).map(|_| ())
    }

    /// Fail at the current token if `height` exceeds [`MAX_DEPTH`].
    fn check(&self, height: usize) -> Result<usize> {
        if height > MAX_DEPTH {
            let token = self.peek();
            return Err(parse_error(
                token.line,
                token.column,
                format!("expression nests deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(height)
    }

    fn peek(&self) -> &Token {
        // The token list always ends with `End`, which is never consumed.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_second(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos + 1).map(|token| &token.kind)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::End {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.peek();
        parse_error(
            token.line,
            token.column,
            format!("expected {}, found {}", expected, token.kind.describe()),
        )
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.peek().kind == TokenKind::End {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    /// `ident =` at the very start names the cell's output.
    fn target(&mut self) -> Option<String> {
        self.named_prefix()
    }

    /// Consume `ident =` if present.
    fn named_prefix(&mut self) -> Option<String> {
        match (&self.peek().kind, self.peek_second()) {
            (TokenKind::Ident(name), Some(TokenKind::Equals)) => {
                let name = name.clone();
                self.pos += 2;
                Some(name)
            }
            _ => None,
        }
    }

    fn pipe(&mut self) -> Result<Tree> {
        self.enter()?;
        let mut lhs = self.additive()?;
        while self.eat(&TokenKind::Pipe) {
            let (mut call, height) = match self.bump() {
                Token {
                    kind: TokenKind::Ident(name),
                    ..
                } if self.peek().kind == TokenKind::LParen => self.call(name)?,
                Token { line, column, .. } => {
                    return Err(parse_error(line, column, "expected a function call after '|'"));
                }
            };
            let height = self.check(height.max(lhs.height + 1))?;
            call.args.insert(0, Argument::named(PIPE_ARGUMENT, lhs.expr));
            lhs = Tree {
                expr: Expr::Call(call),
                height,
            };
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Tree> {
        let mut lhs = self.term()?;
        loop {
            let name = match self.peek().kind {
                TokenKind::Plus => "add",
                TokenKind::Minus => "subtract",
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.term()?;
            lhs = self.binary(name, lhs, rhs)?;
        }
    }

    fn term(&mut self) -> Result<Tree> {
        let mut lhs = self.unary()?;
        loop {
            let name = match self.peek().kind {
                TokenKind::Star => "multiply",
                TokenKind::Slash => "divide",
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = self.binary(name, lhs, rhs)?;
        }
    }

    fn unary(&mut self) -> Result<Tree> {
        if self.eat(&TokenKind::Minus) {
            self.enter()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return match operand.expr {
                Expr::Literal(Value::Integer(i)) => Ok(Tree::leaf(Value::Integer(-i))),
                Expr::Literal(Value::Number(n)) => Ok(Tree::leaf(Value::Number(-n))),
                expr => Ok(Tree {
                    expr: Expr::call("negate", vec![Argument::positional(expr)]),
                    height: self.check(operand.height + 1)?,
                }),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Tree> {
        let token = self.bump();
        match token.kind {
            TokenKind::Integer(i) => Ok(Tree::leaf(Value::Integer(i))),
            TokenKind::Number(n) => Ok(Tree::leaf(Value::Number(n))),
            TokenKind::Str(s) => Ok(Tree::leaf(Value::String(s))),
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Tree::leaf(Value::Boolean(true))),
                "false" => Ok(Tree::leaf(Value::Boolean(false))),
                "null" => Ok(Tree::leaf(Value::Null)),
                _ if self.peek().kind == TokenKind::LParen => {
                    let (call, height) = self.call(name)?;
                    Ok(Tree {
                        expr: Expr::Call(call),
                        height,
                    })
                }
                _ => Ok(Tree {
                    expr: Expr::Variable(name),
                    height: 0,
                }),
            },
            TokenKind::LParen => {
                let inner = self.pipe()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(parse_error(
                token.line,
                token.column,
                format!("expected a value, found {}", other.describe()),
            )),
        }
    }

    /// Parse `( args )` after a function name; returns the call and its
    /// height.
    fn call(&mut self, name: String) -> Result<(Call, usize)> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        let mut deepest = 0;
        if !self.eat(&TokenKind::RParen) {
            loop {
                let arg_name = self.named_prefix();
                let value = self.pipe()?;
                deepest = deepest.max(value.height);
                args.push(Argument {
                    name: arg_name,
                    value: value.expr,
                });
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen, "',' or ')'")?;
                break;
            }
        }
        let height = self.check(deepest + 1)?;
        Ok((Call { name, args }, height))
    }

    /// Desugar an infix operator into a two-argument call.
    fn binary(&self, name: &str, lhs: Tree, rhs: Tree) -> Result<Tree> {
        let height = self.check(lhs.height.max(rhs.height) + 1)?;
        Ok(Tree {
            expr: Expr::call(
                name,
                vec![Argument::positional(lhs.expr), Argument::positional(rhs.expr)],
            ),
            height,
        })
    }
}

/// A parsed subtree with the height of its call tree (leaves are 0).
struct Tree {
    expr: Expr,
    height: usize,
}

impl Tree {
    fn leaf(value: Value) -> Self {
        Self {
            expr: Expr::Literal(value),
            height: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Expression {
        parse(&NodeId::from("c1"), text)
            .expect("parse failed")
            .expect("expression was blank")
    }

    fn var(name: &str) -> Expr {
        Expr::Variable(name.to_string())
    }

    #[test]
    fn test_blank_text_has_no_expression() {
        assert_eq!(parse(&NodeId::from("c1"), "  \n ").unwrap(), None);
    }

    #[test]
    fn test_target_and_call() {
        let expr = parse_ok("y = add(x, 1)");
        assert_eq!(expr.target(), Some("y"));
        assert_eq!(
            expr.root(),
            &Expr::call(
                "add",
                vec![
                    Argument::positional(var("x")),
                    Argument::positional(Expr::Literal(Value::Integer(1))),
                ]
            )
        );
        assert_eq!(expr.inputs(), &["x".to_string()]);
    }

    #[test]
    fn test_operators_desugar_with_precedence() {
        let expr = parse_ok("a + b * 2");
        let Expr::Call(add) = expr.root() else {
            panic!("expected call");
        };
        assert_eq!(add.name, "add");
        assert!(matches!(&add.args[1].value, Expr::Call(mul) if mul.name == "multiply"));
    }

    #[test]
    fn test_pipe_inserts_named_argument() {
        let expr = parse_ok("data | filter(limit = 3)");
        let Expr::Call(call) = expr.root() else {
            panic!("expected call");
        };
        assert_eq!(call.name, "filter");
        assert_eq!(call.args[0], Argument::named(PIPE_ARGUMENT, var("data")));
        assert_eq!(
            call.args[1],
            Argument::named("limit", Expr::Literal(Value::Integer(3)))
        );
    }

    #[test]
    fn test_negative_literals_fold() {
        let expr = parse_ok("-2.5");
        assert_eq!(expr.root(), &Expr::Literal(Value::Number(-2.5)));

        let expr = parse_ok("-x");
        assert!(matches!(expr.root(), Expr::Call(call) if call.name == "negate"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_ok("'hi'").root(), &Expr::Literal(Value::from("hi")));
        assert_eq!(parse_ok("true").root(), &Expr::Literal(Value::Boolean(true)));
        assert_eq!(parse_ok("1e3").root(), &Expr::Literal(Value::Number(1000.0)));
        assert_eq!(parse_ok("null").root(), &Expr::Literal(Value::Null));
    }

    #[test]
    fn test_external_cell_expressions() {
        let expr = parse_ok("call(x, y)");
        assert_eq!(expr.inputs(), &["x".to_string(), "y".to_string()]);

        let expr = parse_ok("z = run()");
        assert_eq!(expr.target(), Some("z"));
        assert!(expr.inputs().is_empty());
    }

    #[test]
    fn test_error_positions() {
        let err = parse(&NodeId::from("c1"), "add(1,\n  )").unwrap_err();
        match err {
            Error::Parse { line, column, .. } => {
                assert_eq!(line, 2);
                assert_eq!(column, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        assert!(parse(&NodeId::from("c1"), "x y").is_err());
        assert!(parse(&NodeId::from("c1"), "add(1").is_err());
        assert!(parse(&NodeId::from("c1"), "\"open").is_err());
        assert!(parse(&NodeId::from("c1"), "x | 3").is_err());
    }

    fn nesting_error(text: &str) -> (usize, usize, String) {
        match parse(&NodeId::from("c1"), text).unwrap_err() {
            Error::Parse {
                line,
                column,
                message,
                ..
            } => (line, column, message),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_deep_parentheses_are_rejected() {
        let text = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        let (line, column, message) = nesting_error(&text);
        assert_eq!(line, 1);
        assert!(column > 1 && column <= 300);
        assert!(message.contains("nests deeper"));
    }

    #[test]
    fn test_long_operator_chain_is_rejected() {
        let text = vec!["1"; 3000].join(" + ");
        let (_, _, message) = nesting_error(&text);
        assert!(message.contains("nests deeper"));

        let text = vec!["x"; 3000].join(" * ");
        assert!(parse(&NodeId::from("c1"), &text).is_err());

        let text = format!("{}x", "-".repeat(500));
        assert!(parse(&NodeId::from("c1"), &text).is_err());

        let text = format!("x{}", " | f()".repeat(500));
        assert!(parse(&NodeId::from("c1"), &text).is_err());
    }

    #[test]
    fn test_chains_over_deep_operands_are_rejected() {
        // Each layer is shallow on its own; together they exceed the limit.
        let chain = " + 1".repeat(60);
        let mut text = "x".to_string();
        for _ in 0..4 {
            text = format!("({text}{chain})");
        }
        let (_, _, message) = nesting_error(&text);
        assert!(message.contains("nests deeper"));
    }

    #[test]
    fn test_nesting_within_limit_parses() {
        let text = vec!["1"; 90].join(" + ");
        assert!(parse(&NodeId::from("c1"), &text).unwrap().is_some());

        let text = format!("{}x{}", "f(".repeat(40), ")".repeat(40));
        assert!(parse(&NodeId::from("c1"), &text).unwrap().is_some());
    }
}
