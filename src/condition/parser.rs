//! Tokenizer and recursive-descent parser for routing predicates.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := postfix (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") postfix)?
//! postfix := primary ("." ident ["(" args ")"] | "[" or "]")*
//! primary := string | number | true | false | null | ident | "(" or ")" | "[" args "]"
//! ```

use super::VARIABLES;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eof,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(other) => value.push(*other),
                                None => return Err("unterminated string literal".to_string()),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && starts_number(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let f = text
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number '{}'", text))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n = text
                        .parse::<i64>()
                        .map_err(|_| format!("invalid number '{}'", text))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    other => return Err(format!("unexpected character '{}'", other)),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

/// A `-` starts a number only where an operand is expected.
fn starts_number(chars: &[char], i: usize) -> bool {
    let next_is_digit = chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
    let prev = chars[..i].iter().rev().find(|c| !c.is_whitespace());
    let operand_expected = match prev {
        None => true,
        Some(p) => matches!(p, '(' | '[' | ',' | '=' | '<' | '>' | '!' | '&' | '|'),
    };
    next_is_digit && operand_expected
}

/// Deepest expression nesting accepted, counting parentheses, unary
/// operators and chained binary operators.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        let token = self.next();
        if token == expected {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", expected, token))
        }
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(format!("expression nested too deeply (limit {})", MAX_DEPTH))
        } else {
            Ok(())
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let depth = self.depth;
        self.enter()?;
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Op("||")) || self.is_keyword("or") {
            self.next();
            self.enter()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Token::Op("&&")) || self.is_keyword("and") {
            self.next();
            self.enter()?;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Token::Op("!")) || self.is_keyword("not") {
            self.next();
            let depth = self.depth;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth = depth;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, String> {
        let left = self.parse_postfix()?;
        let op = match self.peek() {
            Token::Op("==") => CompareOp::Eq,
            Token::Op("!=") => CompareOp::Ne,
            Token::Op("<") => CompareOp::Lt,
            Token::Op("<=") => CompareOp::Le,
            Token::Op(">") => CompareOp::Gt,
            Token::Op(">=") => CompareOp::Ge,
            Token::Ident(s) if s == "in" => CompareOp::In,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_postfix()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let depth = self.depth;
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.next();
                    self.enter()?;
                    let name = match self.next() {
                        Token::Ident(name) => name,
                        other => return Err(format!("expected a name after '.', found {:?}", other)),
                    };
                    if matches!(self.peek(), Token::LParen) {
                        self.next();
                        let args = self.parse_args(Token::RParen)?;
                        expr = Expr::Call(Box::new(expr), name, args);
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                Token::LBracket => {
                    self.next();
                    self.enter()?;
                    let key = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                _ => {
                    self.depth = depth;
                    return Ok(expr);
                }
            }
        }
    }

    fn parse_args(&mut self, close: Token) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if *self.peek() == close {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.next() {
                Token::Comma => continue,
                t if t == close => return Ok(args),
                other => return Err(format!("expected ',' or {:?}, found {:?}", close, other)),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Token::Int(n) => Ok(Expr::Literal(Literal::Int(n))),
            Token::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::List(self.parse_args(Token::RBracket)?)),
            Token::Ident(name) => match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Expr::Literal(Literal::Bool(true))),
                "false" => Ok(Expr::Literal(Literal::Bool(false))),
                "null" | "nil" => Ok(Expr::Literal(Literal::Null)),
                _ if VARIABLES.contains(&name.as_str()) => Ok(Expr::Var(name)),
                _ => Err(format!(
                    "unknown variable '{}' (available: {})",
                    name,
                    VARIABLES.join(", ")
                )),
            },
            Token::Eof => Err("unexpected end of expression".to_string()),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

/// Parse an expression into an AST, checking variables against the schema.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(format!("unexpected trailing token {:?}", other)),
    }
}
