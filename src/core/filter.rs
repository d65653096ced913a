//! Purpose: Compile and evaluate filter expressions against stored items.
//! Exports: `Filter`.
//! Role: Server-side half of a scan predicate, used by the in-memory store.
//! Invariants: Parse failures and unresolved `#name`/`:value` placeholders are `InvalidExpression`.
//! Invariants: Comparisons against a missing attribute evaluate to false.
//! Notes: Supports `= <> < <= > >=`, BETWEEN, IN, AND/OR/NOT, parentheses, and
//! `attribute_exists`, `attribute_not_exists`, `begins_with`, `contains`.
use crate::core::attr::{AttributeValue, Item};
use crate::core::error::{Error, ErrorKind};
use crate::core::request::Predicate;
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone)]
pub struct Filter {
    expr: String,
    root: Expr,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").field("expr", &self.expr).finish()
    }
}

impl Filter {
    pub fn compile(predicate: &Predicate) -> Result<Self, Error> {
        if predicate.is_empty() {
            return Err(Error::new(ErrorKind::InvalidExpression)
                .with_message("filter expression must not be empty"));
        }
        let tokens = tokenize(&predicate.expression)
            .map_err(|message| compile_error(&predicate.expression, message))?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            predicate,
        };
        let root = parser
            .parse_or()
            .map_err(|message| compile_error(&predicate.expression, message))?;
        if parser.pos < parser.tokens.len() {
            return Err(compile_error(
                &predicate.expression,
                format!("unexpected {}", parser.tokens[parser.pos]),
            ));
        }
        Ok(Self {
            expr: predicate.expression.clone(),
            root,
        })
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.root.eval(item)
    }
}

fn compile_error(expr: &str, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidExpression)
        .with_message(format!("invalid filter expression: {}", message.into()))
        .with_hint(format!(
            "Failed to parse `{expr}`.\nExample: --filter '#status = :active' --name '#status=status' --value ':active=\"on\"'"
        ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Name(String),
    Value(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Op(CmpOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(ident) => write!(f, "`{ident}`"),
            Token::Name(name) => write!(f, "`#{name}`"),
            Token::Value(value) => write!(f, "`:{value}`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Comma => f.write_str("`,`"),
            Token::Dot => f.write_str("`.`"),
            Token::Op(op) => write!(f, "operator {op:?}"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            },
            '#' | ':' => {
                let (word, next) = read_word(&chars, i + 1);
                if word.is_empty() {
                    return Err(format!("placeholder `{c}` needs a name"));
                }
                tokens.push(if c == '#' {
                    Token::Name(word)
                } else {
                    Token::Value(word)
                });
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (word, next) = read_word(&chars, i);
                tokens.push(Token::Ident(word));
                i = next;
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

const KEYWORDS: [&str; 5] = ["AND", "OR", "NOT", "BETWEEN", "IN"];

#[derive(Clone, Debug)]
enum Operand {
    Path(Vec<String>),
    Value(AttributeValue),
}

#[derive(Clone, Debug)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Between(Operand, Operand, Operand),
    In(Operand, Vec<Operand>),
    Exists(Vec<String>),
    NotExists(Vec<String>),
    BeginsWith(Operand, Operand),
    Contains(Operand, Operand),
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    predicate: &'a Predicate,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected}, found {token}")),
            None => Err(format!("expected {expected}, found end of expression")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(expr);
        }

        if let (Some(Token::Ident(name)), Some(Token::LParen)) =
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            return self.parse_function(&name);
        }

        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.parse_operand()?;
            if !self.eat_keyword("AND") {
                return Err("BETWEEN needs `AND`".to_string());
            }
            let high = self.parse_operand()?;
            return Ok(Expr::Between(left, low, high));
        }
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut options = vec![self.parse_operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                options.push(self.parse_operand()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Expr::In(left, options));
        }
        match self.peek() {
            Some(token) => Err(format!("expected a comparison, found {token}")),
            None => Err("expected a comparison, found end of expression".to_string()),
        }
    }

    fn parse_function(&mut self, name: &str) -> Result<Expr, String> {
        let expr = match name {
            "attribute_exists" => Expr::Exists(self.parse_path()?),
            "attribute_not_exists" => Expr::NotExists(self.parse_path()?),
            "begins_with" | "contains" => {
                let target = self.parse_operand()?;
                self.expect(Token::Comma)?;
                let operand = self.parse_operand()?;
                if name == "begins_with" {
                    Expr::BeginsWith(target, operand)
                } else {
                    Expr::Contains(target, operand)
                }
            }
            other => return Err(format!("unknown function `{other}`")),
        };
        self.expect(Token::RParen)?;
        Ok(expr)
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        if let Some(Token::Value(placeholder)) = self.peek() {
            let key = format!(":{placeholder}");
            self.pos += 1;
            return match self.predicate.attribute_values.get(&key) {
                Some(value) => Ok(Operand::Value(value.clone())),
                None => Err(format!("value placeholder `{key}` is not defined")),
            };
        }
        Ok(Operand::Path(self.parse_path()?))
    }

    fn parse_path(&mut self) -> Result<Vec<String>, String> {
        let mut path = vec![self.parse_path_segment()?];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            path.push(self.parse_path_segment()?);
        }
        Ok(path)
    }

    fn parse_path_segment(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Name(placeholder)) => {
                let key = format!("#{placeholder}");
                self.predicate
                    .attribute_names
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| format!("name placeholder `{key}` is not defined"))
            }
            Some(Token::Ident(word)) => {
                if KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw)) {
                    return Err(format!("expected an attribute, found keyword `{word}`"));
                }
                Ok(word)
            }
            Some(token) => Err(format!("expected an attribute, found {token}")),
            None => Err("expected an attribute, found end of expression".to_string()),
        }
    }
}

impl Operand {
    fn resolve<'a>(&'a self, item: &'a Item) -> Option<&'a AttributeValue> {
        match self {
            Operand::Value(value) => Some(value),
            Operand::Path(path) => resolve_path(path, item),
        }
    }
}

fn resolve_path<'a>(path: &[String], item: &'a Item) -> Option<&'a AttributeValue> {
    let (first, rest) = path.split_first()?;
    let mut current = item.get(first)?;
    for segment in rest {
        match current {
            AttributeValue::M(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn values_equal(a: &AttributeValue, b: &AttributeValue) -> bool {
    a.compare(b) == Some(Ordering::Equal) || a == b
}

impl Expr {
    fn eval(&self, item: &Item) -> bool {
        match self {
            Expr::And(left, right) => left.eval(item) && right.eval(item),
            Expr::Or(left, right) => left.eval(item) || right.eval(item),
            Expr::Not(inner) => !inner.eval(item),
            Expr::Compare(left, op, right) => {
                let (Some(a), Some(b)) = (left.resolve(item), right.resolve(item)) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => values_equal(a, b),
                    CmpOp::Ne => !values_equal(a, b),
                    CmpOp::Lt => a.compare(b) == Some(Ordering::Less),
                    CmpOp::Le => matches!(a.compare(b), Some(Ordering::Less | Ordering::Equal)),
                    CmpOp::Gt => a.compare(b) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(
                        a.compare(b),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            Expr::Between(target, low, high) => {
                let (Some(value), Some(low), Some(high)) =
                    (target.resolve(item), low.resolve(item), high.resolve(item))
                else {
                    return false;
                };
                matches!(value.compare(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
            Expr::In(target, options) => {
                let Some(value) = target.resolve(item) else {
                    return false;
                };
                options
                    .iter()
                    .filter_map(|option| option.resolve(item))
                    .any(|option| values_equal(value, option))
            }
            Expr::Exists(path) => resolve_path(path, item).is_some(),
            Expr::NotExists(path) => resolve_path(path, item).is_none(),
            Expr::BeginsWith(target, prefix) => {
                match (target.resolve(item), prefix.resolve(item)) {
                    (Some(AttributeValue::S(value)), Some(AttributeValue::S(prefix))) => {
                        value.starts_with(prefix.as_str())
                    }
                    (Some(AttributeValue::B(value)), Some(AttributeValue::B(prefix))) => {
                        value.starts_with(prefix)
                    }
                    _ => false,
                }
            }
            Expr::Contains(target, needle) => {
                match (target.resolve(item), needle.resolve(item)) {
                    (Some(AttributeValue::S(value)), Some(AttributeValue::S(needle))) => {
                        value.contains(needle.as_str())
                    }
                    (Some(AttributeValue::Ss(values)), Some(AttributeValue::S(needle))) => {
                        values.contains(needle)
                    }
                    (Some(AttributeValue::Ns(values)), Some(needle @ AttributeValue::N(_))) => {
                        values
                            .iter()
                            .any(|value| values_equal(&AttributeValue::N(value.clone()), needle))
                    }
                    (Some(AttributeValue::L(values)), Some(needle)) => {
                        values.iter().any(|value| values_equal(value, needle))
                    }
                    _ => false,
                }
            }
        }
    }
}
