//! Query templates.
//!
//! Queries are rendered through a small template language before they are handed to a driver.
//! The syntax follows Go's `text/template`: actions are delimited by `{{` and `}}`, may trim
//! surrounding whitespace with `{{- ` and ` -}}`, and consist of pipelines of function calls
//! separated by `|`, where the result of each command is passed as the last argument of the next
//! one:
//!
//! ```text
//! select count(*) from events where day = '{{ now | dateModify "-24h" | date "2006-01-02" }}'
//! ```
//!
//! Templates have no data: field access (`.Name`), variables (`$x`) and control actions
//! (`if`, `range`, `with`, ...) are rejected when parsing. Only the functions listed in
//! [`FUNCTIONS`] are available.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use scc::HashMap;
use thiserror::Error;

mod funcs;
pub use self::funcs::FUNCTIONS;

/// Errors from parsing or executing a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The template text is malformed.
    #[error("template: {offset}: {message}")]
    Parse {
        /// Byte offset in the template source.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// A function call failed.
    #[error("error calling {func}: {message}")]
    Call {
        /// Function name.
        func: String,
        /// Description of the problem.
        message: String,
    },

    /// A pipeline tried to pass a value to something that is not a function.
    #[error("can't give argument to non-function {0}")]
    NotAFunction(String),
}

/// A value flowing through a template pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    /// Text.
    Str(String),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Point in time, in the local time zone.
    Time(DateTime<Local>),
}

impl Datum {
    fn kind(&self) -> &'static str {
        match self {
            Datum::Str(_) => "string",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Bool(_) => "bool",
            Datum::Time(_) => "date",
        }
    }

    /// Integer conversion, where anything unconvertible becomes `0`.
    fn to_i64(&self) -> i64 {
        match self {
            Datum::Int(i) => *i,
            Datum::Float(f) => *f as i64,
            Datum::Bool(b) => i64::from(*b),
            Datum::Str(s) => {
                let s = s.trim();
                s.parse().or_else(|_| s.parse::<f64>().map(|f| f as i64)).unwrap_or_default()
            }
            Datum::Time(t) => t.timestamp(),
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            Datum::Int(i) => *i as f64,
            Datum::Float(f) => *f,
            Datum::Bool(b) => f64::from(u8::from(*b)),
            Datum::Str(s) => s.trim().parse().unwrap_or_default(),
            Datum::Time(t) => t.timestamp() as f64,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Datum::Str(s) => s.is_empty(),
            Datum::Int(i) => *i == 0,
            Datum::Float(f) => *f == 0.0,
            Datum::Bool(b) => !b,
            Datum::Time(_) => false,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Str(s) => f.write_str(s),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Bool(b) => write!(f, "{b}"),
            Datum::Time(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.f %z")),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Node {
    Text(String),
    Action(Pipeline),
}

type Pipeline = Vec<Command>;

#[derive(Debug, PartialEq)]
enum Command {
    Call { func: String, args: Vec<Operand> },
    Operand(Operand),
}

#[derive(Debug, PartialEq)]
enum Operand {
    Literal(Datum),
    Call(String),
    Pipeline(Pipeline),
}

/// A parsed template.
#[derive(Debug)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parses template source.
    ///
    /// # Errors
    ///
    /// Fails on malformed actions, unknown functions, and unsupported constructs.
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let mut nodes = Vec::new();
        let mut rest = source;
        let mut trim_next_text = false;

        while let Some(open) = rest.find("{{") {
            let mut text = &rest[..open];
            if trim_next_text {
                text = text.trim_start();
            }

            let action_start = open + 2;
            let body = &rest[action_start..];
            let trim_left = body.starts_with("- ") || body.starts_with("-\t") || body.starts_with("-\n");
            if trim_left {
                text = text.trim_end();
            }
            if !text.is_empty() {
                nodes.push(Node::Text(text.to_owned()));
            }

            let offset = source.len() - rest.len() + action_start;
            let close = find_close(body).ok_or(TemplateError::Parse {
                offset,
                message: "unclosed action".to_owned(),
            })?;
            let mut inner = &body[..close];
            let trim_right = inner.ends_with(" -") || inner.ends_with("\t-") || inner.ends_with("\n-");
            if trim_left {
                inner = &inner[1..];
            }
            if trim_right {
                inner = &inner[..inner.len() - 1];
            }

            if !is_comment(inner) {
                let pipeline = Parser::new(inner, offset)?.parse_action()?;
                nodes.push(Node::Action(pipeline));
            }

            trim_next_text = trim_right;
            rest = &body[close + 2..];
        }

        let text = if trim_next_text { rest.trim_start() } else { rest };
        if !text.is_empty() {
            nodes.push(Node::Text(text.to_owned()));
        }
        Ok(Template { nodes })
    }

    /// Executes the template.
    ///
    /// # Errors
    ///
    /// Fails if any function call fails.
    pub fn execute(&self) -> Result<String, TemplateError> {
        let mut output = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => output.push_str(text),
                Node::Action(pipeline) => output.push_str(&eval_pipeline(pipeline)?.to_string()),
            }
        }
        Ok(output)
    }
}

/// Finds the `}}` closing an action, skipping over quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut quote = None;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (None, b'}') if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            (None, q @ (b'"' | b'`')) => quote = Some(q),
            (Some(b'"'), b'\\') => i += 1,
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
        i += 1;
    }
    None
}

fn is_comment(inner: &str) -> bool {
    let inner = inner.trim();
    inner.starts_with("/*") && inner.ends_with("*/")
}

fn eval_pipeline(pipeline: &Pipeline) -> Result<Datum, TemplateError> {
    let mut previous = None;
    for command in pipeline {
        previous = Some(match command {
            Command::Call { func, args } => {
                let mut values = args.iter().map(eval_operand).collect::<Result<Vec<_>, _>>()?;
                values.extend(previous.take());
                funcs::call(func, values)?
            }
            Command::Operand(operand) => {
                if previous.is_some() {
                    return Err(TemplateError::NotAFunction(describe(operand)));
                }
                eval_operand(operand)?
            }
        });
    }
    // Parsing guarantees pipelines are never empty.
    Ok(previous.unwrap_or(Datum::Str(String::new())))
}

fn eval_operand(operand: &Operand) -> Result<Datum, TemplateError> {
    match operand {
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Call(func) => funcs::call(func, Vec::new()),
        Operand::Pipeline(pipeline) => eval_pipeline(pipeline),
    }
}

fn describe(operand: &Operand) -> String {
    match operand {
        Operand::Literal(value) => value.to_string(),
        Operand::Call(func) => func.clone(),
        Operand::Pipeline(_) => "(...)".to_owned(),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Literal(Datum),
    Ident(String),
    Pipe,
    LeftParen,
    RightParen,
}

const CONTROL_KEYWORDS: &[&str] =
    &["if", "else", "end", "range", "with", "define", "template", "block", "break", "continue"];

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(source: &str, offset: usize) -> Result<Self, TemplateError> {
        Ok(Parser { tokens: lex(source, offset)?, pos: 0, end: offset + source.len() })
    }

    fn parse_action(mut self) -> Result<Pipeline, TemplateError> {
        if self.tokens.is_empty() {
            return Err(self.error(self.end, "missing value for command"));
        }
        let pipeline = self.parse_pipeline()?;
        match self.tokens.get(self.pos) {
            None => Ok(pipeline),
            Some((offset, token)) => Err(self.error(*offset, &format!("unexpected {token:?} in action"))),
        }
    }

    fn parse_pipeline(&mut self) -> Result<Pipeline, TemplateError> {
        let mut pipeline = vec![self.parse_command()?];
        while let Some((_, Token::Pipe)) = self.tokens.get(self.pos) {
            self.pos += 1;
            pipeline.push(self.parse_command()?);
        }
        Ok(pipeline)
    }

    fn parse_command(&mut self) -> Result<Command, TemplateError> {
        let mut operands = Vec::new();
        while let Some((offset, token)) = self.tokens.get(self.pos).cloned() {
            let operand = match token {
                Token::Pipe | Token::RightParen => break,
                Token::Literal(value) => Operand::Literal(value),
                Token::Ident(name) => {
                    if CONTROL_KEYWORDS.contains(&name.as_str()) {
                        return Err(self.error(offset, &format!("{name} actions are not supported")));
                    }
                    if !funcs::is_function(&name) {
                        return Err(self.error(offset, &format!("function {name:?} not defined")));
                    }
                    Operand::Call(name)
                }
                Token::LeftParen => {
                    self.pos += 1;
                    let inner = self.parse_pipeline()?;
                    match self.tokens.get(self.pos) {
                        Some((_, Token::RightParen)) => {}
                        Some((offset, _)) => return Err(self.error(*offset, "unclosed left paren")),
                        None => return Err(self.error(self.end, "unclosed left paren")),
                    }
                    Operand::Pipeline(inner)
                }
            };
            self.pos += 1;
            operands.push(operand);
        }

        let offset = self.tokens.get(self.pos).map_or(self.end, |(offset, _)| *offset);
        let mut operands = operands.into_iter();
        match operands.next() {
            None => Err(self.error(offset, "missing value for command")),
            Some(Operand::Call(func)) => Ok(Command::Call { func, args: operands.collect() }),
            Some(operand) => match operands.next() {
                None => Ok(Command::Operand(operand)),
                Some(_) => Err(TemplateError::NotAFunction(describe(&operand))),
            },
        }
    }

    fn error(&self, offset: usize, message: &str) -> TemplateError {
        TemplateError::Parse { offset, message: message.to_owned() }
    }
}

fn lex(source: &str, base: usize) -> Result<Vec<(usize, Token)>, TemplateError> {
    let error = |at: usize, message: String| TemplateError::Parse { offset: base + at, message };
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'|' => {
                tokens.push((base + start, Token::Pipe));
                i += 1;
            }
            b'(' => {
                tokens.push((base + start, Token::LeftParen));
                i += 1;
            }
            b')' => {
                tokens.push((base + start, Token::RightParen));
                i += 1;
            }
            b'"' => {
                let (value, len) = lex_quoted(&source[i..]).ok_or_else(|| error(start, "unterminated quoted string".into()))?;
                tokens.push((base + start, Token::Literal(Datum::Str(value))));
                i += len;
            }
            b'`' => {
                let end = source[i + 1..].find('`').ok_or_else(|| error(start, "unterminated raw quoted string".into()))?;
                tokens.push((base + start, Token::Literal(Datum::Str(source[i + 1..i + 1 + end].to_owned()))));
                i += end + 2;
            }
            b'.' if bytes.get(i + 1).is_some_and(|n| !n.is_ascii_digit()) || i + 1 == bytes.len() => {
                return Err(error(start, "field access is not supported".into()));
            }
            b'$' => return Err(error(start, "variables are not supported".into())),
            b'0'..=b'9' | b'-' | b'+' | b'.' => {
                let len = source[i..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '+' | '_')))
                    .unwrap_or(source.len() - i);
                let text = &source[i..i + len];
                tokens.push((base + start, Token::Literal(parse_number(text).ok_or_else(|| error(start, format!("bad number syntax: {text:?}")))?)));
                i += len;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let len = source[i..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(source.len() - i);
                let word = &source[i..i + len];
                tokens.push((
                    base + start,
                    match word {
                        "true" => Token::Literal(Datum::Bool(true)),
                        "false" => Token::Literal(Datum::Bool(false)),
                        _ => Token::Ident(word.to_owned()),
                    },
                ));
                i += len;
            }
            _ => {
                let ch = source[i..].chars().next().unwrap_or_default();
                return Err(error(start, format!("unexpected {ch:?} in action")));
            }
        }
    }
    Ok(tokens)
}

/// Lexes a double quoted string with Go escapes, returning the value and the consumed length.
fn lex_quoted(source: &str) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut chars = source.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, i + 1)),
            '\\' => {
                let (_, escaped) = chars.next()?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
            }
            '\n' => return None,
            c => value.push(c),
        }
    }
    None
}

fn parse_number(text: &str) -> Option<Datum> {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let digits = digits.replace('_', "");

    let int = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        digits.parse::<i64>().ok()
    };
    if let Some(i) = int {
        return Some(Datum::Int(if negative { -i } else { i }));
    }

    let float = digits.parse::<f64>().ok().filter(|f| f.is_finite())?;
    Some(Datum::Float(if negative { -float } else { float }))
}

/// Renders query templates, caching parsed templates by their source text.
#[derive(Clone, Default)]
pub struct TemplateRenderer {
    cache: Arc<HashMap<String, Arc<Template>>>,
}

impl TemplateRenderer {
    /// Creates a renderer with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders `source`, which is returned unchanged when it contains no actions.
    ///
    /// # Errors
    ///
    /// Fails if the template cannot be parsed or executed.
    pub fn render(&self, source: &str) -> Result<String, TemplateError> {
        if !source.contains("{{") {
            return Ok(source.to_owned());
        }

        let template = match self.cache.read(source, |_, template| template.clone()) {
            Some(template) => template,
            None => {
                let template = Arc::new(Template::parse(source)?);
                let _ = self.cache.insert(source.to_owned(), template.clone());
                template
            }
        };
        template.execute()
    }
}
