//! Safe boolean condition evaluator.
//!
//! A minimal interpreter over a fixed CI context. The grammar is exactly:
//! variable reference, string literal, boolean literal, `==`, `!=`, `and`,
//! `or`, `not`. Anything else (arithmetic, parentheses, function calls) is
//! a parse error. Unknown variables fail with a diagnostic listing the
//! allowed set. On any error the caller records the task as skipped, which
//! is safer than running it.

use std::collections::BTreeMap;
use std::fmt;

use crate::config;

/// The whitelisted context variables, in diagnostic order.
pub const ALLOWED_VARS: &[&str] = &["branch", "tag", "event", "pr_number", "ci"];

/// Evaluation context: the five whitelisted variables.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context from CI environment variables.
    ///
    /// `branch`/`tag` come from `GITHUB_REF_NAME`+`GITHUB_REF_TYPE` with
    /// `CI_COMMIT_BRANCH`/`CI_COMMIT_TAG` as fallback; `event` from
    /// `GITHUB_EVENT_NAME`; `pr_number` from `GITHUB_PR_NUMBER`; `ci` from
    /// the presence of `CI`.
    pub fn from_env() -> Self {
        let mut ctx = Self::new();
        let ref_name = std::env::var("GITHUB_REF_NAME").ok();
        let ref_type = std::env::var("GITHUB_REF_TYPE").ok();

        let branch = match (ref_name.as_deref(), ref_type.as_deref()) {
            (Some(name), Some("branch")) | (Some(name), None) => Some(name.to_string()),
            _ => None,
        }
        .or_else(|| std::env::var("CI_COMMIT_BRANCH").ok());

        let tag = match (ref_name.as_deref(), ref_type.as_deref()) {
            (Some(name), Some("tag")) => Some(name.to_string()),
            _ => None,
        }
        .or_else(|| std::env::var("CI_COMMIT_TAG").ok());

        ctx.set_str("branch", branch.unwrap_or_default());
        ctx.set_str("tag", tag.unwrap_or_default());
        ctx.set_str(
            "event",
            std::env::var("GITHUB_EVENT_NAME").unwrap_or_default(),
        );
        ctx.set_str(
            "pr_number",
            std::env::var("GITHUB_PR_NUMBER").unwrap_or_default(),
        );
        ctx.set_bool("ci", config::in_ci());
        ctx
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_string(), Value::Str(value.into()));
        self
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.values.insert(key.to_string(), Value::Bool(value));
        self
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Why a condition could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionError {
    pub reason: String,
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "condition error: {}", self.reason)
    }
}

impl std::error::Error for ConditionError {}

fn err<T>(reason: impl Into<String>) -> Result<T, ConditionError> {
    Err(ConditionError {
        reason: reason.into(),
    })
}

/// Evaluate `expr` against `ctx`; `Ok(bool)` or a diagnostic error.
pub fn evaluate(expr: &str, ctx: &Context) -> Result<bool, ConditionError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_or(ctx)?;
    if parser.pos != parser.tokens.len() {
        return err(format!(
            "unexpected trailing input at token {:?}",
            parser.tokens[parser.pos]
        ));
    }
    match value {
        Value::Bool(b) => Ok(b),
        Value::Str(_) => err("condition must evaluate to a boolean, not a string"),
    }
}

// ============================================================================
// TOKENIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    And,
    Or,
    Not,
    True,
    False,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return err("expected '==' (single '=' is not assignment here)");
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return err("expected '!=' after '!'");
                }
                tokens.push(Token::Ne);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return err("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(ident),
                });
            }
            other => return err(format!("unsupported character {:?} in condition", other)),
        }
    }

    if tokens.is_empty() {
        return err("empty condition");
    }
    Ok(tokens)
}

// ============================================================================
// PARSER / EVALUATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Bool(bool),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self, ctx: &Context) -> Result<Value, ConditionError> {
        let mut left = self.parse_and(ctx)?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and(ctx)?;
            left = Value::Bool(as_bool(&left, "or")? || as_bool(&right, "or")?);
        }
        Ok(left)
    }

    fn parse_and(&mut self, ctx: &Context) -> Result<Value, ConditionError> {
        let mut left = self.parse_not(ctx)?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_not(ctx)?;
            left = Value::Bool(as_bool(&left, "and")? && as_bool(&right, "and")?);
        }
        Ok(left)
    }

    fn parse_not(&mut self, ctx: &Context) -> Result<Value, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.parse_not(ctx)?;
            return Ok(Value::Bool(!as_bool(&inner, "not")?));
        }
        self.parse_cmp(ctx)
    }

    fn parse_cmp(&mut self, ctx: &Context) -> Result<Value, ConditionError> {
        let left = self.parse_primary(ctx)?;
        match self.peek() {
            Some(Token::Eq) => {
                self.bump();
                let right = self.parse_primary(ctx)?;
                Ok(Value::Bool(left == right))
            }
            Some(Token::Ne) => {
                self.bump();
                let right = self.parse_primary(ctx)?;
                Ok(Value::Bool(left != right))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self, ctx: &Context) -> Result<Value, ConditionError> {
        match self.bump() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Ident(name)) => {
                if !ALLOWED_VARS.contains(&name.as_str()) {
                    return err(format!(
                        "unknown variable '{}'; allowed: {}",
                        name,
                        ALLOWED_VARS.join(", ")
                    ));
                }
                match ctx.get(&name) {
                    Some(v) => Ok(v.clone()),
                    None => Ok(Value::Str(String::new())),
                }
            }
            Some(other) => err(format!("unexpected token {:?}", other)),
            None => err("unexpected end of condition"),
        }
    }
}

fn as_bool(value: &Value, op: &str) -> Result<bool, ConditionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Str(_) => err(format!(
            "'{}' operands must be boolean; compare strings with == or !=",
            op
        )),
    }
}

// ============================================================================
// TESTS
// ============================================================================
