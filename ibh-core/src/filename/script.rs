//! Script-based filenaming.
//!
//! A deliberately small expression language behind the narrow
//! `evaluate(script, context) -> string` interface: string literals, token
//! variables, `+` concatenation, a `has("tag")` check and the ternary
//! `cond ? a : b`. Enough for "full custom logic" filenames without
//! embedding a scripting runtime; the engine behind this interface can be
//! swapped without touching any caller.
//!
//! ```text
//! has("animated") ? "video_" + id + "." + ext : md5 + "." + ext
//! ```
use thiserror::Error;

use super::{token_value, TemplateContext, TokenOptions};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Unexpected end of script")]
    UnexpectedEnd,

    #[error("Unexpected '{found}' at offset {position}")]
    UnexpectedToken { position: usize, found: String },

    #[error("Unterminated string literal starting at offset {position}")]
    UnterminatedString { position: usize },

    #[error("Unknown identifier '{name}'")]
    UnknownIdentifier { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Str(String),
    Ident(String),
    Plus,
    Question,
    Colon,
    LParen,
    RParen,
}

fn lex(script: &str) -> Result<Vec<(usize, Token)>, ScriptError> {
    let mut tokens = Vec::new();
    let bytes = script.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '?' => {
                tokens.push((i, Token::Question));
                i += 1;
            }
            ':' => {
                tokens.push((i, Token::Colon));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(ScriptError::UnterminatedString { position: start });
                    }
                    match bytes[i] as char {
                        '"' => {
                            i += 1;
                            break;
                        }
                        other => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(script[start..i].to_string())));
            }
            other => {
                return Err(ScriptError::UnexpectedToken {
                    position: i,
                    found: other.to_string(),
                })
            }
        }
    }
    Ok(tokens)
}

/// Parsed expression tree.
#[derive(Debug, Clone)]
enum Expr {
    Literal(String),
    Variable(String),
    Has(String),
    Concat(Vec<Expr>),
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), ScriptError> {
        let item = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(ScriptError::UnexpectedEnd)?;
        self.position += 1;
        Ok(item)
    }

    fn expect(&mut self, wanted: &Token) -> Result<(), ScriptError> {
        let (position, token) = self.next()?;
        if &token == wanted {
            Ok(())
        } else {
            Err(ScriptError::UnexpectedToken {
                position,
                found: format!("{token:?}"),
            })
        }
    }

    /// expr := concat ('?' expr ':' expr)?
    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let condition = self.concat()?;
        if self.peek() == Some(&Token::Question) {
            self.next()?;
            let then = self.expr()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.expr()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(condition)
    }

    /// concat := primary ('+' primary)*
    fn concat(&mut self) -> Result<Expr, ScriptError> {
        let mut parts = vec![self.primary()?];
        while self.peek() == Some(&Token::Plus) {
            self.next()?;
            parts.push(self.primary()?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().unwrap())
        } else {
            Ok(Expr::Concat(parts))
        }
    }

    /// primary := string | ident | has '(' string ')' | '(' expr ')'
    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let (position, token) = self.next()?;
        match token {
            Token::Str(value) => Ok(Expr::Literal(value)),
            Token::Ident(name) if name == "has" && self.peek() == Some(&Token::LParen) => {
                self.next()?;
                let (inner_pos, inner) = self.next()?;
                let Token::Str(tag) = inner else {
                    return Err(ScriptError::UnexpectedToken {
                        position: inner_pos,
                        found: format!("{inner:?}"),
                    });
                };
                self.expect(&Token::RParen)?;
                Ok(Expr::Has(tag))
            }
            Token::Ident(name) => Ok(Expr::Variable(name)),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(ScriptError::UnexpectedToken {
                position,
                found: format!("{other:?}"),
            }),
        }
    }
}

fn parse(script: &str) -> Result<Expr, ScriptError> {
    let tokens = lex(script)?;
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.expr()?;
    if let Some((position, token)) = parser.tokens.get(parser.position) {
        return Err(ScriptError::UnexpectedToken {
            position: *position,
            found: format!("{token:?}"),
        });
    }
    Ok(expr)
}

fn eval(expr: &Expr, ctx: &TemplateContext) -> Result<String, ScriptError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => token_value(name, ctx, &TokenOptions::default())
            .ok_or_else(|| ScriptError::UnknownIdentifier { name: name.clone() }),
        Expr::Has(tag) => Ok(if ctx.post.has_tag(tag) {
            "true".to_string()
        } else {
            String::new()
        }),
        Expr::Concat(parts) => {
            let mut out = String::new();
            for part in parts {
                out.push_str(&eval(part, ctx)?);
            }
            Ok(out)
        }
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            // Truthiness is non-emptiness, like the token-presence guards.
            if eval(condition, ctx)?.is_empty() {
                eval(otherwise, ctx)
            } else {
                eval(then, ctx)
            }
        }
    }
}

/// Syntax check without evaluation, used by template validation.
pub fn check(script: &str) -> Result<(), ScriptError> {
    parse(script).map(|_| ())
}

/// Evaluates a script template against one post.
pub fn evaluate(script: &str, ctx: &TemplateContext) -> Result<String, ScriptError> {
    let expr = parse(script)?;
    eval(&expr, ctx)
}
