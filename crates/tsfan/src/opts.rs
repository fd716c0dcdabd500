//! Shared tokenizer for backend option strings.
//!
//! Backends are enabled with a single option string (from a config file or
//! a `-t "kafka -b host:9092 -c prod"`-style CLI flag). The string is split
//! POSIX-shell-like — whitespace separates tokens, single and double quotes
//! group them, backslash escapes the next character — and the resulting
//! argv is handed to the backend's clap grammar.

use crate::error::{Error, Result};

/// Hard cap on tokens produced by a single invocation.
pub const MAX_TOKENS: usize = 1024;

/// Splits `input` into tokens.
///
/// # Errors
///
/// Returns [`Error::Config`] on an unterminated quote, a trailing
/// backslash, or more than [`MAX_TOKENS`] tokens.
pub fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => {
                    let next = chars
                        .next()
                        .ok_or_else(|| Error::Config("trailing backslash in options".into()))?;
                    current.push(next);
                }
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    let next = chars
                        .next()
                        .ok_or_else(|| Error::Config("trailing backslash in options".into()))?;
                    current.push(next);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        push_token(&mut tokens, &mut current)?;
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(Error::Config("unterminated quote in options".into()));
    }
    if in_token {
        push_token(&mut tokens, &mut current)?;
    }
    Ok(tokens)
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) -> Result<()> {
    if tokens.len() == MAX_TOKENS {
        return Err(Error::Config(format!(
            "option string exceeds {MAX_TOKENS} tokens"
        )));
    }
    tokens.push(std::mem::take(current));
    Ok(())
}
