//! Whitespace token stream used by vertex and edge `read` implementations.

use crate::core::{CoreError, CoreResult};
use std::str::{FromStr, SplitWhitespace};

/// Sequential reader over the whitespace separated fields of one line.
#[derive(Debug, Clone)]
pub struct TokenReader<'a> {
    tokens: SplitWhitespace<'a>,
    consumed: usize,
}

impl<'a> TokenReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            tokens: text.split_whitespace(),
            consumed: 0,
        }
    }

    /// Number of tokens handed out so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn next_token(&mut self) -> CoreResult<&'a str> {
        let token = self.tokens.next().ok_or_else(|| {
            CoreError::Parse(format!(
                "unexpected end of line after {} fields",
                self.consumed
            ))
        })?;
        self.consumed += 1;
        Ok(token)
    }

    pub fn next_f64(&mut self) -> CoreResult<f64> {
        self.next_parsed()
    }

    pub fn next_usize(&mut self) -> CoreResult<usize> {
        self.next_parsed()
    }

    /// Read `n` floating point values.
    pub fn next_f64_vec(&mut self, n: usize) -> CoreResult<Vec<f64>> {
        (0..n).map(|_| self.next_f64()).collect()
    }

    /// Unread remainder of the line, if any.
    pub fn remaining(&mut self) -> Vec<&'a str> {
        let rest: Vec<&'a str> = self.tokens.by_ref().collect();
        self.consumed += rest.len();
        rest
    }

    fn next_parsed<T>(&mut self) -> CoreResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Debug,
    {
        let token = self.next_token()?;
        token.parse::<T>().map_err(|e| {
            CoreError::Parse(format!(
                "invalid value '{}' at field {}",
                token, self.consumed
            ))
            .log_with_source(e)
        })
    }
}
