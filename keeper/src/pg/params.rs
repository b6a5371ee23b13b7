//! Key/value handling for the two flat formats the keeper deals in:
//! `postgresql.conf` fragments ([`Parameters`]) and libpq connection strings
//! ([`ConnParams`]).

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};

/// Settings appended to `postgresql.conf`. BTreeMap keeps the rendered file
/// deterministic and makes equality structural.
pub type Parameters = BTreeMap<String, String>;

/// A libpq `key=value` connection string, held as a map so comparisons are
/// insensitive to parameter order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnParams(BTreeMap<String, String>);

impl ConnParams {
    pub fn new() -> ConnParams {
        ConnParams::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render in libpq conninfo format. Values that are empty or contain
    /// whitespace, quotes or backslashes are single-quoted with `\`-escaping,
    /// following libpq's quoting rules.
    pub fn conn_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(key);
            out.push('=');
            if value.is_empty()
                || value
                    .chars()
                    .any(|c| c.is_whitespace() || c == '\'' || c == '\\')
            {
                out.push('\'');
                for c in value.chars() {
                    if c == '\'' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('\'');
            } else {
                out.push_str(value);
            }
        }
        out
    }

    /// Parse a libpq conninfo string.
    pub fn parse(s: &str) -> Result<ConnParams> {
        let mut params = ConnParams::new();
        let mut chars = s.chars().peekable();

        loop {
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '=' {
                    break;
                }
                key.push(c);
            }
            let key = key.trim().to_string();
            if key.is_empty() {
                bail!("missing keyword in connection string {s:?}");
            }

            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.peek() == Some(&'\'') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => bail!("unterminated escape in connection string {s:?}"),
                        },
                        '\'' => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    bail!("unterminated quoted value in connection string {s:?}");
                }
            } else {
                while let Some(c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(*c);
                    chars.next();
                }
            }
            params.set(&key, &value);
        }

        Ok(params)
    }
}

impl fmt::Display for ConnParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.conn_string())
    }
}
