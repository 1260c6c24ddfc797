//! A narrow parser for Python-style data literals.
//!
//! Some producers write `metadata` with `str(dict)` instead of `json.dumps`, which yields
//! `{'a': 1, 'ok': True, 'tags': ['x', None]}`. This module understands exactly that subset:
//! numbers, booleans, null (`None`/`null`), single or double quoted strings, lists and maps.
//! Nothing is ever evaluated, and both input length and nesting depth are bounded.

use serde_json::{Map, Number, Value};
use thiserror::Error;

pub const MAX_LITERAL_LEN: usize = 64 * 1024;
pub const MAX_LITERAL_DEPTH: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LiteralError {
    #[error("literal is longer than {MAX_LITERAL_LEN} bytes")]
    TooLong,
    #[error("literal nests deeper than {MAX_LITERAL_DEPTH} levels")]
    TooDeep,
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("map keys must be strings, numbers, booleans or null")]
    InvalidKey,
}

/// Parse a complete literal. Trailing input other than whitespace is an error.
pub fn parse_literal(input: &str) -> Result<Value, LiteralError> {
    if input.len() > MAX_LITERAL_LEN {
        return Err(LiteralError::TooLong);
    }

    let mut parser = Parser {
        chars: input.char_indices().collect(),
        pos: 0,
    };
    let value = parser.value(0)?;
    parser.skip_whitespace();
    match parser.peek() {
        None => Ok(value),
        Some(c) => Err(parser.unexpected(c)),
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map(|(i, _)| *i).unwrap_or_default()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn unexpected(&self, c: char) -> LiteralError {
        LiteralError::UnexpectedChar(c, self.offset())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => {
                self.pos -= 1;
                Err(self.unexpected(c))
            }
            None => Err(LiteralError::UnexpectedEnd),
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, LiteralError> {
        if depth > MAX_LITERAL_DEPTH {
            return Err(LiteralError::TooDeep);
        }
        self.skip_whitespace();
        match self.peek() {
            None => Err(LiteralError::UnexpectedEnd),
            Some('[') => self.list(depth),
            Some('{') => self.map(depth),
            Some('\'') | Some('"') => self.string().map(Value::String),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => Err(self.unexpected(c)),
        }
    }

    fn keyword(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        let offset = self.offset();
        let mut word = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
            word.push(c);
            self.pos += 1;
        }
        match word.as_str() {
            "None" | "null" => Ok(Value::Null),
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            _ => {
                self.pos = start;
                Err(LiteralError::UnexpectedChar(
                    word.chars().next().unwrap_or_default(),
                    offset,
                ))
            }
        }
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let mut text = String::new();
        while let Some(c) = self
            .peek()
            .filter(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_'))
        {
            if c != '_' {
                text.push(c);
            }
            self.pos += 1;
        }

        let unsigned = text.trim_start_matches(|c: char| c == '+' || c == '-');
        let is_integer = !unsigned.is_empty() && unsigned.chars().all(|c| c.is_ascii_digit());
        if is_integer {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Number(n.into()));
            }
        }
        text.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or(LiteralError::InvalidNumber(text))
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        let mut out = String::new();
        loop {
            let offset = self.offset();
            match self.bump().ok_or(LiteralError::UnexpectedEnd)? {
                c if c == quote => return Ok(out),
                '\\' => {
                    let escaped = match self.bump().ok_or(LiteralError::UnexpectedEnd)? {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        'x' => self.hex_escape(2, offset)?,
                        'u' => self.hex_escape(4, offset)?,
                        _ => return Err(LiteralError::InvalidEscape(offset)),
                    };
                    out.push(escaped);
                }
                c => out.push(c),
            }
        }
    }

    fn hex_escape(&mut self, digits: usize, offset: usize) -> Result<char, LiteralError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or(LiteralError::InvalidEscape(offset))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or(LiteralError::InvalidEscape(offset))
    }

    fn list(&mut self, depth: usize) -> Result<Value, LiteralError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.value(depth + 1)?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.unexpected(c));
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn map(&mut self, depth: usize) -> Result<Value, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }
            let key = match self.value(depth + 1)? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => "null".to_owned(),
                _ => return Err(LiteralError::InvalidKey),
            };
            self.skip_whitespace();
            self.expect(':')?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.unexpected(c));
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_python_dict_repr() {
        let value =
            parse_literal("{'a': 1, 'ok': True, 'none': None, 'tags': ['x', \"y\"], 'f': -1.5}")
                .unwrap();
        assert_eq!(
            value,
            json!({"a": 1, "ok": true, "none": null, "tags": ["x", "y"], "f": -1.5})
        );
    }

    #[test]
    fn accepts_trailing_commas_and_non_string_keys() {
        assert_eq!(
            parse_literal("{1: 'one', True: [1, 2,],}").unwrap(),
            json!({"1": "one", "true": [1, 2]})
        );
    }

    #[test]
    fn handles_escapes() {
        assert_eq!(
            parse_literal(r"'it\'s\n\x41é'").unwrap(),
            json!("it's\nAé")
        );
        assert!(matches!(
            parse_literal(r"'\q'"),
            Err(LiteralError::InvalidEscape(_))
        ));
    }

    #[test]
    fn scalars() {
        assert_eq!(parse_literal("42").unwrap(), json!(42));
        assert_eq!(parse_literal("  1_000 ").unwrap(), json!(1000));
        assert_eq!(parse_literal("2.5e3").unwrap(), json!(2500.0));
        assert_eq!(parse_literal("null").unwrap(), Value::Null);
        assert_eq!(parse_literal("False").unwrap(), json!(false));
    }

    #[test]
    fn refuses_anything_that_is_not_data() {
        assert!(parse_literal("not-json").is_err());
        assert!(parse_literal("__import__('os').system('id')").is_err());
        assert!(parse_literal("{'a': 1} extra").is_err());
        assert!(parse_literal("{'a' 1}").is_err());
        assert!(parse_literal("[1, 2").is_err());
        assert!(parse_literal("{[1]: 2}").is_err());
        assert!(parse_literal("{1, 2}").is_err());
        assert!(parse_literal("").is_err());
        assert!(parse_literal("1e999").is_err());
    }

    #[test]
    fn bounds_depth_and_length() {
        let deep = format!("{}{}", "[".repeat(40), "]".repeat(40));
        assert_eq!(parse_literal(&deep), Err(LiteralError::TooDeep));

        let shallow = format!("{}{}", "[".repeat(10), "]".repeat(10));
        assert!(parse_literal(&shallow).is_ok());

        let long = format!("'{}'", "a".repeat(MAX_LITERAL_LEN));
        assert_eq!(parse_literal(&long), Err(LiteralError::TooLong));
    }
}
