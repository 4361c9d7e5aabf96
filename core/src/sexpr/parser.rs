//! S-expression parser
//!
//! Recursive descent over the input bytes. A list whose first atom is a
//! keyword (`name:`) parses as a mapping; any other list is an ordered
//! sequence. Offsets in errors are byte offsets into the input.

use super::{SMap, SValue};
use crate::{Error, Result};

/// Parse exactly one S-expression, rejecting trailing input
pub fn parse(input: &str) -> Result<SValue> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    let (value, _) = parser.parse_value()?;
    parser.skip_whitespace();
    if parser.peek().is_some() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(value)
}

/// Parse a whitespace-separated sequence of S-expressions
pub fn parse_many(input: &str) -> Result<Vec<SValue>> {
    let mut parser = Parser::new(input);
    let mut values = Vec::new();
    loop {
        parser.skip_whitespace();
        if parser.peek().is_none() {
            return Ok(values);
        }
        let (value, keyword) = parser.parse_value()?;
        if keyword {
            return Err(parser.error("keyword atom outside a list"));
        }
        values.push(value);
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Parse {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// Parse the next value; the flag is true when the value was written
    /// as a keyword (`value:`)
    fn parse_value(&mut self) -> Result<(SValue, bool)> {
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'(') => {
                self.bump();
                let value = self.parse_list_body()?;
                Ok((value, false))
            }
            Some(b')') => Err(self.error("unexpected ')'")),
            Some(quote @ (b'\'' | b'"')) => {
                self.bump();
                let text = self.parse_string(quote)?;
                let keyword = self.consume_keyword_marker();
                Ok((SValue::Str(text), keyword))
            }
            Some(_) => self.parse_atom(),
        }
    }

    /// Parse a list body after the opening paren; a leading keyword makes
    /// the whole form a mapping
    fn parse_list_body(&mut self) -> Result<SValue> {
        let mut items: Vec<SValue> = Vec::new();
        let mut map: Option<SMap> = None;
        let mut pending_key: Option<SValue> = None;
        let mut first = true;

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.error("unterminated list")),
                Some(b')') => {
                    self.bump();
                    break;
                }
                Some(_) => {}
            }

            let (value, keyword) = self.parse_value()?;
            if first {
                first = false;
                if keyword {
                    map = Some(SMap::new());
                }
            }

            match map.as_mut() {
                Some(entries) => {
                    if keyword {
                        if let Some(key) = pending_key.take() {
                            entries.insert(key, SValue::Null);
                        }
                        pending_key = Some(value);
                    } else if let Some(key) = pending_key.take() {
                        entries.insert(key, value);
                    } else {
                        return Err(self.error("mapping value without a preceding key"));
                    }
                }
                None => {
                    if keyword {
                        return Err(self.error("keyword atom inside a plain list"));
                    }
                    items.push(value);
                }
            }
        }

        match map {
            Some(mut entries) => {
                if let Some(key) = pending_key {
                    entries.insert(key, SValue::Null);
                }
                Ok(SValue::Map(entries))
            }
            None => Ok(SValue::List(items)),
        }
    }

    fn parse_string(&mut self, quote: u8) -> Result<String> {
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b) if b == quote => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        Some(b'\\') => bytes.push(b'\\'),
                        Some(b'\'') => bytes.push(b'\''),
                        Some(b'"') => bytes.push(b'"'),
                        Some(b'n') => bytes.push(b'\n'),
                        Some(_) => return Err(self.error("invalid escape sequence")),
                        None => return Err(self.error("unterminated string")),
                    }
                    self.bump();
                }
                Some(b) => {
                    bytes.push(b);
                    self.bump();
                }
            }
        }
        String::from_utf8(bytes).map_err(|_| self.error("string is not valid UTF-8"))
    }

    fn parse_atom(&mut self) -> Result<(SValue, bool)> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'\'' | b'"' | b':') {
                break;
            }
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected an atom"));
        }
        let text = &self.input[start..self.pos];
        let keyword = self.consume_keyword_marker();
        Ok((classify_atom(text), keyword))
    }

    fn consume_keyword_marker(&mut self) -> bool {
        if self.peek() == Some(b':') {
            self.bump();
            true
        } else {
            false
        }
    }
}

fn classify_atom(text: &str) -> SValue {
    match text {
        "null" => return SValue::Null,
        "true" => return SValue::Bool(true),
        "false" => return SValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return SValue::Int(n);
    }
    let has_digit = text.bytes().any(|b| b.is_ascii_digit());
    if has_digit {
        if let Ok(f) = text.parse::<f64>() {
            return SValue::Float(f);
        }
    }
    SValue::Symbol(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(SValue, SValue)]) -> SValue {
        SValue::Map(entries.iter().cloned().collect())
    }

    #[test]
    fn parse_scalars() {
        assert_eq!(parse("null").unwrap(), SValue::Null);
        assert_eq!(parse("true").unwrap(), SValue::Bool(true));
        assert_eq!(parse("false").unwrap(), SValue::Bool(false));
        assert_eq!(parse("42").unwrap(), SValue::Int(42));
        assert_eq!(parse("-42").unwrap(), SValue::Int(-42));
        assert_eq!(parse("2.5").unwrap(), SValue::Float(2.5));
        assert_eq!(parse("-1.5e3").unwrap(), SValue::Float(-1500.0));
        assert_eq!(parse("echo").unwrap(), SValue::symbol("echo"));
    }

    #[test]
    fn parse_strings_both_quote_styles() {
        assert_eq!(parse("\"hi\"").unwrap(), SValue::str("hi"));
        assert_eq!(parse("'hi'").unwrap(), SValue::str("hi"));
        assert_eq!(parse(r#""a \"b\" \\ c\n""#).unwrap(), SValue::str("a \"b\" \\ c\n"));
    }

    #[test]
    fn parse_empty_list() {
        assert_eq!(parse("()").unwrap(), SValue::List(vec![]));
    }

    #[test]
    fn parse_command_list() {
        let value = parse("(echo \"hi\")").unwrap();
        assert_eq!(
            value,
            SValue::List(vec![SValue::symbol("echo"), SValue::str("hi")])
        );
    }

    #[test]
    fn parse_mapping() {
        let value = parse("(a: 1 b: 'x')").unwrap();
        assert_eq!(
            value,
            map(&[
                (SValue::symbol("a"), SValue::Int(1)),
                (SValue::symbol("b"), SValue::str("x")),
            ])
        );
    }

    #[test]
    fn parse_integer_key_with_missing_value() {
        let value = parse("(0:)").unwrap();
        assert_eq!(value, map(&[(SValue::Int(0), SValue::Null)]));
    }

    #[test]
    fn parse_trailing_key_without_value() {
        let value = parse("(a: 1 b:)").unwrap();
        assert_eq!(
            value,
            map(&[
                (SValue::symbol("a"), SValue::Int(1)),
                (SValue::symbol("b"), SValue::Null),
            ])
        );
    }

    #[test]
    fn parse_adjacent_keys_fill_null() {
        let value = parse("(a: b: 2)").unwrap();
        assert_eq!(
            value,
            map(&[
                (SValue::symbol("a"), SValue::Null),
                (SValue::symbol("b"), SValue::Int(2)),
            ])
        );
    }

    #[test]
    fn parse_nested_mixed() {
        let value = parse("(process_frame (stream_id: 0 frame_id: 0) (a: 0))").unwrap();
        let SValue::List(items) = value else {
            panic!("expected list");
        };
        assert_eq!(items[0], SValue::symbol("process_frame"));
        assert_eq!(
            items[1],
            map(&[
                (SValue::symbol("stream_id"), SValue::Int(0)),
                (SValue::symbol("frame_id"), SValue::Int(0)),
            ])
        );
        assert_eq!(items[2], map(&[(SValue::symbol("a"), SValue::Int(0))]));
    }

    #[test]
    fn parse_deep_nesting() {
        let value = parse("(a (b (c (d 1))))").unwrap();
        let text = value.to_string();
        assert_eq!(text, "(a (b (c (d 1))))");
    }

    #[test]
    fn parse_many_top_level_forms() {
        let values = parse_many("(a b) (c d)").unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn reject_unterminated_list() {
        let err = parse("(a b").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn reject_trailing_input() {
        assert!(parse("(a) (b)").is_err());
    }

    #[test]
    fn reject_value_without_key_in_mapping() {
        assert!(parse("(a: 1 2 3)").is_err());
    }

    #[test]
    fn error_carries_offset() {
        let err = parse("(a ))").unwrap_err();
        let Error::Parse { offset, .. } = err else {
            panic!("expected parse error");
        };
        assert!(offset > 0);
    }

    #[test]
    fn round_trip_values() {
        let cases = [
            "null",
            "true",
            "-7",
            "2.5",
            "\"hi there\"",
            "echo",
            "()",
            "(echo \"hi\" 3)",
            "(a: 1 b: \"x\")",
            "(0:)",
            "(metrics (stream_id: 3) (elements (PE_0: 17 PE_1: 21)))",
        ];
        for text in cases {
            let value = parse(text).unwrap();
            let reparsed = parse(&value.to_string()).unwrap();
            assert_eq!(value, reparsed, "round trip failed for {}", text);
        }
    }
}
