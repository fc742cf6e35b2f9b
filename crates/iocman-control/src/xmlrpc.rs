//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
//! Minimal XML-RPC codec covering the subset supervisord speaks.
//!
//! Requests only ever carry scalar parameters, so encoding is limited to
//! strings, integers and booleans. Responses are decoded into a [`Value`]
//! tree; `<fault>` responses become [`RpcFailure::Fault`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Decoded XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `<string>` or an untyped `<value>`.
    String(String),
    /// `<int>`, `<i4>` or `<i8>`.
    Int(i64),
    /// `<boolean>`.
    Bool(bool),
    /// `<double>`.
    Double(f64),
    /// `<array>`.
    Array(Vec<Value>),
    /// `<struct>`.
    Struct(BTreeMap<String, Value>),
    /// `<nil/>` extension.
    Nil,
}

impl Value {
    /// Borrow a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Read a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow array elements.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a struct member.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.get(key),
            _ => None,
        }
    }

    /// Look up a mandatory string member.
    pub fn member_str(&self, key: &'static str) -> Result<&str, CodecError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingMember(key))
    }
}

/// Errors raised while decoding a response document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// Document ended while more input was expected.
    #[error("unexpected end of document")]
    UnexpectedEof,
    /// A tag other than the expected one was found.
    #[error("expected {expected}, found {found}")]
    UnexpectedTag {
        /// What the decoder was looking for.
        expected: &'static str,
        /// What it found instead.
        found: String,
    },
    /// Scalar text that does not parse as its declared type.
    #[error("invalid {kind} literal '{text}'")]
    InvalidLiteral {
        /// Declared scalar type.
        kind: &'static str,
        /// Offending text.
        text: String,
    },
    /// A required struct member is absent.
    #[error("missing struct member '{0}'")]
    MissingMember(&'static str),
    /// Value decoded but does not have the shape a method returns.
    #[error("unexpected value shape for {0}")]
    UnexpectedShape(&'static str),
}

/// Reasons a method call did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFailure {
    /// The server answered with a `<fault>`.
    Fault {
        /// `faultCode` member.
        code: i64,
        /// `faultString` member.
        message: String,
    },
    /// The response could not be decoded.
    Malformed(CodecError),
}

impl From<CodecError> for RpcFailure {
    fn from(err: CodecError) -> Self {
        RpcFailure::Malformed(err)
    }
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s));
        }
        Value::Int(v) => {
            let _ = write!(out, "<int>{v}</int>");
        }
        Value::Bool(v) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*v));
        }
        Value::Double(v) => {
            let _ = write!(out, "<double>{v}</double>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name));
                encode_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

/// Decode a `methodResponse` document.
pub fn decode_response(document: &str) -> Result<Value, RpcFailure> {
    let mut parser = Parser::new(document);
    parser.expect_open("methodResponse")?;
    match parser.next_significant()? {
        Token::Open("params") => {
            parser.expect_open("param")?;
            let value = parser.parse_value()?;
            parser.expect_close("param")?;
            parser.expect_close("params")?;
            parser.expect_close("methodResponse")?;
            Ok(value)
        }
        Token::Open("fault") => {
            let value = parser.parse_value()?;
            parser.expect_close("fault")?;
            let code = value
                .get("faultCode")
                .and_then(Value::as_i64)
                .ok_or(CodecError::MissingMember("faultCode"))?;
            let message = value.member_str("faultString")?.to_owned();
            Err(RpcFailure::Fault { code, message })
        }
        other => Err(CodecError::UnexpectedTag {
            expected: "<params> or <fault>",
            found: other.describe(),
        }
        .into()),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => out.push(ch),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Open(&'a str),
    Close(&'a str),
    Empty(&'a str),
    Text(&'a str),
    Eof,
}

impl Token<'_> {
    fn describe(&self) -> String {
        match self {
            Token::Open(name) => format!("<{name}>"),
            Token::Close(name) => format!("</{name}>"),
            Token::Empty(name) => format!("<{name}/>"),
            Token::Text(text) => format!("text '{}'", text.trim()),
            Token::Eof => "end of document".to_owned(),
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn next_token(&mut self) -> Result<Token<'a>, CodecError> {
        loop {
            let rest = &self.src[self.pos..];
            if rest.is_empty() {
                return Ok(Token::Eof);
            }
            if let Some(body) = rest.strip_prefix("<?") {
                let end = body.find("?>").ok_or(CodecError::UnexpectedEof)?;
                self.pos += 2 + end + 2;
                continue;
            }
            if let Some(body) = rest.strip_prefix("<!--") {
                let end = body.find("-->").ok_or(CodecError::UnexpectedEof)?;
                self.pos += 4 + end + 3;
                continue;
            }
            if rest.starts_with('<') {
                let end = rest.find('>').ok_or(CodecError::UnexpectedEof)?;
                let inner = &rest[1..end];
                self.pos += end + 1;
                if let Some(name) = inner.strip_prefix('/') {
                    return Ok(Token::Close(name.trim()));
                }
                if let Some(body) = inner.strip_suffix('/') {
                    return Ok(Token::Empty(tag_name(body)));
                }
                return Ok(Token::Open(tag_name(inner)));
            }
            let end = rest.find('<').unwrap_or(rest.len());
            self.pos += end;
            return Ok(Token::Text(&rest[..end]));
        }
    }

    /// Next token that is not inter-element whitespace.
    fn next_significant(&mut self) -> Result<Token<'a>, CodecError> {
        loop {
            match self.next_token()? {
                Token::Text(text) if text.trim().is_empty() => continue,
                token => return Ok(token),
            }
        }
    }

    fn expect_open(&mut self, name: &'static str) -> Result<(), CodecError> {
        match self.next_significant()? {
            Token::Open(found) if found == name => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    fn expect_close(&mut self, name: &'static str) -> Result<(), CodecError> {
        match self.next_significant()? {
            Token::Close(found) if found == name => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    /// Text content up to the closing tag `name`; empty when the element is empty.
    fn scalar_text(&mut self, name: &'static str) -> Result<String, CodecError> {
        match self.next_token()? {
            Token::Close(found) if found == name => Ok(String::new()),
            Token::Text(text) => {
                self.expect_close(name)?;
                Ok(unescape(text))
            }
            other => Err(unexpected(name, other)),
        }
    }

    fn parse_value(&mut self) -> Result<Value, CodecError> {
        match self.next_significant()? {
            Token::Open("value") => {}
            Token::Empty("value") => return Ok(Value::String(String::new())),
            other => return Err(unexpected("value", other)),
        }
        let mut token = self.next_token()?;
        if let Token::Text(text) = token {
            let following = self.next_token()?;
            if following == Token::Close("value") {
                return Ok(Value::String(unescape(text)));
            }
            if !text.trim().is_empty() {
                return Err(unexpected("value", Token::Text(text)));
            }
            token = following;
        }
        let value = match token {
            Token::Close("value") => return Ok(Value::String(String::new())),
            Token::Empty("string") => Value::String(String::new()),
            Token::Empty("nil") => Value::Nil,
            Token::Empty("array") => Value::Array(Vec::new()),
            Token::Empty("struct") => Value::Struct(BTreeMap::new()),
            Token::Open("string") => Value::String(self.scalar_text("string")?),
            Token::Open(kind @ ("int" | "i4" | "i8")) => {
                let close: &'static str = match kind {
                    "int" => "int",
                    "i4" => "i4",
                    _ => "i8",
                };
                let text = self.scalar_text(close)?;
                Value::Int(text.trim().parse().map_err(|_| CodecError::InvalidLiteral {
                    kind: "int",
                    text: text.clone(),
                })?)
            }
            Token::Open("boolean") => {
                let text = self.scalar_text("boolean")?;
                match text.trim() {
                    "1" => Value::Bool(true),
                    "0" => Value::Bool(false),
                    _ => {
                        return Err(CodecError::InvalidLiteral {
                            kind: "boolean",
                            text,
                        })
                    }
                }
            }
            Token::Open("double") => {
                let text = self.scalar_text("double")?;
                Value::Double(text.trim().parse().map_err(|_| CodecError::InvalidLiteral {
                    kind: "double",
                    text: text.clone(),
                })?)
            }
            Token::Open("array") => self.parse_array()?,
            Token::Open("struct") => self.parse_struct()?,
            other => return Err(unexpected("typed value", other)),
        };
        self.expect_close("value")?;
        Ok(value)
    }

    fn parse_array(&mut self) -> Result<Value, CodecError> {
        let mut items = Vec::new();
        match self.next_significant()? {
            Token::Empty("data") => {}
            Token::Open("data") => loop {
                let checkpoint = self.pos;
                match self.next_significant()? {
                    Token::Close("data") => break,
                    _ => {
                        self.pos = checkpoint;
                        items.push(self.parse_value()?);
                    }
                }
            },
            other => return Err(unexpected("data", other)),
        }
        self.expect_close("array")?;
        Ok(Value::Array(items))
    }

    fn parse_struct(&mut self) -> Result<Value, CodecError> {
        let mut members = BTreeMap::new();
        loop {
            match self.next_significant()? {
                Token::Close("struct") => break,
                Token::Open("member") => {
                    self.expect_open("name")?;
                    let name = self.scalar_text("name")?;
                    let value = self.parse_value()?;
                    self.expect_close("member")?;
                    members.insert(name, value);
                }
                other => return Err(unexpected("member", other)),
            }
        }
        Ok(Value::Struct(members))
    }
}

fn tag_name(inner: &str) -> &str {
    inner
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or_default()
}

fn unexpected(expected: &'static str, found: Token<'_>) -> CodecError {
    match found {
        Token::Eof => CodecError::UnexpectedEof,
        other => CodecError::UnexpectedTag {
            expected,
            found: other.describe(),
        },
    }
}
