// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - Reply Module
// RESP reply values and typed decode helpers for common Redis shapes

use std::fmt;

use bytes::Bytes;

use redis_tunnel_common::{Error, Result};

/// A decoded RESP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK / +PONG
    SimpleString(String),
    /// -ERR ... returned by the server
    Error(String),
    /// :123
    Integer(i64),
    /// $<len> binary-safe payload
    BulkString(Bytes),
    /// $-1 or *-1
    Null,
    /// *<len>, may nest
    Array(Vec<Reply>),
}

impl Reply {
    /// Short name of the reply type, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::SimpleString(_) => "simple string",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::BulkString(_) => "bulk string",
            Reply::Null => "null",
            Reply::Array(_) => "array",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::SimpleString(s) if s == "OK")
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    /// Turn a server error reply into `Error::Server`, keeping its text verbatim
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(Error::Server(msg)),
            other => Ok(other),
        }
    }

    /// Raw bytes of a string reply; `None` for `Null`
    pub fn into_bytes(self) -> Result<Option<Bytes>> {
        match self.into_result()? {
            Reply::BulkString(data) => Ok(Some(data)),
            Reply::SimpleString(s) => Ok(Some(Bytes::from(s))),
            Reply::Null => Ok(None),
            other => Err(unexpected("string", &other)),
        }
    }

    /// UTF-8 (lossy) text of a string reply; `None` for `Null`
    pub fn into_string(self) -> Result<Option<String>> {
        Ok(self
            .into_bytes()?
            .map(|data| String::from_utf8_lossy(&data).into_owned()))
    }

    /// Integer reply, also accepting integers sent as bulk strings
    pub fn into_integer(self) -> Result<i64> {
        match self.into_result()? {
            Reply::Integer(n) => Ok(n),
            Reply::BulkString(data) => std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::UnexpectedReply("bulk string is not an integer".to_string())),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Elements of an array reply; `Null` becomes an empty list
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self.into_result()? {
            Reply::Array(items) => Ok(items),
            Reply::Null => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// LRANGE-style list of strings
    pub fn into_list(self) -> Result<Vec<Bytes>> {
        self.into_array()?
            .into_iter()
            .map(|item| {
                item.into_bytes()?
                    .ok_or_else(|| Error::UnexpectedReply("null list element".to_string()))
            })
            .collect()
    }

    /// SMEMBERS-style set; duplicates removed, server order kept
    pub fn into_set(self) -> Result<Vec<Bytes>> {
        let mut members = self.into_list()?;
        let mut seen = std::collections::HashSet::with_capacity(members.len());
        members.retain(|m| seen.insert(m.clone()));
        Ok(members)
    }

    /// HGETALL-style flat field/value array as ordered pairs
    pub fn into_hash(self) -> Result<Vec<(Bytes, Bytes)>> {
        let items = self.into_list()?;
        if items.len() % 2 != 0 {
            return Err(Error::UnexpectedReply(format!(
                "hash reply has odd length {}",
                items.len()
            )));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    /// ZRANGE ... WITHSCORES member/score pairs
    pub fn into_sorted_set(self) -> Result<Vec<(Bytes, f64)>> {
        self.into_hash()?
            .into_iter()
            .map(|(member, score)| {
                let score = parse_score(&score).ok_or_else(|| {
                    Error::UnexpectedReply(format!(
                        "invalid score {:?}",
                        String::from_utf8_lossy(&score)
                    ))
                })?;
                Ok((member, score))
            })
            .collect()
    }
}

/// Redis spells infinities as "inf" / "-inf"
fn parse_score(raw: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(raw).ok()?;
    match text {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

fn unexpected(expected: &str, got: &Reply) -> Error {
    Error::UnexpectedReply(format!("expected {}, got {}", expected, got.kind()))
}

/// redis-cli style rendering
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(reply: &Reply, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match reply {
                Reply::SimpleString(s) => write!(f, "{}", s),
                Reply::Error(e) => write!(f, "(error) {}", e),
                Reply::Integer(n) => write!(f, "(integer) {}", n),
                Reply::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
                Reply::Null => write!(f, "(nil)"),
                Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
                Reply::Array(items) => {
                    for (idx, item) in items.iter().enumerate() {
                        if idx > 0 {
                            writeln!(f)?;
                            write!(f, "{:indent$}", "", indent = indent)?;
                        }
                        write!(f, "{}) ", idx + 1)?;
                        render(item, indent + 3, f)?;
                    }
                    Ok(())
                }
            }
        }
        render(self, 0, f)
    }
}
