// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Redis Tunnel Contributors

// Redis Tunnel - RESP Module
// Command framing and resumable reply decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use redis_tunnel_common::{Error, ProtocolError};

use crate::reply::Reply;

/// Largest bulk string accepted (matches Redis' proto-max-bulk-len default)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted before the reply is treated as hostile
const MAX_DEPTH: usize = 128;

/// A single command: an ordered list of binary-safe arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with its name, e.g. `Command::new("SET")`
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an integer argument in decimal form
    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    /// Build a command from pre-split arguments; `None` when empty
    pub fn from_args<I, A>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Split a whitespace-separated line ("SET k v") into a command
    pub fn parse(line: &str) -> Option<Self> {
        Self::from_args(line.split_whitespace())
    }

    /// Command name as sent (first argument)
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_uppercase()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

/// Commands sent together; replies come back in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Encodes a command as a RESP array of bulk strings
pub fn encode(command: &Command, out: &mut BytesMut) {
    let size: usize = command.args.iter().map(|a| a.len() + 16).sum::<usize>() + 16;
    out.reserve(size);

    out.put_u8(b'*');
    out.put_slice(command.args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in &command.args {
        out.put_u8(b'$');
        out.put_slice(arg.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Decodes one reply from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the reply is still
/// incomplete, so the caller can read more bytes and call again.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
    let mut pos = 0;
    match parse(buf, &mut pos, 0)? {
        Some(reply) => {
            buf.advance(pos);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

fn parse(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Option<Reply>, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::Malformed(format!(
            "array nesting deeper than {}",
            MAX_DEPTH
        )));
    }

    let line = match read_line(buf, pos)? {
        Some(line) => line,
        None => return Ok(None),
    };
    let (prefix, body) = match line.split_first() {
        Some((prefix, body)) => (*prefix, body),
        None => return Err(ProtocolError::Malformed("empty line".to_string())),
    };

    match prefix {
        b'+' => Ok(Some(Reply::SimpleString(
            String::from_utf8_lossy(body).into_owned(),
        ))),
        b'-' => Ok(Some(Reply::Error(String::from_utf8_lossy(body).into_owned()))),
        b':' => Ok(Some(Reply::Integer(parse_int(body)?))),
        b'$' => {
            let len = parse_int(body)?;
            if len == -1 {
                return Ok(Some(Reply::Null));
            }
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(ProtocolError::Malformed(format!("invalid bulk length {}", len)));
            }
            let len = len as usize;
            if buf.len() < *pos + len + 2 {
                return Ok(None);
            }
            let data = &buf[*pos..*pos + len];
            if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(ProtocolError::Malformed(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            *pos += len + 2;
            Ok(Some(Reply::BulkString(Bytes::copy_from_slice(data))))
        }
        b'*' => {
            let len = parse_int(body)?;
            if len == -1 {
                return Ok(Some(Reply::Null));
            }
            if len < 0 {
                return Err(ProtocolError::Malformed(format!("invalid array length {}", len)));
            }
            // Each element takes at least 3 bytes; cap the preallocation by what is buffered.
            let mut items = Vec::with_capacity((len as usize).min(buf.len() / 3 + 1));
            for _ in 0..len {
                match parse(buf, pos, depth + 1)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            Ok(Some(Reply::Array(items)))
        }
        other => Err(ProtocolError::Malformed(format!(
            "unknown type prefix 0x{:02x}",
            other
        ))),
    }
}

/// Returns the next CRLF-terminated line (without CRLF) and advances `pos`
fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, ProtocolError> {
    let rest = &buf[*pos..];
    let newline = match rest.iter().position(|b| *b == b'\n') {
        Some(idx) => idx,
        None => return Ok(None),
    };
    if newline == 0 || rest[newline - 1] != b'\r' {
        return Err(ProtocolError::Malformed("line not terminated by CRLF".to_string()));
    }
    *pos += newline + 1;
    Ok(Some(&rest[..newline - 1]))
}

fn parse_int(data: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(data)
            ))
        })
}

/// `tokio_util` codec pairing the encoder and the resumable decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl<'a> Encoder<&'a Command> for RespCodec {
    type Error = Error;

    fn encode(&mut self, item: &'a Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(item, dst);
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode(src).map_err(Error::from)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(reply) => Ok(Some(reply)),
            // Clean end of stream between replies; the caller maps it to `Closed`.
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Protocol(ProtocolError::UnexpectedEof)),
        }
    }
}
