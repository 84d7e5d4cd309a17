//! Memcache ASCII text protocol — request/response framing.
//!
//! Covers the subset needed to drive the routing engine end to end: storage
//! commands (set/add/replace/append/prepend/cas), retrieval (get/gets),
//! delete, incr/decr, stats and quit. No binary protocol, no UDP framing.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Get,
    Gets,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Delete,
    Incr,
    Decr,
    Stats,
    Quit,
}

impl Cmd {
    fn from_token(tok: &str) -> Option<Self> {
        Some(match tok {
            "get" => Cmd::Get,
            "gets" => Cmd::Gets,
            "set" => Cmd::Set,
            "add" => Cmd::Add,
            "replace" => Cmd::Replace,
            "append" => Cmd::Append,
            "prepend" => Cmd::Prepend,
            "cas" => Cmd::Cas,
            "delete" => Cmd::Delete,
            "incr" => Cmd::Incr,
            "decr" => Cmd::Decr,
            "stats" => Cmd::Stats,
            "quit" => Cmd::Quit,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cmd::Get => "get",
            Cmd::Gets => "gets",
            Cmd::Set => "set",
            Cmd::Add => "add",
            Cmd::Replace => "replace",
            Cmd::Append => "append",
            Cmd::Prepend => "prepend",
            Cmd::Cas => "cas",
            Cmd::Delete => "delete",
            Cmd::Incr => "incr",
            Cmd::Decr => "decr",
            Cmd::Stats => "stats",
            Cmd::Quit => "quit",
        }
    }

    fn is_storage(&self) -> bool {
        matches!(
            self,
            Cmd::Set | Cmd::Add | Cmd::Replace | Cmd::Append | Cmd::Prepend | Cmd::Cas
        )
    }
}

#[derive(Debug, Clone)]
pub struct Item {
    pub body: Bytes,
    pub flags: u32,
    pub exptime: i64,
    pub cas: u64,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub cmd: Cmd,
    pub keys: Vec<String>,
    pub item: Option<Item>,
    pub delta: i64,
    pub no_reply: bool,
}

impl Request {
    pub fn key(&self) -> &str {
        self.keys.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Value,
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    Error,
    ClientError,
    ServerError,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Value => "VALUE",
            Status::Stored => "STORED",
            Status::NotStored => "NOT_STORED",
            Status::Exists => "EXISTS",
            Status::NotFound => "NOT_FOUND",
            Status::Deleted => "DELETED",
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::ClientError => "CLIENT_ERROR",
            Status::ServerError => "SERVER_ERROR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: Option<Status>,
    pub items: HashMap<String, Item>,
    pub msg: String,
    pub counter: Option<i64>,
}

impl Response {
    pub fn stored() -> Self {
        Self { status: Some(Status::Stored), ..Default::default() }
    }

    pub fn status(status: Status) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self { status: Some(Status::ServerError), msg: msg.into(), ..Default::default() }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    Malformed(String),
    Eof,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
            ProtocolError::Malformed(s) => write!(f, "malformed request: {s}"),
            ProtocolError::Eof => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// Reads one command line (and its payload, for storage commands) from a
/// client or backend connection. Returns `Ok(None)` on a clean EOF between
/// commands.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<Option<Request>, ProtocolError> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
    let mut it = tokens.into_iter();
    let cmd_tok = it.next().ok_or_else(|| malformed("empty line"))?;
    let cmd = Cmd::from_token(cmd_tok).ok_or_else(|| malformed(&format!("unknown command {cmd_tok}")))?;

    match cmd {
        Cmd::Get | Cmd::Gets => {
            let keys: Vec<String> = it.map(String::from).collect();
            if keys.is_empty() {
                return Err(malformed("get with no keys"));
            }
            Ok(Some(Request { cmd, keys, item: None, delta: 0, no_reply: false }))
        }
        c if c.is_storage() => {
            let key = it.next().ok_or_else(|| malformed("missing key"))?;
            let flags: u32 = parse_field(it.next(), "flags")?;
            let exptime: i64 = parse_field(it.next(), "exptime")?;
            let bytes: usize = parse_field(it.next(), "bytes")?;
            let cas: u64 = if c == Cmd::Cas { parse_field(it.next(), "cas")? } else { 0 };
            let no_reply = it.next() == Some("noreply");

            let mut body = vec![0u8; bytes];
            tokio::io::AsyncReadExt::read_exact(r, &mut body).await?;
            let mut crlf = [0u8; 2];
            tokio::io::AsyncReadExt::read_exact(r, &mut crlf).await?;

            Ok(Some(Request {
                cmd: c,
                keys: vec![key.to_string()],
                item: Some(Item { body: Bytes::from(body), flags, exptime, cas }),
                delta: 0,
                no_reply,
            }))
        }
        Cmd::Delete => {
            let key = it.next().ok_or_else(|| malformed("missing key"))?;
            let no_reply = it.next() == Some("noreply");
            Ok(Some(Request { cmd, keys: vec![key.to_string()], item: None, delta: 0, no_reply }))
        }
        Cmd::Incr | Cmd::Decr => {
            let key = it.next().ok_or_else(|| malformed("missing key"))?;
            let delta: i64 = parse_field(it.next(), "delta")?;
            let no_reply = it.next() == Some("noreply");
            Ok(Some(Request { cmd, keys: vec![key.to_string()], item: None, delta, no_reply }))
        }
        Cmd::Stats => {
            let keys: Vec<String> = it.map(String::from).collect();
            Ok(Some(Request { cmd, keys, item: None, delta: 0, no_reply: false }))
        }
        Cmd::Quit => Ok(Some(Request { cmd, keys: vec![], item: None, delta: 0, no_reply: false })),
    }
}

fn parse_field<T: std::str::FromStr>(tok: Option<&str>, field: &str) -> Result<T, ProtocolError> {
    tok.ok_or_else(|| malformed(&format!("missing {field}")))?
        .parse()
        .map_err(|_| malformed(&format!("invalid {field}")))
}

/// Serializes a request for sending to a backend (the Host's outbound side).
pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    match req.cmd {
        Cmd::Get | Cmd::Gets => {
            out.extend_from_slice(req.cmd.as_str().as_bytes());
            for k in &req.keys {
                out.push(b' ');
                out.extend_from_slice(k.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Cmd::Delete => {
            out.extend_from_slice(format!("delete {}", req.key()).as_bytes());
            if req.no_reply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Cmd::Incr | Cmd::Decr => {
            out.extend_from_slice(
                format!("{} {} {}", req.cmd.as_str(), req.key(), req.delta).as_bytes(),
            );
            if req.no_reply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Cmd::Stats => {
            out.extend_from_slice(b"stats");
            for k in &req.keys {
                out.push(b' ');
                out.extend_from_slice(k.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Cmd::Quit => out.extend_from_slice(b"quit\r\n"),
        _ => {
            let item = req.item.as_ref().expect("storage command requires an item");
            out.extend_from_slice(
                format!(
                    "{} {} {} {} {}",
                    req.cmd.as_str(),
                    req.key(),
                    item.flags,
                    item.exptime,
                    item.body.len()
                )
                .as_bytes(),
            );
            if req.cmd == Cmd::Cas {
                out.extend_from_slice(format!(" {}", item.cas).as_bytes());
            }
            if req.no_reply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&item.body);
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}

/// Reads one response from a backend connection for the request that
/// produced it. `cmd` tells the parser which shape to expect.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
    cmd: Cmd,
) -> Result<Response, ProtocolError> {
    match cmd {
        Cmd::Get | Cmd::Gets => {
            let mut items = HashMap::new();
            loop {
                let mut line = String::new();
                let n = r.read_line(&mut line).await?;
                if n == 0 {
                    return Err(ProtocolError::Eof);
                }
                let line = line.trim_end_matches(['\r', '\n']);
                if line == "END" {
                    break;
                }
                let mut parts = line.split(' ');
                match parts.next() {
                    Some("VALUE") => {
                        let key = parts.next().ok_or_else(|| malformed("VALUE missing key"))?;
                        let flags: u32 = parts
                            .next()
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| malformed("VALUE flags"))?;
                        let bytes: usize = parts
                            .next()
                            .and_then(|s| s.parse().ok())
                            .ok_or_else(|| malformed("VALUE bytes"))?;
                        let cas: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

                        let mut body = vec![0u8; bytes];
                        tokio::io::AsyncReadExt::read_exact(r, &mut body).await?;
                        let mut crlf = [0u8; 2];
                        tokio::io::AsyncReadExt::read_exact(r, &mut crlf).await?;

                        items.insert(
                            key.to_string(),
                            Item { body: Bytes::from(body), flags, exptime: 0, cas },
                        );
                    }
                    Some("ERROR") => return Ok(Response::status(Status::Error)),
                    Some("SERVER_ERROR") => {
                        return Ok(Response::error(line.trim_start_matches("SERVER_ERROR ")));
                    }
                    _ => return Err(malformed("unexpected get response line")),
                }
            }
            Ok(Response { status: Some(Status::Value), items, msg: String::new(), counter: None })
        }
        Cmd::Incr | Cmd::Decr => {
            let line = read_status_line(r).await?;
            if line == "NOT_FOUND" {
                return Ok(Response::status(Status::NotFound));
            }
            match line.parse::<i64>() {
                Ok(v) => Ok(Response { status: Some(Status::Ok), counter: Some(v), ..Default::default() }),
                Err(_) => Ok(classify_status_line(&line)),
            }
        }
        Cmd::Stats => {
            let mut msg = String::new();
            loop {
                let mut line = String::new();
                let n = r.read_line(&mut line).await?;
                if n == 0 {
                    return Err(ProtocolError::Eof);
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed == "END" {
                    break;
                }
                msg.push_str(trimmed);
                msg.push('\n');
            }
            Ok(Response { status: Some(Status::Ok), msg, ..Default::default() })
        }
        Cmd::Quit => Ok(Response::status(Status::Ok)),
        _ => {
            let line = read_status_line(r).await?;
            Ok(classify_status_line(&line))
        }
    }
}

async fn read_status_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProtocolError::Eof);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn classify_status_line(line: &str) -> Response {
    match line {
        "STORED" => Response::status(Status::Stored),
        "NOT_STORED" => Response::status(Status::NotStored),
        "EXISTS" => Response::status(Status::Exists),
        "NOT_FOUND" => Response::status(Status::NotFound),
        "DELETED" => Response::status(Status::Deleted),
        "OK" => Response::status(Status::Ok),
        _ if line.starts_with("SERVER_ERROR") => Response::error(line),
        _ if line.starts_with("CLIENT_ERROR") => {
            Response { status: Some(Status::ClientError), msg: line.to_string(), ..Default::default() }
        }
        _ => Response::error(format!("unexpected response: {line}")),
    }
}

fn malformed(msg: &str) -> ProtocolError {
    ProtocolError::Malformed(msg.to_string())
}

/// Serializes a response for sending back to the client that issued `cmd`.
pub fn encode_response(cmd: Cmd, resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    match cmd {
        Cmd::Get | Cmd::Gets => {
            for (key, item) in &resp.items {
                if cmd == Cmd::Gets {
                    out.extend_from_slice(
                        format!("VALUE {} {} {} {}\r\n", key, item.flags, item.body.len(), item.cas)
                            .as_bytes(),
                    );
                } else {
                    out.extend_from_slice(
                        format!("VALUE {} {} {}\r\n", key, item.flags, item.body.len()).as_bytes(),
                    );
                }
                out.extend_from_slice(&item.body);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"END\r\n");
        }
        Cmd::Incr | Cmd::Decr => {
            if let Some(v) = resp.counter {
                out.extend_from_slice(format!("{v}\r\n").as_bytes());
            } else if let Some(status) = &resp.status {
                out.extend_from_slice(format!("{status}\r\n").as_bytes());
            }
        }
        Cmd::Stats => {
            out.extend_from_slice(resp.msg.as_bytes());
            out.extend_from_slice(b"END\r\n");
        }
        _ => {
            if let Some(status) = &resp.status {
                if status == &Status::ServerError && !resp.msg.is_empty() {
                    out.extend_from_slice(format!("SERVER_ERROR {}\r\n", resp.msg).as_bytes());
                } else {
                    out.extend_from_slice(format!("{status}\r\n").as_bytes());
                }
            }
        }
    }
    out
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    cmd: Cmd,
    resp: &Response,
) -> Result<(), ProtocolError> {
    let bytes = encode_response(cmd, resp);
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_get_request() {
        let mut buf = Cursor::new(b"get foo bar\r\n".to_vec());
        let req = read_request(&mut buf).await.unwrap().unwrap();
        assert_eq!(req.cmd, Cmd::Get);
        assert_eq!(req.keys, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn parses_set_request_with_payload() {
        let mut buf = Cursor::new(b"set foo 0 0 5\r\nhello\r\n".to_vec());
        let req = read_request(&mut buf).await.unwrap().unwrap();
        assert_eq!(req.cmd, Cmd::Set);
        assert_eq!(req.keys, vec!["foo"]);
        assert_eq!(req.item.unwrap().body.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn parses_noreply_set() {
        let mut buf = Cursor::new(b"set foo 0 0 1 noreply\r\nx\r\n".to_vec());
        let req = read_request(&mut buf).await.unwrap().unwrap();
        assert!(req.no_reply);
    }

    #[tokio::test]
    async fn parses_get_response_with_two_values() {
        let mut buf = Cursor::new(b"VALUE a 0 1\r\nx\r\nVALUE b 0 1\r\ny\r\nEND\r\n".to_vec());
        let resp = read_response(&mut buf, Cmd::Get).await.unwrap();
        assert_eq!(resp.items.len(), 2);
    }

    #[tokio::test]
    async fn parses_stored_response() {
        let mut buf = Cursor::new(b"STORED\r\n".to_vec());
        let resp = read_response(&mut buf, Cmd::Set).await.unwrap();
        assert_eq!(resp.status, Some(Status::Stored));
    }

    #[test]
    fn encodes_get_request() {
        let req = Request { cmd: Cmd::Get, keys: vec!["k".into()], item: None, delta: 0, no_reply: false };
        assert_eq!(encode_request(&req), b"get k\r\n");
    }

    #[test]
    fn encodes_set_request_with_body() {
        let req = Request {
            cmd: Cmd::Set,
            keys: vec!["k".into()],
            item: Some(Item { body: Bytes::from_static(b"v"), flags: 1, exptime: 0, cas: 0 }),
            delta: 0,
            no_reply: false,
        };
        assert_eq!(encode_request(&req), b"set k 1 0 1\r\nv\r\n");
    }

    #[test]
    fn encode_response_end_marker_on_miss() {
        let resp = Response { status: Some(Status::Value), ..Default::default() };
        assert_eq!(encode_response(Cmd::Get, &resp), b"END\r\n");
    }
}
