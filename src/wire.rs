//! Minimal HTTP/1.1 message framing for the API proxy
//!
//! Heads are kept as raw bytes next to the parsed `HeaderMap` so untouched
//! messages are forwarded exactly as they arrived, and rewritten ones only
//! lose the framing headers that no longer apply.
use crate::error::{Error, Result};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CR_LF: &[u8] = b"\r\n";
/// Upper bound for a request or response head
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Start line and headers of one HTTP message
#[derive(Debug, Clone)]
pub(crate) struct MessageHead {
  /// Start line without its terminator
  pub start_line: String,
  /// Header lines as received, terminators included
  lines: Vec<(HeaderName, Vec<u8>)>,
  /// Parsed headers
  pub headers: HeaderMap,
}

impl MessageHead {
  /// The head exactly as it was received
  pub fn to_bytes(&self) -> Vec<u8> {
    self.encode(&self.start_line, &[], &[])
  }

  /// Re-encode the head with a new start line, dropping and adding headers.
  pub fn encode(
    &self,
    start_line: &str,
    drop: &[HeaderName],
    add: &[(HeaderName, String)],
  ) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(CR_LF);
    for (name, line) in &self.lines {
      if !drop.contains(name) {
        out.extend_from_slice(line);
      }
    }
    for (name, value) in add {
      out.extend_from_slice(name.as_str().as_bytes());
      out.extend_from_slice(b": ");
      out.extend_from_slice(value.as_bytes());
      out.extend_from_slice(CR_LF);
    }
    out.extend_from_slice(CR_LF);
    out
  }

  /// Whether either side asked to close the connection after this message
  pub fn wants_close(&self) -> bool {
    self
      .headers
      .get_all(CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|token| token.trim().eq_ignore_ascii_case("close"))
  }

  /// `Content-Type` header value, if any
  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let colon = line
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::invalid_request("header line without colon"))?;
  let name = HeaderName::from_bytes(&line[..colon])
    .map_err(|e| Error::invalid_request(format!("invalid header name: {}", e)))?;
  let value = line[colon + 1..].trim_ascii();
  let value = HeaderValue::from_bytes(value)
    .map_err(|e| Error::invalid_request(format!("invalid header value: {}", e)))?;
  Ok((name, value))
}

/// Read one message head. `Ok(None)` means the peer closed cleanly first.
pub(crate) async fn read_head<R>(reader: &mut R) -> Result<Option<MessageHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut size = 0usize;
  let mut line = Vec::new();
  // tolerate stray empty lines between messages
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Ok(None);
    }
    size += n;
    if size > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("message head too large"));
    }
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let start_line = String::from_utf8_lossy(line.trim_ascii_end()).into_owned();

  let mut lines = Vec::new();
  let mut headers = HeaderMap::new();
  loop {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("connection closed inside message head"));
    }
    size += n;
    if size > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("message head too large"));
    }
    if line == CR_LF || line == b"\n" {
      break;
    }
    let (name, value) = parse_header_line(&line)?;
    headers.append(name.clone(), value);
    lines.push((name, line));
  }
  Ok(Some(MessageHead {
    start_line,
    lines,
    headers,
  }))
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  /// No body
  Empty,
  /// `Content-Length` bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Everything until the peer closes
  UntilClose,
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

/// Body framing of a request
pub(crate) fn request_framing(headers: &HeaderMap) -> BodyFraming {
  if is_chunked(headers) {
    return BodyFraming::Chunked;
  }
  match content_length(headers) {
    Some(0) | None => BodyFraming::Empty,
    Some(n) => BodyFraming::Length(n),
  }
}

/// Body framing of a response to a `method` request
pub(crate) fn response_framing(method: &Method, status: u16, headers: &HeaderMap) -> BodyFraming {
  if method == Method::HEAD || (100..200).contains(&status) || status == 204 || status == 304 {
    return BodyFraming::Empty;
  }
  if is_chunked(headers) {
    return BodyFraming::Chunked;
  }
  match content_length(headers) {
    Some(0) => BodyFraming::Empty,
    Some(n) => BodyFraming::Length(n),
    None => BodyFraming::UntilClose,
  }
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
  let line = line.trim_ascii();
  let digits = line.split(|b| *b == b';').next().unwrap_or_default();
  let digits = std::str::from_utf8(digits.trim_ascii())
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
  u64::from_str_radix(digits, 16)
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<()> {
  line.clear();
  if reader.read_until(b'\n', line).await? == 0 {
    return Err(io::Error::new(
      io::ErrorKind::UnexpectedEof,
      "connection closed inside chunked body",
    ));
  }
  Ok(())
}

/// Forward a body unchanged, flushing after every chunk so streamed output
/// (build progress, logs) reaches the client as it is produced.
pub(crate) async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> io::Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::Length(n) => {
      let copied = tokio::io::copy_buf(&mut (&mut *reader).take(n), writer).await?;
      if copied < n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended early"));
      }
    }
    BodyFraming::UntilClose => {
      let mut buf = vec![0u8; 16 * 1024];
      loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
          break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
      }
    }
    BodyFraming::Chunked => {
      let mut line = Vec::new();
      loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        let size = chunk_size(&line)?;
        if size == 0 {
          // trailers, then the terminating empty line
          loop {
            read_line(reader, &mut line).await?;
            writer.write_all(&line).await?;
            if line == CR_LF || line == b"\n" {
              break;
            }
          }
          break;
        }
        let copied = tokio::io::copy_buf(&mut (&mut *reader).take(size + 2), writer).await?;
        if copied < size + 2 {
          return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunk ended early"));
        }
        writer.flush().await?;
      }
    }
  }
  writer.flush().await
}

/// Read a whole body into memory, undoing chunked encoding.
///
/// When `raw` is given, the body bytes exactly as received are appended to it.
pub(crate) async fn read_body<R>(
  reader: &mut R,
  framing: BodyFraming,
  mut raw: Option<&mut Vec<u8>>,
) -> io::Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  match framing {
    BodyFraming::Empty => {}
    BodyFraming::Length(n) => {
      (&mut *reader).take(n).read_to_end(&mut body).await?;
      if (body.len() as u64) < n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended early"));
      }
    }
    BodyFraming::UntilClose => {
      reader.read_to_end(&mut body).await?;
    }
    BodyFraming::Chunked => {
      let mut line = Vec::new();
      let mut raw_copy = Vec::new();
      loop {
        read_line(reader, &mut line).await?;
        raw_copy.extend_from_slice(&line);
        let size = chunk_size(&line)?;
        if size == 0 {
          loop {
            read_line(reader, &mut line).await?;
            raw_copy.extend_from_slice(&line);
            if line == CR_LF || line == b"\n" {
              break;
            }
          }
          break;
        }
        let start = body.len();
        (&mut *reader).take(size).read_to_end(&mut body).await?;
        if ((body.len() - start) as u64) < size {
          return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunk ended early"));
        }
        raw_copy.extend_from_slice(&body[start..]);
        read_line(reader, &mut line).await?;
        raw_copy.extend_from_slice(&line);
      }
      if let Some(raw) = raw.take() {
        raw.extend_from_slice(&raw_copy);
      }
      return Ok(body);
    }
  }
  if let Some(raw) = raw.take() {
    raw.extend_from_slice(&body);
  }
  Ok(body)
}
