//! The query stage's request surface (spec.md section 4.5): a minimal
//! hand-rolled HTTP/1.0 `GET` parser. No keep-alive, no chunked bodies, no
//! request bodies at all -- every request this stage serves is a single
//! idempotent `GET /<module>?start=..&end=..&format=..`.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub path: String,
    pub params: HashMap<String, String>,
}

impl QueryRequest {
    /// The module name, with the leading `/` stripped.
    pub fn module(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    BadMethod,
    BadRequest,
}

/// Reads and parses one request line plus headers (discarded, since this
/// stage needs none of them), stopping at the blank line per HTTP/1.0.
pub fn read_request(reader: &mut impl BufRead) -> io::Result<Result<QueryRequest, HttpError>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(Err(HttpError::BadRequest));
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        if header_line.trim_end().is_empty() {
            break;
        }
    }

    if method != "GET" {
        return Ok(Err(HttpError::BadMethod));
    }
    match parse_target(target) {
        Some(req) => Ok(Ok(req)),
        None => Ok(Err(HttpError::BadRequest)),
    }
}

fn parse_target(target: &str) -> Option<QueryRequest> {
    if target.is_empty() {
        return None;
    }
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    if !path.starts_with('/') {
        return None;
    }
    let mut params = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(urldecode(k), urldecode(v));
        }
    }
    Some(QueryRequest { path: urldecode(path), params })
}

/// `application/x-www-form-urlencoded`-style decoding: `+` becomes space,
/// `%XX` becomes the byte it encodes. A malformed escape passes through
/// literally rather than failing the whole request.
fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

pub fn write_response(w: &mut impl Write, status: u16, content_type: &str, body: &[u8]) -> io::Result<()> {
    write!(w, "HTTP/1.0 {} {}\r\n", status, reason_phrase(status))?;
    write!(w, "Content-Type: {}\r\n", content_type)?;
    write!(w, "Content-Length: {}\r\n", body.len())?;
    write!(w, "Connection: close\r\n\r\n")?;
    w.write_all(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_path_and_query_params() {
        let raw = "GET /counter?start=10&end=20&format=raw HTTP/1.0\r\n\r\n";
        let mut cursor = Cursor::new(raw.as_bytes());
        let req = read_request(&mut cursor).unwrap().unwrap();
        assert_eq!(req.module(), "counter");
        assert_eq!(req.param("start"), Some("10"));
        assert_eq!(req.param("format"), Some("raw"));
    }

    #[test]
    fn rejects_non_get_method() {
        let raw = "POST /counter HTTP/1.0\r\n\r\n";
        let mut cursor = Cursor::new(raw.as_bytes());
        let err = read_request(&mut cursor).unwrap().unwrap_err();
        assert_eq!(err, HttpError::BadMethod);
    }

    #[test]
    fn urldecode_handles_plus_and_percent_escapes() {
        assert_eq!(urldecode("a+b%2Fc"), "a b/c");
    }
}
