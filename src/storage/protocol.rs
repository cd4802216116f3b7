//! Storage's own wire protocol: `S_OPEN`/`S_CLOSE`/`S_SEEK`/`S_REGION`/
//! `S_INFORM`, plus `IPC_ACK`/`IPC_ERROR` replies (spec.md sections 4.2
//! and 6). Each client operation is request-reply, `{op, client_id,
//! offset, size, name, arg}`.

use std::io::{self, Read, Write};

/// The error taxonomy from spec.md section 4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Too many clients or streams.
    TooManyFiles = 1,
    /// Second writer on an existing stream.
    Perm = 2,
    /// Bad offset / overwrite / gap / seek-by-writer / bad client id.
    Invalid = 3,
    /// Seek or region request is out of the stream's range.
    NoData = 4,
    /// Operation on an already-closed client.
    BadFd = 5,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<ErrorCode> {
        use ErrorCode::*;
        Some(match v {
            1 => TooManyFiles,
            2 => Perm,
            3 => Invalid,
            4 => NoData,
            5 => BadFd,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Writer,
    Reader,
    ReaderNonBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Offset(u64),
    FileNext,
    FilePrev,
}

#[derive(Debug, Clone)]
pub enum Request {
    Open {
        name: String,
        mode: OpenMode,
        size_limit: u64,
    },
    Close {
        client_id: u32,
        ending_offset: u64,
    },
    Seek {
        client_id: u32,
        target: SeekTarget,
    },
    Region {
        client_id: u32,
        offset: u64,
        size: u32,
    },
    Inform {
        client_id: u32,
        offset: u64,
    },
}

#[derive(Debug, Clone)]
pub enum Reply {
    Opened { client_id: u32, start_offset: u64 },
    Closed,
    Sought { offset: u64 },
    /// `path` names the on-disk segment file (storage remains the only
    /// process that ever creates, extends or truncates it); `in_file_offset`
    /// is where the caller's window starts within that file. The peer maps
    /// it itself with `storage::region::Region::map`.
    Region {
        path: String,
        in_file_offset: u64,
        size: u32,
        writable: bool,
    },
    Eof,
    Informed,
    Error { code: ErrorCode },
}

const OP_OPEN: u8 = 1;
const OP_CLOSE: u8 = 2;
const OP_SEEK: u8 = 3;
const OP_REGION: u8 = 4;
const OP_INFORM: u8 = 5;

const REPLY_OPENED: u8 = 1;
const REPLY_CLOSED: u8 = 2;
const REPLY_SOUGHT: u8 = 3;
const REPLY_REGION: u8 = 4;
const REPLY_EOF: u8 = 5;
const REPLY_INFORMED: u8 = 6;
const REPLY_ERROR: u8 = 7;

const MODE_WRITER: u8 = 0;
const MODE_READER: u8 = 1;
const MODE_READER_NONBLOCK: u8 = 2;

const SEEK_OFFSET: u8 = 0;
const SEEK_NEXT: u8 = 1;
const SEEK_PREV: u8 = 2;

impl Request {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        let op = match self {
            Request::Open { name, mode, size_limit } => {
                body.push(match mode {
                    OpenMode::Writer => MODE_WRITER,
                    OpenMode::Reader => MODE_READER,
                    OpenMode::ReaderNonBlock => MODE_READER_NONBLOCK,
                });
                body.extend_from_slice(&size_limit.to_be_bytes());
                body.extend_from_slice(&(name.len() as u32).to_be_bytes());
                body.extend_from_slice(name.as_bytes());
                OP_OPEN
            }
            Request::Close { client_id, ending_offset } => {
                body.extend_from_slice(&client_id.to_be_bytes());
                body.extend_from_slice(&ending_offset.to_be_bytes());
                OP_CLOSE
            }
            Request::Seek { client_id, target } => {
                body.extend_from_slice(&client_id.to_be_bytes());
                match target {
                    SeekTarget::Offset(o) => {
                        body.push(SEEK_OFFSET);
                        body.extend_from_slice(&o.to_be_bytes());
                    }
                    SeekTarget::FileNext => {
                        body.push(SEEK_NEXT);
                        body.extend_from_slice(&0u64.to_be_bytes());
                    }
                    SeekTarget::FilePrev => {
                        body.push(SEEK_PREV);
                        body.extend_from_slice(&0u64.to_be_bytes());
                    }
                }
                OP_SEEK
            }
            Request::Region { client_id, offset, size } => {
                body.extend_from_slice(&client_id.to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(&size.to_be_bytes());
                OP_REGION
            }
            Request::Inform { client_id, offset } => {
                body.extend_from_slice(&client_id.to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                OP_INFORM
            }
        };
        write_frame(w, op, &body)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Request> {
        let (op, body) = read_frame(r)?;
        Request::decode(op, &body)
    }

    /// Non-blocking counterpart of `read_from`: parses one frame out of an
    /// accumulating byte buffer (e.g. `mio`'s non-blocking socket reads),
    /// returning `None` if the buffer doesn't yet hold a full frame.
    /// Callers drain the first `consumed` bytes of `buf` on `Some`.
    pub fn try_parse(buf: &[u8]) -> io::Result<Option<(Request, usize)>> {
        match try_read_frame(buf) {
            Some((op, body, consumed)) => Ok(Some((Request::decode(op, body)?, consumed))),
            None => Ok(None),
        }
    }

    fn decode(op: u8, body: &[u8]) -> io::Result<Request> {
        let mut pos = 0usize;
        Ok(match op {
            OP_OPEN => {
                let mode = match take(&body, &mut pos, 1)?[0] {
                    MODE_WRITER => OpenMode::Writer,
                    MODE_READER => OpenMode::Reader,
                    _ => OpenMode::ReaderNonBlock,
                };
                let size_limit = read_u64(&body, &mut pos)?;
                let len = read_u32(&body, &mut pos)? as usize;
                let name = String::from_utf8(take(&body, &mut pos, len)?.to_vec())
                    .map_err(|_| bad_utf8())?;
                Request::Open { name, mode, size_limit }
            }
            OP_CLOSE => Request::Close {
                client_id: read_u32(&body, &mut pos)?,
                ending_offset: read_u64(&body, &mut pos)?,
            },
            OP_SEEK => {
                let client_id = read_u32(&body, &mut pos)?;
                let kind = take(&body, &mut pos, 1)?[0];
                let arg = read_u64(&body, &mut pos)?;
                let target = match kind {
                    SEEK_NEXT => SeekTarget::FileNext,
                    SEEK_PREV => SeekTarget::FilePrev,
                    _ => SeekTarget::Offset(arg),
                };
                Request::Seek { client_id, target }
            }
            OP_REGION => Request::Region {
                client_id: read_u32(&body, &mut pos)?,
                offset: read_u64(&body, &mut pos)?,
                size: read_u32(&body, &mut pos)?,
            },
            OP_INFORM => Request::Inform {
                client_id: read_u32(&body, &mut pos)?,
                offset: read_u64(&body, &mut pos)?,
            },
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown storage op")),
        })
    }
}

impl Reply {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let mut body = Vec::new();
        let op = match self {
            Reply::Opened { client_id, start_offset } => {
                body.extend_from_slice(&client_id.to_be_bytes());
                body.extend_from_slice(&start_offset.to_be_bytes());
                REPLY_OPENED
            }
            Reply::Closed => REPLY_CLOSED,
            Reply::Sought { offset } => {
                body.extend_from_slice(&offset.to_be_bytes());
                REPLY_SOUGHT
            }
            Reply::Region { path, in_file_offset, size, writable } => {
                body.push(*writable as u8);
                body.extend_from_slice(&in_file_offset.to_be_bytes());
                body.extend_from_slice(&size.to_be_bytes());
                body.extend_from_slice(&(path.len() as u32).to_be_bytes());
                body.extend_from_slice(path.as_bytes());
                REPLY_REGION
            }
            Reply::Eof => REPLY_EOF,
            Reply::Informed => REPLY_INFORMED,
            Reply::Error { code } => {
                body.push(*code as u8);
                REPLY_ERROR
            }
        };
        write_frame(w, op, &body)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<Reply> {
        let (op, body) = read_frame(r)?;
        Reply::decode(op, &body)
    }

    /// Non-blocking counterpart of `read_from`, mirroring `Request::try_parse`.
    pub fn try_parse(buf: &[u8]) -> io::Result<Option<(Reply, usize)>> {
        match try_read_frame(buf) {
            Some((op, body, consumed)) => Ok(Some((Reply::decode(op, body)?, consumed))),
            None => Ok(None),
        }
    }

    fn decode(op: u8, body: &[u8]) -> io::Result<Reply> {
        let mut pos = 0usize;
        Ok(match op {
            REPLY_OPENED => Reply::Opened {
                client_id: read_u32(&body, &mut pos)?,
                start_offset: read_u64(&body, &mut pos)?,
            },
            REPLY_CLOSED => Reply::Closed,
            REPLY_SOUGHT => Reply::Sought { offset: read_u64(&body, &mut pos)? },
            REPLY_REGION => {
                let writable = take(&body, &mut pos, 1)?[0] != 0;
                let in_file_offset = read_u64(&body, &mut pos)?;
                let size = read_u32(&body, &mut pos)?;
                let len = read_u32(&body, &mut pos)? as usize;
                let path = String::from_utf8(take(&body, &mut pos, len)?.to_vec())
                    .map_err(|_| bad_utf8())?;
                Reply::Region { path, in_file_offset, size, writable }
            }
            REPLY_EOF => Reply::Eof,
            REPLY_INFORMED => Reply::Informed,
            REPLY_ERROR => Reply::Error {
                code: ErrorCode::from_u8(take(&body, &mut pos, 1)?[0])
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown error code"))?,
            },
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown storage reply")),
        })
    }
}

fn bad_utf8() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "bad utf8")
}

fn write_frame(w: &mut impl Write, op: u8, body: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(op);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    w.write_all(&frame)
}

fn read_frame(r: &mut impl Read) -> io::Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 5];
    r.read_exact(&mut head)?;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok((head[0], body))
}

/// Parses a frame out of an in-memory buffer without consuming from it,
/// returning `(op, body, total_frame_len)` so the caller can drain exactly
/// that many bytes once it commits to the parse.
fn try_read_frame(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
    if buf.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < 5 + len {
        return None;
    }
    Some((buf[0], &buf[5..5 + len], 5 + len))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> io::Result<u32> {
    Ok(u32::from_be_bytes(take(buf, pos, 4)?.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> io::Result<u64> {
    Ok(u64::from_be_bytes(take(buf, pos, 8)?.try_into().unwrap()))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> io::Result<&'a [u8]> {
    if *pos + len > buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated storage message"));
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_round_trips() {
        let req = Request::Open {
            name: "counter_stream".into(),
            mode: OpenMode::Reader,
            size_limit: 1 << 20,
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();
        let decoded = Request::read_from(&mut &buf[..]).unwrap();
        match decoded {
            Request::Open { name, mode, size_limit } => {
                assert_eq!(name, "counter_stream");
                assert_eq!(mode, OpenMode::Reader);
                assert_eq!(size_limit, 1 << 20);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn region_reply_round_trips_path() {
        let reply = Reply::Region {
            path: "/tmp/s/0000000000000000".into(),
            in_file_offset: 4096,
            size: 1024,
            writable: true,
        };
        let mut buf = Vec::new();
        reply.write_to(&mut buf).unwrap();
        let decoded = Reply::read_from(&mut &buf[..]).unwrap();
        match decoded {
            Reply::Region { path, in_file_offset, size, writable } => {
                assert_eq!(path, "/tmp/s/0000000000000000");
                assert_eq!(in_file_offset, 4096);
                assert_eq!(size, 1024);
                assert!(writable);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn try_parse_waits_for_a_full_frame() {
        let req = Request::Inform { client_id: 7, offset: 99 };
        let mut buf = Vec::new();
        req.write_to(&mut buf).unwrap();

        assert!(Request::try_parse(&buf[..buf.len() - 1]).unwrap().is_none());
        let (parsed, consumed) = Request::try_parse(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        match parsed {
            Request::Inform { client_id, offset } => {
                assert_eq!(client_id, 7);
                assert_eq!(offset, 99);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_reply_round_trips() {
        let reply = Reply::Error { code: ErrorCode::Perm };
        let mut buf = Vec::new();
        reply.write_to(&mut buf).unwrap();
        let decoded = Reply::read_from(&mut &buf[..]).unwrap();
        match decoded {
            Reply::Error { code } => assert_eq!(code, ErrorCode::Perm),
            _ => panic!("wrong variant"),
        }
    }
}
