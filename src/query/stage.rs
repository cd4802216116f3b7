//! The query process (spec.md section 4.5): a minimal HTTP server translating
//! `GET /<module>?start=..&end=..&format=..` into a storage-backed scan over
//! the module's persisted records, replayed through the module's own
//! `print`/`replay` or emitted raw.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use crate::module::{ModuleDescriptor, ModuleOps};
use crate::packet::Timestamp;
use crate::query::http::{read_request, write_response, HttpError, QueryRequest};
use crate::query::seek::scan_to_timestamp;
use crate::storage::{OpenMode, SeekTarget, StorageClient};

/// Bytes requested per `REGION` call while scanning (spec.md section 4.5
/// describes this as implementation-defined; large enough to amortize the
/// request/reply round trip without holding an oversized mapping).
const SCAN_WINDOW: u32 = 64 * 1024;

pub struct QueryStage {
    listener: TcpListener,
    storage_socket: PathBuf,
    modules: HashMap<String, Arc<ModuleDescriptor>>,
}

impl QueryStage {
    pub fn bind(addr: impl ToSocketAddrs, storage_socket: impl Into<PathBuf>) -> io::Result<QueryStage> {
        Ok(QueryStage {
            listener: TcpListener::bind(addr)?,
            storage_socket: storage_socket.into(),
            modules: HashMap::new(),
        })
    }

    pub fn register_module(&mut self, descriptor: Arc<ModuleDescriptor>) {
        self.modules.insert(descriptor.name.clone(), descriptor);
    }

    pub fn serve_one(&self) -> io::Result<()> {
        let (stream, _addr) = self.listener.accept()?;
        self.handle(stream)
    }

    fn handle(&self, mut stream: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let parsed = read_request(&mut reader)?;
        let req = match parsed {
            Ok(req) => req,
            Err(HttpError::BadMethod) => return write_response(&mut stream, 405, "text/plain", b"method not allowed"),
            Err(HttpError::BadRequest) => return write_response(&mut stream, 400, "text/plain", b"bad request"),
        };

        match self.dispatch(&req) {
            Ok((status, content_type, body)) => write_response(&mut stream, status, &content_type, &body),
            Err((status, msg)) => write_response(&mut stream, status, "text/plain", msg.as_bytes()),
        }
    }

    fn dispatch(&self, req: &QueryRequest) -> Result<(u16, String, Vec<u8>), (u16, String)> {
        let desc = self
            .modules
            .get(req.module())
            .ok_or_else(|| (404, format!("no such module: {}", req.module())))?;

        let start = parse_ts(req.param("start")).unwrap_or(Timestamp::ZERO);
        let end = parse_ts(req.param("end")).unwrap_or(Timestamp::new(u32::MAX, 0));
        if start > end {
            return Err((400, "start must not be after end".into()));
        }

        let format = req.param("format").unwrap_or("raw");
        if format != "raw" && format != "como" && !desc.ops.formats().contains(&format) {
            return Err((400, format!("unknown format: {}", format)));
        }

        let body = self
            .read_records(desc, start, end, format)
            .map_err(|e| (500, format!("storage error: {}", e)))?;

        let content_type = match format {
            "raw" | "como" => "application/octet-stream",
            _ => "text/plain",
        };
        Ok((200, content_type.to_string(), body))
    }

    /// Connects to storage as a non-blocking reader on the module's output
    /// stream, binary-searches to `start`, then walks forward window by
    /// window, recovering from sync loss by asking storage to seek to the
    /// start of the next file (spec.md section 4.5 steps 3-6).
    fn read_records(&self, desc: &ModuleDescriptor, start: Timestamp, end: Timestamp, format: &str) -> io::Result<Vec<u8>> {
        let (mut client, start_offset) =
            StorageClient::connect(&self.storage_socket, &desc.output_stream, OpenMode::ReaderNonBlock, u64::MAX)?;

        let ops = desc.ops.as_ref();
        let fmt_id = desc.ops.formats().iter().position(|f| *f == format);
        let mut fmt_state: Box<dyn Any + Send> = match fmt_id {
            Some(id) if format != "raw" && format != "como" => ops.init_format(id, ""),
            _ => Box::new(()),
        };

        let mut out = Vec::new();
        let mut offset = start_offset;
        let mut seeking_start = true;

        loop {
            let region = match client.region(offset, SCAN_WINDOW)? {
                Some(r) => r,
                None => break,
            };
            let buf = region.as_slice();
            if buf.is_empty() {
                break;
            }

            if seeking_start {
                match scan_to_timestamp(buf, start, ops) {
                    Some(found_at) => {
                        offset += found_at as u64;
                        seeking_start = false;
                        continue;
                    }
                    None => {
                        offset += buf.len() as u64;
                        continue;
                    }
                }
            }

            match scan_and_emit(buf, end, ops, format, fmt_id, &mut *fmt_state, &mut out) {
                ScanOutcome::Consumed(0) => break,
                ScanOutcome::Consumed(n) => offset += n as u64,
                ScanOutcome::PastEnd => break,
                ScanOutcome::SyncLost => match client.seek(SeekTarget::FileNext) {
                    Ok(next_offset) => offset = next_offset,
                    Err(_) => break,
                },
            }
        }

        if let Some(id) = fmt_id {
            if format != "raw" && format != "como" {
                ops.finish_format(id, fmt_state);
            }
        }
        Ok(out)
    }
}

enum ScanOutcome {
    Consumed(usize),
    PastEnd,
    SyncLost,
}

/// Walks one storage window, emitting each record in `format` until either
/// the window is exhausted, a record past `end` is reached, or `load`
/// fails mid-buffer (the `csgetrec` sync-loss case from spec.md section
/// 4.5 step 6, distinguished from "ran off the end of this window" by
/// having made no progress at all).
fn scan_and_emit(
    buf: &[u8],
    end: Timestamp,
    ops: &dyn ModuleOps,
    format: &str,
    fmt_id: Option<usize>,
    fmt_state: &mut dyn Any,
    out: &mut Vec<u8>,
) -> ScanOutcome {
    let mut pos = 0;
    while pos < buf.len() {
        match ops.load(&buf[pos..]) {
            None => {
                return if pos == 0 { ScanOutcome::SyncLost } else { ScanOutcome::Consumed(pos) };
            }
            Some((size, ts)) if size > 0 => {
                if ts > end {
                    return ScanOutcome::PastEnd;
                }
                let rec_buf = &buf[pos..pos + size];
                match format {
                    "raw" => out.extend_from_slice(rec_buf),
                    "como" => {
                        let mut replayed = Vec::new();
                        if ops.replay(rec_buf, &mut replayed, fmt_state).is_some() {
                            for pkt in &replayed {
                                pkt.encode_como(out);
                            }
                        }
                    }
                    _ => {
                        if let Some(id) = fmt_id {
                            if let Some(bytes) = ops.print(id, rec_buf, fmt_state) {
                                out.extend_from_slice(&bytes);
                            }
                        }
                    }
                }
                pos += size;
            }
            _ => return ScanOutcome::Consumed(pos),
        }
    }
    ScanOutcome::Consumed(pos)
}

fn parse_ts(param: Option<&str>) -> Option<Timestamp> {
    param.and_then(|s| s.parse::<u32>().ok()).map(|secs| Timestamp::new(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ts_reads_whole_seconds() {
        assert_eq!(parse_ts(Some("42")), Some(Timestamp::new(42, 0)));
        assert_eq!(parse_ts(Some("nope")), None);
        assert_eq!(parse_ts(None), None);
    }
}
