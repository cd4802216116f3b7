//! The storage engine: the request-handling and scheduling logic behind
//! `OPEN`/`CLOSE`/`SEEK`/`REGION`/`INFORM`, independent of the socket
//! transport so it can be driven directly in tests and from
//! `como-storage`'s `mio` event loop alike (spec.md section 4.2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::bytestream::Bytestream;
use super::protocol::{ErrorCode, OpenMode, SeekTarget};

const MAX_CLIENTS: usize = 4096;
const DEFAULT_PER_FILE_MAX: u64 = 64 * 1024 * 1024;
const EVICT_HEADROOM_PCT: u64 = 20;

pub struct ClientState {
    pub stream: String,
    pub mode: OpenMode,
    pub offset: u64,
    pub last_active: Instant,
}

/// Outcome of a `REGION` request, separated from the actual mmap so the
/// engine stays transport- and syscall-agnostic; the caller turns
/// `Granted` into a real `Region` via the returned file path.
pub enum RegionOutcome {
    Granted { file_path: PathBuf, in_file_offset: u64, size: u32, writable: bool },
    Eof,
    /// Blocking reader parked past the committed frontier; the caller
    /// must retry this request when `inform` reports a wake for this
    /// client id.
    Blocked,
    Error(ErrorCode),
}

pub struct StorageEngine {
    base_dir: PathBuf,
    streams: HashMap<String, Bytestream>,
    clients: HashMap<u32, ClientState>,
    next_client_id: u32,
    /// stream name -> (client_id, requested offset, requested size)
    blocked: HashMap<String, Vec<(u32, u64, u32)>>,
    idle_timeout: Duration,
}

impl StorageEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> StorageEngine {
        StorageEngine {
            base_dir: base_dir.into(),
            streams: HashMap::new(),
            clients: HashMap::new(),
            next_client_id: 1,
            blocked: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    fn stream_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn open(&mut self, name: &str, mode: OpenMode, size_limit: u64) -> Result<(u32, u64), ErrorCode> {
        if self.clients.len() >= MAX_CLIENTS {
            return Err(ErrorCode::TooManyFiles);
        }

        let is_writer = mode == OpenMode::Writer;
        if is_writer {
            if let Some(bs) = self.streams.get(name) {
                if bs.has_writer {
                    return Err(ErrorCode::Perm);
                }
            }
        }

        let dir = self.stream_dir(name);
        if !self.streams.contains_key(name) {
            let bs = Bytestream::open(&dir, is_writer, DEFAULT_PER_FILE_MAX, size_limit)
                .map_err(|_| ErrorCode::Invalid)?;
            self.streams.insert(name.to_string(), bs);
        } else if is_writer {
            let bs = self.streams.get_mut(name).unwrap();
            bs.has_writer = true;
        }

        let bs = self.streams.get(name).unwrap();
        let start_offset = if is_writer {
            bs.writer_offset()
        } else {
            bs.first_offset().unwrap_or(0)
        };

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            client_id,
            ClientState {
                stream: name.to_string(),
                mode,
                offset: start_offset,
                last_active: Instant::now(),
            },
        );

        Ok((client_id, start_offset))
    }

    fn client_mut(&mut self, client_id: u32) -> Result<&mut ClientState, ErrorCode> {
        self.clients.get_mut(&client_id).ok_or(ErrorCode::BadFd)
    }

    pub fn close(&mut self, client_id: u32, ending_offset: u64) -> Result<(), ErrorCode> {
        let client = self.clients.remove(&client_id).ok_or(ErrorCode::BadFd)?;
        if client.mode == OpenMode::Writer {
            let bs = self.streams.get_mut(&client.stream).ok_or(ErrorCode::Invalid)?;
            bs.inform(ending_offset).ok();
            bs.close_writer().map_err(|_| ErrorCode::Invalid)?;
        }
        for clients in self.blocked.values_mut() {
            clients.retain(|(id, _, _)| *id != client_id);
        }
        Ok(())
    }

    pub fn seek(&mut self, client_id: u32, target: SeekTarget) -> Result<u64, ErrorCode> {
        let client = self.client_mut(client_id)?;
        if client.mode == OpenMode::Writer {
            return Err(ErrorCode::Invalid);
        }
        let stream_name = client.stream.clone();
        let bs = self.streams.get(&stream_name).ok_or(ErrorCode::Invalid)?;

        let new_offset = match target {
            SeekTarget::Offset(o) => o,
            SeekTarget::FileNext => {
                let cur = self.clients[&client_id].offset;
                bs.files
                    .iter()
                    .find(|f| f.start > cur)
                    .map(|f| f.start)
                    .ok_or(ErrorCode::NoData)?
            }
            SeekTarget::FilePrev => {
                let cur = self.clients[&client_id].offset;
                bs.files
                    .iter()
                    .rev()
                    .find(|f| f.start < cur)
                    .map(|f| f.start)
                    .ok_or(ErrorCode::NoData)?
            }
        };

        self.clients.get_mut(&client_id).unwrap().offset = new_offset;
        self.clients.get_mut(&client_id).unwrap().last_active = Instant::now();
        Ok(new_offset)
    }

    pub fn region(&mut self, client_id: u32, offset: u64, size: u32) -> RegionOutcome {
        let client = match self.clients.get_mut(&client_id) {
            Some(c) => c,
            None => return RegionOutcome::Error(ErrorCode::BadFd),
        };
        client.last_active = Instant::now();
        let stream_name = client.stream.clone();
        let mode = client.mode;

        let bs = match self.streams.get_mut(&stream_name) {
            Some(bs) => bs,
            None => return RegionOutcome::Error(ErrorCode::Invalid),
        };

        if mode == OpenMode::Writer {
            return match bs.writer_region(offset, size as usize) {
                Ok((path, in_file_offset)) => {
                    self.clients.get_mut(&client_id).unwrap().offset = offset + size as u64;
                    RegionOutcome::Granted { file_path: path, in_file_offset, size, writable: true }
                }
                Err(code) => RegionOutcome::Error(code),
            };
        }

        // Reader.
        if bs.files.is_empty() && !bs.has_writer {
            return RegionOutcome::Eof;
        }
        if let Some(first) = bs.first_offset() {
            if offset < first {
                return RegionOutcome::Error(ErrorCode::NoData);
            }
        }

        let committed_end = bs.writer_offset().max(bs.committed_size());
        if offset >= committed_end {
            if bs.has_writer {
                if mode == OpenMode::Reader {
                    self.blocked.entry(stream_name).or_default().push((client_id, offset, size));
                    return RegionOutcome::Blocked;
                }
                return RegionOutcome::Eof;
            }
            return RegionOutcome::Eof;
        }

        let file = match bs.file_covering(offset) {
            Some(f) => f,
            None => return RegionOutcome::Error(ErrorCode::NoData),
        };
        let in_file_offset = offset - file.start;
        let available = file.committed_len - in_file_offset;
        let clipped = (size as u64).min(available) as u32;
        let path = bs.reader_path_for(file.start);

        self.clients.get_mut(&client_id).unwrap().offset = offset + clipped as u64;
        RegionOutcome::Granted { file_path: path, in_file_offset, size: clipped, writable: false }
    }

    /// `S_INFORM`: commits `offset` and returns the client ids of any
    /// blocked readers that should now retry their parked `REGION`.
    pub fn inform(&mut self, client_id: u32, offset: u64) -> Result<Vec<u32>, ErrorCode> {
        let stream_name = {
            let client = self.client_mut(client_id)?;
            if client.mode != OpenMode::Writer {
                return Err(ErrorCode::Invalid);
            }
            client.last_active = Instant::now();
            client.stream.clone()
        };
        let bs = self.streams.get_mut(&stream_name).ok_or(ErrorCode::Invalid)?;
        bs.inform(offset)?;

        let woken = self.blocked.remove(&stream_name).unwrap_or_default();
        Ok(woken.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Re-attempts a previously blocked `REGION` for `client_id`. Returns
    /// `None` if the client is no longer known (closed while parked).
    pub fn retry_blocked(&mut self, client_id: u32, offset: u64, size: u32) -> Option<RegionOutcome> {
        if !self.clients.contains_key(&client_id) {
            return None;
        }
        Some(self.region(client_id, offset, size))
    }

    /// The scheduler sweep (spec.md section 4.2): close idle bytestreams,
    /// evict over-limit files, and reap clients past their idle timeout.
    /// Step 1 (munmap queued write regions) is the caller's
    /// responsibility since regions are owned by the transport layer, not
    /// the engine.
    pub fn tick(&mut self) -> Vec<u32> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        self.clients.retain(|id, c| {
            let alive = now.duration_since(c.last_active) < self.idle_timeout;
            if !alive {
                reaped.push(*id);
            }
            alive
        });

        let active_streams: std::collections::HashSet<String> =
            self.clients.values().map(|c| c.stream.clone()).collect();

        let over_limit: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, bs)| bs.size_limit > 0 && bs.committed_size() > bs.size_limit)
            .map(|(name, _)| name.clone())
            .collect();
        for name in over_limit {
            self.evict_if_over_limit(&name);
        }

        let mut to_close = Vec::new();
        for (name, bs) in self.streams.iter() {
            if !active_streams.contains(name) && !bs.has_writer {
                to_close.push(name.clone());
            }
        }
        for name in to_close {
            self.streams.remove(&name);
        }

        reaped
    }

    /// Evicts the oldest file of `stream` if it exceeds its size limit and
    /// has no active readers on it (scheduler step 2).
    pub fn evict_if_over_limit(&mut self, stream: &str) {
        let readers_on_oldest = {
            let bs = match self.streams.get(stream) {
                Some(bs) => bs,
                None => return,
            };
            if bs.size_limit == 0 || bs.committed_size() <= bs.size_limit {
                return;
            }
            let oldest_start = match bs.first_offset() {
                Some(s) => s,
                None => return,
            };
            let oldest_end = bs.files.first().map(|f| f.start + f.committed_len).unwrap_or(0);
            self.clients
                .values()
                .any(|c| c.stream == stream && c.mode != OpenMode::Writer && c.offset >= oldest_start && c.offset < oldest_end)
        };

        if readers_on_oldest {
            let over_by_pct = {
                let bs = self.streams.get(stream).unwrap();
                let excess = bs.committed_size().saturating_sub(bs.size_limit);
                excess * 100 / bs.size_limit.max(1) >= EVICT_HEADROOM_PCT
            };
            if over_by_pct {
                self.clients.retain(|_, c| {
                    !(c.stream == stream && c.mode != OpenMode::Writer)
                });
            } else {
                return;
            }
        }

        if let Some(bs) = self.streams.get_mut(stream) {
            let _ = bs.evict_oldest();
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> StorageEngine {
        StorageEngine::new(dir)
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let (a, _) = eng.open("x", OpenMode::Writer, 1 << 20).unwrap();
        let err = eng.open("x", OpenMode::Writer, 1 << 20).unwrap_err();
        assert_eq!(err, ErrorCode::Perm);
        eng.close(a, 0).unwrap();
        // After the writer closes, a new writer is allowed.
        assert!(eng.open("x", OpenMode::Writer, 1 << 20).is_ok());
    }

    #[test]
    fn blocking_reader_is_woken_by_inform() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let (w, _) = eng.open("x", OpenMode::Writer, 1 << 20).unwrap();
        let (r, start) = eng.open("x", OpenMode::Reader, 1 << 20).unwrap();
        assert_eq!(start, 0);

        match eng.region(r, 0, 4096) {
            RegionOutcome::Blocked => {}
            _ => panic!("expected reader to block with no committed data yet"),
        }

        match eng.region(w, 0, 1024) {
            RegionOutcome::Granted { .. } => {}
            _ => panic!("writer region should be granted"),
        }
        let woken = eng.inform(w, 1024).unwrap();
        assert_eq!(woken, vec![r]);

        match eng.retry_blocked(r, 0, 4096).unwrap() {
            RegionOutcome::Granted { size, .. } => assert_eq!(size, 1024),
            _ => panic!("retry should now be granted"),
        }
    }

    #[test]
    fn nonblocking_reader_gets_eof_not_blocked() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let (_w, _) = eng.open("x", OpenMode::Writer, 1 << 20).unwrap();
        let (r, _) = eng.open("x", OpenMode::ReaderNonBlock, 1 << 20).unwrap();
        match eng.region(r, 0, 4096) {
            RegionOutcome::Eof => {}
            _ => panic!("non-blocking reader past the frontier must see EOF"),
        }
    }

    #[test]
    fn reader_past_end_of_closed_writer_gets_eof() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let (w, _) = eng.open("x", OpenMode::Writer, 1 << 20).unwrap();
        eng.region(w, 0, 100).unwrap();
        eng.inform(w, 100).unwrap();
        eng.close(w, 100).unwrap();

        let (r, _) = eng.open("x", OpenMode::Reader, 1 << 20).unwrap();
        match eng.region(r, 999_999, 10) {
            RegionOutcome::Eof => {}
            _ => panic!("expected EOF once the writer is gone and offset is past the end"),
        }
    }

    #[test]
    fn reader_offset_before_first_file_start_gets_nodata() {
        let dir = tempdir().unwrap();
        let mut eng = engine(dir.path());
        let (w, _) = eng.open("x", OpenMode::Writer, 1 << 20).unwrap();
        eng.region(w, 0, 64).unwrap();
        eng.inform(w, 64).unwrap();
        eng.evict_if_over_limit("x"); // no-op, size_limit is generous here
        eng.streams.get_mut("x").unwrap().files[0].start = 32; // simulate pruning
        let (r, _) = eng.open("x", OpenMode::Reader, 1 << 20).unwrap();
        match eng.region(r, 0, 10) {
            RegionOutcome::Error(ErrorCode::NoData) => {}
            _ => panic!("offset before the oldest retained file must be rejected"),
        }
    }
}
