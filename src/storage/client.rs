//! The client-side handle capture/export/query processes use to talk to
//! the storage service: `OPEN`/`CLOSE`/`SEEK`/`REGION`/`INFORM` request-
//! reply over a blocking `UnixStream` (spec.md sections 4.2 and 6).
//!
//! A blocking `REGION` simply doesn't get its reply until the storage
//! process's scheduler wakes it (spec.md section 4.2, "park the client...
//! reply only when the writer crosses that offset"); from the client's
//! point of view this looks like an ordinary slow request-reply.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

use super::protocol::{ErrorCode, OpenMode, Reply, Request, SeekTarget};
use super::region::Region;

pub struct StorageClient {
    sock: UnixStream,
    pub client_id: u32,
}

impl StorageClient {
    pub fn connect(
        socket_path: impl AsRef<Path>,
        name: &str,
        mode: OpenMode,
        size_limit: u64,
    ) -> io::Result<(StorageClient, u64)> {
        let mut sock = UnixStream::connect(socket_path)?;
        Request::Open { name: name.to_string(), mode, size_limit }.write_to(&mut sock)?;
        match Reply::read_from(&mut sock)? {
            Reply::Opened { client_id, start_offset } => {
                Ok((StorageClient { sock, client_id }, start_offset))
            }
            Reply::Error { code } => Err(protocol_error(code)),
            _ => Err(unexpected_reply()),
        }
    }

    pub fn close(mut self, ending_offset: u64) -> io::Result<()> {
        Request::Close { client_id: self.client_id, ending_offset }.write_to(&mut self.sock)?;
        match Reply::read_from(&mut self.sock)? {
            Reply::Closed => Ok(()),
            Reply::Error { code } => Err(protocol_error(code)),
            _ => Err(unexpected_reply()),
        }
    }

    pub fn seek(&mut self, target: SeekTarget) -> io::Result<u64> {
        Request::Seek { client_id: self.client_id, target }.write_to(&mut self.sock)?;
        match Reply::read_from(&mut self.sock)? {
            Reply::Sought { offset } => Ok(offset),
            Reply::Error { code } if code == ErrorCode::NoData => {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more files"))
            }
            Reply::Error { code } => Err(protocol_error(code)),
            _ => Err(unexpected_reply()),
        }
    }

    /// Issues `REGION` and, on a grant, mmaps the named segment file
    /// locally. `None` means EOF (no data yet and no writer, or a
    /// non-blocking reader past the committed frontier).
    pub fn region(&mut self, offset: u64, size: u32) -> io::Result<Option<Region>> {
        Request::Region { client_id: self.client_id, offset, size }.write_to(&mut self.sock)?;
        match Reply::read_from(&mut self.sock)? {
            Reply::Region { path, in_file_offset, size, writable } => {
                let file = open_segment(&path, writable)?;
                Ok(Some(Region::map(&file, in_file_offset, size as usize, writable)?))
            }
            Reply::Eof => Ok(None),
            Reply::Error { code } => Err(protocol_error(code)),
            _ => Err(unexpected_reply()),
        }
    }

    pub fn inform(&mut self, offset: u64) -> io::Result<()> {
        Request::Inform { client_id: self.client_id, offset }.write_to(&mut self.sock)?;
        match Reply::read_from(&mut self.sock)? {
            Reply::Informed => Ok(()),
            Reply::Error { code } => Err(protocol_error(code)),
            _ => Err(unexpected_reply()),
        }
    }
}

fn open_segment(path: &str, writable: bool) -> io::Result<File> {
    if writable {
        OpenOptions::new().read(true).write(true).open(path)
    } else {
        File::open(path)
    }
}

fn protocol_error(code: ErrorCode) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("storage error: {:?}", code))
}

fn unexpected_reply() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "unexpected storage reply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::service::StorageService;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spawn_service(base_dir: &Path) -> (std::path::PathBuf, thread::JoinHandle<()>) {
        let sock_path = base_dir.join("como-storage.sock");
        let mut service = StorageService::bind(&sock_path, base_dir.join("streams")).unwrap();
        let path = sock_path.clone();
        let handle = thread::spawn(move || {
            let _ = service.run_for(Duration::from_millis(500));
        });
        (path, handle)
    }

    #[test]
    fn writer_then_reader_round_trip_over_the_socket() {
        let dir = tempdir().unwrap();
        let (sock_path, handle) = spawn_service(dir.path());
        thread::sleep(Duration::from_millis(50));

        let (mut writer, _) = StorageClient::connect(&sock_path, "pkts", OpenMode::Writer, 1 << 20).unwrap();
        let mut region = writer.region(0, 5).unwrap().unwrap();
        region.as_mut_slice().copy_from_slice(b"hello");
        drop(region);
        writer.inform(5).unwrap();

        let (mut reader, start) = StorageClient::connect(&sock_path, "pkts", OpenMode::ReaderNonBlock, 1 << 20).unwrap();
        assert_eq!(start, 0);
        let region = reader.region(0, 5).unwrap().unwrap();
        assert_eq!(region.as_slice(), b"hello");

        writer.close(5).unwrap();
        handle.join().unwrap();
    }
}
