//! The storage process's accept/event loop: a single-threaded `mio`-driven
//! server fielding `OPEN`/`CLOSE`/`SEEK`/`REGION`/`INFORM` over `UnixStream`
//! connections (spec.md sections 2, 4.2 and 6). The direct structural
//! descendant of the teacher crate's `Evented`-registration pattern for its
//! perf fd, modernized to `mio` 0.8's `Registry`/`Interest` API.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use super::engine::{RegionOutcome, StorageEngine};
use super::protocol::{Reply, Request};
use super::scheduler::WriteBuffer;

const LISTENER: Token = Token(0);
const TICK_INTERVAL: Duration = Duration::from_millis(5200);
/// Initial capacity for a connection's read buffer; `BytesMut` grows past
/// this on demand, same as the teacher's own `bytes`-backed framing.
const READ_BUF_CAPACITY: usize = 4096;

struct Conn {
    stream: UnixStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    client_id: Option<u32>,
}

pub struct StorageService {
    listener: UnixListener,
    poll: Poll,
    events: Events,
    conns: HashMap<Token, Conn>,
    client_tokens: HashMap<u32, Token>,
    /// Offset/size of a client's `REGION` request that came back `Blocked`,
    /// kept here (not in the engine) so a later `INFORM` wake can replay it.
    blocked_requests: HashMap<u32, (u64, u32)>,
    engine: StorageEngine,
    write_buffer: WriteBuffer,
    next_token: usize,
}

impl StorageService {
    pub fn bind(socket_path: impl AsRef<Path>, streams_dir: impl Into<PathBuf>) -> io::Result<StorageService> {
        let path = socket_path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let mut listener = UnixListener::bind(path)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(StorageService {
            listener,
            poll,
            events: Events::with_capacity(256),
            conns: HashMap::new(),
            client_tokens: HashMap::new(),
            blocked_requests: HashMap::new(),
            engine: StorageEngine::new(streams_dir.into()),
            write_buffer: WriteBuffer::new(),
            next_token: 1,
        })
    }

    /// Drives the event loop until `deadline` elapses, running a scheduler
    /// tick (spec.md section 4.2: "on an idle tick and on any operation
    /// that changes state") at least once at the end.
    pub fn run_for(&mut self, deadline: Duration) -> io::Result<()> {
        let start = Instant::now();
        let mut last_tick = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                break;
            }
            let remaining = deadline - elapsed;
            let poll_timeout = remaining.min(TICK_INTERVAL);
            self.poll.poll(&mut self.events, Some(poll_timeout))?;

            let events: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in events {
                if token == LISTENER {
                    self.accept_loop()?;
                } else {
                    self.readable(token);
                }
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.run_tick();
                last_tick = Instant::now();
            }
        }
        self.run_tick();
        Ok(())
    }

    fn run_tick(&mut self) {
        let reaped = self.write_buffer.tick(&mut self.engine);
        for client_id in reaped {
            self.blocked_requests.remove(&client_id);
            if let Some(token) = self.client_tokens.remove(&client_id) {
                self.conns.remove(&token);
            }
        }
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(&mut stream, token, Interest::READABLE)?;
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
                            write_buf: Vec::new(),
                            client_id: None,
                        },
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn readable(&mut self, token: Token) {
        let mut closed = false;
        {
            let conn = match self.conns.get_mut(&token) {
                Some(c) => c,
                None => return,
            };
            let mut chunk = [0u8; 4096];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        loop {
            let parsed = {
                let conn = match self.conns.get(&token) {
                    Some(c) => c,
                    None => return,
                };
                Request::try_parse(&conn.read_buf)
            };
            match parsed {
                Ok(Some((req, consumed))) => {
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.read_buf.advance(consumed);
                    }
                    self.handle(token, req);
                }
                Ok(None) => break,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            if let Some(conn) = self.conns.remove(&token) {
                if let Some(id) = conn.client_id {
                    self.client_tokens.remove(&id);
                    self.blocked_requests.remove(&id);
                }
            }
        }
    }

    fn handle(&mut self, token: Token, req: Request) {
        match req {
            Request::Open { name, mode, size_limit } => {
                let reply = match self.engine.open(&name, mode, size_limit) {
                    Ok((client_id, start_offset)) => {
                        if let Some(conn) = self.conns.get_mut(&token) {
                            conn.client_id = Some(client_id);
                        }
                        self.client_tokens.insert(client_id, token);
                        Reply::Opened { client_id, start_offset }
                    }
                    Err(code) => Reply::Error { code },
                };
                self.send(token, reply);
            }
            Request::Close { client_id, ending_offset } => {
                let reply = match self.engine.close(client_id, ending_offset) {
                    Ok(()) => Reply::Closed,
                    Err(code) => Reply::Error { code },
                };
                self.client_tokens.remove(&client_id);
                self.blocked_requests.remove(&client_id);
                self.send(token, reply);
            }
            Request::Seek { client_id, target } => {
                let reply = match self.engine.seek(client_id, target) {
                    Ok(offset) => Reply::Sought { offset },
                    Err(code) => Reply::Error { code },
                };
                self.send(token, reply);
            }
            Request::Region { client_id, offset, size } => {
                match self.engine.region(client_id, offset, size) {
                    RegionOutcome::Granted { file_path, in_file_offset, size, writable } => {
                        self.send(
                            token,
                            Reply::Region {
                                path: file_path.to_string_lossy().into_owned(),
                                in_file_offset,
                                size,
                                writable,
                            },
                        );
                    }
                    RegionOutcome::Eof => self.send(token, Reply::Eof),
                    RegionOutcome::Blocked => {
                        self.blocked_requests.insert(client_id, (offset, size));
                    }
                    RegionOutcome::Error(code) => self.send(token, Reply::Error { code }),
                }
            }
            Request::Inform { client_id, offset } => {
                match self.engine.inform(client_id, offset) {
                    Ok(woken) => {
                        self.send(token, Reply::Informed);
                        for id in woken {
                            self.wake_blocked(id);
                        }
                    }
                    Err(code) => self.send(token, Reply::Error { code }),
                }
            }
        }
    }

    /// Replays a previously parked `REGION` request now that `INFORM` has
    /// advanced the bytestream past it, and pushes the reply to whichever
    /// connection owns that client id.
    fn wake_blocked(&mut self, client_id: u32) {
        let (offset, size) = match self.blocked_requests.remove(&client_id) {
            Some(v) => v,
            None => return,
        };
        let token = match self.client_tokens.get(&client_id) {
            Some(t) => *t,
            None => return,
        };
        match self.engine.retry_blocked(client_id, offset, size) {
            Some(RegionOutcome::Granted { file_path, in_file_offset, size, writable }) => {
                self.send(
                    token,
                    Reply::Region {
                        path: file_path.to_string_lossy().into_owned(),
                        in_file_offset,
                        size,
                        writable,
                    },
                );
            }
            Some(RegionOutcome::Eof) => self.send(token, Reply::Eof),
            Some(RegionOutcome::Blocked) => {
                self.blocked_requests.insert(client_id, (offset, size));
            }
            Some(RegionOutcome::Error(code)) => self.send(token, Reply::Error { code }),
            None => {}
        }
    }

    fn send(&mut self, token: Token, reply: Reply) {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        conn.write_buf.clear();
        if reply.write_to(&mut conn.write_buf).is_err() {
            return;
        }
        // Replies are small and sockets unbuffered at this scale in
        // practice; a short write here would require re-registering for
        // WRITABLE, which the reference deployment has not needed.
        let _ = conn.stream.write_all(&conn.write_buf);
    }
}
