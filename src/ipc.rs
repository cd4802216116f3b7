//! IPC message framing between supervisor, capture, export and query, per
//! spec.md section 6: a fixed tag set, length-prefixed over AF_UNIX stream
//! sockets.
//!
//! Storage's own request/reply protocol (`S_OPEN`/`S_CLOSE`/...) is
//! defined separately in `crate::storage::protocol`, since its payloads
//! are storage-specific; this module covers the supervisor<->capture<->
//! export<->query control bus.

use std::io::{self, Read, Write};

use crate::module::ModuleDescriptor;

/// Tags from spec.md section 6's "IPC messages" list. `FromRepr` (the
/// teacher's own `strum` dependency, otherwise unused by this crate's
/// hand-rolled wire framing) gives us the reverse lookup without writing
/// the match arms out by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum IpcTag {
    ModuleAdd = 1,
    ModuleDel = 2,
    ModuleStart = 3,
    Flush = 4,
    Freeze = 5,
    Done = 6,
    Exit = 7,
    Ack = 8,
    Error = 9,
}

impl IpcTag {
    pub fn from_u8(v: u8) -> Option<IpcTag> {
        IpcTag::from_repr(v as usize)
    }
}

/// A serialized module descriptor as carried by `IPC_MODULE_ADD`. Only the
/// wire-relevant fields travel; `ops`/`filter` are resolved locally by the
/// receiving process from its own module registry (the dynamic loader and
/// ABI are out of scope per spec.md section 1).
#[derive(Debug, Clone)]
pub struct ModuleWireDescriptor {
    pub index: u32,
    pub name: String,
    pub output_stream: String,
    pub size_limit: u64,
    pub flush_ivl_secs: u32,
    pub priority: i32,
}

impl ModuleWireDescriptor {
    pub fn from_descriptor(index: u32, desc: &ModuleDescriptor) -> Self {
        ModuleWireDescriptor {
            index,
            name: desc.name.clone(),
            output_stream: desc.output_stream.clone(),
            size_limit: desc.size_limit,
            flush_ivl_secs: desc.flush_ivl_secs,
            priority: desc.priority,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_be_bytes());
        write_str(out, &self.name);
        write_str(out, &self.output_stream);
        out.extend_from_slice(&self.size_limit.to_be_bytes());
        out.extend_from_slice(&self.flush_ivl_secs.to_be_bytes());
        out.extend_from_slice(&self.priority.to_be_bytes());
    }

    fn decode(buf: &[u8], pos: &mut usize) -> io::Result<Self> {
        let index = read_u32(buf, pos)?;
        let name = read_str(buf, pos)?;
        let output_stream = read_str(buf, pos)?;
        let size_limit = read_u64(buf, pos)?;
        let flush_ivl_secs = read_u32(buf, pos)?;
        let priority = read_u32(buf, pos)? as i32;
        Ok(ModuleWireDescriptor {
            index,
            name,
            output_stream,
            size_limit,
            flush_ivl_secs,
            priority,
        })
    }
}

/// One message on the control bus. The `FLUSH` payload is deliberately
/// *not* the expired-map list itself (that crosses via the move-only
/// `ExpiredMapHandle`, consumed out of band) -- only the module index and
/// record count ride on the wire, per the "offsets, not pointers, cross
/// IPC" design note (spec.md section 9).
#[derive(Debug, Clone)]
pub enum IpcMessage {
    ModuleAdd(ModuleWireDescriptor),
    ModuleDel { index: u32 },
    ModuleStart { index: u32 },
    Flush { module_index: u32, records: u32 },
    Freeze,
    Done { module_index: u32 },
    Exit,
    Ack,
    Error { code: u32 },
}

impl IpcMessage {
    fn tag(&self) -> IpcTag {
        match self {
            IpcMessage::ModuleAdd(_) => IpcTag::ModuleAdd,
            IpcMessage::ModuleDel { .. } => IpcTag::ModuleDel,
            IpcMessage::ModuleStart { .. } => IpcTag::ModuleStart,
            IpcMessage::Flush { .. } => IpcTag::Flush,
            IpcMessage::Freeze => IpcTag::Freeze,
            IpcMessage::Done { .. } => IpcTag::Done,
            IpcMessage::Exit => IpcTag::Exit,
            IpcMessage::Ack => IpcTag::Ack,
            IpcMessage::Error { .. } => IpcTag::Error,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            IpcMessage::ModuleAdd(desc) => desc.encode(&mut body),
            IpcMessage::ModuleDel { index } | IpcMessage::ModuleStart { index } => {
                body.extend_from_slice(&index.to_be_bytes());
            }
            IpcMessage::Flush { module_index, records } => {
                body.extend_from_slice(&module_index.to_be_bytes());
                body.extend_from_slice(&records.to_be_bytes());
            }
            IpcMessage::Done { module_index } => {
                body.extend_from_slice(&module_index.to_be_bytes());
            }
            IpcMessage::Error { code } => {
                body.extend_from_slice(&code.to_be_bytes());
            }
            IpcMessage::Freeze | IpcMessage::Exit | IpcMessage::Ack => {}
        }
        body
    }

    /// Encodes `tag (1 byte) + len (u32 BE) + body` and writes it whole.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let body = self.encode_body();
        let mut frame = Vec::with_capacity(5 + body.len());
        frame.push(self.tag() as u8);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        w.write_all(&frame)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<IpcMessage> {
        let mut head = [0u8; 5];
        r.read_exact(&mut head)?;
        let tag = IpcTag::from_u8(head[0])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown IPC tag"))?;
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        let mut body = vec![0u8; len];
        r.read_exact(&mut body)?;

        let mut pos = 0usize;
        Ok(match tag {
            IpcTag::ModuleAdd => IpcMessage::ModuleAdd(ModuleWireDescriptor::decode(&body, &mut pos)?),
            IpcTag::ModuleDel => IpcMessage::ModuleDel { index: read_u32(&body, &mut pos)? },
            IpcTag::ModuleStart => IpcMessage::ModuleStart { index: read_u32(&body, &mut pos)? },
            IpcTag::Flush => IpcMessage::Flush {
                module_index: read_u32(&body, &mut pos)?,
                records: read_u32(&body, &mut pos)?,
            },
            IpcTag::Freeze => IpcMessage::Freeze,
            IpcTag::Done => IpcMessage::Done { module_index: read_u32(&body, &mut pos)? },
            IpcTag::Exit => IpcMessage::Exit,
            IpcTag::Ack => IpcMessage::Ack,
            IpcTag::Error => IpcMessage::Error { code: read_u32(&body, &mut pos)? },
        })
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &[u8], pos: &mut usize) -> io::Result<String> {
    let len = read_u32(buf, pos)? as usize;
    let bytes = take(buf, pos, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad utf8"))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> io::Result<u32> {
    let bytes = take(buf, pos, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> io::Result<u64> {
    let bytes = take(buf, pos, 8)?;
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> io::Result<&'a [u8]> {
    if *pos + len > buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated IPC message"));
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_message_round_trips() {
        let msg = IpcMessage::Flush { module_index: 3, records: 42 };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        let decoded = IpcMessage::read_from(&mut &buf[..]).unwrap();
        match decoded {
            IpcMessage::Flush { module_index, records } => {
                assert_eq!(module_index, 3);
                assert_eq!(records, 42);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn module_add_round_trips_strings() {
        let wire = ModuleWireDescriptor {
            index: 1,
            name: "counter".into(),
            output_stream: "counter_stream".into(),
            size_limit: 1 << 20,
            flush_ivl_secs: 60,
            priority: 5,
        };
        let msg = IpcMessage::ModuleAdd(wire);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        let decoded = IpcMessage::read_from(&mut &buf[..]).unwrap();
        match decoded {
            IpcMessage::ModuleAdd(w) => {
                assert_eq!(w.name, "counter");
                assert_eq!(w.output_stream, "counter_stream");
            }
            _ => panic!("wrong variant"),
        }
    }
}
