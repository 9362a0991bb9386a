//! The fixed 12-byte DNS header, read with a bit-level reader since it's
//! the one part of the message that is not byte-aligned.

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use crate::error::{ProxyError, Result};

pub const HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProxyError::parse("message shorter than a DNS header"));
        }
        let mut reader = BitReader::endian(&buf[..HEADER_LEN], BigEndian);
        let read = || -> std::io::Result<Header> {
            Ok(Header {
                id: reader.read_var::<u16>(16)?,
                qr: reader.read_var::<u8>(1)? == 1,
                opcode: reader.read_var::<u8>(4)?,
                aa: reader.read_var::<u8>(1)? == 1,
                tc: reader.read_var::<u8>(1)? == 1,
                rd: reader.read_var::<u8>(1)? == 1,
                ra: reader.read_var::<u8>(1)? == 1,
                z: reader.read_var::<u8>(3)?,
                rcode: reader.read_var::<u8>(4)?,
                qdcount: reader.read_var::<u16>(16)?,
                ancount: reader.read_var::<u16>(16)?,
                nscount: reader.read_var::<u16>(16)?,
                arcount: reader.read_var::<u16>(16)?,
            })
        };
        read().map_err(|e| ProxyError::parse(format!("truncated header: {e}")))
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut writer = BitWriter::endian(out, BigEndian);
        let write = || -> std::io::Result<()> {
            writer.write_var::<u16>(16, self.id)?;
            writer.write_var::<u8>(1, self.qr as u8)?;
            writer.write_var::<u8>(4, self.opcode)?;
            writer.write_var::<u8>(1, self.aa as u8)?;
            writer.write_var::<u8>(1, self.tc as u8)?;
            writer.write_var::<u8>(1, self.rd as u8)?;
            writer.write_var::<u8>(1, self.ra as u8)?;
            writer.write_var::<u8>(3, self.z)?;
            writer.write_var::<u8>(4, self.rcode)?;
            writer.write_var::<u16>(16, self.qdcount)?;
            writer.write_var::<u16>(16, self.ancount)?;
            writer.write_var::<u16>(16, self.nscount)?;
            writer.write_var::<u16>(16, self.arcount)?;
            Ok(())
        };
        write().map_err(|e| ProxyError::parse(format!("failed to encode header: {e}")))
    }
}
