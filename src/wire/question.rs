use crate::error::{ProxyError, Result};
use crate::wire::common::read_name;
use crate::wire::enums::QType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: QType,
    pub qclass: u16,
}

impl Question {
    /// Parses the first question in the message, starting right after the
    /// 12-byte header. Only the first question is needed: dedupe keys,
    /// bypass lookups, and event records all key off it, and multi-question
    /// messages are vanishingly rare in practice.
    pub fn parse_first(buf: &[u8], pos: usize) -> Result<(Self, usize)> {
        let (qname, mut cursor) = read_name(buf, pos)?;
        let qtype = read_u16(buf, cursor)?;
        cursor += 2;
        let qclass = read_u16(buf, cursor)?;
        cursor += 2;
        Ok((
            Question {
                qname: qname.trim_end_matches('.').to_ascii_lowercase(),
                qtype: QType::from(qtype),
                qclass,
            },
            cursor,
        ))
    }
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| ProxyError::parse("question section truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}
