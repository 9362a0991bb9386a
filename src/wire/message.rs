//! Message-level operations: the minimum parsing needed to classify a query
//! or response and to synthesize a SERVFAIL reply, per the wire codec
//! responsibility. Resource records beyond the first question are never
//! decoded into structured form — only walked over, to find the OPT RR and
//! to leave everything else untouched for verbatim forwarding.

use bytes::Bytes;

use crate::error::{ProxyError, Result};
use crate::wire::common::read_name;
use crate::wire::enums::{Opcode, ResponseCode};
use crate::wire::header::{HEADER_LEN, Header};
use crate::wire::question::Question;

const OPT_RR_TYPE: u16 = 41;

#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub question: Option<Question>,
    pub has_edns: bool,
    pub raw: Bytes,
}

impl Message {
    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from(self.header.opcode)
    }

    pub fn rcode(&self) -> u8 {
        self.header.rcode
    }

    pub fn is_response(&self) -> bool {
        self.header.qr
    }

    pub fn qname(&self) -> Option<&str> {
        self.question.as_ref().map(|q| q.qname.as_str())
    }

    /// Parses as much of `bytes` as the proxy needs: the header, the first
    /// question (if `qdcount > 0`), and whether an EDNS OPT pseudo-record is
    /// present in the additional section. Anything past that is kept only
    /// as the verbatim `raw` payload.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        let header = Header::parse(&bytes)?;
        let mut cursor = HEADER_LEN;

        let question = if header.qdcount > 0 {
            let (question, next) = Question::parse_first(&bytes, cursor)?;
            cursor = next;
            Some(question)
        } else {
            None
        };

        // Skip any additional questions beyond the first; we only need one.
        for _ in 1..header.qdcount {
            let (_, next) = read_name(&bytes, cursor)?;
            cursor = next + 4; // qtype + qclass
        }

        for _ in 0..(header.ancount as u32 + header.nscount as u32) {
            cursor = skip_resource_record(&bytes, cursor)?.0;
        }

        let mut has_edns = false;
        for _ in 0..header.arcount {
            let (next, rr_type) = skip_resource_record(&bytes, cursor)?;
            if rr_type == OPT_RR_TYPE {
                has_edns = true;
            }
            cursor = next;
        }

        Ok(Message {
            header,
            question,
            has_edns,
            raw: bytes,
        })
    }

    /// True iff this message is a response with an RCODE the pipeline
    /// treats as success: NOERROR and NXDOMAIN are valid answers, including
    /// authoritative negatives; only SERVFAIL and REFUSED count as failure.
    pub fn is_success(&self) -> bool {
        self.header.qr
            && matches!(
                self.header.rcode,
                r if r == ResponseCode::NoError.as_u8() || r == 3 /* NXDOMAIN */
            )
    }

    pub fn is_truncated(&self) -> bool {
        self.header.tc
    }
}

/// Skips over one resource record starting at `pos`, returning the offset
/// just past it and the record's TYPE field (needed only to detect OPT).
fn skip_resource_record(buf: &[u8], pos: usize) -> Result<(usize, u16)> {
    let (_, mut cursor) = read_name(buf, pos)?;
    let rr_type = read_u16(buf, cursor)?;
    cursor += 2; // type
    cursor += 2; // class
    cursor += 4; // ttl
    let rdlength = read_u16(buf, cursor)? as usize;
    cursor += 2;
    cursor = cursor
        .checked_add(rdlength)
        .ok_or_else(|| ProxyError::parse("resource record length overflow"))?;
    if cursor > buf.len() {
        return Err(ProxyError::parse("resource record runs past end of message"));
    }
    Ok((cursor, rr_type))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| ProxyError::parse("resource record truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Builds a SERVFAIL reply for `request`: the 16-bit ID and question section
/// are copied verbatim, QR and RA are set, RCODE is SERVFAIL, and all record
/// counts other than QDCOUNT are zeroed.
pub fn synthesize_servfail(request: &Message) -> Bytes {
    let mut header = request.header;
    header.qr = true;
    header.ra = true;
    header.rcode = ResponseCode::SERVFAIL;
    header.ancount = 0;
    header.nscount = 0;
    header.arcount = 0;

    let mut out = Vec::with_capacity(HEADER_LEN + 32);
    // write() only fails on an I/O error from the in-memory Vec writer,
    // which cannot happen; the header is always well-formed here.
    header.write(&mut out).expect("in-memory header write cannot fail");

    if let Some(question) = &request.question {
        let question_start = HEADER_LEN;
        let question_end = question_section_end(request);
        if let Some(end) = question_end {
            out.extend_from_slice(&request.raw[question_start..end]);
        } else {
            crate::wire::common::write_name(&mut out, &question.qname)
                .expect("name within label-length limits");
            out.extend_from_slice(&u16::from(question.qtype).to_be_bytes());
            out.extend_from_slice(&question.qclass.to_be_bytes());
        }
    }

    Bytes::from(out)
}

fn question_section_end(message: &Message) -> Option<usize> {
    if message.header.qdcount == 0 {
        return None;
    }
    let (_, end) = Question::parse_first(&message.raw, HEADER_LEN).ok()?;
    Some(end)
}

/// A response is only accepted for a given request if the transaction ID and
/// the first question's QNAME/QTYPE match; anything else is treated as a
/// mismatched (and therefore failed) exchange.
pub fn validate_response_matches(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    match (&request.question, &response.question) {
        (Some(req_q), Some(resp_q)) => req_q.qname == resp_q.qname && req_q.qtype == resp_q.qtype,
        (None, None) => true,
        _ => false,
    }
}
