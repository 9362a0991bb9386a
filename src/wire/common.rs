//! Domain-name label parsing, including compression-pointer support.
//!
//! Names are the one part of a DNS message that isn't bit-packed, so this
//! walks labels directly over the byte slice with a jump-count-guarded
//! pointer resolver rather than going through the header's bit reader.

use crate::error::{ProxyError, Result};

const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 100;

/// Reads a domain name starting at `pos` in `buf`, following compression
/// pointers as needed. Returns the name (dot-joined, no trailing dot) and the
/// offset immediately following the name *in the original stream* (pointer
/// targets do not affect this offset, mirroring RFC 1035 §4.1.4).
pub fn read_name(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = pos;
    let mut end_of_name: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        let first = *buf
            .get(cursor)
            .ok_or_else(|| ProxyError::parse("name runs past end of message"))?;

        if first == 0 {
            cursor += 1;
            if end_of_name.is_none() {
                end_of_name = Some(cursor);
            }
            break;
        }

        if first & 0xC0 == 0xC0 {
            let second = *buf
                .get(cursor + 1)
                .ok_or_else(|| ProxyError::parse("truncated compression pointer"))?;
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 2);
            }
            let pointer = (((first & 0x3F) as usize) << 8) | second as usize;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS || pointer >= cursor {
                return Err(ProxyError::parse("compression pointer loop"));
            }
            cursor = pointer;
            continue;
        }

        if first as usize > MAX_LABEL_LEN {
            return Err(ProxyError::parse("label exceeds 63 bytes"));
        }

        let start = cursor + 1;
        let label_end = start + first as usize;
        let label = buf
            .get(start..label_end)
            .ok_or_else(|| ProxyError::parse("label runs past end of message"))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor = label_end;
    }

    let name = labels.join(".");
    Ok((name, end_of_name.unwrap_or(cursor)))
}

/// Writes an uncompressed name as a sequence of length-prefixed labels
/// terminated by a zero octet. Used only for synthesized responses, where
/// the name is copied verbatim from the request rather than re-encoded from
/// parsed labels.
pub fn write_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    if name.is_empty() {
        out.push(0);
        return Ok(());
    }
    for label in name.split('.') {
        if label.len() > MAX_LABEL_LEN {
            return Err(ProxyError::parse("label exceeds 63 bytes"));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_a_simple_name() {
        let mut buf = Vec::new();
        write_name(&mut buf, "example.com").unwrap();
        let (name, offset) = read_name(&buf, 0).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn follows_a_compression_pointer() {
        let mut buf = Vec::new();
        write_name(&mut buf, "example.com").unwrap();
        let pointer_target = buf.len() as u16;
        buf.extend_from_slice(&[0xC0, 0x00]);
        let (name, offset) = read_name(&buf, pointer_target as usize).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(offset, pointer_target as usize + 2);
    }

    #[test]
    fn rejects_self_referential_pointer() {
        let buf = [0xC0u8, 0x00];
        assert!(read_name(&buf, 0).is_err());
    }
}
