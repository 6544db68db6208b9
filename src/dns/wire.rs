//! Byte-level helpers for RFC 1035 DNS messages.
//!
//! Only the small slice of the format that interception needs is
//! implemented: reading the transaction id, decoding the single question
//! name, and synthesizing an A-record answer in place over a query.

use std::net::Ipv4Addr;

/// Fixed DNS header length.
const HEADER_LEN: usize = 12;

/// TYPE A, CLASS IN, maximum TTL, 4-byte RDLENGTH.
const ANSWER_TAIL: [u8; 10] = [
    0x00, 0x01, // TYPE A
    0x00, 0x01, // CLASS IN
    0xff, 0xff, 0xff, 0xff, // TTL
    0x00, 0x04, // RDLENGTH
];

/// Reads the 16-bit transaction id from a DNS message.
pub fn transaction_id(msg: &[u8]) -> Option<u16> {
    if msg.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([msg[0], msg[1]]))
}

/// Offset of the zero byte terminating the question name, if the labels
/// are well formed and uncompressed.
fn question_end(msg: &[u8]) -> Option<usize> {
    let mut offset = HEADER_LEN;
    loop {
        let len = *msg.get(offset)? as usize;
        if len == 0 {
            return Some(offset);
        }
        // Compression pointers never appear in a question we accept.
        if len > 63 {
            return None;
        }
        offset += 1 + len;
    }
}

/// Decodes the question name of a single-question query into dotted form
/// with a trailing dot, e.g. `www.example.com.`.
///
/// Returns `None` for anything other than exactly one question, and for
/// truncated or malformed label sequences. Callers treat `None` as an
/// unclassifiable query and forward it untouched.
pub fn question_name(msg: &[u8]) -> Option<String> {
    if msg.len() < HEADER_LEN || msg[5] != 1 {
        return None;
    }

    let end = question_end(msg)?;
    let mut name = String::new();
    let mut offset = HEADER_LEN;
    while offset < end {
        let len = msg[offset] as usize;
        offset += 1;
        let label = msg.get(offset..offset + len)?;
        name.push_str(std::str::from_utf8(label).ok()?);
        name.push('.');
        offset += len;
    }
    Some(name)
}

/// Builds a hijacked response for a query by mutating a copy of it in
/// place: response and recursion-available flags set, answer count set to
/// one, and a single A record appended whose owner name repeats the
/// question name uncompressed and whose address is `target`.
///
/// The question section is preserved byte for byte so the client matches
/// the answer to its query.
pub fn hijack_answer(msg: &[u8], target: Ipv4Addr) -> Option<Vec<u8>> {
    let end = question_end(msg)?;

    let name_len = end + 1 - HEADER_LEN;
    let mut resp = Vec::with_capacity(msg.len() + name_len + ANSWER_TAIL.len() + 4);
    resp.extend_from_slice(msg);
    resp[2] = 0x81; // QR + RD
    resp[3] = 0x80; // RA
    resp[7] = 1; // ANCOUNT
    resp.extend_from_slice(&msg[HEADER_LEN..=end]);
    resp.extend_from_slice(&ANSWER_TAIL);
    resp.extend_from_slice(&target.octets());
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testutil::build_query;

    #[test]
    fn reads_transaction_id() {
        let query = build_query(0xabcd, &["www", "example", "com"]);
        assert_eq!(transaction_id(&query), Some(0xabcd));

        assert_eq!(transaction_id(&[0x12]), None);
        assert_eq!(transaction_id(&[]), None);
    }

    #[test]
    fn decodes_question_name() {
        let query = build_query(1, &["www", "example", "com"]);
        assert_eq!(question_name(&query).as_deref(), Some("www.example.com."));

        let root = build_query(1, &[]);
        assert_eq!(question_name(&root).as_deref(), Some(""));
    }

    /// Anything other than exactly one question is unclassifiable.
    #[test]
    fn rejects_multi_question_messages() {
        let mut query = build_query(1, &["example", "com"]);
        query[5] = 2;
        assert_eq!(question_name(&query), None);

        query[5] = 0;
        assert_eq!(question_name(&query), None);
    }

    #[test]
    fn rejects_truncated_messages() {
        let query = build_query(1, &["example", "com"]);

        // Chopped mid-label.
        assert_eq!(question_name(&query[..15]), None);
        // Header only, no terminating zero.
        assert_eq!(question_name(&query[..12]), None);
        // Shorter than a header.
        assert_eq!(question_name(&query[..7]), None);
    }

    #[test]
    fn hijack_answer_layout() {
        let query = build_query(0x1234, &["www", "example", "com"]);
        let target = Ipv4Addr::new(10, 1, 150, 1);
        let resp = hijack_answer(&query, target).unwrap();

        // Transaction id preserved, flags and answer count rewritten.
        assert_eq!(&resp[..2], &query[..2]);
        assert_eq!(resp[2], 0x81);
        assert_eq!(resp[3], 0x80);
        assert_eq!(resp[7], 1);

        // Question section untouched.
        assert_eq!(&resp[12..query.len()], &query[12..]);

        // Appended record: owner name repeats the question name, then the
        // fixed A-record fields, then the target address.
        let name = &query[12..12 + 1 + "www.example.com".len() + 1];
        let record = &resp[query.len()..];
        assert_eq!(&record[..name.len()], name);
        assert_eq!(record[name.len()..name.len() + 10], ANSWER_TAIL);
        assert_eq!(record[name.len() + 10..], [10, 1, 150, 1]);
    }

    #[test]
    fn hijack_answer_rejects_malformed_query() {
        let query = build_query(1, &["example", "com"]);
        assert!(hijack_answer(&query[..14], Ipv4Addr::LOCALHOST).is_none());
    }
}
