//! DNS interception: wire helpers, the in-flight query ledger, and the
//! UDP proxy itself.

mod ledger;
mod proxy;
mod wire;

pub use ledger::{DnsQuery, QueryLedger};
pub use proxy::DnsProxy;

#[cfg(test)]
pub(crate) mod testutil {
    /// Builds a minimal single-question A query for tests.
    pub(crate) fn build_query(txid: u16, labels: &[&str]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&txid.to_be_bytes());
        msg.extend_from_slice(&[0x01, 0x00]); // RD
        msg.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        msg.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        for label in labels {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN
        msg
    }
}
