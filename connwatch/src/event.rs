//! Decoding and rendering of connect records drained from the perf buffers

use connwatch_common::ConnectEvent;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::config::OutputFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("sample too short: {len} bytes, expected at least {expected}")]
    Truncated { len: usize, expected: usize },
}

/// Read a [`ConnectEvent`] out of a raw perf sample.
///
/// Perf pads samples to 8 bytes, so anything past the record is ignored.
pub fn decode(data: &[u8]) -> Result<ConnectEvent, DecodeError> {
    if data.len() < ConnectEvent::SIZE {
        return Err(DecodeError::Truncated {
            len: data.len(),
            expected: ConnectEvent::SIZE,
        });
    }
    // Sample buffers carry no alignment guarantee.
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().cast::<ConnectEvent>()) })
}

/// Host-side view of one connect attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectRecord {
    /// CPU whose buffer the record was drained from
    pub cpu: u32,
    pub pid: u32,
    pub comm: String,
    pub daddr: Ipv4Addr,
}

impl ConnectRecord {
    pub fn from_event(cpu: u32, event: &ConnectEvent) -> Self {
        Self {
            cpu,
            pid: event.pid,
            comm: String::from_utf8_lossy(event.comm_bytes()).into_owned(),
            daddr: Ipv4Addr::from(event.daddr_octets()),
        }
    }

    /// Render the record as a single output line
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.to_string(),
            OutputFormat::Json => serde_json::to_string(self).unwrap_or_else(|e| {
                log::warn!("failed to serialize record for pid {}: {e}", self.pid);
                self.to_string()
            }),
        }
    }
}

impl fmt::Display for ConnectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID: {}\t Process: {:<16}\t Connect to: {}",
            self.pid, self.comm, self.daddr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connwatch_common::COMM_LEN;

    /// Wire bytes laid out by offset, as the kernel writes them
    fn wire(pid: u32, comm: &[u8], daddr: [u8; 4]) -> Vec<u8> {
        let mut raw = vec![0u8; ConnectEvent::SIZE];
        raw[0..4].copy_from_slice(&pid.to_ne_bytes());
        raw[4..4 + comm.len()].copy_from_slice(comm);
        raw[20..24].copy_from_slice(&daddr);
        raw
    }

    #[test]
    fn test_decode_curl_connect() {
        let raw = wire(4242, b"curl", [93, 184, 216, 34]);
        let event = decode(&raw).unwrap();
        let record = ConnectRecord::from_event(0, &event);

        assert_eq!(record.pid, 4242);
        assert_eq!(record.comm, "curl");
        assert_eq!(record.daddr, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn test_decode_ignores_perf_padding() {
        let mut raw = wire(1, b"nc", [10, 0, 0, 1]);
        raw.extend_from_slice(&[0xAA; 4]);
        let event = decode(&raw).unwrap();
        assert_eq!(event.pid, 1);
        assert_eq!(event.daddr_octets(), [10, 0, 0, 1]);
    }

    #[test]
    fn test_decode_unaligned_slice() {
        let mut raw = vec![0u8];
        raw.extend(wire(77, b"wget", [1, 1, 1, 1]));
        let event = decode(&raw[1..]).unwrap();
        assert_eq!(event.pid, 77);
    }

    #[test]
    fn test_decode_short_sample() {
        let err = decode(&[0u8; 20]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                len: 20,
                expected: 24
            }
        );
    }

    #[test]
    fn test_comm_without_terminator_uses_full_buffer() {
        let raw = wire(5, b"0123456789abcdef", [0, 0, 0, 0]);
        let record = ConnectRecord::from_event(0, &decode(&raw).unwrap());
        assert_eq!(record.comm.len(), COMM_LEN);
    }

    #[test]
    fn test_text_line() {
        let record = ConnectRecord {
            cpu: 2,
            pid: 4242,
            comm: "curl".to_string(),
            daddr: Ipv4Addr::new(93, 184, 216, 34),
        };
        assert_eq!(
            record.render(OutputFormat::Text),
            "PID: 4242\t Process: curl            \t Connect to: 93.184.216.34"
        );
    }

    #[test]
    fn test_json_line() {
        let record = ConnectRecord {
            cpu: 0,
            pid: 4242,
            comm: "curl".to_string(),
            daddr: Ipv4Addr::new(93, 184, 216, 34),
        };
        assert_eq!(
            record.render(OutputFormat::Json),
            r#"{"cpu":0,"pid":4242,"comm":"curl","daddr":"93.184.216.34"}"#
        );
    }
}
