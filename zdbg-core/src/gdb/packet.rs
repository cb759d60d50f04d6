//! Packet framing.
//!
//! Format: `$<payload>#<checksum>`, the checksum being the sum of all payload
//! bytes modulo 256 as two hex digits.

use super::GdbError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Out-of-band interrupt request (Ctrl-C).
pub const BREAK_SIGNAL: u8 = 0x03;

/// Sum of the payload bytes modulo 256.
pub fn calculate_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &x| acc.wrapping_add(x))
}

/// Checksum rendered as two uppercase hex digits.
pub fn checksum(payload: &str) -> String {
    format!("{:02X}", calculate_checksum(payload.as_bytes()))
}

/// Frame a payload for sending.
pub fn frame(payload: &str) -> String {
    format!("${}#{}", payload, checksum(payload))
}

fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == b'}' {
            if let Some(&escaped) = iter.next() {
                out.push(escaped ^ 0x20);
            }
        } else {
            out.push(byte);
        }
    }
    out
}

fn invalid(err: GdbError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Read one packet and return its unescaped payload.
///
/// Acknowledgements and other bytes preceding `$` are skipped; a `-` (NACK)
/// is reported as an error. The caller is responsible for acknowledging.
pub async fn read_packet<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        match byte[0] {
            b'$' => break,
            b'-' => return Err(io::Error::other("Received NACK from stub")),
            _ => continue,
        }
    }

    let mut raw = Vec::new();
    let bytes_read = reader.read_until(b'#', &mut raw).await?;
    if bytes_read == 0 || raw.last() != Some(&b'#') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed while reading payload"));
    }
    raw.pop();

    let mut checksum_buf = [0u8; 2];
    reader.read_exact(&mut checksum_buf).await?;
    let received = String::from_utf8_lossy(&checksum_buf).to_string();
    let expected = calculate_checksum(&raw);
    if u8::from_str_radix(&received, 16).ok() != Some(expected) {
        return Err(invalid(GdbError::ChecksumMismatch { expected: format!("{expected:02X}"), received }));
    }

    let payload = unescape(&raw);
    let text = String::from_utf8(payload)
        .map_err(|e| invalid(GdbError::MalformedPacket(e.to_string())))?;
    log::debug!("gdb <- {text}");
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_checksum_values() {
        assert_eq!(checksum(""), "00");
        assert_eq!(checksum("A"), "41");
        assert_eq!(checksum("AB"), "83");
        assert_eq!(checksum("ABC"), "C6");
        assert_eq!(checksum("ABCD"), "0A");
    }

    #[test]
    fn test_frame() {
        assert_eq!(frame("g"), "$g#67");
        assert_eq!(frame("m8000,4"), format!("$m8000,4#{}", checksum("m8000,4")));
    }

    #[tokio::test]
    async fn test_read_packet_skips_acks() {
        let data = format!("++{}", frame("OK"));
        let mut reader = BufReader::new(data.as_bytes());
        assert_eq!(read_packet(&mut reader).await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_read_packet_unescapes() {
        // '}' followed by '#' ^ 0x20 yields '#' in the payload.
        let raw = [b'a', b'}', b'#' ^ 0x20, b'b'];
        let sum = calculate_checksum(&raw);
        let mut data = vec![b'$'];
        data.extend_from_slice(&raw);
        data.extend_from_slice(format!("#{sum:02x}").as_bytes());
        let mut reader = BufReader::new(data.as_slice());
        assert_eq!(read_packet(&mut reader).await.unwrap(), "a#b");
    }

    #[tokio::test]
    async fn test_read_packet_rejects_bad_checksum() {
        let mut reader = BufReader::new("$OK#00".as_bytes());
        let err = read_packet(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[tokio::test]
    async fn test_read_packet_nack_and_eof() {
        let mut reader = BufReader::new("-".as_bytes());
        assert!(read_packet(&mut reader).await.is_err());

        let mut reader = BufReader::new("$OK".as_bytes());
        let err = read_packet(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
