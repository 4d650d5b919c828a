//! Stdin line format.
//!
//! One frame per line as `<hex bytes> [rssi_dbm] [channel]`, e.g.
//! `d4a3f0... -71 0`. Lines starting with `{` are host commands, blank
//! lines and `#` comments are skipped.

use anyhow::{anyhow, bail, Context};

use bresser_rx::comm;
use bresser_rx::protocol::HostCommand;

/// RSSI assumed when a capture line carries none
pub const DEFAULT_RSSI: i8 = 0;

#[derive(Debug, PartialEq)]
pub enum InputLine {
    Frame { bytes: Vec<u8>, rssi: i8, channel: u8 },
    Command(HostCommand),
}

/// Parse one input line. `Ok(None)` for lines that carry nothing.
pub fn parse_line(line: &[u8]) -> anyhow::Result<Option<InputLine>> {
    let text = std::str::from_utf8(line).context("input line is not UTF-8")?;
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    if text.starts_with('{') {
        let cmd = comm::parse_command(text.as_bytes())
            .ok_or_else(|| anyhow!("unrecognized command: {}", text))?;
        return Ok(Some(InputLine::Command(cmd)));
    }

    let mut fields = text.split_whitespace();
    let hex = fields.next().unwrap_or_default();
    let bytes = parse_hex(hex)?;
    let rssi = match fields.next() {
        Some(f) => f.parse().with_context(|| format!("invalid rssi '{}'", f))?,
        None => DEFAULT_RSSI,
    };
    let channel = match fields.next() {
        Some(f) => f.parse().with_context(|| format!("invalid channel '{}'", f))?,
        None => 0,
    };
    if let Some(extra) = fields.next() {
        bail!("unexpected field '{}'", extra);
    }
    Ok(Some(InputLine::Frame { bytes, rssi, channel }))
}

/// Decode a hex string; `:` and `-` separators between bytes are allowed.
pub fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| *b != b':' && *b != b'-').collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in '{}'", s);
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte '{}'", pair))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_metadata() {
        let line = parse_line(b"D4a1FF -71 3").unwrap();
        assert_eq!(
            line,
            Some(InputLine::Frame {
                bytes: vec![0xD4, 0xA1, 0xFF],
                rssi: -71,
                channel: 3
            })
        );
    }

    #[test]
    fn frame_without_metadata_uses_defaults() {
        let line = parse_line(b"d4:00:01\r").unwrap();
        assert_eq!(
            line,
            Some(InputLine::Frame {
                bytes: vec![0xD4, 0x00, 0x01],
                rssi: DEFAULT_RSSI,
                channel: 0
            })
        );
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_line(b"   ").unwrap(), None);
        assert_eq!(parse_line(b"# capture 2024-06-01").unwrap(), None);
    }

    #[test]
    fn command_lines() {
        assert_eq!(
            parse_line(br#"{"cmd":"stop"}"#).unwrap(),
            Some(InputLine::Command(HostCommand::Stop))
        );
        assert!(parse_line(br#"{"cmd":"launch"}"#).is_err());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(parse_line(b"d4a").is_err());
        assert!(parse_line(b"zz").is_err());
        assert!(parse_line(b"d4 loud").is_err());
        assert!(parse_line(b"d4 -70 1 extra").is_err());
        assert!(parse_line(b"d4 -200").is_err());
    }

    #[test]
    fn hex_separators() {
        assert_eq!(parse_hex("0a-0B:0c").unwrap(), vec![0x0A, 0x0B, 0x0C]);
        assert!(parse_hex("").unwrap().is_empty());
    }
}
