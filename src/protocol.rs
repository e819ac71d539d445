//! ==============================================================================
//! protocol.rs - controller line protocol
//! ==============================================================================
//!
//! wire format (newline terminated ascii, '\r' ignored):
//!
//!     O:<name>,<name>,...          sensor (input) names, replaces the old list
//!     I:<name>,<name>,...          effector (output) names, replaces the old list
//!     D:<value>,<value>,...        one reading, positional to the O list
//!     C:<index><+|->[<duration>]   command to the controller, or its echo
//!
//! the byte stream is cut into lines by LineDecoder, and each line is decoded
//! once into a Frame. handlers match on Frame and never look at the raw tag.
//!
//! relationships:
//!     - used by: device.rs (read loop and send_command)
//!
//! ==============================================================================

use crate::domain::Action;
use crate::error::ProtocolError;

/// lines longer than this are garbage (no newline from the device); dropped
pub const MAX_LINE_LEN: usize = 4096;

/// one decoded line
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `O:` sensor names
    Inputs(Vec<String>),
    /// `I:` effector names
    Outputs(Vec<String>),
    /// `D:` values, not yet matched against the sensor names
    Data(Vec<f64>),
    /// `C:` command echo, payload kept verbatim
    CommandEcho(String),
}

impl Frame {
    /// decode a single line (without its terminator)
    pub fn parse(line: &str) -> Result<Frame, ProtocolError> {
        let mut chars = line.chars();
        let tag = chars.next().ok_or(ProtocolError::Empty)?;
        let payload = chars
            .as_str()
            .strip_prefix(':')
            .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;

        match tag {
            'O' => Ok(Frame::Inputs(split_names(payload))),
            'I' => Ok(Frame::Outputs(split_names(payload))),
            'D' => split_fields(payload).map(parse_value).collect::<Result<Vec<_>, _>>().map(Frame::Data),
            'C' => Ok(Frame::CommandEcho(payload.to_string())),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn split_fields(payload: &str) -> impl Iterator<Item = &str> {
    payload.split(',').map(str::trim).filter(move |_| !payload.is_empty())
}

/// NaN and infinities parse as f64 but have no json form, so they are rejected
fn parse_value(field: &str) -> Result<f64, ProtocolError> {
    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ProtocolError::InvalidValue(field.to_string())),
    }
}

fn split_names(payload: &str) -> Vec<String> {
    split_fields(payload).map(str::to_string).collect()
}

/// accumulates bytes until a '\n' completes a line
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(256), overflowed: false }
    }

    /// feed raw bytes, returning every line completed by them
    ///
    /// empty lines are skipped. a line that grows past MAX_LINE_LEN is
    /// discarded up to its terminating newline.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            match b {
                b'\r' => {}
                b'\n' => {
                    if self.overflowed {
                        tracing::warn!("dropped over-long line");
                    } else if !self.buffer.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    }
                    self.buffer.clear();
                    self.overflowed = false;
                }
                _ if self.overflowed => {}
                _ => {
                    if self.buffer.len() >= MAX_LINE_LEN {
                        self.buffer.clear();
                        self.overflowed = true;
                    } else {
                        self.buffer.push(b);
                    }
                }
            }
        }

        lines
    }
}

/// build the wire form of an effector command, newline included
///
/// a zero duration means "no duration", matching what controllers expect.
pub fn encode_command(index: usize, action: Action, duration: Option<u32>) -> String {
    match duration {
        Some(d) if d > 0 => format!("C:{}{}{}\n", index, action.symbol(), d),
        _ => format!("C:{}{}\n", index, action.symbol()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_lines_and_ignores_carriage_returns() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"O:tempC,humidity\r\nD:21.4,55.0\r\n");
        assert_eq!(lines, vec!["O:tempC,humidity", "D:21.4,55.0"]);
    }

    #[test]
    fn decoder_keeps_partial_line_between_pushes() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"D:1.").is_empty());
        assert!(decoder.push(b"0,2").is_empty());
        assert_eq!(decoder.push(b".0\nD:"), vec!["D:1.0,2.0"]);
        assert_eq!(decoder.push(b"3.0,4.0\n"), vec!["D:3.0,4.0"]);
    }

    #[test]
    fn decoder_skips_blank_lines() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.push(b"\n\r\n\nC:0+\n"), vec!["C:0+"]);
    }

    #[test]
    fn decoder_drops_over_long_line_and_recovers() {
        let mut decoder = LineDecoder::new();
        let junk = vec![b'x'; MAX_LINE_LEN + 10];
        assert!(decoder.push(&junk).is_empty());
        assert_eq!(decoder.push(b"tail\nO:a\n"), vec!["O:a"]);
    }

    #[test]
    fn parse_each_frame_kind() {
        assert_eq!(
            Frame::parse("O:tempC,humidity"),
            Ok(Frame::Inputs(vec!["tempC".to_string(), "humidity".to_string()]))
        );
        assert_eq!(
            Frame::parse("I:light,fan"),
            Ok(Frame::Outputs(vec!["light".to_string(), "fan".to_string()]))
        );
        assert_eq!(Frame::parse("D:21.4,55"), Ok(Frame::Data(vec![21.4, 55.0])));
        assert_eq!(Frame::parse("C:1+5"), Ok(Frame::CommandEcho("1+5".to_string())));
    }

    #[test]
    fn parse_empty_payload_gives_empty_list() {
        assert_eq!(Frame::parse("O:"), Ok(Frame::Inputs(Vec::new())));
        assert_eq!(Frame::parse("D:"), Ok(Frame::Data(Vec::new())));
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert_eq!(Frame::parse(""), Err(ProtocolError::Empty));
        assert_eq!(Frame::parse("X:1,2"), Err(ProtocolError::UnknownTag('X')));
        assert_eq!(
            Frame::parse("Dnope"),
            Err(ProtocolError::MissingSeparator("Dnope".to_string()))
        );
        assert_eq!(
            Frame::parse("D:1.0,abc"),
            Err(ProtocolError::InvalidValue("abc".to_string()))
        );
    }

    #[test]
    fn parse_rejects_non_finite_values() {
        assert_eq!(Frame::parse("D:NaN,1.0"), Err(ProtocolError::InvalidValue("NaN".to_string())));
        assert_eq!(Frame::parse("D:1.0,inf"), Err(ProtocolError::InvalidValue("inf".to_string())));
        assert_eq!(
            Frame::parse("D:-infinity"),
            Err(ProtocolError::InvalidValue("-infinity".to_string()))
        );
        assert_eq!(Frame::parse("D:-0.5,1e3"), Ok(Frame::Data(vec![-0.5, 1000.0])));
    }

    #[test]
    fn encode_command_with_and_without_duration() {
        assert_eq!(encode_command(1, Action::On, None), "C:1+\n");
        assert_eq!(encode_command(1, Action::On, Some(5)), "C:1+5\n");
        assert_eq!(encode_command(0, Action::Off, Some(0)), "C:0-\n");
    }
}
