//! SCPI line framing.
//!
//! A command goes out as one line terminated by a single LF. A response is
//! one line of text; its terminator and surrounding whitespace are dropped.

use crate::error::CommandError;
use std::str::Utf8Error;

pub const TERMINATOR: u8 = b'\n';

/// Writes `command` into `buf` as exactly one terminated line.
///
/// Surrounding whitespace (including any terminator the caller already
/// supplied) is stripped first, so the frame never ends in two terminators.
pub fn frame_command(command: &str, buf: &mut Vec<u8>) -> Result<(), CommandError> {
    let line = command.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    if line.bytes().any(|b| b == b'\n' || b == b'\r') {
        return Err(CommandError::EmbeddedTerminator);
    }

    buf.clear();
    buf.reserve(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(TERMINATOR);
    Ok(())
}

/// A command is a query when its last non-whitespace character is `?`.
pub fn is_query(command: &str) -> bool {
    command.trim_end().ends_with('?')
}

pub fn decode_response(bytes: &[u8]) -> Result<&str, Utf8Error> {
    std::str::from_utf8(bytes).map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(command: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        frame_command(command, &mut buf).unwrap();
        buf
    }

    #[test]
    fn appends_terminator_when_missing() {
        assert_eq!(framed("VOLT:MODE AC"), b"VOLT:MODE AC\n");
    }

    #[test]
    fn never_doubles_terminator() {
        for input in ["OUTP 1", "OUTP 1\n", "OUTP 1\r\n", "  OUTP 1  \n", "OUTP 1\n\n"] {
            let frame = framed(input);
            assert_eq!(frame, b"OUTP 1\n", "{input:?}");
            assert_eq!(frame.iter().filter(|&&b| b == TERMINATOR).count(), 1);
        }
    }

    #[test]
    fn keeps_interior_spacing_and_separators() {
        assert_eq!(framed("OUTP 1;"), b"OUTP 1;\n");
        assert_eq!(framed(":*OPC?"), b":*OPC?\n");
        assert_eq!(framed("VOLT:AC 100;:FREQ 60"), b"VOLT:AC 100;:FREQ 60\n");
    }

    #[test]
    fn reuses_buffer() {
        let mut buf = Vec::new();
        frame_command("MEAS:VOLT?", &mut buf).unwrap();
        frame_command("FREQ 60", &mut buf).unwrap();
        assert_eq!(buf, b"FREQ 60\n");
    }

    #[test]
    fn rejects_blank_commands() {
        let mut buf = Vec::new();
        assert_eq!(frame_command("", &mut buf), Err(CommandError::Empty));
        assert_eq!(frame_command(" \n", &mut buf), Err(CommandError::Empty));
    }

    #[test]
    fn rejects_embedded_terminators() {
        let mut buf = Vec::new();
        assert_eq!(
            frame_command("VOLT:AC 100\nOUTP 1", &mut buf),
            Err(CommandError::EmbeddedTerminator)
        );
        assert_eq!(
            frame_command("VOLT:AC 100\rOUTP 1", &mut buf),
            Err(CommandError::EmbeddedTerminator)
        );
    }

    #[test]
    fn detects_queries() {
        assert!(is_query("MEAS:VOLT?"));
        assert!(is_query("*IDN?  \n"));
        assert!(!is_query("VOLT:AC 100"));
        assert!(!is_query("SYST:ERR? ;OUTP 1"));
        assert!(!is_query(""));
    }

    #[test]
    fn decodes_and_trims_response() {
        assert_eq!(decode_response(b"100.000000\n").unwrap(), "100.000000");
        assert_eq!(decode_response(b"  1\r\n").unwrap(), "1");
        assert_eq!(decode_response(b"").unwrap(), "");
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert!(decode_response(&[0x31, 0xff, 0x0a]).is_err());
    }
}
