//! Text encodings of raw images, for files and the printer diagnostic port.
//!
//! Both formats convert bytes only; they know nothing about layouts.

use thiserror::Error;

/// Hex digits per line of a hex-ASCII dump.
pub const HEX_LINE_WIDTH: usize = 32;

#[derive(Error, Debug, PartialEq)]
pub enum FormatError {
    #[error("Invalid byte token {0:?}")]
    InvalidToken(String),
    #[error("Invalid hex text: {0}")]
    Hex(#[from] hex::FromHexError),
}

pub trait TextFormat {
    fn format(&self, image: &[u8]) -> String;
    fn parse(&self, text: &str) -> Result<Vec<u8>, FormatError>;
}

// ── HexAscii ─────────────────────────────────────────────────────────────────

/// Lowercase hex, 32 digits per line, behind an optional `# ` comment header.
#[derive(Debug, Clone, Default)]
pub struct HexAscii {
    pub header: Vec<String>,
}

impl HexAscii {
    pub fn with_header(header: Vec<String>) -> Self {
        Self { header }
    }
}

impl TextFormat for HexAscii {
    fn format(&self, image: &[u8]) -> String {
        let mut out = String::new();
        if !self.header.is_empty() {
            for line in &self.header {
                out.push_str("# ");
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("#\n");
        }
        let digits = hex::encode(image);
        for chunk in digits.as_bytes().chunks(HEX_LINE_WIDTH) {
            // Hex output is ASCII.
            out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
            out.push('\n');
        }
        out
    }

    /// Comment lines are skipped; whitespace inside data lines is ignored.
    fn parse(&self, text: &str) -> Result<Vec<u8>, FormatError> {
        let digits: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(|line| line.chars().filter(|c| !c.is_whitespace()))
            .collect();
        Ok(hex::decode(digits)?)
    }
}

// ── DiagPort ─────────────────────────────────────────────────────────────────

/// `xx, xx, …` byte list spoken over the diagnostic serial port.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagPort;

impl TextFormat for DiagPort {
    fn format(&self, image: &[u8]) -> String {
        image.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(", ")
    }

    /// Tokens may be separated by commas or whitespace and carry a `0x` prefix.
    fn parse(&self, text: &str) -> Result<Vec<u8>, FormatError> {
        text.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                let digits = tok
                    .strip_prefix("0x")
                    .or_else(|| tok.strip_prefix("0X"))
                    .unwrap_or(tok);
                if digits.is_empty() || digits.len() > 2 {
                    return Err(FormatError::InvalidToken(tok.to_owned()));
                }
                u8::from_str_radix(digits, 16).map_err(|_| FormatError::InvalidToken(tok.to_owned()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_ascii_wraps_at_32_digits() {
        let data: Vec<u8> = (0u8..20).collect();
        let text = HexAscii::default().format(&data);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, ["000102030405060708090a0b0c0d0e0f", "10111213"]);
    }

    #[test]
    fn hex_ascii_header_is_commented_out() {
        let fmt = HexAscii::with_header(vec!["eeprom uid: 11010a01ba325d23".into()]);
        let text = fmt.format(&[0xde, 0xad]);
        assert_eq!(text, "# eeprom uid: 11010a01ba325d23\n#\ndead\n");
        assert_eq!(fmt.parse(&text).unwrap(), [0xde, 0xad]);
    }

    #[test]
    fn hex_ascii_rejects_odd_digits() {
        assert_eq!(HexAscii::default().parse("abc\n"), Err(FormatError::Hex(hex::FromHexError::OddLength)));
    }

    #[test]
    fn diag_port_format() {
        assert_eq!(DiagPort.format(&[0x00, 0x1f, 0xff]), "00, 1f, ff");
        assert_eq!(DiagPort.format(&[]), "");
    }

    #[test]
    fn diag_port_parse_is_lenient_about_separators() {
        assert_eq!(DiagPort.parse("00, 1f,ff\n 0x7").unwrap(), [0x00, 0x1f, 0xff, 0x07]);
    }

    #[test]
    fn diag_port_parse_rejects_garbage() {
        assert_eq!(DiagPort.parse("00, 123"), Err(FormatError::InvalidToken("123".into())));
        assert_eq!(DiagPort.parse("zz"), Err(FormatError::InvalidToken("zz".into())));
    }
}
