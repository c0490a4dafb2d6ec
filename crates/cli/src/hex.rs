//! Hex payload parsing and formatting for the command line

use anyhow::{Result, anyhow};

/// Parse bytes written as hex, e.g. `"01 02 ff"`, `"0102ff"` or `"0x01,0x02"`
pub fn parse_bytes(input: &str) -> Result<Vec<u8>> {
    let mut digits = String::with_capacity(input.len());
    for token in input.split(|c: char| c.is_whitespace() || c == ',' || c == ':') {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if token.len() % 2 != 0 {
            // "1" in "1 2 3" is one byte, not half of one
            digits.push('0');
        }
        digits.push_str(token);
    }

    if digits.is_empty() {
        return Err(anyhow!("No bytes given"));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|_| anyhow!("Invalid hex input"))?;
            u8::from_str_radix(pair, 16).map_err(|_| anyhow!("Invalid hex byte '{}'", pair))
        })
        .collect()
}

/// Format bytes as space-separated lowercase hex
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_bytes("0102ff").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_bytes("01 02 ff").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_bytes("0x01,0x02").unwrap(), vec![0x01, 0x02]);
        assert_eq!(parse_bytes("1 2 a").unwrap(), vec![0x01, 0x02, 0x0a]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("zz").is_err());
        assert!(parse_bytes("   ").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format_bytes(&[0x00, 0xab, 0x10]), "00 ab 10");
        assert_eq!(format_bytes(&[]), "");
    }
}
