use crate::bail;
use crate::error::{ErrorKind, StreamResult};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Encodes bytes as upper-case hexadecimal.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Decodes a hexadecimal string of either case into bytes.
pub fn decode_hex(hex: &str) -> StreamResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!(
            ErrorKind::MalformedResumeToken,
            "Could not decode hex string",
            "The number of digits is odd"
        );
    }

    let mut result = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks(2) {
        let (Some(high), Some(low)) = (digit_value(pair[0]), digit_value(pair[1])) else {
            bail!(
                ErrorKind::MalformedResumeToken,
                "Could not decode hex string",
                "The string contains a non hexadecimal character"
            );
        };
        result.push((high << 4) | low);
    }

    Ok(result)
}

fn digit_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
