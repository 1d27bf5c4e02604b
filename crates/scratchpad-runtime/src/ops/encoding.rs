//! Byte/string conversions shared by `Buffer` and the binary host ops.
//!
//! Bytes cross the JS boundary as binary strings: one UTF-16 code unit per
//! byte, each in `0..=255`.

use super::OpError;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use rquickjs::{Ctx, Function, Object};

const FORGIVING: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

const BASE64: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, FORGIVING);
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn bytes_to_binary(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Code points above 255 keep their low byte, like `Buffer.from(s, 'latin1')`.
pub fn binary_to_bytes(binary: &str) -> Vec<u8> {
    binary.chars().map(|c| (c as u32 & 0xff) as u8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Hex,
    Base64,
    Base64Url,
    Latin1,
    Ascii,
}

impl Encoding {
    pub fn parse(name: &str) -> Result<Self, OpError> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            "base64url" => Ok(Self::Base64Url),
            "latin1" | "binary" => Ok(Self::Latin1),
            "ascii" => Ok(Self::Ascii),
            _ => Err(OpError::UnknownEncoding(name.to_string())),
        }
    }
}

/// Render bytes as text in the given encoding.
pub fn encode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Hex => hex::encode(bytes),
        Encoding::Base64 => BASE64.encode(bytes),
        Encoding::Base64Url => BASE64_URL.encode(bytes),
        Encoding::Latin1 => bytes_to_binary(bytes),
        Encoding::Ascii => bytes.iter().map(|&b| char::from(b & 0x7f)).collect(),
    }
}

/// Parse text in the given encoding into bytes.
pub fn decode(text: &str, encoding: Encoding) -> Result<Vec<u8>, OpError> {
    match encoding {
        Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
        Encoding::Hex => {
            // Stops at the first pair that is not hex.
            let even = text.len() - text.len() % 2;
            let valid = text[..even]
                .as_bytes()
                .chunks(2)
                .take_while(|pair| pair.iter().all(u8::is_ascii_hexdigit))
                .count()
                * 2;
            hex::decode(&text[..valid]).map_err(|e| OpError::Decode(e.to_string()))
        }
        Encoding::Base64 | Encoding::Base64Url => {
            let cleaned: String = text
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .map(|c| match c {
                    '-' => '+',
                    '_' => '/',
                    other => other,
                })
                .collect();
            BASE64
                .decode(cleaned.trim_end_matches('='))
                .map_err(|e| OpError::Decode(e.to_string()))
        }
        Encoding::Latin1 | Encoding::Ascii => Ok(binary_to_bytes(text)),
    }
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "encode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, binary: String, encoding: String| -> rquickjs::Result<String> {
                let encoding = Encoding::parse(&encoding).map_err(|e| super::throw(&ctx, e))?;
                Ok(encode(&binary_to_bytes(&binary), encoding))
            },
        )?,
    )?;

    host.set(
        "decode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, text: String, encoding: String| -> rquickjs::Result<String> {
                let encoding = Encoding::parse(&encoding).map_err(|e| super::throw(&ctx, e))?;
                let bytes = decode(&text, encoding).map_err(|e| super::throw(&ctx, e))?;
                Ok(bytes_to_binary(&bytes))
            },
        )?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_strings() {
        let bytes = vec![0u8, 127, 128, 255];
        let binary = bytes_to_binary(&bytes);
        assert_eq!(binary.chars().count(), 4);
        assert_eq!(binary_to_bytes(&binary), bytes);
    }

    #[test]
    fn test_utf8_text_to_bytes() {
        assert_eq!(decode("é", Encoding::Utf8).unwrap(), vec![0xc3, 0xa9]);
        assert_eq!(encode(&[0xc3, 0xa9], Encoding::Utf8), "é");
    }

    #[test]
    fn test_base64_is_forgiving() {
        assert_eq!(encode(b"hi", Encoding::Base64), "aGk=");
        assert_eq!(decode("aGk=", Encoding::Base64).unwrap(), b"hi");
        assert_eq!(decode("aGk", Encoding::Base64).unwrap(), b"hi");
        assert_eq!(decode("aG k=\n", Encoding::Base64).unwrap(), b"hi");
        assert_eq!(encode(&[0xfb, 0xff], Encoding::Base64Url), "-_8");
        assert_eq!(decode("-_8", Encoding::Base64Url).unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_hex_stops_at_garbage() {
        assert_eq!(decode("abzz", Encoding::Hex).unwrap(), vec![0xab]);
        assert_eq!(decode("abc", Encoding::Hex).unwrap(), vec![0xab]);
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(Encoding::parse("utf16").is_err());
        assert_eq!(Encoding::parse("UTF-8").unwrap(), Encoding::Utf8);
    }
}
