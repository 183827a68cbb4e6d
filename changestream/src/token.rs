//! Resume token encoding.
//!
//! A token is the upper-case hex rendering of a small big-endian record:
//!
//! | field | size | notes |
//! |-------|------|-------|
//! | version | 1 | `1` or `2` |
//! | cluster time seconds | 4 | |
//! | cluster time increment | 4 | |
//! | txn index | 4 | |
//! | flags | 1 | bit 0 `fromInvalidate`, bit 1 document key hash present |
//! | event type | 1 | version 2 only, `0` when absent |
//! | document key hash | 8 | only when flagged |
//!
//! Tokens order by `(cluster time, txn index)` and then by the `fromInvalidate` flag. The
//! version, event type and key hash never influence ordering, so tokens of both versions can
//! be compared.

use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cluster::{LogPosition, LogicalTimestamp};
use serde::{Deserialize, Serialize};

use crate::conversions::hash::stable_hash_json;
use crate::conversions::hex::{decode_hex, encode_hex};
use crate::error::{ErrorKind, StreamError, StreamResult};
use crate::types::OperationType;

const FLAG_FROM_INVALIDATE: u8 = 0b01;
const FLAG_DOCUMENT_KEY_HASH: u8 = 0b10;
const KNOWN_FLAGS: u8 = FLAG_FROM_INVALIDATE | FLAG_DOCUMENT_KEY_HASH;

/// Format version of a resume token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenVersion {
    V1,
    #[default]
    V2,
}

impl TokenVersion {
    const fn to_byte(self) -> u8 {
        match self {
            TokenVersion::V1 => 1,
            TokenVersion::V2 => 2,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(TokenVersion::V1),
            2 => Some(TokenVersion::V2),
            _ => None,
        }
    }
}

impl fmt::Display for TokenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.to_byte())
    }
}

/// Decoded contents of a [`ResumeToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenData {
    pub cluster_time: LogicalTimestamp,
    pub txn_index: u32,
    pub version: TokenVersion,
    /// Only carried by version 2 tokens.
    pub event_type: Option<OperationType>,
    pub document_key_hash: Option<u64>,
    /// Set on tokens of synthesized terminal events. Such tokens can only be used to start a
    /// new stream after the event, never to continue the stream that produced it.
    pub from_invalidate: bool,
}

impl TokenData {
    pub fn new(position: LogPosition, version: TokenVersion) -> Self {
        Self {
            cluster_time: position.cluster_time,
            txn_index: position.txn_index,
            version,
            event_type: None,
            document_key_hash: None,
            from_invalidate: false,
        }
    }

    pub fn with_event_type(mut self, event_type: OperationType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_document_key(mut self, document_key: &serde_json::Value) -> Self {
        self.document_key_hash = Some(stable_hash_json(document_key));
        self
    }

    pub fn invalidating(mut self) -> Self {
        self.from_invalidate = true;
        self
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.cluster_time, self.txn_index)
    }
}

/// Opaque, totally ordered position of an event in a change stream.
///
/// Only produced by [`ResumeTokenCodec`] or by parsing a string that decodes successfully.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResumeToken {
    encoded: String,
    data: TokenData,
}

impl ResumeToken {
    pub fn parse(encoded: &str) -> StreamResult<Self> {
        let data = ResumeTokenCodec::decode(encoded)?;
        Ok(Self {
            encoded: encoded.to_ascii_uppercase(),
            data,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn data(&self) -> &TokenData {
        &self.data
    }

    pub fn position(&self) -> LogPosition {
        self.data.position()
    }

    pub fn is_from_invalidate(&self) -> bool {
        self.data.from_invalidate
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for ResumeToken {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResumeToken {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResumeToken> for String {
    fn from(token: ResumeToken) -> Self {
        token.encoded
    }
}

/// Encodes, decodes and orders resume tokens.
pub struct ResumeTokenCodec;

impl ResumeTokenCodec {
    pub fn encode(data: &TokenData) -> ResumeToken {
        let mut data = *data;
        if data.version == TokenVersion::V1 {
            data.event_type = None;
        }

        let mut bytes = Vec::with_capacity(24);
        // Writes into a `Vec` cannot fail.
        let _ = Self::write_record(&mut bytes, &data);

        ResumeToken {
            encoded: encode_hex(&bytes),
            data,
        }
    }

    pub fn decode(encoded: &str) -> StreamResult<TokenData> {
        let bytes = decode_hex(encoded)?;
        let mut reader = Cursor::new(bytes.as_slice());

        let data = Self::read_record(&mut reader).map_err(|err| {
            stream_error!(
                ErrorKind::MalformedResumeToken,
                "Resume token is truncated",
                err
            )
        })??;

        if reader.position() as usize != bytes.len() {
            bail!(
                ErrorKind::MalformedResumeToken,
                "Resume token has trailing bytes",
                format!("expected {} bytes, got {}", reader.position(), bytes.len())
            );
        }

        Ok(data)
    }

    /// Orders tokens by `(cluster time, txn index)`, placing a `fromInvalidate` token after a
    /// regular token at the same position.
    pub fn compare(a: &TokenData, b: &TokenData) -> Ordering {
        (a.cluster_time, a.txn_index, a.from_invalidate).cmp(&(
            b.cluster_time,
            b.txn_index,
            b.from_invalidate,
        ))
    }

    fn write_record(out: &mut Vec<u8>, data: &TokenData) -> std::io::Result<()> {
        out.write_u8(data.version.to_byte())?;
        out.write_u32::<BigEndian>(data.cluster_time.secs)?;
        out.write_u32::<BigEndian>(data.cluster_time.inc)?;
        out.write_u32::<BigEndian>(data.txn_index)?;

        let mut flags = 0;
        if data.from_invalidate {
            flags |= FLAG_FROM_INVALIDATE;
        }
        if data.document_key_hash.is_some() {
            flags |= FLAG_DOCUMENT_KEY_HASH;
        }
        out.write_u8(flags)?;

        if data.version == TokenVersion::V2 {
            out.write_u8(data.event_type.map_or(0, |event_type| event_type.code()))?;
        }
        if let Some(hash) = data.document_key_hash {
            out.write_u64::<BigEndian>(hash)?;
        }

        Ok(())
    }

    /// The outer result reports truncation, the inner one invalid field values.
    fn read_record(reader: &mut Cursor<&[u8]>) -> std::io::Result<StreamResult<TokenData>> {
        let version_byte = reader.read_u8()?;
        let Some(version) = TokenVersion::from_byte(version_byte) else {
            return Ok(Err(stream_error!(
                ErrorKind::MalformedResumeToken,
                "Resume token has an unknown version",
                format!("version byte {version_byte}")
            )));
        };

        let secs = reader.read_u32::<BigEndian>()?;
        let inc = reader.read_u32::<BigEndian>()?;
        let txn_index = reader.read_u32::<BigEndian>()?;

        let flags = reader.read_u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Ok(Err(stream_error!(
                ErrorKind::MalformedResumeToken,
                "Resume token has unknown flags",
                format!("flags {flags:#04x}")
            )));
        }

        let event_type = match version {
            TokenVersion::V1 => None,
            TokenVersion::V2 => match reader.read_u8()? {
                0 => None,
                code => match OperationType::from_code(code) {
                    Some(event_type) => Some(event_type),
                    None => {
                        return Ok(Err(stream_error!(
                            ErrorKind::MalformedResumeToken,
                            "Resume token has an unknown event type",
                            format!("event type {code}")
                        )));
                    }
                },
            },
        };

        let document_key_hash = if flags & FLAG_DOCUMENT_KEY_HASH != 0 {
            Some(reader.read_u64::<BigEndian>()?)
        } else {
            None
        };

        Ok(Ok(TokenData {
            cluster_time: LogicalTimestamp::new(secs, inc),
            txn_index,
            version,
            event_type,
            document_key_hash,
            from_invalidate: flags & FLAG_FROM_INVALIDATE != 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position(secs: u32, inc: u32, txn_index: u32) -> LogPosition {
        LogPosition::new(LogicalTimestamp::new(secs, inc), txn_index)
    }

    #[test]
    fn v1_layout_is_stable() {
        let token = ResumeTokenCodec::encode(&TokenData::new(position(1, 2, 3), TokenVersion::V1));
        assert_eq!(token.as_str(), "0100000001000000020000000300");
    }

    #[test]
    fn decode_restores_every_field() {
        let data = TokenData::new(position(7, 1, 4), TokenVersion::V2)
            .with_event_type(OperationType::Update)
            .with_document_key(&json!({ "_id": 5 }))
            .invalidating();

        let token = ResumeTokenCodec::encode(&data);
        assert_eq!(ResumeTokenCodec::decode(token.as_str()).unwrap(), data);
        assert_eq!(ResumeToken::parse(&token.as_str().to_lowercase()).unwrap(), token);
    }

    #[test]
    fn version_does_not_change_order() {
        let v1 = TokenData::new(position(5, 0, 1), TokenVersion::V1);
        let v2 = TokenData::new(position(5, 0, 1), TokenVersion::V2)
            .with_event_type(OperationType::Insert);
        assert_eq!(ResumeTokenCodec::compare(&v1, &v2), Ordering::Equal);

        let later_txn = TokenData::new(position(5, 0, 2), TokenVersion::V1);
        assert_eq!(ResumeTokenCodec::compare(&v2, &later_txn), Ordering::Less);

        let later_time = TokenData::new(position(5, 1, 0), TokenVersion::V2);
        assert_eq!(ResumeTokenCodec::compare(&later_txn, &later_time), Ordering::Less);
    }

    #[test]
    fn invalidate_sorts_after_same_position() {
        let regular = TokenData::new(position(3, 0, 0), TokenVersion::V2);
        let invalidate = regular.invalidating();
        assert_eq!(
            ResumeTokenCodec::compare(&regular, &invalidate),
            Ordering::Less
        );
    }

    #[test]
    fn truncated_token_is_malformed() {
        let token = ResumeTokenCodec::encode(&TokenData::new(position(1, 0, 0), TokenVersion::V2));
        let truncated = &token.as_str()[..token.as_str().len() - 2];

        let err = ResumeToken::parse(truncated).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResumeToken);
    }

    #[test]
    fn garbage_is_malformed() {
        let unknown_version = format!("09{}", "00".repeat(13));
        let unknown_flags = format!("01{}04", "00".repeat(12));
        for input in ["", "zz", unknown_version.as_str(), unknown_flags.as_str()] {
            let err = ResumeToken::parse(input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedResumeToken, "input {input:?}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let token = ResumeTokenCodec::encode(&TokenData::new(position(1, 0, 0), TokenVersion::V1));
        let err = ResumeToken::parse(&format!("{token}00")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResumeToken);
    }

    #[test]
    fn serde_uses_the_encoded_string() {
        let token = ResumeTokenCodec::encode(&TokenData::new(position(2, 0, 0), TokenVersion::V2));
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{token}\""));

        let parsed: ResumeToken = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, token);
        assert!(serde_json::from_str::<ResumeToken>("\"nope\"").is_err());
    }
}
