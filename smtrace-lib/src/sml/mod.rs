//! Smart Message Language decoding.
//!
//! Only what is needed to read meter values is decoded: the messages of a telegram
//! are walked and the value lists of `GetList.Res` messages are returned. All other
//! message types are skipped.
//!
//! References:
//! * BSI TR-03109-1 Anlage IV, Smart Message Language 1.04
mod tlv;

use std::fmt::Display;

use tlv::{Node, Parser};
use tracing::trace;

use crate::framing::Frame;
use crate::measurement::Value;
use crate::{Error, Result};

/// Message body tag of an `SML_GetList.Res`.
pub const GET_LIST_RESPONSE: u64 = 0x0701;

/// OBIS object identifier, `A-B:C.D.E*F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObisCode(pub [u8; 6]);

impl ObisCode {
    #[must_use]
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        ObisCode([a, b, c, d, e, f])
    }
}

impl Display for ObisCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}-{b}:{c}.{d}.{e}*{g}")
    }
}

impl TryFrom<&[u8]> for ObisCode {
    type Error = Error;

    fn try_from(dat: &[u8]) -> Result<Self> {
        let code: [u8; 6] = dat.try_into().map_err(|_| Error::Decode {
            offset: 0,
            reason: format!("object name must be 6 bytes, got {}", dat.len()),
        })?;
        Ok(ObisCode(code))
    }
}

/// Value of a list entry as transmitted, before scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Bytes(Vec<u8>),
}

/// One entry of an `SML_GetList.Res` value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmlEntry {
    pub object_id: ObisCode,
    pub value: Option<RawValue>,
    pub scaler: Option<i8>,
    /// DLMS unit code.
    pub unit: Option<u8>,
}

impl SmlEntry {
    /// The entry value with the scaler applied.
    ///
    /// Numbers are multiplied by `10^scaler`, staying integral for non-negative
    /// scalers. Octet strings become quoted text when they are printable UTF-8 and
    /// space separated hex otherwise.
    #[must_use]
    pub fn scaled_value(&self) -> Option<Value> {
        let raw = self.value.as_ref()?;
        let value = match raw {
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::Bytes(dat) => match std::str::from_utf8(dat) {
                Ok(s) if !s.chars().any(char::is_control) => Value::Text(s.to_string()),
                _ => Value::Hex(
                    dat.iter()
                        .map(|b| hex::encode_upper([*b]))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
            },
            RawValue::Int(v) => scale(*v as f64, Some(*v), self.scaler),
            RawValue::Uint(v) => scale(*v as f64, i64::try_from(*v).ok(), self.scaler),
        };
        Some(value)
    }
}

fn scale(approx: f64, exact: Option<i64>, scaler: Option<i8>) -> Value {
    let scaler = scaler.unwrap_or(0);
    if scaler >= 0 {
        let scaled = exact.and_then(|v| {
            10i64
                .checked_pow(u32::from(scaler.unsigned_abs()))
                .and_then(|m| v.checked_mul(m))
        });
        match scaled {
            Some(v) => Value::Integer(v),
            None => Value::Decimal(approx * 10f64.powi(i32::from(scaler))),
        }
    } else {
        Value::Decimal(approx / 10f64.powi(-i32::from(scaler)))
    }
}

/// Decodes a [Frame] into its measurement entries.
///
/// Errors are local to the frame being decoded.
pub trait FrameDecoder: Send {
    fn decode(&self, frame: &Frame) -> Result<Vec<SmlEntry>>;
}

/// [FrameDecoder] for SML 1.04 telegrams.
#[derive(Debug, Default, Clone)]
pub struct SmlDecoder {
    verify_crc: bool,
}

impl SmlDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames whose transport CRC does not match.
    #[must_use]
    pub fn with_crc_check(mut self, enabled: bool) -> Self {
        self.verify_crc = enabled;
        self
    }
}

impl FrameDecoder for SmlDecoder {
    fn decode(&self, frame: &Frame) -> Result<Vec<SmlEntry>> {
        if self.verify_crc {
            frame.verify_crc()?;
        }
        let message = frame.message();
        let mut parser = Parser::new(&message);
        let mut entries = Vec::default();

        while !parser.is_empty() {
            let offset = parser.offset();
            match parser.node()? {
                Node::EndOfMessage => {}
                Node::List(fields) => {
                    if let Some(list) = get_list_response(&fields, offset)? {
                        entries.extend(list);
                    }
                }
                other => {
                    return Err(Error::Decode {
                        offset,
                        reason: format!("expected message, got {other:?}"),
                    })
                }
            }
        }

        Ok(entries)
    }
}

/// Extract value list entries if `fields` is a `GetList.Res` message, `None` for any
/// other message type.
fn get_list_response(fields: &[Node], offset: usize) -> Result<Option<Vec<SmlEntry>>> {
    let malformed = |reason: &str| Error::Decode {
        offset,
        reason: reason.to_string(),
    };

    // transactionId, groupNo, abortOnError, messageBody, crc16, endOfSmlMsg
    let body = fields
        .get(3)
        .and_then(Node::as_list)
        .ok_or_else(|| malformed("message without body"))?;
    let [tag, content] = body else {
        return Err(malformed("message body must have 2 elements"));
    };
    let tag = tag
        .as_uint()
        .ok_or_else(|| malformed("message body tag is not a number"))?;
    if tag != GET_LIST_RESPONSE {
        trace!(tag = format!("{tag:#06x}"), "skipping message");
        return Ok(None);
    }

    // clientId, serverId, listName, actSensorTime, valList, listSignature, actGatewayTime
    let values = content
        .as_list()
        .and_then(|c| c.get(4))
        .and_then(Node::as_list)
        .ok_or_else(|| malformed("GetList.Res without value list"))?;

    let mut entries = Vec::with_capacity(values.len());
    for item in values {
        // objName, status, valTime, unit, scaler, value, valueSignature
        let Some([name, _status, _time, unit, scaler, value, ..]) = item.as_list() else {
            return Err(malformed("value list entry must have 7 elements"));
        };
        let Node::Bytes(name) = name else {
            return Err(malformed("value list entry without object name"));
        };
        entries.push(SmlEntry {
            object_id: ObisCode::try_from(name.as_slice())?,
            value: match value {
                Node::Bool(b) => Some(RawValue::Bool(*b)),
                Node::Int(v) => Some(RawValue::Int(*v)),
                Node::Uint(v) => Some(RawValue::Uint(*v)),
                Node::Bytes(b) => Some(RawValue::Bytes(b.clone())),
                _ => None,
            },
            scaler: scaler.as_int().and_then(|s| i8::try_from(s).ok()),
            unit: unit.as_uint().and_then(|u| u8::try_from(u).ok()),
        });
    }

    Ok(Some(entries))
}
