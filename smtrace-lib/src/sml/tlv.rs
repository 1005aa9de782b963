//! SML type-length-value encoding.
use crate::{Error, Result};

const TYPE_OCTETS: u8 = 0b000;
const TYPE_BOOL: u8 = 0b100;
const TYPE_INT: u8 = 0b101;
const TYPE_UINT: u8 = 0b110;
const TYPE_LIST: u8 = 0b111;

const MAX_DEPTH: usize = 16;

/// One decoded SML element.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    /// Optional element not present (`0x01`).
    Absent,
    /// `endOfSmlMsg` (`0x00`).
    EndOfMessage,
    Bytes(Vec<u8>),
    Bool(bool),
    Int(i64),
    Uint(u64),
    List(Vec<Node>),
}

impl Node {
    pub(crate) fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn as_uint(&self) -> Option<u64> {
        match self {
            Node::Uint(v) => Some(*v),
            Node::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Node::Int(v) => Some(*v),
            Node::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

pub(crate) struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Parser { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::Decode {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn byte(&mut self) -> Result<u8> {
        let Some(b) = self.buf.get(self.pos) else {
            return Err(Error::NotEnoughData {
                actual: self.buf.len(),
                minimum: self.pos + 1,
            });
        };
        self.pos += 1;
        Ok(*b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = match self.pos.checked_add(len) {
            Some(end) if end <= self.buf.len() => end,
            end => {
                return Err(Error::NotEnoughData {
                    actual: self.buf.len(),
                    minimum: end.unwrap_or(usize::MAX),
                })
            }
        };
        let data = &self.buf[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    /// Read a type-length field, returning type, length and the number of TL octets.
    fn type_length(&mut self) -> Result<(u8, usize, usize)> {
        let first = self.byte()?;
        let kind = (first >> 4) & 0x07;
        let mut len = usize::from(first & 0x0f);
        let mut count = 1;
        let mut more = first & 0x80 != 0;
        while more {
            let b = self.byte()?;
            if (b >> 4) & 0x07 != 0 {
                return Err(self.error(format!("invalid TL continuation {b:#04x}")));
            }
            if len > usize::MAX >> 4 {
                return Err(self.error("TL length overflows"));
            }
            len = (len << 4) | usize::from(b & 0x0f);
            count += 1;
            more = b & 0x80 != 0;
        }
        Ok((kind, len, count))
    }

    /// Parse the next element.
    pub(crate) fn node(&mut self) -> Result<Node> {
        self.node_at(0)
    }

    fn node_at(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        if self.buf.get(self.pos) == Some(&0x00) {
            self.pos += 1;
            return Ok(Node::EndOfMessage);
        }

        let (kind, len, tl_len) = self.type_length()?;
        if kind == TYPE_LIST {
            let mut items = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                items.push(self.node_at(depth + 1)?);
            }
            return Ok(Node::List(items));
        }

        // For scalar types the length includes the TL octets themselves
        let Some(data_len) = len.checked_sub(tl_len) else {
            return Err(self.error(format!("length {len} shorter than TL field")));
        };
        if kind == TYPE_OCTETS && data_len == 0 {
            return Ok(Node::Absent);
        }
        let data = self.take(data_len)?;

        match kind {
            TYPE_OCTETS => Ok(Node::Bytes(data.to_vec())),
            TYPE_BOOL => match data {
                [b] => Ok(Node::Bool(*b != 0)),
                _ => Err(self.error(format!("boolean of length {data_len}"))),
            },
            TYPE_INT => {
                if data.is_empty() || data.len() > 8 {
                    return Err(self.error(format!("integer of length {data_len}")));
                }
                let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
                for b in data {
                    v = (v << 8) | i64::from(*b);
                }
                Ok(Node::Int(v))
            }
            TYPE_UINT => {
                if data.is_empty() || data.len() > 8 {
                    return Err(self.error(format!("unsigned of length {data_len}")));
                }
                let v = data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                Ok(Node::Uint(v))
            }
            _ => Err(self.error(format!("unknown type {kind:#05b}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(dat: &[u8]) -> Node {
        Parser::new(dat).node().unwrap()
    }

    #[test_case(&[0x52, 0xff], Node::Int(-1); "int8 negative")]
    #[test_case(&[0x53, 0x01, 0x00], Node::Int(256); "int16")]
    #[test_case(&[0x55, 0xff, 0xff, 0xff, 0xfe], Node::Int(-2); "int32 negative")]
    #[test_case(&[0x62, 0x1e], Node::Uint(30); "uint8")]
    #[test_case(&[0x65, 0x00, 0x01, 0x00, 0x00], Node::Uint(65536); "uint32")]
    #[test_case(&[0x42, 0x01], Node::Bool(true); "bool")]
    #[test_case(&[0x01], Node::Absent; "optional absent")]
    #[test_case(&[0x00], Node::EndOfMessage; "end of message")]
    #[test_case(&[0x04, 0x41, 0x42, 0x43], Node::Bytes(b"ABC".to_vec()); "octet string")]
    fn scalar(dat: &[u8], expected: Node) {
        assert_eq!(parse(dat), expected);
    }

    #[test]
    fn nested_list() {
        let node = parse(&[0x72, 0x62, 0x01, 0x71, 0x01]);
        assert_eq!(
            node,
            Node::List(vec![Node::Uint(1), Node::List(vec![Node::Absent])])
        );
    }

    #[test]
    fn multi_byte_length() {
        // 0x81 0x03: octet string, length 0x13 including the two TL octets
        let mut dat = vec![0x81, 0x03];
        dat.extend_from_slice(&[0xaa; 17]);
        assert_eq!(parse(&dat), Node::Bytes(vec![0xaa; 17]));
    }

    #[test]
    fn truncated_input_fails() {
        let zult = Parser::new(&[0x05, 0x41]).node();
        assert!(matches!(zult, Err(Error::NotEnoughData { .. })));
    }

    #[test]
    fn invalid_continuation_fails() {
        let zult = Parser::new(&[0x81, 0x73]).node();
        assert!(matches!(zult, Err(Error::Decode { .. })));
    }

    #[test]
    fn huge_length_fails_without_overflow() {
        let mut dat = vec![0x71];
        dat.extend_from_slice(&[0x8f; 15]);
        dat.push(0x0f);
        let zult = Parser::new(&dat).node();
        assert!(matches!(zult, Err(Error::NotEnoughData { .. })));
    }

    #[test]
    fn length_wider_than_usize_fails() {
        let mut dat = vec![0x8f; 17];
        dat.push(0x0f);
        let zult = Parser::new(&dat).node();
        assert!(matches!(zult, Err(Error::Decode { .. })));
    }
}
