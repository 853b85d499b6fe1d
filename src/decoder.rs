//! Tryte Record Codec
//!
//! Decodes fixed-width tryte-encoded transactions into semantic fields by
//! fixed byte offsets, including the positional base-27 integer encoding
//! used for numeric fields.

use thiserror::Error;

/// The 27 tryte symbols; a symbol's index in this table is its digit value.
pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of a full transaction payload in trytes, excluding the hash the
/// transport appends after it.
pub const TRANSACTION_TRYTES_LEN: usize = 2673;

/// Length of a transaction hash in trytes.
pub const TRANSACTION_HASH_LEN: usize = 81;

/// Timestamps above this magnitude are taken to be milliseconds.
pub const MILLIS_THRESHOLD: i128 = 10_000_000_000;

/// Errors that can occur while decoding a record. All of these are
/// per-record conditions; callers skip the offending record and continue.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("field range {begin}..{end} out of bounds for record of length {len}")]
    OutOfBounds { begin: usize, end: usize, len: usize },

    #[error("empty field range {begin}..{end}")]
    EmptyRange { begin: usize, end: usize },

    #[error("symbol {0:?} is not a tryte")]
    InvalidSymbol(char),

    #[error("decoded integer overflows for field range {begin}..{end}")]
    Overflow { begin: usize, end: usize },

    #[error("field {0} is not carried by this record shape")]
    MissingField(&'static str),
}

/// The named fields of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SignatureMessageFragment,
    Address,
    Value,
    ObsoleteTag,
    Timestamp,
    CurrentIndex,
    LastIndex,
    Bundle,
    Trunk,
    Branch,
    Tag,
    AttachmentTimestamp,
    Nonce,
    /// The transaction hash is transmitted separately and appended after
    /// the payload, so its range is anchored to the end of the record.
    TransactionHash,
}

/// Location of a field inside a record: either a fixed `[begin, end)`
/// tryte range, or a fixed-length suffix counted backward from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSpan {
    Fixed { begin: usize, end: usize },
    FromEnd(usize),
}

impl Field {
    /// The field's span, stable for the lifetime of the protocol version.
    /// Spans of distinct fields never overlap.
    pub const fn span(self) -> FieldSpan {
        match self {
            Field::SignatureMessageFragment => FieldSpan::Fixed { begin: 0, end: 2187 },
            Field::Address => FieldSpan::Fixed { begin: 2187, end: 2268 },
            Field::Value => FieldSpan::Fixed { begin: 2268, end: 2295 },
            Field::ObsoleteTag => FieldSpan::Fixed { begin: 2295, end: 2322 },
            Field::Timestamp => FieldSpan::Fixed { begin: 2322, end: 2331 },
            Field::CurrentIndex => FieldSpan::Fixed { begin: 2331, end: 2340 },
            Field::LastIndex => FieldSpan::Fixed { begin: 2340, end: 2349 },
            Field::Bundle => FieldSpan::Fixed { begin: 2349, end: 2430 },
            Field::Trunk => FieldSpan::Fixed { begin: 2430, end: 2511 },
            Field::Branch => FieldSpan::Fixed { begin: 2511, end: 2592 },
            Field::Tag => FieldSpan::Fixed { begin: 2592, end: 2619 },
            Field::AttachmentTimestamp => FieldSpan::Fixed { begin: 2619, end: 2628 },
            Field::Nonce => FieldSpan::Fixed { begin: 2646, end: 2673 },
            Field::TransactionHash => FieldSpan::FromEnd(TRANSACTION_HASH_LEN),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Field::SignatureMessageFragment => "signature_message_fragment",
            Field::Address => "address",
            Field::Value => "value",
            Field::ObsoleteTag => "obsolete_tag",
            Field::Timestamp => "timestamp",
            Field::CurrentIndex => "current_index",
            Field::LastIndex => "last_index",
            Field::Bundle => "bundle",
            Field::Trunk => "trunk",
            Field::Branch => "branch",
            Field::Tag => "tag",
            Field::AttachmentTimestamp => "attachment_timestamp",
            Field::Nonce => "nonce",
            Field::TransactionHash => "transaction_hash",
        }
    }

    /// Resolve the span against a concrete record length.
    fn range(self, len: usize) -> Result<(usize, usize), DecodeError> {
        match self.span() {
            FieldSpan::Fixed { begin, end } => {
                if end > len {
                    return Err(DecodeError::OutOfBounds { begin, end, len });
                }
                Ok((begin, end))
            }
            FieldSpan::FromEnd(n) => {
                if n > len {
                    return Err(DecodeError::OutOfBounds { begin: 0, end: n, len });
                }
                Ok((len - n, len))
            }
        }
    }
}

fn tryte_digit(symbol: u8) -> Result<i128, DecodeError> {
    match symbol {
        b'9' => Ok(0),
        b'A'..=b'Z' => Ok(i128::from(symbol - b'A') + 1),
        other => Err(DecodeError::InvalidSymbol(other as char)),
    }
}

/// Decode the byte range `[begin, end)` of `record` as a little-endian
/// positional base-27 integer: the first symbol is the least significant.
///
/// The encoding carries no sign; every decoded integer is non-negative.
pub fn trytes_to_int(record: &str, begin: usize, end: usize) -> Result<i128, DecodeError> {
    if begin >= end {
        return Err(DecodeError::EmptyRange { begin, end });
    }
    let bytes = record.as_bytes();
    if end > bytes.len() {
        return Err(DecodeError::OutOfBounds { begin, end, len: bytes.len() });
    }

    let mut value: i128 = 0;
    let mut weight: i128 = 1;
    let width = end - begin;
    for (i, &symbol) in bytes[begin..end].iter().enumerate() {
        let digit = tryte_digit(symbol)?;
        if digit != 0 {
            value = weight
                .checked_mul(digit)
                .and_then(|term| value.checked_add(term))
                .ok_or(DecodeError::Overflow { begin, end })?;
        }
        if i + 1 < width {
            weight = weight
                .checked_mul(27)
                .ok_or(DecodeError::Overflow { begin, end })?;
        }
    }
    Ok(value)
}

/// Encode a non-negative integer as little-endian trytes, 9-padded to
/// `width` symbols. The inverse of [`trytes_to_int`] over that width.
pub fn int_to_trytes(mut value: i128, width: usize) -> String {
    let mut out = Vec::with_capacity(width);
    for _ in 0..width {
        let digit = (value.rem_euclid(27)) as usize;
        out.push(TRYTE_ALPHABET[digit]);
        value /= 27;
    }
    // The symbols are ASCII by construction.
    String::from_utf8(out).unwrap_or_default()
}

/// Extract a field's tryte slice from a raw record.
///
/// Offsets are byte positions, so the slice is validated symbol by
/// symbol before it is taken: a record carrying non-tryte bytes (for
/// instance multibyte text in a corrupt dump line) yields
/// [`DecodeError::InvalidSymbol`] instead of slicing across a char
/// boundary.
pub fn field_slice(record: &str, field: Field) -> Result<&str, DecodeError> {
    let bytes = record.as_bytes();
    let (begin, end) = field.range(bytes.len())?;
    let slice = bytes
        .get(begin..end)
        .ok_or(DecodeError::OutOfBounds { begin, end, len: bytes.len() })?;
    for &symbol in slice {
        if symbol != b'9' && !symbol.is_ascii_uppercase() {
            return Err(DecodeError::InvalidSymbol(char::from(symbol)));
        }
    }
    // Every symbol is ASCII, so the range falls on char boundaries.
    record
        .get(begin..end)
        .ok_or(DecodeError::OutOfBounds { begin, end, len: bytes.len() })
}

/// Decode a numeric field from a raw record.
pub fn decode_field(record: &str, field: Field) -> Result<i128, DecodeError> {
    let (begin, end) = field.range(record.len())?;
    trytes_to_int(record, begin, end)
}

/// Rescale a timestamp that was encoded in milliseconds down to seconds.
/// Values at or below [`MILLIS_THRESHOLD`] are already seconds.
pub fn normalize_seconds(value: i128) -> i128 {
    if value > MILLIS_THRESHOLD {
        value / 1000
    } else {
        value
    }
}

/// A transaction parsed into its structural fields.
///
/// Numeric fields keep the raw decoded magnitude; in particular
/// `attachment_timestamp` stays in milliseconds, as transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: String,
    pub signature_message_fragment: String,
    pub address: String,
    pub value: i128,
    pub obsolete_tag: String,
    pub timestamp: i64,
    pub current_index: i64,
    pub last_index: i64,
    pub bundle: String,
    pub trunk: String,
    pub branch: String,
    pub tag: String,
    pub attachment_timestamp: i64,
    pub nonce: String,
}

impl Transaction {
    /// Parse every structural field out of a raw tryte payload. The hash
    /// travels separately on the wire and is supplied by the caller.
    pub fn from_trytes(trytes: &str, hash: &str) -> Result<Self, DecodeError> {
        let int_field = |field: Field| -> Result<i64, DecodeError> {
            let (begin, end) = field.range(trytes.len())?;
            let value = trytes_to_int(trytes, begin, end)?;
            i64::try_from(value).map_err(|_| DecodeError::Overflow { begin, end })
        };

        Ok(Transaction {
            hash: hash.to_string(),
            signature_message_fragment: field_slice(trytes, Field::SignatureMessageFragment)?
                .to_string(),
            address: field_slice(trytes, Field::Address)?.to_string(),
            value: decode_field(trytes, Field::Value)?,
            obsolete_tag: field_slice(trytes, Field::ObsoleteTag)?.to_string(),
            timestamp: int_field(Field::Timestamp)?,
            current_index: int_field(Field::CurrentIndex)?,
            last_index: int_field(Field::LastIndex)?,
            bundle: field_slice(trytes, Field::Bundle)?.to_string(),
            trunk: field_slice(trytes, Field::Trunk)?.to_string(),
            branch: field_slice(trytes, Field::Branch)?.to_string(),
            tag: field_slice(trytes, Field::Tag)?.to_string(),
            attachment_timestamp: int_field(Field::AttachmentTimestamp)?,
            nonce: field_slice(trytes, Field::Nonce)?.to_string(),
        })
    }
}
