//! Composable Filter Engine
//!
//! Builds predicates over transactions — set membership, relational range
//! and time window — and composes them into a conjunctive chain. Every
//! predicate works on both record shapes: the raw tryte blob (fields read
//! by fixed offset) and the parsed structure handed over by the transport
//! client. Only the field-extraction step differs between the two.

use std::collections::HashSet;

use thiserror::Error;
use tracing::error;

use crate::decoder::{self, DecodeError, Field, Transaction};

/// Milestones whose attachment timestamps are known to be unreliable; for
/// records in these dump batches the primary timestamp is used directly.
pub const TIMESTAMP_ONLY_MILESTONES: [&str; 8] = [
    "6000", "13157", "18675", "61491", "150354", "216223", "242662", "337541",
];

/// Whether `milestone` belongs to the default timestamp-only set.
pub fn is_timestamp_only(milestone: &str) -> bool {
    TIMESTAMP_ONLY_MILESTONES.contains(&milestone)
}

/// Errors raised while building a filter. These are configuration errors:
/// the process must not start processing with an invalid chain.
#[derive(Error, Debug)]
pub enum FilterConfigError {
    #[error("unknown relational mode {0:?}, expected one of R, m, M, E, RE, mE, ME")]
    UnknownMode(String),

    #[error("date {0:?} is not a YYYYMMDD calendar date")]
    BadDate(String),
}

/// The seven relational comparison modes, resolved once at build time from
/// their configuration shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationalMode {
    /// `min < v < max` (`"R"`)
    Within,
    /// `v > min` (`"m"`)
    Above,
    /// `v < max` (`"M"`)
    Below,
    /// `v == min` (`"E"`)
    Equal,
    /// `min <= v <= max` (`"RE"`)
    WithinInclusive,
    /// `v >= min` (`"mE"`)
    AtLeast,
    /// `v <= max` (`"ME"`)
    AtMost,
}

impl RelationalMode {
    pub fn parse(mode: &str) -> Result<Self, FilterConfigError> {
        match mode {
            "R" => Ok(RelationalMode::Within),
            "m" => Ok(RelationalMode::Above),
            "M" => Ok(RelationalMode::Below),
            "E" => Ok(RelationalMode::Equal),
            "RE" => Ok(RelationalMode::WithinInclusive),
            "mE" => Ok(RelationalMode::AtLeast),
            "ME" => Ok(RelationalMode::AtMost),
            other => Err(FilterConfigError::UnknownMode(other.to_string())),
        }
    }

    pub fn test(self, value: i128, min: i128, max: i128) -> bool {
        match self {
            RelationalMode::Within => value > min && value < max,
            RelationalMode::Above => value > min,
            RelationalMode::Below => value < max,
            RelationalMode::Equal => value == min,
            RelationalMode::WithinInclusive => value >= min && value <= max,
            RelationalMode::AtLeast => value >= min,
            RelationalMode::AtMost => value <= max,
        }
    }
}

/// The two shapes a transaction reaches the filters in.
#[derive(Debug, Clone, Copy)]
pub enum Record<'a> {
    /// Raw tryte blob; fields are read through the offset table. The
    /// transaction hash, when present, is appended after the payload.
    Raw(&'a str),
    /// Structure already parsed by the transport client.
    Parsed(&'a Transaction),
}

impl Record<'_> {
    fn field_str(&self, field: Field) -> Result<&str, DecodeError> {
        match self {
            Record::Raw(trytes) => decoder::field_slice(trytes, field),
            Record::Parsed(tx) => match field {
                Field::SignatureMessageFragment => Ok(&tx.signature_message_fragment),
                Field::Address => Ok(&tx.address),
                Field::ObsoleteTag => Ok(&tx.obsolete_tag),
                Field::Bundle => Ok(&tx.bundle),
                Field::Trunk => Ok(&tx.trunk),
                Field::Branch => Ok(&tx.branch),
                Field::Tag => Ok(&tx.tag),
                Field::Nonce => Ok(&tx.nonce),
                Field::TransactionHash => Ok(&tx.hash),
                other => Err(DecodeError::MissingField(other.name())),
            },
        }
    }

    fn field_int(&self, field: Field) -> Result<i128, DecodeError> {
        match self {
            Record::Raw(trytes) => decoder::decode_field(trytes, field),
            Record::Parsed(tx) => match field {
                Field::Value => Ok(tx.value),
                Field::Timestamp => Ok(i128::from(tx.timestamp)),
                Field::CurrentIndex => Ok(i128::from(tx.current_index)),
                Field::LastIndex => Ok(i128::from(tx.last_index)),
                Field::AttachmentTimestamp => Ok(i128::from(tx.attachment_timestamp)),
                other => Err(DecodeError::MissingField(other.name())),
            },
        }
    }
}

/// Retains records whose field slice is a member of a fixed set.
/// Comparison is exact and case-sensitive, no normalization.
#[derive(Debug, Clone)]
pub struct SetFilter {
    field: Field,
    allowed: HashSet<String>,
}

impl SetFilter {
    pub fn new(field: Field, allowed: HashSet<String>) -> Self {
        Self { field, allowed }
    }

    pub fn accept(&self, record: &Record<'_>) -> bool {
        match record.field_str(self.field) {
            Ok(slice) => self.allowed.contains(slice),
            Err(err) => {
                error!(field = self.field.name(), error = %err, "set filter cannot read field, dropping record");
                false
            }
        }
    }
}

/// Retains records whose decoded integer field satisfies a relational
/// comparison against `min`/`max`.
#[derive(Debug, Clone)]
pub struct RangeFilter {
    field: Field,
    min: i128,
    max: i128,
    mode: RelationalMode,
}

impl RangeFilter {
    pub fn new(field: Field, min: i128, max: i128, mode: RelationalMode) -> Self {
        Self { field, min, max, mode }
    }

    pub fn accept(&self, record: &Record<'_>) -> bool {
        match record.field_int(self.field) {
            Ok(value) => self.mode.test(value, self.min, self.max),
            Err(err) => {
                error!(field = self.field.name(), error = %err, "range filter cannot decode field, dropping record");
                false
            }
        }
    }
}

/// Retains records whose effective transaction time falls in a window.
///
/// The window bounds are built from `YYYYMMDD` calendar dates (UTC
/// midnight, Unix epoch seconds). How the effective time is resolved
/// depends on the record shape:
///
/// - raw record: the primary timestamp, decoded directly;
/// - parsed record: the attachment timestamp (milliseconds) divided by
///   1000 when non-zero, else the primary timestamp;
/// - batch record with milestone: milestones in the injected
///   timestamp-only set use the primary timestamp unconditionally, all
///   others follow the attachment-preferred rule.
#[derive(Debug, Clone)]
pub struct TimeFilter {
    min: i128,
    max: i128,
    mode: RelationalMode,
    timestamp_only: HashSet<String>,
}

impl TimeFilter {
    pub fn new(
        start_date: &str,
        end_date: &str,
        mode: RelationalMode,
    ) -> Result<Self, FilterConfigError> {
        Self::with_timestamp_only(
            start_date,
            end_date,
            mode,
            TIMESTAMP_ONLY_MILESTONES.iter().map(|m| m.to_string()).collect(),
        )
    }

    /// Build with an explicit timestamp-only milestone set instead of the
    /// default [`TIMESTAMP_ONLY_MILESTONES`].
    pub fn with_timestamp_only(
        start_date: &str,
        end_date: &str,
        mode: RelationalMode,
        timestamp_only: HashSet<String>,
    ) -> Result<Self, FilterConfigError> {
        Ok(Self {
            min: i128::from(date_to_epoch(start_date)?),
            max: i128::from(date_to_epoch(end_date)?),
            mode,
            timestamp_only,
        })
    }

    /// Attachment timestamps are milliseconds and preferred over the
    /// primary timestamp when non-zero.
    pub fn resolve(timestamp: i128, attachment_timestamp: i128) -> i128 {
        if attachment_timestamp != 0 {
            attachment_timestamp / 1000
        } else {
            timestamp
        }
    }

    pub fn accept(&self, record: &Record<'_>) -> bool {
        let t = match record {
            Record::Raw(trytes) => match decoder::decode_field(trytes, Field::Timestamp) {
                Ok(t) => t,
                Err(err) => {
                    error!(error = %err, "time filter cannot decode timestamp, dropping record");
                    return false;
                }
            },
            Record::Parsed(tx) => Self::resolve(
                i128::from(tx.timestamp),
                i128::from(tx.attachment_timestamp),
            ),
        };
        self.mode.test(t, self.min, self.max)
    }

    /// Batch-mode evaluation over a raw record tagged with the milestone
    /// its dump file belongs to.
    pub fn accept_with_milestone(&self, trytes: &str, milestone: &str) -> bool {
        let decoded = decoder::decode_field(trytes, Field::Timestamp).and_then(|timestamp| {
            let attachment = decoder::decode_field(trytes, Field::AttachmentTimestamp)?;
            Ok((timestamp, attachment))
        });
        let (timestamp, attachment) = match decoded {
            Ok(pair) => pair,
            Err(err) => {
                error!(milestone, error = %err, "time filter cannot decode timestamps, dropping record");
                return false;
            }
        };
        let t = if self.timestamp_only.contains(milestone) {
            timestamp
        } else {
            Self::resolve(timestamp, attachment)
        };
        self.mode.test(t, self.min, self.max)
    }
}

/// One built predicate: a pure record -> bool function, reused across
/// every record evaluated.
#[derive(Debug, Clone)]
pub enum Predicate {
    Set(SetFilter),
    Range(RangeFilter),
    Time(TimeFilter),
}

impl Predicate {
    pub fn accept(&self, record: &Record<'_>) -> bool {
        match self {
            Predicate::Set(f) => f.accept(record),
            Predicate::Range(f) => f.accept(record),
            Predicate::Time(f) => f.accept(record),
        }
    }
}

/// An ordered conjunction of predicates. A record is retained only if it
/// satisfies every predicate; evaluation short-circuits on the first
/// failure. The empty chain accepts everything.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    predicates: Vec<Predicate>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn accept(&self, record: &Record<'_>) -> bool {
        self.predicates.iter().all(|p| p.accept(record))
    }
}

fn date_to_epoch(date: &str) -> Result<i64, FilterConfigError> {
    let parsed = chrono::NaiveDate::parse_from_str(date, "%Y%m%d")
        .map_err(|_| FilterConfigError::BadDate(date.to_string()))?;
    Ok(parsed.and_time(chrono::NaiveTime::MIN).and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{int_to_trytes, FieldSpan, TRANSACTION_TRYTES_LEN};

    fn record_with(field: Field, trytes: &str) -> String {
        let mut record = "9".repeat(TRANSACTION_TRYTES_LEN);
        let FieldSpan::Fixed { begin, end } = field.span() else {
            panic!("expected fixed span");
        };
        assert_eq!(trytes.len(), end - begin);
        record.replace_range(begin..end, trytes);
        record
    }

    fn record_with_times(timestamp: i64, attachment: i64) -> String {
        let mut record = record_with(Field::Timestamp, &int_to_trytes(timestamp.into(), 9));
        let FieldSpan::Fixed { begin, end } = Field::AttachmentTimestamp.span() else {
            panic!("expected fixed span");
        };
        record.replace_range(begin..end, &int_to_trytes(attachment.into(), 9));
        record
    }

    fn parsed(timestamp: i64, attachment: i64) -> Transaction {
        Transaction::from_trytes(&record_with_times(timestamp, attachment), &"H".repeat(81))
            .unwrap()
    }

    // ==================== RelationalMode tests ====================

    #[test]
    fn test_mode_parse_all_seven() {
        assert_eq!(RelationalMode::parse("R").unwrap(), RelationalMode::Within);
        assert_eq!(RelationalMode::parse("m").unwrap(), RelationalMode::Above);
        assert_eq!(RelationalMode::parse("M").unwrap(), RelationalMode::Below);
        assert_eq!(RelationalMode::parse("E").unwrap(), RelationalMode::Equal);
        assert_eq!(RelationalMode::parse("RE").unwrap(), RelationalMode::WithinInclusive);
        assert_eq!(RelationalMode::parse("mE").unwrap(), RelationalMode::AtLeast);
        assert_eq!(RelationalMode::parse("ME").unwrap(), RelationalMode::AtMost);
    }

    #[test]
    fn test_mode_parse_unknown_is_config_error() {
        assert!(matches!(
            RelationalMode::parse("RL"),
            Err(FilterConfigError::UnknownMode(_))
        ));
        assert!(matches!(
            RelationalMode::parse(""),
            Err(FilterConfigError::UnknownMode(_))
        ));
    }

    #[test]
    fn test_mode_strictly_within() {
        let (min, max) = (10, 20);
        assert!(RelationalMode::Within.test(15, min, max));
        assert!(!RelationalMode::Within.test(10, min, max));
        assert!(!RelationalMode::Within.test(20, min, max));
    }

    #[test]
    fn test_mode_boundaries_inclusive_vs_exclusive() {
        let (min, max) = (10, 20);
        // v == max: ME true, M false.
        assert!(RelationalMode::AtMost.test(20, min, max));
        assert!(!RelationalMode::Below.test(20, min, max));
        // v == min: mE true, m false.
        assert!(RelationalMode::AtLeast.test(10, min, max));
        assert!(!RelationalMode::Above.test(10, min, max));
        // Inclusive range admits both bounds.
        assert!(RelationalMode::WithinInclusive.test(10, min, max));
        assert!(RelationalMode::WithinInclusive.test(20, min, max));
    }

    #[test]
    fn test_mode_equal_compares_against_min() {
        assert!(RelationalMode::Equal.test(10, 10, 99));
        assert!(!RelationalMode::Equal.test(99, 10, 99));
    }

    // ==================== SetFilter tests ====================

    #[test]
    fn test_set_filter_membership() {
        let tag = "T".repeat(27);
        let record = record_with(Field::Tag, &tag);
        let filter = SetFilter::new(Field::Tag, HashSet::from([tag]));
        assert!(filter.accept(&Record::Raw(&record)));

        let other = SetFilter::new(Field::Tag, HashSet::from(["X".repeat(27)]));
        assert!(!other.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_set_filter_is_case_sensitive() {
        let tag = "T".repeat(27);
        let record = record_with(Field::Tag, &tag);
        let filter = SetFilter::new(Field::Tag, HashSet::from([tag.to_lowercase()]));
        assert!(!filter.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_set_filter_on_appended_hash() {
        let hash = format!("{}Q", "H".repeat(80));
        let record = format!("{} {}", "9".repeat(TRANSACTION_TRYTES_LEN), hash);
        let filter = SetFilter::new(Field::TransactionHash, HashSet::from([hash]));
        assert!(filter.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_set_filter_extraction_failure_is_non_match() {
        let filter = SetFilter::new(Field::Address, HashSet::from(["A".repeat(81)]));
        assert!(!filter.accept(&Record::Raw("TOO SHORT")));
    }

    #[test]
    fn test_set_filter_rejects_multibyte_record_without_panicking() {
        // Field offsets land mid-character on two-byte text; the record
        // must be dropped, never crash the evaluation.
        let record = "é".repeat(1338);
        let filter = SetFilter::new(Field::Address, HashSet::from(["A".repeat(81)]));
        assert!(!filter.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_set_filter_same_result_for_both_shapes() {
        let address = "A".repeat(81);
        let record = record_with(Field::Address, &address);
        let tx = Transaction::from_trytes(&record, &"H".repeat(81)).unwrap();
        let filter = SetFilter::new(Field::Address, HashSet::from([address]));
        assert!(filter.accept(&Record::Raw(&record)));
        assert!(filter.accept(&Record::Parsed(&tx)));
    }

    // ==================== RangeFilter tests ====================

    #[test]
    fn test_range_filter_on_value_field() {
        let record = record_with(Field::Value, &int_to_trytes(500, 27));
        let raw = Record::Raw(&record);

        let within = RangeFilter::new(Field::Value, 0, 1000, RelationalMode::Within);
        assert!(within.accept(&raw));

        let equal = RangeFilter::new(Field::Value, 500, 0, RelationalMode::Equal);
        assert!(equal.accept(&raw));

        let above = RangeFilter::new(Field::Value, 500, 0, RelationalMode::Above);
        assert!(!above.accept(&raw));
    }

    #[test]
    fn test_range_filter_same_result_for_both_shapes() {
        let record = record_with(Field::Value, &int_to_trytes(500, 27));
        let tx = Transaction::from_trytes(&record, &"H".repeat(81)).unwrap();
        let filter = RangeFilter::new(Field::Value, 499, 501, RelationalMode::Within);
        assert!(filter.accept(&Record::Raw(&record)));
        assert!(filter.accept(&Record::Parsed(&tx)));
    }

    #[test]
    fn test_range_filter_decode_failure_is_non_match() {
        let filter = RangeFilter::new(Field::Value, 0, 1000, RelationalMode::Within);
        assert!(!filter.accept(&Record::Raw("SHORT")));
    }

    // ==================== TimeFilter tests ====================

    #[test]
    fn test_time_filter_bad_date_is_config_error() {
        let result = TimeFilter::new("2020-01-01", "20200201", RelationalMode::Within);
        assert!(matches!(result, Err(FilterConfigError::BadDate(_))));
        let result = TimeFilter::new("20200101", "garbage", RelationalMode::Within);
        assert!(matches!(result, Err(FilterConfigError::BadDate(_))));
    }

    #[test]
    fn test_time_filter_raw_record_uses_primary_timestamp() {
        // 2020-01-15 inside [2020-01-01, 2020-02-01); the attachment
        // timestamp is ignored on the raw shape.
        let record = record_with_times(1_579_046_400, 999_999_999_000);
        let filter = TimeFilter::new("20200101", "20200201", RelationalMode::Within).unwrap();
        assert!(filter.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_time_filter_parsed_prefers_attachment() {
        let filter = TimeFilter::new("20200101", "20200201", RelationalMode::Within).unwrap();

        // attachment = 0: fall back to the primary timestamp.
        let tx = parsed(1_579_046_400, 0);
        assert!(filter.accept(&Record::Parsed(&tx)));

        // attachment != 0 (milliseconds): attachment/1000 wins, even when
        // the primary timestamp lies outside the window.
        let tx = parsed(0, 1_579_046_400_000);
        assert!(filter.accept(&Record::Parsed(&tx)));

        // attachment outside the window rejects despite a good timestamp.
        let tx = parsed(1_579_046_400, 999_999_999_000);
        assert!(!filter.accept(&Record::Parsed(&tx)));
    }

    #[test]
    fn test_time_filter_milestone_policy() {
        let filter = TimeFilter::new("20200101", "20200201", RelationalMode::Within).unwrap();
        let in_window = 1_579_046_400i64;
        let out_of_window_ms = 999_999_999_000i64;

        // Milestone in the timestamp-only set: primary timestamp decides.
        let record = record_with_times(in_window, out_of_window_ms);
        assert!(filter.accept_with_milestone(&record, "6000"));

        // Any other milestone: attachment-preferred rule.
        assert!(!filter.accept_with_milestone(&record, "7000"));
        let record = record_with_times(0, 1_579_046_400_000);
        assert!(filter.accept_with_milestone(&record, "7000"));

        // attachment = 0 falls back to the primary timestamp regardless
        // of milestone membership.
        let record = record_with_times(in_window, 0);
        assert!(filter.accept_with_milestone(&record, "6000"));
        assert!(filter.accept_with_milestone(&record, "7000"));
    }

    #[test]
    fn test_time_filter_with_injected_milestone_set() {
        let filter = TimeFilter::with_timestamp_only(
            "20200101",
            "20200201",
            RelationalMode::Within,
            HashSet::from(["1234".to_string()]),
        )
        .unwrap();
        let record = record_with_times(1_579_046_400, 999_999_999_000);
        assert!(filter.accept_with_milestone(&record, "1234"));
        assert!(!filter.accept_with_milestone(&record, "6000"));
    }

    #[test]
    fn test_resolve_rule() {
        assert_eq!(TimeFilter::resolve(100, 0), 100);
        assert_eq!(TimeFilter::resolve(100, 5000), 5);
    }

    #[test]
    fn test_is_timestamp_only_default_set() {
        for milestone in TIMESTAMP_ONLY_MILESTONES {
            assert!(is_timestamp_only(milestone));
        }
        assert!(!is_timestamp_only("7000"));
    }

    // ==================== FilterChain tests ====================

    #[test]
    fn test_empty_chain_accepts_everything() {
        let chain = FilterChain::new();
        let record = "9".repeat(TRANSACTION_TRYTES_LEN);
        assert!(chain.accept(&Record::Raw(&record)));
    }

    #[test]
    fn test_chain_is_conjunctive() {
        let tag = "T".repeat(27);
        let record = record_with(Field::Tag, &tag);

        let matching = Predicate::Set(SetFilter::new(Field::Tag, HashSet::from([tag.clone()])));
        let rejecting = Predicate::Set(SetFilter::new(Field::Tag, HashSet::from(["X".repeat(27)])));

        let mut chain = FilterChain::new();
        chain.push(matching.clone());
        assert!(chain.accept(&Record::Raw(&record)));

        // One rejecting predicate fails the whole chain, in either order.
        chain.push(rejecting.clone());
        assert!(!chain.accept(&Record::Raw(&record)));

        let mut reversed = FilterChain::new();
        reversed.push(rejecting);
        reversed.push(matching);
        assert!(!reversed.accept(&Record::Raw(&record)));
    }
}
