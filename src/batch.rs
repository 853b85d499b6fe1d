//! Archive Dump Decoder
//!
//! Decodes directories of archived dump files, one file per milestone,
//! each line holding `hash,trytes`. Files are decoded in parallel with
//! one worker per file, bounded by the number of available cores; within
//! a file decoding is strictly sequential. Accepted records are decoded
//! into tab-separated rows, deduplicated, and written to one output file
//! per input file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::decoder::{self, DecodeError, Field};
use crate::filter::{is_timestamp_only, FilterChain, Record, TimeFilter};

/// Header row of a decoded output file.
pub const OUTPUT_HEADER: &str = "time\ttx_hash_str\taddress\tvalue\ttimestamp\tcurrent_index\tlast_index\tbundle\ttrunk\tbranch\ttag\tattachtimestamp";

/// Filesystem errors are fatal for the affected file only; sibling
/// workers keep running.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot list input directory {path}: {source}")]
    ReadDir { path: PathBuf, source: std::io::Error },

    #[error("cannot create output directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[error("cannot read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[error("cannot write {path}: {source}")]
    WriteFile { path: PathBuf, source: std::io::Error },
}

/// Per-file result collected by the driver.
#[derive(Debug)]
pub struct FileOutcome {
    pub file_name: String,
    /// Distinct rows written, or the error that stopped this file.
    pub result: Result<usize, BatchError>,
}

/// Decodes every dump file of an input directory into the output
/// directory, applying the raw filter chain and the batch-mode time
/// filters on the way.
pub struct BatchDecoder {
    input_dir: PathBuf,
    output_dir: PathBuf,
    chain: Arc<FilterChain>,
    time_filters: Arc<Vec<TimeFilter>>,
}

impl BatchDecoder {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        chain: FilterChain,
        time_filters: Vec<TimeFilter>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            chain: Arc::new(chain),
            time_filters: Arc::new(time_filters),
        }
    }

    /// Run one decode worker per input file, at most one per available
    /// core at a time. A failed file is reported in its outcome and never
    /// aborts the others.
    pub async fn run(&self) -> Result<Vec<FileOutcome>, BatchError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| BatchError::CreateDir {
            path: self.output_dir.clone(),
            source,
        })?;

        let entries = fs::read_dir(&self.input_dir).map_err(|source| BatchError::ReadDir {
            path: self.input_dir.clone(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| BatchError::ReadDir {
                path: self.input_dir.clone(),
                source,
            })?;
            if entry.path().is_file() {
                files.push(entry.path());
            }
        }

        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for path in files {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let chain = Arc::clone(&self.chain);
            let time_filters = Arc::clone(&self.time_filters);
            let output_dir = self.output_dir.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                decode_file(&path, &output_dir, &chain, &time_filters)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Err(err) = &outcome.result {
                        error!(file = outcome.file_name, error = %err, "file failed");
                    }
                    outcomes.push(outcome);
                }
                Err(err) => error!(error = %err, "decode worker panicked"),
            }
        }
        Ok(outcomes)
    }
}

fn decode_file(
    path: &Path,
    output_dir: &Path,
    chain: &FilterChain,
    time_filters: &[TimeFilter],
) -> FileOutcome {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // The file name carries the milestone identifier, e.g. "6000.txt".
    let milestone = file_name.split('.').next().unwrap_or(&file_name).to_string();
    let result = decode_file_inner(path, output_dir, &milestone, chain, time_filters);
    FileOutcome { file_name, result }
}

fn decode_file_inner(
    path: &Path,
    output_dir: &Path,
    milestone: &str,
    chain: &FilterChain,
    time_filters: &[TimeFilter],
) -> Result<usize, BatchError> {
    info!(file = %path.display(), "processing");
    let content = fs::read_to_string(path).map_err(|source| BatchError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut rows: IndexMap<String, i128> = IndexMap::new();
    for line in content.lines() {
        let Some((hash, rest)) = line.split_once(',') else {
            warn!(milestone, "skipping malformed line without hash separator");
            continue;
        };
        let trytes = rest.trim_end();

        // Raw predicates see the payload with the hash appended, so
        // end-anchored fields resolve to the hash.
        let combined = format!("{trytes} {hash}");
        if !chain.accept(&Record::Raw(&combined)) {
            continue;
        }
        if !time_filters.iter().all(|f| f.accept_with_milestone(trytes, milestone)) {
            continue;
        }

        match decode_line(trytes, hash, milestone) {
            Ok(decoded) => {
                debug!(milestone, hash, "accepted");
                // Identical rows overwrite the stored time, keeping the
                // original insertion position.
                rows.insert(decoded.formatted, decoded.time);
            }
            Err(err) => {
                error!(milestone, hash, error = %err, "cannot decode record, skipping");
            }
        }
    }

    let out_path = output_dir.join(format!("{milestone}.txt"));
    let mut out = String::with_capacity(rows.len() * 64 + OUTPUT_HEADER.len() + 1);
    out.push_str(OUTPUT_HEADER);
    out.push('\n');
    let mut written = 0usize;
    for (row, time) in &rows {
        let Some(day) = day_bucket(*time) else {
            warn!(milestone, time, "resolved time outside calendar range, skipping row");
            continue;
        };
        out.push_str(&day);
        out.push('\t');
        out.push_str(row);
        out.push('\n');
        written += 1;
    }
    fs::write(&out_path, out).map_err(|source| BatchError::WriteFile {
        path: out_path.clone(),
        source,
    })?;
    info!(file = %out_path.display(), rows = written, "done");
    Ok(written)
}

/// One decoded, formatted record plus the time it is bucketed under.
struct DecodedLine {
    formatted: String,
    time: i128,
}

fn decode_line(trytes: &str, hash: &str, milestone: &str) -> Result<DecodedLine, DecodeError> {
    let address = decoder::field_slice(trytes, Field::Address)?;
    let value = decoder::decode_field(trytes, Field::Value)?;
    let bundle = decoder::field_slice(trytes, Field::Bundle)?;
    let trunk = decoder::field_slice(trytes, Field::Trunk)?;
    let branch = decoder::field_slice(trytes, Field::Branch)?;
    let tag = decoder::field_slice(trytes, Field::Tag)?;
    let current_index = decoder::decode_field(trytes, Field::CurrentIndex)?;
    let last_index = decoder::decode_field(trytes, Field::LastIndex)?;

    let raw_timestamp = decoder::decode_field(trytes, Field::Timestamp)?;
    let raw_attachment = decoder::decode_field(trytes, Field::AttachmentTimestamp)?;
    let timestamp = decoder::normalize_seconds(raw_timestamp);
    let mut attachtimestamp = decoder::normalize_seconds(raw_attachment);

    // Milestones with unreliable attachment timestamps report the primary
    // timestamp in the attachment column and bucket by it as well.
    let timestamp_only = is_timestamp_only(milestone);
    if timestamp_only {
        attachtimestamp = timestamp;
    }
    let time = if timestamp_only {
        timestamp
    } else {
        TimeFilter::resolve(raw_timestamp, raw_attachment)
    };

    let formatted = format!(
        "{hash}\t{address}\t{value}\t{timestamp}\t{current_index}\t{last_index}\t{bundle}\t{trunk}\t{branch}\t{tag}\t{attachtimestamp}"
    );
    Ok(DecodedLine { formatted, time })
}

/// UTC day bucket (`YYYYMMDD`) for an epoch-seconds time.
fn day_bucket(time: i128) -> Option<String> {
    let seconds = i64::try_from(time).ok()?;
    let datetime = DateTime::from_timestamp(seconds, 0)?;
    Some(datetime.format("%Y%m%d").to_string())
}
