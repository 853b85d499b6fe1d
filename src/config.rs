//! Startup configuration
//!
//! TOML-backed configuration for the filter chain and the two drivers.
//! The filter sections mirror the operator-facing surface: one set of
//! exact-match strings per field filter, plus relational value and time
//! window tables. Invalid modes or dates abort startup; the process never
//! runs with a partially built chain.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::decoder::Field;
use crate::filter::{
    FilterChain, FilterConfigError, Predicate, RangeFilter, RelationalMode, SetFilter, TimeFilter,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Filter(#[from] FilterConfigError),
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub logger: LoggerConfig,
    pub version: Option<VersionConfig>,
    pub filters: FiltersConfig,
    pub subscription: Option<SubscriptionConfig>,
    pub batch: Option<BatchConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionConfig {
    pub version: String,
}

/// The filter configuration surface. Empty sections build no predicate.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FiltersConfig {
    pub address: Vec<String>,
    pub bundle: Vec<String>,
    pub tag: Vec<String>,
    pub transaction: Vec<String>,
    pub trunk: Vec<String>,
    pub branch: Vec<String>,
    pub obsolete_tag: Vec<String>,
    pub nonce: Vec<String>,
    pub signature_message_fragment: Vec<String>,
    pub time: Vec<TimeFilterConfig>,
    pub value: Vec<ValueFilterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeFilterConfig {
    pub start: String,
    pub end: String,
    #[serde(default = "default_mode")]
    pub rlse: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValueFilterConfig {
    pub min: i64,
    pub max: i64,
    #[serde(default = "default_mode")]
    pub rlse: String,
}

fn default_mode() -> String {
    "R".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_topic() -> String {
    "trytes".to_string()
}

fn default_queue_capacity() -> usize {
    crate::subscriber::DEFAULT_QUEUE_CAPACITY
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("dmp"),
            output_dir: PathBuf::from("decoded_data"),
        }
    }
}

/// Build the filter chain and the batch-mode time filter list from the
/// parsed configuration. Time filters go into both: the chain evaluates
/// them shape-appropriately for live records, the batch driver re-applies
/// them with the milestone policy.
pub fn build_filters(
    filters: &FiltersConfig,
) -> Result<(FilterChain, Vec<TimeFilter>), ConfigError> {
    let mut chain = FilterChain::new();

    let set_sections: [(&[String], Field); 9] = [
        (&filters.address, Field::Address),
        (&filters.bundle, Field::Bundle),
        (&filters.tag, Field::Tag),
        (&filters.transaction, Field::TransactionHash),
        (&filters.trunk, Field::Trunk),
        (&filters.branch, Field::Branch),
        (&filters.obsolete_tag, Field::ObsoleteTag),
        (&filters.nonce, Field::Nonce),
        (
            &filters.signature_message_fragment,
            Field::SignatureMessageFragment,
        ),
    ];
    for (values, field) in set_sections {
        if !values.is_empty() {
            let allowed: HashSet<String> = values.iter().cloned().collect();
            chain.push(Predicate::Set(SetFilter::new(field, allowed)));
        }
    }

    for value in &filters.value {
        let mode = RelationalMode::parse(&value.rlse)?;
        chain.push(Predicate::Range(RangeFilter::new(
            Field::Value,
            i128::from(value.min),
            i128::from(value.max),
            mode,
        )));
    }

    let mut time_filters = Vec::new();
    for time in &filters.time {
        let mode = RelationalMode::parse(&time.rlse)?;
        let filter = TimeFilter::new(&time.start, &time.end, mode)?;
        chain.push(Predicate::Time(filter.clone()));
        time_filters.push(filter);
    }

    Ok((chain, time_filters))
}
