//! Versioned persistence records.
//!
//! Every record carries the version it was written with. Readers dispatch
//! on that version through a table of [`Decoder`]s, so that a newer build
//! keeps loading everything from [`ARCHIVE_MIN_SUPPORTED_VERSION`] on and
//! converts older layouts into the current in-memory form.
use std::fmt;

use cortex_core::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{graph::Link, registry::LayerRegistry};

/// Version written by this build.
pub const ARCHIVE_VERSION: u32 = 2001;

/// Oldest version this build can read.
pub const ARCHIVE_MIN_SUPPORTED_VERSION: u32 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphRecord {
    pub version: u32,
    pub layers: Vec<LayerRecord>,
    #[serde(default)]
    pub feedbacks: Vec<FeedbackRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerRecord {
    pub kind: String,
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub inputs: Vec<Option<Link>>,
    #[serde(default = "learning_default")]
    pub learning: bool,
    #[serde(default)]
    pub body: Value,
}

fn learning_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub holder: String,
    pub producer: String,
    pub output: usize,
}

/// Reads the bodies written by versions `min_version..=max_version`.
pub struct Decoder<T> {
    pub min_version: u32,
    pub max_version: u32,
    pub decode: fn(Value, &LayerRegistry) -> Result<T>,
}

impl<T> Decoder<T> {
    fn accepts(&self, version: u32) -> bool {
        (self.min_version..=self.max_version).contains(&version)
    }
}

impl<T> fmt::Debug for Decoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decoder({}..={})", self.min_version, self.max_version)
    }
}

/// Picks the decoder of `table` matching `version` and runs it on `body`.
pub fn decode<T>(
    what: &str,
    version: u32,
    body: Value,
    registry: &LayerRegistry,
    table: &[Decoder<T>],
) -> Result<T> {
    match table.iter().find(|decoder| decoder.accepts(version)) {
        Some(decoder) => (decoder.decode)(body, registry),
        None => Err(Error::UnsupportedVersion {
            what: what.to_owned(),
            version,
            min: table.iter().map(|d| d.min_version).min().unwrap_or(0),
            max: table.iter().map(|d| d.max_version).max().unwrap_or(0),
        }),
    }
}

/// Deserializes a body whose layout matches `T` directly.
pub fn plain<T: DeserializeOwned>(body: Value, _: &LayerRegistry) -> Result<T> {
    Ok(serde_json::from_value(body)?)
}

pub fn check_graph_version(version: u32) -> Result<()> {
    if (ARCHIVE_MIN_SUPPORTED_VERSION..=ARCHIVE_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion {
            what: "graph".to_owned(),
            version,
            min: ARCHIVE_MIN_SUPPORTED_VERSION,
            max: ARCHIVE_VERSION,
        })
    }
}
