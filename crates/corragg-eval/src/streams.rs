//! Source-stream attribution for emitted events.

use std::collections::BTreeSet;
use std::sync::RwLock;

/// Built-in event streams; events are never attributed to them implicitly.
pub const DEFAULT_EXCLUDED_STREAM_IDS: [&str; 2] =
    ["000000000000000000000002", "000000000000000000000003"];

pub fn default_excluded_stream_ids() -> BTreeSet<String> {
    DEFAULT_EXCLUDED_STREAM_IDS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Pick the streams an event is attributed to:
/// 1. the streams the result reported, if any;
/// 2. else the configured streams, if any;
/// 3. else every known stream minus `exclusions`.
pub fn resolve_source_streams(
    result_streams: &BTreeSet<String>,
    configured: &BTreeSet<String>,
    all_known: &BTreeSet<String>,
    exclusions: &BTreeSet<String>,
) -> BTreeSet<String> {
    if !result_streams.is_empty() {
        return result_streams.clone();
    }
    if !configured.is_empty() {
        return configured.clone();
    }
    all_known.difference(exclusions).cloned().collect()
}

/// Stream membership and permissions.
pub trait StreamService: Send + Sync {
    /// Streams a definition may search when it names none.
    fn permitted_stream_ids(&self) -> BTreeSet<String>;

    fn all_stream_ids(&self) -> BTreeSet<String>;

    /// The subset of `ids` that exist.
    fn existing_stream_ids(&self, ids: &BTreeSet<String>) -> BTreeSet<String> {
        let all = self.all_stream_ids();
        ids.intersection(&all).cloned().collect()
    }

    fn all_stream_ids_excluding_system_defaults(&self) -> BTreeSet<String> {
        self.all_stream_ids()
            .difference(&default_excluded_stream_ids())
            .cloned()
            .collect()
    }
}

/// In-memory [`StreamService`] over a set of known stream ids.
#[derive(Debug, Default)]
pub struct MemoryStreamService {
    streams: RwLock<BTreeSet<String>>,
    /// When set, only these streams are permitted; otherwise all non-system streams.
    permitted: RwLock<Option<BTreeSet<String>>>,
}

impl MemoryStreamService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streams<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::new();
        for id in ids {
            service.add_stream(id);
        }
        service
    }

    pub fn add_stream(&self, id: impl Into<String>) {
        if let Ok(mut streams) = self.streams.write() {
            streams.insert(id.into());
        }
    }

    pub fn set_permitted(&self, ids: BTreeSet<String>) {
        if let Ok(mut permitted) = self.permitted.write() {
            *permitted = Some(ids);
        }
    }
}

impl StreamService for MemoryStreamService {
    fn permitted_stream_ids(&self) -> BTreeSet<String> {
        match self.permitted.read().ok().and_then(|p| p.clone()) {
            Some(ids) => ids,
            None => self.all_stream_ids_excluding_system_defaults(),
        }
    }

    fn all_stream_ids(&self) -> BTreeSet<String> {
        self.streams
            .read()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}
