//! A search backend that replays recorded output: a pivot response as JSON and
//! records as NDJSON.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use corragg_eval::{
    AggregationRequest, BackendError, RawAggregationResponse, Record, ScrollCursor, ScrollRequest,
    SearchBackend,
};

#[derive(Debug, Default)]
pub struct FixtureBackend {
    response: Option<RawAggregationResponse>,
    records: Vec<Record>,
}

impl FixtureBackend {
    pub fn load(response: Option<&Path>, records: Option<&Path>) -> Result<Self, String> {
        let response = match response {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
                let raw = serde_json::from_str(&text)
                    .map_err(|e| format!("Invalid response JSON in {}: {e}", path.display()))?;
                Some(raw)
            }
            None => None,
        };

        let records = match records {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
                parse_records(&text).map_err(|e| format!("{}: {e}", path.display()))?
            }
            None => Vec::new(),
        };

        Ok(FixtureBackend { response, records })
    }

    /// Every stream id the fixtures mention.
    pub fn stream_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self
            .records
            .iter()
            .flat_map(|r| r.stream_ids.iter().cloned())
            .collect();
        if let Some(raw) = &self.response {
            ids.extend(raw.stream_rows.iter().filter_map(|row| row.key.first().cloned()));
            ids.extend(raw.rows.iter().flat_map(|row| row.source_streams.iter().cloned()));
        }
        ids
    }
}

/// One record per non-blank line.
fn parse_records(text: &str) -> Result<Vec<Record>, String> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line)
            .map_err(|e| format!("invalid record on line {}: {e}", i + 1))?;
        records.push(record);
    }
    Ok(records)
}

struct FixtureCursor {
    batches: VecDeque<Vec<Record>>,
}

impl ScrollCursor for FixtureCursor {
    fn next_batch(&mut self) -> Result<Option<Vec<Record>>, BackendError> {
        Ok(self.batches.pop_front())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.batches.clear();
        Ok(())
    }
}

impl SearchBackend for FixtureBackend {
    fn run_aggregation(
        &self,
        request: &AggregationRequest,
    ) -> Result<RawAggregationResponse, BackendError> {
        log::debug!(
            "Replaying recorded response for '{}' ({})",
            request.definition_id,
            request.timerange
        );
        self.response.clone().ok_or_else(|| {
            BackendError::Unavailable("no recorded aggregation response (pass --response)".into())
        })
    }

    /// Records inside the window whose streams overlap the requested ones.
    fn open_scroll(&self, request: &ScrollRequest) -> Result<Box<dyn ScrollCursor>, BackendError> {
        let matching: Vec<Record> = self
            .records
            .iter()
            .filter(|r| request.timerange.contains(r.timestamp))
            .filter(|r| {
                request.streams.is_empty()
                    || r.stream_ids.is_empty()
                    || !r.stream_ids.is_disjoint(&request.streams)
            })
            .cloned()
            .collect();

        let batches = matching
            .chunks(request.batch_size.max(1))
            .map(<[Record]>::to_vec)
            .collect();
        Ok(Box::new(FixtureCursor { batches }))
    }

    fn get_record(&self, index: &str, id: &str) -> Result<Record, BackendError> {
        self.records
            .iter()
            .find(|r| r.index == index && r.id == id)
            .cloned()
            .ok_or_else(|| BackendError::RecordNotFound {
                index: index.to_string(),
                id: id.to_string(),
            })
    }
}
