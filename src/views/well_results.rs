//! Per-sample rows fanned out from qPCR plate results.
//!
//! One qPCR result entry carries a whole plate; this view emits one row per
//! well that actually holds a measurement, keyed by the sample barcode that
//! was scanned into the well. The plate id rides in the key as a
//! disambiguator so re-running a sample on another plate keeps both rows.

use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{candidates, Index, SEP, SEP_END};
use crate::engine::View;
use crate::entry::{Kind, MergedEntry, Stamp};
use crate::store::{IndexStore, Op};
use crate::validate;

/// One well's measurement, denormalized for barcode lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleResult {
    /// Id of the qPCR result object this row was fanned out from.
    #[serde(rename = "resultID")]
    pub result_id: String,
    #[serde(rename = "plateID")]
    pub plate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_barcode: Option<String>,
    pub well_name: String,
    pub created_at: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub barcode: String,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct WellResultView {
    idx: Index,
}

impl WellResultView {
    pub fn new(store: IndexStore) -> Arc<Self> {
        Arc::new(WellResultView {
            idx: Index::new(store, "lab.well_results"),
        })
    }

    /// Every result recorded for a sample barcode, across plates.
    pub fn get(&self, barcode: &str) -> Result<Vec<SampleResult>> {
        // The end bound caps the plate segment, not the barcode, so
        // `sample-1` never matches `sample-10!...`.
        let from = format!("{barcode}{SEP}");
        let to = format!("{barcode}{SEP}{SEP_END}");
        let rows = self.idx.store.range(
            self.idx.table,
            Bound::Excluded(from.as_str()),
            Bound::Excluded(to.as_str()),
            false,
        )?;
        rows.into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }
}

impl View for WellResultView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        let mut ops = Vec::new();
        for candidate in candidates(batch, validate::qpcr_result) {
            let obj = candidate.obj;
            let Kind::QpcrResult(result) = &obj.kind else {
                continue;
            };
            let (Some(plate_id), Some(wells)) = (&result.plate_id, &result.wells) else {
                continue;
            };
            for (well_name, well) in wells {
                // Empty wells and wells without a scanned sample are skipped.
                let Some(measurement) = well.result.as_ref().filter(|v| !v.is_null()) else {
                    continue;
                };
                let Some(barcode) = well.barcode.as_deref().filter(|b| !b.is_empty()) else {
                    continue;
                };
                let row = SampleResult {
                    result_id: obj.id.clone(),
                    plate_id: plate_id.clone(),
                    plate_barcode: result.plate_barcode.clone(),
                    well_name: well_name.clone(),
                    created_at: obj.created_at.clone(),
                    created_by: obj.created_by.clone(),
                    barcode: barcode.to_string(),
                    result: measurement.clone(),
                    raw: well.raw.clone(),
                };
                let key = format!("{barcode}{SEP}{plate_id}");
                ops.push(Op::put(key, serde_json::to_vec(&row)?));
            }
        }
        Ok(ops)
    }
}
