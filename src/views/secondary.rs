//! Secondary indexes keyed by a barcode field, with rename handling.

use std::sync::Arc;

use anyhow::Result;

use super::{lww_ops, Index};
use crate::engine::View;
use crate::entry::{Kind, MergedEntry, Object};
use crate::store::{IndexStore, Op};
use crate::validate;

/// Last-write-wins secondary index on a single field.
///
/// When an update renames the indexed field (`changed` carries the previous
/// value) the stale key is deleted in the same batch as the new key's
/// insert, so readers never see both or neither.
#[derive(Debug)]
pub struct SecondaryView {
    idx: Index,
    accept: fn(&Object) -> bool,
    key_of: fn(&Object) -> Option<String>,
    /// Name of the field in `changed` carrying the pre-rename value.
    changed_field: &'static str,
}

fn barcode_of(obj: &Object) -> Option<String> {
    obj.kind.barcode().map(str::to_string)
}

fn form_barcode_of(obj: &Object) -> Option<String> {
    match &obj.kind {
        Kind::SwabTube(tube) => tube.form_barcode.clone(),
        _ => None,
    }
}

impl SecondaryView {
    /// Anything with a physical barcode (swab tubes and plates), by barcode.
    pub fn objects_by_barcode(store: IndexStore) -> Arc<Self> {
        Arc::new(SecondaryView {
            idx: Index::new(store, "lab.objects_by_barcode"),
            accept: validate::barcoded,
            key_of: barcode_of,
            changed_field: "barcode",
        })
    }

    /// Swab tubes by the barcode of the form they were registered with.
    pub fn swab_tubes_by_form_barcode(store: IndexStore) -> Arc<Self> {
        Arc::new(SecondaryView {
            idx: Index::new(store, "lab.swab_tubes_by_form_barcode"),
            accept: validate::swab_tube,
            key_of: form_barcode_of,
            changed_field: "formBarcode",
        })
    }

    // Barcodes are not enforced unique; colliding keys resolve by
    // last-write-wins on the key.
    pub fn get(&self, key: &str) -> Result<Option<Object>> {
        self.idx.get_json(key)
    }
}

impl View for SecondaryView {
    fn name(&self) -> &'static str {
        self.idx.table
    }

    fn apply(&self, batch: &[MergedEntry]) -> Result<Vec<Op>> {
        lww_ops(&self.idx, batch, self.accept, self.key_of, |obj| {
            obj.changed_field(self.changed_field).map(str::to_string)
        })
    }
}
