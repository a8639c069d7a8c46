//! Structural validators, one predicate per object type.
//!
//! A `false` result means "this entry is not for this view" and the entry is
//! silently dropped there; it is never an error and never retried. Other
//! views still get their own chance to accept the entry.

use uuid::Uuid;

use crate::entry::{Kind, Object};

fn valid_uuid(id: &str) -> bool {
    Uuid::parse_str(id).is_ok_and(|u| u.get_version_num() == 4)
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.is_empty())
}

/// Validation for any and all objects in the log.
pub fn object(obj: &Object) -> bool {
    valid_uuid(&obj.id) && obj.created_at.millis().is_some()
}

pub fn swab_tube(obj: &Object) -> bool {
    if !object(obj) {
        return false;
    }
    match &obj.kind {
        Kind::SwabTube(tube) => present(&tube.barcode) && present(&tube.form_barcode),
        _ => false,
    }
}

pub fn plate(obj: &Object) -> bool {
    if !object(obj) {
        return false;
    }
    match &obj.kind {
        Kind::Plate(plate) => present(&plate.barcode),
        _ => false,
    }
}

pub fn qpcr_result(obj: &Object) -> bool {
    if !object(obj) {
        return false;
    }
    match &obj.kind {
        Kind::QpcrResult(result) => {
            present(&result.plate_id)
                && present(&result.plate_barcode)
                && result.eds_file_data.is_some()
                && result.wells.is_some()
        }
        _ => false,
    }
}

pub fn user(obj: &Object) -> bool {
    if !object(obj) {
        return false;
    }
    match &obj.kind {
        Kind::User(user) => present(&user.name) && present(&user.password),
        _ => false,
    }
}

/// Accepts any object that carries a physical barcode.
pub fn barcoded(obj: &Object) -> bool {
    object(obj) && obj.kind.barcode().is_some_and(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Plate, Stamp, SwabTube};

    fn tube(id: &str, barcode: &str, form: &str) -> Object {
        Object {
            id: id.to_string(),
            created_at: Stamp::from(1_700_000_000_000),
            created_by: None,
            synchronized_at: None,
            uplink_synced: None,
            changed: None,
            kind: Kind::SwabTube(SwabTube {
                barcode: Some(barcode.to_string()),
                form_barcode: Some(form.to_string()),
            }),
        }
    }

    #[test]
    fn swab_tube_requires_both_barcodes() {
        let id = "3b241101-e2bb-4255-8caf-4136c566a962";
        assert!(swab_tube(&tube(id, "b", "f")));
        assert!(!swab_tube(&tube(id, "", "f")));
        assert!(!swab_tube(&tube(id, "b", "")));
        assert!(!swab_tube(&tube("not-a-uuid", "b", "f")));
    }

    #[test]
    fn plate_is_not_a_swab_tube() {
        let obj = Object {
            id: "3b241101-e2bb-4255-8caf-4136c566a962".into(),
            created_at: Stamp::from(1),
            created_by: None,
            synchronized_at: None,
            uplink_synced: None,
            changed: None,
            kind: Kind::Plate(Plate {
                barcode: Some("p-1".into()),
            }),
        };
        assert!(plate(&obj));
        assert!(!swab_tube(&obj));
        assert!(barcoded(&obj));
    }
}
