//! Field-level diff between two versions of the tracked fields.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::TrackedFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    StageChange,
    LocationChange,
    TagChange,
    DescriptionChange,
    SizeChange,
    BatchChange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageChange => "STAGE_CHANGE",
            Self::LocationChange => "LOCATION_CHANGE",
            Self::TagChange => "TAG_CHANGE",
            Self::DescriptionChange => "DESCRIPTION_CHANGE",
            Self::SizeChange => "SIZE_CHANGE",
            Self::BatchChange => "BATCH_CHANGE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STAGE_CHANGE" => Ok(Self::StageChange),
            "LOCATION_CHANGE" => Ok(Self::LocationChange),
            "TAG_CHANGE" => Ok(Self::TagChange),
            "DESCRIPTION_CHANGE" => Ok(Self::DescriptionChange),
            "SIZE_CHANGE" => Ok(Self::SizeChange),
            "BATCH_CHANGE" => Ok(Self::BatchChange),
            other => Err(format!("unknown change type {other}")),
        }
    }
}

/// One differing field. Tag values are rendered as JSON arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub change_type: ChangeType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Diff `old` against `new`, one entry per differing field in the order
/// stage, location, tags, description, size bucket, batch.
///
/// Tags compare as sets: a reordering alone is not a change.
pub fn detect_changes(old: &TrackedFields, new: &TrackedFields) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    push_scalar(&mut changes, ChangeType::StageChange, &old.stage, &new.stage);
    push_scalar(
        &mut changes,
        ChangeType::LocationChange,
        &old.location,
        &new.location,
    );

    let old_tags = old.tags.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let new_tags = new.tags.iter().map(String::as_str).collect::<BTreeSet<_>>();
    if old_tags != new_tags {
        changes.push(FieldChange {
            change_type: ChangeType::TagChange,
            old_value: Some(tags_json(&old.tags)),
            new_value: Some(tags_json(&new.tags)),
        });
    }

    push_scalar(
        &mut changes,
        ChangeType::DescriptionChange,
        &old.description,
        &new.description,
    );
    push_scalar(
        &mut changes,
        ChangeType::SizeChange,
        &old.size_bucket,
        &new.size_bucket,
    );
    push_scalar(&mut changes, ChangeType::BatchChange, &old.batch, &new.batch);

    changes
}

fn push_scalar(
    changes: &mut Vec<FieldChange>,
    change_type: ChangeType,
    old: &Option<String>,
    new: &Option<String>,
) {
    if old != new {
        changes.push(FieldChange {
            change_type,
            old_value: old.clone(),
            new_value: new.clone(),
        });
    }
}

fn tags_json(tags: &[String]) -> String {
    JsonValue::from(tags.to_vec()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrackedFields {
        TrackedFields {
            batch: Some("W21".into()),
            stage: Some("Seed".into()),
            location: Some("Berlin".into()),
            description: Some("Anvils as a service".into()),
            tags: vec!["b2b".into(), "saas".into()],
            size_bucket: Some("1-10".into()),
        }
    }

    #[test]
    fn identical_fields_produce_no_changes() {
        assert!(detect_changes(&base(), &base()).is_empty());
    }

    #[test]
    fn stage_change_carries_old_and_new_values() {
        let mut next = base();
        next.stage = Some("Series A".into());
        let changes = detect_changes(&base(), &next);
        assert_eq!(
            changes,
            vec![FieldChange {
                change_type: ChangeType::StageChange,
                old_value: Some("Seed".into()),
                new_value: Some("Series A".into()),
            }]
        );
    }

    #[test]
    fn tag_reordering_is_not_a_change() {
        let mut next = base();
        next.tags.reverse();
        assert!(detect_changes(&base(), &next).is_empty());
    }

    #[test]
    fn tag_set_change_is_rendered_as_json_arrays() {
        let mut next = base();
        next.tags.push("fintech".into());
        let changes = detect_changes(&base(), &next);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::TagChange);
        assert_eq!(changes[0].old_value.as_deref(), Some(r#"["b2b","saas"]"#));
        assert_eq!(
            changes[0].new_value.as_deref(),
            Some(r#"["b2b","saas","fintech"]"#)
        );
    }

    #[test]
    fn k_differing_core_fields_yield_k_typed_changes_in_fixed_order() {
        let mut next = base();
        next.description = Some("Rockets".into());
        next.tags = vec!["deeptech".into()];
        next.location = None;
        next.stage = Some("Series B".into());

        let types = detect_changes(&base(), &next)
            .into_iter()
            .map(|c| c.change_type)
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ChangeType::StageChange,
                ChangeType::LocationChange,
                ChangeType::TagChange,
                ChangeType::DescriptionChange,
            ]
        );

        for k in 0..=4 {
            let mut partial = base();
            if k > 0 {
                partial.stage = Some("Series B".into());
            }
            if k > 1 {
                partial.location = Some("Lisbon".into());
            }
            if k > 2 {
                partial.tags = vec!["other".into()];
            }
            if k > 3 {
                partial.description = Some("Other".into());
            }
            assert_eq!(detect_changes(&base(), &partial).len(), k);
        }
    }

    #[test]
    fn size_and_batch_are_checked_after_core_fields() {
        let mut next = base();
        next.batch = Some("S22".into());
        next.size_bucket = Some("11-50".into());
        next.stage = None;
        let types = detect_changes(&base(), &next)
            .into_iter()
            .map(|c| c.change_type)
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ChangeType::StageChange,
                ChangeType::SizeChange,
                ChangeType::BatchChange
            ]
        );
    }

    #[test]
    fn change_type_names_round_trip_through_strings() {
        for ty in [
            ChangeType::StageChange,
            ChangeType::LocationChange,
            ChangeType::TagChange,
            ChangeType::DescriptionChange,
            ChangeType::SizeChange,
            ChangeType::BatchChange,
        ] {
            assert_eq!(ty.as_str().parse::<ChangeType>(), Ok(ty));
        }
        assert!("NAME_CHANGE".parse::<ChangeType>().is_err());
    }
}
