//! Drift between a declared spec and an observed snapshot

use serde::Serialize;

use crate::types::{ResourceKey, ResourceSnapshot, ResourceSpec};

/// A single mutable field whose observed value differs from the declared one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDrift {
    pub field: &'static str,
    pub declared: Option<String>,
    pub observed: Option<String>,
}

/// Drift report for one machine
///
/// Only mutable fields are compared. The observed side wins: the report
/// describes what the caller should adopt, nothing is pushed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub key: ResourceKey,
    pub fields: Vec<FieldDrift>,
}

impl DriftReport {
    pub fn compute(declared: &ResourceSpec, observed: &ResourceSnapshot) -> Self {
        let alloc = &observed.allocation;
        let candidates = [
            ("hostname", Some(declared.hostname.as_str()), Some(alloc.hostname.as_str())),
            ("name", Some(declared.display_name()), Some(alloc.name.as_str())),
            (
                "description",
                non_empty(declared.description.as_deref()),
                non_empty(alloc.description.as_deref()),
            ),
        ];

        let fields = candidates
            .into_iter()
            .filter(|(_, declared, observed)| declared != observed)
            .map(|(field, declared, observed)| FieldDrift {
                field,
                declared: declared.map(str::to_string),
                observed: observed.map(str::to_string),
            })
            .collect();

        Self {
            key: observed.key(),
            fields,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.field).collect()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
