//! Data graph masks
//!
//! A mask names the leaf fields and single-valued references of one entity
//! type that take part in a partial update. Masks usually arrive with an
//! update request, so they are plain serde data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    /// Not supported by masked updates
    Many,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Only the foreign key is updated
    Loose,
    /// The referenced object is created or updated with its parent
    Nested,
}

/// One reference taking part in a masked update
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMask {
    pub property: String,
    pub foreign_key: String,
    pub cardinality: Cardinality,
    pub binding: Binding,
    /// Mask applied to the referenced object for nested bindings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DataGraphMask>,
}

impl ReferenceMask {
    pub fn loose(property: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::One,
            binding: Binding::Loose,
            to: None,
        }
    }

    pub fn nested(property: impl Into<String>, foreign_key: impl Into<String>, to: DataGraphMask) -> Self {
        Self {
            property: property.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::One,
            binding: Binding::Nested,
            to: Some(to),
        }
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataGraphMask {
    #[serde(default)]
    pub fields: BTreeSet<String>,
    #[serde(default)]
    pub references: Vec<ReferenceMask>,
}

impl DataGraphMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            references: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into());
        self
    }

    pub fn with_reference(mut self, reference: ReferenceMask) -> Self {
        self.references.push(reference);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.references.is_empty()
    }
}
