//! Controlled vocabularies used to tag catalog entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Falls back to the file stem when loaded from disk
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub terms: Vec<VocabularyTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub definition: String,
}
