use serde::{Deserialize, Serialize};

use crate::capabilities::DocumentPath;
use crate::model::Fields;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocumentPath,
    pub fields: Fields,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// One emission of a live query: the complete ordered result set plus what
/// changed since the previous emission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
}

impl Snapshot {
    /// Builds a snapshot for `current`, diffing against the documents of the
    /// previous emission (empty on first delivery).
    pub fn diff(previous: &[Document], current: Vec<Document>) -> Self {
        let mut changes = Vec::new();

        for doc in &current {
            match previous.iter().find(|p| p.path == doc.path) {
                None => changes.push(DocumentChange {
                    kind: ChangeKind::Added,
                    document: doc.clone(),
                }),
                Some(prev) if prev.fields != doc.fields => changes.push(DocumentChange {
                    kind: ChangeKind::Modified,
                    document: doc.clone(),
                }),
                Some(_) => {}
            }
        }

        for prev in previous {
            if !current.iter().any(|d| d.path == prev.path) {
                changes.push(DocumentChange {
                    kind: ChangeKind::Removed,
                    document: prev.clone(),
                });
            }
        }

        Self {
            documents: current,
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
