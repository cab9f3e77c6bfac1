//! Catalog resolution by normalized description.
//!
//! Each catalog is an arena of nodes addressed by index, with an explicit
//! parent index for the hierarchical ones (organ, region, sector). The set of
//! catalogs is a fixed table indexed by [`CatalogKind`].

use std::collections::HashMap;

use regsync_core::{
    CallDetail, CallRelation, CatalogEntry, CatalogKind, CatalogRef, EnrichedRecord, OrganPath, ReferenceItem,
};
use regsync_store::{CanonicalStore, StoreError};
use tracing::debug;

/// Lowercases and collapses whitespace; trailing dots are dropped.
pub fn normalize(text: &str) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    joined.trim_end_matches('.').trim_end().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub key: String,
    pub description: String,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CatalogTable {
    kind: CatalogKind,
    nodes: Vec<CatalogNode>,
    by_key: HashMap<String, usize>,
    by_description: HashMap<String, Vec<usize>>,
}

impl CatalogTable {
    pub fn empty(kind: CatalogKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            by_key: HashMap::new(),
            by_description: HashMap::new(),
        }
    }

    /// Builds the arena. Parent keys that are unknown or point at the node
    /// itself are dropped, leaving the node at the root.
    pub fn build(kind: CatalogKind, entries: &[CatalogEntry]) -> Self {
        let mut table = Self::empty(kind);
        for entry in entries.iter().filter(|e| e.kind == kind) {
            if table.by_key.contains_key(&entry.key) {
                continue;
            }
            let idx = table.nodes.len();
            table.by_key.insert(entry.key.clone(), idx);
            table
                .by_description
                .entry(normalize(&entry.description))
                .or_default()
                .push(idx);
            table.nodes.push(CatalogNode {
                key: entry.key.clone(),
                description: entry.description.clone(),
                parent: None,
            });
        }
        for entry in entries.iter().filter(|e| e.kind == kind) {
            let (Some(&idx), Some(parent_key)) = (table.by_key.get(&entry.key), entry.parent_key.as_ref()) else {
                continue;
            };
            if let Some(&parent) = table.by_key.get(parent_key) {
                if parent != idx {
                    table.nodes[idx].parent = Some(parent);
                }
            }
        }
        table
    }

    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, key: &str) -> Option<&CatalogNode> {
        self.by_key.get(key).map(|&i| &self.nodes[i])
    }

    /// First node whose normalized description matches.
    pub fn resolve(&self, description: &str) -> Option<&str> {
        self.by_description
            .get(&normalize(description))
            .and_then(|ids| ids.first())
            .map(|&i| self.nodes[i].key.as_str())
    }

    fn child(&self, parent: Option<usize>, description: &str) -> Option<usize> {
        self.by_description
            .get(&normalize(description))?
            .iter()
            .copied()
            .find(|&i| self.nodes[i].parent == parent)
    }

    /// Walks `levels` from the root, each level a child of the previous one.
    /// Falls back to the last level when its description is unique.
    pub fn resolve_path(&self, levels: &[&str]) -> Option<&str> {
        let mut current = None;
        let mut walked = true;
        for level in levels {
            match self.child(current, level) {
                Some(idx) => current = Some(idx),
                None => {
                    walked = false;
                    break;
                }
            }
        }
        if walked {
            return current.map(|i| self.nodes[i].key.as_str());
        }
        let last = levels.last()?;
        match self.by_description.get(&normalize(last)) {
            Some(ids) if ids.len() == 1 => Some(self.nodes[ids[0]].key.as_str()),
            _ => None,
        }
    }

    /// Ancestors of `key`, nearest first. Bounded by the arena size, so a
    /// cyclic parent chain terminates.
    pub fn ancestors(&self, key: &str) -> Vec<&CatalogNode> {
        let mut out = Vec::new();
        let mut current = self.by_key.get(key).and_then(|&i| self.nodes[i].parent);
        while let Some(idx) = current {
            if out.len() >= self.nodes.len() {
                break;
            }
            out.push(&self.nodes[idx]);
            current = self.nodes[idx].parent;
        }
        out
    }
}

/// One table per [`CatalogKind`], indexed by the kind's position.
#[derive(Debug, Clone)]
pub struct CatalogSet {
    tables: Vec<CatalogTable>,
}

impl CatalogSet {
    pub fn build(entries: &[CatalogEntry]) -> Self {
        let tables = CatalogKind::ALL
            .iter()
            .map(|&kind| CatalogTable::build(kind, entries))
            .collect();
        Self { tables }
    }

    pub async fn load(store: &dyn CanonicalStore) -> Result<Self, StoreError> {
        let entries = store.catalog_entries(None).await?;
        let set = Self::build(&entries);
        debug!(entries = entries.len(), "catalogs loaded");
        Ok(set)
    }

    pub fn table(&self, kind: CatalogKind) -> &CatalogTable {
        &self.tables[kind as usize]
    }

    pub fn resolve(&self, kind: CatalogKind, item: &ReferenceItem) -> CatalogRef {
        match self.table(kind).resolve(&item.description) {
            Some(key) => CatalogRef::Resolved { key: key.to_string() },
            None => CatalogRef::Unresolved { raw: raw_reference(item) },
        }
    }

    pub fn resolve_organ(&self, organ: &OrganPath) -> CatalogRef {
        let levels = organ.levels();
        match self.table(CatalogKind::Organ).resolve_path(&levels) {
            Some(key) => CatalogRef::Resolved { key: key.to_string() },
            None => CatalogRef::Unresolved { raw: levels.join(" / ") },
        }
    }

    /// Resolves every reference on a call detail.
    pub fn enrich(&self, detail: &CallDetail, subtype: &str) -> EnrichedRecord {
        let organ = detail
            .organ
            .as_ref()
            .filter(|o| !o.levels().is_empty())
            .map(|o| self.resolve_organ(o));
        let relations = CatalogKind::RELATIONS
            .iter()
            .flat_map(|&kind| {
                detail.references(kind).iter().map(move |item| CallRelation {
                    kind,
                    reference: self.resolve(kind, item),
                })
            })
            .collect();
        EnrichedRecord {
            id: detail.id.clone(),
            subtype: subtype.to_string(),
            received_on: detail.received_on,
            title: detail.title.clone(),
            budget: detail.budget,
            organ,
            relations,
        }
    }
}

fn raw_reference(item: &ReferenceItem) -> String {
    if !item.description.trim().is_empty() {
        return item.description.clone();
    }
    match &item.id {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
