//! Per-connection store of declared values.
//!
//! Values arrive in two phases: a `metainfo` declaration fixes the name, type
//! word, and description (selections then stream their labels), and later
//! `value` lines update the content. Updates for undeclared names are
//! rejected; within a store, last writer wins and names are unique.

use std::collections::HashMap;

use skyproto::{Params, ProtoError, TypeWord, ValueData};

/// One declared value with its current content.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub type_word: TypeWord,
    pub description: String,
    /// Option labels, populated by `selmetainfo` for selection values.
    pub labels: Vec<String>,
    pub data: ValueData,
}

impl ValueEntry {
    /// Resolve a selection's current label, when in range.
    pub fn selected_label(&self) -> Option<&str> {
        match self.data {
            ValueData::Selection(idx) => self.labels.get(idx as usize).map(String::as_str),
            _ => None,
        }
    }
}

/// All values a peer has declared, in declaration order.
#[derive(Debug, Default)]
pub struct ValueStore {
    entries: HashMap<String, ValueEntry>,
    order: Vec<String>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a `metainfo` declaration. Redeclaring a name replaces the old
    /// entry (peers redeclare on reconnect).
    pub fn declare(
        &mut self,
        type_word: TypeWord,
        name: &str,
        description: &str,
    ) -> Result<(), ProtoError> {
        let kind = type_word.kind()?;
        let entry = ValueEntry {
            type_word,
            description: description.to_string(),
            labels: Vec::new(),
            data: ValueData::default_for(kind),
        };
        if self.entries.insert(name.to_string(), entry).is_none() {
            self.order.push(name.to_string());
        }
        Ok(())
    }

    /// Handle a `selmetainfo` label line.
    pub fn add_label(&mut self, name: &str, label: &str) -> Result<(), ProtoError> {
        let entry = self.lookup_mut(name)?;
        entry.labels.push(label.to_string());
        Ok(())
    }

    /// Handle a `value` update: parse the payload by the declared kind.
    pub fn update_from_wire(&mut self, name: &str, params: &mut Params) -> Result<(), ProtoError> {
        let kind = self.lookup(name)?.type_word.kind()?;
        let data = ValueData::parse(kind, params)?;
        params.end("value")?;
        self.lookup_mut(name)?.data = data;
        Ok(())
    }

    /// Replace a value's content directly (local side).
    pub fn set(&mut self, name: &str, data: ValueData) -> Result<(), ProtoError> {
        self.lookup_mut(name)?.data = data;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ValueEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ValueEntry)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| (name.as_str(), e)))
    }

    /// Numeric view of a value, used for least-loaded peer selection.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        match self.entries.get(name)?.data {
            ValueData::Integer(v) => Some(v as f64),
            ValueData::Double(v) => Some(v),
            ValueData::Time(v) => Some(v),
            ValueData::BoundedDouble { value, .. } => Some(value),
            ValueData::Selection(v) => Some(v as f64),
            ValueData::Boolean(v) => Some(if v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn lookup(&self, name: &str) -> Result<&ValueEntry, ProtoError> {
        self.entries.get(name).ok_or_else(|| ProtoError::InvalidParam {
            name: "value name",
            value: name.to_string(),
        })
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut ValueEntry, ProtoError> {
        self.entries.get_mut(name).ok_or_else(|| ProtoError::InvalidParam {
            name: "value name",
            value: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyproto::{TypeWord, ValueKind};

    fn update(store: &mut ValueStore, line: &str) -> Result<(), ProtoError> {
        let (cmd, mut params) = Params::parse_line(line).unwrap();
        assert_eq!(cmd, "value");
        let name = params.next_str("value name").unwrap();
        store.update_from_wire(&name, &mut params)
    }

    #[test]
    fn declare_then_update() {
        let mut store = ValueStore::new();
        store
            .declare(TypeWord::new(ValueKind::Double), "temp", "CCD temperature")
            .unwrap();
        update(&mut store, "value temp -20.5").unwrap();
        assert_eq!(store.get("temp").unwrap().data, ValueData::Double(-20.5));
    }

    #[test]
    fn update_without_declaration_rejected() {
        let mut store = ValueStore::new();
        assert!(update(&mut store, "value ghost 1").is_err());
    }

    #[test]
    fn last_writer_wins() {
        let mut store = ValueStore::new();
        store
            .declare(TypeWord::new(ValueKind::Integer), "queue_size", "pending images")
            .unwrap();
        update(&mut store, "value queue_size 4").unwrap();
        update(&mut store, "value queue_size 7").unwrap();
        assert_eq!(store.numeric("queue_size"), Some(7.0));
    }

    #[test]
    fn selection_labels() {
        let mut store = ValueStore::new();
        store
            .declare(
                TypeWord::new(ValueKind::Selection).writable(),
                "filter",
                "filter wheel slot",
            )
            .unwrap();
        for label in ["U", "B", "V", "R"] {
            store.add_label("filter", label).unwrap();
        }
        update(&mut store, "value filter 2").unwrap();
        assert_eq!(store.get("filter").unwrap().selected_label(), Some("V"));
    }

    #[test]
    fn wrong_payload_arity_rejected() {
        let mut store = ValueStore::new();
        store
            .declare(TypeWord::new(ValueKind::RaDec), "ora", "current position")
            .unwrap();
        assert!(update(&mut store, "value ora 83.6").is_err());
        assert!(update(&mut store, "value ora 83.6 22.0 99").is_err());
    }

    #[test]
    fn declaration_order_preserved() {
        let mut store = ValueStore::new();
        for name in ["a", "b", "c"] {
            store.declare(TypeWord::new(ValueKind::Integer), name, "").unwrap();
        }
        let names: Vec<_> = store.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
