//! Administrative settings surface that backends contribute fields to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the host should render a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Toggle,
    Path,
}

/// A single configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    /// Unique field name, e.g. `memcached.host`.
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    /// Current value.
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl SettingField {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        kind: FieldKind,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            value: value.into(),
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

/// Insertion-ordered collection of fields keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsForm {
    fields: Vec<SettingField>,
}

impl SettingsForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing an existing one with the same name in place.
    pub fn insert(&mut self, field: SettingField) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SettingField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SettingField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_order_and_replaces() {
        let mut form = SettingsForm::new();
        form.insert(SettingField::new("site.title", "Title", FieldKind::Text, "Forum"));
        form.insert(SettingField::new("memcached.host", "Host", FieldKind::Text, "127.0.0.1"));
        form.insert(SettingField::new("memcached.port", "Port", FieldKind::Number, 11211));
        form.insert(SettingField::new("memcached.host", "Host", FieldKind::Text, "cache.local"));

        let names: Vec<&str> = form.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["site.title", "memcached.host", "memcached.port"]);
        assert_eq!(form.get("memcached.host").unwrap().value, "cache.local");
        assert_eq!(form.len(), 3);
    }

    #[test]
    fn test_serializes_as_list() {
        let mut form = SettingsForm::new();
        form.insert(
            SettingField::new("file.directory", "Directory", FieldKind::Path, "/cache")
                .with_help("Where entry files are kept"),
        );

        let json = serde_json::to_value(&form).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["kind"], "path");
        assert_eq!(json[0]["help"], "Where entry files are kept");
    }
}
