use std::collections::HashMap;

/// Flat multi-valued snapshot of one target used for filter evaluation.
///
/// Keys are lowercase field names, optionally qualified by a sub-key
/// (`attribute.device_type`). Sub-keys keep their original case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetFieldData {
    values: HashMap<String, Vec<String>>,
}

impl TargetFieldData {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds one more value to a field.
    pub fn add(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values
            .entry(normalize_key(field.into()))
            .or_default()
            .push(value.into());
    }

    /// Builder variant of [`TargetFieldData::add`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(field, value);
        self
    }

    /// Returns every value bound to a field; empty when the field is absent.
    #[must_use]
    pub fn values(&self, field: &str) -> &[String] {
        self.values
            .get(normalize_key(field.to_owned()).as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns true when no field has a bound value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize_key(key: String) -> String {
    match key.split_once('.') {
        Some((field, subkey)) => format!("{}.{subkey}", field.to_ascii_lowercase()),
        None => key.to_ascii_lowercase(),
    }
}
