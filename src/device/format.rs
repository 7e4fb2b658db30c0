use std::collections::BTreeMap;

use super::command::MetadataField;

pub const DEFAULT_TEMPLATE: &str = "{take}";

/// Builds recording names from a `{key}` template, e.g. `{device}_{take}`.
/// Placeholders without a value are left intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFormatter {
    template: String,
    values: BTreeMap<String, String>,
}

impl NameFormatter {
    pub fn new(device_name: &str) -> Self {
        let mut formatter = Self {
            template: DEFAULT_TEMPLATE.to_string(),
            values: BTreeMap::new(),
        };
        formatter.set_device_name(device_name);
        formatter
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn set_template(&mut self, template: impl Into<String>) {
        self.template = template.into();
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.values.insert("device".to_string(), name.to_string());
        self.values.insert("name".to_string(), name.to_string());
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Store metadata that feeds a placeholder; other fields are ignored.
    pub fn apply_metadata(&mut self, field: MetadataField, value: &str) {
        if let Some(key) = field.placeholder() {
            self.set_value(key, value);
        }
    }

    pub fn format_take(&self, take: &str) -> String {
        let mut out = String::with_capacity(self.template.len() + take.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let key = &after[..close];
            let value = if key == "take" {
                Some(take)
            } else {
                self.value(key)
            };
            match value {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_is_take() {
        let formatter = NameFormatter::new("deck1");
        assert_eq!(formatter.format_take("sc01_t02"), "sc01_t02");
    }

    #[test]
    fn test_template_with_metadata() {
        let mut formatter = NameFormatter::new("deck1");
        formatter.set_template("{device}_{shot}_{n}_{take}");
        formatter.apply_metadata(MetadataField::ShotName, "wide");
        formatter.apply_metadata(MetadataField::TakeNumber, "3");
        formatter.apply_metadata(MetadataField::Notes, "ignored");
        assert_eq!(formatter.format_take("t"), "deck1_wide_3_t");
    }

    #[test]
    fn test_unknown_placeholder_left_intact() {
        let mut formatter = NameFormatter::new("cam");
        formatter.set_template("{take}-{mystery}-{unterminated");
        assert_eq!(formatter.format_take("a"), "a-{mystery}-{unterminated");
    }
}
