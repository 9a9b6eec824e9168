//! Default parse collaborator: JSON listing feeds.
//!
//! Many technology-transfer portals expose their listings as a JSON feed.
//! This parser treats the job's selector config as JSON pointers:
//! `item_selector` locates the listing array in the document, each entry
//! in `fields` locates one record field inside an item, and
//! `next_page_selector` locates the next-page URL at the document root.
//!
//! HTML and PDF extraction live in a separate subsystem behind the same
//! [`Parser`] interface.

use magpie_core::error::AppError;
use magpie_core::job::SelectorConfig;
use magpie_core::record::RecordDraft;
use magpie_core::traits::{ParseOutcome, Parser};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonListingParser;

impl JsonListingParser {
    pub fn new() -> Self {
        Self
    }

    fn field<'a>(
        item: &'a serde_json::Value,
        selector: &SelectorConfig,
        name: &str,
    ) -> Option<&'a str> {
        let pointer = selector.fields.get(name)?;
        item.pointer(pointer).and_then(|v| v.as_str())
    }
}

impl Parser for JsonListingParser {
    fn parse(&self, raw: &str, selector: &SelectorConfig) -> Result<ParseOutcome, AppError> {
        let doc: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| AppError::Parse(format!("document is not valid JSON: {e}")))?;

        let items = doc
            .pointer(&selector.item_selector)
            .ok_or_else(|| {
                AppError::Parse(format!(
                    "item selector '{}' matched nothing",
                    selector.item_selector
                ))
            })?
            .as_array()
            .ok_or_else(|| {
                AppError::Parse(format!(
                    "item selector '{}' does not point at an array",
                    selector.item_selector
                ))
            })?;

        let mut outcome = ParseOutcome::default();
        for (index, item) in items.iter().enumerate() {
            let Some(title) = Self::field(item, selector, "title") else {
                outcome
                    .errors
                    .push(format!("item {index}: no title at configured selector"));
                continue;
            };
            outcome.records.push(RecordDraft {
                title: title.to_string(),
                description: Self::field(item, selector, "description")
                    .unwrap_or_default()
                    .to_string(),
                category: Self::field(item, selector, "category").map(str::to_string),
                country: Self::field(item, selector, "country").map(str::to_string),
            });
        }

        outcome.next_page = selector
            .next_page_selector
            .as_ref()
            .and_then(|pointer| doc.pointer(pointer))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn selector() -> SelectorConfig {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), "/name".to_string());
        fields.insert("description".to_string(), "/summary".to_string());
        fields.insert("category".to_string(), "/tags/0".to_string());
        SelectorConfig {
            item_selector: "/listings".to_string(),
            fields,
            next_page_selector: Some("/next".to_string()),
        }
    }

    #[test]
    fn parses_records_and_next_page() {
        let doc = r#"{
            "listings": [
                {"name": "Battery electrolyte", "summary": "Solid-state cell", "tags": ["materials"]},
                {"name": "Gene vector", "summary": "AAV capsid"}
            ],
            "next": "https://tto.example.edu/listings?page=2"
        }"#;

        let outcome = JsonListingParser::new().parse(doc, &selector()).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].title, "Battery electrolyte");
        assert_eq!(outcome.records[0].category.as_deref(), Some("materials"));
        assert_eq!(outcome.records[1].category, None);
        assert_eq!(
            outcome.next_page.as_deref(),
            Some("https://tto.example.edu/listings?page=2")
        );
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn item_without_title_becomes_an_error_not_a_record() {
        let doc = r#"{"listings": [{"summary": "no name"}, {"name": "Ok"}]}"#;
        let outcome = JsonListingParser::new().parse(doc, &selector()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("item 0"));
    }

    #[test]
    fn missing_next_page_is_none() {
        let doc = r#"{"listings": []}"#;
        let outcome = JsonListingParser::new().parse(doc, &selector()).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.next_page, None);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = JsonListingParser::new()
            .parse("<html>not json</html>", &selector())
            .unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn wrong_item_selector_is_a_parse_error() {
        let doc = r#"{"listings": {"not": "an array"}}"#;
        let err = JsonListingParser::new().parse(doc, &selector()).unwrap_err();
        assert!(err.to_string().contains("does not point at an array"));
    }
}
