//! ECR-compatible lifecycle policy documents.

use std::collections::HashSet;
use std::path::Path;

use dockyard_core::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Which images a rule considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Tagged,
    Untagged,
    Any,
}

/// How a rule's limit is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CountType {
    /// Keep the `countNumber` newest images
    ImageCountMoreThan,
    /// Expire images older than `countNumber` units
    SinceImagePushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountUnit {
    Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub tag_status: TagStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix_list: Option<Vec<String>>,
    pub count_type: CountType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_unit: Option<CountUnit>,
    pub count_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
}

/// One retention rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub selection: Selection,
    pub action: Action,
}

impl Rule {
    /// Whether an image carrying `tags` falls under this rule's selection.
    pub fn selects(&self, tags: &[String]) -> bool {
        match self.selection.tag_status {
            TagStatus::Any => true,
            TagStatus::Untagged => tags.is_empty(),
            TagStatus::Tagged => {
                if tags.is_empty() {
                    return false;
                }
                match self.selection.tag_prefix_list.as_deref() {
                    None | Some([]) => true,
                    Some(prefixes) => tags
                        .iter()
                        .any(|tag| prefixes.iter().any(|p| tag.starts_with(p.as_str()))),
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let priority = self.rule_priority;
        if priority == 0 {
            return Err(PipelineError::policy(0, "rulePriority must be at least 1"));
        }

        let selection = &self.selection;
        if selection.count_number == 0 {
            return Err(PipelineError::policy(priority, "countNumber must be at least 1"));
        }
        match (selection.count_type, selection.count_unit) {
            (CountType::SinceImagePushed, None) => {
                return Err(PipelineError::policy(
                    priority,
                    "countUnit is required when countType is sinceImagePushed",
                ));
            }
            (CountType::ImageCountMoreThan, Some(_)) => {
                return Err(PipelineError::policy(
                    priority,
                    "countUnit is not allowed when countType is imageCountMoreThan",
                ));
            }
            _ => {}
        }

        if let Some(prefixes) = &selection.tag_prefix_list {
            if selection.tag_status != TagStatus::Tagged {
                return Err(PipelineError::policy(
                    priority,
                    "tagPrefixList is only allowed when tagStatus is tagged",
                ));
            }
            if prefixes.iter().any(|p| p.is_empty()) {
                return Err(PipelineError::policy(
                    priority,
                    "tagPrefixList entries must not be empty",
                ));
            }
        }
        Ok(())
    }
}

/// A lifecycle policy: retention rules evaluated in ascending priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    pub rules: Vec<Rule>,
}

impl LifecyclePolicy {
    /// Parse and validate a JSON policy document.
    pub fn parse(document: &str) -> Result<Self> {
        let policy: Self =
            serde_json::from_str(document).map_err(|e| PipelineError::PolicyRejected {
                priority: None,
                message: format!("invalid policy document: {}", e),
            })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Read and validate a policy file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigError(format!(
                "Failed to read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&document)
    }

    /// Check the structural rules a registry enforces on upload.
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(PipelineError::PolicyRejected {
                priority: None,
                message: "policy must contain at least one rule".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.rule_priority) {
                return Err(PipelineError::policy(
                    rule.rule_priority,
                    "rulePriority values must be unique",
                ));
            }
        }

        let highest = self.rules.iter().map(|r| r.rule_priority).max().unwrap_or(0);
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.selection.tag_status == TagStatus::Any && r.rule_priority != highest)
        {
            return Err(PipelineError::policy(
                rule.rule_priority,
                "a rule with tagStatus any must have the highest rulePriority",
            ));
        }
        Ok(())
    }

    /// Rules in evaluation order.
    pub fn ordered_rules(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.rule_priority);
        rules
    }

    /// Compact JSON with rules sorted by priority and keys sorted.
    ///
    /// Two policies with the same canonical form are the same policy.
    pub fn canonical(&self) -> Result<String> {
        let ordered = LifecyclePolicy {
            rules: self.ordered_rules().into_iter().cloned().collect(),
        };
        let value = sort_keys(serde_json::to_value(&ordered)?);
        Ok(serde_json::to_string(&value)?)
    }

    /// Pretty-printed document for display.
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Rebuild objects with keys in lexical order, whatever map type serde_json
/// was compiled with.
fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEEP_THREE: &str = r#"{
        "rules": [
            {
                "rulePriority": 1,
                "description": "Keep last 3 images",
                "selection": {
                    "tagStatus": "tagged",
                    "tagPrefixList": ["v"],
                    "countType": "imageCountMoreThan",
                    "countNumber": 3
                },
                "action": { "type": "expire" }
            }
        ]
    }"#;

    fn rejected_priority(document: &str) -> Option<u32> {
        match LifecyclePolicy::parse(document).unwrap_err() {
            PipelineError::PolicyRejected { priority, .. } => priority,
            other => panic!("expected PolicyRejected, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keep_three() {
        let policy = LifecyclePolicy::parse(KEEP_THREE).unwrap();
        assert_eq!(policy.rules.len(), 1);
        let rule = &policy.rules[0];
        assert_eq!(rule.rule_priority, 1);
        assert_eq!(rule.selection.tag_status, TagStatus::Tagged);
        assert_eq!(rule.selection.count_type, CountType::ImageCountMoreThan);
        assert_eq!(rule.selection.count_number, 3);
        assert_eq!(rule.action.action_type, ActionType::Expire);
    }

    #[test]
    fn test_rejects_empty_rules() {
        assert_eq!(rejected_priority(r#"{"rules": []}"#), None);
    }

    #[test]
    fn test_rejects_unknown_action() {
        let doc = KEEP_THREE.replace("\"expire\"", "\"archive\"");
        assert_eq!(rejected_priority(&doc), None);
    }

    #[test]
    fn test_rejects_zero_count() {
        let doc = KEEP_THREE.replace("\"countNumber\": 3", "\"countNumber\": 0");
        assert_eq!(rejected_priority(&doc), Some(1));
    }

    #[test]
    fn test_rejects_duplicate_priority() {
        let doc = r#"{"rules": [
            {"rulePriority": 2, "selection": {"tagStatus": "untagged", "countType": "imageCountMoreThan", "countNumber": 1}, "action": {"type": "expire"}},
            {"rulePriority": 2, "selection": {"tagStatus": "tagged", "countType": "imageCountMoreThan", "countNumber": 5}, "action": {"type": "expire"}}
        ]}"#;
        assert_eq!(rejected_priority(doc), Some(2));
    }

    #[test]
    fn test_since_pushed_requires_days() {
        let doc = r#"{"rules": [
            {"rulePriority": 1, "selection": {"tagStatus": "untagged", "countType": "sinceImagePushed", "countNumber": 14}, "action": {"type": "expire"}}
        ]}"#;
        assert_eq!(rejected_priority(doc), Some(1));

        let ok = doc.replace("\"countNumber\"", "\"countUnit\": \"days\", \"countNumber\"");
        assert!(LifecyclePolicy::parse(&ok).is_ok());
    }

    #[test]
    fn test_count_unit_forbidden_for_image_count() {
        let doc = KEEP_THREE.replace("\"countNumber\"", "\"countUnit\": \"days\", \"countNumber\"");
        assert_eq!(rejected_priority(&doc), Some(1));
    }

    #[test]
    fn test_prefix_list_requires_tagged() {
        let doc = KEEP_THREE.replace("\"tagged\"", "\"untagged\"");
        assert_eq!(rejected_priority(&doc), Some(1));
    }

    #[test]
    fn test_any_rule_must_be_last() {
        let doc = r#"{"rules": [
            {"rulePriority": 1, "selection": {"tagStatus": "any", "countType": "imageCountMoreThan", "countNumber": 10}, "action": {"type": "expire"}},
            {"rulePriority": 2, "selection": {"tagStatus": "untagged", "countType": "imageCountMoreThan", "countNumber": 1}, "action": {"type": "expire"}}
        ]}"#;
        assert_eq!(rejected_priority(doc), Some(1));
    }

    #[test]
    fn test_canonical_ignores_order_and_whitespace() {
        let a = r#"{"rules": [
            {"rulePriority": 2, "selection": {"tagStatus": "any", "countType": "imageCountMoreThan", "countNumber": 10}, "action": {"type": "expire"}},
            {"rulePriority": 1, "selection": {"tagStatus": "untagged", "countType": "sinceImagePushed", "countUnit": "days", "countNumber": 7}, "action": {"type": "expire"}}
        ]}"#;
        let b = r#"{"rules":[{"action":{"type":"expire"},"selection":{"countNumber":7,"countUnit":"days","countType":"sinceImagePushed","tagStatus":"untagged"},"rulePriority":1},{"rulePriority":2,"action":{"type":"expire"},"selection":{"tagStatus":"any","countType":"imageCountMoreThan","countNumber":10}}]}"#;
        let a = LifecyclePolicy::parse(a).unwrap().canonical().unwrap();
        let b = LifecyclePolicy::parse(b).unwrap().canonical().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(r#"{"rules":[{"action":{"type":"expire"},"rulePriority":1"#));
    }

    #[test]
    fn test_rule_selects() {
        let policy = LifecyclePolicy::parse(KEEP_THREE).unwrap();
        let rule = &policy.rules[0];
        assert!(rule.selects(&["v1.2".to_string()]));
        assert!(rule.selects(&["latest".to_string(), "v3".to_string()]));
        assert!(!rule.selects(&["latest".to_string()]));
        assert!(!rule.selects(&[]));
    }

    #[test]
    fn test_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("policy.json");
        std::fs::write(&path, KEEP_THREE).unwrap();
        assert_eq!(LifecyclePolicy::from_file(&path).unwrap().rules.len(), 1);

        let err = LifecyclePolicy::from_file(&tmp.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigError(_)));
    }
}
