//! Immutable persona descriptors.
//!
//! A persona is identity plus prompt assembly plus a memory scope. Agents hold
//! at most one; binding a new one is what switches the agent's memory scope.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ErrorCategory;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum PersonaError {
    #[error("persona_id must not be empty")]
    MissingId,
    #[error("persona {0} has no name")]
    MissingName(String),
    #[error("persona {0} has no memory_scope_id")]
    MissingMemoryScope(String),
    #[error("persona {0} is disabled")]
    Disabled(String),
    #[error("invalid persona definition: {0}")]
    Malformed(String),
}

impl PersonaError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::AgentLifecycle
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingId => "missing_id",
            Self::MissingName(_) => "missing_name",
            Self::MissingMemoryScope(_) => "missing_memory_scope",
            Self::Disabled(_) => "disabled",
            Self::Malformed(_) => "malformed",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaStatus {
    #[default]
    Active,
    Deprecated,
    Disabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaSwitchPolicy {
    Fixed,
    Session,
    #[default]
    UserConfirm,
}

/// A prompt fragment: a bare string or an object with `content` or `template`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptTemplate {
    Text(String),
    Block {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
    },
}

impl PromptTemplate {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::Block { content, template } => content
                .as_deref()
                .filter(|c| !c.is_empty())
                .or(template.as_deref())
                .unwrap_or(""),
        }
    }
}

fn default_version() -> String {
    "1.0.0".into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonaMatrix {
    pub persona_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub status: PersonaStatus,
    #[serde(default)]
    pub switch_policy: PersonaSwitchPolicy,
    /// Keyed fragments in declaration order.
    #[serde(default, with = "ordered_templates")]
    pub prompt_templates: Vec<(String, PromptTemplate)>,
    #[serde(default)]
    pub prompt_priority: Vec<String>,
    #[serde(default)]
    pub memory_scope_id: String,
    #[serde(default)]
    pub behavior_constraints: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PersonaMatrix {
    pub fn new(
        persona_id: impl Into<String>,
        name: impl Into<String>,
        memory_scope_id: impl Into<String>,
    ) -> Self {
        Self {
            persona_id: persona_id.into(),
            name: name.into(),
            version: default_version(),
            status: PersonaStatus::Active,
            switch_policy: PersonaSwitchPolicy::UserConfirm,
            prompt_templates: Vec::new(),
            prompt_priority: Vec::new(),
            memory_scope_id: memory_scope_id.into(),
            behavior_constraints: Map::new(),
            description: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_template(mut self, key: impl Into<String>, template: PromptTemplate) -> Self {
        self.prompt_templates.push((key.into(), template));
        self
    }

    pub fn with_priority(mut self, order: Vec<String>) -> Self {
        self.prompt_priority = order;
        self
    }

    pub fn with_status(mut self, status: PersonaStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_switch_policy(mut self, policy: PersonaSwitchPolicy) -> Self {
        self.switch_policy = policy;
        self
    }

    /// Fails closed on anything that must not be bound to an agent.
    pub fn validate(&self) -> Result<(), PersonaError> {
        if self.persona_id.trim().is_empty() {
            return Err(PersonaError::MissingId);
        }
        if self.name.trim().is_empty() {
            return Err(PersonaError::MissingName(self.persona_id.clone()));
        }
        if self.memory_scope_id.trim().is_empty() {
            return Err(PersonaError::MissingMemoryScope(self.persona_id.clone()));
        }
        if self.status == PersonaStatus::Disabled {
            return Err(PersonaError::Disabled(self.persona_id.clone()));
        }
        Ok(())
    }

    pub fn from_value(value: Value) -> Result<Self, PersonaError> {
        let persona: Self =
            serde_json::from_value(value).map_err(|e| PersonaError::Malformed(e.to_string()))?;
        persona.validate()?;
        Ok(persona)
    }

    pub fn from_json(json: &str) -> Result<Self, PersonaError> {
        let persona: Self =
            serde_json::from_str(json).map_err(|e| PersonaError::Malformed(e.to_string()))?;
        persona.validate()?;
        Ok(persona)
    }

    pub fn is_switchable(&self) -> bool {
        self.switch_policy != PersonaSwitchPolicy::Fixed
    }

    pub fn requires_user_confirm(&self) -> bool {
        self.switch_policy == PersonaSwitchPolicy::UserConfirm
    }

    pub fn template(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompt_templates
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, t)| t)
    }

    /// Keys in assembly order: the priority list if set, otherwise declaration order.
    pub fn prompt_order(&self) -> Vec<&str> {
        if self.prompt_priority.is_empty() {
            self.prompt_templates.iter().map(|(k, _)| k.as_str()).collect()
        } else {
            self.prompt_priority.iter().map(String::as_str).collect()
        }
    }

    /// Concatenates the templates with `{name}` placeholders filled from `context`.
    /// Unknown placeholders stay as written.
    pub fn build_system_prompt(&self, context: &HashMap<String, String>) -> String {
        let parts: Vec<String> = self
            .prompt_order()
            .into_iter()
            .filter_map(|key| self.template(key))
            .map(|tpl| tpl.text().trim())
            .filter(|text| !text.is_empty())
            .map(|text| render(text, context))
            .collect();
        parts.join("\n\n").trim().to_owned()
    }
}

impl fmt::Display for PersonaMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.persona_id, self.version)
    }
}

fn render(text: &str, context: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| match context.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_owned(),
        })
        .into_owned()
}

/// Serializes the template list as a JSON object, keeping key order both ways.
mod ordered_templates {
    use std::fmt;

    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::PromptTemplate;

    pub fn serialize<S: Serializer>(
        templates: &[(String, PromptTemplate)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(templates.len()))?;
        for (key, tpl) in templates {
            map.serialize_entry(key, tpl)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, PromptTemplate)>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<(String, PromptTemplate)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of prompt templates")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, tpl)) = access.next_entry::<String, PromptTemplate>()? {
                    out.push((key, tpl));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            PersonaMatrix::new("", "n", "m").validate(),
            Err(PersonaError::MissingId)
        );
        assert!(matches!(
            PersonaMatrix::new("p", " ", "m").validate(),
            Err(PersonaError::MissingName(_))
        ));
        assert!(matches!(
            PersonaMatrix::new("p", "n", "").validate(),
            Err(PersonaError::MissingMemoryScope(_))
        ));
    }

    #[test]
    fn disabled_persona_never_loads() {
        let err = PersonaMatrix::from_value(json!({
            "persona_id": "p",
            "name": "n",
            "memory_scope_id": "m",
            "status": "disabled"
        }))
        .unwrap_err();
        assert_eq!(err, PersonaError::Disabled("p".into()));
        assert_eq!(err.category(), ErrorCategory::AgentLifecycle);
    }

    #[test]
    fn from_json_defaults() {
        let p = PersonaMatrix::from_json(
            r#"{"persona_id":"p","name":"Helper","memory_scope_id":"scope"}"#,
        )
        .unwrap();
        assert_eq!(p.version, "1.0.0");
        assert_eq!(p.status, PersonaStatus::Active);
        assert!(p.requires_user_confirm());
        assert!(p.is_switchable());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            PersonaMatrix::from_json("{not json"),
            Err(PersonaError::Malformed(_))
        ));
    }

    #[test]
    fn prompt_uses_declaration_order() {
        let p = PersonaMatrix::from_value(json!({
            "persona_id": "p",
            "name": "n",
            "memory_scope_id": "m",
            "prompt_templates": {
                "zeta": "You are {name}.",
                "alpha": {"content": "  Be brief.  "},
                "empty": "   ",
                "beta": {"template": "Topic: {topic}"}
            }
        }))
        .unwrap();
        let prompt = p.build_system_prompt(&ctx(&[("name", "Ada")]));
        assert_eq!(prompt, "You are Ada.\n\nBe brief.\n\nTopic: {topic}");
    }

    #[test]
    fn priority_overrides_order_and_skips_unknown_keys() {
        let p = PersonaMatrix::new("p", "n", "m")
            .with_template("a", PromptTemplate::Text("A".into()))
            .with_template("b", PromptTemplate::Text("B".into()))
            .with_priority(vec!["b".into(), "missing".into(), "a".into()]);
        assert_eq!(p.build_system_prompt(&HashMap::new()), "B\n\nA");
    }

    #[test]
    fn template_order_survives_serialization() {
        let p = PersonaMatrix::new("p", "n", "m")
            .with_template("z", PromptTemplate::Text("Z".into()))
            .with_template("a", PromptTemplate::Text("A".into()));
        let json = serde_json::to_string(&p).unwrap();
        let back = PersonaMatrix::from_json(&json).unwrap();
        assert_eq!(back.prompt_order(), vec!["z", "a"]);
    }

    #[test]
    fn fixed_policy_is_not_switchable() {
        let p = PersonaMatrix::new("p", "n", "m").with_switch_policy(PersonaSwitchPolicy::Fixed);
        assert!(!p.is_switchable());
        assert!(!p.requires_user_confirm());
    }
}
