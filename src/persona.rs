//! Personas the assistant can speak as.

use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u64 = 4096;
const DEFAULT_TEMPERATURE: f64 = 0.7;

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Passed to the model untouched.
    pub system_prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

/// Public view of a persona; the prompt stays on the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaSummary {
    pub id: String,
    pub name: String,
    pub title: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("unknown persona: {0}")]
    Unknown(String),
    #[error("failed to read personas file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid personas file: {0}")]
    Parse(#[from] serde_json::Error),
}

fn thinker(id: &str, name: &str, title: &str, voice: &str) -> Persona {
    Persona {
        id: id.to_string(),
        name: name.to_string(),
        title: title.to_string(),
        system_prompt: format!(
            "You are {name}. Answer in the first person, as {name} would, in {voice}. \
             Ground every claim in your own writings. Do not add modern disclaimers, \
             and say so plainly when your works do not address the question."
        ),
        max_tokens: DEFAULT_MAX_TOKENS,
        temperature: DEFAULT_TEMPERATURE,
    }
}

static BUILT_IN: Lazy<Vec<Persona>> = Lazy::new(|| {
    vec![
        thinker("plato", "Plato", "Athenian philosopher", "dialectical, questioning prose"),
        thinker("aristotle", "Aristotle", "Philosopher of the Lyceum", "careful, classifying prose"),
        thinker("hume", "David Hume", "Scottish empiricist", "clear, sceptical prose"),
        thinker("kant", "Immanuel Kant", "Critical philosopher", "precise, systematic prose"),
        thinker("spinoza", "Baruch Spinoza", "Rationalist philosopher", "geometric, measured prose"),
        thinker("nietzsche", "Friedrich Nietzsche", "Philologist and philosopher", "aphoristic, provocative prose"),
    ]
});

pub struct PersonaRegistry {
    personas: Vec<Persona>,
    default_id: String,
}

impl PersonaRegistry {
    pub fn built_in() -> Self {
        Self {
            personas: BUILT_IN.clone(),
            default_id: "plato".to_string(),
        }
    }

    /// Built-in personas extended by a JSON array; entries replace built-ins with the same id.
    pub fn load(path: &Path) -> Result<Self, PersonaError> {
        let extra: Vec<Persona> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut registry = Self::built_in();
        for persona in extra {
            match registry.personas.iter_mut().find(|p| p.id == persona.id) {
                Some(existing) => *existing = persona,
                None => registry.personas.push(persona),
            }
        }
        tracing::info!(path = %path.display(), count = registry.personas.len(), "personas loaded");
        Ok(registry)
    }

    pub fn with_default(mut self, id: &str) -> Result<Self, PersonaError> {
        let persona = self
            .get(id)
            .ok_or_else(|| PersonaError::Unknown(id.to_string()))?;
        self.default_id = persona.id.clone();
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    /// Look up `id`, or the default persona when none is given.
    pub fn resolve(&self, id: Option<&str>) -> Result<&Persona, PersonaError> {
        let id = id.unwrap_or(&self.default_id);
        self.get(id).ok_or_else(|| PersonaError::Unknown(id.to_string()))
    }

    pub fn summaries(&self) -> Vec<PersonaSummary> {
        self.personas
            .iter()
            .map(|p| PersonaSummary {
                id: p.id.clone(),
                name: p.name.clone(),
                title: p.title.clone(),
            })
            .collect()
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::built_in()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_and_ignores_case() {
        let registry = PersonaRegistry::built_in();
        assert_eq!(registry.resolve(None).unwrap().id, "plato");
        assert_eq!(registry.resolve(Some("KANT")).unwrap().name, "Immanuel Kant");
        assert!(matches!(
            registry.resolve(Some("nobody")),
            Err(PersonaError::Unknown(_))
        ));
    }

    #[test]
    fn file_entries_extend_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("personas.json");
        std::fs::write(
            &path,
            r#"[
                {"id":"plato","name":"Plato","systemPrompt":"custom"},
                {"id":"locke","name":"John Locke","systemPrompt":"You are Locke.","temperature":0.2}
            ]"#,
        )
        .unwrap();

        let registry = PersonaRegistry::load(&path)
            .unwrap()
            .with_default("locke")
            .unwrap();
        assert_eq!(registry.get("plato").unwrap().system_prompt, "custom");
        let locke = registry.resolve(None).unwrap();
        assert_eq!(locke.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(locke.temperature, 0.2);
        assert_eq!(registry.summaries().len(), 7);
    }

    #[test]
    fn summaries_hide_prompts() {
        let json = serde_json::to_value(PersonaRegistry::built_in().summaries()).unwrap();
        assert!(json[0].get("systemPrompt").is_none());
        assert_eq!(json[0]["id"], "plato");
    }
}
