//! Personas: behavioral profiles that color how the agent reads a page.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub const DEFAULT_PERSONA: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub description: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Built-in personas followed by any configured ones. A configured persona
/// with a built-in name replaces the built-in.
#[derive(Debug, Clone)]
pub struct PersonaCatalog {
    personas: Vec<Persona>,
}

impl PersonaCatalog {
    pub fn new(extra: &[Persona]) -> Self {
        let mut personas = builtin();
        for persona in extra {
            match personas.iter_mut().find(|p| p.name == persona.name) {
                Some(existing) => *existing = persona.clone(),
                None => personas.push(persona.clone()),
            }
        }
        Self { personas }
    }

    /// Resolve a selector; `None` or a blank selector means the default persona.
    pub fn resolve(&self, selector: Option<&str>) -> Result<Persona> {
        let name = selector
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PERSONA);
        self.personas
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| {
                AgentError::InvalidRequest(format!(
                    "unknown persona '{}'; known: {}",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    pub fn all(&self) -> &[Persona] {
        &self.personas
    }

    pub fn names(&self) -> Vec<&str> {
        self.personas.iter().map(|p| p.name.as_str()).collect()
    }
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        Self::new(&[])
    }
}

fn builtin() -> Vec<Persona> {
    vec![
        Persona::new(
            DEFAULT_PERSONA,
            "An average online shopper who knows roughly what they want and \
             takes the most obvious path to it.",
        ),
        Persona::new(
            "bargain-hunter",
            "A price-conscious shopper who notices discounts, compares prices \
             and distrusts anything that looks expensive.",
        ),
        Persona::new(
            "impatient",
            "A hurried shopper on a phone break who skims, clicks the first \
             plausible thing and gives up on slow or cluttered pages.",
        ),
        Persona::new(
            "thorough",
            "A careful shopper who reads product details, sizes and reviews \
             before committing to anything.",
        ),
        Persona::new(
            "senior",
            "An older shopper with little online experience who is easily \
             confused by pop-ups, small text and unlabeled icons.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_selector_resolves_default() {
        let catalog = PersonaCatalog::default();
        assert_eq!(catalog.resolve(None).unwrap().name, DEFAULT_PERSONA);
        assert_eq!(catalog.resolve(Some("  ")).unwrap().name, DEFAULT_PERSONA);
    }

    #[test]
    fn selector_is_case_insensitive() {
        let catalog = PersonaCatalog::default();
        assert_eq!(
            catalog.resolve(Some("Bargain-Hunter")).unwrap().name,
            "bargain-hunter"
        );
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let catalog = PersonaCatalog::default();
        let err = catalog.resolve(Some("pirate")).unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }

    #[test]
    fn configured_persona_overrides_builtin() {
        let catalog = PersonaCatalog::new(&[
            Persona::new("impatient", "Custom impatient."),
            Persona::new("collector", "Rare editions only."),
        ]);
        assert_eq!(
            catalog.resolve(Some("impatient")).unwrap().description,
            "Custom impatient."
        );
        assert!(catalog.names().contains(&"collector"));
    }
}
