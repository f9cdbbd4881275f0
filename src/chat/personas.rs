//! Persona list and the active persona.

use crate::chat::core::ids::PersonaId;
use crate::chat::core::types::Persona;

/// Personas available before any user edits.
#[must_use]
pub fn default_personas() -> Vec<Persona> {
    vec![
        Persona {
            id: PersonaId::from_raw("drafter"),
            name: "Formal Drafter".to_string(),
            instruction_text: "You are a professional assistant helping users draft formal \
                documents, letters, and other official communications. Your tone should be \
                formal, clear, and concise."
                .to_string(),
            input_hint: "Ask me to draft a letter, email, or official document...".to_string(),
        },
        Persona {
            id: PersonaId::from_raw("chat_agent"),
            name: "Friendly Chat Agent".to_string(),
            instruction_text: "You are a friendly and helpful chat agent. Your tone is \
                conversational and supportive. Use emojis where appropriate. only give short \
                answers in two or three nessesory sentences"
                .to_string(),
            input_hint: "Ask me anything...".to_string(),
        },
    ]
}

/// Ordered persona list with exactly one active entry.
///
/// Never empty: replacing the list with nothing restores the defaults.
#[derive(Clone, Debug)]
pub struct PersonaBook {
    personas: Vec<Persona>,
    active: usize,
}

impl Default for PersonaBook {
    fn default() -> Self {
        Self::new(default_personas())
    }
}

impl PersonaBook {
    /// Build a book from a loaded list. The first persona is active.
    #[must_use]
    pub fn new(personas: Vec<Persona>) -> Self {
        let personas = if personas.is_empty() {
            default_personas()
        } else {
            personas
        };
        Self {
            personas,
            active: 0,
        }
    }

    /// Every persona, in display order.
    #[must_use]
    pub fn list(&self) -> &[Persona] {
        &self.personas
    }

    /// The active persona.
    #[must_use]
    pub fn active(&self) -> &Persona {
        &self.personas[self.active]
    }

    /// Activate `id`; unknown ids fall back to the first persona.
    pub fn select(&mut self, id: &PersonaId) -> &Persona {
        self.active = self.position(id).unwrap_or(0);
        self.active()
    }

    /// Replace the whole list.
    ///
    /// The active persona stays active, with its edits, if its id survives.
    /// Otherwise the first persona becomes active.
    pub fn replace_all(&mut self, personas: Vec<Persona>) -> &Persona {
        let previous = self.active().id.clone();
        self.personas = if personas.is_empty() {
            default_personas()
        } else {
            personas
        };
        self.active = self.position(&previous).unwrap_or(0);
        self.active()
    }

    fn position(&self, id: &PersonaId) -> Option<usize> {
        self.personas.iter().position(|p| &p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(id: &str, instruction: &str) -> Persona {
        Persona {
            id: PersonaId::from_raw(id),
            name: id.to_uppercase(),
            instruction_text: instruction.to_string(),
            input_hint: String::new(),
        }
    }

    #[test]
    fn test_defaults() {
        let book = PersonaBook::default();
        assert_eq!(book.list().len(), 2);
        assert_eq!(book.active().name, "Formal Drafter");
        assert!(book.active().instruction_text.ends_with("formal, clear, and concise."));
        assert_eq!(book.list()[1].input_hint, "Ask me anything...");
    }

    #[test]
    fn test_select_unknown_falls_back_to_first() {
        let mut book = PersonaBook::default();
        assert_eq!(book.select(&PersonaId::from_raw("chat_agent")).name, "Friendly Chat Agent");
        assert_eq!(book.select(&PersonaId::from_raw("nope")).name, "Formal Drafter");
    }

    #[test]
    fn test_replace_keeps_edited_active_persona() {
        let mut book = PersonaBook::new(vec![persona("a", "one"), persona("b", "two")]);
        book.select(&PersonaId::from_raw("b"));

        let active = book.replace_all(vec![persona("a", "one"), persona("b", "two, edited")]);
        assert_eq!(active.id.as_str(), "b");
        assert_eq!(active.instruction_text, "two, edited");
    }

    #[test]
    fn test_replace_removing_active_selects_first() {
        let mut book = PersonaBook::new(vec![persona("a", "one"), persona("b", "two")]);
        book.select(&PersonaId::from_raw("b"));

        assert_eq!(book.replace_all(vec![persona("c", "three")]).id.as_str(), "c");
        assert_eq!(book.replace_all(Vec::new()).id.as_str(), "drafter");
    }
}
