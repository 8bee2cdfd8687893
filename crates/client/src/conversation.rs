//! Prompt assembly for multi-turn chats
//!
//! Uses the two-role `USER:`/`ASSISTANT:` layout. A worker's conversation
//! template is opaque to the protocol; only its system message is picked up.

const DEFAULT_SYSTEM: &str = "A chat between a curious user and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the user's questions.";

const USER_ROLE: &str = "USER";
const ASSISTANT_ROLE: &str = "ASSISTANT";
const SEP: &str = " ";
const SEP2: &str = "</s>";

#[derive(Debug, Clone)]
pub struct Conversation {
    system: String,
    /// Completed (user, assistant) exchanges
    turns: Vec<(String, String)>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM)
    }
}

impl Conversation {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            turns: Vec::new(),
        }
    }

    /// Build from a worker's template, falling back to the default system message
    pub fn from_template(template: &serde_json::Value) -> Self {
        let system = ["system_message", "system"]
            .iter()
            .find_map(|key| template.get(*key).and_then(|v| v.as_str()))
            .unwrap_or(DEFAULT_SYSTEM);
        Self::new(system)
    }

    /// Prompt for the next reply to `message`
    pub fn prompt_for(&self, message: &str) -> String {
        let mut prompt = String::new();
        if !self.system.is_empty() {
            prompt.push_str(&self.system);
            prompt.push_str(SEP);
        }
        for (user, assistant) in &self.turns {
            prompt.push_str(&format!("{USER_ROLE}: {user}{SEP}{ASSISTANT_ROLE}: {assistant}{SEP2}"));
        }
        prompt.push_str(&format!("{USER_ROLE}: {message}{SEP}{ASSISTANT_ROLE}:"));
        prompt
    }

    /// Stop strings that end an assistant reply
    pub fn stop_strings(&self) -> Vec<String> {
        vec![SEP2.to_string(), format!("{USER_ROLE}:")]
    }

    pub fn push_turn(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.turns.push((user.into(), assistant.into()));
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_layout() {
        let mut conv = Conversation::new("SYS");
        assert_eq!(conv.prompt_for("hi"), "SYS USER: hi ASSISTANT:");

        conv.push_turn("hi", "hello");
        assert_eq!(
            conv.prompt_for("how are you?"),
            "SYS USER: hi ASSISTANT: hello</s>USER: how are you? ASSISTANT:"
        );
    }

    #[test]
    fn test_template_system_message() {
        let conv = Conversation::from_template(&json!({"name": "x", "system_message": "Be brief."}));
        assert_eq!(conv.prompt_for("q"), "Be brief. USER: q ASSISTANT:");

        let conv = Conversation::from_template(&serde_json::Value::Null);
        assert!(conv.prompt_for("q").starts_with("A chat between"));
    }

    #[test]
    fn test_empty_system_and_clear() {
        let mut conv = Conversation::new("");
        conv.push_turn("a", "b");
        conv.clear();

        assert_eq!(conv.turns(), 0);
        assert_eq!(conv.prompt_for("q"), "USER: q ASSISTANT:");
    }
}
