//! Classification of lines typed at the chat prompt.
//!
//! Lines starting with `/` may be local commands, which are handled by the
//! client and never sent as chat. Unknown slash words are ordinary chat text.

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    /// Nothing but whitespace; the prompt is shown again.
    Blank,
    GetUsers,
    Leave,
    Chat(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Input::Blank;
        }

        match trimmed.strip_prefix('/') {
            Some("getusers") => Input::GetUsers,
            Some("leave") => Input::Leave,
            _ => Input::Chat(trimmed.to_string()),
        }
    }
}
