// Input rules shared by the server and clients.

use thiserror::Error;

pub const MAX_CHAT_MESSAGE_CHARS: usize = 500;
pub const MAX_TITLE_CHARS: usize = 120;
pub const MAX_CATEGORY_CHARS: usize = 48;
pub const DEFAULT_CATEGORY: &str = "General";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("stream title is required")]
    TitleRequired,
    #[error("stream title exceeds {max} characters")]
    TitleTooLong { max: usize },
    #[error("stream category exceeds {max} characters")]
    CategoryTooLong { max: usize },
    #[error("chat message is empty")]
    EmptyMessage,
    #[error("chat message exceeds {max} characters")]
    MessageTooLong { max: usize },
}

/// Trim a stream title and enforce its length.
pub fn normalize_title(raw: &str) -> Result<String, ValidationError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ValidationError::TitleRequired);
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ValidationError::TitleTooLong { max: MAX_TITLE_CHARS });
    }
    Ok(title.to_string())
}

/// Trim a category; blank or absent falls back to [`DEFAULT_CATEGORY`].
pub fn normalize_category(raw: Option<&str>) -> Result<String, ValidationError> {
    let category = raw.map(str::trim).unwrap_or_default();
    if category.is_empty() {
        return Ok(DEFAULT_CATEGORY.to_string());
    }
    if category.chars().count() > MAX_CATEGORY_CHARS {
        return Err(ValidationError::CategoryTooLong { max: MAX_CATEGORY_CHARS });
    }
    Ok(category.to_string())
}

/// Trim chat text. Length is counted in characters, after trimming.
pub fn normalize_chat_message(raw: &str) -> Result<String, ValidationError> {
    let message = raw.trim();
    if message.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    if message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return Err(ValidationError::MessageTooLong { max: MAX_CHAT_MESSAGE_CHARS });
    }
    Ok(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed() {
        assert_eq!(normalize_title("  Demo  ").as_deref(), Ok("Demo"));
    }

    #[test]
    fn blank_title_is_rejected() {
        assert_eq!(normalize_title("   "), Err(ValidationError::TitleRequired));
    }

    #[test]
    fn overlong_title_is_rejected() {
        let title = "t".repeat(MAX_TITLE_CHARS + 1);
        assert_eq!(
            normalize_title(&title),
            Err(ValidationError::TitleTooLong { max: MAX_TITLE_CHARS })
        );
    }

    #[test]
    fn missing_or_blank_category_defaults_to_general() {
        assert_eq!(normalize_category(None).as_deref(), Ok(DEFAULT_CATEGORY));
        assert_eq!(normalize_category(Some("  ")).as_deref(), Ok(DEFAULT_CATEGORY));
        assert_eq!(normalize_category(Some(" Music ")).as_deref(), Ok("Music"));
    }

    #[test]
    fn chat_message_limit_counts_characters_not_bytes() {
        let at_limit = "é".repeat(MAX_CHAT_MESSAGE_CHARS);
        assert!(normalize_chat_message(&at_limit).is_ok());

        let over = "é".repeat(MAX_CHAT_MESSAGE_CHARS + 1);
        assert_eq!(
            normalize_chat_message(&over),
            Err(ValidationError::MessageTooLong { max: MAX_CHAT_MESSAGE_CHARS })
        );
    }

    #[test]
    fn chat_message_surrounding_whitespace_does_not_count() {
        let padded = format!("  {}  ", "a".repeat(MAX_CHAT_MESSAGE_CHARS));
        assert_eq!(normalize_chat_message(&padded).map(|m| m.len()), Ok(MAX_CHAT_MESSAGE_CHARS));
    }

    #[test]
    fn whitespace_only_chat_message_is_rejected() {
        assert_eq!(normalize_chat_message(" \n\t "), Err(ValidationError::EmptyMessage));
    }
}
