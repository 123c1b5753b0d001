use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

// Header line such as "Sender (untrusted metadata):" followed by a fenced block.
static METADATA_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:Conversation info|Sender|Thread starter)[^\n]*\(untrusted[^)\n]*\)[ \t]*:[ \t]*\r?\n[ \t]*```[^\n]*\n(?s:.*?)\n[ \t]*```[ \t]*\r?\n?",
    )
    .unwrap()
});

static LEADING_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[[^\]\n]*\d{1,2}:\d{2}[^\]\n]*\][ \t]*").unwrap());

/// Removes transport-injected metadata so it is never shown as conversation
/// content. Text without any recognised marker is returned untouched.
pub fn strip_untrusted_metadata(text: &str) -> Cow<'_, str> {
    let without_blocks = METADATA_BLOCK.replace_all(text, "");
    let stripped_blocks = matches!(without_blocks, Cow::Owned(_));
    let body: &str = if stripped_blocks {
        without_blocks.trim_start()
    } else {
        &without_blocks
    };
    match LEADING_TIMESTAMP.replace(body, "") {
        Cow::Owned(s) => Cow::Owned(s.trim_end().to_string()),
        Cow::Borrowed(_) if stripped_blocks => Cow::Owned(body.trim_end().to_string()),
        Cow::Borrowed(_) => Cow::Borrowed(text),
    }
}

/// Flattens a string or a sequence of typed parts into plain text. Only parts
/// carrying a `text` field contribute; empty fragments are skipped.
pub fn extract_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    if let Some(s) = content.as_str() {
        return strip_untrusted_metadata(s).into_owned();
    }
    let mut out = String::new();
    if let Some(arr) = content.as_array() {
        for item in arr {
            if let Some(s) = item.get("text").and_then(Value::as_str)
                && !s.is_empty()
            {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(s);
            }
        }
    }
    strip_untrusted_metadata(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_string() {
        let val = Value::String("hello".to_string());
        assert_eq!(extract_text(Some(&val)), "hello");
    }

    #[test]
    fn extract_text_array_joins_with_newline() {
        let val = serde_json::json!([
            {"type": "text", "text": "first"},
            {"type": "image", "source": {}},
            {"type": "text", "text": "second"}
        ]);
        assert_eq!(extract_text(Some(&val)), "first\nsecond");
    }

    #[test]
    fn extract_text_none_and_other_shapes() {
        assert_eq!(extract_text(None), "");
        assert_eq!(extract_text(Some(&serde_json::json!({"text": "x"}))), "");
        assert_eq!(extract_text(Some(&serde_json::json!(42))), "");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(
            strip_untrusted_metadata("just text"),
            Cow::Borrowed("just text")
        ));
    }

    #[test]
    fn strips_leading_timestamp_once() {
        let text = "[Mon 2025-01-15 10:30 UTC] hello [10:31] again";
        assert_eq!(strip_untrusted_metadata(text), "hello [10:31] again");
    }

    #[test]
    fn bracket_without_time_is_kept() {
        assert_eq!(strip_untrusted_metadata("[draft] hello"), "[draft] hello");
    }

    #[test]
    fn strips_metadata_blocks() {
        let text = "Conversation info (untrusted metadata):\n```json\n{\"chat\": \"x\"}\n```\n\nSender (untrusted metadata):\n```json\n{\"name\": \"bob\"}\n```\n[Tue 2025-01-14 09:00 GMT+8] what is the weather";
        assert_eq!(strip_untrusted_metadata(text), "what is the weather");
    }

    #[test]
    fn thread_starter_block_stripped() {
        let text = "Thread starter (untrusted, for context):\n```\nhi all\n```\nreply body";
        assert_eq!(strip_untrusted_metadata(text), "reply body");
    }

    #[test]
    fn sender_prose_without_marker_is_kept() {
        let text = "Sender: alice\n```\ncode\n```";
        assert_eq!(strip_untrusted_metadata(text), text);
    }
}
