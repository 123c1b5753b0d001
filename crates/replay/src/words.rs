//! Segmentation of mixed CJK/latin text into reveal units.

/// Each ideograph in this range is a unit of its own.
pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

pub fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '。' | '，' | '；' | '！' | '？' | '、' | '：' | '“' | '”' | '‘' | '’' | '《' | '》'
                | '【' | '】' | '（' | '）' | '—' | '…'
        )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Only whitespace so far; the next visible char joins this unit.
    Lead,
    Word,
    /// Complete unit that still takes trailing punctuation.
    Closed,
    /// Complete unit that already took trailing whitespace.
    Trailing,
}

/// Byte offsets at which each unit ends. Units are contiguous and cover the
/// whole text, so any prefix of them is a prefix of `text`.
pub fn word_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut mode: Option<Mode> = None;
    for (i, c) in text.char_indices() {
        let next = i + c.len_utf8();
        if c == '\n' {
            if mode.is_some() {
                ends.push(i);
            }
            ends.push(next);
            mode = None;
            continue;
        }
        mode = Some(match (mode, c) {
            (None | Some(Mode::Lead), c) if c.is_whitespace() => Mode::Lead,
            (Some(_), c) if c.is_whitespace() => Mode::Trailing,
            (Some(Mode::Lead), c) if is_cjk(c) || is_punctuation(c) => Mode::Closed,
            (Some(Mode::Word | Mode::Closed), c) if is_punctuation(c) => Mode::Closed,
            (Some(Mode::Lead | Mode::Word), _) if !is_cjk(c) => Mode::Word,
            (current, c) => {
                if current.is_some() {
                    ends.push(i);
                }
                if is_cjk(c) || is_punctuation(c) {
                    Mode::Closed
                } else {
                    Mode::Word
                }
            }
        });
    }
    if mode.is_some() {
        ends.push(text.len());
    }
    ends
}

pub fn split_words(text: &str) -> Vec<&str> {
    let mut start = 0;
    word_ends(text)
        .into_iter()
        .map(|end| {
            let word = &text[start..end];
            start = end;
            word
        })
        .collect()
}
