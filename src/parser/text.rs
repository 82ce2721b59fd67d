/// Collapse every whitespace run to one space and trim.
pub fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    let trimmed_len = buf.trim_end().len();
    buf.truncate(trimmed_len);
    buf
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Truncate to at most `max` chars without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
