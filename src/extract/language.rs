//! Article language: declared markup first, then headers and hints, then a guess.

const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("ar", "Arabic"),
    ("de", "German"),
    ("en", "English"),
    ("es", "Spanish"),
    ("fa", "Persian"),
    ("fr", "French"),
    ("he", "Hebrew"),
    ("hi", "Hindi"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("nl", "Dutch"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("sv", "Swedish"),
    ("tr", "Turkish"),
    ("uk", "Ukrainian"),
    ("zh", "Chinese"),
];

const STOPWORDS: &[(&str, &[&str])] = &[
    ("English", &["the", "and", "of", "to", "is", "in", "that", "with", "for", "was"]),
    ("French", &["le", "la", "les", "et", "des", "est", "une", "dans", "que", "pour"]),
    ("German", &["der", "die", "und", "das", "ist", "nicht", "mit", "den", "ein", "auf"]),
    ("Spanish", &["el", "los", "las", "y", "es", "una", "por", "con", "para", "del"]),
];

const SAMPLE_CHARS: usize = 4000;
const MIN_STOPWORD_HITS: usize = 3;

/// Display name for a language tag such as `en`, `en-GB`, `fr_FR` or `English`.
pub fn normalize_language(tag: &str) -> Option<String> {
    let tag = tag.split(',').next()?.trim();
    if tag.is_empty() {
        return None;
    }
    if let Some((_, name)) = LANGUAGE_NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(tag)) {
        return Some(name.to_string());
    }
    let primary = tag.split(['-', '_']).next()?.to_ascii_lowercase();
    if let Some((_, name)) = LANGUAGE_NAMES.iter().find(|(code, _)| *code == primary) {
        return Some(name.to_string());
    }
    // unknown but well-formed codes pass through
    ((2..=3).contains(&primary.len()) && primary.chars().all(|c| c.is_ascii_alphabetic()))
        .then_some(primary)
}

/// Best language for an article, or empty when nothing is known.
pub fn detect_language(
    declared: Option<&str>,
    content_language: Option<&str>,
    hint: Option<&str>,
    body: &str,
) -> String {
    [declared, content_language, hint]
        .into_iter()
        .flatten()
        .find_map(normalize_language)
        .or_else(|| guess_language(body).map(str::to_string))
        .unwrap_or_default()
}

/// Script ranges first, then Latin stopword counts.
pub fn guess_language(text: &str) -> Option<&'static str> {
    let sample: String = text.chars().take(SAMPLE_CHARS).collect();

    let (mut letters, mut arabic, mut cyrillic, mut han, mut kana, mut hangul) = (0, 0, 0, 0, 0, 0);
    for c in sample.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        match c as u32 {
            0x0600..=0x06FF => arabic += 1,
            0x0400..=0x04FF => cyrillic += 1,
            0x3040..=0x30FF => kana += 1,
            0x4E00..=0x9FFF => han += 1,
            0xAC00..=0xD7AF => hangul += 1,
            _ => {}
        }
    }
    if letters == 0 {
        return None;
    }
    let share = |n: usize| n as f64 / letters as f64 > 0.3;
    if share(arabic) {
        return Some("Arabic");
    }
    if share(cyrillic) {
        return Some("Russian");
    }
    if kana > 0 && share(kana + han) {
        return Some("Japanese");
    }
    if share(han) {
        return Some("Chinese");
    }
    if share(hangul) {
        return Some("Korean");
    }

    let words: Vec<String> = sample
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let mut best: Option<(&'static str, usize)> = None;
    for &(name, stops) in STOPWORDS {
        let hits = words.iter().filter(|w| stops.contains(&w.as_str())).count();
        if hits >= MIN_STOPWORD_HITS && best.map_or(true, |(_, top)| hits > top) {
            best = Some((name, hits));
        }
    }
    best.map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_codes_to_names() {
        assert_eq!(normalize_language("en").as_deref(), Some("English"));
        assert_eq!(normalize_language("en-GB").as_deref(), Some("English"));
        assert_eq!(normalize_language("fr_FR").as_deref(), Some("French"));
        assert_eq!(normalize_language("english").as_deref(), Some("English"));
        assert_eq!(normalize_language("de-DE, en;q=0.5").as_deref(), Some("German"));
        assert_eq!(normalize_language("sw").as_deref(), Some("sw"));
        assert_eq!(normalize_language("  "), None);
        assert_eq!(normalize_language("x-klingon-dialect"), None);
    }

    #[test]
    fn precedence_declared_header_hint_guess() {
        let body = "the cat and the dog of the house";
        assert_eq!(detect_language(Some("fr"), Some("de"), Some("es"), body), "French");
        assert_eq!(detect_language(None, Some("de"), Some("es"), body), "German");
        assert_eq!(detect_language(None, None, Some("Spanish"), body), "Spanish");
        assert_eq!(detect_language(None, None, None, body), "English");
        assert_eq!(detect_language(None, None, None, "12345"), "");
    }

    #[test]
    fn guesses_by_script() {
        assert_eq!(guess_language("Привет, как дела сегодня"), Some("Russian"));
        assert_eq!(guess_language("مرحبا بكم في الموقع"), Some("Arabic"));
        assert_eq!(guess_language("今天天气很好我们去公园"), Some("Chinese"));
        assert_eq!(guess_language("今日はとても良い天気です"), Some("Japanese"));
    }

    #[test]
    fn guesses_latin_by_stopwords() {
        assert_eq!(
            guess_language("Le conseil a voté pour les travaux et la mairie est dans une position difficile"),
            Some("French")
        );
        assert_eq!(
            guess_language("Der Rat hat die Pläne und das Budget mit den Bürgern auf der Sitzung besprochen"),
            Some("German")
        );
        assert_eq!(guess_language("Lorem ipsum dolor"), None);
    }
}
