use once_cell::sync::Lazy;
use regex::Regex;

static MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*#_`]").unwrap());

static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());

// Private use area, the 1F000-1F7FF pictograph planes, block elements through
// dingbats, supplemental symbols, plus the joiners that glue emoji sequences.
static PICTOGRAPHS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\x{E000}-\x{F8FF}\x{1F000}-\x{1F7FF}\x{2580}-\x{27BF}\x{1F910}-\x{1F9FF}\x{FE0F}\x{200D}]"
    ).unwrap()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Turns a chat reply into something a voice can read: markdown emphasis
/// and heading marks go, links keep only their label, emoji are dropped and
/// whitespace collapses to single spaces.
pub fn clean_text_for_tts(text: &str) -> String {
    let clean = MARKUP.replace_all(text, "");
    let clean = LINK.replace_all(&clean, "$1");
    let clean = PICTOGRAPHS.replace_all(&clean, "");
    let clean = WHITESPACE.replace_all(&clean, " ");
    clean.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_links_and_emoji() {
        assert_eq!(clean_text_for_tts("**Ciao** [qui](http://x) 😀  mondo"), "Ciao qui mondo");
    }

    #[test]
    fn headings_and_code_marks_are_removed() {
        assert_eq!(clean_text_for_tts("## Indirizzi\n`AFM` e _CAT_"), "Indirizzi AFM e CAT");
    }

    #[test]
    fn dingbats_and_variation_selectors_are_removed() {
        assert_eq!(clean_text_for_tts("Benvenuto ✨ ❤️ a scuola 🏫📚"), "Benvenuto a scuola");
    }

    #[test]
    fn accented_letters_survive() {
        assert_eq!(clean_text_for_tts("Perché è così?"), "Perché è così?");
    }

    #[test]
    fn whitespace_only_input_becomes_empty() {
        assert_eq!(clean_text_for_tts("  \n\t 👋 "), "");
    }

    #[test]
    fn is_deterministic() {
        let input = "*Erba* [sito](https://example.org/a_b) 🎓";
        assert_eq!(clean_text_for_tts(input), clean_text_for_tts(input));
        assert_eq!(clean_text_for_tts(input), "Erba sito");
    }
}
