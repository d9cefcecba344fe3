use rand::{
    Rng,
    SeedableRng,
    rngs::StdRng,
};
use std::collections::HashMap;

pub const DEFAULT_LANGUAGE: &str = "en";

const EN_LUCKY_PHRASES: &[&str] = &[
    "Fortune favors the bold.",
    "Today the stars line up for you.",
    "One ticket is all it takes.",
    "Luck is on its way.",
    "Someone has to win. Why not you?",
];

// Only English ships with the terminal client.
fn phrases_for(_language: &str) -> &'static [&'static str] {
    EN_LUCKY_PHRASES
}

/// Preferences that last for this process only.
///
/// Each language gets one lucky phrase, picked at random the first time it is
/// asked for and kept until the process exits.
pub struct SessionPreferences {
    language: String,
    phrase_index: HashMap<String, usize>,
    rng: StdRng,
}

impl SessionPreferences {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng()).with_language(system_language())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            phrase_index: HashMap::new(),
            rng,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn lucky_phrase(&mut self) -> &'static str {
        let phrases = phrases_for(&self.language);
        let rng = &mut self.rng;
        let index = *self
            .phrase_index
            .entry(self.language.clone())
            .or_insert_with(|| rng.random_range(0..phrases.len()));
        phrases.get(index).copied().unwrap_or_default()
    }
}

/// `de_DE.UTF-8` becomes `de`.
fn system_language() -> String {
    std::env::var("LANG")
        .ok()
        .and_then(|lang| {
            lang.split(['_', '.', '-'])
                .next()
                .filter(|code| !code.is_empty() && *code != "C" && *code != "POSIX")
                .map(str::to_lowercase)
        })
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

impl Default for SessionPreferences {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lucky_phrase__is_stable_within_a_session() {
        let mut prefs = SessionPreferences::with_rng(StdRng::seed_from_u64(7));

        let first = prefs.lucky_phrase();
        let again = prefs.lucky_phrase();

        assert_eq!(first, again);
        assert!(EN_LUCKY_PHRASES.contains(&first));
    }

    #[test]
    fn lucky_phrase__is_remembered_per_language() {
        let mut prefs = SessionPreferences::with_rng(StdRng::seed_from_u64(1));
        let english = prefs.lucky_phrase();

        let mut prefs = prefs.with_language("de");
        let _ = prefs.lucky_phrase();
        let mut prefs = prefs.with_language(DEFAULT_LANGUAGE);

        assert_eq!(prefs.lucky_phrase(), english);
        assert_eq!(prefs.phrase_index.len(), 2);
    }

    proptest! {
        #[test]
        fn lucky_phrase__always_picks_a_known_phrase(seed in any::<u64>()) {
            let mut prefs = SessionPreferences::with_rng(StdRng::seed_from_u64(seed));

            prop_assert!(EN_LUCKY_PHRASES.contains(&prefs.lucky_phrase()));
        }
    }
}
