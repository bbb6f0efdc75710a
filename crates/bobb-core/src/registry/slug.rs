//! Agent id derivation and token shape validation

pub const MAX_SLUG_LEN: usize = 50;
const FALLBACK_SLUG: &str = "agent";

/// Lowercase `name`, collapse every run of non-alphanumeric characters into a
/// single `-`, trim leading/trailing `-` and cap at [`MAX_SLUG_LEN`].
/// Empty results fall back to `agent`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

/// Derive a slug from `name` that `taken` does not reject, appending `-2`,
/// `-3`, ... on collision. The suffix never pushes the id past the cap.
pub fn unique_slug(name: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = slugify(name);
    if !taken(&base) {
        return base;
    }

    let mut counter = 2u32;
    loop {
        let suffix = format!("-{}", counter);
        let keep = MAX_SLUG_LEN.saturating_sub(suffix.len()).min(base.len());
        let candidate = format!("{}{}", base[..keep].trim_end_matches('-'), suffix);
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Platform bot tokens are three non-empty segments separated by dots
pub fn is_token_shaped(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_SLUG_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !id.starts_with('-')
            && !id.ends_with('-')
    }

    proptest! {
        /// Any name yields a non-empty, capped id over the slug charset
        #[test]
        fn prop_slugify_stays_in_charset(name in any::<String>()) {
            let slug = slugify(&name);
            prop_assert!(is_valid_id(&slug), "bad slug {:?} from {:?}", slug, name);
            prop_assert!(!slug.contains("--"));
        }

        /// Slugs are stable under re-slugging
        #[test]
        fn prop_slugify_is_idempotent(name in "\\PC{0,120}") {
            let slug = slugify(&name);
            prop_assert_eq!(slugify(&slug), slug);
        }

        /// The derived id never collides with ids already taken
        #[test]
        fn prop_unique_slug_avoids_taken(
            name in "\\PC{0,80}",
            others in prop::collection::vec("\\PC{0,80}", 0..8),
            suffixes in 0u32..12,
        ) {
            let base = slugify(&name);
            let mut taken: HashSet<String> = others.iter().map(|o| slugify(o)).collect();
            taken.insert(base.clone());
            for _ in 0..suffixes {
                let next = unique_slug(&name, |c| taken.contains(c));
                taken.insert(next);
            }

            let id = unique_slug(&name, |c| taken.contains(c));
            prop_assert!(!taken.contains(&id), "{:?} already taken", id);
            prop_assert!(is_valid_id(&id), "bad id {:?}", id);
        }

        /// Registering names one after another always yields distinct ids
        #[test]
        fn prop_sequential_registrations_are_distinct(
            names in prop::collection::vec(any::<String>(), 1..20),
        ) {
            let mut ids = HashSet::new();
            for name in &names {
                let id = unique_slug(name, |c| ids.contains(c));
                prop_assert!(is_valid_id(&id));
                prop_assert!(ids.insert(id));
            }
        }
    }

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("Chef Bot"), "chef-bot");
        assert_eq!(slugify("  Weather -- Bot!! "), "weather-bot");
        assert_eq!(slugify("R2D2"), "r2d2");
    }

    #[test]
    fn test_slugify_fallback() {
        assert_eq!(slugify(""), "agent");
        assert_eq!(slugify("!!!"), "agent");
        assert_eq!(slugify("日本"), "agent");
    }

    #[test]
    fn test_slugify_caps_length() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long).len(), MAX_SLUG_LEN);

        // truncation landing right after a separator must not leave a trailing dash
        let name = format!("{} b", "a".repeat(49));
        let slug = slugify(&name);
        assert_eq!(slug, "a".repeat(49));
    }

    #[test]
    fn test_unique_slug_respects_cap() {
        let long = "x".repeat(60);
        let base = slugify(&long);
        let id = unique_slug(&long, |c| c == base);
        assert_eq!(id.len(), MAX_SLUG_LEN);
        assert!(id.ends_with("-2"));
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_unique_slug_counts_up() {
        let taken = ["bot", "bot-2"];
        assert_eq!(unique_slug("Bot", |c| taken.contains(&c)), "bot-3");
    }

    #[test]
    fn test_token_shape() {
        assert!(is_token_shaped("a.b.c"));
        assert!(is_token_shaped("MTA2.GxYz.abc-def_123"));
        assert!(!is_token_shaped("a.b"));
        assert!(!is_token_shaped("a..c"));
        assert!(!is_token_shaped("a.b.c.d"));
        assert!(!is_token_shaped(""));
    }
}
