use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static CSS_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^\s'"()]*))\s*\)"#)
        .expect("css url() pattern is valid")
});

static CSS_IMPORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("css @import pattern is valid")
});

/// Rewrites `url(...)` arguments and `@import "..."` strings in a stylesheet.
pub(super) fn rewrite_css<'t>(
    css: &'t str,
    rewrite: &dyn Fn(&str) -> Option<String>,
) -> Cow<'t, str> {
    match replace_captured(&CSS_URL_REGEX, css, rewrite) {
        Cow::Borrowed(unchanged) => replace_captured(&CSS_IMPORT_REGEX, unchanged, rewrite),
        Cow::Owned(rewritten) => {
            Cow::Owned(replace_captured(&CSS_IMPORT_REGEX, &rewritten, rewrite).into_owned())
        }
    }
}

/// Replaces the first participating capture group of every match with its rewritten value,
/// keeping the rest of the match (quotes, whitespace, function name) as written.
pub(super) fn replace_captured<'t>(
    regex: &Regex,
    text: &'t str,
    rewrite: &dyn Fn(&str) -> Option<String>,
) -> Cow<'t, str> {
    regex.replace_all(text, |caps: &Captures| {
        let whole = &caps[0];
        let offset = caps.get(0).map_or(0, |m| m.start());
        let Some(value) = caps.iter().skip(1).flatten().next() else {
            return whole.to_string();
        };
        match rewrite(value.as_str()) {
            Some(rewritten) => format!(
                "{}{}{}",
                &whole[..value.start() - offset],
                rewritten,
                &whole[value.end() - offset..]
            ),
            None => whole.to_string(),
        }
    })
}
