use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::css::replace_captured;

// Only literal string assignments; anything computed at runtime is out of reach.
static LOCATION_HREF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)location\.href\s*=\s*(?:"([^"]+)"|'([^']+)')"#)
        .expect("location.href pattern is valid")
});

pub(super) fn rewrite_script<'t>(
    script: &'t str,
    rewrite: &dyn Fn(&str) -> Option<String>,
) -> Cow<'t, str> {
    replace_captured(&LOCATION_HREF_REGEX, script, rewrite)
}
