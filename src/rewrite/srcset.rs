/// Rewrites the URL of every candidate in a `srcset` value, copying separators and
/// descriptors (`1x`, `480w`) through byte-for-byte.
pub(super) fn rewrite_srcset(srcset: &str, rewrite: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(srcset.len());
    let mut rest = srcset;

    while !rest.is_empty() {
        let separator = rest
            .find(|c: char| !(c.is_whitespace() || c == ','))
            .unwrap_or(rest.len());
        out.push_str(&rest[..separator]);
        rest = &rest[separator..];
        if rest.is_empty() {
            break;
        }

        let token_len = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_len];
        // A comma glued to the URL ends the candidate; it is not part of the URL.
        let url = token.trim_end_matches(',');
        let glued = &token[url.len()..];
        match rewrite(url) {
            Some(rewritten) => out.push_str(&rewritten),
            None => out.push_str(url),
        }
        out.push_str(glued);
        rest = &rest[token_len..];
        if !glued.is_empty() {
            continue;
        }

        let descriptor = descriptor_len(rest);
        out.push_str(&rest[..descriptor]);
        rest = &rest[descriptor..];
    }

    out
}

/// Length of the descriptor run: up to the next comma outside parentheses.
fn descriptor_len(s: &str) -> usize {
    let mut depth = 0usize;
    for (idx, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return idx,
            _ => {}
        }
    }
    s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper(value: &str) -> Option<String> {
        Some(format!("<{}>", value.to_uppercase()))
    }

    #[test]
    fn rewrites_only_url_tokens() {
        assert_eq!(
            rewrite_srcset("a.png 1x, b.png 2x", &upper),
            "<A.PNG> 1x, <B.PNG> 2x"
        );
    }

    #[test]
    fn preserves_irregular_spacing() {
        assert_eq!(
            rewrite_srcset("  a.png   480w ,\n\tb.png 800w  ", &upper),
            "  <A.PNG>   480w ,\n\t<B.PNG> 800w  "
        );
    }

    #[test]
    fn handles_candidates_without_descriptors() {
        assert_eq!(rewrite_srcset("a.png, b.png 2x", &upper), "<A.PNG>, <B.PNG> 2x");
        assert_eq!(rewrite_srcset("solo.png", &upper), "<SOLO.PNG>");
    }

    #[test]
    fn keeps_commas_inside_data_urls() {
        let keep = |value: &str| {
            (!value.starts_with("data:")).then(|| format!("<{value}>"))
        };
        assert_eq!(
            rewrite_srcset("data:image/png;base64,AAAA 1x, b.png 2x", &keep),
            "data:image/png;base64,AAAA 1x, <b.png> 2x"
        );
    }

    #[test]
    fn leaves_unrewritable_candidates_in_place() {
        let never = |_: &str| None;
        let input = "a.png 1x, b.png 2x";
        assert_eq!(rewrite_srcset(input, &never), input);
    }
}
