//! Link rewriting for proxied documents.
//!
//! Every reference found in HTML or CSS is resolved against the document base and re-encoded
//! as `<proxy-base>?url=<percent-encoded absolute url>`. References that cannot or should not
//! be proxied (anchors, `javascript:`, `data:`, unparsable values, links already pointing at
//! the proxy) are left exactly as written.

mod css;
mod html;
mod script;
mod srcset;

use std::borrow::Cow;

use tracing::trace;
use url::Url;

use crate::classify::DocumentKind;

/// Schemes that name something local to the page rather than a fetchable resource.
const LOCAL_PREFIXES: &[&str] = &["#", "javascript:", "data:"];

/// Which reference sites are rewritten, plus the cosmetic toggles.
#[derive(Clone, Debug)]
pub struct RewriteOptions {
    /// Attributes holding a single URL.
    pub url_attributes: Vec<String>,
    /// Attributes holding a comma-separated candidate list.
    pub srcset_attributes: Vec<String>,
    /// Rewrite `url(...)`/`@import` in stylesheets, `<style>` and `style=""`.
    pub rewrite_css: bool,
    /// Rewrite `location.href = '...'` assignments in inline scripts.
    pub rewrite_scripts: bool,
    /// Append a small notice before `</body>`.
    pub inject_banner: bool,
    /// Prepend a script to `<head>` that pins `window.top` and `window.parent` to the page.
    pub neutralize_frame_busting: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            url_attributes: ["href", "src", "action", "data-src"]
                .into_iter()
                .map(String::from)
                .collect(),
            srcset_attributes: vec!["srcset".to_string()],
            rewrite_css: true,
            rewrite_scripts: true,
            inject_banner: false,
            neutralize_frame_busting: true,
        }
    }
}

/// Rewrites references in one document fetched from `target` so they load through the proxy.
pub struct LinkRewriter<'a> {
    proxy_base: Url,
    target: Url,
    options: &'a RewriteOptions,
}

impl<'a> LinkRewriter<'a> {
    pub fn new(proxy_base: &Url, target: &Url, options: &'a RewriteOptions) -> Self {
        let mut proxy_base = proxy_base.clone();
        proxy_base.set_query(None);
        proxy_base.set_fragment(None);
        Self {
            proxy_base,
            target: target.clone(),
            options,
        }
    }

    pub fn proxy_base(&self) -> &Url {
        &self.proxy_base
    }

    /// The proxy form of an absolute target URL.
    pub fn proxy_url(&self, absolute: &Url) -> String {
        format!(
            "{}?url={}",
            self.proxy_base.as_str(),
            urlencoding::encode(absolute.as_str())
        )
    }

    /// Rewrites a single reference relative to the target URL.
    pub fn rewrite_reference<'v>(&self, value: &'v str) -> Cow<'v, str> {
        match self.proxify(value, &self.target) {
            Some(rewritten) => Cow::Owned(rewritten),
            None => Cow::Borrowed(value),
        }
    }

    pub fn rewrite_document(
        &self,
        kind: DocumentKind,
        text: &str,
    ) -> Result<String, lol_html::errors::RewritingError> {
        match kind {
            DocumentKind::Html => html::rewrite_html(self, text),
            DocumentKind::Css => Ok(self.rewrite_css(text)),
        }
    }

    pub fn rewrite_css(&self, css: &str) -> String {
        css::rewrite_css(css, &|value| self.proxify(value, &self.target)).into_owned()
    }

    /// `None` means "leave the reference as written".
    fn proxify(&self, value: &str, base: &Url) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() || is_local_reference(trimmed) {
            return None;
        }
        let resolved = match base.join(trimmed) {
            Ok(resolved) => resolved,
            Err(err) => {
                trace!(%err, reference = trimmed, "leaving unresolvable reference");
                return None;
            }
        };
        if !matches!(resolved.scheme(), "http" | "https") || self.is_proxied(&resolved) {
            return None;
        }
        Some(self.proxy_url(&resolved))
    }

    fn is_proxied(&self, url: &Url) -> bool {
        same_endpoint(url, &self.proxy_base)
            && url.path() == self.proxy_base.path()
            && url.query_pairs().any(|(key, _)| key == "url")
    }
}

fn is_local_reference(value: &str) -> bool {
    LOCAL_PREFIXES.iter().any(|prefix| {
        value
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// True when both URLs reach the same host and port, whatever the scheme.
pub(crate) fn same_endpoint(a: &Url, b: &Url) -> bool {
    match (a.host_str(), b.host_str()) {
        (Some(left), Some(right)) => {
            left.eq_ignore_ascii_case(right) && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}
