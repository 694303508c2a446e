use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
};

use lol_html::{
    HtmlRewriter, Settings, element, end,
    errors::RewritingError,
    html_content::{ContentType, Element},
    text,
};
use url::Url;

use super::{LinkRewriter, css, script, srcset};

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const BANNER: &str = r#"<div data-frame-proxy-banner="true" style="position:fixed;bottom:0;left:0;right:0;background:#000;color:#0f0;font:12px monospace;z-index:999999;padding:2px 6px;opacity:0.7;">Proxied view: some sites may still refuse to render inside a frame (CSP, scripts).</div>"#;

const FRAME_GUARD: &str =
    "<script>window.top = window.self; window.parent = window.self;</script>";

const CSP_META_VALUES: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
];

pub(super) fn rewrite_html(
    rewriter: &LinkRewriter<'_>,
    html: &str,
) -> Result<String, RewritingError> {
    let options = rewriter.options;
    // `<base href>` moves the resolution base for everything after it.
    let base = RefCell::new(rewriter.target.clone());
    let saw_body = Cell::new(false);
    let style_text = RefCell::new(String::new());
    let script_text = RefCell::new(String::new());

    let mut element_content_handlers = vec![element!("*", |el| {
        rewrite_element(rewriter, &base, &saw_body, el)
    })];

    if options.neutralize_frame_busting {
        element_content_handlers.push(element!("head", |el| {
            el.prepend(FRAME_GUARD, ContentType::Html);
            Ok(())
        }));
    }

    if options.rewrite_css {
        element_content_handlers.push(text!("style", |chunk| {
            let mut buffer = style_text.borrow_mut();
            buffer.push_str(chunk.as_str());
            if chunk.last_in_text_node() {
                let current = base.borrow();
                let rewritten =
                    css::rewrite_css(&buffer, &|value| rewriter.proxify(value, &current))
                        .into_owned();
                chunk.replace(&rewritten, ContentType::Html);
                buffer.clear();
            } else {
                chunk.remove();
            }
            Ok(())
        }));
    }

    if options.rewrite_scripts {
        element_content_handlers.push(text!("script", |chunk| {
            let mut buffer = script_text.borrow_mut();
            buffer.push_str(chunk.as_str());
            if chunk.last_in_text_node() {
                let current = base.borrow();
                let rewritten =
                    script::rewrite_script(&buffer, &|value| rewriter.proxify(value, &current))
                        .into_owned();
                chunk.replace(&rewritten, ContentType::Html);
                buffer.clear();
            } else {
                chunk.remove();
            }
            Ok(())
        }));
    }

    let mut document_content_handlers = Vec::new();
    if options.inject_banner {
        document_content_handlers.push(end!(|end| {
            if !saw_body.get() {
                end.append(BANNER, ContentType::Html);
            }
            Ok(())
        }));
    }

    let mut output = Vec::with_capacity(html.len());
    let mut html_rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers,
            document_content_handlers,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );
    html_rewriter.write(html.as_bytes())?;
    html_rewriter.end()?;

    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn rewrite_element(
    rewriter: &LinkRewriter<'_>,
    base: &RefCell<Url>,
    saw_body: &Cell<bool>,
    el: &mut Element<'_, '_>,
) -> HandlerResult {
    let options = rewriter.options;
    let tag = el.tag_name();

    if tag.eq_ignore_ascii_case("base") {
        return rebase(base, el);
    }

    let current = base.borrow();
    let proxify = |value: &str| rewriter.proxify(&unescape_amp(value), &current);

    if tag.eq_ignore_ascii_case("meta")
        && let Some(equiv) = el.get_attribute("http-equiv")
    {
        if CSP_META_VALUES
            .iter()
            .any(|name| equiv.trim().eq_ignore_ascii_case(name))
        {
            el.remove();
            return Ok(());
        }
        if equiv.trim().eq_ignore_ascii_case("refresh")
            && let Some(content) = el.get_attribute("content")
            && let Some(rewritten) = rewrite_refresh(&content, &proxify)
        {
            el.set_attribute("content", &rewritten)?;
        }
    }

    for name in &options.url_attributes {
        if let Some(value) = el.get_attribute(name)
            && let Some(rewritten) = proxify(value.as_str())
        {
            el.set_attribute(name, &rewritten)?;
        }
    }

    for name in &options.srcset_attributes {
        if let Some(value) = el.get_attribute(name) {
            let rewritten = srcset::rewrite_srcset(&value, &proxify);
            if rewritten != value {
                el.set_attribute(name, &rewritten)?;
            }
        }
    }

    if options.rewrite_css
        && let Some(style) = el.get_attribute("style")
    {
        let rewritten = css::rewrite_css(&style, &proxify);
        if rewritten != style {
            el.set_attribute("style", &rewritten)?;
        }
    }

    if options.inject_banner && tag.eq_ignore_ascii_case("body") {
        saw_body.set(true);
        el.append(BANNER, ContentType::Html);
    }

    Ok(())
}

/// Pins `<base href>` to an absolute target URL and makes it the base for later references.
fn rebase(base: &RefCell<Url>, el: &mut Element<'_, '_>) -> HandlerResult {
    let Some(href) = el.get_attribute("href") else {
        return Ok(());
    };
    let resolved = base.borrow().join(unescape_amp(&href).trim());
    if let Ok(resolved) = resolved {
        el.set_attribute("href", resolved.as_str())?;
        *base.borrow_mut() = resolved;
    }
    Ok(())
}

/// `<meta http-equiv="refresh" content="5; url=/next">`
fn rewrite_refresh(content: &str, rewrite: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let (delay, rest) = content.split_once([';', ','])?;
    let rest = rest.trim_start();
    let target = if rest.get(..3).is_some_and(|key| key.eq_ignore_ascii_case("url")) {
        rest[3..].trim_start().strip_prefix('=')?.trim_start()
    } else {
        rest
    };
    let target = target.trim_matches(|c| c == '"' || c == '\'');
    let rewritten = rewrite(target)?;
    Some(format!("{delay}; url={rewritten}"))
}

fn unescape_amp(value: &str) -> Cow<'_, str> {
    if value.contains("&amp;") {
        Cow::Owned(value.replace("&amp;", "&"))
    } else {
        Cow::Borrowed(value)
    }
}
