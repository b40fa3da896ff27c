//! HTML metadata extraction for link previews.
//!
//! The favicon comes from the first `<link>` whose `rel` carries an `icon`
//! token. Relative hrefs are joined to the page origin, except protocol-relative
//! ones (`//cdn.host/x.ico`), which take the page's scheme so they point at the
//! named host rather than a path on the origin.

use scraper::{Html, Selector};
use url::{Position, Url};

use crate::models::PreviewMetadata;

/// Parse `html` and pull out the four preview fields. Each field is resolved
/// independently, first source wins.
pub fn extract(html: &str, source_url: &str) -> PreviewMetadata {
    let document = Html::parse_document(html);

    let title = get_meta_property(&document, "og:title")
        .or_else(|| get_meta_name(&document, "twitter:title"))
        .or_else(|| get_title_tag(&document));

    let description = get_meta_property(&document, "og:description")
        .or_else(|| get_meta_name(&document, "twitter:description"))
        .or_else(|| get_meta_name(&document, "description"));

    let image = get_meta_property(&document, "og:image")
        .or_else(|| get_meta_name(&document, "twitter:image"));

    let favicon = get_favicon(&document, source_url);

    PreviewMetadata {
        title,
        description,
        image,
        favicon,
    }
}

fn get_meta_property(doc: &Html, property: &str) -> Option<String> {
    get_meta(doc, "property", property)
}

fn get_meta_name(doc: &Html, name: &str) -> Option<String> {
    get_meta(doc, "name", name)
}

// Only the first matching tag is consulted; an empty `content` there does not
// fall through to a later duplicate.
fn get_meta(doc: &Html, attr: &str, value: &str) -> Option<String> {
    let selector = Selector::parse(&format!(r#"meta[{attr}="{value}"]"#)).ok()?;
    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_title_tag(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_favicon(doc: &Html, source_url: &str) -> Option<String> {
    let source = Url::parse(source_url).ok()?;
    let origin = &source[..Position::BeforePath];

    let href = Selector::parse("link[rel]")
        .ok()
        .and_then(|selector| {
            doc.select(&selector).find(|el| {
                el.value()
                    .attr("rel")
                    .is_some_and(|rel| {
                        rel.split_ascii_whitespace()
                            .any(|token| token.eq_ignore_ascii_case("icon"))
                    })
            })
        })
        .and_then(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty());

    let Some(href) = href else {
        return Some(format!("{origin}/favicon.ico"));
    };

    if href.starts_with("http") {
        Some(href.to_string())
    } else if href.starts_with("//") {
        Some(format!("{}:{href}", source.scheme()))
    } else if href.starts_with('/') {
        Some(format!("{origin}{href}"))
    } else {
        Some(format!("{origin}/{href}"))
    }
}
