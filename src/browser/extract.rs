//! Pure extraction over rendered HTML.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::crawler::result::{ContactInfo, KeywordReport, PageMetadata, SeoCheck};

const SOCIAL_HOSTS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "linkedin.com",
    "youtube.com",
    "tiktok.com",
    "pinterest.com",
];

/// Phrases that look like street addresses but never are
const ADDRESS_BLACKLIST: &[&str] = &[
    "copyright",
    "all rights reserved",
    "privacy",
    "cookie",
    "javascript",
    "subscribe",
];

const MIN_ADDRESS_LEN: usize = 12;

fn selector(css: &str) -> Selector {
    // Only called with the literal selectors below
    Selector::parse(css).unwrap_or_else(|_| panic!("invalid selector {}", css))
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap())
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\(?\d{1,4}\)?[\s.-]?\(?\d{2,4}\)?[\s.-]\d{3,4}[\s.-]\d{3,4}").unwrap())
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{1,5}\s+(?:[A-Za-z][A-Za-z.'-]*\s+){0,4}(?:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|court|ct|way|place|pl|square|sq)\b\.?(?:,\s*[A-Za-z .'-]+){0,3}(?:,?\s*\d{4,6})?",
        )
        .unwrap()
    })
}

fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() { None } else { Some(text) }
}

fn meta_content(document: &Html, attr: &str, name: &str) -> Option<String> {
    let sel = selector(&format!(r#"meta[{}="{}"]"#, attr, name));
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(clean)
        .find(|content| !content.is_empty())
}

/// Title, description, keywords and open-graph fields
pub fn parse_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);

    let title = document
        .select(&selector("title"))
        .next()
        .map(|el| clean(&el.text().collect::<String>()))
        .and_then(non_empty);

    PageMetadata {
        title,
        description: meta_content(&document, "name", "description"),
        keywords: meta_content(&document, "name", "keywords"),
        og_title: meta_content(&document, "property", "og:title"),
        og_description: meta_content(&document, "property", "og:description"),
        og_image: meta_content(&document, "property", "og:image"),
        og_type: meta_content(&document, "property", "og:type"),
        og_site_name: meta_content(&document, "property", "og:site_name"),
    }
}

/// Absolute image URLs in document order, deduplicated, at most `max`
pub fn extract_images(html: &str, base: &Url, max: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = BTreeSet::new();
    let mut images = Vec::new();

    for el in document.select(&selector("img")) {
        let src = el.value().attr("src").or_else(|| el.value().attr("data-src"));
        let Some(absolute) = src.and_then(|s| base.join(s.trim()).ok()) else {
            continue;
        };
        if absolute.scheme() == "data" {
            continue;
        }
        if seen.insert(absolute.to_string()) {
            images.push(absolute.to_string());
            if images.len() >= max {
                break;
            }
        }
    }

    images
}

/// Best guess at the site logo from image and icon markup
pub fn find_logo_candidate(html: &str, base: &Url) -> Option<String> {
    let document = Html::parse_document(html);

    let from_img = document.select(&selector("img")).find_map(|el| {
        let attrs = el.value();
        let hint = [attrs.attr("src"), attrs.attr("alt"), attrs.attr("class"), attrs.attr("id")]
            .iter()
            .flatten()
            .any(|value| value.to_lowercase().contains("logo"));

        if hint {
            attrs.attr("src").and_then(|src| base.join(src).ok())
        } else {
            None
        }
    });

    from_img
        .or_else(|| {
            document
                .select(&selector(r#"link[rel~="icon"], link[rel="apple-touch-icon"]"#))
                .find_map(|el| el.value().attr("href").and_then(|href| base.join(href).ok()))
        })
        .map(|url| url.to_string())
}

/// Visible text of the body, whitespace-collapsed
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let skip = selector("script, style, noscript");
    let skipped: HashSet<_> = document.select(&skip).map(|el| el.id()).collect();

    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let inside_skipped = node.ancestors().any(|a| skipped.contains(&a.id()));
            if !inside_skipped {
                parts.push(text.to_string());
            }
        }
    }

    clean(&parts.join(" "))
}

/// Emails, phone numbers and social profile links
pub fn extract_contact_info(html: &str) -> ContactInfo {
    let document = Html::parse_document(html);
    let text = visible_text(html);

    let mut emails = BTreeSet::new();
    let mut social = BTreeSet::new();

    for el in document.select(&selector("a[href]")) {
        let Some(href) = el.value().attr("href") else { continue };

        if let Some(address) = href.strip_prefix("mailto:") {
            let address = address.split('?').next().unwrap_or("").to_lowercase();
            if email_regex().is_match(&address) {
                emails.insert(address);
            }
        } else if let Ok(url) = Url::parse(href) {
            let host = url.host_str().unwrap_or("").trim_start_matches("www.");
            if SOCIAL_HOSTS.iter().any(|s| host == *s || host.ends_with(&format!(".{}", s))) {
                social.insert(url.to_string());
            }
        }
    }

    for m in email_regex().find_iter(&text) {
        emails.insert(m.as_str().to_lowercase());
    }

    let phones: BTreeSet<String> = phone_regex()
        .find_iter(&text)
        .map(|m| m.as_str().trim().to_string())
        .collect();

    ContactInfo {
        emails: emails.into_iter().collect(),
        phones: phones.into_iter().collect(),
        social_links: social.into_iter().collect(),
    }
}

/// Street addresses found in page text
pub fn extract_addresses(text: &str) -> Vec<String> {
    let mut found = BTreeSet::new();

    for m in address_regex().find_iter(text) {
        let candidate = m.as_str().trim().trim_end_matches(',').to_string();
        if candidate.len() < MIN_ADDRESS_LEN {
            continue;
        }

        // Blacklisted words anywhere in the enclosing sentence disqualify the match
        let prefix = &text[..m.start()];
        let sentence_start = prefix
            .rfind(|c: char| c == '.' || c == '!' || c == '?' || c == '\n')
            .map_or(0, |i| i + 1);
        let sentence = text[sentence_start..m.end()].to_lowercase();
        if ADDRESS_BLACKLIST.iter().any(|word| sentence.contains(word)) {
            continue;
        }
        found.insert(candidate);
    }

    found.into_iter().collect()
}

fn check(name: &str, passed: bool, detail: impl Into<String>) -> SeoCheck {
    SeoCheck {
        name: name.to_string(),
        passed,
        detail: detail.into(),
    }
}

/// On-page SEO checks. `sitemap_found` comes from a separate HTTP probe.
pub fn seo_checks(html: &str, page: &Url, sitemap_found: bool) -> Vec<SeoCheck> {
    let document = Html::parse_document(html);
    let metadata = parse_metadata(html);
    let mut checks = Vec::new();

    let title_len = metadata.title.as_deref().map_or(0, |t| t.chars().count());
    checks.push(check("title", (10..=60).contains(&title_len), format!("{} characters", title_len)));

    let description_len = metadata.description.as_deref().map_or(0, |d| d.chars().count());
    checks.push(check(
        "meta_description",
        (50..=160).contains(&description_len),
        format!("{} characters", description_len),
    ));

    let h1_count = document.select(&selector("h1")).count();
    let h2_count = document.select(&selector("h2")).count();
    checks.push(check("headings", h1_count == 1, format!("{} h1, {} h2", h1_count, h2_count)));

    let images: Vec<_> = document.select(&selector("img")).collect();
    let missing_alt = images
        .iter()
        .filter(|el| el.value().attr("alt").map_or(true, |alt| alt.trim().is_empty()))
        .count();
    checks.push(check(
        "image_alt_text",
        missing_alt == 0,
        format!("{} of {} images without alt text", missing_alt, images.len()),
    ));

    let words = visible_text(html).split_whitespace().count();
    checks.push(check("content_length", words >= 300, format!("{} words", words)));

    let internal_links = document
        .select(&selector("a[href]"))
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| page.join(href).ok())
        .filter(|url| url.host_str() == page.host_str())
        .count();
    checks.push(check("internal_links", internal_links >= 3, format!("{} internal links", internal_links)));

    checks.push(check(
        "sitemap",
        sitemap_found,
        if sitemap_found { "sitemap.xml reachable" } else { "no sitemap.xml" },
    ));

    let canonical = document
        .select(&selector(r#"link[rel="canonical"]"#))
        .find_map(|el| el.value().attr("href").map(str::to_string));
    checks.push(check(
        "canonical",
        canonical.is_some(),
        canonical.unwrap_or_else(|| "missing".to_string()),
    ));

    let viewport = meta_content(&document, "name", "viewport");
    checks.push(check(
        "mobile_viewport",
        viewport.as_deref().map_or(false, |v| v.contains("width=device-width")),
        viewport.unwrap_or_else(|| "missing".to_string()),
    ));

    // Lighthouse-style budget checks on the document itself
    let scripts = document.select(&selector("script[src]")).count();
    let stylesheets = document.select(&selector(r#"link[rel="stylesheet"]"#)).count();
    checks.push(check(
        "render_blocking_resources",
        scripts + stylesheets <= 15,
        format!("{} scripts, {} stylesheets", scripts, stylesheets),
    ));
    checks.push(check("https", page.scheme() == "https", page.scheme().to_string()));

    checks
}

/// Occurrences of a tracked keyword across the page
pub fn keyword_report(html: &str, keyword: &str) -> KeywordReport {
    let document = Html::parse_document(html);
    let metadata = parse_metadata(html);
    let needle = keyword.trim().to_lowercase();

    let contains = |text: &Option<String>| text.as_deref().map_or(false, |t| t.to_lowercase().contains(&needle));

    let in_headings = document
        .select(&selector("h1, h2, h3"))
        .filter(|el| el.text().collect::<String>().to_lowercase().contains(&needle))
        .count();

    let text = visible_text(html).to_lowercase();
    let occurrences = if needle.is_empty() { 0 } else { text.matches(&needle).count() };
    let words = text.split_whitespace().count();
    let density = if words == 0 {
        0.0
    } else {
        let keyword_words = needle.split_whitespace().count().max(1);
        (occurrences * keyword_words) as f64 * 100.0 / words as f64
    };

    KeywordReport {
        keyword: keyword.to_string(),
        in_title: contains(&metadata.title),
        in_description: contains(&metadata.description),
        in_headings,
        occurrences,
        density,
    }
}
