//! Placeholder templates for entry and digest-header messages.
//!
//! A template is plain text with `{scope.field}` placeholders, for example
//! `[{entry.title}]({entry.link}) - {feed.title}`. Doubled braces (`{{`,
//! `}}`) produce literal braces.

use thiserror::Error;

use crate::feed::{Entry, FeedMetadata};

const ENTRY_FIELDS: &[&str] = &[
    "entry.id",
    "entry.title",
    "entry.link",
    "entry.published",
    "entry.summary",
];
const FEED_FIELDS: &[&str] = &[
    "feed.title",
    "feed.subtitle",
    "feed.link",
    "feed.description",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown placeholder {{{0}}}")]
    UnknownField(String),
    #[error("no value for placeholder {{{0}}}")]
    MissingValue(String),
    #[error("unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
}

enum Segment<'a> {
    Literal(&'a str),
    Field(&'a str),
}

fn segments(template: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < template.len() {
        let rest = &template[pos..];
        let Some(i) = rest.find(|c| c == '{' || c == '}') else {
            out.push(Segment::Literal(rest));
            break;
        };
        if i > 0 {
            out.push(Segment::Literal(&rest[..i]));
        }
        let tail = &rest[i..];
        if tail.starts_with("{{") {
            out.push(Segment::Literal("{"));
            pos += i + 2;
        } else if tail.starts_with("}}") {
            out.push(Segment::Literal("}"));
            pos += i + 2;
        } else if tail.starts_with('}') {
            return Err(RenderError::UnbalancedBrace(pos + i));
        } else {
            let close = tail
                .find('}')
                .ok_or(RenderError::UnbalancedBrace(pos + i))?;
            let name = &tail[1..close];
            if name.contains('{') {
                return Err(RenderError::UnbalancedBrace(pos + i));
            }
            out.push(Segment::Field(name.trim()));
            pos += i + close + 1;
        }
    }

    Ok(out)
}

/// Check syntax and placeholder names without rendering anything.
///
/// `allow_entry` is false for digest headers, which only see the feed.
pub fn validate(template: &str, allow_entry: bool) -> Result<(), RenderError> {
    for segment in segments(template)? {
        if let Segment::Field(name) = segment {
            let known = FEED_FIELDS.contains(&name) || (allow_entry && ENTRY_FIELDS.contains(&name));
            if !known {
                return Err(RenderError::UnknownField(name.to_string()));
            }
        }
    }
    Ok(())
}

/// Render one entry.
pub fn render(template: &str, entry: &Entry, feed: &FeedMetadata) -> Result<String, RenderError> {
    render_with(template, Some(entry), feed)
}

/// Render a template that only refers to `feed.*` fields.
pub fn render_header(template: &str, feed: &FeedMetadata) -> Result<String, RenderError> {
    render_with(template, None, feed)
}

fn render_with(
    template: &str,
    entry: Option<&Entry>,
    feed: &FeedMetadata,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    for segment in segments(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field(name) => out.push_str(&resolve(name, entry, feed)?),
        }
    }
    Ok(out)
}

fn resolve(name: &str, entry: Option<&Entry>, feed: &FeedMetadata) -> Result<String, RenderError> {
    let missing = || RenderError::MissingValue(name.to_string());

    if let Some(field) = name.strip_prefix("feed.") {
        return match field {
            "title" => Ok(feed.title.clone()),
            "subtitle" => Ok(feed.subtitle.clone()),
            "link" => Ok(feed.link.clone()),
            "description" => Ok(feed.description.clone()),
            _ => Err(RenderError::UnknownField(name.to_string())),
        };
    }

    let (Some(field), Some(entry)) = (name.strip_prefix("entry."), entry) else {
        return Err(RenderError::UnknownField(name.to_string()));
    };
    match field {
        "id" => Ok(entry.id.clone()),
        "title" => Ok(entry.title.clone()),
        "link" => entry.link.clone().ok_or_else(missing),
        "published" => entry
            .published
            .map(|p| p.format("%Y-%m-%d %H:%M").to_string())
            .ok_or_else(missing),
        "summary" => entry.summary.clone().ok_or_else(missing),
        _ => Err(RenderError::UnknownField(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn entry() -> Entry {
        Entry {
            id: "guid-1".into(),
            title: "Hello".into(),
            link: Some("https://example.com/hello".into()),
            published: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap()),
            summary: None,
        }
    }

    fn feed() -> FeedMetadata {
        FeedMetadata {
            title: "Example".into(),
            subtitle: String::new(),
            link: "https://example.com/".into(),
            description: String::new(),
        }
    }

    #[test]
    fn test_render_entry_and_feed_fields() {
        let out = render("[{entry.title}]({entry.link}) - {feed.title}", &entry(), &feed()).unwrap();
        assert_eq!(out, "[Hello](https://example.com/hello) - Example");
    }

    #[test]
    fn test_render_published_format() {
        let out = render("- ({entry.published}) {entry.title}", &entry(), &feed()).unwrap();
        assert_eq!(out, "- (2024-01-02 03:04) Hello");
    }

    #[test]
    fn test_escaped_braces() {
        let out = render("{{{entry.id}}}", &entry(), &feed()).unwrap();
        assert_eq!(out, "{guid-1}");
    }

    #[test]
    fn test_missing_optional_value() {
        let err = render("{entry.summary}", &entry(), &feed()).unwrap_err();
        assert_eq!(err, RenderError::MissingValue("entry.summary".into()));
    }

    #[test]
    fn test_unknown_field() {
        let err = render("{entry.author}", &entry(), &feed()).unwrap_err();
        assert_eq!(err, RenderError::UnknownField("entry.author".into()));
    }

    #[test]
    fn test_unbalanced_braces() {
        assert_eq!(
            render("oops {entry.title", &entry(), &feed()).unwrap_err(),
            RenderError::UnbalancedBrace(5)
        );
        assert_eq!(
            render("oops }", &entry(), &feed()).unwrap_err(),
            RenderError::UnbalancedBrace(5)
        );
    }

    #[test]
    fn test_header_rejects_entry_fields() {
        assert!(render_header("Digest: {feed.title}", &feed()).is_ok());
        assert!(matches!(
            render_header("{entry.title}", &feed()),
            Err(RenderError::UnknownField(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(validate("{entry.title} {feed.link}", true).is_ok());
        assert!(validate("{entry.title}", false).is_err());
        assert!(validate("{nope}", true).is_err());
        assert!(validate("plain text", false).is_ok());
    }
}
