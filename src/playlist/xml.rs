//! Minimal element tree for MPD documents.
//!
//! Handles elements, attributes, text, comments, processing instructions,
//! CDATA and declarations. Namespace prefixes are dropped from element names.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::ManifestError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        Regex::new(
            r#"(?s)<!--.*?-->|<\?.*?\?>|<!\[CDATA\[(?P<cdata>.*?)\]\]>|<![^>]*>|<(?P<close>/?)(?P<name>[A-Za-z_][\w:.\-]*)(?P<attrs>(?:\s+[^\s=/>]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(?P<selfclose>/?)>"#,
        )
        .expect("static regex")
    })
}

fn attr_regex() -> &'static Regex {
    static ATTR: OnceLock<Regex> = OnceLock::new();
    ATTR.get_or_init(|| {
        Regex::new(r#"([^\s=]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
    })
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parses a document and returns its root element.
pub fn parse(text: &str) -> Result<Element, ManifestError> {
    let mut stack: Vec<Element> = vec![Element::default()];
    let mut cursor = 0;

    for caps in tag_regex().captures_iter(text) {
        let whole = caps.get(0).expect("group 0 always matches");
        let between = &text[cursor..whole.start()];
        cursor = whole.end();
        if let Some(top) = stack.last_mut() {
            if !between.trim().is_empty() {
                top.text.push_str(&unescape(between.trim()));
            }
        }

        if let Some(cdata) = caps.name("cdata") {
            if let Some(top) = stack.last_mut() {
                top.text.push_str(cdata.as_str());
            }
            continue;
        }
        let Some(name) = caps.name("name") else {
            // Comment, processing instruction or declaration.
            continue;
        };
        let name = local_name(name.as_str()).to_string();

        if !caps["close"].is_empty() {
            if stack.len() < 2 {
                return Err(ManifestError::Malformed(format!("unexpected </{name}>")));
            }
            let done = stack.pop().expect("checked length");
            if done.name != name {
                return Err(ManifestError::Malformed(format!(
                    "</{name}> closes <{}>",
                    done.name
                )));
            }
            stack.last_mut().expect("sentinel").children.push(done);
            continue;
        }

        let attrs = attr_regex()
            .captures_iter(caps.name("attrs").map(|m| m.as_str()).unwrap_or_default())
            .map(|a| {
                let value = a.get(2).or_else(|| a.get(3)).map(|m| m.as_str()).unwrap_or_default();
                (a[1].to_string(), unescape(value))
            })
            .collect();
        let element = Element {
            name,
            attrs,
            ..Element::default()
        };
        if caps["selfclose"].is_empty() {
            stack.push(element);
        } else {
            stack.last_mut().expect("sentinel").children.push(element);
        }
    }

    if stack.len() != 1 {
        let open = stack.last().map(|e| e.name.clone()).unwrap_or_default();
        return Err(ManifestError::Malformed(format!("unclosed <{open}>")));
    }
    let mut sentinel = stack.pop().expect("sentinel");
    match sentinel.children.len() {
        0 => Err(ManifestError::Empty),
        1 => Ok(sentinel.children.remove(0)),
        _ => Err(ManifestError::Malformed("multiple root elements".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_with_text_and_attributes() {
        let doc = r#"<?xml version="1.0"?>
            <!-- generated -->
            <MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type='static'>
              <BaseURL>https://cdn.example.com/a?x=1&amp;y=2</BaseURL>
              <Period><AdaptationSet mimeType="video/mp4"/></Period>
            </MPD>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "MPD");
        assert_eq!(root.attr("type"), Some("static"));
        assert_eq!(
            root.child("BaseURL").unwrap().text,
            "https://cdn.example.com/a?x=1&y=2"
        );
        let period = root.child("Period").unwrap();
        assert_eq!(
            period.child("AdaptationSet").unwrap().attr("mimeType"),
            Some("video/mp4")
        );
    }

    #[test]
    fn mismatched_tags_are_malformed() {
        assert!(matches!(parse("<a><b></a>"), Err(ManifestError::Malformed(_))));
        assert!(matches!(parse("<a>"), Err(ManifestError::Malformed(_))));
        assert!(matches!(parse("   "), Err(ManifestError::Empty)));
    }

    #[test]
    fn namespace_prefixes_are_dropped() {
        let root = parse(r#"<mpd:MPD><mpd:Period id="1"></mpd:Period></mpd:MPD>"#).unwrap();
        assert_eq!(root.children[0].name, "Period");
    }
}
