//! Minimal scraping of the provider's sign-in pages
//!
//! Only what the negotiator needs: forms with their hidden fields, radio options,
//! image sources and the text of message boxes.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FORM_RE: Regex = Regex::new(r#"(?is)<form\b([^>]*)>(.*?)</form>"#).unwrap();
    static ref INPUT_RE: Regex = Regex::new(r#"(?is)<input\b([^>]*)>"#).unwrap();
    static ref IMG_RE: Regex = Regex::new(r#"(?is)<img\b([^>]*)>"#).unwrap();
    static ref TAG_RE: Regex = Regex::new(r#"(?is)<([a-z][a-z0-9]*)\b([^>]*)>"#).unwrap();
    static ref ATTR_RE: Regex =
        Regex::new(r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
    static ref STRIP_RE: Regex = Regex::new(r#"(?is)<script\b.*?</script>|<style\b.*?</style>|<[^>]+>"#).unwrap();
    static ref SPACE_RE: Regex = Regex::new(r#"\s+"#).unwrap();
}

/// Longest message text kept from a page
const MAX_TEXT_LEN: usize = 300;

/// Attributes of one tag, names lowercased, values unescaped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn parse(raw: &str) -> Self {
        let attrs = ATTR_RE
            .captures_iter(raw)
            .map(|c| {
                let name = c[1].to_ascii_lowercase();
                let value = c.get(2).or_else(|| c.get(3)).map(|m| m.as_str()).unwrap_or_default();
                (name, unescape(value))
            })
            .collect();
        Self(attrs)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Radio option of a selection form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioOption {
    pub value: String,
    pub label: String,
}

/// A scraped `<form>`
#[derive(Debug, Clone)]
pub struct HtmlForm {
    pub attributes: Attributes,
    pub inputs: Vec<Attributes>,
    content: String,
}

impl HtmlForm {
    pub fn action(&self) -> Option<&str> {
        self.attributes.get("action").filter(|a| !a.is_empty())
    }

    fn matches(&self, key: &str) -> bool {
        self.attributes.get("name") == Some(key) || self.attributes.get("id") == Some(key)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i.get("name") == Some(name))
    }

    /// Hidden fields in document order
    pub fn hidden_fields(&self) -> Vec<(String, String)> {
        self.inputs
            .iter()
            .filter(|i| i.get("type").map(|t| t.eq_ignore_ascii_case("hidden")).unwrap_or(false))
            .filter_map(|i| {
                let name = i.get("name")?;
                Some((name.to_string(), i.get("value").unwrap_or_default().to_string()))
            })
            .collect()
    }

    /// Radio buttons named `name` with the label text that follows each
    pub fn radio_options(&self, name: &str) -> Vec<RadioOption> {
        let mut options = Vec::new();
        for m in INPUT_RE.captures_iter(&self.content) {
            let attrs = Attributes::parse(&m[1]);
            let is_radio = attrs.get("type").map(|t| t.eq_ignore_ascii_case("radio")).unwrap_or(false);
            if !is_radio || attrs.get("name") != Some(name) {
                continue;
            }
            let Some(value) = attrs.get("value") else { continue };

            let rest = &self.content[m.get(0).map(|g| g.end()).unwrap_or(0)..];
            let until = rest.to_ascii_lowercase().find("</label>").unwrap_or(rest.len());
            let label = text_content(&rest[..until]);

            options.push(RadioOption {
                value: value.to_string(),
                label: if label.is_empty() { value.to_string() } else { label },
            });
        }
        options
    }

    /// `src` of the first image inside the form
    pub fn first_image_src(&self) -> Option<String> {
        IMG_RE
            .captures_iter(&self.content)
            .filter_map(|c| Attributes::parse(&c[1]).get("src").map(str::to_string))
            .next()
    }

    pub fn text(&self) -> String {
        text_content(&self.content)
    }
}

/// All forms of a page
pub fn forms(html: &str) -> Vec<HtmlForm> {
    FORM_RE
        .captures_iter(html)
        .map(|c| {
            let content = c[2].to_string();
            let inputs = INPUT_RE
                .captures_iter(&content)
                .map(|i| Attributes::parse(&i[1]))
                .collect();
            HtmlForm {
                attributes: Attributes::parse(&c[1]),
                inputs,
                content,
            }
        })
        .collect()
}

/// Form whose `name` or `id` is `key`
pub fn find_form(html: &str, key: &str) -> Option<HtmlForm> {
    forms(html).into_iter().find(|f| f.matches(key))
}

/// Form containing an input named `field`
pub fn find_form_with_input(html: &str, field: &str) -> Option<HtmlForm> {
    forms(html).into_iter().find(|f| f.has_input(field))
}

/// Attribute of the first element whose id is `id`
pub fn attribute_of_id(html: &str, id: &str, attribute: &str) -> Option<String> {
    TAG_RE
        .captures_iter(html)
        .map(|c| Attributes::parse(&c[2]))
        .find(|a| a.get("id") == Some(id))
        .and_then(|a| a.get(attribute).map(str::to_string))
}

/// Text following the element with the given id, tags stripped
///
/// Used for message boxes whose nesting makes exact extraction unreliable.
pub fn text_after_id(html: &str, id: &str) -> Option<String> {
    let needle_double = format!("id=\"{}\"", id);
    let needle_single = format!("id='{}'", id);
    let start = html.find(&needle_double).or_else(|| html.find(&needle_single))?;

    let rest = &html[start..];
    let open_end = rest.find('>')? + 1;
    let rest = &rest[open_end..];
    let end = rest.to_ascii_lowercase().find("</form").unwrap_or(rest.len());

    let text = text_content(&rest[..end]);
    if text.is_empty() {
        None
    } else {
        Some(text.chars().take(MAX_TEXT_LEN).collect())
    }
}

/// Visible text with tags removed and whitespace collapsed
pub fn text_content(fragment: &str) -> String {
    let stripped = STRIP_RE.replace_all(fragment, " ");
    let unescaped = unescape(&stripped);
    SPACE_RE.replace_all(unescaped.trim(), " ").into_owned()
}

/// Decode the entities the provider's pages use
pub fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
