//! Remote message bodies are HTML-ish rich text.

use once_cell::sync::Lazy;
use regex::Regex;

static LINE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Plain-text rendition of a rich-text body: tags stripped, line breaks
/// kept, common entities decoded.
pub fn html_to_text(html: &str) -> String {
    let text = LINE_BREAK.replace_all(html, "\n");
    let text = TAG.replace_all(&text, "");
    decode_entities(&text).trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        // Last, so "&amp;lt;" decodes to "&lt;" and not "<".
        .replace("&amp;", "&")
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Markup for an outbound GIF.
pub fn gif_markup(url: &str) -> String {
    format!(r#"<img src="{}" alt="GIF" itemtype="http://schema.skype.com/Giphy">"#, escape_attr(url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text() {
        assert_eq!(html_to_text("<b>hello</b> <i>there</i>"), "hello there");
        assert_eq!(html_to_text("line one<br/>line two<BR>three"), "line one\nline two\nthree");
        assert_eq!(html_to_text("a &lt;b&gt; &amp;lt; &quot;q&quot;"), "a <b> &lt; \"q\"");
        assert_eq!(html_to_text("plain"), "plain");
    }

    #[test]
    fn test_gif_markup_escapes() {
        let markup = gif_markup("https://media.example.com/a.gif?x=1&y=\"2\"");
        assert!(markup.contains("x=1&amp;y=&quot;2&quot;"));
        assert!(markup.starts_with("<img src=\""));
    }
}
