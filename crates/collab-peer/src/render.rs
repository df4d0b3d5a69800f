//! HTML rendering of the document.
//!
//! One `<p>` per newline-separated paragraph, with inline marks as the usual
//! tags. This is the form the change history compares and the content-save
//! hook writes out.

use collab_core::{ContentRenderer, TextSpan};
use serde_json::Value;

#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRenderer;

impl ContentRenderer for HtmlRenderer {
    fn render(&self, spans: &[TextSpan]) -> String {
        let mut html = String::new();
        let mut paragraph = String::new();

        for span in spans {
            let mut pieces = span.text.split('\n').peekable();
            while let Some(piece) = pieces.next() {
                if !piece.is_empty() {
                    paragraph.push_str(&wrap_marks(&escape(piece), span));
                }
                if pieces.peek().is_some() {
                    close_paragraph(&mut html, &mut paragraph);
                }
            }
        }
        close_paragraph(&mut html, &mut paragraph);
        html
    }
}

fn close_paragraph(html: &mut String, paragraph: &mut String) {
    html.push_str("<p>");
    html.push_str(paragraph);
    html.push_str("</p>");
    paragraph.clear();
}

fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
}

fn string_mark<'a>(span: &'a TextSpan, key: &str) -> Option<&'a str> {
    span.marks.get(key).and_then(Value::as_str)
}

/// Innermost first: code, strike, underline, italic, bold, styling, link.
fn wrap_marks(text: &str, span: &TextSpan) -> String {
    let mut out = text.to_string();
    for (key, tag) in [
        ("code", "code"),
        ("strike", "s"),
        ("underline", "u"),
        ("italic", "em"),
        ("bold", "strong"),
    ] {
        if is_set(span.marks.get(key)) {
            out = format!("<{tag}>{out}</{tag}>");
        }
    }

    let mut style = Vec::new();
    if let Some(color) = string_mark(span, "color") {
        style.push(format!("color: {}", escape(color)));
    }
    if let Some(size) = string_mark(span, "fontSize") {
        style.push(format!("font-size: {}", escape(size)));
    }
    if !style.is_empty() {
        out = format!("<span style=\"{}\">{out}</span>", style.join("; "));
    }
    if let Some(color) = string_mark(span, "highlight") {
        out = format!("<mark data-color=\"{}\">{out}</mark>", escape(color));
    }
    if let Some(href) = string_mark(span, "link") {
        out = format!("<a href=\"{}\">{out}</a>", escape(href));
    }
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
