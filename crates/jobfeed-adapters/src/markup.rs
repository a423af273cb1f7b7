//! Description rendering: markdown for sources that author in markdown,
//! line breaks for everyone else. Never both.

use pulldown_cmark::{html, Options, Parser};

pub fn render_description(text: &str, markdown_enabled: bool) -> String {
    if markdown_enabled {
        markdown_to_html(text)
    } else {
        linebreaks_to_html(text)
    }
}

fn markdown_to_html(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(text, options);
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    html::push_html(&mut out, parser);
    out.trim_end().to_string()
}

fn linebreaks_to_html(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .collect::<Vec<_>>()
        .join("<br />")
}
