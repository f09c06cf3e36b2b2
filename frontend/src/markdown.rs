//! Minimal markdown to HTML: headings, lists, fenced and inline code,
//! bold, italic and paragraphs. Everything else is escaped text.
//!
//! Rendering a half-streamed document must never panic or leak raw HTML, so
//! an unterminated fence renders as code and unmatched markers stay literal.

pub fn render(text: &str) -> String {
    let mut out = String::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut list: Option<(&'static str, Vec<String>)> = None;
    let mut code: Option<Vec<String>> = None;

    for line in text.lines() {
        if let Some(lines) = code.as_mut() {
            if line.trim_start().starts_with("```") {
                flush_code(&mut out, &mut code);
            } else {
                lines.push(escape(line));
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            flush_paragraph(&mut out, &mut paragraph);
            flush_list(&mut out, &mut list);
            code = Some(Vec::new());
            continue;
        }
        if trimmed.is_empty() {
            flush_paragraph(&mut out, &mut paragraph);
            flush_list(&mut out, &mut list);
            continue;
        }
        if let Some((level, title)) = heading(trimmed) {
            flush_paragraph(&mut out, &mut paragraph);
            flush_list(&mut out, &mut list);
            out.push_str(&format!("<h{level}>{}</h{level}>", inline(title)));
            continue;
        }
        if let Some((tag, item)) = list_item(trimmed) {
            flush_paragraph(&mut out, &mut paragraph);
            if list.as_ref().is_some_and(|(open, _)| *open != tag) {
                flush_list(&mut out, &mut list);
            }
            list.get_or_insert_with(|| (tag, Vec::new())).1.push(inline(item));
            continue;
        }

        flush_list(&mut out, &mut list);
        paragraph.push(inline(trimmed));
    }

    flush_code(&mut out, &mut code);
    flush_paragraph(&mut out, &mut paragraph);
    flush_list(&mut out, &mut list);
    out
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(1..=3).contains(&level) {
        return None;
    }
    line[level..].strip_prefix(' ').map(|title| (level + 2, title.trim()))
}

fn list_item(line: &str) -> Option<(&'static str, &str)> {
    for marker in ["- ", "* ", "• "] {
        if let Some(item) = line.strip_prefix(marker) {
            return Some(("ul", item.trim()));
        }
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(item) = line[digits..].strip_prefix(". ") {
            return Some(("ol", item.trim()));
        }
    }
    None
}

fn flush_paragraph(out: &mut String, paragraph: &mut Vec<String>) {
    if paragraph.is_empty() {
        return;
    }
    out.push_str("<p>");
    out.push_str(&paragraph.join("<br>"));
    out.push_str("</p>");
    paragraph.clear();
}

fn flush_list(out: &mut String, list: &mut Option<(&'static str, Vec<String>)>) {
    if let Some((tag, items)) = list.take() {
        out.push_str(&format!("<{tag}>"));
        for item in items {
            out.push_str(&format!("<li>{item}</li>"));
        }
        out.push_str(&format!("</{tag}>"));
    }
}

fn flush_code(out: &mut String, code: &mut Option<Vec<String>>) {
    if let Some(lines) = code.take() {
        out.push_str("<pre><code>");
        out.push_str(&lines.join("\n"));
        out.push_str("</code></pre>");
    }
}

/// Inline spans. Code spans are taken first so their content stays literal.
fn inline(text: &str) -> String {
    let segments: Vec<&str> = text.split('`').collect();
    let closed = segments.len() - (segments.len() + 1) % 2;
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i % 2 == 1 && i < closed {
            out.push_str("<code>");
            out.push_str(&escape(segment));
            out.push_str("</code>");
        } else {
            if i % 2 == 1 {
                out.push('`');
            }
            let escaped = escape(segment);
            let bold = wrap_pairs(&escaped, "**", "strong");
            out.push_str(&wrap_pairs(&bold, "*", "em"));
        }
    }
    out
}

/// Replaces matched pairs of `delim` with `<tag>…</tag>`; a trailing
/// unmatched delimiter stays literal.
fn wrap_pairs(text: &str, delim: &str, tag: &str) -> String {
    let parts: Vec<&str> = text.split(delim).collect();
    let pairs = (parts.len() - 1) / 2;
    let mut out = String::from(parts[0]);
    for (i, part) in parts.iter().enumerate().skip(1) {
        if i <= pairs * 2 {
            if i % 2 == 1 {
                out.push_str(&format!("<{tag}>"));
            } else {
                out.push_str(&format!("</{tag}>"));
            }
        } else {
            out.push_str(delim);
        }
        out.push_str(part);
    }
    out
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_and_line_breaks() {
        assert_eq!(render("Hi\nthere\n\nNext"), "<p>Hi<br>there</p><p>Next</p>");
    }

    #[test]
    fn headings_and_lists() {
        assert_eq!(
            render("# Title\n- one\n- two\n1. first"),
            "<h3>Title</h3><ul><li>one</li><li>two</li></ul><ol><li>first</li></ol>"
        );
        assert_eq!(render("#hashtag"), "<p>#hashtag</p>");
    }

    #[test]
    fn inline_emphasis_and_code() {
        assert_eq!(
            render("**bold** and *it* with `a*b`"),
            "<p><strong>bold</strong> and <em>it</em> with <code>a*b</code></p>"
        );
        assert_eq!(render("2 * 3"), "<p>2 * 3</p>");
        assert_eq!(render("open `tick"), "<p>open `tick</p>");
    }

    #[test]
    fn fenced_code_is_escaped_even_when_unterminated() {
        assert_eq!(
            render("```rust\nlet x = a < b;\n```"),
            "<pre><code>let x = a &lt; b;</code></pre>"
        );
        assert_eq!(render("text\n```\n<b>"), "<p>text</p><pre><code>&lt;b&gt;</code></pre>");
    }

    #[test]
    fn html_is_never_passed_through() {
        assert_eq!(render("<script>x</script>"), "<p>&lt;script&gt;x&lt;/script&gt;</p>");
    }
}
