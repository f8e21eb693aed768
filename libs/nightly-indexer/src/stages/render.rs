use std::fmt::Write as _;

use nightly_core::{format_date, MISSING};
use nightly_protocol::{ViewModelDTO, ViewRowDTO};

use super::PageRenderer;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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

/// Unstyled history page: one table of nightly runs, one of weekly runs.
#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    title: String,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self {
            title: "CISM nightly regression tests".to_string(),
        }
    }
}

impl HtmlRenderer {
    pub fn with_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    fn table(out: &mut String, heading: &str, rows: &[ViewRowDTO]) {
        let _ = writeln!(out, "<h2>{}</h2>", escape(heading));
        out.push_str("<table>\n");
        out.push_str(
            "<tr><th>Date</th><th>Test</th><th>Benchmark</th><th>Website</th>\
             <th>Bit-for-bit pass</th><th>Bit-for-bit fail</th></tr>\n",
        );
        if rows.is_empty() {
            out.push_str("<tr><td colspan=\"6\">no runs</td></tr>\n");
        }
        for row in rows {
            let date = format_date(row.date);
            let (pass, fail) = match row.summary() {
                Some(s) => (s.bit_for_bit_pass.to_string(), s.bit_for_bit_fail.to_string()),
                None => (MISSING.to_string(), MISSING.to_string()),
            };
            // Only runs whose report directory is on disk get a link.
            let web = match &row.report_dir {
                Some(dir) => format!(
                    "<a href=\"{}/index.html\">{}</a>",
                    escape(dir),
                    escape(&row.web_hash)
                ),
                None => escape(&row.web_hash),
            };
            let _ = writeln!(
                out,
                "<tr><td>{date}</td><td>{}</td><td>{}</td><td>{web}</td><td>{pass}</td><td>{fail}</td></tr>",
                escape(&row.test_hash),
                escape(&row.bench_hash),
            );
        }
        out.push_str("</table>\n");
    }
}

impl PageRenderer for HtmlRenderer {
    fn render(&self, view: &ViewModelDTO) -> String {
        let title = escape(&self.title);
        let mut out = String::new();
        out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        let _ = writeln!(out, "<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>");
        Self::table(&mut out, "Nightly", &view.daily);
        Self::table(&mut out, "Weekly", &view.weekly);
        out.push_str("</body>\n</html>\n");
        out
    }
}
