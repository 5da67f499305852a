pub mod panic_parser;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::Tera;
use tracing::warn;

use self::panic_parser::{headline, parse_panic, Trace};

const TEMPLATE_NAME: &str = "page.html";
const DEFAULT_PAGE: &str = include_str!("page.html");

/// Lines shown around the panicking line in a source snippet.
pub const SNIPPET_LINE_NUMBERS: usize = 13;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnippetLine {
    pub number: usize,
    pub code: String,
    pub current: bool,
}

/// Renders captured diagnostics as in-browser HTML pages.
///
/// The template is loaded from a `page.html` next to the executable when
/// present, so it can be customised without a rebuild; otherwise (or when
/// the on-disk copy does not parse) the compiled-in page is used.
pub struct ErrorRenderer {
    tera: Tera,
    workdir: PathBuf,
}

impl ErrorRenderer {
    pub fn new(workdir: PathBuf) -> Self {
        let disk_template = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(TEMPLATE_NAME)));
        Self::with_template_path(workdir, disk_template)
    }

    fn with_template_path(workdir: PathBuf, disk_template: Option<PathBuf>) -> Self {
        let mut tera = Tera::default();
        let mut installed = false;

        if let Some(path) = disk_template.filter(|p| p.exists()) {
            match std::fs::read_to_string(&path) {
                Ok(source) => match tera.add_raw_template(TEMPLATE_NAME, &source) {
                    Ok(()) => installed = true,
                    Err(err) => {
                        warn!(
                            template = %path.display(),
                            error = %err,
                            "on-disk error page template does not parse, using built-in page"
                        );
                    }
                },
                Err(err) => {
                    warn!(
                        template = %path.display(),
                        error = %err,
                        "cannot read error page template, using built-in page"
                    );
                }
            }
        }

        if !installed {
            tera.add_raw_template(TEMPLATE_NAME, DEFAULT_PAGE)
                .expect("built-in error page template parses");
        }

        Self { tera, workdir }
    }

    pub fn render_error(&self, message: &str) -> String {
        self.render_page(&PageInfo::new("Error", message_html(message)))
    }

    pub fn render_build_error(&self, stderr: &str) -> String {
        self.render_page(&PageInfo::new("Build Error", message_html(stderr)))
    }

    /// Parses a runtime panic dump into a stack trace with a source snippet
    /// around the first app frame. When the dump does not parse, only the
    /// message is shown.
    pub fn render_app_error(&self, dump: &str) -> String {
        let parsed = parse_panic(dump, &self.workdir);
        if parsed.message.is_empty() {
            return self.render_error(dump);
        }

        let mut message = parsed.message.clone();
        message[0] = headline(&message[0]);
        let mut info = PageInfo::new("Application Error", message_html(&message.join("\n")));
        info.trace = parsed.trace;
        info.show_trace = !info.trace.is_empty();

        if let Some(index) = parsed.app_index {
            if let Some(frame) = info.trace.get(index) {
                let path = self.workdir.join(&frame.file);
                match extract_snippet(&path, frame.line) {
                    Ok(snippet) => {
                        info.snippet_path = frame.file.clone();
                        info.snippet = snippet;
                        info.show_snippet = true;
                    }
                    Err(err) => {
                        warn!(
                            file = %path.display(),
                            error = %err,
                            "cannot extract source snippet"
                        );
                    }
                }
            }
        }

        self.render_page(&info)
    }

    fn render_page(&self, info: &PageInfo) -> String {
        let mut ctx = tera::Context::new();
        ctx.insert("title", &info.title);
        ctx.insert("time", &chrono::Local::now().format("%H:%M:%S").to_string());
        ctx.insert("message", &info.message);
        ctx.insert("show_trace", &info.show_trace);
        ctx.insert("trace", &info.trace);
        ctx.insert("show_snippet", &info.show_snippet);
        ctx.insert("snippet_path", &info.snippet_path);
        ctx.insert("snippet", &info.snippet);

        match self.tera.render(TEMPLATE_NAME, &ctx) {
            Ok(html) => html,
            Err(err) => {
                warn!(error = %err, "error page template failed to render");
                format!("<pre>{}</pre>", info.message)
            }
        }
    }
}

struct PageInfo {
    title: String,
    message: String,
    trace: Vec<Trace>,
    show_trace: bool,
    snippet_path: String,
    snippet: Vec<SnippetLine>,
    show_snippet: bool,
}

impl PageInfo {
    fn new(title: &str, message: String) -> Self {
        Self {
            title: title.to_string(),
            message,
            trace: Vec::new(),
            show_trace: false,
            snippet_path: String::new(),
            snippet: Vec::new(),
            show_snippet: false,
        }
    }
}

/// Escapes a raw diagnostic and renders its newlines as `<br/>`.
fn message_html(raw: &str) -> String {
    escape_html(raw).replace('\n', "<br/>")
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Reads a 13-line window centred on `current_line`, HTML-escaped, leading
/// tabs shown as four non-breaking spaces each, the focal line flagged.
pub fn extract_snippet(path: &Path, current_line: usize) -> std::io::Result<Vec<SnippetLine>> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.split('\n').collect();

    let half = SNIPPET_LINE_NUMBERS / 2;
    let first = current_line.saturating_sub(half).max(1);
    let last = current_line.saturating_add(half);

    let mut snippet = Vec::new();
    for number in first..=last {
        if number >= 1 && number <= lines.len() {
            snippet.push(SnippetLine {
                number,
                code: format_code_line(lines[number - 1]),
                current: number == current_line,
            });
        }
    }
    Ok(snippet)
}

fn format_code_line(line: &str) -> String {
    let escaped = escape_html(line);
    let mut rest = escaped.as_str();
    let mut out = String::new();
    while let Some(stripped) = rest.strip_prefix('\t') {
        out.push_str("&nbsp;&nbsp;&nbsp;&nbsp;");
        rest = stripped;
    }
    out.push_str(rest);
    out
}
