//! Command templates: a bracket syntax tokenized into literal and placeholder
//! segments, with placeholders resolved through the [`EXPANDERS`] table.

use crate::normalize::{NormalizeFlags, StripRequest};
use std::path::Path;

pub const RESULT_DIR: &str = "result";
pub const POST_OPEN: &str = "[POST]";
pub const POST_CLOSE: &str = "[/POST]";
pub const STRIP_OPEN: &str = "[STRIP:";
pub const ENV_OPEN: &str = "[ENV ";

/// Overrides that name a whole output format rather than a raster backend.
pub const VECTOR_FORMAT_OVERRIDES: [&str; 3] = ["pdf", "svg", "gif"];

pub const PDF_CREATION_DATE_VAR: &str = "MS_PDF_CREATION_DATE";
pub const PDF_CREATION_DATE_VALUE: &str = "dummy date";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolNames {
    pub mapserv: String,
    pub legend: String,
    pub scalebar: String,
}

impl Default for ToolNames {
    fn default() -> Self {
        Self {
            mapserv: "mapserv".to_string(),
            legend: "legend".to_string(),
            scalebar: "scalebar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// Fixture path as the renderer should see it from the fixture directory.
    pub fixture: &'a str,
    /// Output name declared by the directive, before any renderer override.
    pub output_name: &'a str,
    pub renderer: &'a str,
    pub renderer_override: Option<&'a str>,
    pub tools: &'a ToolNames,
}

impl TemplateContext<'_> {
    pub fn result_name(&self) -> String {
        result_output_name(self.output_name, self.renderer_override)
    }

    pub fn result_path(&self) -> String {
        format!("{}/{}", RESULT_DIR, self.result_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
    Post(&'a str),
    Strip(&'a str),
    Env { key: &'a str, value: &'a str },
}

#[derive(Clone, Copy)]
pub struct PlaceholderExpander {
    pub name: &'static str,
    pub expand: fn(&TemplateContext<'_>) -> String,
    pub flags: NormalizeFlags,
}

const NO_FLAGS: NormalizeFlags = NormalizeFlags::NONE;

pub const EXPANDERS: &[PlaceholderExpander] = &[
    PlaceholderExpander {
        name: "RESULT",
        expand: expand_result,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "RESULT_DEMIME",
        expand: expand_result,
        flags: NormalizeFlags {
            demime: true,
            ..NO_FLAGS
        },
    },
    PlaceholderExpander {
        name: "RESULT_DEVERSION",
        expand: expand_result,
        flags: NormalizeFlags {
            deversion: true,
            ..NO_FLAGS
        },
    },
    PlaceholderExpander {
        name: "RESULT_DEMIME_DEVERSION",
        expand: expand_result,
        flags: NormalizeFlags {
            demime: true,
            deversion: true,
            ..NO_FLAGS
        },
    },
    PlaceholderExpander {
        name: "EXTRACT_SERVICE_VERSION",
        expand: expand_result,
        flags: NormalizeFlags {
            extract_service_version: true,
            ..NO_FLAGS
        },
    },
    PlaceholderExpander {
        name: "MAPFILE",
        expand: expand_fixture,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "SHP2IMG",
        expand: expand_renderer,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "RENDERER",
        expand: expand_renderer_flag,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "MAPSERV",
        expand: expand_mapserv,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "LEGEND",
        expand: expand_legend,
        flags: NO_FLAGS,
    },
    PlaceholderExpander {
        name: "SCALEBAR",
        expand: expand_scalebar,
        flags: NO_FLAGS,
    },
];

fn expand_result(context: &TemplateContext<'_>) -> String {
    context.result_path()
}

fn expand_fixture(context: &TemplateContext<'_>) -> String {
    context.fixture.to_string()
}

fn expand_renderer(context: &TemplateContext<'_>) -> String {
    context.renderer.to_string()
}

fn expand_renderer_flag(context: &TemplateContext<'_>) -> String {
    context
        .renderer_override
        .map(|name| format!("-i {}", name))
        .unwrap_or_default()
}

fn expand_mapserv(context: &TemplateContext<'_>) -> String {
    context.tools.mapserv.clone()
}

fn expand_legend(context: &TemplateContext<'_>) -> String {
    context.tools.legend.clone()
}

fn expand_scalebar(context: &TemplateContext<'_>) -> String {
    context.tools.scalebar.clone()
}

pub fn find_expander(name: &str) -> Option<&'static PlaceholderExpander> {
    EXPANDERS.iter().find(|expander| expander.name == name)
}

/// A concrete invocation produced from one template. The environment bag and
/// stdin payload belong to this invocation only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedCommand {
    pub command_line: String,
    pub result_name: String,
    pub post_payload: Option<String>,
    pub env: Vec<(String, String)>,
    pub normalize: NormalizeFlags,
    pub strip: StripRequest,
}

impl ExpandedCommand {
    pub fn result_path(&self) -> String {
        format!("{}/{}", RESULT_DIR, self.result_name)
    }

    pub fn stdin_bytes(&self) -> Option<Vec<u8>> {
        self.post_payload
            .as_ref()
            .map(|payload| format!("{}\n", payload).into_bytes())
    }

    /// Shell pipeline equivalent of this invocation, for logs and dry runs.
    pub fn shell_line(&self) -> String {
        match &self.post_payload {
            Some(payload) => format!("echo \"{}\" | {}", payload, self.command_line),
            None => self.command_line.clone(),
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }
}

pub fn tokenize(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut cursor = 0;

    while let Some(offset) = template[cursor..].find('[') {
        let open = cursor + offset;
        match match_bracket(template, open) {
            Some((segment, end)) => {
                if literal_start < open {
                    segments.push(Segment::Literal(&template[literal_start..open]));
                }
                segments.push(segment);
                cursor = end;
                literal_start = end;
            }
            None => cursor = open + 1,
        }
    }

    if literal_start < template.len() {
        segments.push(Segment::Literal(&template[literal_start..]));
    }
    segments
}

fn match_bracket(template: &str, open: usize) -> Option<(Segment<'_>, usize)> {
    let rest = &template[open..];

    if let Some(body) = rest.strip_prefix(POST_OPEN)
        && let Some(close) = body.find(POST_CLOSE)
    {
        let end = open + POST_OPEN.len() + close + POST_CLOSE.len();
        return Some((Segment::Post(&body[..close]), end));
    }

    if let Some(body) = rest.strip_prefix(STRIP_OPEN) {
        let close = body.find(']')?;
        let end = open + STRIP_OPEN.len() + close + 1;
        return Some((Segment::Strip(&body[..close]), end));
    }

    if let Some(body) = rest.strip_prefix(ENV_OPEN) {
        let close = body.find(']')?;
        let (key, value) = body[..close].split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        let end = open + ENV_OPEN.len() + close + 1;
        return Some((Segment::Env { key, value }, end));
    }

    let close = rest.find(']')?;
    let name = &rest[1..close];
    let is_placeholder_name = !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'_');
    is_placeholder_name.then(|| (Segment::Placeholder(name), open + close + 1))
}

pub fn expand(template: &str, context: &TemplateContext<'_>) -> ExpandedCommand {
    let mut command_line = String::with_capacity(template.len());
    let mut post_payload = None;
    let mut env = vec![(
        PDF_CREATION_DATE_VAR.to_string(),
        PDF_CREATION_DATE_VALUE.to_string(),
    )];
    let mut normalize = NormalizeFlags::NONE;
    let mut strip = StripRequest::default();

    for segment in tokenize(template) {
        match segment {
            Segment::Literal(text) => command_line.push_str(text),
            Segment::Placeholder(name) => {
                push_placeholder(&mut command_line, name, context, &mut normalize);
            }
            Segment::Post(payload) => {
                let payload = expand_payload(payload, context, &mut normalize);
                post_payload = Some(payload.replace('"', "'"));
            }
            Segment::Strip(pattern) => strip.push(pattern),
            Segment::Env { key, value } => env.push((key.to_string(), value.to_string())),
        }
    }

    if let Some(payload) = &post_payload {
        env.extend(post_environment(payload, context.fixture));
    }

    let result_name = context.result_name();
    tracing::debug!(
        template,
        command = %command_line,
        result = %result_name,
        "expanded command template"
    );

    ExpandedCommand {
        command_line,
        result_name,
        post_payload,
        env,
        normalize,
        strip,
    }
}

fn push_placeholder(
    out: &mut String,
    name: &str,
    context: &TemplateContext<'_>,
    normalize: &mut NormalizeFlags,
) {
    match find_expander(name) {
        Some(expander) => {
            out.push_str(&(expander.expand)(context));
            *normalize = normalize.union(expander.flags);
        }
        None => {
            out.push('[');
            out.push_str(name);
            out.push(']');
        }
    }
}

/// Resolves placeholders inside a POST body. Anything else in the body is
/// request data and passes through as written.
fn expand_payload(
    payload: &str,
    context: &TemplateContext<'_>,
    normalize: &mut NormalizeFlags,
) -> String {
    let mut expanded = String::with_capacity(payload.len());
    for segment in tokenize(payload) {
        match segment {
            Segment::Literal(text) => expanded.push_str(text),
            Segment::Placeholder(name) => push_placeholder(&mut expanded, name, context, normalize),
            Segment::Post(body) => {
                expanded.push_str(POST_OPEN);
                expanded.push_str(body);
                expanded.push_str(POST_CLOSE);
            }
            Segment::Strip(pattern) => {
                expanded.push_str(STRIP_OPEN);
                expanded.push_str(pattern);
                expanded.push(']');
            }
            Segment::Env { key, value } => {
                expanded.push_str(ENV_OPEN);
                expanded.push_str(key);
                expanded.push('=');
                expanded.push_str(value);
                expanded.push(']');
            }
        }
    }
    expanded
}

pub fn post_environment(payload: &str, fixture: &str) -> Vec<(String, String)> {
    let content_type = if payload.starts_with('<') {
        "text/xml"
    } else {
        "application/x-www-form-urlencoded"
    };
    vec![
        ("CONTENT_LENGTH".to_string(), payload.len().to_string()),
        ("REQUEST_METHOD".to_string(), "POST".to_string()),
        ("CONTENT_TYPE".to_string(), content_type.to_string()),
        ("MS_MAPFILE".to_string(), fixture.to_string()),
    ]
}

/// Output file name once a renderer override is applied: vector formats
/// replace the extension, anything else is inserted before it.
pub fn result_output_name(output_name: &str, renderer_override: Option<&str>) -> String {
    let Some(renderer) = renderer_override else {
        return output_name.to_string();
    };

    let path = Path::new(output_name);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| output_name.to_string());
    let extension = path
        .extension()
        .map(|extension| format!(".{}", extension.to_string_lossy()))
        .unwrap_or_default();

    if VECTOR_FORMAT_OVERRIDES.contains(&renderer) {
        format!("{}.{}", stem, renderer)
    } else {
        format!("{}.{}{}", stem, renderer, extension)
    }
}
