//! Extraction of `REQUIRES:` and `RUN_PARMS:` directives from fixture text.
//!
//! Parsing is permissive: a marker with nothing after it contributes nothing,
//! and no line is ever rejected. Fixture corpora contain incidental text that
//! looks like a marker and must keep loading.

use std::fs;
use std::path::Path;

pub const REQUIRES_MARKER: &str = "REQUIRES:";
pub const RUN_PARMS_MARKER: &str = "RUN_PARMS:";
pub const DEFAULT_COMMAND_TEMPLATE: &str = "[SHP2IMG] [RENDERER] -m [MAPFILE] -o [RESULT]";
pub const DEFAULT_OUTPUT_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParam {
    pub output_name: String,
    pub command_template: String,
}

impl RunParam {
    pub fn new(output_name: impl Into<String>, command_template: impl Into<String>) -> Self {
        Self {
            output_name: output_name.into(),
            command_template: command_template.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Directive {
    pub requires: Vec<String>,
    pub run_params: Vec<RunParam>,
}

pub fn parse_directives(fixture_name: &str, source: &str) -> Directive {
    let mut directive = Directive::default();

    for line in source.lines() {
        if let Some(rest) = text_after_marker(line, REQUIRES_MARKER) {
            directive
                .requires
                .extend(rest.split_whitespace().map(str::to_string));
        }

        if let Some(rest) = text_after_marker(line, RUN_PARMS_MARKER)
            && let Some(run_param) = parse_run_param(rest)
        {
            directive.run_params.push(run_param);
        }
    }

    if directive.run_params.is_empty() {
        directive.run_params.push(RunParam::new(
            default_output_name(fixture_name),
            DEFAULT_COMMAND_TEMPLATE,
        ));
    }

    directive
}

/// Reads a fixture as UTF-8 (lossily) and parses its directives.
pub fn read_directives(fixture_path: &Path) -> std::io::Result<Directive> {
    let bytes = fs::read(fixture_path)?;
    let source = String::from_utf8_lossy(&bytes);
    let fixture_name = fixture_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parse_directives(&fixture_name, &source))
}

/// Capability tokens from a directory-level requirements file. Files using the
/// `REQUIRES:` marker are read like fixtures; otherwise every whitespace
/// separated token is a requirement.
pub fn parse_requirements_file(source: &str) -> Vec<String> {
    if source.contains(REQUIRES_MARKER) {
        return parse_directives("", source).requires;
    }
    source.split_whitespace().map(str::to_string).collect()
}

pub fn default_output_name(fixture_name: &str) -> String {
    let stem = Path::new(fixture_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.{}", stem, DEFAULT_OUTPUT_EXTENSION)
}

fn text_after_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker)
        .map(|offset| &line[offset + marker.len()..])
}

fn parse_run_param(rest: &str) -> Option<RunParam> {
    let rest = rest.trim_start();
    let (output_token, template) = match rest.split_once(char::is_whitespace) {
        Some((output, template)) => (output, template.trim()),
        None => (rest.trim_end(), ""),
    };
    if output_token.is_empty() {
        return None;
    }

    // Results always land directly under `result/`, whatever path the fixture names.
    let output_name = Path::new(output_token)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| output_token.to_string());

    let template = if template.is_empty() {
        DEFAULT_COMMAND_TEMPLATE
    } else {
        template
    };
    Some(RunParam::new(output_name, template))
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_COMMAND_TEMPLATE, RunParam, default_output_name, parse_directives,
        parse_requirements_file,
    };

    #[test]
    fn fixture_without_run_parms_gets_one_default_pair() {
        let directive = parse_directives("polygon_fill.map", "MAP\n  NAME test\nEND\n");
        assert_eq!(
            directive.run_params,
            vec![RunParam::new("polygon_fill.png", DEFAULT_COMMAND_TEMPLATE)]
        );
        assert!(directive.requires.is_empty());
    }

    #[test]
    fn requires_tokens_keep_order_and_duplicates() {
        let source = "# REQUIRES: INPUT=GDAL OUTPUT=PNG\n#REQUIRES: SUPPORTS=WMS OUTPUT=PNG\n";
        let directive = parse_directives("wms.map", source);
        assert_eq!(
            directive.requires,
            vec!["INPUT=GDAL", "OUTPUT=PNG", "SUPPORTS=WMS", "OUTPUT=PNG"]
        );
    }

    #[test]
    fn run_parms_split_into_output_and_template() {
        let source = "\
# RUN_PARMS: wms_caps.xml [MAPSERV] QUERY_STRING=\"map=[MAPFILE]&SERVICE=WMS\" > [RESULT_DEVERSION]   \n\
# RUN_PARMS: plain.png\n";
        let directive = parse_directives("wms.map", source);
        assert_eq!(directive.run_params.len(), 2);
        assert_eq!(directive.run_params[0].output_name, "wms_caps.xml");
        assert_eq!(
            directive.run_params[0].command_template,
            "[MAPSERV] QUERY_STRING=\"map=[MAPFILE]&SERVICE=WMS\" > [RESULT_DEVERSION]"
        );
        assert_eq!(directive.run_params[1].output_name, "plain.png");
        assert_eq!(
            directive.run_params[1].command_template,
            DEFAULT_COMMAND_TEMPLATE
        );
    }

    #[test]
    fn empty_markers_contribute_nothing() {
        let source = "# RUN_PARMS:   \n# REQUIRES:\n";
        let directive = parse_directives("empty.map", source);
        assert!(directive.requires.is_empty());
        assert_eq!(directive.run_params.len(), 1);
        assert_eq!(directive.run_params[0].output_name, "empty.png");
    }

    #[test]
    fn output_names_are_reduced_to_base_names() {
        let directive = parse_directives("x.map", "# RUN_PARMS: sub/dir/out.png\n");
        assert_eq!(directive.run_params[0].output_name, "out.png");
    }

    #[test]
    fn default_output_name_replaces_extension() {
        assert_eq!(default_output_name("label_ttf.map"), "label_ttf.png");
        assert_eq!(default_output_name("noext"), "noext.png");
    }

    #[test]
    fn requirements_file_accepts_marker_or_bare_tokens() {
        assert_eq!(
            parse_requirements_file("REQUIRES: SUPPORTS=PROJ INPUT=OGR\n"),
            vec!["SUPPORTS=PROJ", "INPUT=OGR"]
        );
        assert_eq!(
            parse_requirements_file("SUPPORTS=WMS_SERVER\nOUTPUT=PNG\n"),
            vec!["SUPPORTS=WMS_SERVER", "OUTPUT=PNG"]
        );
    }
}
