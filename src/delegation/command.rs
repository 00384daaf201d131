//! Provider command construction from argv templates.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

const PLACEHOLDERS: &[&str] = &["model", "prompt", "files"];
const FILES_ELEMENT: &str = "{files}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("command template is empty")]
    Empty,

    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Check that a template names a program and only uses known placeholders.
pub fn validate_template(template: &[String]) -> Result<(), TemplateError> {
    match template.first() {
        None => return Err(TemplateError::Empty),
        Some(program) if program.trim().is_empty() => return Err(TemplateError::Empty),
        Some(_) => {}
    }
    for element in template {
        for caps in placeholder_regex().captures_iter(element) {
            let name = &caps[1];
            if !PLACEHOLDERS.contains(&name) {
                return Err(TemplateError::UnknownPlaceholder(name.to_string()));
            }
        }
    }
    Ok(())
}

/// Expand a template into argv.
///
/// An element that is exactly `{files}` becomes one argument per file (none
/// when there are no files). Elsewhere `{files}` is the space-joined list.
/// Substitution is a single pass, so placeholder text inside the prompt is
/// passed through literally.
pub fn build_command(
    template: &[String],
    model: &str,
    prompt: &str,
    files: &[String],
) -> Result<Vec<String>, TemplateError> {
    validate_template(template)?;

    let joined_files = files.join(" ");
    let mut argv = Vec::with_capacity(template.len() + files.len());

    for element in template {
        if element == FILES_ELEMENT {
            argv.extend(files.iter().cloned());
            continue;
        }
        let expanded = placeholder_regex().replace_all(element, |caps: &Captures<'_>| {
            match &caps[1] {
                "model" => model.to_string(),
                "prompt" => prompt.to_string(),
                "files" => joined_files.clone(),
                other => format!("{{{}}}", other),
            }
        });
        argv.push(expanded.into_owned());
    }

    Ok(argv)
}

/// File arguments for the provider: glob patterns are expanded to the paths
/// they match, other entries are passed through unchanged.
pub fn expand_file_args(files: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(files.len());
    for input in files {
        if !input.contains(['*', '?', '[']) {
            args.push(input.clone());
            continue;
        }
        match glob::glob(input) {
            Ok(paths) => args.extend(
                paths
                    .flatten()
                    .map(|path| path.to_string_lossy().into_owned()),
            ),
            Err(_) => args.push(input.clone()),
        }
    }
    args
}
