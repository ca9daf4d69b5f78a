//! Placeholder substitution for image references and entrypoint commands.
//!
//! Templates use single-brace placeholders such as `python:{version}-slim`
//! or `python {exec_file}`. Only the variables known to each resolver are
//! accepted; anything else is rejected as a malformed template.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::SandboxError;

/// Number of tokens an entrypoint template must have.
pub const ENTRYPOINT_TOKENS: usize = 3;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid"))
}

/// Renders `template`, substituting every `{name}` with `vars[name]`.
fn render(template: &str, vars: &HashMap<&str, &str>) -> Result<String, SandboxError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &template[last..whole.start()];
        check_literal(template, literal)?;
        out.push_str(literal);

        let name = name.as_str().trim();
        let value = vars.get(name).ok_or_else(|| {
            let mut known: Vec<_> = vars.keys().copied().collect();
            known.sort_unstable();
            SandboxError::Template(format!(
                "unknown placeholder '{{{name}}}' in '{template}' (expected one of: {})",
                known.join(", ")
            ))
        })?;
        out.push_str(value);
        last = whole.end();
    }

    let tail = &template[last..];
    check_literal(template, tail)?;
    out.push_str(tail);
    Ok(out)
}

fn check_literal(template: &str, literal: &str) -> Result<(), SandboxError> {
    if literal.contains('{') || literal.contains('}') {
        return Err(SandboxError::Template(format!(
            "unbalanced brace in template '{template}'"
        )));
    }
    Ok(())
}

/// Resolves an image template such as `python:{version}-slim`.
pub fn resolve_image(template: &str, language: &str, version: &str) -> Result<String, SandboxError> {
    let vars = HashMap::from([("language", language), ("version", version)]);
    let image = render(template, &vars)?;
    if image.trim().is_empty() {
        return Err(SandboxError::Template(format!(
            "image template '{template}' resolved to an empty reference"
        )));
    }
    Ok(image)
}

/// Resolves a 3-token entrypoint template into the command run inside the
/// container.
///
/// `{exec_file}` becomes the absolute path of the source file and `{path}`
/// the workspace directory.
pub fn resolve_command(
    entrypoint: &[String],
    workspace_dir: &Path,
    exec_file: &Path,
) -> Result<Vec<String>, SandboxError> {
    check_entrypoint_len(entrypoint)?;

    let path = workspace_dir.to_string_lossy();
    let file = exec_file.to_string_lossy();
    let vars = HashMap::from([("exec_file", &*file), ("path", &*path)]);

    entrypoint.iter().map(|token| render(token, &vars)).collect()
}

/// Rejects entrypoints that do not have exactly three tokens.
pub fn check_entrypoint_len(entrypoint: &[String]) -> Result<(), SandboxError> {
    if entrypoint.len() != ENTRYPOINT_TOKENS {
        return Err(SandboxError::Configuration(format!(
            "entrypoint must have exactly {ENTRYPOINT_TOKENS} tokens (interpreter, flag, command), got {}: {:?}",
            entrypoint.len(),
            entrypoint
        )));
    }
    Ok(())
}
