use std::path::{Path, PathBuf};

use crate::error::EncodeError;

pub const INPUT_PLACEHOLDER: &str = "%%INPUT%%";
pub const OUTPUT_PLACEHOLDER: &str = "%%OUTPUT%%";

/// Check that a manual command template names both the input and the output.
pub fn validate_template(template: &str) -> Result<(), EncodeError> {
    for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
        if !template.contains(placeholder) {
            return Err(EncodeError::Template(format!(
                "manual command is missing {}",
                placeholder
            )));
        }
    }
    Ok(())
}

/// Substitute the quoted absolute paths into `template`, split it into arguments and
/// force the first one to the resolved encoder, whatever the template said.
pub(crate) fn instantiate(
    template: &str,
    source: &Path,
    output: &Path,
    encoder: &Path,
) -> Result<Vec<String>, EncodeError> {
    validate_template(template)?;

    let rendered = template
        .replace(INPUT_PLACEHOLDER, &quoted(&absolute(source)))
        .replace(OUTPUT_PLACEHOLDER, &quoted(&absolute(output)));

    let mut argv = tokenize(&rendered);
    match argv.first_mut() {
        Some(program) => *program = encoder.to_string_lossy().into_owned(),
        None => return Err(EncodeError::Template("manual command is empty".into())),
    }
    Ok(argv)
}

/// Split on whitespace outside double quotes. Each `"` toggles quoting and is dropped;
/// escaped quotes are not supported.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;

    for ch in command.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}

/// Turn a synthesized argument vector into an editable template: the input and output
/// arguments become bare placeholders, arguments containing whitespace are quoted.
pub fn render_template(argv: &[String], input: &Path, output: &Path) -> String {
    let input = input.to_string_lossy();
    let output = output.to_string_lossy();

    argv.iter()
        .map(|arg| {
            if *arg == input {
                INPUT_PLACEHOLDER.to_string()
            } else if *arg == output {
                OUTPUT_PLACEHOLDER.to_string()
            } else if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                quoted(arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value)
}

fn absolute(path: &Path) -> String {
    let path: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    path.to_string_lossy().into_owned()
}
