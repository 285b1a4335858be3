//! The `{kind:name}` placeholder mini-language used in command templates.
//!
//! Placeholders bind a process's ports into its shell command: `{i:x}` is an
//! input port, `{o:y}` an output port (substituted with the temp path so the
//! rename to the final path is the commit boundary), `{os:y}` a streaming
//! output (substituted with the FIFO path), and `{p:z}` a scalar parameter.

use crate::error::TaskError;
use crate::ip::Ip;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(o|os|i|is|p):([^{}:]+)\}").expect("placeholder regex is valid"));

/// Kind tag of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// `{o:name}` — output port, substituted with the temp path
    Output,
    /// `{os:name}` — streaming output port, substituted with the FIFO path
    StreamingOutput,
    /// `{i:name}` — input port, substituted with the final path (or the
    /// FIFO path when the incoming packet streams)
    Input,
    /// `{is:name}` — accepted as an alias of `{i:name}`
    StreamingInput,
    /// `{p:name}` — parameter port, substituted with the parameter value
    Param,
}

impl PlaceholderKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "o" => Some(Self::Output),
            "os" => Some(Self::StreamingOutput),
            "i" => Some(Self::Input),
            "is" => Some(Self::StreamingInput),
            "p" => Some(Self::Param),
            _ => None,
        }
    }

    /// Whether the placeholder declares an output port on the process.
    pub fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::StreamingOutput)
    }

    /// Whether the placeholder declares an input port on the process.
    pub fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::StreamingInput)
    }
}

/// One parsed `{kind:name}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub name: String,
}

/// Extract every placeholder from a command template, in order of
/// appearance. Text outside placeholders is left for the shell.
pub fn parse_placeholders(pattern: &str) -> Vec<Placeholder> {
    PLACEHOLDER_RE
        .captures_iter(pattern)
        .filter_map(|caps| {
            // The alternation in the regex restricts the tag set.
            PlaceholderKind::from_tag(&caps[1]).map(|kind| Placeholder {
                kind,
                name: caps[2].to_string(),
            })
        })
        .collect()
}

/// Replace `{p:name}` placeholders that have a literal value with that
/// value, leaving every other placeholder in place.
///
/// Used when parameter values are supplied at process construction instead
/// of over a parameter port; the expanded pattern then declares no port for
/// them.
pub fn expand_params(pattern: &str, params: &HashMap<String, String>) -> String {
    let mut cmd = pattern.to_string();
    for caps in PLACEHOLDER_RE.captures_iter(pattern) {
        if &caps[1] == "p" {
            if let Some(value) = params.get(&caps[2]) {
                cmd = cmd.replace(&caps[0], value);
            }
        }
    }
    cmd
}

/// Substitute every placeholder in `pattern` against the given bindings and
/// return the runnable command string.
///
/// A placeholder with no binding, an input packet with an empty path, and a
/// substitution that resolves to the empty string are all hard errors naming
/// the placeholder and the command.
pub fn format_command(
    pattern: &str,
    in_ips: &HashMap<String, Ip>,
    out_ips: &HashMap<String, Ip>,
    params: &HashMap<String, String>,
    prepend: &str,
) -> Result<String, TaskError> {
    let mut cmd = pattern.to_string();
    for caps in PLACEHOLDER_RE.captures_iter(pattern) {
        let whole = caps[0].to_string();
        let name = &caps[2];
        let missing = || TaskError::MissingBinding {
            placeholder: whole.clone(),
            command: pattern.to_string(),
        };
        let kind = PlaceholderKind::from_tag(&caps[1]).ok_or_else(missing)?;
        let replacement = match kind {
            PlaceholderKind::Output => out_ips.get(name).ok_or_else(missing)?.temp_path(),
            PlaceholderKind::StreamingOutput => out_ips.get(name).ok_or_else(missing)?.fifo_path(),
            PlaceholderKind::Input | PlaceholderKind::StreamingInput => {
                let ip = in_ips.get(name).ok_or_else(missing)?;
                if ip.path().is_empty() {
                    return Err(missing());
                }
                if ip.is_streaming() {
                    ip.fifo_path()
                } else {
                    ip.path().to_string()
                }
            }
            PlaceholderKind::Param => params.get(name).cloned().ok_or_else(missing)?,
        };
        if replacement.is_empty() {
            return Err(TaskError::EmptySubstitution {
                placeholder: whole,
                command: pattern.to_string(),
            });
        }
        cmd = cmd.replace(&whole, &replacement);
    }
    if prepend.is_empty() {
        Ok(cmd)
    } else {
        Ok(format!("{} {}", prepend, cmd))
    }
}
