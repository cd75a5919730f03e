// Utility Functions
// Shell quoting and `${VAR}` expansion shared by step rendering and runners

use std::collections::BTreeMap;

/// Quote a word for POSIX `sh`.
///
/// Words made only of characters the shell never interprets are returned
/// unchanged so rendered command lines stay readable; anything else is
/// wrapped in single quotes.
pub fn shell_quote(word: &str) -> String {
    let is_plain = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '+' | '@' | '%')
        });

    if is_plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join words into a single shell command line, quoting each one
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand `${NAME}` references against the given environment.
///
/// Only the braced form is expanded; a bare `$NAME` is left for the shell.
/// References to names missing from `env` are kept verbatim so that a shell
/// running the result can still resolve them.
pub fn expand_vars(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) if is_var_name(&after[..end]) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push_str("${");
                        output.push_str(name);
                        output.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                output.push_str("${");
                rest = after;
            }
        }
    }

    output.push_str(rest);
    output
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check that an environment variable name is usable with `env NAME=VALUE`
pub fn is_env_name(name: &str) -> bool {
    is_var_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_shell_quote_plain_words() {
        assert_eq!(shell_quote("firedrake-install"), "firedrake-install");
        assert_eq!(shell_quote("/home/firedrake"), "/home/firedrake");
        assert_eq!(shell_quote("PATH=/usr/bin:/bin"), "PATH=/usr/bin:/bin");
    }

    #[test]
    fn test_shell_quote_special_words() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(
            shell_join(["python3", "install script.py", "--minimal"]),
            "python3 'install script.py' --minimal"
        );
    }

    #[test]
    fn test_expand_known_vars() {
        let env = env(&[("HOME_DIR", "/home/firedrake"), ("PACKAGE", "firedrake")]);
        assert_eq!(
            expand_vars("${HOME_DIR}/${PACKAGE}/bin", &env),
            "/home/firedrake/firedrake/bin"
        );
    }

    #[test]
    fn test_expand_keeps_unknown_and_bare_vars() {
        let env = env(&[("A", "1")]);
        assert_eq!(expand_vars("${MISSING}:$A:${A}", &env), "${MISSING}:$A:1");
    }

    #[test]
    fn test_expand_malformed_references() {
        let env = env(&[("A", "1")]);
        assert_eq!(expand_vars("${not valid} ${A", &env), "${not valid} ${A");
        assert_eq!(expand_vars("cost: $5 ${A}", &env), "cost: $5 1");
    }

    #[test]
    fn test_is_env_name() {
        assert!(is_env_name("PATH"));
        assert!(is_env_name("_private1"));
        assert!(!is_env_name("1ABC"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
    }
}
