//! Quote-aware splitting of wire commands.
//!
//! Tokens are separated by whitespace; single- and double-quoted segments
//! preserve whitespace, and each quote kind may appear literally inside
//! the other (`"it's"` is one token containing an apostrophe). Adjacent
//! quoted segments concatenate into one token, shell-style.

/// Split one command line into its whitespace-separated, quote-respecting
/// tokens.
pub fn split_command(input: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    // A quoted token stays a token even when its content is empty ("").
    let mut current_started = false;
    let mut in_single = false;
    let mut in_double = false;

    for ch in input.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                current_started = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                current_started = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if current_started || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    current_started = false;
                }
            }
            c => {
                current.push(c);
                current_started = true;
            }
        }
    }

    if current_started || !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_split() {
        assert_eq!(split_command("PUT k v"), vec!["PUT", "k", "v"]);
    }

    #[test]
    fn test_collapses_repeated_whitespace() {
        assert_eq!(split_command("  GET\t\tk  "), vec!["GET", "k"]);
    }

    #[test]
    fn test_double_quotes_preserve_spaces() {
        assert_eq!(
            split_command(r#"PUT k "hello world""#),
            vec!["PUT", "k", "hello world"]
        );
    }

    #[test]
    fn test_single_quotes_preserve_spaces() {
        assert_eq!(
            split_command("SCAN '$key LIKE user_%'"),
            vec!["SCAN", "$key LIKE user_%"]
        );
    }

    #[test]
    fn test_opposite_quote_nests() {
        assert_eq!(split_command(r#""it's fine""#), vec!["it's fine"]);
        assert_eq!(split_command(r#"'say "hi"'"#), vec![r#"say "hi""#]);
    }

    #[test]
    fn test_adjacent_quoted_segments_concatenate() {
        assert_eq!(split_command(r#"'a b'"c d""#), vec!["a bc d"]);
    }

    #[test]
    fn test_empty_quoted_token() {
        assert_eq!(split_command(r#"PUT k """#), vec!["PUT", "k", ""]);
    }

    #[test]
    fn test_empty_input() {
        assert!(split_command("").is_empty());
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_condition_with_comparison() {
        assert_eq!(
            split_command(r#"COUNT "$value > 50" 7"#),
            vec!["COUNT", "$value > 50", "7"]
        );
    }
}
