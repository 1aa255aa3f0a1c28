//! Site-placement guidance files. A previous run (or a hand of the user)
//! writes sections of `<site-id> <numa-node>` pairs; the router binds each
//! listed site's arena to the named node from its very first allocation.
//!
//! ```text
//! ===== GUIDANCE =====
//! 12 1
//! 74 0
//! ===== END =====
//! ```

use std::io::BufRead;

use crate::error::ConfigError;

const SECTION_START: &str = "===== GUIDANCE";
const SECTION_END: &str = "===== END";

/// Parses every guidance section in the input. Blank lines and `#`
/// comments are ignored; multiple sections accumulate.
pub fn parse(reader: impl BufRead) -> Result<Vec<(u32, u32)>, ConfigError> {
    let mut pairs = Vec::new();
    let mut in_section = false;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ConfigError::Guidance(e.to_string()))?;
        let line = line.trim();

        if !in_section {
            if line.starts_with(SECTION_START) {
                in_section = true;
            }
            continue;
        }
        if line.starts_with(SECTION_END) {
            in_section = false;
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut toks = line.split_whitespace();
        let site = toks.next().and_then(|t| t.parse().ok());
        let node = toks.next().and_then(|t| t.parse().ok());
        match (site, node) {
            (Some(site), Some(node)) => pairs.push((site, node)),
            _ => {
                return Err(ConfigError::Guidance(format!(
                    "line {}: expected \"<site> <node>\", got {line:?}",
                    lineno + 1
                )))
            }
        }
    }

    if in_section {
        return Err(ConfigError::Guidance("unterminated section".into()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn single_section() {
        let text = "preamble to ignore\n\
                    ===== GUIDANCE =====\n\
                    12 1\n\
                    74 0\n\
                    ===== END =====\n\
                    trailing junk\n";
        assert_eq!(parse(Cursor::new(text)).unwrap(), vec![(12, 1), (74, 0)]);
    }

    #[test]
    fn comments_blanks_and_multiple_sections() {
        let text = "===== GUIDANCE =====\n\
                    # hot sites\n\
                    \n\
                    3 0\n\
                    ===== END =====\n\
                    ===== GUIDANCE (second pass) =====\n\
                    9 1\n\
                    ===== END =====\n";
        assert_eq!(parse(Cursor::new(text)).unwrap(), vec![(3, 0), (9, 1)]);
    }

    #[test]
    fn text_outside_sections_is_ignored() {
        let text = "5 5\n8 8\n";
        assert_eq!(parse(Cursor::new(text)).unwrap(), vec![]);
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        let text = "===== GUIDANCE =====\nnot numbers\n===== END =====\n";
        assert!(parse(Cursor::new(text)).is_err());

        let text = "===== GUIDANCE =====\n1 2\n";
        assert!(parse(Cursor::new(text)).is_err());
    }
}
