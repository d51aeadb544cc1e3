//! Keyword-group match filter over the projected list.

use regex::Regex;

/// How a single search group is applied to a line. The variant is selected
/// by the group's first rune: `=` compiles the remainder as a regex, `!`
/// inverts a substring test, anything else is a case-insensitive substring.
#[derive(Clone, Debug)]
enum Pattern {
    Substring,
    Inverse,
    Regex(Box<Regex>),
}

#[derive(Clone, Debug)]
pub struct MatchGroup {
    pattern: Pattern,
    lowered: String,
}

impl MatchGroup {
    pub fn new(raw: &str) -> Self {
        let mut chars = raw.chars();
        match chars.next() {
            Some('=') => {
                let rest: String = chars.collect();
                match Regex::new(&rest) {
                    Ok(re) => Self {
                        pattern: Pattern::Regex(Box::new(re)),
                        lowered: rest.to_lowercase(),
                    },
                    // An unfinished regex degrades to a substring search so
                    // typing `=foo[` does not blank the view.
                    Err(_) => Self {
                        pattern: Pattern::Substring,
                        lowered: rest.to_lowercase(),
                    },
                }
            }
            Some('!') => Self {
                pattern: Pattern::Inverse,
                lowered: chars.collect::<String>().to_lowercase(),
            },
            _ => Self {
                pattern: Pattern::Substring,
                lowered: raw.to_lowercase(),
            },
        }
    }

    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Vec<MatchGroup> {
        raw.iter().map(|g| MatchGroup::new(g.as_ref())).collect()
    }

    pub fn matches(&self, line: &str) -> bool {
        match &self.pattern {
            Pattern::Substring => {
                self.lowered.is_empty() || line.to_lowercase().contains(&self.lowered)
            }
            Pattern::Inverse => {
                self.lowered.is_empty() || !line.to_lowercase().contains(&self.lowered)
            }
            Pattern::Regex(re) => re.is_match(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_is_case_insensitive() {
        let g = MatchGroup::new("milk");
        assert!(g.matches("Buy MILK today"));
        assert!(!g.matches("buy bread"));
    }

    #[test]
    fn inverse_prefix_negates() {
        let g = MatchGroup::new("!milk");
        assert!(!g.matches("buy milk"));
        assert!(g.matches("buy bread"));
    }

    #[test]
    fn regex_prefix_compiles() {
        let g = MatchGroup::new("=^buy [a-z]+$");
        assert!(g.matches("buy milk"));
        assert!(!g.matches("please buy milk"));
    }

    #[test]
    fn broken_regex_degrades_to_substring() {
        let g = MatchGroup::new("=milk[");
        assert!(g.matches("milk[ shelf"));
        assert!(!g.matches("milk shelf"));
    }

    #[test]
    fn empty_group_matches_everything() {
        let g = MatchGroup::new("");
        assert!(g.matches("anything"));
        assert!(g.matches(""));
    }
}
