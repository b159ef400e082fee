//! Wildcard queue-name matching.
//!
//! `*` stands for one or more ASCII letters; every other character matches
//! itself, ignoring ASCII case. Patterns are anchored at both ends.

pub const WILDCARD: char = '*';

pub fn is_pattern(name: &str) -> bool {
    name.contains(WILDCARD)
}

pub fn matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_from(&pattern, &name)
}

fn match_from(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&WILDCARD, rest)) => {
            let run = name.iter().take_while(|c| c.is_ascii_alphabetic()).count();
            (1..=run).rev().any(|taken| match_from(rest, &name[taken..]))
        }
        Some((expected, rest)) => match name.split_first() {
            Some((actual, tail)) => actual.eq_ignore_ascii_case(expected) && match_from(rest, tail),
            None => false,
        },
    }
}
