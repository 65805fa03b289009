// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wildcard matching used to recognise host names.

/// Matches `text` against `pattern`, ignoring case. `*` matches any run of characters
/// (including none) and `?` matches exactly one.
#[must_use]
pub fn wildcard_match_case_insensitive(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let text: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
    wildcard_match(&pattern, &text)
}

fn wildcard_match(pattern: &[char], text: &[char]) -> bool {
    if pattern == ['*'] {
        return true;
    }

    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it is currently matched up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
