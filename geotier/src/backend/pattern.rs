//! Redis-style glob matching for `KEYS` and pattern invalidation

/// Match `text` against a glob pattern.
///
/// Supports `*`, `?`, character classes (`[abc]`, `[a-z]`, `[^x]` / `[!x]`)
/// and `\` escapes. An unterminated `[` matches itself.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => match match_class(&p, pi, t[ti]) {
                    Some((true, next)) => {
                        pi = next;
                        ti += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    None if t[ti] == '[' => {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                    None => {}
                },
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Evaluate the class starting at `p[start] == '['` against `ch`.
///
/// Returns whether it matched and the index after the closing `]`, or `None`
/// if the class is unterminated.
fn match_class(p: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = matches!(p.get(i), Some('^') | Some('!'));
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    loop {
        let c = *p.get(i)?;
        if c == ']' && !first {
            break;
        }
        first = false;

        let lo = if c == '\\' {
            i += 1;
            *p.get(i)?
        } else {
            c
        };

        if p.get(i + 1) == Some(&'-') && p.get(i + 2).is_some_and(|c| *c != ']') {
            let mut hi_i = i + 2;
            let hi = if p[hi_i] == '\\' {
                hi_i += 1;
                *p.get(hi_i)?
            } else {
                p[hi_i]
            };
            if lo <= ch && ch <= hi {
                matched = true;
            }
            i = hi_i + 1;
        } else {
            if lo == ch {
                matched = true;
            }
            i += 1;
        }
    }

    Some((matched != negate, i + 1))
}

/// Longest prefix of `pattern` without glob metacharacters
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '[', '\\'])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Escape glob metacharacters so `text` only matches itself
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
