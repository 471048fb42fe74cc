//! Glob pattern compiler used for tag and repository selection
//!
//! Syntax follows shell-style path matching:
//!
//! - `*` matches any run of characters except `/`
//! - `?` matches a single character except `/`
//! - `[abc]`, `[a-z]` match one character from the class, `[^...]` or `[!...]` negate it
//! - `\x` matches `x` literally

use crate::error::{ReplicationError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnySequence,
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl Token {
    fn matches_char(&self, ch: char) -> bool {
        match self {
            Token::Literal(expected) => *expected == ch,
            Token::AnyChar => ch != '/',
            Token::AnySequence => false,
            Token::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| *lo <= ch && ch <= *hi) != *negated
            }
        }
    }
}

/// A compiled include or exclude rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPattern {
    source: String,
    tokens: Vec<Token>,
}

impl TagPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            ReplicationError::Configuration(format!("Invalid pattern '{}': {}", pattern, reason))
        };

        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if tokens.last() != Some(&Token::AnySequence) {
                        tokens.push(Token::AnySequence);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                    tokens.push(Token::Literal(escaped));
                }
                '[' => {
                    let negated = matches!(chars.peek(), Some('^') | Some('!'));
                    if negated {
                        chars.next();
                    }

                    let mut ranges = Vec::new();
                    loop {
                        let c = chars.next().ok_or_else(|| invalid("unterminated class"))?;
                        if c == ']' {
                            if ranges.is_empty() {
                                return Err(invalid("empty class"));
                            }
                            break;
                        }

                        let lo = if c == '\\' {
                            chars.next().ok_or_else(|| invalid("trailing escape"))?
                        } else {
                            c
                        };

                        let hi = if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                Some('\\') => {
                                    chars.next().ok_or_else(|| invalid("trailing escape"))?
                                }
                                Some(']') | None => return Err(invalid("unterminated range")),
                                Some(hi) => hi,
                            }
                        } else {
                            lo
                        };

                        if lo > hi {
                            return Err(invalid("reversed range"));
                        }
                        ranges.push((lo, hi));
                    }

                    tokens.push(Token::Class { negated, ranges });
                }
                c => tokens.push(Token::Literal(c)),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `name` matches the whole pattern
    pub fn matches(&self, name: &str) -> bool {
        let text: Vec<char> = name.chars().collect();
        let tokens = &self.tokens;

        let (mut t, mut p) = (0usize, 0usize);
        // Resume point for the most recent `*`: (token after star, text position)
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            if let Some(token) = tokens.get(p) {
                if *token == Token::AnySequence {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                if token.matches_char(text[t]) {
                    p += 1;
                    t += 1;
                    continue;
                }
            }

            match star {
                Some((after_star, consumed)) if text[consumed] != '/' => {
                    star = Some((after_star, consumed + 1));
                    p = after_star;
                    t = consumed + 1;
                }
                _ => return false,
            }
        }

        tokens[p..].iter().all(|token| *token == Token::AnySequence)
    }
}
