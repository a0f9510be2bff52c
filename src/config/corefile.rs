// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Corefile tokenizer.
//!
//! Deliberately minimal: this crate owns the brace-block grammar
//! (`KEY [KEY...] { DIRECTIVE... }`) and a handful of reserved directives
//! consumed by the core; plugin-specific directive semantics are opaque
//! argument lists handed to the plugin's setup routine, since the wider
//! plugin ecosystem a Corefile can reference is out of scope here.

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct RawDirective {
    pub name: String,
    pub args: Vec<String>,
    pub line: usize,
    pub sub_block: Vec<RawDirective>,
}

#[derive(Debug, Clone)]
pub struct RawServerBlock {
    pub keys: Vec<String>,
    pub directives: Vec<RawDirective>,
    pub line: usize,
}

/// Tokenize and parse a full Corefile into its server blocks.
pub fn parse(source: &str) -> Result<Vec<RawServerBlock>, ConfigError> {
    let tokens = tokenize(source)?;
    let mut cursor = Cursor {
        tokens: &tokens,
        pos: 0,
    };
    let mut blocks = Vec::new();
    while cursor.peek().is_some() {
        blocks.push(parse_block(&mut cursor)?);
    }
    Ok(blocks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    LBrace,
    RBrace,
    /// Line terminator; directives within a block are newline-separated.
    Newline,
}

struct Positioned {
    token: Token,
    line: usize,
}

fn tokenize(source: &str) -> Result<Vec<Positioned>, ConfigError> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let mut chars = raw_line.char_indices().peekable();
        let mut word = String::new();

        macro_rules! flush_word {
            () => {
                if !word.is_empty() {
                    tokens.push(Positioned {
                        token: Token::Word(std::mem::take(&mut word)),
                        line: line_no,
                    });
                }
            };
        }

        while let Some((_, c)) = chars.next() {
            match c {
                '#' => break, // rest of line is a comment
                '"' | '\'' => {
                    let quote = c;
                    let mut literal = String::new();
                    for (_, c2) in chars.by_ref() {
                        if c2 == quote {
                            break;
                        }
                        literal.push(c2);
                    }
                    word.push_str(&literal);
                }
                '{' => {
                    flush_word!();
                    tokens.push(Positioned {
                        token: Token::LBrace,
                        line: line_no,
                    });
                }
                '}' => {
                    flush_word!();
                    tokens.push(Positioned {
                        token: Token::RBrace,
                        line: line_no,
                    });
                }
                c if c.is_whitespace() => flush_word!(),
                c => word.push(c),
            }
        }
        flush_word!();
        tokens.push(Positioned {
            token: Token::Newline,
            line: line_no,
        });
    }
    Ok(tokens)
}

struct Cursor<'a> {
    tokens: &'a [Positioned],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&mut self) -> Option<&Token> {
        self.skip_blank_lines();
        self.tokens.get(self.pos).map(|p| &p.token)
    }

    fn skip_blank_lines(&mut self) {
        while matches!(self.tokens.get(self.pos).map(|p| &p.token), Some(Token::Newline)) {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Option<&Positioned> {
        self.skip_blank_lines();
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn current_line(&self) -> usize {
        self.tokens.get(self.pos).map(|p| p.line).unwrap_or(0)
    }
}

fn parse_block(cursor: &mut Cursor<'_>) -> Result<RawServerBlock, ConfigError> {
    let line = cursor.current_line();
    let mut keys = Vec::new();
    loop {
        match cursor.peek() {
            Some(Token::Word(_)) => {
                let Some(Positioned {
                    token: Token::Word(w),
                    ..
                }) = cursor.next()
                else {
                    unreachable!()
                };
                keys.push(w.clone());
            }
            Some(Token::LBrace) => break,
            other => {
                return Err(ConfigError::Syntax {
                    line: cursor.current_line(),
                    message: format!("expected zone key or '{{', found {other:?}"),
                })
            }
        }
    }
    if keys.is_empty() {
        return Err(ConfigError::Syntax {
            line,
            message: "server block has no keys".to_string(),
        });
    }
    cursor.next(); // consume '{'
    let directives = parse_directives(cursor)?;
    match cursor.next() {
        Some(Positioned {
            token: Token::RBrace,
            ..
        }) => {}
        other => {
            return Err(ConfigError::Syntax {
                line: cursor.current_line(),
                message: format!("expected closing '}}', found {other:?}"),
            })
        }
    }
    Ok(RawServerBlock {
        keys,
        directives,
        line,
    })
}

fn parse_directives(cursor: &mut Cursor<'_>) -> Result<Vec<RawDirective>, ConfigError> {
    let mut directives = Vec::new();
    loop {
        match cursor.peek() {
            Some(Token::RBrace) | None => break,
            Some(Token::Word(_)) => directives.push(parse_directive(cursor)?),
            other => {
                return Err(ConfigError::Syntax {
                    line: cursor.current_line(),
                    message: format!("unexpected token in directive list: {other:?}"),
                })
            }
        }
    }
    Ok(directives)
}

fn parse_directive(cursor: &mut Cursor<'_>) -> Result<RawDirective, ConfigError> {
    let line = cursor.current_line();
    let Some(Positioned {
        token: Token::Word(name),
        ..
    }) = cursor.next()
    else {
        unreachable!()
    };
    let mut args = Vec::new();
    loop {
        match cursor.tokens.get(cursor.pos).map(|p| &p.token) {
            Some(Token::Word(_)) => {
                let Some(Positioned {
                    token: Token::Word(w),
                    ..
                }) = cursor.next_raw()
                else {
                    unreachable!()
                };
                args.push(w.clone());
            }
            _ => break,
        }
    }
    let sub_block = if matches!(cursor.peek(), Some(Token::LBrace)) {
        cursor.next();
        let inner = parse_directives(cursor)?;
        match cursor.next() {
            Some(Positioned {
                token: Token::RBrace,
                ..
            }) => {}
            other => {
                return Err(ConfigError::Syntax {
                    line: cursor.current_line(),
                    message: format!("expected closing '}}' for {name:?} block, found {other:?}"),
                })
            }
        }
        inner
    } else {
        Vec::new()
    };

    Ok(RawDirective {
        name: name.clone(),
        args,
        line,
        sub_block,
    })
}

impl<'a> Cursor<'a> {
    /// Like `next`, but does not skip past a `Newline` — used for reading a
    /// directive's argument list, which ends at end-of-line (unlike
    /// `peek`/`next`, which treat newlines as pure whitespace between
    /// directives).
    fn next_raw(&mut self) -> Option<&Positioned> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_block_single_directive() {
        let blocks = parse("example.org:53 {\n  whoami\n}\n").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].keys, vec!["example.org:53"]);
        assert_eq!(blocks[0].directives.len(), 1);
        assert_eq!(blocks[0].directives[0].name, "whoami");
    }

    #[test]
    fn parses_multiple_keys_and_sub_block() {
        let src = "https://.:443 quic://.:853 {\n  tls cert.pem key.pem\n  quic {\n    max_streams 128\n  }\n}\n";
        let blocks = parse(src).unwrap();
        assert_eq!(blocks[0].keys, vec!["https://.:443", "quic://.:853"]);
        assert_eq!(blocks[0].directives[0].name, "tls");
        assert_eq!(blocks[0].directives[0].args, vec!["cert.pem", "key.pem"]);
        assert_eq!(blocks[0].directives[1].name, "quic");
        assert_eq!(blocks[0].directives[1].sub_block[0].name, "max_streams");
        assert_eq!(blocks[0].directives[1].sub_block[0].args, vec!["128"]);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let src = "# a comment\nexample.org {\n\n  whoami # trailing comment\n}\n";
        let blocks = parse(src).unwrap();
        assert_eq!(blocks[0].directives[0].name, "whoami");
        assert!(blocks[0].directives[0].args.is_empty());
    }

    #[test]
    fn unterminated_block_is_a_syntax_error() {
        assert!(parse("example.org {\n  whoami\n").is_err());
    }
}
