//! Decoders for the two Valve key/value tree formats that PICS responses
//! are delivered in: the text format (app info) and the byte-tagged binary
//! format (package info).
//!
//! Neither decoder fails: malformed or truncated input yields whatever was
//! accumulated up to that point, and callers skip entities that are missing
//! the fields they need.

use std::collections::HashMap;

/// Node of a text VDF tree: nested blocks of `"key" "value"` pairs and
/// `"key" { ... }` sub-blocks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TextNode {
    pub attrs: HashMap<String, String>,
    pub children: HashMap<String, TextNode>,
}

impl TextNode {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn child(&self, key: &str) -> Option<&TextNode> {
        self.children.get(key)
    }
}

/// Parse a text VDF document into a single root node.
pub fn parse_text(input: &str) -> TextNode {
    let mut chars = input.chars().peekable();
    parse_text_block(&mut chars)
}

fn parse_text_block(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> TextNode {
    let mut node = TextNode::default();
    loop {
        let key = match next_token(chars) {
            Some(Token::Str(key)) => key,
            Some(Token::Close) | None => return node,
            // A stray '{' has no key to attach its block to; drop the block.
            Some(Token::Open) => {
                parse_text_block(chars);
                continue;
            }
        };
        match next_token(chars) {
            Some(Token::Str(value)) => {
                node.attrs.entry(key).or_insert(value);
            }
            Some(Token::Open) => {
                let child = parse_text_block(chars);
                node.children.entry(key).or_insert(child);
            }
            // Key without a value at end of input, or a block closed between
            // key and value: keep what we have.
            Some(Token::Close) | None => return node,
        }
    }
}

enum Token {
    Str(String),
    Open,
    Close,
}

fn next_token(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<Token> {
    loop {
        let c = *chars.peek()?;
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                return Some(Token::Open);
            }
            '}' => {
                chars.next();
                return Some(Token::Close);
            }
            '"' => {
                chars.next();
                let mut out = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some('n') => out.push('\n'),
                            Some('t') => out.push('\t'),
                            Some(other) => out.push(other),
                            None => break,
                        },
                        other => out.push(other),
                    }
                }
                return Some(Token::Str(out));
            }
            '/' => {
                // Line comment; consume to end of line.
                chars.next();
                if chars.peek() == Some(&'/') {
                    while let Some(c) = chars.next() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    // Bare '/' starts an unquoted token.
                    let mut out = String::from('/');
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() || c == '{' || c == '}' || c == '"' {
                            break;
                        }
                        out.push(c);
                        chars.next();
                    }
                    return Some(Token::Str(out));
                }
            }
            _ => {
                let mut out = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '{' || c == '}' || c == '"' {
                        break;
                    }
                    out.push(c);
                    chars.next();
                }
                return Some(Token::Str(out));
            }
        }
    }
}

/// Node of a binary VDF tree.
///
/// Wire format, per field: `0x00 <name\0>` opens a nested object terminated
/// by `0x08`, `0x01 <name\0> <value\0>` is a string attribute and
/// `0x02 <name\0> <i32 LE>` an integer attribute. Any other tag byte ends
/// the current node.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BinNode {
    pub int_attrs: HashMap<String, i32>,
    pub str_attrs: HashMap<String, String>,
    pub children: HashMap<String, BinNode>,
}

impl BinNode {
    pub fn child(&self, key: &str) -> Option<&BinNode> {
        self.children.get(key)
    }
}

/// Parse a binary VDF buffer into a root node. Truncated input stops the
/// parse and returns the fields accumulated so far.
pub fn parse_binary(buf: &[u8]) -> BinNode {
    let mut pos = 0usize;
    parse_binary_node(buf, &mut pos)
}

fn parse_binary_node(buf: &[u8], pos: &mut usize) -> BinNode {
    let mut node = BinNode::default();
    while *pos < buf.len() {
        let tag = buf[*pos];
        *pos += 1;
        if tag == 0x08 {
            return node;
        }
        let name = match read_cstr(buf, pos) {
            Some(name) => name,
            None => return node,
        };
        match tag {
            0x00 => {
                let child = parse_binary_node(buf, pos);
                node.children.entry(name).or_insert(child);
            }
            0x01 => match read_cstr(buf, pos) {
                Some(value) => {
                    node.str_attrs.entry(name).or_insert(value);
                }
                None => return node,
            },
            0x02 => {
                if buf.len() - *pos < 4 {
                    return node;
                }
                let value = i32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
                *pos += 4;
                node.int_attrs.entry(name).or_insert(value);
            }
            _ => return node,
        }
    }
    node
}

fn read_cstr(buf: &[u8], pos: &mut usize) -> Option<String> {
    let nul = buf[*pos..].iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[*pos..*pos + nul]).into_owned();
    *pos += nul + 1;
    Some(s)
}
