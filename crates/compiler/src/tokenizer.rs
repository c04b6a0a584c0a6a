//! Tokenizer for grug source files.
//!
//! The stream is deliberately literal: single spaces, indentation runs,
//! newlines and comments all become tokens, because the parser enforces the
//! language's strict layout (operators surrounded by exactly one space,
//! statements at exactly `depth * 4` spaces) and the AST must serialize back
//! to the original text.

use crate::error::{Result, bail, ensure};

pub const SPACES_PER_INDENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Comma,
    Colon,
    Newline,
    Eq,
    Ne,
    Assign,
    Ge,
    Gt,
    Le,
    Lt,
    And,
    Or,
    Not,
    True,
    False,
    If,
    Else,
    While,
    Break,
    Return,
    Continue,
    Space,
    Indentation,
    StringLit,
    Word,
    I32Lit,
    F32Lit,
    Comment,
}

impl TokenKind {
    /// Name used in "expected X, but got Y" diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::OpenParen => "OPEN_PARENTHESIS",
            TokenKind::CloseParen => "CLOSE_PARENTHESIS",
            TokenKind::OpenBrace => "OPEN_BRACE",
            TokenKind::CloseBrace => "CLOSE_BRACE",
            TokenKind::Plus => "PLUS",
            TokenKind::Minus => "MINUS",
            TokenKind::Star => "MULTIPLICATION",
            TokenKind::Slash => "DIVISION",
            TokenKind::Percent => "REMAINDER",
            TokenKind::Comma => "COMMA",
            TokenKind::Colon => "COLON",
            TokenKind::Newline => "NEWLINE",
            TokenKind::Eq => "EQUALS",
            TokenKind::Ne => "NOT_EQUALS",
            TokenKind::Assign => "ASSIGNMENT",
            TokenKind::Ge => "GREATER_OR_EQUAL",
            TokenKind::Gt => "GREATER",
            TokenKind::Le => "LESS_OR_EQUAL",
            TokenKind::Lt => "LESS",
            TokenKind::And => "AND",
            TokenKind::Or => "OR",
            TokenKind::Not => "NOT",
            TokenKind::True => "TRUE",
            TokenKind::False => "FALSE",
            TokenKind::If => "IF",
            TokenKind::Else => "ELSE",
            TokenKind::While => "WHILE",
            TokenKind::Break => "BREAK",
            TokenKind::Return => "RETURN",
            TokenKind::Continue => "CONTINUE",
            TokenKind::Space => "SPACE",
            TokenKind::Indentation => "INDENTATION",
            TokenKind::StringLit => "STRING",
            TokenKind::Word => "WORD",
            TokenKind::I32Lit => "I32",
            TokenKind::F32Lit => "F32",
            TokenKind::Comment => "COMMENT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based source line.
    pub line: u32,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn escaped(b: u8) -> String {
    match b {
        0x0c => "\\f".to_string(),
        b'\n' => "\\n".to_string(),
        b'\r' => "\\r".to_string(),
        b'\t' => "\\t".to_string(),
        0x0b => "\\v".to_string(),
        _ => (b as char).to_string(),
    }
}

struct Tokenizer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
}

impl<'a> Tokenizer<'a> {
    fn peek(&self, ahead: usize) -> u8 {
        *self.bytes.get(self.pos + ahead).unwrap_or(&0)
    }

    fn push(&mut self, kind: TokenKind, len: usize) {
        let text = std::str::from_utf8(&self.bytes[self.pos..self.pos + len])
            .unwrap_or_default()
            .to_string();
        self.tokens.push(Token { kind, text, line: self.line });
        self.pos += len;
    }

    fn push_str(&mut self, kind: TokenKind, text: &str, line: u32) {
        self.tokens.push(Token { kind, text: text.to_string(), line });
    }

    /// Longest keyword whose text starts at the current position and is
    /// followed by a non-identifier byte.
    fn keyword(&self) -> Option<(TokenKind, usize)> {
        const KEYWORDS: [(&str, TokenKind); 11] = [
            ("continue", TokenKind::Continue),
            ("return", TokenKind::Return),
            ("break", TokenKind::Break),
            ("while", TokenKind::While),
            ("false", TokenKind::False),
            ("else", TokenKind::Else),
            ("true", TokenKind::True),
            ("and", TokenKind::And),
            ("not", TokenKind::Not),
            ("or", TokenKind::Or),
            ("if", TokenKind::If),
        ];

        for (text, kind) in KEYWORDS {
            if self.bytes[self.pos..].starts_with(text.as_bytes())
                && !is_word_byte(self.peek(text.len()))
            {
                return Some((kind, text.len()));
            }
        }
        None
    }

    fn spaces(&mut self) -> Result<()> {
        if self.peek(1) != b' ' {
            self.push(TokenKind::Space, 1);
            return Ok(());
        }

        let start = self.pos;
        while self.peek(0) == b' ' {
            self.pos += 1;
        }
        let count = self.pos - start;
        ensure!(
            count % SPACES_PER_INDENT == 0,
            line self.line,
            "Encountered {} spaces, while indentation expects multiples of {} spaces, on line {}",
            count,
            SPACES_PER_INDENT,
            self.line
        );
        self.tokens.push(Token {
            kind: TokenKind::Indentation,
            text: " ".repeat(count),
            line: self.line,
        });
        Ok(())
    }

    fn string_literal(&mut self) -> Result<()> {
        let open_line = self.line;
        let start = self.pos + 1;
        let mut end = start;
        loop {
            match self.bytes.get(end).copied() {
                Some(b'"') => break,
                Some(b'\n') => {
                    // Strings still have to close before the buffer runs
                    // out; a newline inside one is kept verbatim.
                    end += 1;
                }
                Some(_) => end += 1,
                None => bail!(line open_line, "Unclosed \" on line {}", open_line),
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..end]).unwrap_or_default();
        self.push_str(TokenKind::StringLit, text, open_line);
        self.line += text.bytes().filter(|&b| b == b'\n').count() as u32;
        self.pos = end + 1;
        Ok(())
    }

    fn number(&mut self) -> Result<()> {
        let start = self.pos;
        let mut seen_period = false;
        self.pos += 1;
        loop {
            let b = self.peek(0);
            if b == b'.' {
                ensure!(
                    !seen_period,
                    line self.line,
                    "Encountered two '.' periods in a number on line {}",
                    self.line
                );
                seen_period = true;
            } else if !b.is_ascii_digit() {
                break;
            }
            self.pos += 1;
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        if seen_period {
            ensure!(
                !text.ends_with('.'),
                line self.line,
                "Missing digit after decimal point in '{}'",
                text
            );
            self.push_str(TokenKind::F32Lit, text, self.line);
        } else {
            self.push_str(TokenKind::I32Lit, text, self.line);
        }
        Ok(())
    }

    fn comment(&mut self) -> Result<()> {
        self.pos += 1;
        ensure!(
            self.peek(0) == b' ',
            line self.line,
            "Expected a single space after the '#' on line {}",
            self.line
        );
        self.pos += 1;

        let start = self.pos;
        loop {
            let b = self.peek(0);
            if (0x20..=0x7e).contains(&b) {
                self.pos += 1;
                continue;
            }
            if b == b'\r' || b == b'\n' || b == 0 {
                break;
            }
            bail!(
                line self.line,
                "Unexpected unprintable character '{}' on line {}",
                escaped(b),
                self.line
            );
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        ensure!(
            !text.is_empty(),
            line self.line,
            "Expected the comment to contain some text on line {}",
            self.line
        );
        ensure!(
            !text.ends_with(' '),
            line self.line,
            "A comment has trailing whitespace on line {}",
            self.line
        );
        self.push_str(TokenKind::Comment, text, self.line);
        Ok(())
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut t = Tokenizer {
        bytes: source.as_bytes(),
        pos: 0,
        line: 1,
        tokens: Vec::new(),
    };

    while t.pos < t.bytes.len() {
        let b = t.peek(0);
        match b {
            b'(' => t.push(TokenKind::OpenParen, 1),
            b')' => t.push(TokenKind::CloseParen, 1),
            b'{' => t.push(TokenKind::OpenBrace, 1),
            b'}' => t.push(TokenKind::CloseBrace, 1),
            b'+' => t.push(TokenKind::Plus, 1),
            b'-' => t.push(TokenKind::Minus, 1),
            b'*' => t.push(TokenKind::Star, 1),
            b'/' => t.push(TokenKind::Slash, 1),
            b'%' => t.push(TokenKind::Percent, 1),
            b',' => t.push(TokenKind::Comma, 1),
            b':' => t.push(TokenKind::Colon, 1),
            b'\n' => {
                t.push(TokenKind::Newline, 1);
                t.line += 1;
            }
            b'=' if t.peek(1) == b'=' => t.push(TokenKind::Eq, 2),
            b'!' if t.peek(1) == b'=' => t.push(TokenKind::Ne, 2),
            b'=' => t.push(TokenKind::Assign, 1),
            b'>' if t.peek(1) == b'=' => t.push(TokenKind::Ge, 2),
            b'>' => t.push(TokenKind::Gt, 1),
            b'<' if t.peek(1) == b'=' => t.push(TokenKind::Le, 2),
            b'<' => t.push(TokenKind::Lt, 1),
            b' ' => t.spaces()?,
            b'"' => t.string_literal()?,
            b'#' => t.comment()?,
            _ => {
                if let Some((kind, len)) = t.keyword() {
                    t.push(kind, len);
                } else if b.is_ascii_alphabetic() || b == b'_' {
                    let start = t.pos;
                    while is_word_byte(t.peek(0)) {
                        t.pos += 1;
                    }
                    let text =
                        std::str::from_utf8(&t.bytes[start..t.pos]).unwrap_or_default();
                    t.push_str(TokenKind::Word, text, t.line);
                } else if b.is_ascii_digit() {
                    t.number()?;
                } else {
                    bail!(
                        line t.line,
                        "Unrecognized character '{}' on line {}",
                        escaped(b),
                        t.line
                    );
                }
            }
        }
    }

    Ok(t.tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("a = b"),
            vec![TokenKind::Word, TokenKind::Space, TokenKind::Assign, TokenKind::Space, TokenKind::Word]
        );
        assert_eq!(
            kinds("a == b"),
            vec![TokenKind::Word, TokenKind::Space, TokenKind::Eq, TokenKind::Space, TokenKind::Word]
        );
        assert_eq!(
            kinds("a >= b"),
            vec![TokenKind::Word, TokenKind::Space, TokenKind::Ge, TokenKind::Space, TokenKind::Word]
        );
    }

    #[test]
    fn test_keywords_need_word_boundary() {
        assert_eq!(kinds("true"), vec![TokenKind::True]);
        // "truex" is a word, not the keyword followed by "x"
        assert_eq!(kinds("truex"), vec![TokenKind::Word]);
        assert_eq!(kinds("android"), vec![TokenKind::Word]);
        assert_eq!(
            kinds("a and b"),
            vec![TokenKind::Word, TokenKind::Space, TokenKind::And, TokenKind::Space, TokenKind::Word]
        );
    }

    #[test]
    fn test_indentation_multiple_of_four() {
        let tokens = tokenize("    x").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Indentation);
        assert_eq!(tokens[0].text.len(), 4);

        let err = tokenize("   x").unwrap_err();
        assert!(err.msg.contains("multiples of 4"), "{}", err.msg);
    }

    #[test]
    fn test_single_space_is_a_token() {
        let tokens = tokenize("a b").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Space);
    }

    #[test]
    fn test_string_literal_no_escapes() {
        let tokens = tokenize("\"hi there\"").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::StringLit);
        assert_eq!(tokens[0].text, "hi there");
    }

    #[test]
    fn test_unclosed_string_reports_open_line() {
        let err = tokenize("x\n\"oops").unwrap_err();
        assert_eq!(err.msg, "Unclosed \" on line 2");
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("42"), vec![TokenKind::I32Lit]);
        assert_eq!(kinds("4.2"), vec![TokenKind::F32Lit]);

        let err = tokenize("4.").unwrap_err();
        assert!(err.msg.contains("Missing digit after decimal point"));

        let err = tokenize("4.2.1").unwrap_err();
        assert!(err.msg.contains("two '.' periods"));
    }

    #[test]
    fn test_comment_shape() {
        let tokens = tokenize("# hello world\n").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Comment);
        assert_eq!(tokens[0].text, "hello world");

        assert!(tokenize("#no space\n").is_err());
        assert!(tokenize("# \n").is_err());
        assert!(tokenize("# trailing \n").is_err());
    }

    #[test]
    fn test_unrecognized_character() {
        let err = tokenize("\t").unwrap_err();
        assert!(err.msg.contains("\\t"), "{}", err.msg);
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize("a\nb\nc").unwrap();
        let lines: Vec<u32> = tokens.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 1, 2, 2, 3]);
    }
}
