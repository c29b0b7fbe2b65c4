//! SQL tokenizer
//!
//! A lossless lexer over statement text: every byte of the input belongs
//! to exactly one token, so rewrite phases can splice the original text
//! by span. String literals and comments are single tokens, which is
//! what keeps the rewriter from ever touching their contents.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: keyword, identifier, function name
    Word,
    /// Double-quoted identifier
    QuotedIdent,
    /// Numeric literal
    Number,
    /// Single-quoted string literal (with '' escapes), quotes included
    Str,
    /// `-- ...` or `/* ... */`
    Comment,
    /// Run of whitespace
    Whitespace,
    /// Any other single character
    Symbol,
}

/// One token, referencing the input by byte span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// The token's text within the original input
    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..self.end]
    }

    /// Case-insensitive word match
    pub fn is_word(&self, sql: &str, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text(sql).eq_ignore_ascii_case(word)
    }

    /// Symbol match
    pub fn is_symbol(&self, sql: &str, symbol: char) -> bool {
        self.kind == TokenKind::Symbol && self.text(sql).chars().next() == Some(symbol)
    }

    /// The literal's contents for Str tokens, with '' unescaped
    pub fn str_value(&self, sql: &str) -> String {
        let text = self.text(sql);
        text.trim_matches('\'').replace("''", "'")
    }
}

/// Tokenize a SQL statement
pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];

        let kind = if c.is_ascii_whitespace() {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            TokenKind::Whitespace
        } else if c == b'\'' {
            i += 1;
            loop {
                match bytes.get(i) {
                    Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
                    Some(b'\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                    None => break, // unterminated literal: consume to end
                }
            }
            TokenKind::Str
        } else if c == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            i = (i + 1).min(bytes.len());
            TokenKind::QuotedIdent
        } else if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            TokenKind::Comment
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            TokenKind::Comment
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$') {
                i += 1;
            }
            TokenKind::Word
        } else if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            TokenKind::Number
        } else {
            i += 1;
            TokenKind::Symbol
        };

        tokens.push(Token { kind, start, end: i });
    }

    tokens
}

/// Index of the next non-trivia token at or after `from`
pub fn next_significant(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&idx| !matches!(tokens[idx].kind, TokenKind::Whitespace | TokenKind::Comment))
}

/// Index of the previous non-trivia token strictly before `from`
pub fn prev_significant(tokens: &[Token], from: usize) -> Option<usize> {
    (0..from)
        .rev()
        .find(|&idx| !matches!(tokens[idx].kind, TokenKind::Whitespace | TokenKind::Comment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, String)> {
        tokenize(sql)
            .iter()
            .map(|t| (t.kind, t.text(sql).to_string()))
            .collect()
    }

    #[test]
    fn test_tokens_cover_input_losslessly() {
        let sql = "SELECT a, 'lit''eral' FROM t -- trailing\nWHERE x = 1.5";
        let tokens = tokenize(sql);
        let rebuilt: String = tokens.iter().map(|t| t.text(sql)).collect();
        assert_eq!(rebuilt, sql);
    }

    #[test]
    fn test_string_literal_is_one_token() {
        let sql = "SELECT 'MEANS } -- not a comment'";
        let tokens = kinds(sql);
        let strs: Vec<_> = tokens.iter().filter(|(k, _)| *k == TokenKind::Str).collect();
        assert_eq!(strs.len(), 1);
        assert!(strs[0].1.contains("MEANS"));
    }

    #[test]
    fn test_escaped_quote_stays_in_literal() {
        let sql = "'it''s'";
        let tokens = tokenize(sql);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].str_value(sql), "it's");
    }

    #[test]
    fn test_line_and_block_comments() {
        let sql = "SELECT 1 -- MEANS nothing\n/* ABOUT nothing */ FROM t";
        let comments: Vec<_> = kinds(sql)
            .into_iter()
            .filter(|(k, _)| *k == TokenKind::Comment)
            .collect();
        assert_eq!(comments.len(), 2);
    }

    #[test]
    fn test_word_boundaries() {
        // MEANS embedded in COMMENTS must not produce a MEANS word token
        let sql = "SELECT COMMENTS FROM t";
        let tokens = tokenize(sql);
        assert!(tokens.iter().any(|t| t.is_word(sql, "comments")));
        assert!(!tokens.iter().any(|t| t.is_word(sql, "means")));
    }

    #[test]
    fn test_quoted_identifier() {
        let sql = "SELECT \"weird name\" FROM t";
        let tokens = tokenize(sql);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::QuotedIdent));
    }

    #[test]
    fn test_significant_navigation() {
        let sql = "  -- lead\n  SELECT 1";
        let tokens = tokenize(sql);
        let first = next_significant(&tokens, 0).unwrap();
        assert!(tokens[first].is_word(sql, "select"));
        let last = tokens.len() - 1;
        let prev = prev_significant(&tokens, last).unwrap();
        assert!(tokens[prev].is_word(sql, "select"));
    }

    #[test]
    fn test_unterminated_literal_consumes_rest() {
        let sql = "SELECT 'oops";
        let tokens = tokenize(sql);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Str);
        let rebuilt: String = tokens.iter().map(|t| t.text(sql)).collect();
        assert_eq!(rebuilt, sql);
    }
}
