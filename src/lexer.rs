// File: src/lexer.rs
//
// Hand-written tokenizer for Pluto source. Statements are terminated by
// semicolons; a semicolon is inserted automatically at a newline when
// the previous token can end a statement, so sources rarely spell them.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// `$name` — a parameter in a definition, or a variable passed as
    /// an argument at a call site
    Param(String),
    Number(f64),
    Str(String),
    CharLit(char),
    Keyword(String),
    Operator(String),
    Punct(char),
    Illegal(char),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

const KEYWORDS: &[&str] = &[
    "def", "init", "class", "extends", "return", "if", "elif", "else", "while", "for", "match",
    "try", "catch", "use", "import", "break", "next", "true", "false", "null", "emit",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

/// Can a statement end right after this token? Drives semicolon
/// insertion at newlines.
fn ends_statement(kind: &TokenKind) -> bool {
    match kind {
        TokenKind::Ident(_)
        | TokenKind::Param(_)
        | TokenKind::Number(_)
        | TokenKind::Str(_)
        | TokenKind::CharLit(_) => true,
        TokenKind::Keyword(word) => {
            matches!(word.as_str(), "true" | "false" | "null" | "break" | "next" | "return")
        }
        TokenKind::Punct(c) => matches!(c, ')' | ']' | '}'),
        _ => false,
    }
}

pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;
    let mut col = 1;

    // open parens/brackets suppress semicolon insertion, so multi-line
    // groupings and array literals stay one expression
    let mut nesting: i32 = 0;

    macro_rules! push {
        ($kind:expr) => {
            tokens.push(Token { kind: $kind, line, column: col })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
                col += 1;
            }
            '\n' => {
                chars.next();

                if nesting == 0 {
                    if let Some(last) = tokens.last() {
                        if ends_statement(&last.kind) {
                            push!(TokenKind::Punct(';'));
                        }
                    }
                }

                line += 1;
                col = 1;
            }
            '#' => {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        break;
                    }
                }

                if nesting == 0 {
                    if let Some(last) = tokens.last() {
                        if ends_statement(&last.kind) {
                            push!(TokenKind::Punct(';'));
                        }
                    }
                }

                line += 1;
                col = 1;
            }
            '"' => {
                chars.next();
                col += 1;
                let mut s = String::new();

                while let Some(&ch) = chars.peek() {
                    chars.next();
                    col += 1;

                    if ch == '"' {
                        break;
                    }

                    if ch == '\\' {
                        if let Some(&esc) = chars.peek() {
                            chars.next();
                            col += 1;
                            s.push(unescape(esc));
                        }
                    } else {
                        if ch == '\n' {
                            line += 1;
                            col = 1;
                        }
                        s.push(ch);
                    }
                }

                push!(TokenKind::Str(s));
            }
            '\'' => {
                chars.next();
                col += 1;

                let ch = match chars.next() {
                    Some('\\') => {
                        col += 1;
                        chars.next().map(unescape).unwrap_or('\\')
                    }
                    Some(c) => c,
                    None => '\0',
                };
                col += 1;

                if chars.peek() == Some(&'\'') {
                    chars.next();
                    col += 1;
                    push!(TokenKind::CharLit(ch));
                } else {
                    push!(TokenKind::Illegal('\''));
                }
            }
            '0'..='9' => {
                let mut num = String::new();

                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        num.push(ch);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }

                match num.parse() {
                    Ok(parsed) => push!(TokenKind::Number(parsed)),
                    Err(_) => push!(TokenKind::Illegal('0')),
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let word = read_ident(&mut chars, &mut col);

                if is_keyword(&word) {
                    push!(TokenKind::Keyword(word));
                } else {
                    push!(TokenKind::Ident(word));
                }
            }
            '$' => {
                chars.next();
                col += 1;
                let name = read_ident(&mut chars, &mut col);

                if name.is_empty() {
                    push!(TokenKind::Illegal('$'));
                } else {
                    push!(TokenKind::Param(name));
                }
            }
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';' | '.' | '\\' => {
                match c {
                    '(' | '[' => nesting += 1,
                    ')' | ']' => nesting = (nesting - 1).max(0),
                    _ => {}
                }

                chars.next();
                col += 1;
                push!(TokenKind::Punct(c));
            }
            ':' => {
                chars.next();
                col += 1;

                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        col += 1;
                        push!(TokenKind::Operator(":=".into()));
                    }
                    Some(':') => {
                        chars.next();
                        col += 1;
                        push!(TokenKind::Operator("::".into()));
                    }
                    _ => push!(TokenKind::Punct(':')),
                }
            }
            _ => match read_operator(&mut chars, &mut col) {
                Some(op) => push!(TokenKind::Operator(op)),
                None => {
                    chars.next();
                    col += 1;
                    push!(TokenKind::Illegal(c));
                }
            },
        }
    }

    if let Some(last) = tokens.last() {
        if ends_statement(&last.kind) {
            tokens.push(Token { kind: TokenKind::Punct(';'), line, column: col });
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    tokens
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

fn read_ident(chars: &mut std::iter::Peekable<std::str::Chars>, col: &mut usize) -> String {
    let mut ident = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' {
            ident.push(ch);
            chars.next();
            *col += 1;
        } else {
            break;
        }
    }

    ident
}

fn read_operator(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    col: &mut usize,
) -> Option<String> {
    let &first = chars.peek()?;

    if !matches!(first, '+' | '-' | '*' | '/' | '%' | '<' | '>' | '=' | '!' | '&' | '|') {
        return None;
    }

    chars.next();
    *col += 1;
    let mut op = first.to_string();

    // Greedily extend into the two- and three-character lexemes:
    // doubled forms (** // && || ==), arrows, and compound assignment.
    match (first, chars.peek()) {
        ('=', Some('>')) => {
            op.push('>');
            chars.next();
            *col += 1;
            return Some(op);
        }
        ('-', Some('>')) => {
            op.push('>');
            chars.next();
            *col += 1;
            return Some(op);
        }
        ('*', Some('*')) | ('/', Some('/')) | ('&', Some('&')) | ('|', Some('|'))
        | ('=', Some('=')) => {
            op.push(first);
            chars.next();
            *col += 1;
        }
        _ => {}
    }

    if op != "=" && chars.peek() == Some(&'=') {
        op.push('=');
        chars.next();
        *col += 1;
    }

    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_pattern_call_tokens() {
        let kinds = kinds("print $obj");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("print".into()),
                TokenKind::Param("obj".into()),
                TokenKind::Punct(';'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn distinguishes_colon_forms() {
        assert_eq!(kinds("a := b")[1], TokenKind::Operator(":=".into()));
        assert_eq!(kinds("m :: f $x")[1], TokenKind::Operator("::".into()));
        assert_eq!(kinds("[1: 2]")[2], TokenKind::Punct(':'));
    }

    #[test]
    fn operators_extend_greedily() {
        assert_eq!(kinds("a ** b")[1], TokenKind::Operator("**".into()));
        assert_eq!(kinds("a // b")[1], TokenKind::Operator("//".into()));
        assert_eq!(kinds("a <= b")[1], TokenKind::Operator("<=".into()));
        assert_eq!(kinds("a += b")[1], TokenKind::Operator("+=".into()));
        assert_eq!(kinds("a //= b")[1], TokenKind::Operator("//=".into()));
        assert_eq!(kinds("x => y")[1], TokenKind::Operator("=>".into()));
    }

    #[test]
    fn inserts_semicolons_at_newlines() {
        let kinds = kinds("a = 1\nb = 2");
        let semis = kinds.iter().filter(|k| **k == TokenKind::Punct(';')).count();
        assert_eq!(semis, 2);
    }

    #[test]
    fn no_semicolon_after_operators() {
        let kinds = kinds("a = 1 +\n2");
        // the newline after `+` must not split the expression
        assert!(!kinds.windows(2).any(|w| w[0] == TokenKind::Operator("+".into())
            && w[1] == TokenKind::Punct(';')));
    }

    #[test]
    fn string_and_char_escapes() {
        assert_eq!(kinds("\"a\\nb\"")[0], TokenKind::Str("a\nb".into()));
        assert_eq!(kinds("'\\t'")[0], TokenKind::CharLit('\t'));
        assert_eq!(kinds("'x'")[0], TokenKind::CharLit('x'));
    }

    #[test]
    fn no_insertion_inside_brackets() {
        let kinds = kinds("xs = [1,\n2\n]");
        let closing = kinds.iter().position(|k| *k == TokenKind::Punct(']')).unwrap();
        assert!(!kinds[..closing].contains(&TokenKind::Punct(';')));
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let kinds = kinds("a = 1 # a comment\nb");
        assert!(kinds.contains(&TokenKind::Ident("b".into())));
        assert!(!kinds.iter().any(|k| matches!(k, TokenKind::Ident(w) if w == "comment")));
    }
}
