use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Pipe,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Tilde,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Str(String),
    Int(i64),
    Float(f64),
    Word(String),
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Pipe => "'|'".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Eq => "'='".to_string(),
            Tok::Ne => "'!='".to_string(),
            Tok::Lt => "'<'".to_string(),
            Tok::Le => "'<='".to_string(),
            Tok::Gt => "'>'".to_string(),
            Tok::Ge => "'>='".to_string(),
            Tok::Tilde => "'~'".to_string(),
            Tok::Plus => "'+'".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Star => "'*'".to_string(),
            Tok::Slash => "'/'".to_string(),
            Tok::Percent => "'%'".to_string(),
            Tok::Str(s) => format!("string \"{s}\""),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(x) => format!("number {x}"),
            Tok::Word(w) => format!("'{w}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub column: usize,
}

/// Characters that may continue a bareword after its first character.
/// Dashes are included so unquoted values like `web-01` and relative-time
/// literals like `-1h@h` stay one token; eval subtraction therefore needs
/// surrounding whitespace (`a - b`).
fn is_word_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-')
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub fn lex(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1usize;
    let mut column = 1usize;

    macro_rules! push {
        ($tok:expr, $line:expr, $col:expr) => {
            out.push(Token {
                tok: $tok,
                line: $line,
                column: $col,
            })
        };
    }

    while let Some(&c) = chars.peek() {
        let (tl, tc) = (line, column);
        match c {
            '\n' => {
                chars.next();
                line += 1;
                column = 1;
            }
            c if c.is_whitespace() => {
                chars.next();
                column += 1;
            }
            '|' => {
                chars.next();
                column += 1;
                push!(Tok::Pipe, tl, tc);
            }
            '(' => {
                chars.next();
                column += 1;
                push!(Tok::LParen, tl, tc);
            }
            ')' => {
                chars.next();
                column += 1;
                push!(Tok::RParen, tl, tc);
            }
            ',' => {
                chars.next();
                column += 1;
                push!(Tok::Comma, tl, tc);
            }
            '~' => {
                chars.next();
                column += 1;
                push!(Tok::Tilde, tl, tc);
            }
            '+' => {
                chars.next();
                column += 1;
                push!(Tok::Plus, tl, tc);
            }
            '*' => {
                chars.next();
                column += 1;
                push!(Tok::Star, tl, tc);
            }
            '/' => {
                chars.next();
                column += 1;
                push!(Tok::Slash, tl, tc);
            }
            '%' => {
                chars.next();
                column += 1;
                push!(Tok::Percent, tl, tc);
            }
            '=' => {
                chars.next();
                column += 1;
                // Accept both `=` and `==`.
                if chars.peek() == Some(&'=') {
                    chars.next();
                    column += 1;
                }
                push!(Tok::Eq, tl, tc);
            }
            '!' => {
                chars.next();
                column += 1;
                if chars.peek() == Some(&'=') {
                    chars.next();
                    column += 1;
                    push!(Tok::Ne, tl, tc);
                } else {
                    return Err(QueryError::parse("expected '=' after '!'", tl, tc));
                }
            }
            '<' => {
                chars.next();
                column += 1;
                if chars.peek() == Some(&'=') {
                    chars.next();
                    column += 1;
                    push!(Tok::Le, tl, tc);
                } else {
                    push!(Tok::Lt, tl, tc);
                }
            }
            '>' => {
                chars.next();
                column += 1;
                if chars.peek() == Some(&'=') {
                    chars.next();
                    column += 1;
                    push!(Tok::Ge, tl, tc);
                } else {
                    push!(Tok::Gt, tl, tc);
                }
            }
            '"' => {
                chars.next();
                column += 1;
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    column += 1;
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let esc = chars.next().ok_or_else(|| {
                                QueryError::parse("unterminated string literal", tl, tc)
                            })?;
                            column += 1;
                            match esc {
                                'n' => s.push('\n'),
                                't' => s.push('\t'),
                                'r' => s.push('\r'),
                                '"' | '\\' => s.push(esc),
                                // Leave unknown escapes intact so regex
                                // classes like \d survive the round trip.
                                other => {
                                    s.push('\\');
                                    s.push(other);
                                }
                            }
                        }
                        '\n' => {
                            return Err(QueryError::parse("unterminated string literal", tl, tc));
                        }
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(QueryError::parse("unterminated string literal", tl, tc));
                }
                push!(Tok::Str(s), tl, tc);
            }
            '-' => {
                chars.next();
                column += 1;
                // A dash directly followed by a digit opens a negative number
                // or a relative-time literal (`-1h@h`); otherwise it is an
                // operator / exclusion marker.
                if chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    let mut word = String::from("-");
                    while let Some(&c) = chars.peek() {
                        if is_word_continue(c) {
                            word.push(c);
                            chars.next();
                            column += 1;
                        } else {
                            break;
                        }
                    }
                    push!(classify_word(word), tl, tc);
                } else {
                    push!(Tok::Minus, tl, tc);
                }
            }
            c if is_word_start(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if is_word_continue(c) {
                        word.push(c);
                        chars.next();
                        column += 1;
                    } else {
                        break;
                    }
                }
                push!(classify_word(word), tl, tc);
            }
            other => {
                return Err(QueryError::parse(
                    format!("unexpected character '{other}'"),
                    tl,
                    tc,
                ));
            }
        }
    }

    Ok(out)
}

/// Purely-numeric words become number tokens; everything else stays a word
/// (including duration literals like `1h` and relative times like `-1h@h`).
fn classify_word(word: String) -> Tok {
    let body = word.strip_prefix('-').unwrap_or(&word);
    if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = word.parse::<i64>() {
            return Tok::Int(i);
        }
    }
    let dots = body.bytes().filter(|&b| b == b'.').count();
    if dots == 1 && body.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        if let Ok(x) = word.parse::<f64>() {
            return Tok::Float(x);
        }
    }
    Tok::Word(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(input: &str) -> Vec<Tok> {
        lex(input).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn lexes_comparison_without_spaces() {
        assert_eq!(
            toks("severity<=3"),
            vec![Tok::Word("severity".into()), Tok::Le, Tok::Int(3)]
        );
    }

    #[test]
    fn lexes_dashed_bareword() {
        assert_eq!(
            toks("host=web-01"),
            vec![Tok::Word("host".into()), Tok::Eq, Tok::Word("web-01".into())]
        );
    }

    #[test]
    fn lexes_relative_time_word() {
        assert_eq!(toks("-1h@h"), vec![Tok::Word("-1h@h".into())]);
    }

    #[test]
    fn lexes_negative_number() {
        assert_eq!(toks("-5"), vec![Tok::Int(-5)]);
        assert_eq!(toks("-5.5"), vec![Tok::Float(-5.5)]);
    }

    #[test]
    fn lexes_string_escapes() {
        assert_eq!(
            toks(r#""a\"b\\c""#),
            vec![Tok::Str("a\"b\\c".into())]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = lex("search \"abc").unwrap_err();
        match err {
            QueryError::Parse { line, column, .. } => {
                assert_eq!(line, 1);
                assert_eq!(column, 8);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = lex("search *\n| stats count").unwrap();
        let pipe = tokens.iter().find(|t| t.tok == Tok::Pipe).unwrap();
        assert_eq!(pipe.line, 2);
        assert_eq!(pipe.column, 1);
    }
}
