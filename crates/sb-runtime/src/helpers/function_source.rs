use std::borrow::Cow;
use std::ops::Range;

/// Native function a tagged program calls to record the text of each
/// function value it creates.
pub(crate) const SOURCE_TAG_FN: &str = "sb_src";

/// Words that may precede a closure without being an operand themselves.
const LEADING_KEYWORDS: &[&str] = &[
    "return", "throw", "in", "if", "while", "until", "do", "loop", "switch", "else", "let",
    "const",
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lexeme {
    Trivia,
    Literal,
    Word,
    Punct(u8),
}

/// Byte ranges of the closures and `Fn(...)` calls in `source`, in order of
/// their start. Nested functions get their own range.
pub(crate) fn function_spans(source: &str) -> Vec<Range<usize>> {
    let bytes = source.as_bytes();
    let mut spans = Vec::new();
    let mut pos = 0;
    let mut after_operand = false;
    let mut after_dot = false;
    while pos < bytes.len() {
        let (lexeme, end) = next_lexeme(bytes, pos);
        match lexeme {
            Lexeme::Trivia => {
                pos = end;
                continue;
            }
            Lexeme::Literal => after_operand = true,
            Lexeme::Word => {
                let word = &source[pos..end];
                if word == "Fn" && !after_dot {
                    if let Some(close) = call_end(bytes, end) {
                        spans.push(pos..close);
                    }
                }
                after_operand = !LEADING_KEYWORDS.contains(&word);
            }
            Lexeme::Punct(b'|') if !after_operand => {
                if let Some(body) = closure_params_end(bytes, pos) {
                    spans.push(pos..expression_end(bytes, body));
                    pos = body;
                    after_dot = false;
                    continue;
                }
            }
            Lexeme::Punct(b')' | b']' | b'}') => after_operand = true,
            Lexeme::Punct(_) => after_operand = false,
        }
        after_dot = lexeme == Lexeme::Punct(b'.');
        pos = end;
    }
    spans
}

/// Wraps every function expression of `source` as
/// `sb_src("<its text>", <expression>)`.
pub(crate) fn tag_function_sources(source: &str) -> Cow<'_, str> {
    let spans = function_spans(source);
    if spans.is_empty() {
        return Cow::Borrowed(source);
    }
    // (offset, opens, text); closing parens sort before openings at one offset
    let mut inserts = Vec::with_capacity(spans.len() * 2);
    for span in &spans {
        let text = quote(&source[span.clone()]);
        inserts.push((span.start, true, format!("{}({}, ", SOURCE_TAG_FN, text)));
        inserts.push((span.end, false, ")".to_string()));
    }
    inserts.sort_by_key(|(offset, opens, _)| (*offset, *opens));

    let mut tagged = String::with_capacity(source.len() + inserts.len() * 16);
    let mut copied = 0;
    for (offset, _, text) in inserts {
        tagged.push_str(&source[copied..offset]);
        tagged.push_str(&text);
        copied = offset;
    }
    tagged.push_str(&source[copied..]);
    Cow::Owned(tagged)
}

fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn next_lexeme(bytes: &[u8], start: usize) -> (Lexeme, usize) {
    let at = |index: usize| bytes.get(index).copied();
    match bytes[start] {
        b' ' | b'\t' | b'\r' | b'\n' => (Lexeme::Trivia, start + 1),
        b'/' if at(start + 1) == Some(b'/') => {
            let end = bytes[start..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map_or(bytes.len(), |offset| start + offset);
            (Lexeme::Trivia, end)
        }
        b'/' if at(start + 1) == Some(b'*') => (Lexeme::Trivia, block_comment_end(bytes, start)),
        delimiter @ (b'"' | b'\'' | b'`') => (Lexeme::Literal, literal_end(bytes, start, delimiter)),
        byte if is_word_byte(byte) => {
            let end = bytes[start..]
                .iter()
                .position(|byte| !is_word_byte(*byte))
                .map_or(bytes.len(), |offset| start + offset);
            (Lexeme::Word, end)
        }
        byte => (Lexeme::Punct(byte), start + 1),
    }
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte >= 0x80
}

fn literal_end(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut index = start + 1;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' if quote != b'`' => index += 2,
            byte if byte == quote => return index + 1,
            _ => index += 1,
        }
    }
    bytes.len()
}

fn block_comment_end(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut index = start;
    while index + 1 < bytes.len() {
        match (bytes[index], bytes[index + 1]) {
            (b'/', b'*') => {
                depth += 1;
                index += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                index += 2;
                if depth == 0 {
                    return index;
                }
            }
            _ => index += 1,
        }
    }
    bytes.len()
}

/// Offset just past the closing `|` of a parameter list opening at `start`,
/// or `None` when the bars do not enclose plain parameter names.
fn closure_params_end(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start + 1) == Some(&b'|') {
        return Some(start + 2);
    }
    let mut pos = start + 1;
    while pos < bytes.len() {
        let (lexeme, end) = next_lexeme(bytes, pos);
        match lexeme {
            Lexeme::Trivia | Lexeme::Punct(b',') => {}
            Lexeme::Word if !bytes[pos].is_ascii_digit() => {}
            Lexeme::Punct(b'|') => return Some(end),
            _ => return None,
        }
        pos = end;
    }
    None
}

/// Offset just past the `)` that closes a call whose name ends at `start`.
fn call_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    while pos < bytes.len() {
        let (lexeme, end) = next_lexeme(bytes, pos);
        match lexeme {
            Lexeme::Trivia => pos = end,
            Lexeme::Punct(b'(') => return Some(balanced_end(bytes, pos)),
            _ => return None,
        }
    }
    None
}

fn balanced_end(bytes: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    let mut pos = open;
    while pos < bytes.len() {
        let (lexeme, end) = next_lexeme(bytes, pos);
        match lexeme {
            Lexeme::Punct(b'(' | b'[' | b'{') => depth += 1,
            Lexeme::Punct(b')' | b']' | b'}') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return end;
                }
            }
            _ => {}
        }
        pos = end;
    }
    bytes.len()
}

/// End of a closure body starting at `start`: a block ends at its closing
/// brace, an expression at the first separator or closer outside brackets.
/// Trailing whitespace and comments are left out.
fn expression_end(bytes: &[u8], start: usize) -> usize {
    let mut pos = start;
    let mut depth = 0usize;
    let mut code_end = start;
    let mut first = true;
    while pos < bytes.len() {
        let (lexeme, end) = next_lexeme(bytes, pos);
        match lexeme {
            Lexeme::Trivia => {
                pos = end;
                continue;
            }
            Lexeme::Punct(b'{') if first => return balanced_end(bytes, pos),
            Lexeme::Punct(b'(' | b'[' | b'{') => depth += 1,
            Lexeme::Punct(b')' | b']' | b'}') => {
                if depth == 0 {
                    return code_end;
                }
                depth -= 1;
            }
            Lexeme::Punct(b',' | b';') if depth == 0 => return code_end,
            _ => {}
        }
        first = false;
        code_end = end;
        pos = end;
    }
    code_end
}

#[cfg(test)]
mod function_source_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn texts(source: &str) -> Vec<&str> {
        function_spans(source)
            .into_iter()
            .map(|span| &source[span])
            .collect()
    }

    #[test]
    fn expression_closures_end_at_separators() {
        assert_eq!(
            texts("karate.map([1, 2], |x| x.no_such_method())"),
            vec!["|x| x.no_such_method()"]
        );
        assert_eq!(
            texts("#{ f: |a, b| a + b, g: || 1 }"),
            vec!["|a, b| a + b", "|| 1"]
        );
        assert_eq!(texts("let f = |x| x * 2; f.call(1)"), vec!["|x| x * 2"]);
    }

    #[test]
    fn block_closures_end_at_their_brace() {
        let source = "let f = || { n[0] += 1; n[0] };\nf.call()";
        assert_eq!(texts(source), vec!["|| { n[0] += 1; n[0] }"]);
    }

    #[test]
    fn nested_closures_get_their_own_span() {
        assert_eq!(texts("|x| |y| x + y"), vec!["|x| |y| x + y", "|y| x + y"]);
    }

    #[test]
    fn bitwise_and_logical_operators_are_left_alone() {
        assert!(texts("a || b").is_empty());
        assert!(texts("(x | 4) || f(y)").is_empty());
        assert!(texts("\"|x| x\" + '|'").is_empty());
        assert!(texts("// |x| x\n1 /* || 2 */").is_empty());
    }

    #[test]
    fn keywords_do_not_count_as_operands() {
        assert_eq!(texts("return |x| x"), vec!["|x| x"]);
        assert_eq!(texts("if ok { |x| x } else { || 0 }"), vec!["|x| x", "|| 0"]);
        assert_eq!(texts("throw || 1"), vec!["|| 1"]);
    }

    #[test]
    fn trailing_comments_stay_outside_the_span() {
        assert_eq!(texts("foo(|x| x // doubled later\n)"), vec!["|x| x"]);
    }

    #[test]
    fn fn_pointer_calls_are_spans() {
        assert_eq!(
            texts(r#"fn add(a, b) { a + b } Fn("add")"#),
            vec![r#"Fn("add")"#]
        );
        assert!(texts("x.Fn(1)").is_empty());
    }

    #[test]
    fn tagging_wraps_each_function_with_its_text() {
        assert_eq!(
            tag_function_sources("f(|x| x + \"!\")"),
            "f(sb_src(\"|x| x + \\\"!\\\"\", |x| x + \"!\"))"
        );
        assert_eq!(
            tag_function_sources("|x| |y| x"),
            "sb_src(\"|x| |y| x\", |x| sb_src(\"|y| x\", |y| x))"
        );
        assert!(matches!(tag_function_sources("1 + 2"), Cow::Borrowed("1 + 2")));
    }
}
