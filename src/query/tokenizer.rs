/// A single search term as typed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub negated: bool,
}

/// Split a search string on whitespace. Double quotes group a span,
/// spaces included, into one token; the quotes themselves are dropped.
/// A leading `-` marks the token as negated.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut raw = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    raw.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        raw.push(current);
    }

    raw.into_iter()
        .filter_map(|text| match text.strip_prefix('-') {
            // A lone "-" means nothing
            Some("") => None,
            Some(rest) => Some(Token {
                text: rest.to_string(),
                negated: true,
            }),
            None => Some(Token {
                text,
                negated: false,
            }),
        })
        .collect()
}
