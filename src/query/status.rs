/// A status-code predicate: `404`, `2xx`, `400-404`, `>=500`, `<300` ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Exact(u16),
    /// Inclusive range
    Range(u16, u16),
    AtLeast(u16),
    AtMost(u16),
    Above(u16),
    Below(u16),
}

impl StatusFilter {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some(rest) = text.strip_prefix(">=") {
            return parse_code(rest).map(StatusFilter::AtLeast);
        }
        if let Some(rest) = text.strip_prefix("<=") {
            return parse_code(rest).map(StatusFilter::AtMost);
        }
        if let Some(rest) = text.strip_prefix('>') {
            return parse_code(rest).map(StatusFilter::Above);
        }
        if let Some(rest) = text.strip_prefix('<') {
            return parse_code(rest).map(StatusFilter::Below);
        }

        if let Some(bucket) = parse_bucket(text) {
            return Some(StatusFilter::Range(bucket, bucket + 99));
        }

        if let Some((low, high)) = text.split_once('-') {
            let low = parse_code(low)?;
            let high = parse_code(high)?;
            return Some(StatusFilter::Range(low.min(high), low.max(high)));
        }

        parse_code(text).map(StatusFilter::Exact)
    }

    pub fn matches(&self, code: u16) -> bool {
        match *self {
            StatusFilter::Exact(value) => code == value,
            StatusFilter::Range(low, high) => (low..=high).contains(&code),
            StatusFilter::AtLeast(value) => code >= value,
            StatusFilter::AtMost(value) => code <= value,
            StatusFilter::Above(value) => code > value,
            StatusFilter::Below(value) => code < value,
        }
    }
}

fn parse_code(text: &str) -> Option<u16> {
    text.trim().parse().ok()
}

/// `Nxx` (any case) -> N * 100
fn parse_bucket(text: &str) -> Option<u16> {
    let mut chars = text.chars();
    let digit = chars.next()?.to_digit(10)?;
    let rest: Vec<char> = chars.collect();
    if rest.len() == 2 && rest.iter().all(|c| c.eq_ignore_ascii_case(&'x')) {
        Some(digit as u16 * 100)
    } else {
        None
    }
}
