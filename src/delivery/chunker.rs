//! Message splitting for the radio frame budget.

/// Room kept for a `[i/n] ` marker. Covers up to 99 chunks; longer messages
/// recompute it.
pub const MARKER_RESERVE: usize = 8;

/// Split `text` into pieces of at most `max_bytes` bytes.
///
/// Preference order for each cut: the last sentence boundary (`. `, `! `,
/// `? ` or newline) if it lies past half the bound, then the last word
/// boundary, then a hard cut on a UTF-8 character boundary. Pieces are
/// trimmed and empty pieces dropped, so whitespace-only input yields nothing.
pub fn split_message(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            chunks.push(rest.to_string());
            break;
        }

        let mut end = max_bytes;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single character wider than the bound; emit it alone.
            end = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }

        let cut = sentence_cut(rest, end)
            .filter(|&c| c > max_bytes / 2)
            .or_else(|| word_cut(rest, end))
            .unwrap_or(end);

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
    chunks
}

/// Cut position just after the last sentence terminator in `rest[..end]`.
/// A terminator at the very end of the window counts when whitespace follows it.
fn sentence_cut(rest: &str, end: usize) -> Option<usize> {
    let window = &rest[..end];
    let followed_by_space = rest[end..].starts_with(char::is_whitespace);
    let mut best = window.rfind('\n').map(|p| p + 1);
    for pat in [". ", "! ", "? "] {
        if let Some(p) = window.rfind(pat) {
            best = best.max(Some(p + 1));
        }
    }
    if followed_by_space && window.ends_with(['.', '!', '?']) {
        best = Some(end);
    }
    best.filter(|&c| c > 0)
}

fn word_cut(rest: &str, end: usize) -> Option<usize> {
    if rest[end..].starts_with(char::is_whitespace) {
        return Some(end);
    }
    rest[..end]
        .rfind(char::is_whitespace)
        .filter(|&p| p > 0)
}

/// Split `text` for transmission, prefixing `[i/n] ` to every piece of a
/// multi-part message when `markers` is set. Every returned piece fits in
/// `max_bytes`, markers included.
pub fn chunk_message(text: &str, max_bytes: usize, markers: bool) -> Vec<String> {
    let plain = split_message(text, max_bytes);
    if !markers || plain.len() <= 1 {
        return plain;
    }

    let mut reserve = MARKER_RESERVE;
    loop {
        let pieces = split_message(text, max_bytes.saturating_sub(reserve));
        let total = pieces.len();
        let needed = format!("[{0}/{0}] ", total).len();
        if needed <= reserve {
            return pieces
                .into_iter()
                .enumerate()
                .map(|(i, p)| format!("[{}/{}] {}", i + 1, total, p))
                .collect();
        }
        reserve = needed;
    }
}
