//! Offset pagination for listings

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// Offset of the next page, empty on the last page
    pub next_token: String,
}

/// Take up to `max` items starting at `offset`
///
/// `max == 0` returns everything from `offset` on. An offset past the end
/// yields an empty page.
pub fn paginate<T>(items: Vec<T>, offset: usize, max: usize) -> Page<T> {
    let total = items.len();
    if offset >= total {
        return Page {
            entries: Vec::new(),
            next_token: String::new(),
        };
    }

    let end = if max == 0 {
        total
    } else {
        offset.saturating_add(max).min(total)
    };
    let entries: Vec<T> = items.into_iter().skip(offset).take(end - offset).collect();
    let next_token = if end < total {
        end.to_string()
    } else {
        String::new()
    };

    Page {
        entries,
        next_token,
    }
}

/// Parse a decimal offset token; empty means the first page
pub fn parse_offset(token: &str) -> Option<usize> {
    if token.is_empty() {
        return Some(0);
    }
    token.parse::<usize>().ok()
}
