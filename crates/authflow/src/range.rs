// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Range header parsing.
//!
//! `Auth-Range: <l>-<r>` carries an exclusive end; `Range: bytes=<l>-<r>`
//! is the HTTP form with an inclusive end. Either side may be empty. Missing
//! or malformed headers mean "the whole resource".

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestedRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl RequestedRange {
    /// Resolve against a resource of `length` bytes into a half-open
    /// `[start, end)` clamped to the resource. `inclusive_end` is set for
    /// HTTP ranges.
    #[must_use]
    pub fn bounds(&self, length: u64, inclusive_end: bool) -> (u64, u64) {
        let end = match self.end {
            Some(end) if inclusive_end => end.saturating_add(1),
            Some(end) => end,
            None => length,
        }
        .min(length);
        (self.start.min(end), end)
    }
}

fn parse_bound(digits: &str) -> Option<Option<u64>> {
    if digits.is_empty() {
        return Some(None);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(Some)
}

fn parse_pair(text: &str) -> RequestedRange {
    let parsed = text.split_once('-').and_then(|(l, r)| {
        let start = parse_bound(l)?.unwrap_or(0);
        let end = parse_bound(r)?;
        Some(RequestedRange { start, end })
    });
    parsed.unwrap_or_default()
}

pub fn parse_auth_range(header: Option<&str>) -> RequestedRange {
    header.map(parse_pair).unwrap_or_default()
}

pub fn parse_http_range(header: Option<&str>) -> RequestedRange {
    header
        .and_then(|h| h.strip_prefix("bytes="))
        .map(parse_pair)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_range() {
        assert_eq!(
            parse_auth_range(Some("4-10")),
            RequestedRange {
                start: 4,
                end: Some(10)
            }
        );
        assert_eq!(
            parse_auth_range(Some("-10")),
            RequestedRange {
                start: 0,
                end: Some(10)
            }
        );
        assert_eq!(
            parse_auth_range(Some("7-")),
            RequestedRange {
                start: 7,
                end: None
            }
        );
        assert_eq!(parse_auth_range(None), RequestedRange::default());
        assert_eq!(parse_auth_range(Some("a-b")), RequestedRange::default());
        assert_eq!(parse_auth_range(Some("1-2-3")), RequestedRange::default());
        assert_eq!(parse_auth_range(Some("bytes=1-2")), RequestedRange::default());
    }

    #[test]
    fn test_http_range() {
        assert_eq!(
            parse_http_range(Some("bytes=0-99")),
            RequestedRange {
                start: 0,
                end: Some(99)
            }
        );
        assert_eq!(parse_http_range(Some("0-99")), RequestedRange::default());
        assert_eq!(parse_http_range(Some("bytes=+1-2")), RequestedRange::default());
    }

    #[test]
    fn test_bounds() {
        let length = 100;
        assert_eq!(parse_http_range(Some("bytes=10-19")).bounds(length, true), (10, 20));
        assert_eq!(parse_auth_range(Some("10-20")).bounds(length, false), (10, 20));
        assert_eq!(parse_auth_range(Some("90-")).bounds(length, false), (90, 100));
        assert_eq!(parse_auth_range(Some("50-500")).bounds(length, false), (50, 100));
        assert_eq!(parse_auth_range(Some("150-")).bounds(length, false), (100, 100));
    }
}
