// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded captured output.

/// Maximum size of captured logs, errors and build output.
pub const MAX_OUTPUT_BYTES: usize = 1_000_000;

/// Keep at most `limit` bytes from the start of `text`.
///
/// The cut never splits a multi-byte character, so the result may be a few
/// bytes shorter than `limit`.
pub fn truncate_head(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Keep at most `limit` bytes from the end of `text`.
pub fn truncate_tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
