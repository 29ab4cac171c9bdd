/*
 * This file is part of listless
 *
 * Copyright 2023 - The listless developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Canonicalising e-mail addresses.
//!
//! Everything that touches a recipient goes through [`normalise_email`]
//! first, so the roster and the member store agree on a single spelling for
//! each address. All three operations here are total: bad input yields an
//! empty string or [`ErrorKind::Unparseable`](crate::ErrorKind::Unparseable),
//! never a panic.

use crate::errors::*;

/// Reduce an address to its canonical form: trimmed, lowercased, and shaped
/// like a bare `local@domain` pair. Returns the empty string when the input
/// cannot be read as a plain address.
///
/// Canonicalisation is idempotent:
///
/// ```
/// use listless::addresses::normalise_email;
///
/// let once = normalise_email(" Cathal@garvey.me ");
/// assert_eq!(&once, "cathal@garvey.me");
/// assert_eq!(normalise_email(&once), once);
/// ```
pub fn normalise_email(input: &str) -> String {
    let addr = input.trim().to_lowercase();
    if is_plain_address(&addr) {
        addr
    } else {
        String::new()
    }
}

/// A bare addr-spec: one `@`, non-empty local part and domain, and none of
/// the characters that mark display-name or list syntax.
fn is_plain_address(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !addr
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | ',' | ';' | '"' | '(' | ')'))
}

/// Given a line `Foo Bar <foo@bar.com>`, return `foo@bar.com`; for a plain
/// `foo@bar.com` return simply that.
///
/// Fails with [`ErrorKind::Unparseable`](crate::ErrorKind::Unparseable) when
/// the line is neither form.
pub fn parse_expressive(line: &str) -> Result<String> {
    let line = line.trim();
    let normed = normalise_email(line);
    if !normed.is_empty() {
        return Ok(normed);
    }
    // Expressive form needs both brackets, in order, and the address between
    // the last pair.
    match (line.rfind('<'), line.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let normed = normalise_email(&line[open + 1..close]);
            if normed.is_empty() {
                Err(ErrorKind::Unparseable(line.to_string()).into())
            } else {
                Ok(normed)
            }
        }
        _ => Err(ErrorKind::Unparseable(line.to_string()).into()),
    }
}

/// Split a comma-joined header entry such as
/// `"Alice <a@x.com>, Bob <b@x.com>"` into its per-address segments. Each
/// returned segment can be fed to [`parse_expressive`].
///
/// A single plain address, or an entry without both `>` and `,`, is returned
/// as the only segment. Otherwise the entry is cut at every comma that
/// follows a closing bracket, advancing past the comma each time, so every
/// well-formed `Display <addr>` item is recovered exactly once.
pub fn split_address_list(entry: &str) -> Vec<String> {
    if !normalise_email(entry).is_empty() {
        return vec![entry.to_string()];
    }
    if !(entry.contains('>') && entry.contains(',')) {
        return vec![entry.to_string()];
    }
    let mut segments = Vec::new();
    let mut i = 0;
    loop {
        let Some(bracket) = entry[i..].find('>').map(|rel| i + rel) else {
            segments.push(entry[i..].to_string());
            break;
        };
        let Some(comma) = entry[bracket..].find(',').map(|rel| bracket + rel) else {
            segments.push(entry[i..].to_string());
            break;
        };
        segments.push(entry[i..comma].to_string());
        i = comma + 1;
        if i >= entry.len() {
            break;
        }
    }
    segments
}
