// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Version strings in catalogs are free-form. The one family the agent
//! rewrites is date-style versions that a packaging tool is known to truncate
//! (`25.9.1` for `2025.09.01`); everything else passes through untouched.

use std::cmp::Ordering;

/// Normalizes a date-style version to `YYYY.MM.DD[.extra]`.
///
/// A version qualifies when it is a 3- or 4-part dotted numeric sequence and
/// its first part is a plausible year: 4 digits in 2000–2100, or 2 digits
/// with a month of 1–12 and a day of 1–31. Two-digit years ≤50 expand to
/// `20YY`, the rest to `19YY`. Anything else is returned byte-for-byte.
pub fn normalize(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('.').collect();
    if !(3..=4).contains(&parts.len()) {
        return raw.to_string();
    }

    let numeric: Option<Vec<u64>> = parts.iter().map(|p| p.parse::<u64>().ok()).collect();
    let Some(nums) = numeric else {
        return raw.to_string();
    };

    let year = match (parts[0].len(), nums[0]) {
        (4, y) if (2000..=2100).contains(&y) => y,
        (2, y) if (1..=12).contains(&nums[1]) && (1..=31).contains(&nums[2]) => {
            if y <= 50 {
                2000 + y
            } else {
                1900 + y
            }
        }
        _ => return raw.to_string(),
    };

    let mut out = format!("{year}.{:02}.{:02}", nums[1], nums[2]);
    if let Some(extra) = nums.get(3) {
        out.push('.');
        out.push_str(&extra.to_string());
    }
    out
}

/// Version-aware ordering: both sides are normalized, then compared part by
/// part, numerically where both parts parse and lexicographically otherwise.
/// Missing trailing parts count as zero, so `1.2` equals `1.2.0`.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = normalize(a);
    let b = normalize(b);
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let pa = a_parts.get(i).copied().unwrap_or("0");
        let pb = b_parts.get(i).copied().unwrap_or("0");
        let ord = match (pa.parse::<u64>(), pb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => pa.cmp(pb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// True when `installed` satisfies `wanted` (greater or equal).
pub fn satisfies(installed: &str, wanted: &str) -> bool {
    compare(installed, wanted) != Ordering::Less
}

/// Splits a `requires`/`update_for` reference into name and optional version.
///
/// Accepted forms are `Name`, `Name-Version` and `Name--Version`. The
/// double-dash form always wins. With a single dash, the trailing segment is
/// only treated as a version when it contains a digit and a dot or
/// underscore, so `seven-zip` stays one name while `seven-zip-24.08` splits.
pub fn split_name_version(reference: &str) -> (&str, Option<&str>) {
    if let Some((name, version)) = reference.rsplit_once("--") {
        if !name.is_empty() && !version.is_empty() {
            return (name, Some(version));
        }
    }
    if let Some((name, candidate)) = reference.rsplit_once('-') {
        let looks_like_version = !name.is_empty()
            && candidate.chars().any(|c| c.is_ascii_digit())
            && candidate.chars().any(|c| c == '.' || c == '_');
        if looks_like_version {
            return (name, Some(candidate));
        }
    }
    (reference, None)
}
