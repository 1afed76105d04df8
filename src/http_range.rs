#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub length: u64,
}

impl RangeSpec {
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeError::Invalid => write!(f, "invalid range"),
            RangeError::Unsatisfiable => write!(f, "unsatisfiable range"),
        }
    }
}

/// Parses a `Range` header into the requested spans. Any malformed spec
/// invalidates the whole header; the caller falls back to a full-body
/// response instead of failing the request.
pub fn parse_ranges(header: &str, size: u64) -> Result<Vec<RangeSpec>, RangeError> {
    let header = header.trim();
    let Some(list) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };

    let mut ranges = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((start_str, end_str)) = part.split_once('-') else {
            return Err(RangeError::Invalid);
        };
        let start_str = start_str.trim();
        let end_str = end_str.trim();

        if start_str.is_empty() {
            // suffix range: bytes=-N, the final N bytes
            let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            if suffix == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            let start = size.saturating_sub(suffix);
            ranges.push(RangeSpec {
                start,
                length: size - start,
            });
            continue;
        }

        let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
        if start >= size {
            return Err(RangeError::Unsatisfiable);
        }
        let end = if end_str.is_empty() {
            size - 1
        } else {
            let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            if end < start {
                return Err(RangeError::Invalid);
            }
            end.min(size - 1)
        };
        ranges.push(RangeSpec {
            start,
            length: end - start + 1,
        });
    }

    if ranges.is_empty() {
        return Err(RangeError::Invalid);
    }
    Ok(ranges)
}

pub fn build_content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {}-{}/{}", start, end, size)
}
