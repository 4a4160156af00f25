//! `agent://` resource URIs and single HTTP byte ranges.
//!
//! A URI looks like `agent://<job id, base64url without padding>/<path>#bytes=0-99`.
//! The fragment is optional and uses the `Range` header syntax.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::ResourceError;
use crate::model::manifest::normalize_relative_path;

pub const AGENT_SCHEME: &str = "agent://";

/// One byte range as written in a `Range` header. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Parse a `Range` header value. More than one range is an error rather
    /// than being partially honored.
    pub fn parse(value: &str) -> Result<Self, ResourceError> {
        let value = value.trim();
        let spec = value
            .strip_prefix("bytes=")
            .ok_or_else(|| ResourceError::MalformedRange(value.to_string()))?;
        if spec.contains(',') {
            return Err(ResourceError::MultipleRanges(value.to_string()));
        }
        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| ResourceError::MalformedRange(value.to_string()))?;
        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| ResourceError::MalformedRange(value.to_string()))
        };

        match (first.trim().is_empty(), last.trim().is_empty()) {
            (true, true) => Err(ResourceError::MalformedRange(value.to_string())),
            (true, false) => Ok(ByteRange::Suffix(number(last)?)),
            (false, true) => Ok(ByteRange::From(number(first)?)),
            (false, false) => {
                let (start, end) = (number(first)?, number(last)?);
                if end < start {
                    return Err(ResourceError::MalformedRange(value.to_string()));
                }
                Ok(ByteRange::FromTo(start, end))
            }
        }
    }

    /// Offsets `[start, end)` within a file of `size` bytes.
    pub fn to_offsets(&self, size: u64) -> Result<(u64, u64), ResourceError> {
        let unsatisfiable = ResourceError::RangeNotSatisfiable { size };
        match *self {
            ByteRange::FromTo(start, end) if start < size => {
                Ok((start, end.saturating_add(1).min(size)))
            }
            ByteRange::From(start) if start < size => Ok((start, size)),
            ByteRange::Suffix(n) if n > 0 && size > 0 => Ok((size.saturating_sub(n), size)),
            _ => Err(unsatisfiable),
        }
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteRange::FromTo(a, b) => write!(f, "bytes={}-{}", a, b),
            ByteRange::From(a) => write!(f, "bytes={}-", a),
            ByteRange::Suffix(n) => write!(f, "bytes=-{}", n),
        }
    }
}

/// A parsed `agent://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResourceUri {
    pub job_id: String,
    pub relative_path: String,
    pub range: Option<ByteRange>,
}

impl AgentResourceUri {
    pub fn new(job_id: impl Into<String>, relative_path: &str) -> Result<Self, ResourceError> {
        let relative_path = normalize_relative_path(relative_path)
            .ok_or_else(|| ResourceError::PathOutsideJobDirectory(relative_path.to_string()))?;
        Ok(Self {
            job_id: job_id.into(),
            relative_path,
            range: None,
        })
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn parse(uri: &str) -> Result<Self, ResourceError> {
        let rest = uri
            .strip_prefix(AGENT_SCHEME)
            .ok_or_else(|| ResourceError::MalformedUri(uri.to_string()))?;
        let (location, fragment) = match rest.split_once('#') {
            Some((location, fragment)) => (location, Some(fragment)),
            None => (rest, None),
        };
        let (encoded_job, path) = location.split_once('/').unwrap_or((location, ""));
        if encoded_job.is_empty() {
            return Err(ResourceError::MalformedUri(uri.to_string()));
        }

        let job_id = URL_SAFE_NO_PAD
            .decode(encoded_job)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ResourceError::InvalidJobId(encoded_job.to_string()))?;

        let mut parsed = Self::new(job_id, path)?;
        if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
            parsed.range = Some(ByteRange::parse(fragment)?);
        }
        Ok(parsed)
    }
}

impl std::fmt::Display for AgentResourceUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}/{}",
            AGENT_SCHEME,
            URL_SAFE_NO_PAD.encode(self.job_id.as_bytes()),
            self.relative_path
        )?;
        if let Some(range) = &self.range {
            write!(f, "#{}", range)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_with_range() {
        let uri = AgentResourceUri::new("job-1", "logs/stdout")
            .unwrap()
            .with_range(ByteRange::FromTo(10, 19))
            .to_string();
        let parsed = AgentResourceUri::parse(&uri).unwrap();
        assert_eq!(parsed.job_id, "job-1");
        assert_eq!(parsed.relative_path, "logs/stdout");
        assert_eq!(parsed.range, Some(ByteRange::FromTo(10, 19)));
    }

    #[test]
    fn root_path_is_empty() {
        let encoded = URL_SAFE_NO_PAD.encode("job-1");
        let parsed = AgentResourceUri::parse(&format!("agent://{}", encoded)).unwrap();
        assert_eq!(parsed.relative_path, "");
        assert!(parsed.range.is_none());
    }

    #[test]
    fn open_ended_range_is_clamped_to_size() {
        let range = ByteRange::parse("bytes=0-18446744073709551615").unwrap();
        assert_eq!(range, ByteRange::FromTo(0, u64::MAX));
        assert_eq!(range.to_offsets(100).unwrap(), (0, 100));
        assert_eq!(
            ByteRange::FromTo(100, u64::MAX).to_offsets(100),
            Err(ResourceError::RangeNotSatisfiable { size: 100 })
        );
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!(
            AgentResourceUri::parse("s3://bucket/key"),
            Err(ResourceError::MalformedUri(_))
        ));
        assert!(matches!(
            AgentResourceUri::parse("agent://!!!/x"),
            Err(ResourceError::InvalidJobId(_))
        ));
        let encoded = URL_SAFE_NO_PAD.encode("job-1");
        assert!(matches!(
            AgentResourceUri::parse(&format!("agent://{}/../secret", encoded)),
            Err(ResourceError::PathOutsideJobDirectory(_))
        ));
    }

    #[test]
    fn multiple_ranges_are_rejected() {
        assert!(matches!(
            ByteRange::parse("bytes=0-1,5-6"),
            Err(ResourceError::MultipleRanges(_))
        ));
    }

    #[test]
    fn range_offsets_are_exclusive_and_clamped() {
        assert_eq!(ByteRange::FromTo(0, 9).to_offsets(100).unwrap(), (0, 10));
        assert_eq!(ByteRange::FromTo(90, 500).to_offsets(100).unwrap(), (90, 100));
        assert_eq!(ByteRange::From(40).to_offsets(100).unwrap(), (40, 100));
        assert_eq!(ByteRange::Suffix(10).to_offsets(100).unwrap(), (90, 100));
        assert_eq!(ByteRange::Suffix(500).to_offsets(100).unwrap(), (0, 100));
        assert!(ByteRange::From(100).to_offsets(100).is_err());
        assert!(ByteRange::Suffix(0).to_offsets(100).is_err());
    }

    #[test]
    fn parses_range_forms() {
        assert_eq!(ByteRange::parse("bytes=5-").unwrap(), ByteRange::From(5));
        assert_eq!(ByteRange::parse("bytes=-5").unwrap(), ByteRange::Suffix(5));
        assert!(ByteRange::parse("bytes=9-1").is_err());
        assert!(ByteRange::parse("items=0-1").is_err());
        assert!(ByteRange::parse("bytes=-").is_err());
    }
}
