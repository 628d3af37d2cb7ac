//! Request-line parsing
//!
//! Clients send a single `METHOD path` line. Only the path decides what
//! happens; HTTP headers that may follow are ignored.

use std::fmt;

/// Payload family a video client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat(String);

impl StreamFormat {
    const CODEC_PREFIXES: [&'static str; 3] = ["avc", "h264", "h265"];

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// No format segment means JPEG images.
    pub fn image() -> Self {
        Self(String::from("jpg"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the client expects a hardware-codec bitstream and therefore
    /// the codec config unit before any access unit.
    pub fn wants_codec_config(&self) -> bool {
        let token = self.0.to_ascii_lowercase();
        Self::CODEC_PREFIXES.iter().any(|p| token.starts_with(p))
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `/v{N}/video` or `/v{N}/video/{format}`, any method
    Video { format: StreamFormat },
    /// `GET /ping`
    Ping,
    /// `PUT /v1/tally/...`
    Tally,
    Unknown,
}

impl Request {
    /// Parse the first line of `raw`.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let line = text.lines().next().unwrap_or_default();
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Self::Unknown;
        };

        // Query strings carry nothing we act on
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["ping"] if method.eq_ignore_ascii_case("GET") => Self::Ping,
            ["v1", "tally", ..] if method.eq_ignore_ascii_case("PUT") => Self::Tally,
            [version, "video"] if is_version(version) => Self::Video {
                format: StreamFormat::image(),
            },
            [version, "video", format, ..] if is_version(version) => Self::Video {
                format: StreamFormat::new(*format),
            },
            _ => Self::Unknown,
        }
    }
}

/// `v` followed by anything; the version token itself is not validated.
fn is_version(segment: &str) -> bool {
    segment.len() > 1 && segment.starts_with(['v', 'V'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(format: &str) -> Request {
        Request::Video {
            format: StreamFormat::new(format),
        }
    }

    #[test]
    fn video_paths_accept_any_version_token() {
        assert_eq!(Request::parse(b"GET /v1/video/jpg HTTP/1.1\r\n"), video("jpg"));
        assert_eq!(Request::parse(b"CMD /v2/video/avc/1280x720"), video("avc"));
        assert_eq!(Request::parse(b"GET /v5/video/h264?res=720"), video("h264"));
        assert_eq!(Request::parse(b"GET /v99/video"), video("jpg"));
    }

    #[test]
    fn codec_family_is_detected_by_prefix() {
        assert!(StreamFormat::new("avc").wants_codec_config());
        assert!(StreamFormat::new("H264.annexb").wants_codec_config());
        assert!(StreamFormat::new("h265").wants_codec_config());
        assert!(!StreamFormat::new("jpg").wants_codec_config());
        assert!(!StreamFormat::image().wants_codec_config());
    }

    #[test]
    fn ping_and_tally_need_their_methods() {
        assert_eq!(Request::parse(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n"), Request::Ping);
        assert_eq!(Request::parse(b"POST /ping"), Request::Unknown);
        assert_eq!(Request::parse(b"PUT /v1/tally/on"), Request::Tally);
        assert_eq!(Request::parse(b"GET /v1/tally/on"), Request::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(Request::parse(b""), Request::Unknown);
        assert_eq!(Request::parse(b"GET"), Request::Unknown);
        assert_eq!(Request::parse(b"GET /video/jpg"), Request::Unknown);
        assert_eq!(Request::parse(&[0xff, 0xfe, b' ', b'/']), Request::Unknown);
    }
}
