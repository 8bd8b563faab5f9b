//! Secret redaction for anything that ends up in logs or status snapshots.
//!
//! RTMP endpoints carry the stream key as the last path segment
//! (`rtmp://a.rtmp.youtube.com/live2/<key>`). Two passes are applied: known
//! keys are replaced wherever they appear, then the final path segment of any
//! `rtmp(s)://` URL is replaced even when the key is unknown.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Constant placeholder substituted for secrets.
pub const REDACTED: &str = "<redacted>";

static RTMP_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(rtmps?://[^\s/'"]+(?:/[^\s/'"]+)*/)[^\s/'"]+"#)
        .expect("rtmp url pattern is valid")
});

/// Redacts configured stream keys and RTMP URL key segments.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Create a redactor for the given secrets. Empty strings are ignored.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a key that contains another key is fully replaced.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets }
    }

    /// Build a redactor from endpoint URLs, treating each URL's last path segment as the key.
    pub fn from_urls<'a>(urls: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(urls.into_iter().filter_map(stream_key))
    }

    /// Redact `text`. Borrowed when nothing needed replacing.
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), REDACTED));
            }
        }
        match out {
            Cow::Borrowed(s) => redact_rtmp_urls(s),
            Cow::Owned(s) => Cow::Owned(redact_rtmp_urls(&s).into_owned()),
        }
    }

    /// Redact every argument of a command line and join it for display.
    pub fn redact_command(&self, program: &str, args: &[String]) -> String {
        std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(|part| self.redact(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Replace the final path segment of every `rtmp(s)://` URL in `text`.
pub fn redact_rtmp_urls(text: &str) -> Cow<'_, str> {
    RTMP_URL.replace_all(text, format!("${{1}}{REDACTED}").as_str())
}

/// The stream key of an RTMP URL: its last non-empty path segment.
fn stream_key(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let (_, path) = rest.split_once('/')?;
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .filter(|_| path.contains('/'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_rtmp_key_segment() {
        let line = "Opening output rtmp://a.rtmp.youtube.com/live2/abcd-efgh-ijkl";
        assert_eq!(
            redact_rtmp_urls(line),
            "Opening output rtmp://a.rtmp.youtube.com/live2/<redacted>"
        );
    }

    #[test]
    fn redacts_backup_style_url() {
        let url = "rtmp://b.rtmp.youtube.com/live2?backup=1/abcd-efgh";
        assert_eq!(
            redact_rtmp_urls(url),
            "rtmp://b.rtmp.youtube.com/live2?backup=1/<redacted>"
        );
    }

    #[test]
    fn redacts_known_keys_anywhere() {
        let redactor = Redactor::from_urls(["rtmp://a.rtmp.youtube.com/live2/secret-key-1"]);
        let line = "[flv @ 0x1] key secret-key-1 rejected";
        assert_eq!(redactor.redact(line), "[flv @ 0x1] key <redacted> rejected");
    }

    #[test]
    fn leaves_clean_text_borrowed() {
        let redactor = Redactor::new(["k1"]);
        assert!(matches!(
            redactor.redact("frame=  10 fps=25 time=00:00:01.00"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn redacts_command_lines() {
        let redactor = Redactor::from_urls(["rtmp://live.example.com/app/KEY123"]);
        let args = vec![
            "-i".to_string(),
            "live.m3u8".to_string(),
            "rtmp://live.example.com/app/KEY123".to_string(),
        ];
        let shown = redactor.redact_command("ffmpeg", &args);
        assert!(!shown.contains("KEY123"));
        assert!(shown.ends_with("rtmp://live.example.com/app/<redacted>"));
    }

    #[test]
    fn extracts_stream_key() {
        assert_eq!(
            stream_key("rtmp://a.rtmp.youtube.com/live2/abc"),
            Some("abc".to_string())
        );
        assert_eq!(stream_key("rtmp://host/app"), None);
        assert_eq!(stream_key("not a url"), None);
    }
}
