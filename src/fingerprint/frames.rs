//! Backtrace frame extraction.
//!
//! Only application frames say anything about *where* an error comes from;
//! dependency and runtime frames are identical across unrelated errors. A
//! [`FrameFilter`] decides which frames are application frames by path
//! fragment, so the same logic serves Ruby gems, npm packages, Python
//! site-packages or cargo registries.

use once_cell::sync::Lazy;
use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::FrameConfig;

/// Number of frames folded into a backtrace signature.
pub const SIGNATURE_FRAMES: usize = 5;

const UNKNOWN_METHOD: &str = "unknown";

/// Frame syntaxes, tried in order. Each exposes `file` and optionally `method`.
static FRAME_SYNTAXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Python: File "app/models.py", line 12, in save
        r#"^\s*File "(?P<file>[^"]+)", line \d+(?:, in (?P<method>.+?))?\s*$"#,
        // JVM: at com.example.Foo.bar(Foo.java:12)
        r"^\s*at (?P<method>[\w$.<>]+)\((?P<file>[^:()]+)(?::\d+)?\)\s*$",
        // V8: at handler (/srv/app/src/h.js:10:5)  |  at /srv/app/src/h.js:10:5
        r"^\s*at (?:(?P<method>.+?) \()?(?P<file>[^()\s]+?):\d+(?::\d+)?\)?\s*$",
        // Ruby and bare path:line[:col][:in 'method']
        r"^\s*(?P<file>[^:\s][^:]*?):\d+(?::\d+)?(?::in [`'](?P<method>[^'`]+)['`])?",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("frame syntax {p}: {e}")))
    .collect()
});

static DEFAULT_FILTER: Lazy<FrameFilter> = Lazy::new(FrameFilter::default);

/// A parsed frame location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: String,
    pub method: String,
}

fn parse_frame(raw: &str) -> Option<Frame> {
    FRAME_SYNTAXES.iter().find_map(|re| {
        let caps = re.captures(raw)?;
        let file = caps.name("file")?.as_str().trim();
        if file.is_empty() {
            return None;
        }
        let method = caps
            .name("method")
            .map(|m| m.as_str().trim())
            .filter(|m| !m.is_empty())
            .unwrap_or(UNKNOWN_METHOD);
        Some(Frame {
            file: file.to_string(),
            method: method.to_string(),
        })
    })
}

/// Application-frame filter built from [`FrameConfig`].
#[derive(Debug, Clone)]
pub struct FrameFilter {
    excluded: Vec<String>,
    project_dirs: Vec<String>,
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

impl FrameFilter {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            excluded: config.excluded_path_fragments.clone(),
            project_dirs: config.project_dirs.clone(),
        }
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|frag| path.contains(frag.as_str()))
    }

    /// Cut everything before the earliest project directory that starts a
    /// path segment. Paths without one are returned unchanged.
    fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        let earliest = self
            .project_dirs
            .iter()
            .filter_map(|dir| segment_start(path, dir))
            .min();
        match earliest {
            Some(pos) => &path[pos..],
            None => path,
        }
    }

    /// The first `count` application frames as `"file:method"`, or `None`
    /// when no frame survives filtering.
    pub fn significant_frames<S: AsRef<str>>(
        &self,
        backtrace: &[S],
        count: usize,
    ) -> Option<Vec<String>> {
        let frames: Vec<String> = backtrace
            .iter()
            .filter_map(|raw| parse_frame(raw.as_ref()))
            .filter(|f| !self.is_excluded(&f.file))
            .take(count)
            .map(|f| format!("{}:{}", self.strip_prefix(&f.file), f.method))
            .collect();

        if frames.is_empty() {
            None
        } else {
            Some(frames)
        }
    }

    /// Digest of the leading application frames.
    pub fn signature<S: AsRef<str>>(&self, backtrace: &[S]) -> Option<String> {
        let frames = self.significant_frames(backtrace, SIGNATURE_FRAMES)?;
        Some(format!("{:016x}", xxh3_64(frames.join("\n").as_bytes())))
    }
}

/// Byte offset where `dir` begins a segment of `path` (start of string or
/// right after a `/`).
fn segment_start(path: &str, dir: &str) -> Option<usize> {
    if path.starts_with(dir) {
        return Some(0);
    }
    path.match_indices(dir)
        .map(|(i, _)| i)
        .find(|&i| i > 0 && path.as_bytes()[i - 1] == b'/')
}

/// [`FrameFilter::significant_frames`] with the default filter.
pub fn extract_significant_frames<S: AsRef<str>>(
    backtrace: &[S],
    count: usize,
) -> Option<Vec<String>> {
    DEFAULT_FILTER.significant_frames(backtrace, count)
}

/// [`FrameFilter::signature`] with the default filter.
pub fn backtrace_signature<S: AsRef<str>>(backtrace: &[S]) -> Option<String> {
    DEFAULT_FILTER.signature(backtrace)
}
