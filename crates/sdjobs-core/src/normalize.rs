//! Turning raw child output into display lines and structured progress.
//!
//! Everything here is pure: no I/O, no shared state. The supervisor feeds
//! pipe bytes through a [`LineBuffer`], every complete line through
//! [`LogNormalizer::normalize`], and every resulting line through
//! [`extract_progress`].

use std::sync::LazyLock;

use regex::Regex;

use crate::job::Progress;

/// Terminal "clear to end of line" sequence emitted on progress redraws.
const CLEAR_EOL: &str = "\x1b[K";

/// `[INFO ] stable-diffusion.cpp:1234  - ` style source-location prefix.
static SOURCE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\w+[^\]]*\]\s*\S+\.\w+:\d+\s+-.").expect("valid regex")
});

/// `|=====>    | 12/50 - 3.2it/s`
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|[^|]*\|\s*(\d+)/(\d+)\s*-\s*(\S+)").expect("valid regex")
});

// ---------------------------------------------------------------------------
// LineBuffer
// ---------------------------------------------------------------------------

/// Byte-level line splitter for a single pipe.
///
/// A line ends at `\n`, `\r\n`, or a lone `\r` (redraw). Bytes are only
/// decoded once a line is complete, so multi-byte characters split across
/// reads survive intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    after_cr: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if std::mem::take(&mut self.after_cr) && b == b'\n' {
                continue;
            }
            match b {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.after_cr = true;
                }
                _ => self.buf.push(b),
            }
        }
        lines
    }

    /// Flush the unterminated trailing fragment at end of stream.
    pub fn finish(mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

// ---------------------------------------------------------------------------
// LogNormalizer
// ---------------------------------------------------------------------------

/// Cleans raw output for display.
///
/// Holds the compiled root-path matcher; otherwise stateless, so one
/// instance is shared by every job.
#[derive(Debug, Clone)]
pub struct LogNormalizer {
    roots: Option<Regex>,
}

impl LogNormalizer {
    /// Build a normalizer that relativizes paths under any of `roots`
    /// (typically the installation root and the models root).
    pub fn new<I, S>(roots: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roots: Vec<String> = roots
            .into_iter()
            .map(|r| r.as_ref().trim_end_matches(std::path::MAIN_SEPARATOR).to_string())
            .filter(|r| !r.is_empty())
            .collect();
        // Longest first so a nested root wins over its parent.
        roots.sort_by_key(|r| std::cmp::Reverse(r.len()));
        roots.dedup();

        if roots.is_empty() {
            return Ok(Self { roots: None });
        }

        let alternation = roots
            .iter()
            .map(|r| regex::escape(r))
            .collect::<Vec<_>>()
            .join("|");
        let sep = regex::escape(&std::path::MAIN_SEPARATOR.to_string());
        let pattern = format!(r#"(^|["'\s])(?:{alternation}){sep}"#);
        Ok(Self {
            roots: Some(Regex::new(&pattern)?),
        })
    }

    /// A normalizer that rewrites no paths.
    pub fn without_roots() -> Self {
        Self { roots: None }
    }

    /// Split a raw chunk into clean display lines.
    pub fn normalize(&self, raw: &str) -> Vec<String> {
        raw.split(CLEAR_EOL)
            .flat_map(|part| part.split(['\n', '\r']))
            .map(str::trim)
            .filter(|s| s.chars().count() > 1)
            .map(|s| self.clean_line(s))
            .collect()
    }

    fn clean_line(&self, line: &str) -> String {
        let stripped = SOURCE_PREFIX_RE.replace(line, "");
        match &self.roots {
            Some(re) => re.replace_all(&stripped, "${1}").into_owned(),
            None => stripped.into_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Parse a progress-bar line. `None` simply means "not a progress line".
pub fn extract_progress(line: &str) -> Option<Progress> {
    let caps = PROGRESS_RE.captures(line)?;
    let current: u64 = caps[1].parse().ok()?;
    let total: u64 = caps[2].parse().ok()?;
    if total == 0 {
        return None;
    }
    Some(Progress {
        current,
        total,
        percentage: 100.0 * current as f64 / total as f64,
        speed: caps[3].to_string(),
    })
}
