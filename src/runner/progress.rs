//! Progress extraction from raw script output.
//!
//! The update script prints pacman-style progress lines. Three shapes are
//! recognised, tried in this order so the bare percentage never shadows a
//! more specific match:
//!
//! 1. `[#####.....] 42% [3/7]`, a bracketed bar, a percentage and a step
//! 2. `42% [3/7]`, a percentage and a step
//! 3. `42%`, a bare percentage
//!
//! ANSI color sequences are stripped before matching. The parser is a pure
//! function; it never fails and keeps no state between chunks.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI regex"));

static BAR_PERCENT_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[^\]]*\]\s*(\d{1,3})%\s*\[(\d+)/(\d+)\]").expect("valid bar regex")
});

static PERCENT_STEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%\s*\[(\d+)/(\d+)\]").expect("valid step regex"));

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").expect("valid percent regex"));

/// One progress observation. Values above 100 in the input are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Completion percentage, `0..=100`.
    pub percent: u8,
    /// `(current, total)` step counter when the line carried one.
    pub step: Option<(u32, u32)>,
}

/// Extract a progress event from a chunk of output.
///
/// When a chunk holds several progress lines, the last match of the most
/// specific pattern wins, since it reflects the child's latest state.
///
/// ```rust
/// use multi_updater::runner::progress::{parse, ProgressEvent};
///
/// assert_eq!(
///     parse("\x1b[32m[####------] 40% [2/5]\x1b[0m"),
///     Some(ProgressEvent { percent: 40, step: Some((2, 5)) })
/// );
/// assert_eq!(parse("Downloading 7%"), Some(ProgressEvent { percent: 7, step: None }));
/// assert_eq!(parse("nothing to see"), None);
/// ```
#[must_use]
pub fn parse(text: &str) -> Option<ProgressEvent> {
    if text.trim().is_empty() {
        return None;
    }
    let clean = ANSI_ESCAPE.replace_all(text, "");

    for pattern in [&*BAR_PERCENT_STEP, &*PERCENT_STEP] {
        if let Some(caps) = pattern.captures_iter(&clean).last() {
            let percent = clamp_percent(&caps[1]);
            let current = caps[2].parse().ok();
            let total = caps[3].parse().ok();
            return Some(ProgressEvent {
                percent,
                step: current.zip(total),
            });
        }
    }

    PERCENT.captures_iter(&clean).last().map(|caps| ProgressEvent {
        percent: clamp_percent(&caps[1]),
        step: None,
    })
}

fn clamp_percent(digits: &str) -> u8 {
    digits.parse::<u16>().map(|p| p.min(100) as u8).unwrap_or(100)
}
