//! Progressive caption reveal, gated on the avatar's streaming flag.
//!
//! The caption waits for speech to start, then reveals one visible character per tick.
//! Markup tags appear instantly and every partial render is closed so it stays
//! well-formed. After the reveal, controls come back once speech has stopped plus a short
//! grace delay.

use crate::cancel::CancellationToken;
use crate::config::CaptionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::StreamingView;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Elements that never take a closing tag.
const VOID_TAGS: &[&str] = &["br", "hr", "img", "wbr"];

/// Where the caption is displayed.
pub trait CaptionSurface: Send + Sync {
    /// Replace the caption with `markup`.
    fn render(&self, markup: &str);

    /// Enable or disable the interactive controls (send, record, replay).
    fn set_controls_enabled(&self, enabled: bool);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptionBuffer {
    pub sanitized_content: String,
    pub reveal_speed_ms_per_char: u64,
    pub is_revealing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealOutcome {
    Completed,
    /// Stopped early; the full content is on screen.
    Interrupted,
}

pub struct CaptionRevealController {
    config: CaptionConfig,
    surface: Arc<dyn CaptionSurface>,
    streaming: StreamingView,
    buffer: Mutex<CaptionBuffer>,
    current: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
}

impl CaptionRevealController {
    pub fn new(
        config: CaptionConfig,
        surface: Arc<dyn CaptionSurface>,
        streaming: StreamingView,
    ) -> Self {
        let buffer = CaptionBuffer {
            reveal_speed_ms_per_char: config.reveal_speed_ms_per_char,
            ..Default::default()
        };
        Self {
            config,
            surface,
            streaming,
            buffer: Mutex::new(buffer),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Reveal `sanitized` once speech starts.
    ///
    /// Fails with `Timeout` if speech never starts (or never stops afterwards) within
    /// the configured bound; the full content is shown in that case.
    pub async fn reveal(&self, sanitized: &str) -> VoiceResult<RevealOutcome> {
        let (content, truncated) = truncate_markup(sanitized, self.config.max_visible_chars);
        if truncated {
            warn!(
                "caption: content exceeds {} visible characters, truncated",
                self.config.max_visible_chars
            );
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        {
            let mut buffer = self.buffer.lock();
            buffer.sanitized_content = content.clone();
            buffer.is_revealing = true;
        }
        self.surface.set_controls_enabled(false);
        self.surface.render("");

        let started = token
            .run_until_cancelled(
                self.streaming
                    .wait_until_streaming(self.config.stream_wait_timeout()),
            )
            .await;
        match started {
            Err(VoiceError::Cancelled) => return Ok(RevealOutcome::Interrupted),
            Err(e) => return Err(e),
            Ok(Err(e)) => {
                warn!("caption: speech never started: {}", e);
                self.show_full(generation, &content);
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        debug!("caption: revealing {} visible characters", visible_len(&content));
        let speed = self.config.reveal_speed();
        let mut shown = String::with_capacity(content.len());
        let mut open: Vec<String> = Vec::new();
        for token_part in tokenize(&content) {
            match token_part {
                Part::Tag(tag) => {
                    track_tag(tag, &mut open);
                    shown.push_str(tag);
                }
                Part::Visible(unit) => {
                    if token
                        .run_until_cancelled(tokio::time::sleep(speed))
                        .await
                        .is_err()
                    {
                        return Ok(RevealOutcome::Interrupted);
                    }
                    shown.push_str(unit);
                    self.surface.render(&format!("{}{}", shown, closing_tags(&open)));
                }
            }
        }
        if token.is_cancelled() {
            return Ok(RevealOutcome::Interrupted);
        }
        self.surface.render(&content);
        self.buffer.lock().is_revealing = false;
        info!("caption: reveal complete");

        if let Err(e) = self
            .streaming
            .wait_until_quiet(self.config.stream_wait_timeout())
            .await
        {
            warn!("caption: restoring controls without speech end: {}", e);
        }
        tokio::time::sleep(self.config.grace_delay()).await;
        if self.generation.load(Ordering::SeqCst) == generation {
            self.surface.set_controls_enabled(true);
            self.clear_token(generation);
        }
        Ok(RevealOutcome::Completed)
    }

    /// Reveal the previous caption again from the start.
    pub async fn replay(&self) -> VoiceResult<RevealOutcome> {
        let content = self.buffer.lock().sanitized_content.clone();
        if content.is_empty() {
            return Err(VoiceError::InvalidInput("no caption to replay".to_string()));
        }
        self.reveal(&content).await
    }

    /// Jump to the full content without animating. No-op when nothing is revealing.
    pub fn stop(&self) -> bool {
        let content = {
            let mut buffer = self.buffer.lock();
            if !buffer.is_revealing {
                return false;
            }
            buffer.is_revealing = false;
            buffer.sanitized_content.clone()
        };
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
        self.surface.render(&content);
        self.surface.set_controls_enabled(true);
        info!("caption: reveal stopped, full content shown");
        true
    }

    pub fn is_revealing(&self) -> bool {
        self.buffer.lock().is_revealing
    }

    pub fn buffer(&self) -> CaptionBuffer {
        self.buffer.lock().clone()
    }

    fn show_full(&self, generation: u64, content: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.buffer.lock().is_revealing = false;
        self.surface.render(content);
        self.surface.set_controls_enabled(true);
        self.clear_token(generation);
    }

    fn clear_token(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.current.lock().take();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part<'a> {
    Tag(&'a str),
    /// One visible character or one entity.
    Visible(&'a str),
}

fn tokenize(markup: &str) -> Vec<Part<'_>> {
    let mut parts = Vec::new();
    let mut rest = markup;
    while let Some(first) = rest.chars().next() {
        let len = match first {
            '<' => rest.find('>').map(|end| end + 1),
            '&' => entity_len(rest),
            _ => None,
        };
        match len {
            Some(len) if first == '<' => {
                parts.push(Part::Tag(&rest[..len]));
                rest = &rest[len..];
            }
            Some(len) => {
                parts.push(Part::Visible(&rest[..len]));
                rest = &rest[len..];
            }
            None => {
                let len = first.len_utf8();
                parts.push(Part::Visible(&rest[..len]));
                rest = &rest[len..];
            }
        }
    }
    parts
}

/// Length of `&name;` or `&#123;` at the start of `s`.
fn entity_len(s: &str) -> Option<usize> {
    let end = s.char_indices().take(12).find(|&(_, c)| c == ';')?.0;
    let body = &s[1..end];
    let valid = !body.is_empty()
        && body
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_alphanumeric() || (i == 0 && c == '#'));
    valid.then_some(end + 1)
}

fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '/' && *c != '>')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn track_tag(tag: &str, open: &mut Vec<String>) {
    let name = tag_name(tag);
    if name.is_empty() || tag.starts_with("<!") || tag.ends_with("/>") {
        return;
    }
    if tag.starts_with("</") {
        if let Some(pos) = open.iter().rposition(|n| *n == name) {
            open.truncate(pos);
        }
    } else if !VOID_TAGS.contains(&name.as_str()) {
        open.push(name);
    }
}

fn closing_tags(open: &[String]) -> String {
    open.iter().rev().map(|name| format!("</{}>", name)).collect()
}

/// Visible characters in `markup` (entities count as one).
pub fn visible_len(markup: &str) -> usize {
    tokenize(markup)
        .into_iter()
        .filter(|p| matches!(p, Part::Visible(_)))
        .count()
}

/// Cut `markup` to at most `max_visible` visible characters and close any open tags.
/// Returns the result and whether anything was cut.
pub fn truncate_markup(markup: &str, max_visible: usize) -> (String, bool) {
    if visible_len(markup) <= max_visible {
        return (markup.to_string(), false);
    }
    let mut out = String::new();
    let mut open = Vec::new();
    let mut visible = 0;
    for part in tokenize(markup) {
        match part {
            Part::Tag(tag) => {
                track_tag(tag, &mut open);
                out.push_str(tag);
            }
            Part::Visible(unit) => {
                if visible == max_visible {
                    break;
                }
                visible += 1;
                out.push_str(unit);
            }
        }
    }
    out.push_str(&closing_tags(&open));
    (out, true)
}
