//! This module provides utilities for segmenting a group-chat message stream
//! into dialogs and building overlapping windows over them, designed for use
//! within a RAG (Retrieval Augmented Generation) system.
//!
//! Group conversations are not a uniform stream: people talk in bursts. A
//! single message rarely carries enough context to be useful on its own, while
//! the whole history is far too large to embed as one unit. The middle ground
//! is the *dialog window*: a contiguous span of messages from one
//! conversational episode, embedded together so the retrieval model sees who
//! said what around the matched text.
//!
//! The module defines two main structs:
//! - [`DialogSegmenter`]: splits a chronological message list into dialogs
//!   using a time-gap heuristic and emits windows over each dialog.
//! - [`DialogWindow`]: one contiguous span of messages, identified by its
//!   center message id. Recomputing windows over the same message range
//!   yields the same center keys, so downstream upsert-by-key storage absorbs
//!   reruns.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use mnemo_dialog::{ChatMessage, DialogSegmenter, SegmenterConfig};
//!
//! let messages: Vec<ChatMessage> = (0..6)
//!     .map(|i| ChatMessage {
//!         conversation_id: 1,
//!         message_id: i,
//!         author_id: 10 + i % 2,
//!         author_name: format!("user{}", i % 2),
//!         text: format!("message number {i}"),
//!         sent_at: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
//!     })
//!     .collect();
//!
//! let segmenter = DialogSegmenter::new(SegmenterConfig::default());
//! let windows = segmenter.windows(&messages);
//!
//! // Six messages within ten minutes form one dialog, hence one window.
//! assert_eq!(windows.len(), 1);
//! assert_eq!(windows[0].size, 6);
//! assert_eq!(windows[0].center_message_id, 3);
//! ```

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One raw message from a group conversation.
///
/// Messages are the source of truth: windows and index records are derived
/// from them and can be rebuilt at any time. `message_id` is unique within a
/// conversation and, for practical purposes, monotonically increasing with
/// time (chat platforms assign ids in send order, with occasional edge cases
/// around edits that this crate does not rely on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub conversation_id: i64,
    pub message_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Render this message as a single `"author: text"` line, the form both
    /// the message index and window texts are built from.
    pub fn render_line(&self) -> String {
        format!("{}: {}", self.author_name, self.text)
    }
}

/// A contiguous span of messages from one dialog, embedded as a unit.
///
/// The identity key is `(conversation_id, center_message_id)`: the segmenter
/// always centers a window on the middle member of its span, so recomputing
/// over the same messages reproduces the same keys and member sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogWindow {
    pub conversation_id: i64,
    /// Message id of the middle member; the window's identity key.
    pub center_message_id: i64,
    pub start_message_id: i64,
    pub end_message_id: i64,
    /// Member message ids in timestamp order.
    pub member_message_ids: Vec<i64>,
    /// Member messages rendered as `"author: text"` lines joined by newlines.
    pub window_text: String,
    pub size: usize,
}

/// Configuration for dialog segmentation and window construction.
///
/// All numeric choices here are empirical and tunable; nothing downstream
/// depends on the specific defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// A new dialog starts when consecutive messages are further apart than
    /// this many seconds.
    pub dialog_gap_secs: i64,
    /// Dialogs shorter than this are dropped (their messages remain reachable
    /// through the message-level index).
    pub min_window_size: usize,
    /// Dialogs longer than this are covered by overlapping windows of exactly
    /// this size.
    pub max_window_size: usize,
    /// How far consecutive windows advance over a long dialog. Must be
    /// smaller than `max_window_size` so windows overlap.
    pub window_step: usize,
    /// Messages whose trimmed text is shorter than this are ignored entirely
    /// (stickers, bare mentions, "ok").
    pub min_message_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            dialog_gap_secs: 30 * 60,
            min_window_size: 3,
            max_window_size: 12,
            window_step: 6,
            min_message_chars: 3,
        }
    }
}

impl SegmenterConfig {
    /// Set the dialog gap threshold in seconds.
    pub fn with_dialog_gap_secs(mut self, secs: i64) -> Self {
        self.dialog_gap_secs = secs;
        self
    }

    /// Set the window size bounds.
    pub fn with_window_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_window_size = min;
        self.max_window_size = max;
        self
    }

    /// Set the step between overlapping windows over a long dialog.
    pub fn with_window_step(mut self, step: usize) -> Self {
        self.window_step = step;
        self
    }
}

/// Splits a chronological message stream into dialogs and emits overlapping
/// windows over them. See the module docs for the overall approach.
#[derive(Debug, Clone)]
pub struct DialogSegmenter {
    config: SegmenterConfig,
}

impl DialogSegmenter {
    /// Create a segmenter, clamping degenerate configuration into a usable
    /// shape (`min <= max`, `1 <= step < max`).
    pub fn new(config: SegmenterConfig) -> Self {
        let mut config = config;
        config.min_window_size = config.min_window_size.max(1);
        config.max_window_size = config.max_window_size.max(config.min_window_size);
        config.window_step = config
            .window_step
            .clamp(1, config.max_window_size.saturating_sub(1).max(1));
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Build all windows over a time-ordered message list.
    ///
    /// The pass is O(n): near-empty messages are filtered first, then a
    /// single left-to-right scan splits dialogs wherever the gap between
    /// consecutive messages exceeds the configured threshold, and each dialog
    /// is covered independently:
    ///
    /// - dialogs shorter than `min_window_size` are dropped;
    /// - dialogs that fit within `max_window_size` become exactly one window
    ///   covering the whole dialog;
    /// - longer dialogs are covered by windows of `max_window_size` advancing
    ///   by `window_step`, plus one tail window over the last
    ///   `max_window_size` messages when at least `min_window_size` messages
    ///   would otherwise be left without a window of their own.
    ///
    /// Windows are centered on the middle member of their span (upper middle
    /// for even sizes), which makes the output idempotent: the same message
    /// range always yields the same `(conversation_id, center_message_id)`
    /// keys.
    pub fn windows(&self, messages: &[ChatMessage]) -> Vec<DialogWindow> {
        let substantive: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| m.text.trim().chars().count() >= self.config.min_message_chars)
            .collect();

        let mut windows = Vec::new();
        for dialog in self.split_dialogs(&substantive) {
            self.cover_dialog(dialog, &mut windows);
        }
        windows
    }

    /// Split an already-filtered message list into dialogs by time gap.
    fn split_dialogs<'a>(&self, messages: &[&'a ChatMessage]) -> Vec<Vec<&'a ChatMessage>> {
        let mut dialogs: Vec<Vec<&ChatMessage>> = Vec::new();
        let mut previous_sent: Option<DateTime<Utc>> = None;

        for message in messages {
            let starts_dialog = previous_sent
                .map(|previous| {
                    message.sent_at.signed_duration_since(previous).num_seconds()
                        > self.config.dialog_gap_secs
                })
                .unwrap_or(true);
            if starts_dialog {
                dialogs.push(Vec::new());
            }
            if let Some(current) = dialogs.last_mut() {
                current.push(message);
            }
            previous_sent = Some(message.sent_at);
        }
        dialogs
    }

    /// Emit windows covering one dialog into `out`.
    fn cover_dialog(&self, dialog: Vec<&ChatMessage>, out: &mut Vec<DialogWindow>) {
        let n = dialog.len();
        if n < self.config.min_window_size {
            return;
        }

        if n <= self.config.max_window_size {
            out.push(self.build_window(&dialog));
            return;
        }

        let size = self.config.max_window_size;
        let mut emitted_centers = Vec::new();
        let mut start = 0;
        while start + size <= n {
            let window = self.build_window(&dialog[start..start + size]);
            emitted_centers.push(window.center_message_id);
            out.push(window);
            start += self.config.window_step;
        }

        // Tail catch: enough uncovered messages remain to deserve their own
        // window, so take the last `size` messages even if they overlap the
        // previous window.
        if n - start >= self.config.min_window_size {
            let window = self.build_window(&dialog[n - size..n]);
            if !emitted_centers.contains(&window.center_message_id) {
                out.push(window);
            }
        }
    }

    fn build_window(&self, members: &[&ChatMessage]) -> DialogWindow {
        let lines: Vec<String> = members.iter().map(|m| m.render_line()).collect();
        DialogWindow {
            conversation_id: members[0].conversation_id,
            center_message_id: members[members.len() / 2].message_id,
            start_message_id: members[0].message_id,
            end_message_id: members[members.len() - 1].message_id,
            member_message_ids: members.iter().map(|m| m.message_id).collect(),
            window_text: lines.join("\n"),
            size: members.len(),
        }
    }
}

static WHITESPACE: OnceLock<Regex> = OnceLock::new();

/// Normalize text for duplicate detection: lowercase, collapse all whitespace
/// runs to single spaces, trim. Two hits whose display texts normalize to the
/// same string are the same piece of conversation regardless of which index
/// surfaced them.
pub fn normalize_text(text: &str) -> String {
    let ws = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static pattern"));
    ws.replace_all(text.trim(), " ").to_lowercase()
}
