//! Bounded per-channel context buffers.
//!
//! Each channel kind keeps a FIFO of the most recent annotation items.
//! The two speech channels additionally hold a single pending partial: the
//! latest not-yet-final transcript fragment, appended to reads as a virtual
//! last line but never committed until a final version supersedes it.
//!
//! Insertion order is arrival order. Out-of-order backend delivery is
//! accepted as-is; no resequencing is attempted.

use std::collections::VecDeque;

use chrono::Utc;
use serde::Serialize;

pub const DEFAULT_BUFFER_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Screen,
    Mic,
    SystemAudio,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] =
        [ChannelKind::Screen, ChannelKind::Mic, ChannelKind::SystemAudio];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Screen => "screen",
            ChannelKind::Mic => "mic",
            ChannelKind::SystemAudio => "system_audio",
        }
    }

    pub fn is_transcript(&self) -> bool {
        matches!(self, ChannelKind::Mic | ChannelKind::SystemAudio)
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screen" => Ok(ChannelKind::Screen),
            "mic" => Ok(ChannelKind::Mic),
            "system_audio" => Ok(ChannelKind::SystemAudio),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One annotation unit. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextItem {
    pub timestamp: String,
    pub text: String,
}

impl ContextItem {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            text: text.into(),
        }
    }
}

#[derive(Debug)]
struct ChannelBuffer {
    items: VecDeque<ContextItem>,
    capacity: usize,
    pending: Option<ContextItem>,
}

impl ChannelBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            pending: None,
        }
    }

    fn push(&mut self, item: ContextItem) {
        self.items.push_back(item);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct ContextBuffers {
    screen: ChannelBuffer,
    mic: ChannelBuffer,
    system_audio: ChannelBuffer,
}

impl ContextBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            screen: ChannelBuffer::new(capacity),
            mic: ChannelBuffer::new(capacity),
            system_audio: ChannelBuffer::new(capacity),
        }
    }

    fn buffer(&self, channel: ChannelKind) -> &ChannelBuffer {
        match channel {
            ChannelKind::Screen => &self.screen,
            ChannelKind::Mic => &self.mic,
            ChannelKind::SystemAudio => &self.system_audio,
        }
    }

    fn buffer_mut(&mut self, channel: ChannelKind) -> &mut ChannelBuffer {
        match channel {
            ChannelKind::Screen => &mut self.screen,
            ChannelKind::Mic => &mut self.mic,
            ChannelKind::SystemAudio => &mut self.system_audio,
        }
    }

    /// Append an item. A non-final append to a transcript channel only
    /// replaces the pending slot; it never evicts a committed item. A
    /// final append commits one item and clears the pending slot.
    pub fn append(&mut self, channel: ChannelKind, item: ContextItem, is_final: bool) {
        let buf = self.buffer_mut(channel);
        if channel.is_transcript() && !is_final {
            buf.pending = Some(item);
            return;
        }
        buf.pending = None;
        buf.push(item);
    }

    /// Most recent committed items plus, for transcript channels, the
    /// pending partial as a virtual last entry.
    pub fn recent(&self, channel: ChannelKind, limit: usize) -> Vec<ContextItem> {
        let buf = self.buffer(channel);
        let mut out: Vec<ContextItem> = buf
            .items
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if let Some(pending) = &buf.pending {
            out.push(pending.clone());
        }
        out
    }

    /// Full committed + pending view for every channel, in declaration
    /// order of `ChannelKind::ALL`.
    pub fn snapshot_all(&self) -> Vec<(ChannelKind, Vec<ContextItem>)> {
        ChannelKind::ALL
            .iter()
            .map(|&kind| (kind, self.recent(kind, usize::MAX)))
            .collect()
    }

    /// Committed item counts per channel. Pending partials are not counted.
    pub fn counts(&self) -> Vec<(ChannelKind, usize)> {
        ChannelKind::ALL
            .iter()
            .map(|&kind| (kind, self.buffer(kind).items.len()))
            .collect()
    }

    pub fn committed_len(&self, channel: ChannelKind) -> usize {
        self.buffer(channel).items.len()
    }

    pub fn reset(&mut self) {
        for kind in ChannelKind::ALL {
            let buf = self.buffer_mut(kind);
            buf.items.clear();
            buf.pending = None;
        }
    }
}
