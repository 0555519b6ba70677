//! Awareness: ephemeral "who is here and where is their cursor" state.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! AwarenessRegistry::patch_local()
//!       │
//!       ▼
//! AwarenessUpdate { clientId, state }
//!       │
//!       ▼   (relay fan-out)
//! Remote AwarenessRegistry::merge_remote()   (last-writer-wins)
//!       │
//!       ▼
//! purge_stale()  ──►  entries older than the TTL disappear
//! ```
//!
//! Awareness is never persisted and never goes through the CRDT. Each
//! client owns exactly one entry; remote entries are replaced wholesale by
//! newer snapshots.
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Entries not refreshed within this window are purged.
pub const DEFAULT_AWARENESS_TTL: Duration = Duration::from_secs(30);

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cursor location in line/column form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Selected character range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

impl SelectionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// One client's awareness snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub client_id: String,
    pub user_id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Option<SelectionRange>,
    /// Milliseconds since the Unix epoch, set by the owning client.
    pub timestamp: u64,
}

impl AwarenessState {
    /// Fresh state for a user, coloured from the user id.
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            client_id: client_id.into(),
            color: color_for_user(&user_id),
            user_id,
            name: name.into(),
            cursor: None,
            selection: None,
            timestamp,
        }
    }
}

/// Partial update of the local awareness state.
///
/// `cursor: Some(None)` clears the cursor, `cursor: None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessPatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<Option<CursorPosition>>,
    pub selection: Option<Option<SelectionRange>>,
}

impl AwarenessPatch {
    pub fn cursor(cursor: CursorPosition) -> Self {
        Self {
            cursor: Some(Some(cursor)),
            ..Self::default()
        }
    }

    pub fn selection(selection: Option<SelectionRange>) -> Self {
        Self {
            selection: Some(selection),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    fn apply_to(&self, state: &mut AwarenessState) {
        if let Some(name) = &self.name {
            state.name = name.clone();
        }
        if let Some(color) = &self.color {
            state.color = color.clone();
        }
        if let Some(cursor) = self.cursor {
            state.cursor = cursor;
        }
        if let Some(selection) = self.selection {
            state.selection = selection;
        }
    }
}

/// Per-document map of client id to awareness state.
#[derive(Debug, Clone)]
pub struct AwarenessRegistry {
    local_client_id: String,
    states: HashMap<String, AwarenessState>,
}

impl AwarenessRegistry {
    pub fn new(local_client_id: impl Into<String>) -> Self {
        Self {
            local_client_id: local_client_id.into(),
            states: HashMap::new(),
        }
    }

    pub fn local_client_id(&self) -> &str {
        &self.local_client_id
    }

    /// Install the local entry. The client id is forced to ours.
    pub fn set_local(&mut self, mut state: AwarenessState) -> AwarenessState {
        state.client_id = self.local_client_id.clone();
        self.states.insert(self.local_client_id.clone(), state.clone());
        state
    }

    pub fn local(&self) -> Option<&AwarenessState> {
        self.states.get(&self.local_client_id)
    }

    /// Apply a patch to the local entry and stamp it with `now`.
    pub fn patch_local(&mut self, patch: &AwarenessPatch, now: u64) -> Option<AwarenessState> {
        let state = self.states.get_mut(&self.local_client_id)?;
        patch.apply_to(state);
        state.timestamp = now.max(state.timestamp);
        Some(state.clone())
    }

    /// Refresh the local timestamp without changing anything else.
    pub fn touch_local(&mut self, now: u64) -> Option<AwarenessState> {
        self.patch_local(&AwarenessPatch::default(), now)
    }

    /// Last-writer-wins merge of a remote snapshot.
    ///
    /// Returns `true` when the registry changed. Updates claiming our own
    /// client id are ignored; a tie on timestamp favours the incoming state.
    pub fn merge_remote(&mut self, client_id: &str, mut state: AwarenessState) -> bool {
        if client_id == self.local_client_id {
            return false;
        }
        state.client_id = client_id.to_string();

        match self.states.get(client_id) {
            Some(existing) if existing.timestamp > state.timestamp => false,
            Some(existing) if *existing == state => false,
            _ => {
                self.states.insert(client_id.to_string(), state);
                true
            }
        }
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<AwarenessState> {
        if client_id == self.local_client_id {
            return None;
        }
        self.states.remove(client_id)
    }

    /// Drop every remote entry belonging to `user_id`. Returns removed client ids.
    pub fn remove_user(&mut self, user_id: &str) -> Vec<String> {
        let local = &self.local_client_id;
        let gone: Vec<String> = self
            .states
            .iter()
            .filter(|(id, s)| *id != local && s.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            self.states.remove(id);
        }
        gone
    }

    /// Remove remote entries whose timestamp is older than `ttl` at `now`.
    pub fn purge_stale(&mut self, now: u64, ttl: Duration) -> Vec<String> {
        let ttl_ms = ttl.as_millis() as u64;
        let local = &self.local_client_id;
        let stale: Vec<String> = self
            .states
            .iter()
            .filter(|(id, s)| *id != local && now.saturating_sub(s.timestamp) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.states.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Purged {} stale awareness entries", stale.len());
        }
        stale
    }

    pub fn get(&self, client_id: &str) -> Option<&AwarenessState> {
        self.states.get(client_id)
    }

    /// All entries (local included), ordered by client id.
    pub fn snapshot(&self) -> Vec<AwarenessState> {
        let mut all: Vec<AwarenessState> = self.states.values().cloned().collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Stable, visually distinct `#rrggbb` colour for a user id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness
/// are fixed for vivid cursors.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
