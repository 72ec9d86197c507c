//! Echo suppression by origin tagging.
//!
//! Every change to a local buffer view carries its [`ChangeSource`]. Local
//! changes are stamped with the connection's origin id and the next local
//! sequence number and become outgoing edits; remote changes update the view
//! and produce nothing. Incoming edits whose origin is this connection are
//! dropped outright, so an edit can never loop back through its sender.
//!
//! There is no timing window: the decision is made from the change itself, so
//! a local keystroke that lands right after a remote update is still
//! broadcast.

use uuid::Uuid;

use crate::protocol::SyncMessage;

/// Where a buffer change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Typed by the local user (or an accepted suggestion)
    Local,
    /// Applied because it arrived from the network
    Remote,
}

/// Classification of an incoming edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Our own edit coming back; ignore it
    Echo,
    /// Already superseded by a later hub_seq we have applied
    Stale,
    /// Apply it
    Apply,
}

/// An edit ready to be sent to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEdit {
    pub origin: Uuid,
    pub seq: u64,
    pub text: String,
}

/// Per-connection origin identity and local sequence counter.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    origin: Uuid,
    next_seq: u64,
    last_hub_seq: u64,
}

impl EchoGuard {
    pub fn new(origin: Uuid) -> Self {
        Self {
            origin,
            next_seq: 1,
            last_hub_seq: 0,
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Sequence number of the most recent local edit (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Stamp a local change.
    pub fn tag_local(&mut self, text: &str) -> OutgoingEdit {
        let seq = self.next_seq;
        self.next_seq += 1;
        OutgoingEdit {
            origin: self.origin,
            seq,
            text: text.to_string(),
        }
    }

    /// Decide what to do with an incoming edit or snapshot.
    pub fn classify(&mut self, origin: Uuid, hub_seq: u64) -> Incoming {
        if origin == self.origin {
            // Our own edit still advances the hub order we have seen
            self.last_hub_seq = self.last_hub_seq.max(hub_seq);
            return Incoming::Echo;
        }
        if hub_seq != 0 && hub_seq <= self.last_hub_seq {
            return Incoming::Stale;
        }
        self.last_hub_seq = self.last_hub_seq.max(hub_seq);
        Incoming::Apply
    }
}

/// A local view of the shared buffer.
///
/// Mirrors what an editor surface holds: the current text plus a change hook.
/// `on_change` is the single entry point for every mutation.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    text: String,
    guard: EchoGuard,
    local_changes: u64,
    remote_changes: u64,
}

impl SharedBuffer {
    pub fn new(origin: Uuid) -> Self {
        Self {
            text: String::new(),
            guard: EchoGuard::new(origin),
            local_changes: 0,
            remote_changes: 0,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> Uuid {
        self.guard.origin()
    }

    /// Apply a change. Returns the edit to broadcast for local changes only.
    pub fn on_change(&mut self, text: &str, source: ChangeSource) -> Option<OutgoingEdit> {
        match source {
            ChangeSource::Local => Some(self.apply_local(text)),
            ChangeSource::Remote => {
                self.replace(text);
                self.remote_changes += 1;
                None
            }
        }
    }

    /// Apply a locally typed change and stamp it for broadcast.
    pub fn apply_local(&mut self, text: &str) -> OutgoingEdit {
        self.replace(text);
        self.local_changes += 1;
        self.guard.tag_local(text)
    }

    fn replace(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
    }

    /// Apply an incoming Edit or Snapshot message.
    ///
    /// Returns `true` when the view changed.
    pub fn apply_remote(&mut self, msg: &SyncMessage) -> bool {
        let Ok(text) = msg.text() else {
            return false;
        };
        match self.guard.classify(msg.origin, msg.hub_seq) {
            Incoming::Apply if text == self.text => false,
            Incoming::Apply => {
                let text = text.to_string();
                self.on_change(&text, ChangeSource::Remote);
                true
            }
            Incoming::Echo | Incoming::Stale => false,
        }
    }

    pub fn local_changes(&self) -> u64 {
        self.local_changes
    }

    pub fn remote_changes(&self) -> u64 {
        self.remote_changes
    }

    pub fn last_seq(&self) -> u64 {
        self.guard.last_seq()
    }
}
