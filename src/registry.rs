//! Per-session tracking of intercepted containers

use crate::session::SessionId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type Tracked = Arc<Mutex<HashSet<String>>>;

/// Containers created through each interception session.
///
/// The table itself is only write-locked to open or clear a session;
/// registrations lock just their own session's set.
#[derive(Default)]
pub struct InterceptionRegistry {
  sessions: RwLock<HashMap<SessionId, Tracked>>,
}

impl InterceptionRegistry {
  /// Create an empty registry
  pub fn new() -> Self {
    Self::default()
  }

  /// Start tracking a session. Opening an open session keeps its containers.
  pub fn open(&self, session: SessionId) {
    self.sessions.write().entry(session).or_default();
  }

  fn tracked(&self, session: SessionId) -> Option<Tracked> {
    self.sessions.read().get(&session).cloned()
  }

  /// Record a container created through `session`.
  ///
  /// Returns `false` when the session is not open (never opened, or already
  /// cleared), in which case nothing is recorded.
  pub fn register(&self, session: SessionId, container_id: impl Into<String>) -> bool {
    match self.tracked(session) {
      Some(tracked) => {
        tracked.lock().insert(container_id.into());
        true
      }
      None => false,
    }
  }

  /// Stop tracking a container that was removed while the session was live.
  ///
  /// Only a full container id matches. Names and short ids are ambiguous
  /// here, so such containers stay tracked and are cleaned up on stop.
  pub fn forget(&self, session: SessionId, container: &str) -> bool {
    match self.tracked(session) {
      Some(tracked) => tracked.lock().remove(container),
      None => false,
    }
  }

  /// Snapshot of the containers tracked for `session`
  pub fn list_tracked(&self, session: SessionId) -> HashSet<String> {
    self
      .tracked(session)
      .map(|tracked| tracked.lock().clone())
      .unwrap_or_default()
  }

  /// Close `session` and hand back everything it tracked.
  ///
  /// A second call for the same session returns an empty set.
  pub fn clear(&self, session: SessionId) -> HashSet<String> {
    let tracked = self.sessions.write().remove(&session);
    tracked
      .map(|tracked| std::mem::take(&mut *tracked.lock()))
      .unwrap_or_default()
  }
}
