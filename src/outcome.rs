//! Fail-open transform results

use std::fmt;

/// Why a transform left its input alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassThroughReason {
  /// The input could not be parsed (binary garbage, invalid JSON, broken archive).
  Unparseable(String),
  /// The Dockerfile has no `FROM` instruction to inject after.
  NoStages,
  /// The build context has no entry at the requested Dockerfile path.
  DockerfileNotFound(String),
  /// The build context uses a compression we do not unpack.
  UnsupportedCompression,
  /// No interception session is active for the request.
  NoSession,
}

impl fmt::Display for PassThroughReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PassThroughReason::Unparseable(why) => write!(f, "unparseable input: {}", why),
      PassThroughReason::NoStages => f.write_str("no FROM instruction"),
      PassThroughReason::DockerfileNotFound(path) => {
        write!(f, "dockerfile {:?} not found in build context", path)
      }
      PassThroughReason::UnsupportedCompression => f.write_str("unsupported context compression"),
      PassThroughReason::NoSession => f.write_str("no active interception session"),
    }
  }
}

/// Result of a fail-open transform.
///
/// A transform never raises on bad input. It either produces a rewritten
/// payload or hands back the original untouched, together with the reason, so
/// callers have to decide what to do with the fallback explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed<T> {
  /// The payload was rewritten.
  Modified(T),
  /// The original payload, unchanged.
  PassThrough {
    /// The untouched input
    original: T,
    /// Why nothing was changed
    reason: PassThroughReason,
  },
}

impl<T> Transformed<T> {
  /// Build a pass-through outcome.
  pub fn pass(original: T, reason: PassThroughReason) -> Self {
    Transformed::PassThrough { original, reason }
  }

  /// Whether the payload was rewritten.
  pub fn is_modified(&self) -> bool {
    matches!(self, Transformed::Modified(_))
  }

  /// The pass-through reason, if the transform failed open.
  pub fn reason(&self) -> Option<&PassThroughReason> {
    match self {
      Transformed::Modified(_) => None,
      Transformed::PassThrough { reason, .. } => Some(reason),
    }
  }

  /// The payload to forward, whichever branch was taken.
  pub fn into_inner(self) -> T {
    match self {
      Transformed::Modified(value) => value,
      Transformed::PassThrough { original, .. } => original,
    }
  }
}
