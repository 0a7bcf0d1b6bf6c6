//! Dockerfile stage analysis and trust injection
//!
//! Every `FROM` starts a fresh filesystem, so each stage gets its own copy of
//! the CA certificate and its own proxy environment. The injected block is
//! placed right after the (possibly multi-line) `FROM` instruction; every
//! other byte of the file is left as it was.

use crate::outcome::{PassThroughReason, Transformed};
use crate::session::InterceptionSession;
use bytes::Bytes;

/// Default line continuation character
const DEFAULT_ESCAPE: char = '\\';
/// Instructions that may carry heredoc bodies
const HEREDOC_INSTRUCTIONS: [&str; 3] = ["RUN", "COPY", "ADD"];

/// The instructions inserted after every `FROM`.
///
/// Renders as exactly two build steps: a `COPY` of the CA certificate from the
/// build context and a single-line `ENV` carrying the owned variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectedBlock {
  copy_source: String,
  copy_dest: String,
  env: Vec<(String, String)>,
}

impl InjectedBlock {
  /// Create a block copying `copy_source` (context path) to `copy_dest`
  pub fn new(
    copy_source: impl Into<String>,
    copy_dest: impl Into<String>,
    env: Vec<(String, String)>,
  ) -> Self {
    Self {
      copy_source: copy_source.into(),
      copy_dest: copy_dest.into(),
      env,
    }
  }

  /// The block for a session
  pub fn for_session(session: &InterceptionSession) -> Self {
    Self::new(
      session.context_cert_path(),
      session.container_cert_path(),
      session
        .container_env()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
    )
  }

  /// The instruction lines, without line terminators
  pub fn lines(&self) -> [String; 2] {
    let env = self
      .env
      .iter()
      .map(|(k, v)| format!("{}=\"{}\"", k, v))
      .collect::<Vec<_>>()
      .join(" ");
    [
      format!("COPY {} {}", self.copy_source, self.copy_dest),
      format!("ENV {}", env),
    ]
  }

  fn render(&self, eol: &str) -> String {
    let mut out = String::new();
    for line in self.lines() {
      out.push_str(&line);
      out.push_str(eol);
    }
    out
  }
}

/// One `FROM`-delimited section of a Dockerfile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DockerfileStage {
  /// Zero-based stage index
  pub index: usize,
  /// Base image or earlier stage name as written on the `FROM` line
  pub base: String,
  /// Stage name from `AS <name>`
  pub alias: Option<String>,
  /// Physical lines of the stage, `FROM` included, without terminators
  pub lines: Vec<String>,
}

/// Location of one `FROM` instruction in the physical line list
#[derive(Debug, Clone, Copy)]
struct FromSpan {
  first: usize,
  last: usize,
}

struct Scan<'a> {
  /// Physical lines, terminators included
  lines: Vec<&'a str>,
  froms: Vec<FromSpan>,
}

fn strip_eol(line: &str) -> &str {
  let line = line.strip_suffix('\n').unwrap_or(line);
  line.strip_suffix('\r').unwrap_or(line)
}

/// Read the `escape` parser directive, if any, from the head of the file.
fn escape_directive(lines: &[&str]) -> char {
  for line in lines {
    let content = strip_eol(line).trim_start_matches('\u{feff}').trim();
    let Some(directive) = content.strip_prefix('#') else {
      break;
    };
    let Some((key, value)) = directive.split_once('=') else {
      break;
    };
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
      break;
    }
    if key.eq_ignore_ascii_case("escape") {
      return match value.trim() {
        "`" => '`',
        _ => DEFAULT_ESCAPE,
      };
    }
  }
  DEFAULT_ESCAPE
}

/// Split an instruction into shell-like words, keeping quoted runs intact.
fn words(content: &str) -> Vec<&str> {
  let mut words = Vec::new();
  let mut start = None;
  let mut quote = None;
  for (i, c) in content.char_indices() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => {}
      None if c.is_whitespace() => {
        if let Some(s) = start.take() {
          words.push(&content[s..i]);
        }
      }
      None => {
        if start.is_none() {
          start = Some(i);
        }
        if c == '"' || c == '\'' {
          quote = Some(c);
        }
      }
    }
  }
  if let Some(s) = start {
    words.push(&content[s..]);
  }
  words
}

/// Delimiter and tab-stripping flag when `word` opens a heredoc.
///
/// Only a whole word of the form `[fd]<<[-]WORD` qualifies, with `WORD`
/// optionally quoted. Shell arithmetic such as `$((1<<2))` and here-strings
/// do not.
fn heredoc_word(word: &str) -> Option<(String, bool)> {
  let rest = word.trim_start_matches(|c: char| c.is_ascii_digit());
  let rest = rest.strip_prefix("<<")?;
  let (rest, strip_tabs) = match rest.strip_prefix('-') {
    Some(rest) => (rest, true),
    None => (rest, false),
  };
  if rest.is_empty() || rest.contains('<') {
    return None;
  }
  let delimiter = match rest.chars().next() {
    Some(q @ ('"' | '\'')) => rest.strip_prefix(q)?.strip_suffix(q)?,
    _ => rest,
  };
  if delimiter.is_empty()
    || !delimiter
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
  {
    return None;
  }
  Some((delimiter.to_string(), strip_tabs))
}

/// Collect heredoc delimiters opened on one instruction line.
fn heredoc_delimiters(content: &str, pending: &mut Vec<(String, bool)>) {
  pending.extend(words(content).into_iter().filter_map(heredoc_word));
}

fn scan(text: &str) -> Scan<'_> {
  let lines: Vec<&str> = text.split_inclusive('\n').collect();
  let escape = escape_directive(&lines);
  let mut froms = Vec::new();

  let mut in_instruction = false;
  let mut instruction_start = 0;
  let mut keyword = String::new();
  let mut open_heredocs: Vec<(String, bool)> = Vec::new();
  let mut heredoc_queue: Vec<(String, bool)> = Vec::new();

  for (index, line) in lines.iter().enumerate() {
    let content = strip_eol(line);
    if !in_instruction && !heredoc_queue.is_empty() {
      let (delimiter, strip_tabs) = &heredoc_queue[0];
      let candidate = if *strip_tabs {
        content.trim_start_matches('\t')
      } else {
        content
      };
      if candidate == delimiter {
        heredoc_queue.remove(0);
      }
      continue;
    }
    let trimmed = content.trim_start_matches('\u{feff}').trim_start();
    if !in_instruction {
      if trimmed.is_empty() || trimmed.starts_with('#') {
        continue;
      }
      instruction_start = index;
      keyword = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    } else if trimmed.starts_with('#') {
      // comment lines inside a continued instruction do not end it
      continue;
    }
    if HEREDOC_INSTRUCTIONS.contains(&keyword.as_str()) {
      heredoc_delimiters(content, &mut open_heredocs);
    }
    in_instruction = content.trim_end().ends_with(escape);
    if !in_instruction {
      if keyword == "FROM" {
        froms.push(FromSpan {
          first: instruction_start,
          last: index,
        });
      }
      heredoc_queue.append(&mut open_heredocs);
    }
  }
  Scan { lines, froms }
}

/// Parse the base image and alias out of a joined `FROM` instruction.
fn parse_from(instruction: &str) -> (String, Option<String>) {
  let mut words = instruction
    .split_whitespace()
    .skip(1)
    .filter(|w| !w.starts_with("--"));
  let base = words.next().unwrap_or_default().to_string();
  let alias = match (words.next(), words.next()) {
    (Some(kw), Some(name)) if kw.eq_ignore_ascii_case("as") => Some(name.to_string()),
    _ => None,
  };
  (base, alias)
}

fn decode(raw: &[u8]) -> Result<&str, PassThroughReason> {
  let text = std::str::from_utf8(raw)
    .map_err(|e| PassThroughReason::Unparseable(format!("dockerfile is not UTF-8: {}", e)))?;
  if text.contains('\0') {
    return Err(PassThroughReason::Unparseable(
      "dockerfile contains NUL bytes".to_string(),
    ));
  }
  Ok(text)
}

/// Split a Dockerfile into its stages.
///
/// Lines before the first `FROM` (global `ARG`s, directives) belong to no
/// stage. Returns an empty list for undecodable input.
pub fn parse_stages(raw: &[u8]) -> Vec<DockerfileStage> {
  let Ok(text) = decode(raw) else {
    return Vec::new();
  };
  let scan = scan(text);
  let escape = escape_directive(&scan.lines);
  scan
    .froms
    .iter()
    .enumerate()
    .map(|(index, span)| {
      let end = scan
        .froms
        .get(index + 1)
        .map(|next| next.first)
        .unwrap_or(scan.lines.len());
      let joined = scan.lines[span.first..=span.last]
        .iter()
        .map(|l| strip_eol(l).trim_end().trim_end_matches(escape))
        .collect::<Vec<_>>()
        .join(" ");
      let (base, alias) = parse_from(&joined);
      DockerfileStage {
        index,
        base,
        alias,
        lines: scan.lines[span.first..end]
          .iter()
          .map(|l| strip_eol(l).to_string())
          .collect(),
      }
    })
    .collect()
}

/// Insert `block` after every `FROM` instruction of a Dockerfile.
///
/// Undecodable input and files without any `FROM` come back unchanged.
pub fn rewrite_dockerfile(raw: &Bytes, block: &InjectedBlock) -> Transformed<Bytes> {
  let text = match decode(raw) {
    Ok(text) => text,
    Err(reason) => return Transformed::pass(raw.clone(), reason),
  };
  let scan = scan(text);
  if scan.froms.is_empty() {
    return Transformed::pass(raw.clone(), PassThroughReason::NoStages);
  }
  let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
  let injected = block.render(eol);

  let mut out = String::with_capacity(text.len() + injected.len() * scan.froms.len());
  let mut froms = scan.froms.iter().peekable();
  for (index, line) in scan.lines.iter().enumerate() {
    out.push_str(line);
    if froms.peek().map(|span| span.last) == Some(index) {
      froms.next();
      if !line.ends_with('\n') {
        out.push_str(eol);
      }
      out.push_str(&injected);
    }
  }
  Transformed::Modified(Bytes::from(out))
}
