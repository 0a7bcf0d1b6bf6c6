//! Build context rewriting
//!
//! The classic builder receives the context as one tar stream. Entries are
//! walked in order in raw mode, so GNU long-name and PAX extension records
//! are seen as records of their own and copied with their original headers.
//! Only the Dockerfile (and a root `.dockerignore`) is held in memory to be
//! rewritten; the CA certificate is appended after the last original entry.

use crate::dockerfile::{rewrite_dockerfile, InjectedBlock};
use crate::outcome::{PassThroughReason, Transformed};
use crate::session::InterceptionSession;
use bytes::Bytes;
use std::borrow::Cow;
use std::io::{self, Read};
use tar::{Archive, Builder, EntryType, Header};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Name of the ignore file the daemon applies to the context
const DOCKERIGNORE: &str = ".dockerignore";

/// What gets injected into one build context
#[derive(Clone, Debug)]
pub struct BuildInjection {
  block: InjectedBlock,
  cert_path: String,
  cert: Bytes,
}

impl BuildInjection {
  /// Inject `cert` at `cert_path` and `block` after every `FROM`
  pub fn new(block: InjectedBlock, cert_path: impl Into<String>, cert: impl Into<Bytes>) -> Self {
    Self {
      block,
      cert_path: cert_path.into(),
      cert: cert.into(),
    }
  }

  /// The injection for a session
  pub fn for_session(session: &InterceptionSession) -> Self {
    Self::new(
      InjectedBlock::for_session(session),
      session.context_cert_path(),
      session.ca_cert().clone(),
    )
  }

  /// Context path of the injected certificate
  pub fn cert_path(&self) -> &str {
    &self.cert_path
  }
}

fn normalize(path: &str) -> &str {
  let mut path = path;
  while let Some(rest) = path.strip_prefix("./") {
    path = rest;
  }
  path
}

fn malformed(e: io::Error) -> PassThroughReason {
  PassThroughReason::Unparseable(format!("malformed build context: {}", e))
}

/// Undo gzip compression, the only one worth unpacking in practice.
fn decompress(context: &[u8]) -> Result<Cow<'_, [u8]>, PassThroughReason> {
  if context.starts_with(GZIP_MAGIC) {
    #[cfg(feature = "gzip")]
    {
      let mut out = Vec::with_capacity(context.len() * 2);
      flate2::read::GzDecoder::new(context)
        .read_to_end(&mut out)
        .map_err(malformed)?;
      return Ok(Cow::Owned(out));
    }
    #[cfg(not(feature = "gzip"))]
    return Err(PassThroughReason::UnsupportedCompression);
  }
  if [BZIP2_MAGIC, XZ_MAGIC, ZSTD_MAGIC]
    .iter()
    .any(|magic| context.starts_with(magic))
  {
    return Err(PassThroughReason::UnsupportedCompression);
  }
  Ok(Cow::Borrowed(context))
}

/// Pull the `path` record out of a PAX extended header body.
fn pax_path(data: &[u8]) -> Option<Vec<u8>> {
  let mut rest = data;
  while !rest.is_empty() {
    let space = rest.iter().position(|b| *b == b' ')?;
    let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
    if len <= space || len > rest.len() {
      return None;
    }
    let record = &rest[space + 1..len];
    let record = record.strip_suffix(b"\n").unwrap_or(record);
    if let Some(value) = record.strip_prefix(b"path=") {
      return Some(value.to_vec());
    }
    rest = &rest[len..];
  }
  None
}

fn is_file(header: &Header) -> bool {
  matches!(
    header.entry_type(),
    EntryType::Regular | EntryType::Continuous
  )
}

/// Write a rewritten file entry, reusing its metadata.
fn append_rewritten(
  builder: &mut Builder<Vec<u8>>,
  original: &Header,
  path: &str,
  had_extensions: bool,
  data: &[u8],
) -> io::Result<()> {
  let mut header = original.clone();
  header.set_size(data.len() as u64);
  if had_extensions {
    // the dropped extension records may have carried the path or size
    builder.append_data(&mut header, path, data)
  } else {
    header.set_cksum();
    builder.append(&header, data)
  }
}

fn rewrite_archive(
  tar_bytes: &[u8],
  dockerfile: &str,
  injection: &BuildInjection,
) -> Result<Vec<u8>, PassThroughReason> {
  let mut archive = Archive::new(tar_bytes);
  let mut builder = Builder::new(Vec::with_capacity(tar_bytes.len() + 4096));
  // extension records waiting for the entry they describe
  let mut pending: Vec<(Header, Vec<u8>)> = Vec::new();
  let mut long_path: Option<Vec<u8>> = None;
  let mut found = false;
  let mut dockerfile_mtime = 0;

  let entries = archive.entries().map_err(malformed)?.raw(true);
  for entry in entries {
    let mut entry = entry.map_err(malformed)?;
    let header = entry.header().clone();

    match header.entry_type() {
      EntryType::GNULongName | EntryType::GNULongLink | EntryType::XHeader => {
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(malformed)?;
        match header.entry_type() {
          EntryType::GNULongName => {
            let name = data.split(|b| *b == 0).next().unwrap_or_default();
            long_path = Some(name.to_vec());
          }
          EntryType::XHeader => {
            if let Some(path) = pax_path(&data) {
              long_path = Some(path);
            }
          }
          _ => {}
        }
        pending.push((header, data));
        continue;
      }
      _ => {}
    }

    let path_bytes = long_path
      .take()
      .unwrap_or_else(|| header.path_bytes().into_owned());
    let path = String::from_utf8_lossy(&path_bytes).into_owned();
    let normalized = normalize(&path);

    if !found && normalized == dockerfile && is_file(&header) {
      let mut data = Vec::new();
      entry.read_to_end(&mut data).map_err(malformed)?;
      let rewritten = match rewrite_dockerfile(&Bytes::from(data), &injection.block) {
        Transformed::Modified(rewritten) => rewritten,
        Transformed::PassThrough { reason, .. } => return Err(reason),
      };
      append_rewritten(&mut builder, &header, normalized, !pending.is_empty(), &rewritten)
        .map_err(malformed)?;
      pending.clear();
      dockerfile_mtime = header.mtime().unwrap_or(0);
      found = true;
      continue;
    }

    if normalized == DOCKERIGNORE && is_file(&header) {
      let mut data = Vec::new();
      entry.read_to_end(&mut data).map_err(malformed)?;
      if !data.is_empty() && !data.ends_with(b"\n") {
        data.push(b'\n');
      }
      data.extend_from_slice(format!("!{}\n", injection.cert_path).as_bytes());
      append_rewritten(&mut builder, &header, normalized, !pending.is_empty(), &data)
        .map_err(malformed)?;
      pending.clear();
      continue;
    }

    for (ext_header, data) in pending.drain(..) {
      builder.append(&ext_header, data.as_slice()).map_err(malformed)?;
    }
    builder.append(&header, &mut entry).map_err(malformed)?;
  }

  if !found {
    return Err(PassThroughReason::DockerfileNotFound(dockerfile.to_string()));
  }

  let mut header = Header::new_gnu();
  header.set_entry_type(EntryType::Regular);
  header.set_size(injection.cert.len() as u64);
  header.set_mode(0o644);
  header.set_uid(0);
  header.set_gid(0);
  header.set_mtime(dockerfile_mtime);
  builder
    .append_data(&mut header, &injection.cert_path, injection.cert.as_ref())
    .map_err(malformed)?;
  builder.into_inner().map_err(malformed)
}

/// Rewrite a build context so every stage trusts the intercepting CA.
///
/// `dockerfile` is the build's `dockerfile` parameter, relative to the
/// context root. Any failure hands the context back unchanged.
pub fn transform_build_context(
  context: &Bytes,
  dockerfile: &str,
  injection: &BuildInjection,
) -> Transformed<Bytes> {
  let dockerfile = normalize(dockerfile);
  let outcome = decompress(context)
    .and_then(|tar_bytes| rewrite_archive(&tar_bytes, dockerfile, injection));
  match outcome {
    Ok(rewritten) => Transformed::Modified(Bytes::from(rewritten)),
    Err(reason) => {
      tracing::warn!("Forwarding build context unmodified: {}", reason);
      Transformed::pass(context.clone(), reason)
    }
  }
}
