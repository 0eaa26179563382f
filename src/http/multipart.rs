//! Streaming `multipart/form-data` decoding.
//!
//! The decoder alternates two states over a pushback stream: hunting for the
//! next boundary, then reading one part (headers + body). Part bodies are
//! length-unknown streams that spot the boundary inline, report end-of-part,
//! and push everything from the boundary onward back so the outer loop can
//! resume the hunt. File bodies never land in memory; they are streamed
//! into `temp/` in 8 KiB chunks.

use crate::{
    errors::ErrorKind,
    http::stream::{find_bytes, partial_suffix_len, PushbackReader, CHUNK_SIZE},
    limits::HttpLimits,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// File extensions refused during upload.
const BLOCKED_EXTENSIONS: [&str; 6] = [".exe", ".sh", ".bat", ".cmd", ".com", ".scr"];

/// Cap on the accumulated size of one part's header lines.
const PART_HEADER_CAP: usize = 16 * 1024;

/// An uploaded file extracted from a multipart body.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// The client-supplied filename (validated: no `..`, `/` or `\`).
    pub filename: String,
    /// Detected MIME type: content probe first, extension fallback.
    pub content_type: String,
    /// Where the upload was streamed to, inside the configured temp dir.
    pub saved_path: PathBuf,
}

impl FilePart {
    /// Copies the stored upload to `dest`.
    pub async fn save_to(&self, dest: impl AsRef<Path>) -> std::io::Result<u64> {
        tokio::fs::copy(&self.saved_path, dest).await
    }
}

enum BoundaryHit {
    /// A part follows.
    Part,
    /// The end boundary (`--boundary--`) or end of stream was reached.
    End,
}

/// The two-state streaming decoder. Borrows the request parser's reader so
/// pushed-back bytes stay visible to whoever reads the stream next.
pub(crate) struct MultipartParser<'a, R> {
    reader: &'a mut PushbackReader<R>,
    boundary: Vec<u8>,
    body_done: bool,
}

impl<'a, R: AsyncRead + Unpin> MultipartParser<'a, R> {
    pub(crate) fn new(reader: &'a mut PushbackReader<R>, boundary_token: &str) -> Self {
        let mut boundary = Vec::with_capacity(boundary_token.len() + 2);
        boundary.extend_from_slice(b"--");
        boundary.extend_from_slice(boundary_token.as_bytes());

        Self {
            reader,
            boundary,
            body_done: true,
        }
    }

    /// Decodes every part. Form fields land in `fields` (overwriting any
    /// query-string value of the same name), uploads in `files`.
    pub(crate) async fn parse(
        &mut self,
        limits: &HttpLimits,
        fields: &mut HashMap<String, String>,
        files: &mut HashMap<String, FilePart>,
    ) -> Result<(), ErrorKind> {
        loop {
            match self.skip_to_boundary().await? {
                BoundaryHit::End => return Ok(()),
                BoundaryHit::Part => {}
            }

            let headers = self.read_part_headers().await?;
            self.body_done = false;

            let Some(disposition) = headers.get("content-disposition") else {
                // Undispositioned part: its body is scanned over by the
                // next boundary hunt.
                continue;
            };

            let name = disposition_param(disposition, "name");
            let filename = disposition_param(disposition, "filename");

            match (name, filename) {
                (Some(name), Some(filename)) if !filename.is_empty() => {
                    let part = self.save_file(&filename, limits).await?;
                    files.insert(name, part);
                }
                (Some(name), _) => {
                    let value = self.read_field(limits).await?;
                    fields.insert(name, value);
                }
                (None, _) => continue,
            }
        }
    }

    /// State 1: scan byte-by-byte until the boundary matches, then consume
    /// the trailing CRLF (a bare LF is tolerated; any other byte is pushed
    /// back). `--` after the boundary is the end marker.
    async fn skip_to_boundary(&mut self) -> Result<BoundaryHit, ErrorKind> {
        let boundary = self.boundary.clone();
        let mut matched = 0;

        loop {
            let Some(byte) = self.reader.read_byte().await? else {
                return Ok(BoundaryHit::End);
            };

            if byte == boundary[matched] {
                matched += 1;
                if matched < boundary.len() {
                    continue;
                }
                return self.consume_boundary_tail().await;
            }

            if matched > 0 {
                // Re-scan from the second byte of the failed match.
                let mut rewind = boundary[1..matched].to_vec();
                rewind.push(byte);
                self.reader.unread(&rewind);
                matched = 0;
            }
        }
    }

    async fn consume_boundary_tail(&mut self) -> Result<BoundaryHit, ErrorKind> {
        match self.reader.read_byte().await? {
            Some(b'-') => match self.reader.read_byte().await? {
                Some(b'-') => {
                    // End boundary; eat its optional line ending.
                    match self.reader.read_byte().await? {
                        Some(b'\r') => {
                            if let Some(b) = self.reader.read_byte().await? {
                                if b != b'\n' {
                                    self.reader.unread(&[b]);
                                }
                            }
                        }
                        Some(b'\n') | None => {}
                        Some(other) => self.reader.unread(&[other]),
                    }
                    Ok(BoundaryHit::End)
                }
                Some(other) => {
                    self.reader.unread(&[b'-', other]);
                    Ok(BoundaryHit::Part)
                }
                None => Ok(BoundaryHit::End),
            },
            Some(b'\r') => {
                if let Some(b) = self.reader.read_byte().await? {
                    if b != b'\n' {
                        self.reader.unread(&[b]);
                    }
                }
                Ok(BoundaryHit::Part)
            }
            Some(b'\n') => Ok(BoundaryHit::Part),
            Some(other) => {
                self.reader.unread(&[other]);
                Ok(BoundaryHit::Part)
            }
            None => Ok(BoundaryHit::End),
        }
    }

    /// State 2a: part headers up to the empty line, with the same CRLF/LF
    /// tolerance as the outer parser. Duplicate names concatenate with a
    /// comma.
    async fn read_part_headers(&mut self) -> Result<HashMap<String, String>, ErrorKind> {
        let mut headers = HashMap::new();
        let mut consumed = 0;

        loop {
            let line = self.read_line(&mut consumed).await?;
            if line.is_empty() {
                return Ok(headers);
            }

            let Some(colon) = line.find(':') else { continue };
            let name = line[..colon].trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            let value = line[colon + 1..].trim().to_string();

            headers
                .entry(name)
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value.clone());
        }
    }

    async fn read_line(&mut self, consumed: &mut usize) -> Result<String, ErrorKind> {
        let mut line: Vec<u8> = Vec::new();

        loop {
            let Some(byte) = self.reader.read_byte().await? else {
                return Err(ErrorKind::UnexpectedEof);
            };
            *consumed += 1;
            if *consumed > PART_HEADER_CAP {
                return Err(ErrorKind::InvalidMultipart("part headers too large".into()));
            }

            match byte {
                b'\n' => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                _ => line.push(byte),
            }
        }
    }

    /// State 2b: one chunk of the current part body, or `None` at end of
    /// part. Detects the boundary inline, strips the CRLF (or LF) that
    /// precedes it from the delivered content, and unreads everything from
    /// the boundary onward.
    async fn next_body_chunk(&mut self) -> Result<Option<Vec<u8>>, ErrorKind> {
        if self.body_done {
            return Ok(None);
        }

        let boundary = self.boundary.clone();
        let mut data: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + boundary.len() + 2);
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            if let Some(pos) = find_bytes(&data, &boundary) {
                self.reader.unread(&data[pos..]);
                let mut end = pos;
                if end >= 2 && &data[end - 2..end] == b"\r\n" {
                    end -= 2;
                } else if end >= 1 && data[end - 1] == b'\n' {
                    end -= 1;
                }
                data.truncate(end);
                self.body_done = true;
                return Ok((!data.is_empty()).then_some(data));
            }

            // Hold back a possible boundary prefix, plus the line ending
            // that would belong to it.
            let mut hold = partial_suffix_len(&data, &boundary);
            let before = data.len() - hold;
            if data[..before].ends_with(b"\r\n") {
                hold += 2;
            } else if before >= 1 && matches!(data[before - 1], b'\n' | b'\r') {
                hold += 1;
            }

            if data.len() >= CHUNK_SIZE && data.len() > hold {
                let tail = data.split_off(data.len() - hold);
                self.reader.unread(&tail);
                return Ok(Some(data));
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                // Stream ended before a boundary; the remainder is content.
                self.body_done = true;
                return Ok((!data.is_empty()).then_some(data));
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_field(&mut self, limits: &HttpLimits) -> Result<String, ErrorKind> {
        let mut data: Vec<u8> = Vec::new();

        while let Some(chunk) = self.next_body_chunk().await? {
            data.extend_from_slice(&chunk);
            if data.len() > limits.body_size {
                return Err(ErrorKind::BodyTooLarge(data.len()));
            }
        }

        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Streams one file body into a unique temp file, enforcing the
    /// filename policy and the per-file size cap. A partially written file
    /// is removed before any error propagates.
    async fn save_file(
        &mut self,
        filename: &str,
        limits: &HttpLimits,
    ) -> Result<FilePart, ErrorKind> {
        if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
            return Err(ErrorKind::RejectedFilename(filename.to_string()));
        }
        let ext = extension(filename);
        if BLOCKED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ErrorKind::BlockedExtension(ext));
        }

        std::fs::create_dir_all(&limits.upload_dir)?;
        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&format!("-{filename}"))
            .tempfile_in(&limits.upload_dir)?
            .keep()
            .map_err(|e| ErrorKind::Io(e.error))?;
        let mut file = tokio::fs::File::from_std(file);

        let mut probe: Vec<u8> = Vec::with_capacity(8);
        let mut total: usize = 0;
        let outcome: Result<(), ErrorKind> = async {
            while let Some(chunk) = self.next_body_chunk().await? {
                total += chunk.len();
                if total > limits.file_size {
                    return Err(ErrorKind::FileTooLarge(filename.to_string()));
                }
                if probe.len() < 8 {
                    let take = chunk.len().min(8 - probe.len());
                    probe.extend_from_slice(&chunk[..take]);
                }
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        Ok(FilePart {
            filename: filename.to_string(),
            content_type: detect_mime(&probe, filename),
            saved_path: path,
        })
    }
}

/// Extracts a quoted parameter from a `Content-Disposition` value, e.g.
/// `form-data; name="avatar"; filename="m.txt"`.
fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    let marker = format!("{param}=\"");
    let start = disposition.find(&marker)? + marker.len();
    let end = disposition[start..].find('"')? + start;
    Some(disposition[start..end].to_string())
}

/// The filename extension including its dot, lowercased; empty when there
/// is none.
fn extension(filename: &str) -> String {
    match filename.rfind('.') {
        Some(dot) => filename[dot..].to_lowercase(),
        None => String::new(),
    }
}

/// MIME detection: content probe first, extension mapping second.
fn detect_mime(probe: &[u8], filename: &str) -> String {
    let by_magic = if probe.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if probe.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if probe.starts_with(b"GIF8") {
        Some("image/gif")
    } else if probe.starts_with(b"%PDF") {
        Some("application/pdf")
    } else {
        None
    };

    if let Some(mime) = by_magic {
        return mime.to_string();
    }

    match extension(filename).as_str() {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".pdf" => "application/pdf",
        ".txt" => "text/plain",
        ".html" => "text/html",
        ".json" => "application/json",
        _ => "application/octet-stream",
    }
    .to_string()
}
