//! NZB descriptor parsing
//!
//! An NZB file is an XML document enumerating the Usenet articles
//! (segments) that reconstruct one or more files. Parsing produces a typed
//! plan: ordered files, each with an unordered set of segments, plus
//! optional metadata such as an archive password.

use crate::error::{Error, Result};
use serde::Deserialize;

/// A parsed NZB plan
#[derive(Clone, Debug)]
pub struct Nzb {
    /// Files in plan order
    pub files: Vec<NzbFile>,
    /// `<head><meta type="...">` entries as (type, value) pairs
    pub meta: Vec<(String, String)>,
}

/// One file within an NZB plan
#[derive(Clone, Debug)]
pub struct NzbFile {
    /// Posting identity
    pub poster: String,
    /// Post date attribute, verbatim
    pub date: String,
    /// Subject line; the filename is embedded here
    pub subject: String,
    /// Newsgroups carrying the articles
    pub groups: Vec<String>,
    /// Segments as parsed (unordered)
    pub segments: Vec<Segment>,
}

/// One segment (article) of a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Expected encoded article size in bytes
    pub bytes: u64,
    /// 1-based ordinal, unique within the file
    pub number: u32,
    /// Bare message-id, without angle brackets
    pub message_id: String,
}

// Wire representation for quick-xml; attributes are `@`-prefixed, character
// data is `$text`. Converted into the public types after validation.
#[derive(Debug, Deserialize)]
struct RawNzb {
    #[serde(default)]
    head: Option<RawHead>,
    #[serde(default, rename = "file")]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    #[serde(default, rename = "meta")]
    meta: Vec<RawMeta>,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    #[serde(default, rename = "@type")]
    kind: String,
    #[serde(default, rename = "$text")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default, rename = "@poster")]
    poster: String,
    #[serde(default, rename = "@date")]
    date: String,
    #[serde(default, rename = "@subject")]
    subject: String,
    #[serde(default)]
    groups: RawGroups,
    #[serde(default)]
    segments: RawSegments,
}

#[derive(Debug, Default, Deserialize)]
struct RawGroups {
    #[serde(default, rename = "group")]
    group: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSegments {
    #[serde(default, rename = "segment")]
    segment: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(default, rename = "@bytes")]
    bytes: u64,
    #[serde(default, rename = "@number")]
    number: u32,
    #[serde(default, rename = "$text")]
    message_id: String,
}

impl Nzb {
    /// Parse and validate NZB bytes
    ///
    /// Tolerates `xmlns` attributes on the root and does not process DTDs.
    /// Fails with [`Error::InvalidNzb`] on malformed XML, an empty plan, a
    /// file without segments, an empty message-id, or a duplicate segment
    /// ordinal within a file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::InvalidNzb(format!("not valid UTF-8: {e}")))?;
        let raw: RawNzb = quick_xml::de::from_str(text)
            .map_err(|e| Error::InvalidNzb(format!("XML parse error: {e}")))?;

        let meta = raw
            .head
            .map(|h| {
                h.meta
                    .into_iter()
                    .map(|m| (m.kind, m.value))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let files: Vec<NzbFile> = raw
            .files
            .into_iter()
            .map(|f| NzbFile {
                poster: f.poster,
                date: f.date,
                subject: f.subject,
                groups: f.groups.group,
                segments: f
                    .segments
                    .segment
                    .into_iter()
                    .map(|s| Segment {
                        bytes: s.bytes,
                        number: s.number,
                        message_id: s.message_id.trim().to_string(),
                    })
                    .collect(),
            })
            .collect();

        let nzb = Self { files, meta };
        nzb.validate()?;
        Ok(nzb)
    }

    fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::InvalidNzb("NZB contains no files".into()));
        }
        for (i, file) in self.files.iter().enumerate() {
            if file.segments.is_empty() {
                return Err(Error::InvalidNzb(format!(
                    "file {i} ({:?}) has no segments",
                    file.subject
                )));
            }
            let mut seen = std::collections::HashSet::new();
            for (j, segment) in file.segments.iter().enumerate() {
                if segment.message_id.is_empty() {
                    return Err(Error::InvalidNzb(format!(
                        "file {i} segment {j} has an empty message-id"
                    )));
                }
                if !seen.insert(segment.number) {
                    return Err(Error::InvalidNzb(format!(
                        "file {i} has duplicate segment number {}",
                        segment.number
                    )));
                }
            }
        }
        Ok(())
    }

    /// Archive password from the first `<meta type="password">` entry
    /// (case-insensitive type match), trimmed; `None` if absent or empty.
    pub fn password(&self) -> Option<String> {
        self.meta
            .iter()
            .find(|(kind, _)| kind.eq_ignore_ascii_case("password"))
            .map(|(_, value)| value.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Sum of segment sizes across every file
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(NzbFile::total_bytes).sum()
    }

    /// Total segment count across every file
    pub fn total_segments(&self) -> usize {
        self.files.iter().map(|f| f.segments.len()).sum()
    }
}

impl NzbFile {
    /// Sum of this file's segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    /// Extract the filename from the subject line.
    ///
    /// Subjects typically look like
    /// `Release [01/50] - "file.part01.rar" yEnc (1/100)`. Preference
    /// order: the first quoted substring, then the first whitespace token
    /// containing a `.`, then the subject itself.
    pub fn filename(&self) -> String {
        let subject = &self.subject;

        if let Some(start) = subject.find('"') {
            if let Some(end) = subject[start + 1..].find('"') {
                let quoted = &subject[start + 1..start + 1 + end];
                if !quoted.is_empty() {
                    return quoted.to_string();
                }
            }
        }

        for token in subject.split_whitespace() {
            if token.contains('.') && !token.starts_with('(') {
                return token.trim_matches(&['"', '\'', '[', ']'][..]).to_string();
            }
        }

        subject.clone()
    }

    /// Segments sorted ascending by ordinal. Duplicate ordinals are rejected
    /// at parse time, so the result is strictly increasing.
    pub fn sorted_segments(&self) -> Vec<Segment> {
        let mut sorted = self.segments.clone();
        sorted.sort_by_key(|s| s.number);
        sorted
    }
}

/// Format a byte count for the SABnzbd API (B/KB/MB/GB, two decimals)
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}
