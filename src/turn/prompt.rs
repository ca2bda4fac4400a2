//! Composes the user message sent to the LLM from text and uploads.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::PromptSettings;
use crate::types::{ContentBlock, MediaSource, Message, Role, UploadedFile};

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_ ]").expect("separator regex must compile"));
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-zA-Z0-9\-()\[\]]").expect("filename character regex must compile")
});
static DASH_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("dash regex must compile"));

/// How an upload is presented to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    /// pdf, csv, txt, md
    Document,
    /// doc(x), xls(x), ppt(x)
    Office,
    Unsupported,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "png" | "jpg" | "jpeg" | "gif" | "webp" => Self::Image,
            "pdf" | "csv" | "txt" | "md" => Self::Document,
            "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" => Self::Office,
            _ => Self::Unsupported,
        }
    }
}

/// Normalize an uploaded filename (without extension). Idempotent.
pub fn sanitize_filename(name: &str) -> String {
    let lowered = name.to_lowercase();
    let dashed = SEPARATORS.replace_all(&lowered, "-");
    let stripped = DISALLOWED.replace_all(&dashed, "");
    let collapsed = DASH_RUNS.replace_all(&stripped, "-");
    if collapsed.is_empty() {
        "document".to_string()
    } else {
        collapsed.into_owned()
    }
}

/// Sanitized stem plus the lowercased extension.
pub fn canonical_filename(file: &UploadedFile) -> String {
    let stem = sanitize_filename(file.stem());
    match file.extension() {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

fn image_format(ext: &str) -> String {
    match ext {
        "jpg" => "jpeg".to_string(),
        other => other.to_string(),
    }
}

/// Text hint standing in for a document kept in the cloud workspace.
pub fn workspace_hint(canonical: &str) -> String {
    format!(
        "[Attached file '{canonical}' is too large to include inline. \
It is stored in the workspace as '{canonical}'; use the workspace tools to read it.]"
    )
}

/// Build the user message: the text first, then one block per upload.
pub fn compose_user_message(text: &str, files: &[UploadedFile], settings: &PromptSettings) -> Message {
    let mut content = vec![ContentBlock::text(text)];
    let mut hints = Vec::new();

    for file in files {
        let ext = file.extension().unwrap_or_default();
        let name = sanitize_filename(file.stem());
        match FileKind::from_extension(&ext) {
            FileKind::Image => content.push(ContentBlock::Image {
                format: image_format(&ext),
                source: MediaSource::Bytes(file.bytes.clone()),
            }),
            FileKind::Document => content.push(ContentBlock::Document {
                format: ext,
                name,
                source: MediaSource::Bytes(file.bytes.clone()),
            }),
            FileKind::Office
                if settings.cloud_mode && file.bytes.len() > settings.max_inline_document_bytes =>
            {
                tracing::debug!(file = %file.name, bytes = file.bytes.len(), "office document left in workspace");
                hints.push(workspace_hint(&canonical_filename(file)));
            }
            FileKind::Office => content.push(ContentBlock::Document {
                format: ext,
                name,
                source: MediaSource::Bytes(file.bytes.clone()),
            }),
            FileKind::Unsupported => {
                tracing::warn!(file = %file.name, "unsupported upload type skipped");
            }
        }
    }

    if !hints.is_empty() {
        content.push(ContentBlock::text(hints.join("\n")));
    }
    Message::new(Role::User, content)
}
