//! Content blocks carried by tool results, prompts and sampling messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// One content block as sent by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    ResourceLink {
        uri: String,
        name: String,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Body of a resource, either textual or base64 blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceContents {
    Text(TextResourceContents),
    Blob(BlobResourceContents),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub blob: String,
}

impl ResourceContents {
    pub fn uri(&self) -> &str {
        match self {
            Self::Text(t) => &t.uri,
            Self::Blob(b) => &b.uri,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            Self::Text(t) => t.mime_type.as_deref(),
            Self::Blob(b) => b.mime_type.as_deref(),
        }
    }
}

/// Flattened tool output handed to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum ResultItem {
    Text(String),
    /// Base64 payload from image, audio or blob resource content
    Binary {
        data: String,
        mime_type: Option<String>,
    },
}

impl ResultItem {
    /// Text form used when feeding results back to a model.
    pub fn render(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Binary { data, .. } => data,
        }
    }

    /// Decode a binary payload. Returns `None` for text items.
    pub fn decode(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            Self::Text(_) => None,
            Self::Binary { data, .. } => Some(STANDARD.decode(data)),
        }
    }
}

/// Normalize heterogeneous result content into a flat ordered sequence.
pub fn flatten(content: Vec<Content>) -> Vec<ResultItem> {
    content
        .into_iter()
        .map(|block| match block {
            Content::Text { text } => ResultItem::Text(text),
            Content::Image { data, mime_type } | Content::Audio { data, mime_type } => {
                ResultItem::Binary {
                    data,
                    mime_type: Some(mime_type),
                }
            }
            Content::Resource { resource } => match resource {
                ResourceContents::Text(t) => ResultItem::Text(t.text),
                ResourceContents::Blob(b) => ResultItem::Binary {
                    data: b.blob,
                    mime_type: b.mime_type,
                },
            },
            Content::ResourceLink { uri, .. } => ResultItem::Text(uri),
        })
        .collect()
}

/// Join rendered items with newlines.
pub fn render_items(items: &[ResultItem]) -> String {
    items
        .iter()
        .map(ResultItem::render)
        .collect::<Vec<_>>()
        .join("\n")
}
