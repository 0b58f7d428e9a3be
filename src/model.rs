use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    #[serde(rename = "_id")]
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightColor {
    Blue,
    Brown,
    Cyan,
    Gray,
    Green,
    Indigo,
    Orange,
    Pink,
    Purple,
    Red,
    Teal,
    #[default]
    #[serde(other)]
    Yellow,
}

impl HighlightColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            HighlightColor::Blue => "blue",
            HighlightColor::Brown => "brown",
            HighlightColor::Cyan => "cyan",
            HighlightColor::Gray => "gray",
            HighlightColor::Green => "green",
            HighlightColor::Indigo => "indigo",
            HighlightColor::Orange => "orange",
            HighlightColor::Pink => "pink",
            HighlightColor::Purple => "purple",
            HighlightColor::Red => "red",
            HighlightColor::Teal => "teal",
            HighlightColor::Yellow => "yellow",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub created: String,
    #[serde(default)]
    pub color: HighlightColor,
    pub text: String,
    /// Empty when the highlight carries no note.
    #[serde(default)]
    pub note: String,
}

impl Highlight {
    pub fn has_note(&self) -> bool {
        !self.note.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionRef {
    #[serde(rename = "$id", default)]
    pub id: i64,
}

/// A bookmarked article with its highlights, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Raindrop {
    #[serde(rename = "_id")]
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created: String,
    #[serde(rename = "lastUpdate")]
    pub last_update: String,
    #[serde(default)]
    pub collection: CollectionRef,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
}

impl Raindrop {
    /// Tags in API order with repeats dropped.
    pub fn unique_tags(&self) -> Vec<&str> {
        let mut seen = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            if !seen.contains(&tag.as_str()) {
                seen.push(tag.as_str());
            }
        }
        seen
    }
}
