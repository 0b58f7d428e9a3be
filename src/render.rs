use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::Config;
use crate::error::TemplateError;
use crate::model::{Collection, CollectionRef, Highlight, Raindrop};
use crate::reconcile::{WATERMARK_KEY, find_watermark};
use crate::timestamp::{EPOCH_SENTINEL, compare_key};

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(raindrop|highlight)\.([a-z_]+)\}").unwrap());

/// Produces the text of a note. Implementations are shared read-only across sync workers.
pub trait Renderer: Send + Sync {
    /// Header written once, when the note is created. Its watermark is always [`EPOCH_SENTINEL`].
    fn render_header(&self, raindrop: &Raindrop, collection: &Collection) -> String;
    fn render_highlight(&self, raindrop: &Raindrop, highlight: &Highlight) -> String;
}

fn quote_block(text: &str) -> String {
    format!("> {}", text.replace('\n', "\n> "))
}

fn yaml_quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FixedRenderer;

impl Renderer for FixedRenderer {
    fn render_header(&self, raindrop: &Raindrop, collection: &Collection) -> String {
        let mut out = String::new();
        out.push_str("---\n");
        out.push_str("category: \"raindrop_article\"\n");
        out.push_str(&format!("collection_id: \"{}\"\n", collection.id));
        out.push_str(&format!("raindrop_id: \"{}\"\n", raindrop.id));
        out.push_str(&format!("title: {}\n", yaml_quoted(&raindrop.title)));
        out.push_str(&format!("link: {}\n", yaml_quoted(&raindrop.link)));
        out.push_str(&format!("tags: {}\n", yaml_quoted(&raindrop.unique_tags().join(", "))));
        out.push_str(&format!("created: {}\n", yaml_quoted(&raindrop.created)));
        out.push_str(&format!("{}: \"{}\"\n\n", WATERMARK_KEY, EPOCH_SENTINEL));
        out.push_str("---\n\n");
        out.push_str("%%\n");
        out.push_str("up:: [[+Highlights]]\n");
        out.push_str("%%\n\n");
        out.push_str(&format!("![]({})\n", raindrop.cover));
        out.push_str(&format!(
            "# {} [{}]({})\n",
            raindrop.title, raindrop.domain, raindrop.link
        ));
        out.push_str("### Highlights\n");
        out
    }

    fn render_highlight(&self, _raindrop: &Raindrop, highlight: &Highlight) -> String {
        let mut out = String::new();
        out.push_str("---\n");
        out.push_str(&format!("Created: {}\n", highlight.created));
        out.push_str(&format!("> [!highlight-{}]\n", highlight.color.as_str()));
        out.push_str(&format!("{}\n\n", quote_block(&highlight.text)));
        if highlight.has_note() {
            out.push_str("> [!note]\n");
            out.push_str(&format!("{}\n\n", quote_block(&highlight.note)));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RaindropField {
    Id,
    CollectionId,
    Collection,
    Title,
    Link,
    Domain,
    Cover,
    Tags,
    Created,
    LastUpdate,
}

impl RaindropField {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => RaindropField::Id,
            "collection_id" => RaindropField::CollectionId,
            "collection" => RaindropField::Collection,
            "title" => RaindropField::Title,
            "link" => RaindropField::Link,
            "domain" => RaindropField::Domain,
            "cover" => RaindropField::Cover,
            "tags" => RaindropField::Tags,
            "created" => RaindropField::Created,
            "last_update" => RaindropField::LastUpdate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HighlightField {
    Id,
    Created,
    Color,
    Text,
    Quote,
    Note,
}

impl HighlightField {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => HighlightField::Id,
            "created" => HighlightField::Created,
            "color" => HighlightField::Color,
            "text" => HighlightField::Text,
            "quote" => HighlightField::Quote,
            "note" => HighlightField::Note,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Raindrop(RaindropField),
    Highlight(HighlightField),
}

/// Everything a template line can be resolved against.
struct RenderContext<'a> {
    raindrop: &'a Raindrop,
    collection: Option<&'a Collection>,
    highlight: Option<&'a Highlight>,
    /// Header renders pin `{raindrop.last_update}` to the epoch sentinel.
    seed_watermark: bool,
}

impl RenderContext<'_> {
    fn raindrop_value(&self, field: RaindropField) -> Option<String> {
        let raindrop = self.raindrop;
        Some(match field {
            RaindropField::Id => raindrop.id.to_string(),
            RaindropField::CollectionId => match self.collection {
                Some(collection) => collection.id.to_string(),
                None => raindrop.collection.id.to_string(),
            },
            RaindropField::Collection => self.collection?.title.clone(),
            RaindropField::Title => raindrop.title.clone(),
            RaindropField::Link => raindrop.link.clone(),
            RaindropField::Domain => raindrop.domain.clone(),
            RaindropField::Cover => raindrop.cover.clone(),
            RaindropField::Tags => raindrop.unique_tags().join(", "),
            RaindropField::Created => raindrop.created.clone(),
            RaindropField::LastUpdate if self.seed_watermark => EPOCH_SENTINEL.to_string(),
            RaindropField::LastUpdate => raindrop.last_update.clone(),
        })
    }

    fn highlight_value(&self, field: HighlightField) -> Option<String> {
        let highlight = self.highlight?;
        Some(match field {
            HighlightField::Id => highlight.id.clone(),
            HighlightField::Created => highlight.created.clone(),
            HighlightField::Color => highlight.color.as_str().to_string(),
            HighlightField::Text => highlight.text.clone(),
            HighlightField::Quote => quote_block(&highlight.text),
            HighlightField::Note => highlight.note.clone(),
        })
    }
}

/// A line-oriented template compiled once at startup.
///
/// Tokens look like `{raindrop.title}` or `{highlight.text}`. A token naming an
/// unknown field, or a field the current render has no value for, is copied
/// through verbatim so partial templates still produce output.
#[derive(Debug, Clone)]
pub struct Template {
    lines: Vec<Vec<Segment>>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let lines = source.lines().map(parse_line).collect();
        Template { lines }
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let source = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Template::parse(&source))
    }

    /// Whether some line carries the watermark field fed by `{raindrop.last_update}`.
    fn has_watermark_line(&self) -> bool {
        self.lines.iter().any(|line| {
            let starts_with_key = matches!(
                line.first(),
                Some(Segment::Literal(text)) if text.trim_start().starts_with(&format!("{}:", WATERMARK_KEY))
            );
            starts_with_key && line.contains(&Segment::Raindrop(RaindropField::LastUpdate))
        })
    }

    fn render(&self, ctx: &RenderContext<'_>) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let skip_line = ctx.highlight.is_some_and(|h| !h.has_note())
                && line.contains(&Segment::Highlight(HighlightField::Note));
            if skip_line {
                continue;
            }
            for segment in line {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Raindrop(field) => match ctx.raindrop_value(*field) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&token_text("raindrop", raindrop_field_name(*field))),
                    },
                    Segment::Highlight(field) => match ctx.highlight_value(*field) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&token_text("highlight", highlight_field_name(*field))),
                    },
                }
            }
            out.push('\n');
        }
        out
    }
}

fn token_text(entity: &str, field: &str) -> String {
    format!("{{{}.{}}}", entity, field)
}

fn raindrop_field_name(field: RaindropField) -> &'static str {
    match field {
        RaindropField::Id => "id",
        RaindropField::CollectionId => "collection_id",
        RaindropField::Collection => "collection",
        RaindropField::Title => "title",
        RaindropField::Link => "link",
        RaindropField::Domain => "domain",
        RaindropField::Cover => "cover",
        RaindropField::Tags => "tags",
        RaindropField::Created => "created",
        RaindropField::LastUpdate => "last_update",
    }
}

fn highlight_field_name(field: HighlightField) -> &'static str {
    match field {
        HighlightField::Id => "id",
        HighlightField::Created => "created",
        HighlightField::Color => "color",
        HighlightField::Text => "text",
        HighlightField::Quote => "quote",
        HighlightField::Note => "note",
    }
}

fn parse_line(line: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut last = 0;

    for caps in TOKEN.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        let field = match &caps[1] {
            "raindrop" => RaindropField::from_name(&caps[2]).map(Segment::Raindrop),
            _ => HighlightField::from_name(&caps[2]).map(Segment::Highlight),
        };

        literal.push_str(&line[last..whole.start()]);
        match field {
            Some(segment) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
            }
            None => literal.push_str(whole.as_str()),
        }
        last = whole.end();
    }

    literal.push_str(&line[last..]);
    if !literal.is_empty() || segments.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Template-driven rendering. A part without a template falls back to [`FixedRenderer`].
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    header: Option<Template>,
    highlight: Option<Template>,
    fallback: FixedRenderer,
}

impl TemplateRenderer {
    pub fn new(header: Option<Template>, highlight: Option<Template>) -> Self {
        TemplateRenderer {
            header,
            highlight,
            fallback: FixedRenderer,
        }
    }

    pub fn load(header_path: Option<&Path>, highlight_path: Option<&Path>) -> Result<Self, TemplateError> {
        let header = match header_path {
            Some(path) => {
                    let template = Template::load(path)?;
                if !template.has_watermark_line() {
                    return Err(TemplateError::MissingWatermark {
                        path: PathBuf::from(path),
                    });
                }
                check_header_watermark(&template, path)?;
                Some(template)
            }
            None => None,
        };
        let highlight = highlight_path.map(Template::load).transpose()?;
        Ok(TemplateRenderer::new(header, highlight))
    }
}

impl Renderer for TemplateRenderer {
    fn render_header(&self, raindrop: &Raindrop, collection: &Collection) -> String {
        match &self.header {
            Some(template) => template.render(&RenderContext {
                raindrop,
                collection: Some(collection),
                highlight: None,
                seed_watermark: true,
            }),
            None => self.fallback.render_header(raindrop, collection),
        }
    }

    fn render_highlight(&self, raindrop: &Raindrop, highlight: &Highlight) -> String {
        match &self.highlight {
            Some(template) => template.render(&RenderContext {
                raindrop,
                collection: None,
                highlight: Some(highlight),
                seed_watermark: false,
            }),
            None => self.fallback.render_highlight(raindrop, highlight),
        }
    }
}

/// Renders `template` as a new note header and makes sure the watermark reads back
/// as a timestamp, so a bad template fails at startup instead of on every note.
fn check_header_watermark(template: &Template, path: &Path) -> Result<(), TemplateError> {
    let raindrop = Raindrop {
        id: 0,
        title: String::new(),
        link: String::new(),
        domain: String::new(),
        cover: String::new(),
        tags: Vec::new(),
        created: EPOCH_SENTINEL.to_string(),
        last_update: EPOCH_SENTINEL.to_string(),
        collection: CollectionRef::default(),
        highlights: Vec::new(),
    };
    let collection = Collection {
        id: 0,
        title: String::new(),
    };
    let header = template.render(&RenderContext {
        raindrop: &raindrop,
        collection: Some(&collection),
        highlight: None,
        seed_watermark: true,
    });

    let unreadable = |value: String| TemplateError::UnreadableWatermark {
        path: path.to_path_buf(),
        value,
    };
    let watermark = find_watermark(&header).ok_or_else(|| unreadable(String::new()))?;
    compare_key(&watermark.value).map_err(|_| unreadable(watermark.value.clone()))?;
    Ok(())
}

/// Picks the rendering strategy once, from the configured template paths.
pub fn renderer_from_config(cfg: &Config) -> Result<Arc<dyn Renderer>, TemplateError> {
    if cfg.raindrop_template.is_none() && cfg.highlight_template.is_none() {
        return Ok(Arc::new(FixedRenderer));
    }
    let renderer = TemplateRenderer::load(
        cfg.raindrop_template.as_deref(),
        cfg.highlight_template.as_deref(),
    )?;
    Ok(Arc::new(renderer))
}
