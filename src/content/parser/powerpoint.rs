use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use super::{ExtractedImage, FileParser, ParsedFile};

const ACCEPTED: &[&str] = &[
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

/// Slide-oriented parser. Shape text is ordered top-left to bottom-right,
/// tables are rendered row by row, and slide images carry the slide number
/// as their page.
pub struct PowerPointParser;

#[derive(Default)]
struct ShapeText {
    x: Option<i64>,
    y: Option<i64>,
    text: String,
    row: Vec<String>,
    cell: String,
    in_table: bool,
}

impl PowerPointParser {
    pub fn new() -> Self {
        Self
    }

    /// Extract positioned text blocks from one slide's XML.
    fn slide_text(xml: &str) -> String {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut shapes: Vec<ShapeText> = Vec::new();
        let mut stack: Vec<ShapeText> = Vec::new();

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                Event::Start(e) => match e.name().as_ref() {
                    b"p:sp" | b"p:graphicFrame" => stack.push(ShapeText::default()),
                    b"a:tbl" => {
                        if let Some(shape) = stack.last_mut() {
                            shape.in_table = true;
                        }
                    }
                    b"a:tr" => {
                        if let Some(shape) = stack.last_mut() {
                            shape.row.clear();
                        }
                    }
                    b"a:tc" => {
                        if let Some(shape) = stack.last_mut() {
                            shape.cell.clear();
                        }
                    }
                    _ => {}
                },
                Event::Empty(e) if e.name().as_ref() == b"a:off" => {
                    if let Some(shape) = stack.last_mut() {
                        for attr in e.attributes().flatten() {
                            let value = String::from_utf8_lossy(&attr.value).parse::<i64>().ok();
                            match attr.key.as_ref() {
                                b"x" => shape.x = shape.x.or(value),
                                b"y" => shape.y = shape.y.or(value),
                                _ => {}
                            }
                        }
                    }
                }
                Event::Text(e) => {
                    if let Some(shape) = stack.last_mut() {
                        let text = e
                            .decode()
                            .ok()
                            .and_then(|d| unescape(&d).ok().map(|s| s.into_owned()))
                            .unwrap_or_default();
                        if shape.in_table {
                            shape.cell.push_str(&text);
                        } else {
                            shape.text.push_str(&text);
                        }
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"a:p" => {
                        if let Some(shape) = stack.last_mut() {
                            if shape.in_table {
                                shape.cell.push(' ');
                            } else {
                                shape.text.push('\n');
                            }
                        }
                    }
                    b"a:tc" => {
                        if let Some(shape) = stack.last_mut() {
                            let cell = shape.cell.trim().to_string();
                            shape.row.push(cell);
                        }
                    }
                    b"a:tr" => {
                        if let Some(shape) = stack.last_mut() {
                            let row = format!("| {} |\n", shape.row.join(" | "));
                            shape.text.push_str(&row);
                            shape.row.clear();
                        }
                    }
                    b"p:sp" | b"p:graphicFrame" => {
                        if let Some(shape) = stack.pop() {
                            if !shape.text.trim().is_empty() {
                                shapes.push(shape);
                            }
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        // Top-left to bottom-right; the EMU y coordinate is bucketed so
        // near-aligned shapes sort left-to-right
        shapes.sort_by_key(|s| (s.y.unwrap_or(0) / 10, s.x.unwrap_or(0)));

        shapes
            .iter()
            .map(|s| s.text.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Relationship id -> image target paths for one slide.
    fn slide_image_targets(rels_xml: &str) -> Vec<String> {
        let mut reader = Reader::from_str(rels_xml);
        let mut targets = Vec::new();

        while let Ok(event) = reader.read_event() {
            match event {
                Event::Empty(e) | Event::Start(e)
                    if e.name().as_ref() == b"Relationship" =>
                {
                    let mut rel_type = String::new();
                    let mut target = String::new();
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"Type" => rel_type = String::from_utf8_lossy(&attr.value).to_string(),
                            b"Target" => target = String::from_utf8_lossy(&attr.value).to_string(),
                            _ => {}
                        }
                    }
                    if rel_type.ends_with("/image") && !target.is_empty() {
                        targets.push(target.replace("../", "ppt/"));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        targets
    }

    fn parse_pptx(path: &Path) -> Result<ParsedFile> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).context("not a valid pptx archive")?;

        // Slides in deck order
        let mut slide_names: Vec<(usize, String)> = archive
            .file_names()
            .filter_map(|name| {
                let number = name
                    .strip_prefix("ppt/slides/slide")?
                    .strip_suffix(".xml")?
                    .parse::<usize>()
                    .ok()?;
                Some((number, name.to_string()))
            })
            .collect();
        slide_names.sort();

        let mut content = String::new();
        let mut images = Vec::new();

        for (slide_number, name) in &slide_names {
            let mut xml = String::new();
            archive.by_name(name)?.read_to_string(&mut xml)?;

            content.push_str(&format!("## Slide {}\n\n", slide_number));
            content.push_str(&Self::slide_text(&xml));
            content.push_str("\n\n");

            // Images referenced from this slide's relationships
            let rels_name = format!("ppt/slides/_rels/slide{}.xml.rels", slide_number);
            let targets = match archive.by_name(&rels_name) {
                Ok(mut rels) => {
                    let mut rels_xml = String::new();
                    rels.read_to_string(&mut rels_xml)?;
                    Self::slide_image_targets(&rels_xml)
                }
                Err(_) => Vec::new(),
            };

            for target in targets {
                let Ok(mut entry) = archive.by_name(&target) else {
                    continue;
                };
                let mut bytes = Vec::new();
                if entry.read_to_end(&mut bytes).is_err() {
                    continue;
                }
                let format = target
                    .rsplit('.')
                    .next()
                    .unwrap_or("png")
                    .to_lowercase();
                let index = images.len();
                images.push(ExtractedImage {
                    bytes,
                    page: *slide_number,
                    index,
                    format,
                    filename: target
                        .rsplit('/')
                        .next()
                        .unwrap_or("image")
                        .to_string(),
                });
            }
        }

        debug!(
            "parsed {} slides, {} images from pptx",
            slide_names.len(),
            images.len()
        );

        let mut parsed = ParsedFile::with_content(content);
        parsed.page_count = Some(slide_names.len());
        parsed.images = images;
        parsed
            .metadata
            .insert("slides".to_string(), json!(slide_names.len()));
        Ok(parsed)
    }
}

#[async_trait]
impl FileParser for PowerPointParser {
    fn name(&self) -> &'static str {
        "powerpoint"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::parse_pptx(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLIDE: &str = r#"<?xml version="1.0"?>
<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
       xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main">
  <p:cSld><p:spTree>
    <p:sp>
      <p:spPr><a:xfrm><a:off x="100" y="5000"/></a:xfrm></p:spPr>
      <p:txBody><a:p><a:r><a:t>Body text below</a:t></a:r></a:p></p:txBody>
    </p:sp>
    <p:sp>
      <p:spPr><a:xfrm><a:off x="100" y="10"/></a:xfrm></p:spPr>
      <p:txBody><a:p><a:r><a:t>Title on top</a:t></a:r></a:p></p:txBody>
    </p:sp>
  </p:spTree></p:cSld>
</p:sld>"#;

    #[test]
    fn shapes_sort_top_to_bottom() {
        let text = PowerPointParser::slide_text(SLIDE);
        let title_pos = text.find("Title on top").unwrap();
        let body_pos = text.find("Body text below").unwrap();
        assert!(title_pos < body_pos);
    }

    const TABLE_SLIDE: &str = r#"<?xml version="1.0"?>
<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
       xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main">
  <p:cSld><p:spTree>
    <p:graphicFrame>
      <a:tbl>
        <a:tr><a:tc><a:txBody><a:p><a:r><a:t>name</a:t></a:r></a:p></a:txBody></a:tc>
              <a:tc><a:txBody><a:p><a:r><a:t>qty</a:t></a:r></a:p></a:txBody></a:tc></a:tr>
        <a:tr><a:tc><a:txBody><a:p><a:r><a:t>bolts</a:t></a:r></a:p></a:txBody></a:tc>
              <a:tc><a:txBody><a:p><a:r><a:t>40</a:t></a:r></a:p></a:txBody></a:tc></a:tr>
      </a:tbl>
    </p:graphicFrame>
  </p:spTree></p:cSld>
</p:sld>"#;

    #[test]
    fn tables_render_row_by_row() {
        let text = PowerPointParser::slide_text(TABLE_SLIDE);
        assert!(text.contains("| name | qty |"));
        assert!(text.contains("| bolts | 40 |"));
    }

    #[test]
    fn rels_image_targets_resolve_media_paths() {
        let rels = r#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="../media/image1.png"/>
  <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideLayout" Target="../slideLayouts/slideLayout1.xml"/>
</Relationships>"#;
        let targets = PowerPointParser::slide_image_targets(rels);
        assert_eq!(targets, vec!["ppt/media/image1.png"]);
    }
}
