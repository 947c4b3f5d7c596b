//! Extension-dispatch text extraction for document ingestion.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Extract plain text from a file, dispatching on its extension.
/// Unknown extensions return an error so ingestion can skip them loudly.
pub fn extract_text(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "md" | "csv" | "mbox" | "hwp" => read_flat(path),
        "html" | "xml" => Ok(strip_tags(&read_flat(path)?)),
        "ipynb" => read_notebook(path),
        "pdf" => read_pdf(path),
        "docx" => read_zip_entry(path, "word/document.xml").map(|xml| strip_tags(&xml)),
        "pptx" => read_pptx(path),
        "epub" => read_epub(path),
        other => Err(anyhow!("no reader registered for extension: .{other}")),
    }
}

/// True when ingestion knows how to read this file.
pub fn is_supported(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    matches!(
        ext.to_lowercase().as_str(),
        "txt" | "md" | "csv" | "mbox" | "hwp" | "html" | "xml" | "ipynb" | "pdf" | "docx"
            | "pptx" | "epub"
    )
}

fn read_flat(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read file: {}", path.display()))
}

fn read_pdf(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path)
        .with_context(|| format!("failed to load pdf: {}", path.display()))?;
    let pages: Vec<u32> = doc.get_pages().keys().cloned().collect();
    doc.extract_text(&pages)
        .with_context(|| format!("failed to extract pdf text: {}", path.display()))
}

fn read_notebook(path: &Path) -> Result<String> {
    let raw = read_flat(path)?;
    let notebook: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse notebook: {}", path.display()))?;
    let mut parts = Vec::new();
    if let Some(cells) = notebook.get("cells").and_then(|c| c.as_array()) {
        for cell in cells {
            match cell.get("source") {
                Some(serde_json::Value::String(s)) => parts.push(s.clone()),
                Some(serde_json::Value::Array(lines)) => {
                    let text: String = lines
                        .iter()
                        .filter_map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .join("");
                    parts.push(text);
                }
                _ => {}
            }
        }
    }
    Ok(parts.join("\n\n"))
}

fn open_zip(path: &Path) -> Result<zip::ZipArchive<File>> {
    let file =
        File::open(path).with_context(|| format!("failed to open file: {}", path.display()))?;
    zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read container: {}", path.display()))
}

fn read_zip_entry(path: &Path, entry: &str) -> Result<String> {
    let mut archive = open_zip(path)?;
    let mut file = archive
        .by_name(entry)
        .with_context(|| format!("missing entry {entry} in {}", path.display()))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
}

fn read_pptx(path: &Path) -> Result<String> {
    let mut archive = open_zip(path)?;
    let slide_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .collect();

    let mut slides = Vec::new();
    let mut sorted = slide_names;
    sorted.sort();
    for name in sorted {
        let mut file = archive.by_name(&name)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        slides.push(strip_tags(&content));
    }
    Ok(slides.join("\n\n"))
}

fn read_epub(path: &Path) -> Result<String> {
    let mut archive = open_zip(path)?;
    let chapter_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| {
            name.ends_with(".xhtml") || name.ends_with(".html") || name.ends_with(".htm")
        })
        .collect();

    let mut chapters = Vec::new();
    let mut sorted = chapter_names;
    sorted.sort();
    for name in sorted {
        let mut file = archive.by_name(&name)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        chapters.push(strip_tags(&content));
    }
    Ok(chapters.join("\n\n"))
}

/// Remove markup tags and decode the common entities, collapsing runs of
/// whitespace into single spaces (newlines survive as separators).
pub fn strip_tags(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                // Tag boundaries separate words in the rendered document.
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let mut collapsed = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c == '\n' {
            if !collapsed.ends_with('\n') {
                collapsed.push('\n');
            }
            last_space = true;
        } else if c.is_whitespace() {
            if !last_space {
                collapsed.push(' ');
            }
            last_space = true;
        } else {
            collapsed.push(c);
            last_space = false;
        }
    }
    collapsed.trim().to_string()
}
