//! Human-readable Markdown views written next to the JSON indexes.

use super::DirectoryIndex;

/// Table of every image in a directory, sorted by file name.
pub fn render_directory(index: &DirectoryIndex) -> String {
    let mut lines = vec![
        "# Image Catalog".to_string(),
        "| Image | Description |".to_string(),
        "|---|---|".to_string(),
    ];

    for (filename, record) in index.iter() {
        let title = match record.short_name() {
            "" => filename.as_str(),
            name => name,
        };
        lines.push(format!(
            "| [{}]({}) | {} |",
            escape_cell(title),
            link_target(filename),
            escape_cell(record.description())
        ));
    }

    lines.join("\n") + "\n"
}

/// Listing of catalog directories (paths relative to the archive root).
pub fn render_root<S: AsRef<str>>(directories: &[S]) -> String {
    let mut lines = vec!["# Directory List".to_string()];
    for dir in directories {
        let dir = dir.as_ref();
        lines.push(format!(
            "- [{}]({})",
            escape_cell(dir),
            link_target(&format!("{dir}/index.md"))
        ));
    }
    lines.join("\n") + "\n"
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
        .replace(['\r', '\n'], " ")
}

fn link_target(target: &str) -> String {
    if target.contains([' ', '(', ')']) {
        format!("<{target}>")
    } else {
        target.to_string()
    }
}
