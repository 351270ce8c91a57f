//! Human-editable category store.
//!
//! Categories live in a line-oriented text file:
//!
//! ```text
//! CategoryName: Description of what emails belong in this category.
//!
//! AnotherCategory: Another description that can span
//! multiple lines until the next blank line or category.
//! ```
//!
//! Lines starting with `#` are comments.

use crate::model::Category;
use indexmap::IndexMap;
use std::fmt;
use std::path::Path;

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

/// Load categories from a text file. Returns an empty list if the file
/// does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn load_categories(path: &Path) -> crate::Result<Vec<Category>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_categories(&contents))
}

#[must_use]
pub fn parse_categories(contents: &str) -> Vec<Category> {
    let mut categories = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_desc_lines: Vec<String> = Vec::new();

    let mut save_current = |name: &mut Option<String>, lines: &mut Vec<String>| {
        if let Some(name_str) = name.take() {
            let desc = lines.join(" ").trim().to_string();
            if !desc.is_empty() {
                categories.push(Category {
                    name: name_str,
                    description: desc,
                });
            }
        }
        lines.clear();
    };

    for raw_line in contents.lines() {
        let line = raw_line.trim_end();

        if line.starts_with('#') {
            continue;
        }

        if line.trim().is_empty() {
            save_current(&mut current_name, &mut current_desc_lines);
            continue;
        }

        if let Some(colon_idx) = line.find(':') {
            if !line.starts_with(' ') && !line.starts_with('\t') {
                let potential_name = line[..colon_idx].trim();
                if !potential_name.is_empty() && !potential_name.contains(' ') {
                    save_current(&mut current_name, &mut current_desc_lines);
                    current_name = Some(potential_name.to_string());
                    current_desc_lines.push(line[colon_idx + 1..].trim().to_string());
                    continue;
                }
            }
        }

        if current_name.is_some() {
            current_desc_lines.push(line.trim().to_string());
        }
    }
    save_current(&mut current_name, &mut current_desc_lines);

    categories
}

/// Write categories to a text file with the standard preamble.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_categories(categories: &[Category], path: &Path) -> crate::Result<()> {
    let mut lines = vec![
        "# Email Classification Categories".to_string(),
        "# Format: CategoryName: Description".to_string(),
        "#".to_string(),
        "# Edit this file to customize categories. The LLM will use these".to_string(),
        "# descriptions to classify emails into the appropriate category.".to_string(),
        String::new(),
    ];
    for cat in categories {
        lines.push(format!("{}: {}", cat.name, cat.description));
        lines.push(String::new());
    }
    std::fs::write(path, lines.join("\n"))?;
    Ok(())
}

/// Category name -> description, preserving file order (stable for
/// prompt construction).
#[must_use]
pub fn category_descriptions(categories: &[Category]) -> IndexMap<String, String> {
    categories
        .iter()
        .map(|c| (c.name.clone(), c.description.clone()))
        .collect()
}

/// Format categories as a bullet list for inclusion in LLM prompts.
#[must_use]
pub fn format_categories_for_prompt(categories: &[Category]) -> String {
    categories
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n")
}
