//! LLM client for classification and category-taxonomy induction.
//!
//! Talks to an Ollama-compatible `/api/generate` endpoint. Model output
//! is treated as untrusted text: every parse attempt has a documented
//! fallback, and no parsing failure here is ever surfaced as an error
//! to the caller (see spec error-handling: "model output invalid").

use crate::config::LlmConfig;
use crate::model::{ClassificationResult, SuggestedCategory};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

static PROMPT_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static PROMPT_CACHE: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// An email reduced to the fields LLM prompts need.
#[derive(Debug, Clone)]
pub struct EmailSample {
    pub subject: String,
    pub from_addr: String,
    pub body: String,
}

/// One email's proposed category during taxonomy refinement, keyed by
/// its position in the batch passed to [`LlmClient::refine_taxonomy`].
#[derive(Debug, Clone, Deserialize)]
pub struct EmailAssignment {
    pub index: usize,
    pub category: String,
}

/// Load a prompt template by name from `prompts_dir`, cached after
/// first read. Rejects names outside `[A-Za-z0-9_-]` and paths that
/// would escape `prompts_dir`.
///
/// # Errors
///
/// Returns an error for an invalid name or an unreadable/missing file.
pub fn load_prompt(prompts_dir: &Path, name: &str) -> Result<String> {
    if !PROMPT_NAME_PATTERN.is_match(name) {
        return Err(Error::Llm(format!("invalid prompt name: {name}")));
    }

    let cache_key = format!("{}:{name}", prompts_dir.display());
    if let Some(cached) = PROMPT_CACHE.lock().get(&cache_key) {
        return Ok(cached.clone());
    }

    let base = prompts_dir
        .canonicalize()
        .map_err(|e| Error::Llm(format!("prompts directory not found: {e}")))?;
    let candidate = base.join(format!("{name}.txt"));
    let resolved = candidate
        .canonicalize()
        .map_err(|_| Error::Llm(format!("prompt template not found: {name}")))?;
    if !resolved.starts_with(&base) {
        return Err(Error::Llm(format!("invalid prompt name: {name}")));
    }

    let text = std::fs::read_to_string(&resolved)?;
    PROMPT_CACHE.lock().insert(cache_key, text.clone());
    Ok(text)
}

/// Minimal `str.format`-style substitution: `{key}` is replaced from
/// `vars`, `{{`/`}}` are literal braces.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                for nc in chars.by_ref() {
                    if nc == '}' {
                        break;
                    }
                    key.push(nc);
                }
                if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                    out.push_str(value);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn format_email_samples(emails: &[EmailSample], max_emails: usize, max_body_len: usize) -> String {
    emails
        .iter()
        .take(max_emails)
        .enumerate()
        .map(|(i, email)| {
            let body: String = email.body.chars().take(max_body_len).collect();
            format!(
                "\nEmail {}:\n  From: {}\n  Subject: {}\n  Preview: {}",
                i + 1,
                email.from_addr,
                email.subject,
                body
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_folder_name(predicted: &str, valid: &[String]) -> Option<String> {
    let lower_map: HashMap<String, &String> =
        valid.iter().map(|f| (f.to_lowercase(), f)).collect();
    let predicted_lower = predicted.to_lowercase();

    if let Some(exact) = lower_map.get(&predicted_lower) {
        return Some((*exact).clone());
    }
    if let Some(singular) = predicted_lower.strip_suffix('s') {
        if let Some(m) = lower_map.get(singular) {
            return Some((*m).clone());
        }
    } else {
        let plural = format!("{predicted_lower}s");
        if let Some(m) = lower_map.get(&plural) {
            return Some((*m).clone());
        }
    }
    None
}

/// Find the first balanced `start..end` delimited span in `text`
/// (e.g. the first `{...}` or `[...]`), mirroring a naive
/// find-first/find-last scan: tolerant of prose wrapped around the
/// JSON but not of nested unbalanced delimiters.
fn extract_json_span(text: &str, start_char: char, end_char: char) -> Option<&str> {
    let start = text.find(start_char)?;
    let end = text.rfind(end_char)?;
    if end > start { Some(&text[start..=end]) } else { None }
}

fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let span = extract_json_span(text, '{', '}')?;
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn parse_json_array(text: &str) -> Option<Vec<Value>> {
    let span = extract_json_span(text, '[', ']')?;
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    prompts_dir: PathBuf,
}

impl LlmClient {
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &LlmConfig, prompts_dir: PathBuf) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            prompts_dir,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Llm("response missing 'response' field".to_string()))
    }

    fn load(&self, name: &str) -> Result<String> {
        load_prompt(&self.prompts_dir, name)
    }

    /// Classify a message into one of `categories`. Never errors on
    /// model-output problems; falls back to `"Unknown"` with
    /// confidence `0.0`.
    ///
    /// # Errors
    ///
    /// Returns an error only for a transport-level failure talking to
    /// the LLM backend.
    pub async fn classify_message(
        &self,
        email: &EmailSample,
        categories: &indexmap::IndexMap<String, String>,
    ) -> Result<ClassificationResult> {
        let folders_text = categories
            .iter()
            .map(|(name, desc)| format!("- {name}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");
        let valid_folders: Vec<String> = categories.keys().cloned().collect();

        let template = self.load("classify_email")?;
        let prompt = render(
            &template,
            &[
                ("folders_text", &folders_text),
                ("from_addr", &email.from_addr),
                ("subject", &email.subject),
                ("body", &email.body),
            ],
        );

        let response_text = self.generate(&prompt).await?;

        let mut predicted = "Unknown".to_string();
        let mut confidence = 0.0;

        match parse_json_object(&response_text) {
            Some(obj) => {
                predicted = obj
                    .get("predicted_folder")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("Unknown")
                    .to_string();
                confidence = obj
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
            }
            None => warn!("failed to parse classification response"),
        }

        if !valid_folders.iter().any(|f| f == &predicted) {
            match normalize_folder_name(&predicted, &valid_folders) {
                Some(normalized) => {
                    debug!("normalized folder '{predicted}' to '{normalized}'");
                    predicted = normalized;
                }
                None => {
                    warn!("LLM returned invalid folder '{predicted}', using fallback");
                    predicted = "Unknown".to_string();
                    confidence = 0.0;
                }
            }
        }

        Ok(ClassificationResult {
            predicted_category: predicted,
            confidence,
        })
    }

    /// # Errors
    ///
    /// Returns an error only for a transport-level failure.
    pub async fn describe_folder(&self, folder_name: &str, samples: &[EmailSample]) -> Result<String> {
        let samples_text = format_email_samples(samples, 5, 200);
        let template = self.load("generate_folder_description")?;
        let prompt = render(
            &template,
            &[("folder_name", folder_name), ("samples_text", &samples_text)],
        );
        Ok(self.generate(&prompt).await?.trim().to_string())
    }

    /// # Errors
    ///
    /// Returns an error only for a transport-level failure.
    pub async fn suggest_categories(
        &self,
        samples: &[EmailSample],
        max_emails: usize,
    ) -> Result<Vec<SuggestedCategory>> {
        let samples_text = format_email_samples(samples, max_emails, 150);
        let actual_count = samples.len().min(max_emails);
        let template = self.load("suggest_folder_structure")?;
        let prompt = render(
            &template,
            &[
                ("samples_text", &samples_text),
                ("email_count", &actual_count.to_string()),
            ],
        );
        info!("prompt size: {} chars, {actual_count} emails included", prompt.len());

        let response_text = self.generate(&prompt).await?;
        if let Some(items) = parse_json_array(&response_text) {
            return Ok(items.iter().map(suggested_from_value).collect());
        }

        Ok(vec![SuggestedCategory {
            name: "INBOX".to_string(),
            description: "General incoming mail that doesn't fit other categories".to_string(),
            example_criteria: vec!["Uncategorized emails".to_string(), "New contacts".to_string()],
        }])
    }

    /// Refine a taxonomy with one more batch of sample emails.
    ///
    /// # Errors
    ///
    /// Returns an error only for a transport-level failure.
    pub async fn refine_taxonomy(
        &self,
        samples: &[EmailSample],
        existing: &[SuggestedCategory],
        batch_num: usize,
        batch_size: usize,
    ) -> Result<(Vec<SuggestedCategory>, Vec<EmailAssignment>)> {
        let categories_text = if existing.is_empty() {
            "(none yet - first batch)".to_string()
        } else {
            existing
                .iter()
                .map(|c| format!("- {}: {}", c.name, c.description))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let samples_text = format_email_samples(samples, batch_size, 150);

        let template = self.load("refine_folder_structure")?;
        let prompt = render(
            &template,
            &[
                ("existing_categories", &categories_text),
                ("samples_text", &samples_text),
                ("batch_num", &batch_num.to_string()),
            ],
        );

        info!(
            "refine batch {batch_num}: {} emails, {} existing categories",
            samples.len(),
            existing.len()
        );

        let response_text = self.generate(&prompt).await?;

        let mut data = parse_json_object(&response_text);
        if data.is_none() {
            if let Some(span) = extract_json_span(&response_text, '{', '}') {
                info!("attempting JSON repair...");
                if let Some(repaired) = self.repair_json(span).await? {
                    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&repaired) {
                        info!("JSON repair successful");
                        data = Some(obj);
                    }
                }
            }
        }

        match data {
            Some(obj) => Ok(process_refinement_response(&obj, existing)),
            None => Ok((existing.to_vec(), Vec::new())),
        }
    }

    /// Ask the model to fix malformed JSON. Returns `None` if it
    /// cannot produce anything parseable.
    ///
    /// # Errors
    ///
    /// Returns an error only for a transport-level failure.
    pub async fn repair_json(&self, broken_json: &str) -> Result<Option<String>> {
        let truncated: String = broken_json.chars().take(2000).collect();
        let template = self.load("repair_json")?;
        let prompt = render(&template, &[("broken_json", &truncated)]);
        let response_text = self.generate(&prompt).await?;

        for (start, end) in [('{', '}'), ('[', ']')] {
            if let Some(span) = extract_json_span(&response_text, start, end) {
                if serde_json::from_str::<Value>(span).is_ok() {
                    return Ok(Some(span.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Consolidate duplicate/overlapping categories. The returned
    /// rename map's domain always covers every name in `categories`:
    /// a repair pass fills gaps, and anything still missing afterward
    /// is mapped to itself.
    ///
    /// # Errors
    ///
    /// Returns an error only for a transport-level failure.
    pub async fn normalize_taxonomy(
        &self,
        categories: &[SuggestedCategory],
    ) -> Result<(Vec<SuggestedCategory>, HashMap<String, String>)> {
        if categories.len() < 2 {
            let identity = categories.iter().map(|c| (c.name.clone(), c.name.clone())).collect();
            return Ok((categories.to_vec(), identity));
        }

        let original_descriptions: HashMap<String, String> = categories
            .iter()
            .map(|c| (c.name.clone(), c.description.clone()))
            .collect();
        let original_names: std::collections::HashSet<String> =
            original_descriptions.keys().cloned().collect();

        let categories_list = categories
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");

        let template = self.load("normalize_categories")?;
        let prompt = render(
            &template,
            &[
                ("categories_list", &categories_list),
                ("category_count", &categories.len().to_string()),
            ],
        );

        info!("normalizing {} categories...", categories.len());
        let response_text = self.generate(&prompt).await?;

        let Some(obj) = parse_json_object(&response_text) else {
            warn!("failed to parse normalization response");
            let identity = categories.iter().map(|c| (c.name.clone(), c.name.clone())).collect();
            return Ok((categories.to_vec(), identity));
        };

        let mut consolidated: Vec<SuggestedCategory> = obj
            .get("consolidated_categories")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(suggested_from_value_merged).collect())
            .unwrap_or_default();

        let mut rename_map: HashMap<String, String> = obj
            .get("rename_map")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let missing: Vec<String> = original_names
            .iter()
            .filter(|name| !rename_map.contains_key(*name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            warn!("rename map missing {} categories: {missing:?}", missing.len());
            (consolidated, rename_map) = self
                .repair_rename_map(categories, consolidated, rename_map)
                .await?;

            let still_missing: Vec<String> = original_names
                .iter()
                .filter(|name| !rename_map.contains_key(*name))
                .cloned()
                .collect();
            if !still_missing.is_empty() {
                warn!(
                    "after repair, still missing {} - mapping to self",
                    still_missing.len()
                );
                let consolidated_names: std::collections::HashSet<String> =
                    consolidated.iter().map(|c| c.name.clone()).collect();
                for name in still_missing {
                    if !consolidated_names.contains(&name) {
                        consolidated.push(SuggestedCategory {
                            name: name.clone(),
                            description: original_descriptions
                                .get(&name)
                                .cloned()
                                .unwrap_or_else(|| format!("Emails in {name}")),
                            example_criteria: Vec::new(),
                        });
                    }
                    rename_map.insert(name.clone(), name);
                }
            }
        }

        Ok((consolidated, rename_map))
    }

    async fn repair_rename_map(
        &self,
        original_categories: &[SuggestedCategory],
        consolidated: Vec<SuggestedCategory>,
        mut partial_map: HashMap<String, String>,
    ) -> Result<(Vec<SuggestedCategory>, HashMap<String, String>)> {
        let original_by_name: HashMap<&str, &SuggestedCategory> =
            original_categories.iter().map(|c| (c.name.as_str(), c)).collect();
        let mut missing: Vec<&str> = original_by_name
            .keys()
            .filter(|name| !partial_map.contains_key(**name))
            .copied()
            .collect();
        missing.sort_unstable();

        let original_text = original_categories
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let consolidated_text = consolidated
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n");
        let missing_text = missing
            .iter()
            .map(|name| format!("- {name}: {}", original_by_name[name].description))
            .collect::<Vec<_>>()
            .join("\n");
        let mut mapping_pairs: Vec<(&String, &String)> = partial_map.iter().collect();
        mapping_pairs.sort_unstable();
        let existing_mappings_text = mapping_pairs
            .iter()
            .map(|(old, new)| format!("  {old} -> {new}"))
            .collect::<Vec<_>>()
            .join("\n");

        let template = self.load("repair_rename_map")?;
        let prompt = render(
            &template,
            &[
                ("original_count", &original_categories.len().to_string()),
                ("consolidated_count", &consolidated.len().to_string()),
                ("missing_count", &missing.len().to_string()),
                ("original_text", &original_text),
                ("consolidated_text", &consolidated_text),
                ("existing_mappings_text", &existing_mappings_text),
                ("missing_text", &missing_text),
            ],
        );

        info!("asking LLM to repair {} missing mappings...", missing.len());
        let response_text = self.generate(&prompt).await?;

        if let Some(obj) = parse_json_object(&response_text) {
            if let Some(mappings) = obj.get("mappings").and_then(Value::as_object) {
                for (old_name, new_name) in mappings {
                    if missing.contains(&old_name.as_str()) {
                        if let Some(new_name) = new_name.as_str() {
                            info!("  repaired: {old_name} -> {new_name}");
                            partial_map.insert(old_name.clone(), new_name.to_string());
                        }
                    }
                }
            }
        } else {
            warn!("failed to parse repair response");
        }

        Ok((consolidated, partial_map))
    }
}

fn suggested_from_value(item: &Value) -> SuggestedCategory {
    SuggestedCategory {
        name: item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        description: item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        example_criteria: item
            .get("example_criteria")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
    }
}

fn suggested_from_value_merged(item: &Value) -> SuggestedCategory {
    SuggestedCategory {
        name: item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
        description: item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        example_criteria: item
            .get("merged_from")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
    }
}

fn process_refinement_response(
    data: &Map<String, Value>,
    existing: &[SuggestedCategory],
) -> (Vec<SuggestedCategory>, Vec<EmailAssignment>) {
    let assignments: Vec<EmailAssignment> = data
        .get("email_assignments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let mut category_map: indexmap::IndexMap<String, SuggestedCategory> = indexmap::IndexMap::new();

    if let Some(items) = data.get("categories").and_then(Value::as_array) {
        for item in items {
            let cat = suggested_from_value(item);
            category_map.insert(cat.name.clone(), cat);
        }
    }

    for assignment in &assignments {
        category_map.entry(assignment.category.clone()).or_insert_with(|| SuggestedCategory {
            name: assignment.category.clone(),
            description: format!("Emails assigned to {}", assignment.category),
            example_criteria: Vec::new(),
        });
    }

    for cat in existing {
        category_map.entry(cat.name.clone()).or_insert_with(|| cat.clone());
    }

    (category_map.into_values().collect(), assignments)
}
