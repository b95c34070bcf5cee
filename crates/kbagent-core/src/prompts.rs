//! Prompt renderer.
//!
//! Prompt definitions are JSON files under a prompts directory, each with a
//! declared parameter list, a default template, optional variants selected
//! by simple equality predicates, and an optional reasoning form (system +
//! user templates). Rendering is a pure function of its inputs; the renderer
//! keeps a file-read cache keyed by path and modification time. Built-in
//! definitions exist for the three prompts the pipeline itself needs, so the
//! core runs without a prompts directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Deserialize;

use crate::backend::{BackendError, BackendResult, ChatMessage};

// ── Definitions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Plain prompt string for `generate`.
    Standard,
    /// System + user messages for `chat`.
    Reasoning,
}

#[derive(Debug, Clone)]
pub enum Rendered {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Rendered {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Rendered::Messages(m) => m,
            Rendered::Text(t) => vec![ChatMessage::user(t)],
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Rendered::Text(t) => t,
            Rendered::Messages(m) => m
                .into_iter()
                .map(|msg| msg.content)
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptVariant {
    pub name: String,
    /// Selected when `params[when_param] == equals`.
    pub when_param: String,
    pub equals: String,
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptDefinition {
    pub id: String,
    /// Required parameter names; rendering fails if any is missing.
    #[serde(default)]
    pub params: Vec<String>,
    pub template: String,
    /// System message for the reasoning form; template doubles as the user turn.
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub variants: Vec<PromptVariant>,
}

struct CachedDefinition {
    mtime: SystemTime,
    def: PromptDefinition,
}

// ── Renderer ─────────────────────────────────────────────────────────────

pub struct PromptRenderer {
    dir: Option<PathBuf>,
    cache: Mutex<HashMap<PathBuf, CachedDefinition>>,
}

impl PromptRenderer {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, cache: Mutex::new(HashMap::new()) }
    }

    /// Render `prompt_id` with `params`. Returns a plain string for standard
    /// models and role/content messages for reasoning models.
    pub fn render(
        &self,
        prompt_id: &str,
        model_type: ModelType,
        params: &BTreeMap<String, String>,
        variant: Option<&str>,
    ) -> BackendResult<Rendered> {
        let def = self.load(prompt_id)?;

        for required in &def.params {
            if !params.contains_key(required) {
                return Err(BackendError::validation(
                    "renderer",
                    "render",
                    format!("prompt '{prompt_id}' missing required param '{required}'"),
                ));
            }
        }

        let template = self.select_template(&def, params, variant);
        let body = fill(&template, params);

        match model_type {
            ModelType::Standard => Ok(Rendered::Text(body)),
            ModelType::Reasoning => {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = &def.system {
                    messages.push(ChatMessage::system(fill(system, params)));
                }
                messages.push(ChatMessage::user(body));
                Ok(Rendered::Messages(messages))
            }
        }
    }

    fn select_template(
        &self,
        def: &PromptDefinition,
        params: &BTreeMap<String, String>,
        variant: Option<&str>,
    ) -> String {
        if let Some(name) = variant {
            if let Some(v) = def.variants.iter().find(|v| v.name == name) {
                return v.template.clone();
            }
        }
        for v in &def.variants {
            if params.get(&v.when_param).map(String::as_str) == Some(v.equals.as_str()) {
                return v.template.clone();
            }
        }
        def.template.clone()
    }

    fn load(&self, prompt_id: &str) -> BackendResult<PromptDefinition> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{prompt_id}.json"));
            if path.exists() {
                return self.load_file(&path, prompt_id);
            }
        }
        builtin(prompt_id).ok_or_else(|| {
            BackendError::validation("renderer", "render", format!("unknown prompt '{prompt_id}'"))
        })
    }

    fn load_file(&self, path: &Path, prompt_id: &str) -> BackendResult<PromptDefinition> {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(path) {
                if cached.mtime == mtime {
                    return Ok(cached.def.clone());
                }
            }
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            BackendError::validation("renderer", "render", format!("read {}: {e}", path.display()))
        })?;
        let def: PromptDefinition = serde_json::from_str(&contents).map_err(|e| {
            BackendError::validation(
                "renderer",
                "render",
                format!("invalid prompt definition '{prompt_id}': {e}"),
            )
        })?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), CachedDefinition { mtime, def: def.clone() });
        }
        Ok(def)
    }
}

fn fill(template: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

// ── Built-in definitions ─────────────────────────────────────────────────

pub const PROMPT_IMAGE_DESCRIPTION: &str = "image_description";
pub const PROMPT_CATEGORIZATION: &str = "categorization";
pub const PROMPT_KB_ITEM_GENERATION: &str = "kb_item_generation";

fn builtin(prompt_id: &str) -> Option<PromptDefinition> {
    let def = match prompt_id {
        PROMPT_IMAGE_DESCRIPTION => PromptDefinition {
            id: prompt_id.to_string(),
            params: vec![],
            template: "Describe this image for a technical knowledge base. Focus on any \
                       diagrams, code, terminal output, or architecture shown. Be concise \
                       and factual; two to four sentences."
                .to_string(),
            system: None,
            variants: vec![],
        },
        PROMPT_CATEGORIZATION => PromptDefinition {
            id: prompt_id.to_string(),
            params: vec!["content".to_string(), "existing_categories".to_string()],
            template: "You are an expert technical content curator.\n\n\
                       Existing categories:\n{existing_categories}\n\n\
                       Categorize the content below. Prefer an existing category when one \
                       fits; never use 'general' or 'other'. The item name must be a short, \
                       specific technical title of 2-5 words.\n\n\
                       Respond with a single JSON object:\n\
                       {\"main_category\": \"...\", \"sub_category\": \"...\", \"item_name\": \"...\"}\n\n\
                       Content:\n{content}"
                .to_string(),
            system: Some(
                "You categorize technical social-media content into a fixed two-level \
                 category tree and produce a concise item name. Respond only with the \
                 requested JSON object."
                    .to_string(),
            ),
            variants: vec![],
        },
        PROMPT_KB_ITEM_GENERATION => PromptDefinition {
            id: prompt_id.to_string(),
            params: vec!["context".to_string()],
            template: "Write a knowledge-base article from the source material below.\n\n\
                       Respond with a single JSON object with these fields:\n\
                       suggested_title (string), meta_description (string), introduction \
                       (string), sections (array of {heading, content_paragraphs, \
                       code_blocks: [{language, code, explanation}], lists: [{type: \
                       bulleted|numbered, items}], notes_or_tips}), key_takeaways (array \
                       of strings), conclusion (string), external_references (array of \
                       {text, url}).\n\n\
                       Source material:\n{context}"
                .to_string(),
            system: Some(
                "You are a senior technical writer producing structured knowledge-base \
                 articles. Respond only with the requested JSON object."
                    .to_string(),
            ),
            variants: vec![],
        },
        _ => return None,
    };
    Some(def)
}
