//! Locale bundle.
//!
//! Messages live in `locales/<lang>.json` as nested JSON objects and are addressed by
//! dotted keys (`welcome.subject`). Messages are `minijinja` templates rendered with
//! the data passed to [`Localizer::t`].

use crate::{
    error::{Error, Result},
    fs::FileSource,
};
use minijinja::Environment;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

pub const LOCALES_DIR: &str = "locales";

pub type Messages = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct Bundle {
    default_language: String,
    languages: BTreeMap<String, Arc<Messages>>,
}

impl Bundle {
    /// Load every `locales/*.json` file from `fs`.
    ///
    /// # Errors
    /// Fails when the directory is missing, a file is not valid JSON, or the default
    /// language has no file.
    pub fn load(fs: &dyn FileSource, default_language: &str) -> Result<Self> {
        let mut languages = BTreeMap::new();
        for name in fs.list_dir(LOCALES_DIR)? {
            let Some(lang) = name.strip_suffix(".json") else {
                continue;
            };
            let raw = fs.read_to_string(&format!("{LOCALES_DIR}/{name}"))?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|err| Error::validation(format!("invalid locale file {name}: {err}")))?;
            let messages = flatten(&value)
                .map_err(|err| Error::validation(format!("locale file {name}: {err}")))?;
            debug!(lang, keys = messages.len(), "loaded locale");
            languages.insert(lang.to_ascii_lowercase(), Arc::new(messages));
        }

        Self::from_messages(default_language, languages)
    }

    pub fn from_messages(
        default_language: &str,
        languages: BTreeMap<String, Arc<Messages>>,
    ) -> Result<Self> {
        let default_language = default_language.to_ascii_lowercase();
        if !languages.contains_key(&default_language) {
            return Err(Error::configuration(format!(
                "default language {default_language} has no locale file"
            )));
        }
        Ok(Self {
            default_language,
            languages,
        })
    }

    /// A bundle with no messages; every lookup returns its id.
    #[must_use]
    pub fn empty(default_language: &str) -> Self {
        let default_language = default_language.to_ascii_lowercase();
        Self {
            languages: BTreeMap::from([(default_language.clone(), Arc::new(Messages::new()))]),
            default_language,
        }
    }

    #[must_use]
    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.languages.keys().map(String::as_str)
    }

    /// First supported language among `preferred`, trying `es-MX` then `es`.
    #[must_use]
    pub fn localizer<S: AsRef<str>>(&self, preferred: &[S]) -> Localizer {
        let language = preferred
            .iter()
            .find_map(|tag| self.match_tag(tag.as_ref()))
            .unwrap_or_else(|| self.default_language.clone());
        self.localizer_for(&language)
    }

    #[must_use]
    pub fn localizer_from_header(&self, accept_language: Option<&str>) -> Localizer {
        let tags = accept_language.map(parse_accept_language).unwrap_or_default();
        self.localizer(&tags)
    }

    fn match_tag(&self, tag: &str) -> Option<String> {
        let tag = tag.trim().to_ascii_lowercase().replace('_', "-");
        if self.languages.contains_key(&tag) {
            return Some(tag);
        }
        let primary = tag.split('-').next()?;
        self.languages
            .contains_key(primary)
            .then(|| primary.to_string())
    }

    fn localizer_for(&self, language: &str) -> Localizer {
        let fallback = self.languages.get(&self.default_language).cloned();
        let messages = self
            .languages
            .get(language)
            .cloned()
            .or_else(|| fallback.clone())
            .unwrap_or_default();
        Localizer {
            language: language.to_string(),
            messages,
            fallback: fallback.unwrap_or_default(),
        }
    }

    /// Compare every language against the default one.
    #[must_use]
    pub fn sync_report(&self) -> BTreeMap<String, SyncReport> {
        let Some(reference) = self.languages.get(&self.default_language) else {
            return BTreeMap::new();
        };
        self.languages
            .iter()
            .filter(|(lang, _)| **lang != self.default_language)
            .map(|(lang, messages)| (lang.clone(), sync_report(reference, messages)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Localizer {
    language: String,
    messages: Arc<Messages>,
    fallback: Arc<Messages>,
}

impl Localizer {
    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Translate `id`, rendering placeholders from `data`. Unknown ids return the id.
    pub fn t<D: Serialize>(&self, id: &str, data: D) -> String {
        let Some(message) = self
            .messages
            .get(id)
            .or_else(|| self.fallback.get(id))
        else {
            return id.to_string();
        };

        if !message.contains("{{") && !message.contains("{%") {
            return message.clone();
        }

        match Environment::new().render_str(message, data) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(id, lang = %self.language, "failed to render message: {err}");
                message.clone()
            }
        }
    }
}

/// Parse `Accept-Language` into tags ordered by quality.
#[must_use]
pub fn parse_accept_language(header: &str) -> Vec<String> {
    let mut weighted: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let tag = pieces.next()?.trim();
            if tag.is_empty() || tag == "*" {
                return None;
            }
            let quality = pieces
                .find_map(|param| param.trim().strip_prefix("q="))
                .and_then(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then(|| (tag.to_string(), quality))
        })
        .collect();
    // Stable sort keeps header order for equal weights.
    weighted.sort_by(|a, b| b.1.total_cmp(&a.1));
    weighted.into_iter().map(|(tag, _)| tag).collect()
}

/// Flatten nested JSON into dotted keys.
///
/// # Errors
/// Every leaf must be a string and no key may be empty or contain a `.`; anything
/// else could not be restored by [`unflatten`].
pub fn flatten(value: &Value) -> Result<Messages> {
    let Value::Object(map) = value else {
        return Err(Error::validation("locale messages must be a JSON object"));
    };
    let mut out = Messages::new();
    flatten_into(&mut out, "", map)?;
    Ok(out)
}

fn flatten_into(out: &mut Messages, prefix: &str, map: &Map<String, Value>) -> Result<()> {
    for (key, child) in map {
        if key.is_empty() || key.contains('.') {
            return Err(Error::validation(format!(
                "invalid message key {key:?} under {prefix:?}"
            )));
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match child {
            Value::Object(nested) => flatten_into(out, &path, nested)?,
            Value::String(text) => {
                out.insert(path, text.clone());
            }
            other => {
                return Err(Error::validation(format!(
                    "message {path} must be a string, got {other}"
                )));
            }
        }
    }
    Ok(())
}

/// Inverse of [`flatten`].
///
/// # Errors
/// Fails on empty key segments and when a key is both a message and a parent
/// (`a` and `a.b`).
pub fn unflatten(messages: &Messages) -> Result<Value> {
    let mut root = Map::new();
    for (key, message) in messages {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(Error::validation(format!("invalid message key {key:?}")));
        }
        let Some((leaf, parents)) = parts.split_last() else {
            continue;
        };
        let mut node = &mut root;
        for part in parents {
            let entry = node
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(child) = entry else {
                return Err(Error::validation(format!(
                    "message key {key} collides with message {part}"
                )));
            };
            node = child;
        }
        if node.contains_key(*leaf) {
            return Err(Error::validation(format!(
                "message key {key} is also a parent of other messages"
            )));
        }
        node.insert((*leaf).to_string(), Value::String(message.clone()));
    }
    Ok(Value::Object(root))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Keys in the reference but absent from the target.
    pub missing: Vec<String>,
    /// Keys in the target that the reference does not know.
    pub extra: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn is_in_sync(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

#[must_use]
pub fn sync_report(reference: &Messages, target: &Messages) -> SyncReport {
    SyncReport {
        missing: reference
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect(),
        extra: target
            .keys()
            .filter(|key| !reference.contains_key(*key))
            .cloned()
            .collect(),
    }
}
