//! On-disk YAML schema for module files, and its conversion into a
//! validated [`ModuleDefinition`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use briefengine_shared::{Destination, ModuleDefinition, RunType, SectionRule, VariantDefinition};

/// Key in `searches` / `sections` maps that applies to run types without their own entry.
const DEFAULT_KEY: &str = "default";

/// A module file as written by the operator, before validation.
///
/// Unknown keys are rejected so a misspelled key fails loudly instead of
/// silently dropping its value.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawModule {
    #[serde(default)]
    pub destination: Option<RawDestination>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub searches: Option<RawSearches>,
    /// Older spelling of `searches: { weekly: [...] }`; takes precedence for weekly runs.
    #[serde(default)]
    pub searches_weekly: Option<Vec<String>>,
    #[serde(default)]
    pub freshness: BTreeMap<String, String>,
    #[serde(default)]
    pub sections: BTreeMap<String, Vec<SectionRule>>,
}

/// `destination:` is either an alias into `[destinations]` or an inline pair.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawDestination {
    Alias(String),
    Inline {
        chat_id: ChatId,
        #[serde(default)]
        thread_id: Option<i64>,
    },
}

/// Chat ids are often written as bare negative integers in YAML.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ChatId {
    Number(i64),
    Text(String),
}

impl ChatId {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

/// `searches:` is either one list shared by every run type or a per-run-type map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawSearches {
    Shared(Vec<String>),
    PerRunType(BTreeMap<String, Vec<String>>),
}

impl RawSearches {
    fn for_run_type(&self, run_type: &RunType) -> Option<&Vec<String>> {
        match self {
            Self::Shared(list) => Some(list),
            Self::PerRunType(map) => map.get(run_type.as_str()).or_else(|| map.get(DEFAULT_KEY)),
        }
    }

    fn lists(&self) -> Vec<(&str, &Vec<String>)> {
        match self {
            Self::Shared(list) => vec![("*", list)],
            Self::PerRunType(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        }
    }
}

/// Validate a raw module and load its prompt templates.
///
/// Returns a human-readable reason on failure; the caller turns it into
/// `ConfigInvalid` for this module only.
pub(crate) fn build_definition(
    name: &str,
    raw: RawModule,
    prompts_root: &Path,
    destinations: &BTreeMap<String, Destination>,
) -> Result<ModuleDefinition, String> {
    let destination = resolve_destination(raw.destination, destinations)?;

    if raw.prompts.is_empty() && raw.searches.is_none() && raw.searches_weekly.is_none() {
        return Err("module declares no prompts and no searches".into());
    }

    let mut lists = raw.searches.as_ref().map(|s| s.lists()).unwrap_or_default();
    if let Some(weekly) = &raw.searches_weekly {
        lists.push(("searches_weekly", weekly));
    }
    for (key, list) in lists {
        if list.is_empty() {
            return Err(format!("search list for '{key}' is empty"));
        }
        if list.iter().any(|q| q.trim().is_empty()) {
            return Err(format!("search list for '{key}' contains a blank query"));
        }
    }

    if let Some(max_tokens) = raw.max_tokens {
        if max_tokens == 0 {
            return Err("max_tokens must be greater than zero".into());
        }
    }

    let mut variants = BTreeMap::new();

    for (key, prompt_path) in &raw.prompts {
        let run_type = RunType::parse(key)
            .ok_or_else(|| format!("prompt key '{key}' is not a valid run type"))?;

        let Some(queries) = queries_for(raw.searches.as_ref(), raw.searches_weekly.as_ref(), &run_type) else {
            // No query mapping: the run type resolves to VariantNotFound.
            warn!(module = name, run_type = %run_type, "prompt declared without searches");
            continue;
        };

        let full_path = prompts_root.join(prompt_path);
        let prompt_template = std::fs::read_to_string(&full_path)
            .map_err(|e| format!("prompt file {} unreadable: {e}", full_path.display()))?;

        let sections = raw
            .sections
            .get(run_type.as_str())
            .or_else(|| raw.sections.get(DEFAULT_KEY))
            .cloned()
            .unwrap_or_default();

        variants.insert(
            run_type.clone(),
            VariantDefinition {
                prompt_path: prompt_path.clone(),
                prompt_template,
                queries: queries.iter().map(|q| q.trim().to_string()).collect(),
                freshness: raw.freshness.get(run_type.as_str()).cloned(),
                sections,
            },
        );
    }

    Ok(ModuleDefinition {
        name: name.to_string(),
        destination,
        model: raw.model.filter(|m| !m.trim().is_empty()),
        max_tokens: raw.max_tokens,
        variants,
    })
}

fn queries_for<'a>(
    searches: Option<&'a RawSearches>,
    searches_weekly: Option<&'a Vec<String>>,
    run_type: &RunType,
) -> Option<&'a Vec<String>> {
    if run_type.as_str() == RunType::WEEKLY {
        if let Some(weekly) = searches_weekly {
            return Some(weekly);
        }
    }
    searches.and_then(|s| s.for_run_type(run_type))
}

fn resolve_destination(
    raw: Option<RawDestination>,
    destinations: &BTreeMap<String, Destination>,
) -> Result<Destination, String> {
    let destination = match raw {
        None => return Err("missing destination".into()),
        Some(RawDestination::Alias(alias)) => destinations
            .get(alias.trim())
            .cloned()
            .ok_or_else(|| format!("unknown destination alias '{alias}'"))?,
        Some(RawDestination::Inline { chat_id, thread_id }) => Destination {
            chat_id: chat_id.into_string(),
            thread_id,
        },
    };

    if destination.chat_id.is_empty() {
        return Err("destination chat_id is empty".into());
    }

    Ok(destination)
}
