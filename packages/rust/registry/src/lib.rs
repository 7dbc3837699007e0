//! Module registry: the Config Resolver stage.
//!
//! Every `<name>.yaml` under the modules directory is parsed and validated once,
//! at startup, into an immutable [`ModuleDefinition`]. A run then resolves its
//! `(module, run type)` pair against the in-memory registry with no further I/O.
//! A module file that fails validation poisons only that module.

mod schema;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use briefengine_shared::{
    AppConfig, BriefError, Destination, ModuleDefinition, Result, RunType, VariantDefinition,
};

use crate::schema::RawModule;

/// File extensions recognized as module definitions.
const MODULE_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// A module and the variant selected for one run.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub module: Arc<ModuleDefinition>,
    pub run_type: RunType,
    pub variant: VariantDefinition,
}

/// Loaded module definitions, keyed by module name.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// Either a validated module or the reason it was rejected.
    modules: BTreeMap<String, std::result::Result<Arc<ModuleDefinition>, String>>,
}

impl ModuleRegistry {
    /// Load the registry from the directories named in the app config.
    pub fn load(config: &AppConfig) -> Result<Self> {
        Self::load_dir(
            Path::new(&config.engine.modules_dir),
            Path::new(&config.engine.prompts_root),
            &config.destinations,
        )
    }

    /// Load every module file in `dir`. Prompt paths resolve against `prompts_root`.
    ///
    /// A missing directory yields an empty registry, so every lookup reports
    /// `ConfigNotFound` through the normal run path.
    #[instrument(skip(destinations), fields(dir = %dir.display()))]
    pub fn load_dir(
        dir: &Path,
        prompts_root: &Path,
        destinations: &BTreeMap<String, Destination>,
    ) -> Result<Self> {
        let mut registry = Self::default();

        if !dir.is_dir() {
            warn!(dir = %dir.display(), "modules directory not found");
            return Ok(registry);
        }

        let entries = std::fs::read_dir(dir).map_err(|e| BriefError::io(dir, e))?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext))
            })
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let loaded = std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))
                .and_then(|text| {
                    serde_yaml::from_str::<RawModule>(&text)
                        .map_err(|e| format!("failed to parse {}: {e}", path.display()))
                })
                .and_then(|raw| schema::build_definition(&name, raw, prompts_root, destinations));

            match &loaded {
                Ok(def) => debug!(module = %name, variants = def.variants.len(), "module loaded"),
                Err(reason) => warn!(module = %name, %reason, "module rejected"),
            }

            registry.modules.insert(name, loaded.map(Arc::new));
        }

        info!(
            modules = registry.modules.len(),
            rejected = registry.modules.values().filter(|m| m.is_err()).count(),
            "module registry loaded"
        );

        Ok(registry)
    }

    /// Build a registry from already-validated definitions (injected fixtures).
    pub fn from_definitions(definitions: impl IntoIterator<Item = ModuleDefinition>) -> Self {
        let modules = definitions
            .into_iter()
            .map(|def| (def.name.clone(), Ok(Arc::new(def))))
            .collect();
        Self { modules }
    }

    /// All known module names, including rejected ones.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Look up a module by name.
    pub fn module(&self, name: &str) -> Result<Arc<ModuleDefinition>> {
        match self.modules.get(name) {
            None => Err(BriefError::ConfigNotFound {
                module: name.to_string(),
            }),
            Some(Err(reason)) => Err(BriefError::config_invalid(name, reason.clone())),
            Some(Ok(def)) => Ok(Arc::clone(def)),
        }
    }

    /// Select the prompt variant and query set for `(module, run_type)`.
    pub fn resolve(&self, module: &str, run_type: &RunType) -> Result<ResolvedRun> {
        let definition = self.module(module)?;

        let variant = definition
            .variant(run_type)
            .cloned()
            .ok_or_else(|| BriefError::VariantNotFound {
                module: module.to_string(),
                run_type: run_type.to_string(),
            })?;

        Ok(ResolvedRun {
            module: definition,
            run_type: run_type.clone(),
            variant,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        modules: PathBuf,
        root: PathBuf,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let modules = root.join("configs");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::create_dir_all(root.join("prompts")).unwrap();
        for (rel, body) in files {
            std::fs::write(root.join(rel), body).unwrap();
        }
        Fixture {
            _dir: dir,
            modules,
            root,
        }
    }

    const STONE_NEWS: &str = r#"
destination:
  chat_id: "-1001234"
  thread_id: 42
model: claude-sonnet-4-5
prompts:
  daily: prompts/daily.md
  weekly: prompts/weekly.md
searches:
  daily: ["stone board news", "stone competitors", "stone industry"]
  weekly: ["stone weekly roundup"]
freshness:
  weekly: pw
sections:
  daily:
    - { title: "Top Stories", required: true }
    - { title: "Competitors" }
"#;

    fn stone_fixture() -> Fixture {
        fixture(&[
            ("configs/stone-news.yaml", STONE_NEWS),
            ("prompts/daily.md", "Daily brief for {date}"),
            ("prompts/weekly.md", "Weekly brief for {date}"),
        ])
    }

    fn load(fx: &Fixture) -> ModuleRegistry {
        ModuleRegistry::load_dir(&fx.modules, &fx.root, &BTreeMap::new()).expect("load registry")
    }

    #[test]
    fn resolves_daily_variant() {
        let fx = stone_fixture();
        let registry = load(&fx);

        let resolved = registry.resolve("stone-news", &RunType::daily()).unwrap();
        assert_eq!(resolved.module.destination.thread_id, Some(42));
        assert_eq!(resolved.module.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(resolved.variant.queries.len(), 3);
        assert_eq!(resolved.variant.prompt_template, "Daily brief for {date}");
        assert_eq!(resolved.variant.sections.len(), 2);
        assert!(resolved.variant.sections[0].required);
        assert!(resolved.variant.freshness.is_none());
    }

    #[test]
    fn weekly_variant_has_its_own_queries() {
        let fx = stone_fixture();
        let registry = load(&fx);

        let resolved = registry.resolve("stone-news", &RunType::weekly()).unwrap();
        assert_eq!(resolved.variant.queries, vec!["stone weekly roundup".to_string()]);
        assert_eq!(resolved.variant.freshness.as_deref(), Some("pw"));
        assert!(resolved.variant.sections.is_empty());
    }

    #[test]
    fn unknown_module_is_config_not_found() {
        let fx = stone_fixture();
        let registry = load(&fx);

        let err = registry.resolve("moon-news", &RunType::daily()).unwrap_err();
        assert!(matches!(err, BriefError::ConfigNotFound { .. }));
    }

    #[test]
    fn undeclared_run_type_is_variant_not_found() {
        let fx = stone_fixture();
        let registry = load(&fx);

        let err = registry.resolve("stone-news", &RunType::flash()).unwrap_err();
        assert!(matches!(err, BriefError::VariantNotFound { .. }));
        assert_eq!(err.kind(), "VariantNotFound");
    }

    #[test]
    fn prompt_without_queries_is_variant_not_found() {
        let fx = fixture(&[
            (
                "configs/partial.yaml",
                "destination: { chat_id: \"1\" }\nprompts:\n  daily: prompts/d.md\n  flash: prompts/d.md\nsearches:\n  daily: [\"q\"]\n",
            ),
            ("prompts/d.md", "x"),
        ]);
        let registry = load(&fx);

        assert!(registry.resolve("partial", &RunType::daily()).is_ok());
        let err = registry.resolve("partial", &RunType::flash()).unwrap_err();
        assert!(matches!(err, BriefError::VariantNotFound { .. }));
    }

    #[test]
    fn missing_destination_is_config_invalid() {
        let fx = fixture(&[
            ("configs/broken.yaml", "prompts:\n  daily: prompts/d.md\nsearches: [\"q\"]\n"),
            ("prompts/d.md", "x"),
        ]);
        let registry = load(&fx);

        let err = registry.resolve("broken", &RunType::daily()).unwrap_err();
        match err {
            BriefError::ConfigInvalid { module, message } => {
                assert_eq!(module, "broken");
                assert!(message.contains("missing destination"));
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn missing_prompt_file_is_config_invalid() {
        let fx = fixture(&[(
            "configs/noprompt.yaml",
            "destination: { chat_id: \"1\" }\nprompts:\n  daily: prompts/missing.md\nsearches: [\"q\"]\n",
        )]);
        let registry = load(&fx);

        let err = registry.resolve("noprompt", &RunType::daily()).unwrap_err();
        assert!(matches!(err, BriefError::ConfigInvalid { .. }));
        assert!(err.to_string().contains("unreadable"));
    }

    #[test]
    fn empty_query_list_is_config_invalid() {
        let fx = fixture(&[
            (
                "configs/empty.yaml",
                "destination: { chat_id: \"1\" }\nprompts:\n  daily: prompts/d.md\nsearches:\n  daily: []\n",
            ),
            ("prompts/d.md", "x"),
        ]);
        let registry = load(&fx);

        let err = registry.resolve("empty", &RunType::daily()).unwrap_err();
        assert!(matches!(err, BriefError::ConfigInvalid { .. }));
    }

    #[test]
    fn no_prompts_and_no_searches_is_config_invalid() {
        let fx = fixture(&[("configs/bare.yaml", "destination: { chat_id: \"1\" }\n")]);
        let registry = load(&fx);

        let err = registry.module("bare").unwrap_err();
        assert!(err.to_string().contains("no prompts and no searches"));
    }

    #[test]
    fn invalid_module_does_not_affect_others() {
        let fx = fixture(&[
            ("configs/stone-news.yaml", STONE_NEWS),
            ("configs/garbage.yaml", "prompts: [this is: not: valid"),
            ("prompts/daily.md", "d"),
            ("prompts/weekly.md", "w"),
        ]);
        let registry = load(&fx);

        assert!(registry.resolve("stone-news", &RunType::daily()).is_ok());
        assert!(matches!(
            registry.module("garbage").unwrap_err(),
            BriefError::ConfigInvalid { .. }
        ));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["garbage", "stone-news"]);
    }

    #[test]
    fn missing_directory_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            ModuleRegistry::load_dir(&dir.path().join("nope"), dir.path(), &BTreeMap::new())
                .unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.module("anything").unwrap_err(),
            BriefError::ConfigNotFound { .. }
        ));
    }

    #[test]
    fn non_yaml_files_are_ignored() {
        let fx = fixture(&[
            ("configs/stone-news.yaml", STONE_NEWS),
            ("configs/README.md", "# notes"),
            ("prompts/daily.md", "d"),
            ("prompts/weekly.md", "w"),
        ]);
        let registry = load(&fx);
        assert_eq!(registry.names().count(), 1);
    }

    #[test]
    fn injected_definitions_resolve() {
        let mut variants = BTreeMap::new();
        variants.insert(
            RunType::daily(),
            VariantDefinition {
                prompt_path: "inline".into(),
                prompt_template: "t".into(),
                queries: vec!["q".into()],
                freshness: None,
                sections: vec![],
            },
        );
        let registry = ModuleRegistry::from_definitions([ModuleDefinition {
            name: "fixture".into(),
            destination: Destination {
                chat_id: "1".into(),
                thread_id: None,
            },
            model: None,
            max_tokens: None,
            variants,
        }]);

        let resolved = registry.resolve("fixture", &RunType::daily()).unwrap();
        assert_eq!(resolved.variant.queries, vec!["q".to_string()]);
    }

    #[test]
    fn misspelled_key_is_config_invalid() {
        let fx = fixture(&[
            (
                "configs/typo.yaml",
                "destination: { chat_id: \"1\" }\nprompts:\n  daily: prompts/d.md\nserches: [\"q\"]\n",
            ),
            ("prompts/d.md", "x"),
        ]);
        let registry = load(&fx);

        match registry.resolve("typo", &RunType::daily()).unwrap_err() {
            BriefError::ConfigInvalid { message, .. } => assert!(message.contains("serches"), "{message}"),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn searches_weekly_feeds_the_weekly_variant() {
        let fx = fixture(&[
            (
                "configs/legacy.yaml",
                "destination: { chat_id: \"1\" }\nprompts:\n  daily: prompts/d.md\n  weekly: prompts/w.md\nsearches: [\"daily q\"]\nsearches_weekly: [\"weekly q1\", \"weekly q2\"]\n",
            ),
            ("prompts/d.md", "x"),
            ("prompts/w.md", "y"),
        ]);
        let registry = load(&fx);

        let weekly = registry.resolve("legacy", &RunType::weekly()).unwrap();
        assert_eq!(weekly.variant.queries, vec!["weekly q1", "weekly q2"]);
        let daily = registry.resolve("legacy", &RunType::daily()).unwrap();
        assert_eq!(daily.variant.queries, vec!["daily q"]);
    }
}
