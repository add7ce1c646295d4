use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use rust_embed::RustEmbed;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::engine::{split_statements, Connection};
use crate::error::MigrateError;

const HOOK_SUFFIX: &str = ".sql";

/// Default hooks shipped inside the binary, laid out as
/// `<version>/<stage>/<id>.sql`
#[derive(RustEmbed)]
#[folder = "hooks/"]
struct BundledHooks;

/// When a hook runs relative to the export/import boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, AsRefStr, EnumIter)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum HookStage {
    /// On the source, before the dump. Returned statements run right away.
    Export,
    /// On the source, before the dump. Returned statements are replayed on the target.
    Import,
    /// On the target after the rebuild. Returned statements are replayed on the target.
    Init,
}

impl HookStage {
    fn dir_name(&self) -> String {
        self.as_ref().to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    /// Lower case file name without extension
    pub id: String,
    pub stage: HookStage,
    pub text: String,
    /// Where the hook was loaded from, for logging
    pub origin: String,
}

impl Hook {
    /// Derives the id from a file name; None for files that aren't SQL hooks
    pub fn id_from_file_name(name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        lower
            .strip_suffix(HOOK_SUFFIX)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
    }

    /// Executes the hook's statements in order and collects the follow-up
    /// statements they select. `None` when a statement fails; what ran before
    /// it stays applied.
    fn run(&self, conn: &mut dyn Connection) -> Option<Vec<String>> {
        let mut commands = Vec::new();
        for statement in split_statements(&self.text) {
            match conn.execute(&statement) {
                Ok(outcome) => commands.extend(outcome.first_column()),
                Err(e) => {
                    warn!("{} hook {} ({}) failed: {}", self.stage, self.id, self.origin, e);
                    return None;
                }
            }
        }
        Some(commands)
    }
}

/// The hooks of one driver version, ordered by stage and id
#[derive(Debug, Clone, Default)]
pub struct HookSet {
    hooks: BTreeMap<(HookStage, String), Hook>,
}

impl HookSet {
    pub fn from_hooks(hooks: impl IntoIterator<Item = Hook>) -> Self {
        let mut set = HookSet::default();
        for hook in hooks {
            set.insert(hook);
        }
        set
    }

    fn insert(&mut self, hook: Hook) {
        if let Some(replaced) = self.hooks.insert((hook.stage, hook.id.clone()), hook) {
            debug!("Hook {} from {} was overridden", replaced.id, replaced.origin);
        }
    }

    /// Loads the hooks for `version`: bundled ones first, then those under
    /// `<dir>/<version>/`, which replace bundled hooks with the same id.
    pub fn load(version: &str, dir: Option<&Path>) -> Result<Self, MigrateError> {
        let mut set = HookSet::default();

        for stage in HookStage::iter() {
            let prefix = format!("{}/{}/", version, stage.dir_name());
            for name in BundledHooks::iter().filter(|n| n.starts_with(&prefix)) {
                let file_name = &name[prefix.len()..];
                let Some(id) = Hook::id_from_file_name(file_name) else {
                    continue;
                };
                if let Some(file) = BundledHooks::get(&name) {
                    set.insert(Hook {
                        id,
                        stage,
                        text: String::from_utf8_lossy(&file.data).into_owned(),
                        origin: format!("bundled:{name}"),
                    });
                }
            }
        }

        if let Some(dir) = dir {
            for stage in HookStage::iter() {
                let stage_dir = dir.join(version).join(stage.dir_name());
                if !stage_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&stage_dir)? {
                    let path = entry?.path();
                    let id = match path.file_name().and_then(|n| n.to_str()) {
                        Some(name) if path.is_file() => Hook::id_from_file_name(name),
                        _ => None,
                    };
                    if let Some(id) = id {
                        set.insert(Hook {
                            id,
                            stage,
                            text: fs::read_to_string(&path)?,
                            origin: path.display().to_string(),
                        });
                    }
                }
            }
        }

        if !set.hooks.is_empty() {
            info!("Loaded {} hooks for H2-{}", set.hooks.len(), version);
        }
        Ok(set)
    }

    pub fn stage(&self, stage: HookStage) -> impl Iterator<Item = &Hook> {
        self.hooks
            .range((stage, String::new())..)
            .take_while(move |((s, _), _)| *s == stage)
            .map(|(_, hook)| hook)
    }

    pub fn has_stage(&self, stage: HookStage) -> bool {
        self.stage(stage).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook of `stage` in id order and returns the follow-up
    /// statements they emitted, in emission order.
    ///
    /// A hook may hold several statements; every row-producing one adds the
    /// first column of its rows to the follow-ups. EXPORT follow-ups are
    /// executed on `conn` right away and never buffered; if one fails, the
    /// rest of that hook's follow-ups are dropped. A failing hook is logged
    /// and skipped.
    pub fn run(&self, conn: &mut dyn Connection, stage: HookStage) -> Vec<String> {
        let mut buffer = Vec::new();

        for hook in self.stage(stage) {
            debug!("Running {} hook {}", stage, hook.id);
            let Some(commands) = hook.run(conn) else {
                continue;
            };

            match stage {
                HookStage::Export => {
                    for command in &commands {
                        if let Err(e) = conn.execute(command) {
                            warn!(
                                "Statement from {} hook {} failed, dropping the rest of its statements: {}",
                                stage, hook.id, e
                            );
                            break;
                        }
                    }
                }
                HookStage::Import | HookStage::Init => buffer.extend(commands),
            }
        }

        buffer
    }
}
