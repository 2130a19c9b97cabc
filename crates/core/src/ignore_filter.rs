use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use ignore::Match;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

pub const GITIGNORE_FILE: &str = ".gitignore";
pub const LETIGNORE_SUFFIX: &str = ".letignore";

/// Relative paths of every regular file under `root` that no ignore file excludes.
///
/// Rules come from `<root>/.gitignore` and from the project override file (see
/// [`letignore_paths`]). A path is dropped only when a rule set answers "ignore" for it;
/// no match, a whitelist match, or a rule file that fails to parse all keep the file.
pub fn compute_included_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let meta = std::fs::metadata(root).map_err(|e| Error::filesystem(root, e))?;
    if !meta.is_dir() {
        return Err(Error::filesystem(
            root,
            std::io::Error::other("upload root is not a directory"),
        ));
    }

    let candidates = list_files(root)?;
    let rule_sets = load_rule_sets(root);

    let included: BTreeSet<PathBuf> = candidates
        .into_iter()
        .filter(|rel| !rule_sets.iter().any(|rules| is_ignored(rules, rel)))
        .collect();

    debug!(
        event = "ignore.filter",
        root = %root.display(),
        rule_sets = rule_sets.len(),
        included = included.len(),
        "ignore.filter"
    );
    Ok(included)
}

fn list_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut out = BTreeSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        let is_file =
            file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::InvalidConfig {
                message: format!("path escaped upload root: {}", entry.path().display()),
            })?;
        out.insert(rel.to_path_buf());
    }
    Ok(out)
}

/// Locations checked for the project override file: `<root>/.letignore`, and the
/// sibling `<root>.letignore` when `root` names a directory (e.g. `dist.letignore`).
pub fn letignore_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = vec![root.join(LETIGNORE_SUFFIX)];
    if root.file_name().is_some() {
        let mut sibling = OsString::from(root.as_os_str());
        sibling.push(LETIGNORE_SUFFIX);
        let sibling = PathBuf::from(sibling);
        if !paths.contains(&sibling) {
            paths.push(sibling);
        }
    }
    paths
}

fn load_rule_sets(root: &Path) -> Vec<Gitignore> {
    std::iter::once(root.join(GITIGNORE_FILE))
        .chain(letignore_paths(root))
        .filter(|p| p.is_file())
        .filter_map(|p| load_rules(root, &p))
        .collect()
}

fn load_rules(root: &Path, file: &Path) -> Option<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    if let Some(err) = builder.add(file) {
        // Unparseable lines are skipped; the remaining rules still apply.
        warn!(
            event = "ignore.rules_partial",
            file = %file.display(),
            error = %err,
            "ignore.rules_partial"
        );
    }
    match builder.build() {
        Ok(rules) => Some(rules),
        Err(e) => {
            warn!(
                event = "ignore.rules_unusable",
                file = %file.display(),
                error = %e,
                "ignore.rules_unusable"
            );
            None
        }
    }
}

fn is_ignored(rules: &Gitignore, rel: &Path) -> bool {
    match rules.matched_path_or_any_parents(rel, false) {
        Match::Ignore(_) => true,
        Match::None | Match::Whitelist(_) => false,
    }
}
