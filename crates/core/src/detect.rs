use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{DEFAULT_STATIC_DIR, LetConfig};

pub const UNKNOWN_TYPE: &str = "unknown";

/// Project types deployed by uploading a directory of built files.
pub const STATIC_TYPES: &[&str] = &[
    "static",
    "react",
    "vue",
    "angular",
    "hexo",
    "hugo",
    "docusaurus",
    "vuepress",
];

/// `package.json` dependency markers, checked in this order.
const NODE_MARKERS: &[(&str, &str)] = &[
    ("@surgio/gateway", "surgio"),
    ("express", "express"),
    ("@docusaurus", "docusaurus"),
    ("next", "next"),
    ("vuepress", "vuepress"),
    ("react", "react"),
    ("@nuxt", "nuxt"),
    ("vue", "vue"),
    ("@angular", "angular"),
    ("hexo", "hexo"),
];

const GO_MARKERS: &[(&str, &str)] = &[
    ("github.com/gin-gonic/gin", "gin"),
    ("github.com/go-martini/martini", "martini"),
];

const PYTHON_MARKERS: &[(&str, &str)] = &[("flask", "flask"), ("fastapi", "fastapi")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub project_type: String,
    /// Output dir of a static project, relative to the project dir.
    pub static_dir: Option<String>,
}

impl Detection {
    fn of(project_type: &str) -> Self {
        Self {
            project_type: project_type.to_string(),
            static_dir: default_static_dir(project_type).map(str::to_string),
        }
    }

    pub fn is_static(&self) -> bool {
        is_static_type(&self.project_type)
    }

    pub fn is_unknown(&self) -> bool {
        self.project_type == UNKNOWN_TYPE
    }

    /// Detection as a config layer; an unknown project contributes nothing.
    pub fn as_config(&self) -> LetConfig {
        if self.is_unknown() {
            return LetConfig::default();
        }
        LetConfig {
            name: String::new(),
            project_type: self.project_type.clone(),
            static_dir: self.static_dir.clone().unwrap_or_default(),
        }
    }
}

pub fn is_static_type(project_type: &str) -> bool {
    STATIC_TYPES.contains(&project_type)
}

pub fn default_static_dir(project_type: &str) -> Option<&'static str> {
    match project_type {
        "static" => Some(DEFAULT_STATIC_DIR),
        "react" | "docusaurus" => Some("build"),
        "vue" | "angular" => Some("dist"),
        "hexo" | "hugo" => Some("public"),
        "vuepress" => Some("docs/.vuepress/dist"),
        _ => None,
    }
}

/// Guesses the project type from well-known files in `dir`.
///
/// Unreadable or malformed manifests are logged and skipped; detection never fails.
pub fn detect_project_type(dir: &Path) -> Detection {
    let detected = detect_rust(dir)
        .or_else(|| detect_go(dir))
        .or_else(|| detect_node(dir))
        .or_else(|| detect_python(dir))
        .or_else(|| dir.join("index.html").is_file().then_some("static"))
        .or_else(|| {
            (dir.join("config.toml").is_file() && dir.join("themes").is_dir()).then_some("hugo")
        })
        .unwrap_or(UNKNOWN_TYPE);

    debug!(
        event = "detect.finish",
        dir = %dir.display(),
        project_type = detected,
        "detect.finish"
    );
    Detection::of(detected)
}

fn read_manifest(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(
                event = "detect.read_failed",
                path = %path.display(),
                error = %e,
                "detect.read_failed"
            );
            None
        }
    }
}

fn detect_rust(dir: &Path) -> Option<&'static str> {
    let path = dir.join("Cargo.toml");
    let text = read_manifest(&path)?;
    let manifest: toml::Value = match toml::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!(event = "detect.parse_failed", path = %path.display(), error = %e, "detect.parse_failed");
            return None;
        }
    };
    manifest
        .get("dependencies")
        .and_then(|deps| deps.get("rocket"))
        .map(|_| "rocket")
}

/// Any `go.mod` makes a Go project; known frameworks refine the type.
fn detect_go(dir: &Path) -> Option<&'static str> {
    let text = read_manifest(&dir.join("go.mod"))?;
    let required = go_requirements(&text);
    let framework = GO_MARKERS
        .iter()
        .find(|(module, _)| required.contains(*module))
        .map(|(_, project_type)| *project_type);
    Some(framework.unwrap_or("go"))
}

fn go_requirements(go_mod: &str) -> BTreeSet<&str> {
    let mut out = BTreeSet::new();
    let mut in_block = false;
    for line in go_mod.lines() {
        let line = line.split("//").next().unwrap_or_default().trim();
        if in_block {
            if line == ")" {
                in_block = false;
            } else if let Some(module) = line.split_whitespace().next() {
                out.insert(module);
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("require") {
            let rest = rest.trim();
            if rest == "(" {
                in_block = true;
            } else if let Some(module) = rest.split_whitespace().next() {
                out.insert(module);
            }
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dependencies: std::collections::BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: std::collections::BTreeMap<String, serde_json::Value>,
}

fn detect_node(dir: &Path) -> Option<&'static str> {
    let path = dir.join("package.json");
    let text = read_manifest(&path)?;
    let package: PackageJson = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!(event = "detect.parse_failed", path = %path.display(), error = %e, "detect.parse_failed");
            return None;
        }
    };
    let names: Vec<&str> = package
        .dependencies
        .keys()
        .chain(package.dev_dependencies.keys())
        .map(String::as_str)
        .collect();
    NODE_MARKERS
        .iter()
        .find(|(marker, _)| names.iter().any(|name| name.contains(marker)))
        .map(|(_, project_type)| *project_type)
}

fn detect_python(dir: &Path) -> Option<&'static str> {
    ["requirements.txt", "Pipfile"].iter().find_map(|file| {
        let text = read_manifest(&dir.join(file))?.to_lowercase();
        PYTHON_MARKERS
            .iter()
            .find(|(marker, _)| text.contains(marker))
            .map(|(_, project_type)| *project_type)
    })
}
