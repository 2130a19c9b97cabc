use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::control_plane::DEFAULT_API_URL;
use crate::{Error, Result};

pub const CONFIG_DIR_ENV: &str = "LETS_CONFIG_DIR";
pub const API_URL_ENV: &str = "LETS_API_URL";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const PROJECTS_FILE: &str = "projects.json";
pub const PROJECT_CONFIG_FILE: &str = "let.json";

pub const DEFAULT_PROJECT_TYPE: &str = "static";
pub const DEFAULT_STATIC_DIR: &str = "./";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl Credentials {
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

/// Project settings as stored in `let.json` and sent along with a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LetConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub project_type: String,
    #[serde(rename = "static", default, skip_serializing_if = "String::is_empty")]
    pub static_dir: String,
}

/// Values given on the command line; each one wins over every other source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub name: Option<String>,
    pub project_type: Option<String>,
    pub static_dir: Option<String>,
}

pub fn resolve_config_dir(flag: Option<&Path>) -> Result<PathBuf> {
    resolve_config_dir_from(
        flag,
        std::env::var(CONFIG_DIR_ENV).ok().as_deref(),
        std::env::var("HOME").ok().as_deref(),
    )
}

fn resolve_config_dir_from(
    flag: Option<&Path>,
    env_dir: Option<&str>,
    home: Option<&str>,
) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = env_dir.filter(|v| !v.trim().is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    match home.filter(|v| !v.trim().is_empty()) {
        Some(home) => Ok(Path::new(home).join(".let")),
        None => Err(Error::InvalidConfig {
            message: format!("cannot locate config dir: set HOME or {CONFIG_DIR_ENV}"),
        }),
    }
}

pub fn api_url() -> String {
    api_url_from(std::env::var(API_URL_ENV).ok().as_deref())
}

fn api_url_from(env_url: Option<&str>) -> String {
    env_url
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_API_URL)
        .to_string()
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIALS_FILE)
}

/// Creates the config dir and its JSON files (as `{}`) when missing.
pub fn bootstrap_config_dir(config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir).map_err(|e| Error::filesystem(config_dir, e))?;

    let credentials = credentials_path(config_dir);
    if !credentials.exists() {
        write_atomic_private(&credentials, b"{}")
            .map_err(|e| Error::filesystem(&credentials, e))?;
    }
    let projects = config_dir.join(PROJECTS_FILE);
    if !projects.exists() {
        std::fs::write(&projects, b"{}").map_err(|e| Error::filesystem(&projects, e))?;
    }
    Ok(())
}

pub fn load_credentials(config_dir: &Path) -> Result<Credentials> {
    bootstrap_config_dir(config_dir)?;
    let path = credentials_path(config_dir);
    let text = std::fs::read_to_string(&path).map_err(|e| Error::filesystem(&path, e))?;
    if text.trim().is_empty() {
        return Ok(Credentials::default());
    }
    serde_json::from_str(&text).map_err(|e| Error::InvalidConfig {
        message: format!("credentials invalid: {e}"),
    })
}

pub fn save_token(config_dir: &Path, token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::InvalidConfig {
            message: "token must not be empty".to_string(),
        });
    }
    bootstrap_config_dir(config_dir)?;

    let credentials = Credentials {
        token: token.to_string(),
    };
    let text = serde_json::to_string_pretty(&credentials).map_err(|e| Error::InvalidConfig {
        message: format!("credentials encode failed: {e}"),
    })?;
    let path = credentials_path(config_dir);
    write_atomic_private(&path, text.as_bytes()).map_err(|e| Error::filesystem(&path, e))
}

/// Reads `let.json` from the project dir; `None` when the file does not exist.
pub fn load_project_config(project_dir: &Path) -> Result<Option<LetConfig>> {
    let path = project_dir.join(PROJECT_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|e| Error::filesystem(&path, e))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| Error::InvalidConfig {
            message: format!("{PROJECT_CONFIG_FILE} invalid: {e}"),
        })
}

/// Merges the project settings: command line > `let.json` > detected > defaults.
///
/// `dir_name` is the default project name. A `--static` dir given without an
/// explicit type makes the project static.
pub fn merge_project_config(
    dir_name: &str,
    detected: Option<&LetConfig>,
    file: Option<&LetConfig>,
    overrides: &ConfigOverrides,
) -> LetConfig {
    let mut merged = LetConfig {
        name: dir_name.to_string(),
        project_type: DEFAULT_PROJECT_TYPE.to_string(),
        static_dir: String::new(),
    };
    for layer in [detected, file].into_iter().flatten() {
        overlay(&mut merged.name, &layer.name);
        overlay(&mut merged.project_type, &layer.project_type);
        overlay(&mut merged.static_dir, &layer.static_dir);
    }

    if let Some(name) = &overrides.name {
        overlay(&mut merged.name, name);
    }
    if let Some(static_dir) = &overrides.static_dir {
        overlay(&mut merged.static_dir, static_dir);
        if !static_dir.trim().is_empty() {
            merged.project_type = DEFAULT_PROJECT_TYPE.to_string();
        }
    }
    if let Some(project_type) = &overrides.project_type {
        overlay(&mut merged.project_type, project_type);
    }
    if merged.project_type == DEFAULT_PROJECT_TYPE && merged.static_dir.is_empty() {
        merged.static_dir = DEFAULT_STATIC_DIR.to_string();
    }
    merged
}

fn overlay(slot: &mut String, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        *slot = value.to_string();
    }
}

/// Writes through a `0600` temp file and renames it into place.
fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, project_type: &str, static_dir: &str) -> LetConfig {
        LetConfig {
            name: name.to_string(),
            project_type: project_type.to_string(),
            static_dir: static_dir.to_string(),
        }
    }

    #[test]
    fn config_dir_precedence_is_flag_then_env_then_home() {
        let flag = PathBuf::from("/tmp/flag");
        assert_eq!(
            resolve_config_dir_from(Some(&flag), Some("/tmp/env"), Some("/home/u")).unwrap(),
            flag
        );
        assert_eq!(
            resolve_config_dir_from(None, Some("/tmp/env"), Some("/home/u")).unwrap(),
            PathBuf::from("/tmp/env")
        );
        assert_eq!(
            resolve_config_dir_from(None, None, Some("/home/u")).unwrap(),
            PathBuf::from("/home/u/.let")
        );
        assert!(matches!(
            resolve_config_dir_from(None, Some(" "), None),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn api_url_defaults_when_env_is_blank() {
        assert_eq!(api_url_from(None), DEFAULT_API_URL);
        assert_eq!(api_url_from(Some("  ")), DEFAULT_API_URL);
        assert_eq!(api_url_from(Some("http://127.0.0.1:9/q")), "http://127.0.0.1:9/q");
    }

    #[test]
    fn credentials_are_bootstrapped_and_saved() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("cfg");

        let creds = load_credentials(&dir).unwrap();
        assert!(!creds.has_token());
        assert_eq!(std::fs::read_to_string(dir.join(PROJECTS_FILE)).unwrap(), "{}");

        save_token(&dir, " tok-1 \n").unwrap();
        assert_eq!(load_credentials(&dir).unwrap().token, "tok-1");
        assert!(save_token(&dir, "   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn credentials_file_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("cfg");
        let path = dir.join(CREDENTIALS_FILE);

        bootstrap_config_dir(&dir).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "bootstrap mode {mode:o}");

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        save_token(&dir, "secret-token").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600, "saved mode {mode:o}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn unreadable_config_files_are_filesystem_errors() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join(PROJECT_CONFIG_FILE)).unwrap();
        match load_project_config(temp.path()) {
            Err(Error::Filesystem { path, .. }) => {
                assert_eq!(path, temp.path().join(PROJECT_CONFIG_FILE))
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let err = bootstrap_config_dir(&blocker.join("cfg")).unwrap_err();
        assert!(err.is_filesystem(), "{err:?}");
    }

    #[test]
    fn let_json_uses_short_field_names() {
        let parsed: LetConfig =
            serde_json::from_str(r#"{"name":"blog","type":"hexo","static":"public"}"#).unwrap();
        assert_eq!(parsed, cfg("blog", "hexo", "public"));

        let encoded = serde_json::to_string(&cfg("api", "gin", "")).unwrap();
        assert_eq!(encoded, r#"{"name":"api","type":"gin"}"#);
    }

    #[test]
    fn missing_let_json_is_none_and_broken_one_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(load_project_config(temp.path()).unwrap(), None);

        std::fs::write(temp.path().join(PROJECT_CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(
            load_project_config(temp.path()),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn merge_order_is_flags_then_file_then_detected_then_defaults() {
        let none = ConfigOverrides::default();
        assert_eq!(
            merge_project_config("site", None, None, &none),
            cfg("site", "static", "./")
        );

        let detected = cfg("", "react", "build");
        let file = cfg("my-site", "", "");
        assert_eq!(
            merge_project_config("site", Some(&detected), Some(&file), &none),
            cfg("my-site", "react", "build")
        );

        let flags = ConfigOverrides {
            name: Some("other".to_string()),
            project_type: Some("express".to_string()),
            static_dir: None,
        };
        assert_eq!(
            merge_project_config("site", Some(&detected), Some(&file), &flags),
            cfg("other", "express", "build")
        );
    }

    #[test]
    fn static_flag_makes_project_static() {
        let detected = cfg("", "gin", "");
        let flags = ConfigOverrides {
            static_dir: Some("dist".to_string()),
            ..ConfigOverrides::default()
        };
        assert_eq!(
            merge_project_config("svc", Some(&detected), None, &flags),
            cfg("svc", "static", "dist")
        );
    }
}
