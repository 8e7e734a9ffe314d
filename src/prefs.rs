use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// Persisted user settings, kept between sessions in a small sectioned
/// key-value file in the user's home directory.
///
/// Loading is best-effort: a missing or unreadable file yields empty
/// preferences and malformed lines are skipped, so a damaged file never
/// blocks startup.
#[derive(Debug, Default)]
pub struct UserPreferences {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl UserPreferences {
    /// `~/.case_iterator.cfg`, or a file in the working directory when no
    /// home directory is known.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".case_iterator.cfg")
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("No preferences at {}: {err}", path.display());
                return UserPreferences::default();
            }
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Self {
        let mut prefs = UserPreferences::default();
        let mut section = String::from("general");
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = header.trim().to_string();
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) => {
                    prefs.set(&section, key.trim(), value.trim());
                }
                None => warn!("Skipping malformed preference line: {line}"),
            }
        }
        prefs
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut out = String::new();
        for (section, entries) in &self.sections {
            out.push_str(&format!("[{section}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key}: {value}\n"));
            }
            out.push('\n');
        }
        fs::write(path.as_ref(), out)
    }
}
