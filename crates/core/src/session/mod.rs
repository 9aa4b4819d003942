use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{PlayerError, Result};

const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "wav", "ogg", "flac"];

/// Files backing one playable session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAssets {
    pub session_id: String,
    pub audio_path: PathBuf,
    pub timeline_json: Vec<u8>,
}

/// Turns a session id into its audio track and motion timeline. Storage
/// layout belongs to the web layer; the player only asks for a session.
pub trait SessionSource: Send {
    fn resolve(&self, session_id: &str) -> Result<SessionAssets>;
}

/// Sessions stored as `<root>/<session_id>/{*.json, *.mp3|wav|ogg|flac}`.
#[derive(Debug, Clone)]
pub struct DirectorySessions {
    root: PathBuf,
}

impl DirectorySessions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let invalid = session_id.is_empty()
            || session_id == "."
            || session_id.contains("..")
            || session_id.contains(['/', '\\']);
        if invalid {
            return Err(PlayerError::SessionNotFound(session_id.to_string()));
        }
        let dir = self.root.join(session_id);
        if !dir.is_dir() {
            return Err(PlayerError::SessionNotFound(session_id.to_string()));
        }
        Ok(dir)
    }
}

impl SessionSource for DirectorySessions {
    fn resolve(&self, session_id: &str) -> Result<SessionAssets> {
        let dir = self.session_dir(session_id)?;

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let timeline_path = files
            .iter()
            .find(|path| has_extension(path, &["json"]))
            .ok_or_else(|| PlayerError::SessionNotFound(format!("{session_id}: no timeline (*.json)")))?;
        let audio_path = files
            .iter()
            .find(|path| has_extension(path, &AUDIO_EXTENSIONS))
            .ok_or_else(|| PlayerError::SessionNotFound(format!("{session_id}: no audio track")))?;

        tracing::debug!(
            session = session_id,
            timeline = %timeline_path.display(),
            audio = %audio_path.display(),
            "session resolved"
        );
        Ok(SessionAssets {
            session_id: session_id.to_string(),
            audio_path: audio_path.clone(),
            timeline_json: fs::read(timeline_path)?,
        })
    }
}

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| wanted.iter().any(|w| ext.eq_ignore_ascii_case(w)))
        .unwrap_or(false)
}
