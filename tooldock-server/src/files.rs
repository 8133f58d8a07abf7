// Copyright 2025 Tooldock (https://github.com/tooldock)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Legacy per-call file handling: spooled multipart uploads and
//! short-id output refs.
//!
//! Output refs are not persistent; the in-memory map dies with the
//! process. The durable store in `filestore` is the first-class surface,
//! but schema-driven output wrapping routes through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("file ref not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A reference to a registered output file.
#[derive(Debug, Clone, Serialize)]
pub struct FileRef {
    #[serde(rename = "ref")]
    pub ref_id: String,
    pub url: String,
    pub path: String,
    pub size: u64,
    pub media_type: String,
    pub created_at: u64,
}

/// Handles upload spooling and output registration.
pub struct OutputManager {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    refs: RwLock<HashMap<String, FileRef>>,
}

impl OutputManager {
    pub fn new(upload_dir: PathBuf, output_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&upload_dir)?;
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            upload_dir,
            output_dir,
            refs: RwLock::new(HashMap::new()),
        })
    }

    /// Spool an uploaded part to a temporary path, preserving the
    /// original extension.
    pub fn save_upload(&self, original_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let ext = extension_of(original_name);
        let filename = format!("{}{ext}", uuid::Uuid::new_v4());
        let path = self.upload_dir.join(filename);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Register an output file: copy it into the outputs directory under
    /// a short random identifier and return the serving ref.
    pub fn register_output(&self, source: &Path) -> Result<FileRef, OutputError> {
        let meta = std::fs::metadata(source)?;

        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let ref_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let filename = format!("{ref_id}{ext}");
        let dest = self.output_dir.join(&filename);

        if let Err(e) = std::fs::copy(source, &dest) {
            let _ = std::fs::remove_file(&dest);
            return Err(e.into());
        }

        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let file_ref = FileRef {
            ref_id: ref_id.clone(),
            url: format!("/v1/files/{filename}"),
            path: dest.display().to_string(),
            size: meta.len(),
            media_type: media_type_for(&ext).to_string(),
            created_at,
        };

        self.refs.write().insert(ref_id, file_ref.clone());
        Ok(file_ref)
    }

    pub fn get_output(&self, ref_id: &str) -> Option<FileRef> {
        self.refs.read().get(ref_id).cloned()
    }

    /// Resolve a served filename inside the outputs directory. Rejects
    /// anything that would escape it.
    pub fn output_path(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty() || filename.contains('/') || filename.contains("..") {
            return None;
        }
        Some(self.output_dir.join(filename))
    }

    pub fn list_outputs(&self) -> Vec<FileRef> {
        self.refs.read().values().cloned().collect()
    }

    pub fn delete_output(&self, ref_id: &str) -> Result<(), OutputError> {
        let mut refs = self.refs.write();
        let file_ref = refs
            .get(ref_id)
            .ok_or_else(|| OutputError::NotFound(ref_id.to_string()))?;

        match std::fs::remove_file(&file_ref.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        refs.remove(ref_id);
        Ok(())
    }

    /// Remove a spooled upload. Paths outside the upload directory are
    /// left alone.
    pub fn cleanup(&self, path: &Path) {
        if path.parent() == Some(self.upload_dir.as_path()) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn cleanup_all(&self, paths: &[PathBuf]) {
        for path in paths {
            self.cleanup(path);
        }
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Media type from a file extension (with leading dot).
pub fn media_type_for(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" => "text/html",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
