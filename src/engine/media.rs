// Keywatch Engine — Media Store
//
// Writes matched messages' media to a persistent directory tree, one
// subdirectory per group. The engine treats media bytes as a pass-through
// concern: the upstream downloads, this module writes, nothing else holds
// the bytes.

use crate::atoms::error::EngineResult;
use crate::engine::upstream::MediaBuffer;
use log::debug;
use std::path::{Path, PathBuf};

pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: &Path) -> Self {
        MediaStore { root: root.to_path_buf() }
    }

    /// Persist one attachment. The extension is derived from the mime type;
    /// unknown types fall back to `.bin`.
    pub fn write_media(
        &self,
        message_id: i64,
        group_id: i64,
        media_index: usize,
        buffer: &MediaBuffer,
    ) -> EngineResult<PathBuf> {
        let dir = self.root.join(group_id.to_string());
        std::fs::create_dir_all(&dir)?;

        let ext = extension_for_mime(&buffer.mime);
        let path = dir.join(format!("{}-{}.{}", message_id, media_index, ext));
        std::fs::write(&path, &buffer.bytes)?;
        debug!(
            "[media] Wrote {} bytes ({}) to {:?}",
            buffer.bytes.len(),
            buffer.mime,
            path
        );
        Ok(path)
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_into_per_group_directory() {
        let dir = std::env::temp_dir().join(format!("keywatch-media-test-{}", std::process::id()));
        let store = MediaStore::new(&dir);
        let buffer = MediaBuffer {
            bytes: vec![0xFF, 0xD8, 0xFF],
            mime: "image/jpeg".into(),
            width: Some(100),
            height: Some(100),
        };
        let path = store.write_media(42, 100, 0, &buffer).unwrap();
        assert!(path.ends_with("100/42-0.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_mime_gets_bin_extension() {
        assert_eq!(extension_for_mime("application/x-unknown"), "bin");
        assert_eq!(extension_for_mime("image/png"), "png");
    }
}
