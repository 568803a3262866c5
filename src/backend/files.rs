//! Artifact path helpers: category directories, artifact filenames, and the
//! URL-safe image ids used in `/api/images/{id}/...` serving URLs.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Local};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Prefix shared by all serving URLs.
pub const IMAGE_URL_PREFIX: &str = "/api/images/";

const INVALID_DIR_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turns a free-form category into a single safe directory name.
///
/// Reserved characters become `_`, surrounding whitespace and dots are
/// stripped, and an empty result falls back to `default`.
pub fn safe_dir_name(name: &str) -> String {
    let value = name.trim();
    if value.is_empty() {
        return "default".to_string();
    }
    let cleaned: String = value
        .chars()
        .map(|c| if INVALID_DIR_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Encodes a path relative to the output root as an unpadded URL-safe id.
pub fn encode_image_id(rel_path: &str) -> String {
    let normalized = rel_path.trim_start_matches('/').replace('\\', "/");
    URL_SAFE_NO_PAD.encode(normalized.as_bytes())
}

/// Decodes an image id back to a relative path.
///
/// Returns `None` for malformed ids and for paths that climb out of the
/// output root.
pub fn decode_image_id(image_id: &str) -> Option<String> {
    let value = image_id.trim().trim_end_matches('=');
    if value.is_empty() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(value.as_bytes()).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    let decoded = decoded.trim_start_matches('/').replace('\\', "/");
    if decoded.is_empty() || decoded.starts_with("../") || decoded.contains("/../") {
        return None;
    }
    Some(decoded)
}

/// Extracts the id segment from `/api/images/{id}/raw` or `/api/images/{id}/thumb`.
pub fn image_id_from_url(url: &str) -> Option<&str> {
    let rest = url.strip_prefix(IMAGE_URL_PREFIX)?;
    let (id, tail) = rest.split_once('/')?;
    if id.is_empty() || !(tail == "raw" || tail == "thumb") {
        return None;
    }
    Some(id)
}

/// Serving URLs for an artifact: `(thumb, raw)`.
pub fn image_urls(image_id: &str) -> (String, String) {
    (
        format!("{}{}/thumb", IMAGE_URL_PREFIX, image_id),
        format!("{}{}/raw", IMAGE_URL_PREFIX, image_id),
    )
}

/// Joins `rel_path` onto `base`, refusing any result outside `base`.
///
/// The check is lexical so it works for files that do not exist yet.
pub fn safe_join(base: &Path, rel_path: &str) -> Option<PathBuf> {
    let base = std::path::absolute(base).ok()?;
    let rel = rel_path.trim_start_matches('/').replace('\\', "/");
    let mut target = base.clone();
    for component in Path::new(&rel).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if target == base || !target.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    target.starts_with(&base).then_some(target)
}

/// Path of `path` relative to `root`, with `/` separators.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let root = std::path::absolute(root).ok()?;
    let path = std::path::absolute(path).ok()?;
    let rel = path.strip_prefix(&root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Picks a file extension from the response content type, then the URL path.
pub fn guess_extension(url: &str, content_type: Option<&str>) -> String {
    if let Some(ct) = content_type {
        let mime = ct.split(';').next().unwrap_or_default().trim();
        let ext = match mime {
            "image/png" => Some(".png"),
            "image/jpeg" | "image/jpg" => Some(".jpg"),
            "image/webp" => Some(".webp"),
            "image/gif" => Some(".gif"),
            "image/bmp" => Some(".bmp"),
            "video/mp4" => Some(".mp4"),
            _ => None,
        };
        if let Some(ext) = ext {
            return ext.to_string();
        }
    }

    let path = url.split('?').next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    if let Some(idx) = file.rfind('.') {
        let ext = &file[idx..];
        if ext.len() > 1 && ext.len() <= 5 {
            return ext.to_string();
        }
    }
    ".bin".to_string()
}

/// Per-artifact tag: the task index plus six random hex digits.
pub fn artifact_tag(index: usize) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}{}", index, &nonce[..6])
}

/// Builds `{prefix}_{YYYYmmddHHMMSS}_{millis:03}_{tag}[_{resolution}]{ext}`.
///
/// The tag keeps tasks finishing in the same millisecond apart.
pub fn artifact_filename(
    prefix: &str,
    at: DateTime<Local>,
    tag: &str,
    resolution: &str,
    ext: &str,
) -> String {
    let res_suffix = if resolution.is_empty() {
        String::new()
    } else {
        format!("_{}", resolution)
    };
    format!(
        "{}_{}_{:03}_{}{}{}",
        prefix,
        at.format("%Y%m%d%H%M%S"),
        at.timestamp_subsec_millis() % 1000,
        tag,
        res_suffix,
        ext
    )
}

/// Ensures `output_dir/<safe category>` exists and returns it.
pub async fn ensure_category_dir(output_dir: &Path, category: &str) -> std::io::Result<PathBuf> {
    let base = std::path::absolute(output_dir)?;
    let dir = base.join(safe_dir_name(category));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_safe_dir_name() {
        assert_eq!(safe_dir_name("  "), "default");
        assert_eq!(safe_dir_name("a/b:c"), "a_b_c");
        assert_eq!(safe_dir_name("..hidden.."), "hidden");
        assert_eq!(safe_dir_name("..."), "default");
        assert_eq!(safe_dir_name("风景"), "风景");
    }

    #[test]
    fn test_image_id_decodes_back() {
        let id = encode_image_id("landscape/wan_20250101120000_001.png");
        assert!(!id.contains('='));
        assert_eq!(
            decode_image_id(&id).as_deref(),
            Some("landscape/wan_20250101120000_001.png")
        );
    }

    #[test]
    fn test_decode_rejects_traversal() {
        let id = URL_SAFE_NO_PAD.encode(b"../etc/passwd");
        assert!(decode_image_id(&id).is_none());
        let id = URL_SAFE_NO_PAD.encode(b"a/../../x");
        assert!(decode_image_id(&id).is_none());
        assert!(decode_image_id("").is_none());
        assert!(decode_image_id("!!!").is_none());
    }

    #[test]
    fn test_image_id_from_url() {
        assert_eq!(image_id_from_url("/api/images/abc/raw"), Some("abc"));
        assert_eq!(image_id_from_url("/api/images/abc/thumb"), Some("abc"));
        assert_eq!(image_id_from_url("/api/images/abc/other"), None);
        assert_eq!(image_id_from_url("https://cdn/x.png"), None);
    }

    #[test]
    fn test_safe_join_contains_paths() {
        let base = Path::new("/srv/outputs");
        assert_eq!(
            safe_join(base, "cat/a.png"),
            Some(PathBuf::from("/srv/outputs/cat/a.png"))
        );
        assert_eq!(
            safe_join(base, "cat/../b.png"),
            Some(PathBuf::from("/srv/outputs/b.png"))
        );
        assert!(safe_join(base, "../x.png").is_none());
        assert!(safe_join(base, "cat/../../x.png").is_none());
    }

    #[test]
    fn test_relative_to() {
        let rel = relative_to(Path::new("/srv/out"), Path::new("/srv/out/cat/a.png"));
        assert_eq!(rel.as_deref(), Some("cat/a.png"));
        assert!(relative_to(Path::new("/srv/out"), Path::new("/tmp/a.png")).is_none());
    }

    #[test]
    fn test_guess_extension() {
        assert_eq!(guess_extension("https://x/y.png", Some("image/jpeg; q=1")), ".jpg");
        assert_eq!(guess_extension("https://x/y.webp?sig=1", None), ".webp");
        assert_eq!(guess_extension("https://x/y", None), ".bin");
        assert_eq!(guess_extension("https://x/y.toolong", None), ".bin");
    }

    #[test]
    fn test_artifact_filename() {
        let at = Local
            .with_ymd_and_hms(2025, 3, 4, 5, 6, 7)
            .single()
            .expect("valid local time")
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            artifact_filename("wan", at, "0a1b2c3", "1K", ".png"),
            "wan_20250304050607_042_0a1b2c3_1K.png"
        );
        assert_eq!(
            artifact_filename("z_image", at, "1ffffff", "", ".png"),
            "z_image_20250304050607_042_1ffffff.png"
        );
    }

    #[test]
    fn test_same_millisecond_names_differ() {
        let at = Local::now();
        let names: std::collections::HashSet<String> = (0..4)
            .flat_map(|index| [artifact_tag(index), artifact_tag(index)])
            .map(|tag| artifact_filename("wan", at, &tag, "1K", ".png"))
            .collect();
        assert_eq!(names.len(), 8);
        assert!(artifact_tag(3).starts_with('3'));
        assert_eq!(artifact_tag(12).len(), 8);
    }
}
