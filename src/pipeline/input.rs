//! Input loading: read a user-supplied path or URL into memory.
//!
//! Documents are stored as bytes, so unlike a file-path pipeline there is no
//! temp file to keep alive: a local file is read, a URL is downloaded, and
//! both are checked for the `%PDF` magic before anything else sees them.

use crate::error::ExtractError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The PDF header every accepted document must start with.
pub const PDF_MAGIC: &[u8] = b"%PDF";

/// A loaded input: display name plus raw bytes.
#[derive(Debug, Clone)]
pub struct LoadedInput {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Reject bytes that do not start with `%PDF`.
pub fn ensure_pdf(name: &str, bytes: &[u8]) -> Result<(), ExtractError> {
    if bytes.starts_with(PDF_MAGIC) {
        Ok(())
    } else {
        Err(ExtractError::NotAPdf {
            name: name.to_string(),
            magic: bytes.iter().take(PDF_MAGIC.len()).copied().collect(),
        })
    }
}

/// Load `input` from disk or over HTTP.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<LoadedInput, ExtractError> {
    if input.trim().is_empty() {
        return Err(ExtractError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<LoadedInput, ExtractError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ExtractError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ExtractError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    ensure_pdf(&name, &bytes)?;

    debug!("Loaded local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(LoadedInput { name, bytes })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedInput, ExtractError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| ExtractError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    let name = filename_from_url(url);
    ensure_pdf(&name, &bytes)?;

    info!("Downloaded {} ({} bytes)", name, bytes.len());
    Ok(LoadedInput {
        name,
        bytes: bytes.to_vec(),
    })
}

/// Last path segment of the URL when it looks like a file name.
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

/// Where a downloaded or imported PDF would be written back to, if needed.
pub fn default_export_path(name: &str, pages: &[usize]) -> PathBuf {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    match (pages.first(), pages.last()) {
        (Some(first), Some(last)) if first != last => {
            PathBuf::from(format!("{stem}_p{first}-{last}.pdf"))
        }
        (Some(first), _) => PathBuf::from(format!("{stem}_p{first}.pdf")),
        _ => PathBuf::from(format!("{stem}.pdf")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_comes_from_url_path() {
        assert_eq!(filename_from_url("https://x.org/a/manifest.pdf?q=1"), "manifest.pdf");
        assert_eq!(filename_from_url("https://x.org/download"), "downloaded.pdf");
        assert_eq!(filename_from_url("https://x.org/"), "downloaded.pdf");
    }

    #[test]
    fn export_path_names_the_page_span() {
        assert_eq!(default_export_path("m.pdf", &[2, 3, 4]), PathBuf::from("m_p2-4.pdf"));
        assert_eq!(default_export_path("m.pdf", &[5]), PathBuf::from("m_p5.pdf"));
    }

    #[tokio::test]
    async fn local_pdf_is_read() {
        let mut f = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        f.write_all(b"%PDF-1.7\n...").unwrap();
        let loaded = load_input(f.path().to_str().unwrap(), 5).await.unwrap();
        assert!(loaded.name.ends_with(".pdf"));
        assert!(loaded.bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn non_pdf_bytes_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let err = load_input(f.path().to_str().unwrap(), 5).await.unwrap_err();
        assert!(matches!(err, ExtractError::NotAPdf { ref magic, .. } if magic == b"hell"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = load_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn blank_input_is_invalid() {
        assert!(matches!(
            load_input("  ", 5).await,
            Err(ExtractError::InvalidInput { .. })
        ));
    }
}
