//! Saving and loading tokens, for peers that exchange them as files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TunnelError;
use crate::timeout::{TimeoutError, run_with_timeout};

/// Conventional extension of an invite file.
pub const INVITE_EXTENSION: &str = "mc-tunnel-invite";

/// Writes `token` verbatim to `path`, creating or truncating the file.
pub async fn export_to_file(
    token: &str,
    path: impl AsRef<Path>,
    timeout: Duration,
) -> Result<(), TunnelError> {
    let path = path.as_ref().to_path_buf();
    let target = path.clone();
    let contents = token.as_bytes().to_vec();
    let result = run_with_timeout("export token", timeout, async move {
        tokio::fs::write(&target, contents).await
    })
    .await;
    map_file_result(result, &path)?;
    tracing::debug!(
        target = "mc_tunnel::token_file",
        path = %path.display(),
        bytes = token.len(),
        "token exported"
    );
    Ok(())
}

/// Reads the file at `path` back as a token string, unchanged.
pub async fn import_from_file(
    path: impl AsRef<Path>,
    timeout: Duration,
) -> Result<String, TunnelError> {
    let path = path.as_ref().to_path_buf();
    let source = path.clone();
    let result = run_with_timeout("import token", timeout, async move {
        let bytes = tokio::fs::read(&source).await?;
        String::from_utf8(bytes)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })
    .await;
    let token = map_file_result(result, &path)?;
    tracing::debug!(
        target = "mc_tunnel::token_file",
        path = %path.display(),
        bytes = token.len(),
        "token imported"
    );
    Ok(token)
}

/// `path` with the invite extension, unless it already has one.
pub fn invite_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(INVITE_EXTENSION)
    }
}

fn map_file_result<T>(
    result: Result<T, TimeoutError<std::io::Error>>,
    path: &Path,
) -> Result<T, TunnelError> {
    result.map_err(|err| match err {
        TimeoutError::Elapsed { operation, timeout } => TunnelError::IoTimeout { operation, timeout },
        TimeoutError::Failed(source) => TunnelError::File {
            path: path.to_path_buf(),
            source,
        },
        TimeoutError::Aborted { operation, reason } => TunnelError::File {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("{operation}: {reason}")),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::FILE_IO_TIMEOUT;

    #[tokio::test]
    async fn round_trip_preserves_token_exactly() {
        let dir = tempfile::tempdir().unwrap();
        for (name, token) in [
            ("plain", "eyJ0eXBlIjoib2ZmZXIiLCJzZHAiOiJ2PTAifQ=="),
            ("empty", ""),
            ("whitespace", "  token with spaces\n\n"),
            ("unicode", "jeton-\u{00e9}\u{4e16}\u{1f600}"),
        ] {
            let path = dir.path().join(name);
            export_to_file(token, &path, FILE_IO_TIMEOUT).await.unwrap();
            let back = import_from_file(&path, FILE_IO_TIMEOUT).await.unwrap();
            assert_eq!(back, token, "{name}");
        }
    }

    #[tokio::test]
    async fn export_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invite");
        export_to_file("a much longer first token", &path, FILE_IO_TIMEOUT)
            .await
            .unwrap();
        export_to_file("short", &path, FILE_IO_TIMEOUT).await.unwrap();
        assert_eq!(
            import_from_file(&path, FILE_IO_TIMEOUT).await.unwrap(),
            "short"
        );
    }

    #[tokio::test]
    async fn missing_file_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.mc-tunnel-invite");
        match import_from_file(&path, FILE_IO_TIMEOUT).await {
            Err(TunnelError::File { path: reported, source }) => {
                assert_eq!(reported, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            import_from_file(&path, FILE_IO_TIMEOUT).await,
            Err(TunnelError::File { .. })
        ));
    }

    #[tokio::test]
    async fn export_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("invite");
        assert!(matches!(
            export_to_file("token", &path, FILE_IO_TIMEOUT).await,
            Err(TunnelError::File { .. })
        ));
    }

    #[tokio::test]
    async fn expired_deadline_is_an_io_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invite");
        match export_to_file("token", &path, Duration::ZERO).await {
            Err(TunnelError::IoTimeout { operation, timeout }) => {
                assert_eq!(operation, "export token");
                assert_eq!(timeout, Duration::ZERO);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!path.exists());

        std::fs::write(&path, "token").unwrap();
        assert!(matches!(
            import_from_file(&path, Duration::ZERO).await,
            Err(TunnelError::IoTimeout { .. })
        ));
    }

    #[test]
    fn invite_path_adds_extension_only_when_missing() {
        assert_eq!(
            invite_path("friends"),
            PathBuf::from("friends.mc-tunnel-invite")
        );
        assert_eq!(invite_path("offer.txt"), PathBuf::from("offer.txt"));
    }
}
