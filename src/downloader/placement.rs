// 输出文件放置：重名避让、跨设备移动、临时文件清理

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::DownloadError;

/// 为目标路径找一个不存在的文件名
///
/// `movie.mp4` 已存在时依次尝试 `movie(1).mp4`、`movie(2).mp4` ……
pub fn available_path(destination: &Path) -> PathBuf {
    if !destination.exists() {
        return destination.to_path_buf();
    }

    let dir = destination.parent().unwrap_or_else(|| Path::new(""));
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = destination
        .extension()
        .map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|i| {
            let name = match &extension {
                Some(ext) => format!("{}({}).{}", stem, i, ext),
                None => format!("{}({})", stem, i),
            };
            dir.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| destination.to_path_buf())
}

/// 把文件移动到目标位置（自动避让重名），返回最终路径
pub async fn place_file(source: &Path, destination: &Path) -> Result<PathBuf, DownloadError> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::storage("创建目标目录失败", e))?;
        }
    }

    let target = available_path(destination);
    if target != destination {
        debug!("目标文件已存在，改名为: {:?}", target);
    }

    move_file(source, &target)
        .await
        .map_err(|e| DownloadError::storage("移动合并文件失败", e))?;
    Ok(target)
}

/// 重命名失败（例如跨文件系统）时退化为复制 + 删除
async fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!("重命名失败，改用复制: {:?} -> {:?}, 原因: {}", source, target, rename_err);
            tokio::fs::copy(source, target).await?;
            tokio::fs::remove_file(source).await
        }
    }
}

/// 尽力删除文件，失败只记日志
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已清理临时文件: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("清理临时文件失败: {:?}, 错误: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_available_path_appends_counter() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("movie.mp4");
        assert_eq!(available_path(&dest), dest);

        std::fs::write(&dest, b"a").unwrap();
        std::fs::write(temp.path().join("movie(1).mp4"), b"b").unwrap();
        assert_eq!(available_path(&dest), temp.path().join("movie(2).mp4"));
    }

    #[test]
    fn test_available_path_without_extension() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("README");
        std::fs::write(&dest, b"a").unwrap();
        assert_eq!(available_path(&dest), temp.path().join("README(1)"));
    }

    #[tokio::test]
    async fn test_place_file_never_overwrites() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out/movie.mp4");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let source = temp.path().join("movie_m.tmp");
        std::fs::write(&source, b"new").unwrap();

        let placed = place_file(&source, &dest).await.unwrap();
        assert_eq!(placed, temp.path().join("out/movie(1).mp4"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        assert_eq!(std::fs::read(&placed).unwrap(), b"new");
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_remove_quietly_ignores_missing() {
        let temp = TempDir::new().unwrap();
        remove_quietly(&temp.path().join("nothing.tmp")).await;
    }
}
