use crate::error::{AppError, AppResult};
use crate::models::user::VirtualFile;
use crate::store::FileStore;
use chrono::Utc;
use std::sync::Arc;

/// Virtual filesystem service. Paths are absolute, `/`-separated, and
/// namespaced per user by the store key; `..` and `.` resolve lexically.
pub struct VfsService {
    files: Arc<dyn FileStore>,
}

impl VfsService {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }

    /// Resolve `arg` against `current`: absolute stays, relative joins,
    /// `.`/`..` collapse.
    pub fn normalize(current: &str, arg: &str) -> String {
        let joined = if arg.starts_with('/') {
            arg.to_string()
        } else if arg.is_empty() {
            current.to_string()
        } else {
            format!("{current}/{arg}")
        };
        let mut parts: Vec<&str> = Vec::new();
        for seg in joined.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    /// Make sure `/`, `/home` and the user's home directory exist.
    pub async fn ensure_home(&self, username: &str) -> AppResult<()> {
        for path in ["/", "/home", &format!("/home/{username}")] {
            if self.files.read(username, path).await?.is_none() {
                self.files
                    .write(VirtualFile {
                        username: username.to_string(),
                        path: path.to_string(),
                        content: String::new(),
                        is_dir: true,
                        mod_time: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn read_file(&self, username: &str, path: &str) -> AppResult<VirtualFile> {
        match self.files.read(username, path).await? {
            Some(f) if !f.is_dir => Ok(f),
            Some(_) => Err(AppError::Validation {
                field: "path",
                message: format!("{path} is a directory"),
            }),
            None => Err(AppError::NotFound),
        }
    }

    pub async fn write_file(&self, username: &str, path: &str, content: &str) -> AppResult<()> {
        if path == "/" || path.ends_with('/') {
            return Err(AppError::Validation {
                field: "path",
                message: "not a file name".into(),
            });
        }
        self.files
            .write(VirtualFile {
                username: username.to_string(),
                path: path.to_string(),
                content: content.to_string(),
                is_dir: false,
                mod_time: Utc::now(),
            })
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, username: &str, path: &str) -> AppResult<()> {
        if self.files.read(username, path).await?.is_some() {
            return Err(AppError::Validation {
                field: "path",
                message: format!("{path} already exists"),
            });
        }
        self.files
            .write(VirtualFile {
                username: username.to_string(),
                path: path.to_string(),
                content: String::new(),
                is_dir: true,
                mod_time: Utc::now(),
            })
            .await?;
        Ok(())
    }

    pub async fn remove(&self, username: &str, path: &str) -> AppResult<()> {
        // Refuse to remove a non-empty directory
        if let Some(f) = self.files.read(username, path).await? {
            if f.is_dir && !self.files.list(username, path).await?.is_empty() {
                return Err(AppError::Validation {
                    field: "path",
                    message: format!("{path} is not empty"),
                });
            }
        }
        if !self.files.remove(username, path).await? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn is_dir(&self, username: &str, path: &str) -> AppResult<bool> {
        Ok(self
            .files
            .read(username, path)
            .await?
            .map(|f| f.is_dir)
            .unwrap_or(false))
    }

    pub async fn list(&self, username: &str, path: &str) -> AppResult<Vec<VirtualFile>> {
        if !self.is_dir(username, path).await? {
            return Err(AppError::NotFound);
        }
        self.files.list(username, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn normalize_resolves_dots_and_relatives() {
        assert_eq!(VfsService::normalize("/home/ada", "notes.txt"), "/home/ada/notes.txt");
        assert_eq!(VfsService::normalize("/home/ada", ".."), "/home");
        assert_eq!(VfsService::normalize("/home/ada", "../.."), "/");
        assert_eq!(VfsService::normalize("/home/ada", "/etc"), "/etc");
        assert_eq!(VfsService::normalize("/", "../../.."), "/");
        assert_eq!(VfsService::normalize("/home/ada", "./a/./b"), "/home/ada/a/b");
    }

    #[tokio::test]
    async fn home_round_trip() {
        let vfs = VfsService::new(Arc::new(MemoryStore::new()));
        vfs.ensure_home("ada").await.unwrap();
        assert!(vfs.is_dir("ada", "/home/ada").await.unwrap());
        vfs.write_file("ada", "/home/ada/a.txt", "hi").await.unwrap();
        assert_eq!(vfs.read_file("ada", "/home/ada/a.txt").await.unwrap().content, "hi");
        let ls = vfs.list("ada", "/home/ada").await.unwrap();
        assert_eq!(ls.len(), 1);
        vfs.remove("ada", "/home/ada/a.txt").await.unwrap();
        assert!(matches!(
            vfs.read_file("ada", "/home/ada/a.txt").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn refuses_to_remove_non_empty_dir() {
        let vfs = VfsService::new(Arc::new(MemoryStore::new()));
        vfs.ensure_home("ada").await.unwrap();
        vfs.mkdir("ada", "/home/ada/docs").await.unwrap();
        vfs.write_file("ada", "/home/ada/docs/x", "1").await.unwrap();
        assert!(vfs.remove("ada", "/home/ada/docs").await.is_err());
    }
}
