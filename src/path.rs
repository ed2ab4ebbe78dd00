//! ログファイルパスの分解

use std::{
    env, fs,
    path::{self, Path, PathBuf},
};

use crate::error::{Error, Result};

/// ファイル名の接頭語が無い場合に使う名前
pub const DEFAULT_BASE: &str = "out";

/// 拡張子が無い場合に使う拡張子
pub const DEFAULT_EXTENSION: &str = ".log";

/// ログファイルパスを、ディレクトリ、接頭語、拡張子に分解したもの。
///
/// ローテーションで作成するファイルは、すべて`{directory}/{base}{infix}{extension}`
/// となる。`infix`は日次ローテーションでは日時、サイズローテーションではスロット番号。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParts {
    directory: PathBuf,
    base: String,
    extension: String,
}

impl PathParts {
    /// パスを分解して、ディレクトリが存在しなければ作成する。
    ///
    /// 相対パスは、実行ファイルのディレクトリを基準にする。
    ///
    /// # 引数
    ///
    /// * path: ログファイルのパス。
    ///
    /// # 戻り値
    ///
    /// `PathParts`インスタンス。
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy();
        let (directory, base, extension) = split(&path);

        let directory = Path::new(directory);
        let directory = if directory.is_absolute() {
            directory.to_path_buf()
        } else {
            executable_dir()?.join(directory)
        };
        fs::create_dir_all(&directory).map_err(|source| Error::CreateDir {
            path: directory.clone(),
            source,
        })?;

        Ok(Self {
            directory,
            base: base.to_string(),
            extension: extension.to_string(),
        })
    }

    /// `infix`を接頭語と拡張子の間に挟んだファイルパスを返却する。
    pub fn file_path(&self, infix: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}{}", self.base, infix, self.extension))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

/// パス文字列をディレクトリ、接頭語、拡張子に分解する。
///
/// ディレクトリは末尾の区切り文字を含む。接頭語と拡張子には既定値を適用する。
fn split(path: &str) -> (&str, &str, &str) {
    let (directory, name) = match path.rfind(path::is_separator) {
        Some(index) => (&path[..=index], &path[index + 1..]),
        None => ("", path),
    };
    // 先頭の"."は隠しファイルの名前の一部
    let (base, extension) = match name.rfind('.') {
        Some(index) if index > 0 => (&name[..index], &name[index..]),
        _ => (name, ""),
    };

    let base = if base.is_empty() { DEFAULT_BASE } else { base };
    // "." だけの拡張子は空とみなす
    let extension = if extension.len() <= 1 {
        DEFAULT_EXTENSION
    } else {
        extension
    };

    (directory, base, extension)
}

fn executable_dir() -> Result<PathBuf> {
    let exe = env::current_exe().map_err(Error::CurrentExe)?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("logs/out.log"), ("logs/", "out", ".log"));
        assert_eq!(split("/var/log/app.txt"), ("/var/log/", "app", ".txt"));
        assert_eq!(split("app"), ("", "app", ".log"));
        assert_eq!(split("logs/app."), ("logs/", "app", ".log"));
        assert_eq!(split("logs/.hidden"), ("logs/", ".hidden", ".log"));
        assert_eq!(split("logs/.hidden.txt"), ("logs/", ".hidden", ".txt"));
        assert_eq!(split("logs/.log"), ("logs/", ".log", ".log"));
        assert_eq!(split("logs/"), ("logs/", "out", ".log"));
        assert_eq!(split(""), ("", "out", ".log"));
    }

    #[test]
    fn test_split_dot_in_directory() {
        assert_eq!(split("a.b/app"), ("a.b/", "app", ".log"));
        assert_eq!(split("a.b/app.tar.gz"), ("a.b/", "app.tar", ".gz"));
    }

    #[test]
    fn test_resolve_creates_directory() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("nested/deeper/app.log");

        let parts = PathParts::resolve(&target).unwrap();

        assert!(temp.path().join("nested/deeper").is_dir());
        assert_eq!(parts.base(), "app");
        assert_eq!(parts.extension(), ".log");
        assert_eq!(
            parts.file_path("3"),
            temp.path().join("nested/deeper/app3.log")
        );
    }

    #[test]
    fn test_resolve_relative_uses_executable_dir() {
        let parts = PathParts::resolve("relative.log").unwrap();
        let exe = env::current_exe().unwrap();

        assert_eq!(parts.directory(), exe.parent().unwrap());
        assert_eq!(parts.base(), "relative");
    }
}
