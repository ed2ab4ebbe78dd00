//! エラー型

use std::{io, path::PathBuf};

use thiserror::Error;

/// このクレートの結果型
pub type Result<T> = std::result::Result<T, Error>;

/// ライターの作成や設定の読み込みで発生するエラー
#[derive(Debug, Error)]
pub enum Error {
    /// ログディレクトリを作成できなかった
    #[error("failed to create log directory '{}': {source}", path.display())]
    CreateDir {
        /// ディレクトリのパス
        path: PathBuf,
        /// 原因
        #[source]
        source: io::Error,
    },

    /// ログファイルを開けなかった
    #[error("failed to open log file '{}': {source}", path.display())]
    Open {
        /// ファイルのパス
        path: PathBuf,
        /// 原因
        #[source]
        source: io::Error,
    },

    /// 再利用するスロットのファイルを削除できなかった
    #[error("failed to remove log file '{}': {source}", path.display())]
    Remove {
        /// ファイルのパス
        path: PathBuf,
        /// 原因
        #[source]
        source: io::Error,
    },

    /// ファイルサイズを取得できなかった
    #[error("failed to stat log file '{}': {source}", path.display())]
    Stat {
        /// ファイルのパス
        path: PathBuf,
        /// 原因
        #[source]
        source: io::Error,
    },

    /// 相対パスの基準となる実行ファイルの場所がわからない
    #[error("failed to locate the running executable: {0}")]
    CurrentExe(#[source] io::Error),

    /// 日次ローテーションの時刻が範囲外
    #[error("invalid daily cutover {hour}:{minute}")]
    InvalidCutover {
        /// 時
        hour: u8,
        /// 分
        minute: u8,
    },

    /// ファイル名の日時書式を解釈できない
    #[error("invalid time format '{format}': {message}")]
    InvalidTimeFormat {
        /// 書式
        format: String,
        /// 解析エラーの内容
        message: String,
    },

    /// ファイル名の日時を書式化できなかった
    #[error("failed to format the log file time: {0}")]
    FormatTime(#[source] time::error::Format),

    /// 設定を解析できなかった
    #[error("failed to parse log config: {0}")]
    Config(#[from] toml::de::Error),
}
