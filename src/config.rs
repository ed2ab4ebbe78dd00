//! ログ出力の設定
//!
//! ```toml
//! path = "logs/app.log"
//! level = "debug"
//! add_source = true
//!
//! [rotation]
//! policy = "size"
//! max_bytes = 1048576
//! max_slots = 5
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::{
    appenders::{
        Rotation, RotatingWriter, DEFAULT_MAX_BYTES, DEFAULT_MAX_SLOTS, DEFAULT_TIME_FORMAT,
    },
    error::Result,
    handler::{HandlerOptions, TextHandler},
    record::Level,
};

/// ログファイルの既定のパス
pub const DEFAULT_PATH: &str = "logs/out.log";

/// ローテーションの設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RotationConfig {
    Daily {
        #[serde(default)]
        hour: u8,
        #[serde(default)]
        minute: u8,
        #[serde(default = "default_time_format")]
        time_format: String,
    },
    Size {
        #[serde(default = "default_max_bytes")]
        max_bytes: u64,
        #[serde(default = "default_max_slots")]
        max_slots: usize,
    },
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self::Daily {
            hour: 0,
            minute: 0,
            time_format: default_time_format(),
        }
    }
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_max_slots() -> usize {
    DEFAULT_MAX_SLOTS
}

/// ログ出力の設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// ログファイルのパス。相対パスは実行ファイルのディレクトリが基準。
    pub path: String,
    pub level: Level,
    pub add_source: bool,
    /// 共有参照からの書き込みを内部でロックするかどうか
    pub locking: bool,
    pub rotation: RotationConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            level: Level::Info,
            add_source: false,
            locking: true,
            rotation: RotationConfig::default(),
        }
    }
}

impl LogConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// ライターを開く。
    pub fn open_writer(&self) -> Result<RotatingWriter> {
        let builder = match &self.rotation {
            RotationConfig::Daily {
                hour,
                minute,
                time_format,
            } => RotatingWriter::builder(
                &self.path,
                Rotation::Daily {
                    hour: *hour,
                    minute: *minute,
                },
            )
            .time_format(time_format.clone()),
            RotationConfig::Size {
                max_bytes,
                max_slots,
            } => RotatingWriter::builder(
                &self.path,
                Rotation::Size {
                    max_bytes: *max_bytes,
                    max_slots: *max_slots,
                },
            ),
        };
        builder.locking(self.locking).build()
    }

    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            level: self.level,
            add_source: self.add_source,
            replace_attr: None,
        }
    }

    /// ライターを開いて、ルートのハンドラーを作成する。
    pub fn build(&self) -> Result<TextHandler<RotatingWriter>> {
        Ok(TextHandler::new(self.open_writer()?, self.handler_options()))
    }
}

fn default_handler_options() -> HandlerOptions {
    HandlerOptions {
        level: Level::Debug,
        add_source: true,
        replace_attr: None,
    }
}

/// 毎日`hour`時`minute`分にファイルを切り替える、既定の設定のハンドラーを作成する。
///
/// ライターは内部でロックしない。書き込みはハンドラーのロックで直列化される。
pub fn default_daily_handler(
    path: impl AsRef<Path>,
    hour: u8,
    minute: u8,
) -> Result<TextHandler<RotatingWriter>> {
    let writer = RotatingWriter::daily(path, hour, minute, false)?;
    Ok(TextHandler::new(writer, default_handler_options()))
}

/// `max_bytes`ごとにファイルを切り替える、既定の設定のハンドラーを作成する。
pub fn default_size_handler(
    path: impl AsRef<Path>,
    max_bytes: u64,
    max_slots: usize,
) -> Result<TextHandler<RotatingWriter>> {
    let writer = RotatingWriter::size(path, max_bytes, max_slots, true)?;
    Ok(TextHandler::new(writer, default_handler_options()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        handler::Handler,
        record::{Attr, Record},
    };

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.path, "logs/out.log");
        assert_eq!(config.level, Level::Info);
        assert!(config.locking);
        assert_eq!(config.rotation, RotationConfig::default());
    }

    #[test]
    fn test_deserialize_empty() {
        let config = LogConfig::from_toml_str("").unwrap();
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn test_deserialize_size() {
        let config = LogConfig::from_toml_str(
            r#"
path = "/var/log/app.log"
level = "warn"
add_source = true

[rotation]
policy = "size"
max_bytes = 2048
"#,
        )
        .unwrap();
        assert_eq!(config.path, "/var/log/app.log");
        assert_eq!(config.level, Level::Warn);
        assert!(config.add_source);
        assert_eq!(
            config.rotation,
            RotationConfig::Size {
                max_bytes: 2048,
                max_slots: DEFAULT_MAX_SLOTS,
            }
        );
    }

    #[test]
    fn test_deserialize_daily() {
        let config = LogConfig::from_toml_str(
            r#"
locking = false

[rotation]
policy = "daily"
hour = 3
minute = 15
"#,
        )
        .unwrap();
        assert!(!config.locking);
        assert_eq!(
            config.rotation,
            RotationConfig::Daily {
                hour: 3,
                minute: 15,
                time_format: DEFAULT_TIME_FORMAT.to_string(),
            }
        );
    }

    #[test]
    fn test_deserialize_invalid() {
        assert!(LogConfig::from_toml_str("level = \"loud\"").is_err());
        assert!(LogConfig::from_toml_str("[rotation]\npolicy = \"weekly\"").is_err());
    }

    #[test]
    fn test_build_handler() {
        let temp = tempfile::tempdir().unwrap();
        let config = LogConfig {
            path: temp.path().join("cfg.log").to_string_lossy().into_owned(),
            level: Level::Debug,
            rotation: RotationConfig::Size {
                max_bytes: 4096,
                max_slots: 2,
            },
            ..LogConfig::default()
        };

        let handler = config.build().unwrap();
        assert!(handler.enabled(Level::Debug));
        assert!(!handler.enabled(Level::Trace));
        handler
            .handle(&Record::new(Level::Debug, "configured").with_attr(Attr::new("k", 1)))
            .unwrap();
        handler.close().unwrap();

        let content = fs::read_to_string(temp.path().join("cfg0.log")).unwrap();
        assert!(content.ends_with(" DEBUG configured k=1\n"), "{content}");
    }

    #[test]
    fn test_default_size_handler_adds_source_on_error() {
        let temp = tempfile::tempdir().unwrap();
        let handler = default_size_handler(temp.path().join("d.log"), 0, 0).unwrap();
        assert!(handler.enabled(Level::Debug));

        let record = Record::new(Level::Error, "failed");
        let line = record.source.as_ref().unwrap().line;
        handler.handle(&record).unwrap();

        let content = fs::read_to_string(temp.path().join("d0.log")).unwrap();
        assert!(
            content.contains(&format!("ERROR source=src/config.rs:{line} failed")),
            "{content}"
        );
    }

    #[test]
    fn test_default_daily_handler() {
        let temp = tempfile::tempdir().unwrap();
        let handler = default_daily_handler(temp.path().join("daily.log"), 0, 0).unwrap();
        assert!(!handler.writer().lock().unwrap().is_locking());
        handler.handle(&Record::new(Level::Info, "ok")).unwrap();

        let files: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let pattern = regex::Regex::new(r"^daily_\d{4}_\d{2}_\d{2}_\d{2}_\d{2}\.log$").unwrap();
        assert_eq!(files.len(), 1);
        assert!(pattern.is_match(&files[0]), "{files:?}");
    }
}
