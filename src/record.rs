//! ログレコードと属性

use std::{
    borrow::Cow,
    error::Error as StdError,
    fmt::{self, Debug, Display},
    panic::Location,
    sync::Arc,
};

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

/// ログレベル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    /// 出力に使うレベル名
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// ログを出力したソースコードの位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl Source {
    pub fn new(file: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl From<&'static Location<'static>> for Source {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

/// テキスト化の失敗
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// 任意の値を属性値にするためのトレイト。
///
/// 書式化では、`marshal_text`、`as_bytes`の順に試し、どちらも`None`なら
/// `Debug`表現を使う。
pub trait RawValue: Debug + Send + Sync {
    /// 値のテキスト表現
    fn marshal_text(&self) -> Option<Result<String, BoxError>> {
        None
    }

    /// 値をバイト列として扱える場合、そのバイト列
    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }
}

impl RawValue for Vec<u8> {
    fn as_bytes(&self) -> Option<&[u8]> {
        Some(self)
    }
}

impl RawValue for Source {
    fn marshal_text(&self) -> Option<Result<String, BoxError>> {
        Some(Ok(format!("{}:{}", self.file, self.line)))
    }
}

/// 書式化の直前まで評価を遅らせる値
pub trait LogValuer: Send + Sync {
    fn log_value(&self) -> Value;
}

impl<F> LogValuer for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn log_value(&self) -> Value {
        self()
    }
}

/// `LogValuer`を解決する最大回数
const MAX_RESOLVE_STEPS: usize = 100;

/// 属性値
#[derive(Clone)]
pub enum Value {
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Duration(Duration),
    Time(OffsetDateTime),
    /// 子の属性の並び。空のグループは出力されない。
    Group(Arc<[Attr]>),
    Any(Arc<dyn RawValue>),
    Lazy(Arc<dyn LogValuer>),
}

impl Value {
    /// グループ値を作成する。子のうち、空のグループは取り除く。
    pub fn group(attrs: impl IntoIterator<Item = Attr>) -> Self {
        Self::Group(
            attrs
                .into_iter()
                .filter(|attr| !attr.value.is_empty_group())
                .collect(),
        )
    }

    pub fn any(value: impl RawValue + 'static) -> Self {
        Self::Any(Arc::new(value))
    }

    pub fn lazy(value: impl LogValuer + 'static) -> Self {
        Self::Lazy(Arc::new(value))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// 子を持たないグループかどうか。
    ///
    /// グループは作成後に変更されないため、子を再帰的に調べる必要はない。
    pub fn is_empty_group(&self) -> bool {
        matches!(self, Self::Group(attrs) if attrs.is_empty())
    }

    /// `Lazy`を具体的な値になるまで評価する。
    ///
    /// 評価が終わらない場合は、エラーを表す文字列値を返却する。
    pub fn resolve(self) -> Value {
        let mut value = self;
        for _ in 0..MAX_RESOLVE_STEPS {
            match value {
                Self::Lazy(lazy) => value = lazy.log_value(),
                resolved => return resolved,
            }
        }
        match value {
            Self::Lazy(_) => Self::String(format!(
                "!ERROR:LogValuer did not resolve after {MAX_RESOLVE_STEPS} steps"
            )),
            resolved => resolved,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => Debug::fmt(v, f),
            Self::Int(v) => Debug::fmt(v, f),
            Self::Uint(v) => Debug::fmt(v, f),
            Self::Float(v) => Debug::fmt(v, f),
            Self::Bool(v) => Debug::fmt(v, f),
            Self::Duration(v) => Debug::fmt(v, f),
            Self::Time(v) => Debug::fmt(v, f),
            Self::Group(attrs) => f.debug_list().entries(attrs.iter()).finish(),
            Self::Any(v) => Debug::fmt(v, f),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Self::Duration(v)
    }
}

impl From<std::time::Duration> for Value {
    fn from(v: std::time::Duration) -> Self {
        Self::Duration(Duration::try_from(v).unwrap_or(Duration::MAX))
    }
}

impl From<OffsetDateTime> for Value {
    fn from(v: OffsetDateTime) -> Self {
        Self::Time(v)
    }
}

macro_rules! impl_from_int {
    ($variant:ident, $target:ty: $($source:ty),*) => {
        $(
            impl From<$source> for Value {
                fn from(v: $source) -> Self {
                    Self::$variant(<$target>::from(v))
                }
            }
        )*
    };
}

impl_from_int!(Int, i64: i8, i16, i32, i64);
impl_from_int!(Uint, u64: u8, u16, u32, u64);

impl From<isize> for Value {
    fn from(v: isize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Uint(v as u64)
    }
}

/// キーと値の組
#[derive(Debug, Clone)]
pub struct Attr {
    pub key: String,
    pub value: Value,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// グループ属性を作成する。キーが空の場合、子は親の名前空間に展開される。
    pub fn group(key: impl Into<String>, attrs: impl IntoIterator<Item = Attr>) -> Self {
        Self {
            key: key.into(),
            value: Value::group(attrs),
        }
    }

    pub fn any(key: impl Into<String>, value: impl RawValue + 'static) -> Self {
        Self {
            key: key.into(),
            value: Value::any(value),
        }
    }

    pub fn lazy(key: impl Into<String>, value: impl LogValuer + 'static) -> Self {
        Self {
            key: key.into(),
            value: Value::lazy(value),
        }
    }
}

/// 1件のログ
#[derive(Debug, Clone)]
pub struct Record {
    /// 時刻。`None`なら出力しない。
    pub time: Option<OffsetDateTime>,
    pub level: Level,
    pub message: String,
    pub source: Option<Source>,
    pub attrs: Vec<Attr>,
}

impl Record {
    /// 現在時刻と呼び出し元の位置を持つレコードを作成する。
    #[track_caller]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            time: Some(OffsetDateTime::now_utc()),
            level,
            message: message.into(),
            source: Some(Location::caller().into()),
            attrs: Vec::new(),
        }
    }

    pub fn with_time(mut self, time: Option<OffsetDateTime>) -> Self {
        self.time = time;
        self
    }

    pub fn with_attr(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn add_attrs(&mut self, attrs: impl IntoIterator<Item = Attr>) {
        self.attrs.extend(attrs);
    }
}
