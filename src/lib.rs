//! Rolling Text Appender
//!
//! ----------------------------------------------------------------------------
//!
//! このクレートには、ログを1行の`key=value`形式のテキストに書式化する`TextHandler`と、
//! そのテキストをローテーションしながらファイルに書き込む`RotatingWriter`が含まれている。
//!
//! `RotatingWriter`は、以下いずれかの条件で、ログの記録を新しいファイルに切り替える。
//!
//! - 毎日、指定した時刻を過ぎたとき
//! - ファイルに指定されたサイズのログを出力したとき
//!
//! サイズで切り替える場合、`RotatingWriter`は指定された数のファイルを順番に使い回す。
//! 使い回すとき、最も古いファイルを削除してから新しいファイルを作成する。
//!
//! `TextHandler`は、`with_attrs`や`with_group`で属性やグループを付けたハンドラーを派生できる。
//! 派生したハンドラーは、元のハンドラーと同じライターに書き込む。
//!
//! ```no_run
//! use rolling_text_appender::{default_size_handler, Attr, Handler, Level, Record};
//!
//! let handler = default_size_handler("logs/app.log", 1024 * 1024, 5)?;
//! let handler = handler.with_group("req").with_attrs(&[Attr::new("id", "abc")]);
//! handler.handle(&Record::new(Level::Info, "accepted").with_attr(Attr::new("status", 200)))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod appenders;
pub mod config;
mod encoder;
pub mod error;
pub mod handler;
pub mod layer;
pub mod path;
mod pool;
pub mod record;

pub use appenders::{Clock, Rotation, RotatingWriter, RotatingWriterBuilder, SystemClock};
pub use config::{default_daily_handler, default_size_handler, LogConfig, RotationConfig};
pub use encoder::{needs_quoting, quote, SOURCE_KEY};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerOptions, ReplaceAttr, TextHandler};
pub use layer::TextLayer;
pub use record::{Attr, Level, LogValuer, RawValue, Record, Source, Value};
