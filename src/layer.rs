//! `tracing`のイベントをハンドラーに渡すレイヤー

use std::{cell::Cell, error::Error as StdError, fmt::Debug};

use time::OffsetDateTime;
use tracing::{
    field::{Field, Visit},
    Event, Metadata, Subscriber,
};
use tracing_subscriber::layer::{Context, Layer};

use crate::{
    handler::Handler,
    record::{Attr, Level, Record, Source},
};

thread_local! {
    /// このスレッドでイベントを処理中かどうか
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// `tracing`のイベントをレコードに変換して、ハンドラーで書き込むレイヤー。
///
/// イベントの`message`フィールドがメッセージ、その他のフィールドが属性になる。
/// 書き込み中に発生したイベント（ライター自身の記録など）は捨てる。
#[derive(Debug, Clone)]
pub struct TextLayer<H> {
    handler: H,
}

impl<H: Handler> TextLayer<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H, S> Layer<S> for TextLayer<H>
where
    H: Handler + 'static,
    S: Subscriber,
{
    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.handler.enabled(Level::from(*metadata.level()))
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(_guard) = DispatchGuard::enter() else {
            return;
        };

        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let record = Record {
            time: Some(OffsetDateTime::now_utc()),
            level: Level::from(*metadata.level()),
            message: visitor.message,
            source: metadata
                .file()
                .zip(metadata.line())
                .map(|(file, line)| Source::new(file, line)),
            attrs: visitor.attrs,
        };
        if let Err(err) = self.handler.handle(&record) {
            eprintln!("failed to write log record: {err}");
        }
    }
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Option<Self> {
        if DISPATCHING.with(|dispatching| dispatching.replace(true)) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|dispatching| dispatching.set(false));
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    attrs: Vec<Attr>,
}

impl RecordVisitor {
    fn push(&mut self, field: &Field, value: impl Into<crate::record::Value>) {
        self.attrs.push(Attr::new(field.name(), value));
    }
}

impl Visit for RecordVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push(field, value);
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn StdError + 'static)) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push(field, format!("{value:?}"));
        }
    }
}
