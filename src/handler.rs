//! レコードをテキストに書式化してライターに書き込むハンドラー

use std::{
    fmt::{self, Debug},
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    appenders::RotatingWriter,
    encoder::{HandleState, ATTR_SEP},
    pool,
    record::{Attr, Level, Record},
};

/// 属性の書き換えフック。開いているグループ名の並びと属性を受け取り、出力する属性を返す。
///
/// キーが空の属性を返すと、その属性は出力されない。
pub type ReplaceAttr = Arc<dyn Fn(&[String], Attr) -> Attr + Send + Sync>;

/// ハンドラーの設定
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// 出力する最小のレベル
    pub level: Level,
    /// `TRACE`と`ERROR`のレコードにソース位置を付けるかどうか
    pub add_source: bool,
    pub replace_attr: Option<ReplaceAttr>,
}

impl Debug for HandlerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("level", &self.level)
            .field("add_source", &self.add_source)
            .field("replace_attr", &self.replace_attr.as_ref().map(|_| ".."))
            .finish()
    }
}

/// ログのフロントエンドが呼び出すハンドラーの機能
pub trait Handler: Send + Sync {
    /// `level`のレコードを出力するかどうか
    fn enabled(&self, level: Level) -> bool;

    /// レコードを1行として書き込む。
    fn handle(&self, record: &Record) -> io::Result<()>;

    /// すべてのレコードに`attrs`を付けるハンドラーを返す。
    fn with_attrs(&self, attrs: &[Attr]) -> Self
    where
        Self: Sized;

    /// 以降の属性を`name`のグループに入れるハンドラーを返す。
    fn with_group(&self, name: &str) -> Self
    where
        Self: Sized;
}

/// `key=value`形式のテキストハンドラー。
///
/// 派生したハンドラーはすべて同じライターとロックを共有する。
/// 事前書式化した属性とグループは、それぞれのハンドラーが個別に持つ。
pub struct TextHandler<W> {
    opts: Arc<HandlerOptions>,
    preformatted: Vec<u8>,
    /// 事前書式化で開かれたグループの接頭語（末尾は`.`）
    group_prefix: String,
    /// `with_group`で開かれたすべてのグループ
    groups: Vec<String>,
    /// `groups`のうち、`preformatted`で開かれている数
    open_groups: usize,
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for TextHandler<W> {
    fn clone(&self) -> Self {
        Self {
            opts: Arc::clone(&self.opts),
            preformatted: self.preformatted.clone(),
            group_prefix: self.group_prefix.clone(),
            groups: self.groups.clone(),
            open_groups: self.open_groups,
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W> Debug for TextHandler<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextHandler")
            .field("opts", &self.opts)
            .field("preformatted", &String::from_utf8_lossy(&self.preformatted))
            .field("groups", &self.groups)
            .field("open_groups", &self.open_groups)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send> TextHandler<W> {
    pub fn new(writer: W, opts: HandlerOptions) -> Self {
        Self::with_shared_writer(Arc::new(Mutex::new(writer)), opts)
    }

    pub fn with_shared_writer(writer: Arc<Mutex<W>>, opts: HandlerOptions) -> Self {
        Self {
            opts: Arc::new(opts),
            preformatted: Vec::new(),
            group_prefix: String::new(),
            groups: Vec::new(),
            open_groups: 0,
            writer,
        }
    }

    pub fn writer(&self) -> &Arc<Mutex<W>> {
        &self.writer
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.opts
    }
}

impl TextHandler<RotatingWriter> {
    /// 共有しているライターのファイルを閉じる。
    pub fn close(&self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close()
    }
}

impl<W: Write + Send> Handler for TextHandler<W> {
    fn enabled(&self, level: Level) -> bool {
        level >= self.opts.level
    }

    fn handle(&self, record: &Record) -> io::Result<()> {
        let mut buf = pool::BUFFERS.get();
        HandleState::new(&self.opts, &self.groups, self.open_groups, &mut buf, "").append_record(
            record,
            &self.preformatted,
            &self.group_prefix,
        );

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&buf)
    }

    fn with_attrs(&self, attrs: &[Attr]) -> Self {
        // 空のグループは出力されないので、それしか無ければ何もしない
        if attrs.iter().all(|attr| attr.value.is_empty_group()) {
            return self.clone();
        }

        let mut derived = self.clone();
        let mut preformatted = std::mem::take(&mut derived.preformatted);
        let sep = if preformatted.is_empty() { "" } else { ATTR_SEP };
        let group_prefix = {
            let mut state = HandleState::new(
                &derived.opts,
                &derived.groups,
                derived.open_groups,
                &mut preformatted,
                sep,
            );
            state.push_prefix(&self.group_prefix);
            state.open_pending_groups();
            for attr in attrs {
                state.append_attr(attr);
            }
            state.prefix().to_string()
        };

        derived.preformatted = preformatted;
        derived.group_prefix = group_prefix;
        // 事前書式化に含まれたグループは、レコードの書式化で開き直さない
        derived.open_groups = derived.groups.len();
        derived
    }

    fn with_group(&self, name: &str) -> Self {
        let mut derived = self.clone();
        if !name.is_empty() {
            derived.groups.push(name.to_string());
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use time::macros::datetime;

    use super::*;

    fn handler(opts: HandlerOptions) -> TextHandler<Vec<u8>> {
        TextHandler::new(Vec::new(), opts)
    }

    fn output(handler: &TextHandler<Vec<u8>>) -> String {
        String::from_utf8(handler.writer().lock().unwrap().clone()).unwrap()
    }

    fn record(level: Level, message: &str) -> Record {
        Record::new(level, message).with_time(None)
    }

    #[test]
    fn test_enabled() {
        let h = handler(HandlerOptions {
            level: Level::Warn,
            ..HandlerOptions::default()
        });
        assert!(!h.enabled(Level::Info));
        assert!(h.enabled(Level::Warn));
        assert!(h.enabled(Level::Error));
    }

    #[test]
    fn test_line_layout() {
        let h = handler(HandlerOptions::default());
        let r = Record::new(Level::Info, "started")
            .with_time(Some(datetime!(2024-06-01 12:30:45.678901 UTC)))
            .with_attr(Attr::new("port", 8080));
        h.handle(&r).unwrap();
        assert_eq!(output(&h), "2024-06-01T12:30:45.678 INFO started port=8080\n");
    }

    #[test]
    fn test_zero_time_and_no_attrs() {
        let h = handler(HandlerOptions::default());
        h.handle(&record(Level::Warn, "")).unwrap();
        assert_eq!(output(&h), "WARN \"\"\n");
    }

    #[test]
    fn test_group_example() {
        let h = handler(HandlerOptions::default());
        let r = record(Level::Info, "hi there").with_attr(Attr::group(
            "req",
            [
                Attr::new("count", 3),
                Attr::new("id", "abc"),
                Attr::group("meta", []),
            ],
        ));
        h.handle(&r).unwrap();
        assert_eq!(output(&h), "INFO \"hi there\" req.count=3 req.id=abc\n");
    }

    #[test]
    fn test_with_group_then_attrs() {
        let root = handler(HandlerOptions::default());
        let h = root.with_group("req").with_attrs(&[Attr::new("count", 3)]);
        let r = record(Level::Info, "hi there")
            .with_attr(Attr::new("id", "abc"))
            .with_attr(Attr::group("meta", []));
        h.handle(&r).unwrap();
        assert_eq!(output(&h), "INFO \"hi there\" req.count=3 req.id=abc\n");
    }

    #[test]
    fn test_chained_derivations() {
        let root = handler(HandlerOptions::default());
        let h = root
            .with_attrs(&[Attr::new("a", 1)])
            .with_group("g")
            .with_attrs(&[Attr::new("b", 2)])
            .with_group("h");
        h.handle(&record(Level::Info, "m").with_attr(Attr::new("c", 3)))
            .unwrap();
        h.handle(&record(Level::Info, "n")).unwrap();
        assert_eq!(output(&h), "INFO m a=1 g.b=2 g.h.c=3\nINFO n a=1 g.b=2\n");
    }

    #[test]
    fn test_derivation_leaves_parent_unchanged() {
        let root = handler(HandlerOptions::default());
        let parent = root.with_attrs(&[Attr::new("p", 1)]);
        let _child = parent.with_group("g").with_attrs(&[Attr::new("c", 2)]);
        let _sibling = parent.with_attrs(&[Attr::new("s", 3)]);

        parent.handle(&record(Level::Info, "x")).unwrap();
        root.handle(&record(Level::Info, "y")).unwrap();
        assert_eq!(output(&root), "INFO x p=1\nINFO y\n");
    }

    #[test]
    fn test_with_attrs_only_empty_groups_is_noop() {
        let root = handler(HandlerOptions::default()).with_group("g");
        let same = root.with_attrs(&[Attr::group("e", []), Attr::group("f", [])]);
        assert_eq!(same.preformatted, root.preformatted);
        assert_eq!(same.open_groups, 0);
        assert_eq!(same.groups, ["g"]);
    }

    #[test]
    fn test_group_without_record_attrs_is_omitted() {
        let h = handler(HandlerOptions::default()).with_group("g");
        h.handle(&record(Level::Info, "none")).unwrap();
        assert_eq!(output(&h), "INFO none\n");
    }

    #[test]
    fn test_empty_group_name_is_ignored() {
        let h = handler(HandlerOptions::default()).with_group("");
        h.handle(&record(Level::Info, "m").with_attr(Attr::new("k", "v")))
            .unwrap();
        assert_eq!(output(&h), "INFO m k=v\n");
    }

    #[test]
    fn test_source_only_for_trace_and_error() {
        let h = handler(HandlerOptions {
            level: Level::Trace,
            add_source: true,
            ..HandlerOptions::default()
        });
        let mut r = record(Level::Error, "bad");
        r.source = Some(crate::record::Source::new("src/main.rs", 42));
        h.handle(&r).unwrap();
        r.level = Level::Info;
        h.handle(&r).unwrap();
        r.level = Level::Trace;
        h.handle(&r).unwrap();
        assert_eq!(
            output(&h),
            "ERROR source=src/main.rs:42 bad\nINFO bad\nTRACE source=src/main.rs:42 bad\n"
        );
    }

    #[test]
    fn test_replace_attr_sees_handler_groups() {
        let h = handler(HandlerOptions {
            replace_attr: Some(Arc::new(|groups: &[String], attr: Attr| {
                Attr::new(attr.key, groups.join("/"))
            })),
            ..HandlerOptions::default()
        });
        let h = h
            .with_group("a")
            .with_attrs(&[Attr::new("x", 0)])
            .with_group("b");
        h.handle(&record(Level::Info, "m").with_attr(Attr::new("y", 0)))
            .unwrap();
        assert_eq!(output(&h), "INFO m a.x=a a.b.y=a/b\n");
    }

    #[test]
    fn test_preformatted_prefix_is_stable() {
        let h = handler(HandlerOptions::default())
            .with_group("svc")
            .with_attrs(&[Attr::new("name", "api"), Attr::new("pid", 7)]);
        for i in 0..1000 {
            h.handle(&record(Level::Info, "tick").with_attr(Attr::new("i", i)))
                .unwrap();
        }
        let out = output(&h);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 1000);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("INFO tick svc.name=api svc.pid=7 svc.i={i}"));
        }
    }

    #[test]
    fn test_concurrent_handles_do_not_interleave() {
        let root = handler(HandlerOptions::default());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let h = root.with_attrs(&[Attr::new("thread", t)]);
                thread::spawn(move || {
                    for n in 0..200 {
                        h.handle(&record(Level::Info, "hello").with_attr(Attr::new("n", n)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let out = output(&root);
        let pattern = regex::Regex::new(r"^INFO hello thread=\d n=\d+$").unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 8 * 200);
        assert!(lines.iter().all(|line| pattern.is_match(line)));
    }
}
