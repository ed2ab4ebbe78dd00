use std::{fs, sync::Arc, thread};

use regex::Regex;
use rolling_text_appender::{
    Attr, Handler, HandlerOptions, Level, Record, RotatingWriter, TextHandler,
};

#[test]
fn derived_handlers_share_one_rotating_file_set() {
    let temp = tempfile::tempdir().unwrap();
    let writer = RotatingWriter::size(temp.path().join("svc.log"), 4096, 3, false).unwrap();
    let root = TextHandler::new(
        writer,
        HandlerOptions {
            level: Level::Debug,
            ..HandlerOptions::default()
        },
    );

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let handler = root
                .with_group("worker")
                .with_attrs(&[Attr::new("id", worker)]);
            thread::spawn(move || {
                for n in 0..100 {
                    let record = Record::new(Level::Info, "tick")
                        .with_time(None)
                        .with_attr(Attr::new("n", n));
                    handler.handle(&record).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    root.close().unwrap();

    let line = Regex::new(r"^INFO tick worker\.id=\d worker\.n=\d+$").unwrap();
    let mut total = 0;
    for slot in 0..3 {
        let path = temp.path().join(format!("svc{slot}.log"));
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        assert!(content.len() < 4096 + 64, "{} is too large", path.display());
        for l in content.lines() {
            assert!(line.is_match(l), "{l}");
            total += 1;
        }
    }
    // 3スロットに収まらない古い行は削除されている
    assert!(total > 0 && total <= 400, "{total}");
    assert!(!temp.path().join("svc3.log").exists());
}

#[test]
fn replace_attr_redacts_across_derived_handlers() {
    let temp = tempfile::tempdir().unwrap();
    let writer = RotatingWriter::size(temp.path().join("audit.log"), 0, 0, true).unwrap();
    let root = TextHandler::new(
        writer,
        HandlerOptions {
            replace_attr: Some(Arc::new(|groups: &[String], attr: Attr| {
                if groups.first().map(String::as_str) == Some("auth") && attr.key == "token" {
                    Attr::new("token", "REDACTED")
                } else {
                    attr
                }
            })),
            ..HandlerOptions::default()
        },
    );

    let auth = root.with_group("auth");
    auth.handle(
        &Record::new(Level::Warn, "login")
            .with_time(None)
            .with_attr(Attr::new("token", "s3cr3t"))
            .with_attr(Attr::new("user", "kim lee")),
    )
    .unwrap();
    root.handle(
        &Record::new(Level::Info, "plain")
            .with_time(None)
            .with_attr(Attr::new("token", "visible")),
    )
    .unwrap();
    root.close().unwrap();
    root.close().unwrap();

    let content = fs::read_to_string(temp.path().join("audit0.log")).unwrap();
    assert_eq!(
        content,
        "WARN login auth.token=REDACTED auth.user=\"kim lee\"\nINFO plain token=visible\n"
    );
}
