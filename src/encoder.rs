//! レコードを1行のテキストに書式化する
//!
//! 行は`{時刻} {レベル} [source=file:line] {メッセージ} key=value ...`となる。
//! グループに属する属性のキーは、グループ名を`.`でつないだ接頭語を持つ。

use std::{
    borrow::Cow,
    fmt::Display,
    io::Write as _,
};

use time::{Duration, OffsetDateTime, UtcOffset};
use unicode_general_category::{get_general_category, GeneralCategory};

use crate::{
    handler::HandlerOptions,
    pool::{self, Pooled},
    record::{Attr, Level, Record, Value},
};

/// 属性の区切り文字
pub(crate) const ATTR_SEP: &str = " ";

/// グループ名とキーの区切り文字
const KEY_COMPONENT_SEP: char = '.';

/// 1回の書式化の状態
pub(crate) struct HandleState<'a> {
    opts: &'a HandlerOptions,
    /// ハンドラーで開かれたすべてのグループ
    handler_groups: &'a [String],
    /// `handler_groups`のうち、事前書式化済みの属性で開かれているグループの数
    open_groups: usize,
    buf: &'a mut Vec<u8>,
    /// 次のキーの前に書き込む区切り文字
    sep: &'static str,
    prefix: Pooled<String>,
    /// 属性書き換えフックに渡すグループ名。フックが無ければ`None`。
    groups: Option<Pooled<Vec<String>>>,
}

impl<'a> HandleState<'a> {
    pub(crate) fn new(
        opts: &'a HandlerOptions,
        handler_groups: &'a [String],
        open_groups: usize,
        buf: &'a mut Vec<u8>,
        sep: &'static str,
    ) -> Self {
        let groups = opts.replace_attr.as_ref().map(|_| {
            let mut groups = pool::GROUPS.get();
            groups.extend_from_slice(&handler_groups[..open_groups]);
            groups
        });
        Self {
            opts,
            handler_groups,
            open_groups,
            buf,
            sep,
            prefix: pool::PREFIXES.get(),
            groups,
        }
    }

    /// レコード全体を1行として書き込む。
    pub(crate) fn append_record(&mut self, record: &Record, preformatted: &[u8], group_prefix: &str) {
        // 組み込みの項目はグループに属さない
        let groups = self.groups.take();

        if let Some(time) = record.time {
            self.append_sep();
            append_time(self.buf, time);
        }

        self.append_sep();
        append_string(self.buf, record.level.as_str());

        if self.opts.add_source && matches!(record.level, Level::Trace | Level::Error) {
            if let Some(source) = &record.source {
                self.append_attr(&Attr::any(SOURCE_KEY, source.clone()));
            }
        }

        self.append_sep();
        append_string(self.buf, &record.message);

        self.groups = groups;

        if !preformatted.is_empty() {
            self.append_sep();
            self.buf.extend_from_slice(preformatted);
        }

        // 属性が無ければグループも出力しない
        if !record.attrs.is_empty() {
            self.prefix.push_str(group_prefix);
            self.open_pending_groups();
            for attr in &record.attrs {
                self.append_attr(attr);
            }
        }

        self.buf.push(b'\n');
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn push_prefix(&mut self, prefix: &str) {
        self.prefix.push_str(prefix);
    }

    /// `with_group`で追加され、まだ接頭語になっていないグループを開く。
    pub(crate) fn open_pending_groups(&mut self) {
        let handler_groups = self.handler_groups;
        for name in &handler_groups[self.open_groups..] {
            self.open_group(name);
        }
    }

    fn open_group(&mut self, name: &str) {
        self.prefix.push_str(name);
        self.prefix.push(KEY_COMPONENT_SEP);
        if let Some(groups) = &mut self.groups {
            groups.push(name.to_string());
        }
    }

    fn close_group(&mut self, name: &str) {
        let len = self.prefix.len() - name.len() - KEY_COMPONENT_SEP.len_utf8();
        self.prefix.truncate(len);
        if let Some(groups) = &mut self.groups {
            groups.pop();
        }
    }

    /// 属性を書き込む。書き換えフックの適用、空のキーの省略、グループの展開を行う。
    pub(crate) fn append_attr(&mut self, attr: &Attr) {
        let opts = self.opts;
        let mut attr = Cow::Borrowed(attr);

        // フックはグループそのものには適用しない
        if let Some(replace) = &opts.replace_attr {
            if !attr.value.is_group() {
                let resolved = Attr {
                    key: attr.key.clone(),
                    value: attr.value.clone().resolve(),
                };
                let groups = self.groups.as_deref().map(Vec::as_slice).unwrap_or(&[]);
                attr = Cow::Owned(replace(groups, resolved));
            }
        }
        if matches!(attr.value, Value::Lazy(_)) {
            attr = Cow::Owned(Attr {
                key: attr.key.clone(),
                value: attr.value.clone().resolve(),
            });
        }

        if let Value::Group(children) = &attr.value {
            if children.is_empty() {
                return;
            }
            if attr.key.is_empty() {
                for child in children.iter() {
                    self.append_attr(child);
                }
            } else {
                self.open_group(&attr.key);
                for child in children.iter() {
                    self.append_attr(child);
                }
                self.close_group(&attr.key);
            }
            return;
        }

        if attr.key.is_empty() {
            return;
        }
        self.append_key(&attr.key);
        self.append_value(&attr.value);
    }

    fn append_key(&mut self, key: &str) {
        self.append_sep();
        if self.prefix.is_empty() {
            append_string(self.buf, key);
        } else if needs_quoting(&self.prefix) || needs_quoting(key) {
            let full = format!("{}{}", self.prefix.as_str(), key);
            append_string(self.buf, &full);
        } else {
            self.buf.extend_from_slice(self.prefix.as_bytes());
            self.buf.extend_from_slice(key.as_bytes());
        }
        self.buf.push(b'=');
    }

    fn append_sep(&mut self) {
        self.buf.extend_from_slice(self.sep.as_bytes());
        self.sep = ATTR_SEP;
    }

    fn append_value(&mut self, value: &Value) {
        match value {
            Value::String(s) => append_string(self.buf, s),
            Value::Int(v) => append_display(self.buf, v),
            Value::Uint(v) => append_display(self.buf, v),
            Value::Float(v) => append_float(self.buf, *v),
            Value::Bool(v) => append_display(self.buf, v),
            Value::Duration(v) => append_duration(self.buf, *v),
            Value::Time(v) => append_time(self.buf, *v),
            Value::Any(raw) => {
                if let Some(text) = raw.marshal_text() {
                    match text {
                        Ok(text) => append_string(self.buf, &text),
                        Err(err) => append_error(self.buf, err),
                    }
                } else if let Some(bytes) = raw.as_bytes() {
                    append_quoted(self.buf, bytes);
                } else {
                    append_string(self.buf, &format!("{raw:?}"));
                }
            }
            Value::Group(attrs) => append_display(self.buf, format_args!("{attrs:?}")),
            Value::Lazy(_) => self.append_value(&value.clone().resolve()),
        }
    }
}

/// ソース位置の属性キー
pub const SOURCE_KEY: &str = "source";

fn append_display(buf: &mut Vec<u8>, value: impl Display) {
    // Vec<u8> への書き込みは失敗しない
    let _ = write!(buf, "{value}");
}

fn append_error(buf: &mut Vec<u8>, err: impl Display) {
    append_string(buf, &format!("!ERROR:{err}"));
}

/// 必要な場合だけ引用符で囲んで、文字列を書き込む。
pub(crate) fn append_string(buf: &mut Vec<u8>, s: &str) {
    if needs_quoting(s) {
        append_quoted(buf, s.as_bytes());
    } else {
        buf.extend_from_slice(s.as_bytes());
    }
}

/// 文字列を引用符で囲む必要があるかどうか。
///
/// 空文字列、空白、`=`、`\`、`"`、制御文字、表示できない文字や空白文字を含む場合に囲む。
pub fn needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    s.chars().any(|c| {
        if c.is_ascii() {
            c == ' ' || c == '=' || c == '\\' || c == '"' || (c as u32) < 0x20
        } else {
            c == char::REPLACEMENT_CHARACTER || c.is_whitespace() || !is_print(c)
        }
    })
}

/// `s`を引用符で囲み、エスケープした文字列を返却する。
pub fn quote(s: &str) -> String {
    let mut buf = Vec::with_capacity(s.len() + 2);
    append_quoted(&mut buf, s.as_bytes());
    String::from_utf8_lossy(&buf).into_owned()
}

/// バイト列を引用符で囲んで書き込む。不正なUTF-8のバイトは`\xNN`になる。
fn append_quoted(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(b'"');
    let mut rest = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                append_escaped(buf, valid);
                break;
            }
            Err(err) => {
                let (valid, invalid) = rest.split_at(err.valid_up_to());
                // from_utf8 で検証済み
                append_escaped(buf, std::str::from_utf8(valid).unwrap_or_default());
                let bad = err.error_len().unwrap_or(invalid.len());
                for byte in &invalid[..bad] {
                    append_hex(buf, "\\x", u32::from(*byte), 2);
                }
                rest = &invalid[bad..];
            }
        }
    }
    buf.push(b'"');
}

fn append_escaped(buf: &mut Vec<u8>, s: &str) {
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                buf.push(b'\\');
                buf.push(c as u8);
            }
            '\x07' => buf.extend_from_slice(b"\\a"),
            '\x08' => buf.extend_from_slice(b"\\b"),
            '\x0c' => buf.extend_from_slice(b"\\f"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            '\t' => buf.extend_from_slice(b"\\t"),
            '\x0b' => buf.extend_from_slice(b"\\v"),
            c if c.is_ascii() => {
                if c.is_ascii_control() {
                    append_hex(buf, "\\x", c as u32, 2);
                } else {
                    buf.push(c as u8);
                }
            }
            c if is_print(c) => {
                let mut utf8 = [0; 4];
                buf.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
            c if (c as u32) < 0x10000 => append_hex(buf, "\\u", c as u32, 4),
            c => append_hex(buf, "\\U", c as u32, 8),
        }
    }
}

fn append_hex(buf: &mut Vec<u8>, escape: &str, value: u32, width: usize) {
    append_display(buf, format_args!("{escape}{value:0width$x}"));
}

/// 文字が表示可能かどうか。
///
/// 文字、結合文字、数字、句読点、記号と、ASCIIの空白だけを表示可能とする。
/// 未割り当ての符号位置、書式文字、私用領域、その他の空白は表示できない。
fn is_print(c: char) -> bool {
    use GeneralCategory::*;

    if c == ' ' {
        return true;
    }
    matches!(
        get_general_category(c),
        UppercaseLetter
            | LowercaseLetter
            | TitlecaseLetter
            | ModifierLetter
            | OtherLetter
            | NonspacingMark
            | SpacingMark
            | EnclosingMark
            | DecimalNumber
            | LetterNumber
            | OtherNumber
            | ConnectorPunctuation
            | DashPunctuation
            | OpenPunctuation
            | ClosePunctuation
            | InitialPunctuation
            | FinalPunctuation
            | OtherPunctuation
            | MathSymbol
            | CurrencySymbol
            | ModifierSymbol
            | OtherSymbol
    )
}

/// UTCの`YYYY-MM-DDThh:mm:ss.mmm`で時刻を書き込む。
pub(crate) fn append_time(buf: &mut Vec<u8>, time: OffsetDateTime) {
    let time = time.to_offset(UtcOffset::UTC);
    append_display(
        buf,
        format_args!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}",
            time.year(),
            u8::from(time.month()),
            time.day(),
            time.hour(),
            time.minute(),
            time.second(),
            time.nanosecond() / 1_000_000,
        ),
    );
}

/// `1h2m3.5s`、`1.5ms`、`0s`の形式で期間を書き込む。
pub(crate) fn append_duration(buf: &mut Vec<u8>, duration: Duration) {
    let nanos = duration.whole_nanoseconds();
    if nanos == 0 {
        buf.extend_from_slice(b"0s");
        return;
    }
    if nanos < 0 {
        buf.push(b'-');
    }
    let nanos = nanos.unsigned_abs();

    if nanos < 1_000_000_000 {
        let (unit, digits) = match nanos {
            n if n < 1_000 => ("ns", 0),
            n if n < 1_000_000 => ("µs", 3),
            _ => ("ms", 6),
        };
        append_fraction(buf, nanos, digits);
        buf.extend_from_slice(unit.as_bytes());
        return;
    }

    let seconds = nanos / 1_000_000_000;
    let (hours, minutes) = (seconds / 3600, seconds / 60 % 60);
    if hours > 0 {
        append_display(buf, format_args!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        append_display(buf, format_args!("{minutes}m"));
    }
    append_fraction(buf, nanos % 60_000_000_000, 9);
    buf.push(b's');
}

/// `value / 10^digits`を、末尾の0を除いた小数で書き込む。
fn append_fraction(buf: &mut Vec<u8>, value: u128, digits: u32) {
    let scale = 10u128.pow(digits);
    append_display(buf, value / scale);
    let fraction = value % scale;
    if fraction > 0 {
        let text = format!("{:0width$}", fraction, width = digits as usize);
        buf.push(b'.');
        buf.extend_from_slice(text.trim_end_matches('0').as_bytes());
    }
}

/// 往復変換できる最短の表現で浮動小数点数を書き込む。
///
/// 指数が-4未満または6以上の場合は`1.5e+07`のような指数表記にする。
pub(crate) fn append_float(buf: &mut Vec<u8>, value: f64) {
    if value.is_nan() {
        buf.extend_from_slice(b"NaN");
        return;
    }
    if value.is_infinite() {
        buf.extend_from_slice(if value > 0.0 { b"+Inf" } else { b"-Inf" });
        return;
    }
    if value == 0.0 {
        append_display(buf, value);
        return;
    }

    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .and_then(|(m, e)| Some((m, e.parse::<i32>().ok()?)))
        .unwrap_or((scientific.as_str(), 0));

    if !(-4..6).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        append_display(
            buf,
            format_args!("{mantissa}e{sign}{:02}", exponent.unsigned_abs()),
        );
    } else {
        append_display(buf, value);
    }
}
