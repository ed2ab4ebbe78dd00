use std::{
    fmt::{self, Debug},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
};

use time::{
    format_description::{self, OwnedFormatItem},
    Duration, OffsetDateTime, Time,
};
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    error::{Error, Result},
    path::PathParts,
};

/// 日次ローテーションのファイル名に付ける日時の既定の書式
pub const DEFAULT_TIME_FORMAT: &str = "_[year]_[month]_[day]_[hour]_[minute]";

/// サイズローテーションの1ファイルの既定の最大サイズ（1MiB）
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

/// サイズローテーションで残す既定のファイル数
pub const DEFAULT_MAX_SLOTS: usize = 10;

/// ファイルを切り替えるタイミング
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// 毎日、指定した時刻を過ぎたときにファイルを切り替え
    Daily { hour: u8, minute: u8 },
    /// `max_bytes`バイト以上書き込んだときにファイルを切り替え。
    /// ファイルは`max_slots`個を順番に使い回す。
    Size { max_bytes: u64, max_slots: usize },
}

/// 現在時刻の取得元
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// ローカル時刻を返す時計。ローカルのオフセットを取得できない場合はUTC。
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// `RotatingWriter`のビルダー
pub struct RotatingWriterBuilder {
    path: PathBuf,
    rotation: Rotation,
    locking: bool,
    time_format: String,
    clock: Arc<dyn Clock>,
}

impl RotatingWriterBuilder {
    pub fn new(path: impl AsRef<Path>, rotation: Rotation) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rotation,
            locking: true,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    /// 共有参照からの書き込みを内部のロックで直列化するかどうか。既定は`true`。
    pub fn locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }

    /// 日次ローテーションのファイル名に付ける日時の書式（`time`クレートの書式記述）
    pub fn time_format(mut self, format: impl Into<String>) -> Self {
        self.time_format = format.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 最初のファイルを開いて、`RotatingWriter`を作成する。
    ///
    /// # 戻り値
    ///
    /// `RotatingWriter`インスタンス。ディレクトリの作成やファイルのオープンに失敗した場合はエラー。
    pub fn build(self) -> Result<RotatingWriter> {
        let parts = PathParts::resolve(&self.path)?;
        let time_format = parse_time_format(&self.time_format)?;

        let (policy, file, path, written) = match self.rotation {
            Rotation::Daily { hour, minute } => {
                let at = Time::from_hms(hour, minute, 0)
                    .map_err(|_| Error::InvalidCutover { hour, minute })?;
                let now = self.clock.now();
                let mut daily = Daily { at, cutover: now };
                let (file, path) = daily.open(&parts, &time_format, now)?;
                (Policy::Daily(daily), file, path, 0)
            }
            Rotation::Size {
                max_bytes,
                max_slots,
            } => {
                let max_bytes = if max_bytes == 0 {
                    DEFAULT_MAX_BYTES
                } else {
                    max_bytes
                };
                let max_slots = if max_slots == 0 {
                    DEFAULT_MAX_SLOTS
                } else {
                    max_slots
                };
                let mut slots = Slots::new(&parts, max_bytes, max_slots);
                // 閾値から始めて、最初のスロットへ切り替えさせる
                let mut written = max_bytes;
                let (file, path) = slots.open_next(&mut written)?;
                (Policy::Size(slots), file, path, written)
            }
        };
        tracing::debug!(path = %path.display(), "opened log file");

        Ok(RotatingWriter {
            locking: self.locking,
            state: Mutex::new(State {
                parts,
                policy,
                time_format,
                clock: self.clock,
                output: Some(Output::File(file)),
                current: Some(path),
                written,
                fallback: false,
            }),
        })
    }
}

/// 1つのログファイルだけを開き、条件を満たしたら次のファイルに切り替えるライター。
///
/// 書き込みのたびに、書き込む前に切り替えの判定を行う。
///
/// 切り替え先のファイルを開けなかった場合は、以降の出力を標準出力に切り替える。
/// 一度標準出力に切り替えると、元のファイルに戻ることはない。
pub struct RotatingWriter {
    locking: bool,
    state: Mutex<State>,
}

impl RotatingWriter {
    pub fn builder(path: impl AsRef<Path>, rotation: Rotation) -> RotatingWriterBuilder {
        RotatingWriterBuilder::new(path, rotation)
    }

    /// 毎日`hour`時`minute`分を過ぎたときにファイルを切り替えるライターを作成する。
    ///
    /// # 引数
    ///
    /// * path: ログファイルのパス。ファイル名には日時が挿入される。
    /// * hour: 切り替える時。
    /// * minute: 切り替える分。
    /// * locking: 内部でロックするかどうか。
    pub fn daily(path: impl AsRef<Path>, hour: u8, minute: u8, locking: bool) -> Result<Self> {
        Self::builder(path, Rotation::Daily { hour, minute })
            .locking(locking)
            .build()
    }

    /// `max_bytes`ごとにファイルを切り替え、`max_slots`個のファイルを使い回すライターを作成する。
    ///
    /// # 引数
    ///
    /// * path: ログファイルのパス。ファイル名にはスロット番号が挿入される。
    /// * max_bytes: 1ファイルの最大サイズ。0なら1MiB。
    /// * max_slots: 残す最大ファイル数。0なら10。
    /// * locking: 内部でロックするかどうか。
    pub fn size(
        path: impl AsRef<Path>,
        max_bytes: u64,
        max_slots: usize,
        locking: bool,
    ) -> Result<Self> {
        Self::builder(
            path,
            Rotation::Size {
                max_bytes,
                max_slots,
            },
        )
        .locking(locking)
        .build()
    }

    pub fn is_locking(&self) -> bool {
        self.locking
    }

    /// 現在書き込んでいるファイルのパス。閉じているか、標準出力に切り替えた後は`None`。
    pub fn current_path(&self) -> Option<PathBuf> {
        self.state_blocking().current.clone()
    }

    /// 現在のファイルを開いてから書き込んだバイト数
    pub fn written(&self) -> u64 {
        self.state_blocking().written
    }

    /// ローテーションに失敗して標準出力に書き込んでいるかどうか
    pub fn is_fallback(&self) -> bool {
        self.state_blocking().fallback
    }

    /// 日次ローテーションのファイル名の書式を変更する。次に開くファイルから適用される。
    pub fn set_time_format(&self, format: impl Into<String>) -> Result<()> {
        let format = parse_time_format(&format.into())?;
        self.state_blocking().time_format = format;
        Ok(())
    }

    /// 現在のファイルを閉じる。閉じた後に再度呼び出してもエラーにならない。
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state_blocking();
        state.current = None;
        match state.output.take() {
            Some(mut output) => output.flush(),
            None => Ok(()),
        }
    }

    fn state_blocking(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 共有参照から書き込むときの状態を取得する。
    ///
    /// 内部ロックが無効の場合、同時に書き込まれていればエラーを返す。
    fn state_shared(&self) -> io::Result<MutexGuard<'_, State>> {
        if self.locking {
            return Ok(self.state_blocking());
        }
        match self.state.try_lock() {
            Ok(state) => Ok(state),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "concurrent write to a log writer without internal locking",
            )),
        }
    }
}

impl Debug for RotatingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatingWriter")
            .field("locking", &self.locking)
            .finish_non_exhaustive()
    }
}

/// `&mut`での書き込みは排他なのでロックしない。
impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let (result, rotated) = state.write(buf);
        report(rotated);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl Write for &RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (result, rotated) = self.state_shared()?.write(buf);
        // ロックを解放してから記録する
        report(rotated);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state_shared()?.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = &'a RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn report(rotated: Option<Rotated>) {
    match rotated {
        Some(Rotated::Opened(path)) => {
            tracing::debug!(path = %path.display(), "rotated log file");
        }
        Some(Rotated::Fallback(err)) => {
            tracing::warn!(error = %err, "log rotation failed, writing to stdout from now on");
        }
        None => {}
    }
}

enum Rotated {
    Opened(PathBuf),
    Fallback(Error),
}

enum Output {
    File(File),
    Fallback(io::Stdout),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(file) => file.write(buf),
            Self::Fallback(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(file) => file.flush(),
            Self::Fallback(stdout) => stdout.flush(),
        }
    }
}

struct State {
    parts: PathParts,
    policy: Policy,
    time_format: OwnedFormatItem,
    clock: Arc<dyn Clock>,
    output: Option<Output>,
    current: Option<PathBuf>,
    /// 現在のファイルを開いてから書き込んだバイト数
    written: u64,
    fallback: bool,
}

enum Policy {
    Daily(Daily),
    Size(Slots),
}

struct Daily {
    at: Time,
    /// 現在のファイルの期間が始まった切り替え時刻。常に過去。
    cutover: OffsetDateTime,
}

impl Daily {
    fn open(
        &mut self,
        parts: &PathParts,
        time_format: &OwnedFormatItem,
        now: OffsetDateTime,
    ) -> Result<(File, PathBuf)> {
        let today = now.replace_time(self.at);
        self.cutover = if today > now {
            today - Duration::DAY
        } else {
            today
        };

        let path = create_daily_log_filepath(parts, time_format, &now)?;
        let file = create_writer(&path)?;
        Ok((file, path))
    }
}

struct Slots {
    max_bytes: u64,
    index: usize,
    paths: Vec<PathBuf>,
    used: Vec<bool>,
}

impl Slots {
    fn new(parts: &PathParts, max_bytes: u64, max_slots: usize) -> Self {
        Self {
            max_bytes,
            // 次に進めたときに0になる
            index: max_slots - 1,
            paths: (0..max_slots)
                .map(|slot| parts.file_path(&slot.to_string()))
                .collect(),
            used: vec![false; max_slots],
        }
    }

    /// 次のスロットのファイルを開く。
    ///
    /// 使用済みのスロットは、古いファイルを削除してから作り直す。開いたファイルが
    /// すでに`max_bytes`以上なら、さらに次のスロットへ進む。
    fn open_next(&mut self, written: &mut u64) -> Result<(File, PathBuf)> {
        loop {
            self.index = (self.index + 1) % self.paths.len();
            let path = &self.paths[self.index];

            if self.used[self.index] {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(Error::Remove {
                            path: path.clone(),
                            source,
                        })
                    }
                }
            }

            let file = create_writer(path)?;
            *written = file
                .metadata()
                .map_err(|source| Error::Stat {
                    path: path.clone(),
                    source,
                })?
                .len();
            self.used[self.index] = true;

            if *written < self.max_bytes {
                return Ok((file, path.clone()));
            }
        }
    }
}

impl State {
    /// 切り替えの判定をして、必要ならファイルを切り替える。
    fn rotate(&mut self) -> Option<Rotated> {
        if self.fallback {
            return None;
        }

        let opened = match &mut self.policy {
            Policy::Daily(daily) => {
                let now = self.clock.now();
                // 前回の切り替え時刻から丸1日以上経過した
                if now - Duration::DAY <= daily.cutover {
                    return None;
                }
                self.output = None;
                self.written = 0;
                daily.open(&self.parts, &self.time_format, now)
            }
            Policy::Size(slots) => {
                if self.written < slots.max_bytes {
                    return None;
                }
                self.output = None;
                slots.open_next(&mut self.written)
            }
        };

        Some(match opened {
            Ok((file, path)) => {
                self.output = Some(Output::File(file));
                self.current = Some(path.clone());
                Rotated::Opened(path)
            }
            Err(err) => {
                self.output = Some(Output::Fallback(io::stdout()));
                self.current = None;
                self.fallback = true;
                Rotated::Fallback(err)
            }
        })
    }

    /// 切り替えの判定をしてから、`buf`をすべて書き込む。
    fn write(&mut self, buf: &[u8]) -> (io::Result<usize>, Option<Rotated>) {
        let rotated = self.rotate();
        let Some(output) = self.output.as_mut() else {
            return (
                Err(io::Error::new(io::ErrorKind::Other, "log file is closed")),
                rotated,
            );
        };

        let mut written = 0;
        let result = loop {
            if written == buf.len() {
                break Ok(written);
            }
            match output.write(&buf[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };
        self.written += written as u64;

        (result, rotated)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.output.as_mut() {
            Some(output) => output.flush(),
            None => Ok(()),
        }
    }
}

/// ファイル名の日時の書式を解析する。
fn parse_time_format(format: &str) -> Result<OwnedFormatItem> {
    format_description::parse_owned::<2>(format).map_err(|err| Error::InvalidTimeFormat {
        format: format.to_string(),
        message: err.to_string(),
    })
}

/// 日毎にローテーションするログファイルのパスを作成して、返却する。
///
/// ログファイル名は、`{base}{日時}{extension}`となる。
///
/// # 引数
///
/// - parts: 分解したログファイルパス。
/// - time_format: 日時の書式。
/// - now: ファイルの日時。
///
/// # 戻り値
///
/// ログファイルパス。
fn create_daily_log_filepath(
    parts: &PathParts,
    time_format: &OwnedFormatItem,
    now: &OffsetDateTime,
) -> Result<PathBuf> {
    let date = now.format(time_format).map_err(Error::FormatTime)?;

    Ok(parts.file_path(&date))
}

/// ライターを作成する。
///
/// ディレクトリが削除されていた場合は作り直す。
///
/// # 引数
///
/// * path: ログファイルパス。
///
/// # 戻り値
///
/// 追記モードで開いた`File`インスタンス。
fn create_writer(path: &Path) -> Result<File> {
    let mut open_options = OpenOptions::new();
    open_options.append(true).create(true);

    let new_file = match open_options.open(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => match path.parent() {
            Some(parent) => fs::create_dir_all(parent).and_then(|_| open_options.open(path)),
            None => Err(err),
        },
        opened => opened,
    };

    new_file.map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}
