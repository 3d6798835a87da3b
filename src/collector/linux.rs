//! Linux capture backends.
//!
//! Keystrokes are read from the kernel's evdev keyboard devices, which
//! needs root or membership of the `input` group. The foreground process
//! comes from `xdotool` on X11. Screenshots are taken by an external tool
//! writing PNG to stdout, so no unencrypted image touches the disk.

use std::collections::VecDeque;
use std::env;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{
    CaptureError, CaptureSource, ForegroundLookup, KeyInput, KeyInputBackend, KeystrokeSettings,
    KeystrokeSource, ScreenGrabber, ScreenshotSource,
};
use crate::config::Config;

/// Keystroke and screenshot sources for a Linux desktop session.
pub fn sources(config: &Config) -> Vec<Box<dyn CaptureSource>> {
    vec![
        Box::new(KeystrokeSource::new(
            Box::new(EvdevKeyboard::new()),
            Box::new(XdotoolForeground::new()),
            KeystrokeSettings::from(config),
        )),
        Box::new(ScreenshotSource::new(
            Box::new(CommandGrabber::new()),
            config.screenshot_interval(),
        )),
    ]
}

const INPUT_BY_PATH: &str = "/dev/input/by-path";
const INPUT_BY_ID: &str = "/dev/input/by-id";

const EV_KEY: u16 = 0x01;

const KEY_BACKSPACE: u16 = 14;
const KEY_TAB: u16 = 15;
const KEY_ENTER: u16 = 28;
const KEY_LEFTSHIFT: u16 = 42;
const KEY_RIGHTSHIFT: u16 = 54;
const KEY_SPACE: u16 = 57;
const KEY_CAPSLOCK: u16 = 58;
const KEY_KPENTER: u16 = 96;

/// Size of `struct input_event` for this target.
const EVENT_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Evdev keyboard devices, multiplexed with poll(2).
pub struct EvdevKeyboard {
    devices: Vec<File>,
    translator: KeyTranslator,
    pending: VecDeque<KeyInput>,
}

impl EvdevKeyboard {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            translator: KeyTranslator::default(),
            pending: VecDeque::new(),
        }
    }

    fn read_ready(&mut self, index: usize) -> io::Result<()> {
        let mut buf = [0u8; EVENT_SIZE * 64];
        let n = self.devices[index].read(&mut buf)?;
        for raw in buf[..n].chunks_exact(EVENT_SIZE) {
            let (kind, code, value) = parse_input_event(raw);
            if kind != EV_KEY {
                continue;
            }
            if let Some(input) = self.translator.feed(code, value) {
                self.pending.push_back(input);
            }
        }
        Ok(())
    }
}

impl Default for EvdevKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyInputBackend for EvdevKeyboard {
    fn open(&mut self) -> Result<(), CaptureError> {
        let candidates = keyboard_device_paths();
        if candidates.is_empty() {
            return Err(CaptureError::Unavailable(
                "no keyboard event devices under /dev/input".into(),
            ));
        }

        let mut last_error = None;
        for path in candidates {
            match File::open(&path) {
                Ok(file) => self.devices.push(file),
                Err(e) => {
                    tracing::debug!(device = %path.display(), "cannot open keyboard device: {e}");
                    last_error = Some(e);
                }
            }
        }

        if self.devices.is_empty() {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(CaptureError::Unavailable(format!(
                "cannot read keyboard devices ({reason}); run as root or join the input group"
            )));
        }
        tracing::debug!(devices = self.devices.len(), "keyboard devices opened");
        Ok(())
    }

    fn next_key(&mut self, timeout: Duration) -> Result<Option<KeyInput>, CaptureError> {
        if let Some(key) = self.pending.pop_front() {
            return Ok(Some(key));
        }
        if self.devices.is_empty() {
            return Err(CaptureError::Backend("no keyboard devices open".into()));
        }

        let mut fds: Vec<libc::pollfd> = self
            .devices
            .iter()
            .map(|file| libc::pollfd {
                fd: file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a valid, exclusively borrowed array of pollfd
        // whose length is passed alongside it.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(CaptureError::Backend(format!("poll failed: {err}")));
        }
        if rc == 0 {
            return Ok(None);
        }

        // Walk backwards so removing an unplugged device keeps indices valid.
        for (index, fd) in fds.iter().enumerate().rev() {
            if fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                tracing::debug!("keyboard device went away");
                self.devices.remove(index);
            } else if fd.revents & libc::POLLIN != 0 {
                if let Err(e) = self.read_ready(index) {
                    tracing::debug!("keyboard read failed: {e}");
                    self.devices.remove(index);
                }
            }
        }

        if self.devices.is_empty() {
            return Err(CaptureError::Backend("all keyboard devices disappeared".into()));
        }
        Ok(self.pending.pop_front())
    }

    fn close(&mut self) {
        self.devices.clear();
        self.pending.clear();
    }
}

/// Keyboard event device nodes, preferring stable by-path names.
fn keyboard_device_paths() -> Vec<PathBuf> {
    for dir in [INPUT_BY_PATH, INPUT_BY_ID] {
        let found = list_keyboard_nodes(Path::new(dir));
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn list_keyboard_nodes(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut nodes: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("-event-kbd"))
        })
        .collect();
    nodes.sort();
    nodes
}

/// Extract `(type, code, value)` from one raw `input_event`.
///
/// The struct ends with `u16 type, u16 code, s32 value` after a timeval
/// whose width depends on the target.
fn parse_input_event(raw: &[u8]) -> (u16, u16, i32) {
    let base = raw.len() - 8;
    let kind = u16::from_ne_bytes([raw[base], raw[base + 1]]);
    let code = u16::from_ne_bytes([raw[base + 2], raw[base + 3]]);
    let value = i32::from_ne_bytes([raw[base + 4], raw[base + 5], raw[base + 6], raw[base + 7]]);
    (kind, code, value)
}

/// Turns evdev key codes into characters on a US layout, tracking modifiers.
#[derive(Debug, Default)]
pub(crate) struct KeyTranslator {
    left_shift: bool,
    right_shift: bool,
    caps_lock: bool,
}

impl KeyTranslator {
    /// Feed one EV_KEY event. `value` is 0 release, 1 press, 2 repeat.
    pub(crate) fn feed(&mut self, code: u16, value: i32) -> Option<KeyInput> {
        match code {
            KEY_LEFTSHIFT => {
                self.left_shift = value != 0;
                return None;
            }
            KEY_RIGHTSHIFT => {
                self.right_shift = value != 0;
                return None;
            }
            KEY_CAPSLOCK => {
                if value == 1 {
                    self.caps_lock = !self.caps_lock;
                }
                return None;
            }
            _ => {}
        }
        if value == 0 {
            return None;
        }

        match code {
            KEY_BACKSPACE => Some(KeyInput::Backspace),
            KEY_TAB => Some(KeyInput::Tab),
            KEY_ENTER | KEY_KPENTER => Some(KeyInput::Enter),
            KEY_SPACE => Some(KeyInput::Char(' ')),
            _ => {
                let (plain, shifted) = us_keymap(code)?;
                let shift = self.left_shift || self.right_shift;
                let c = if plain.is_ascii_alphabetic() {
                    if shift != self.caps_lock {
                        shifted
                    } else {
                        plain
                    }
                } else if shift {
                    shifted
                } else {
                    plain
                };
                Some(KeyInput::Char(c))
            }
        }
    }
}

fn us_keymap(code: u16) -> Option<(char, char)> {
    const TOP_ROW: &str = "qwertyuiop";
    const HOME_ROW: &str = "asdfghjkl";
    const BOTTOM_ROW: &str = "zxcvbnm";
    const DIGITS: &[u8; 10] = b"1234567890";
    const DIGITS_SHIFTED: &[u8; 10] = b"!@#$%^&*()";

    let letter = |row: &str, offset: u16| {
        row.chars()
            .nth(offset as usize)
            .map(|c| (c, c.to_ascii_uppercase()))
    };

    match code {
        2..=11 => {
            let i = (code - 2) as usize;
            Some((DIGITS[i] as char, DIGITS_SHIFTED[i] as char))
        }
        12 => Some(('-', '_')),
        13 => Some(('=', '+')),
        16..=25 => letter(TOP_ROW, code - 16),
        26 => Some(('[', '{')),
        27 => Some((']', '}')),
        30..=38 => letter(HOME_ROW, code - 30),
        39 => Some((';', ':')),
        40 => Some(('\'', '"')),
        41 => Some(('`', '~')),
        43 => Some(('\\', '|')),
        44..=50 => letter(BOTTOM_ROW, code - 44),
        51 => Some((',', '<')),
        52 => Some(('.', '>')),
        53 => Some(('/', '?')),
        _ => None,
    }
}

/// How long a foreground lookup result is reused.
const FOREGROUND_TTL: Duration = Duration::from_millis(250);

/// Foreground process via `xdotool` and `/proc/<pid>/comm`.
pub struct XdotoolForeground {
    cached: Option<(Instant, Option<String>)>,
    missing: bool,
}

impl XdotoolForeground {
    pub fn new() -> Self {
        Self {
            cached: None,
            missing: false,
        }
    }

    fn query(&mut self) -> Option<String> {
        let output = match Command::new("xdotool")
            .args(["getactivewindow", "getwindowpid"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    tracing::warn!("xdotool not found; keyword runs will be tagged unknown");
                    self.missing = true;
                }
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }

        let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        let comm = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
        let name = comm.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

impl Default for XdotoolForeground {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundLookup for XdotoolForeground {
    fn foreground_process(&mut self) -> Option<String> {
        if self.missing {
            return None;
        }
        if let Some((at, ref name)) = self.cached {
            if at.elapsed() < FOREGROUND_TTL {
                return name.clone();
            }
        }
        let name = self.query();
        self.cached = Some((Instant::now(), name.clone()));
        name
    }
}

/// A screenshot tool that writes PNG to stdout.
#[derive(Debug, Clone, Copy)]
struct ScreenTool {
    program: &'static str,
    args: &'static [&'static str],
    wayland: bool,
}

const SCREEN_TOOLS: &[ScreenTool] = &[
    ScreenTool {
        program: "grim",
        args: &["-"],
        wayland: true,
    },
    ScreenTool {
        program: "maim",
        args: &[],
        wayland: false,
    },
    ScreenTool {
        program: "import",
        args: &["-window", "root", "png:-"],
        wayland: false,
    },
];

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Screen capture through the first available stdout tool.
pub struct CommandGrabber {
    tool: Option<ScreenTool>,
}

impl CommandGrabber {
    pub fn new() -> Self {
        Self { tool: None }
    }
}

impl Default for CommandGrabber {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenGrabber for CommandGrabber {
    fn probe(&mut self) -> Result<(), CaptureError> {
        let wayland = env::var_os("WAYLAND_DISPLAY").is_some();
        let x11 = env::var_os("DISPLAY").is_some();
        if !wayland && !x11 {
            return Err(CaptureError::Unavailable(
                "no graphical session (DISPLAY and WAYLAND_DISPLAY unset)".into(),
            ));
        }

        let tool = SCREEN_TOOLS
            .iter()
            .filter(|tool| if tool.wayland { wayland } else { x11 })
            .find(|tool| find_in_path(tool.program).is_some())
            .copied()
            .ok_or_else(|| {
                CaptureError::Unavailable(
                    "no screenshot tool found (install grim, maim or imagemagick)".into(),
                )
            })?;

        tracing::debug!(tool = tool.program, "screenshot tool selected");
        self.tool = Some(tool);
        Ok(())
    }

    fn grab(&mut self) -> Result<Vec<u8>, CaptureError> {
        let tool = self
            .tool
            .ok_or_else(|| CaptureError::Backend("screen grabber was not probed".into()))?;

        let output = Command::new(tool.program)
            .args(tool.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| CaptureError::Backend(format!("{} failed to run: {e}", tool.program)))?;

        if !output.status.success() {
            return Err(CaptureError::Backend(format!(
                "{} exited with {}",
                tool.program, output.status
            )));
        }
        if !output.stdout.starts_with(PNG_MAGIC) {
            return Err(CaptureError::Backend(format!(
                "{} did not produce a PNG image",
                tool.program
            )));
        }
        Ok(output.stdout)
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
