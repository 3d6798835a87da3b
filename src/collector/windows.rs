//! Windows capture backends.
//!
//! Keystrokes come from a low-level keyboard hook (SetWindowsHookEx) run on
//! a dedicated message-loop thread. The foreground process is resolved
//! through the focused window's owning process, and screenshots are taken
//! with the `screenshots` crate and encoded to PNG in memory.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cell::RefCell;
use std::io::Cursor;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use windows::core::PWSTR;
use windows::Win32::Foundation::{CloseHandle, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::{
    GetCurrentThreadId, OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::Win32::UI::Input::KeyboardAndMouse::{GetKeyState, VK_CAPITAL, VK_SHIFT};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetForegroundWindow, GetMessageW, GetWindowThreadProcessId, PeekMessageW,
    PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx, HHOOK, KBDLLHOOKSTRUCT, MSG,
    PM_NOREMOVE, WH_KEYBOARD_LL, WM_KEYDOWN, WM_QUIT, WM_SYSKEYDOWN, WM_USER,
};

use super::{
    CaptureError, CaptureSource, ForegroundLookup, KeyInput, KeyInputBackend, KeystrokeSettings,
    KeystrokeSource, ScreenGrabber, ScreenshotSource,
};
use crate::config::Config;

/// Capacity of the hook-to-worker key channel.
const KEY_QUEUE: usize = 1024;

const HOOK_INSTALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Keystroke and screenshot sources backed by Win32.
pub fn sources(config: &Config) -> Vec<Box<dyn CaptureSource>> {
    vec![
        Box::new(KeystrokeSource::new(
            Box::new(HookKeyboard::new()),
            Box::new(WindowsForeground),
            KeystrokeSettings::from(config),
        )),
        Box::new(ScreenshotSource::new(
            Box::new(ScreensGrabber),
            config.screenshot_interval(),
        )),
    ]
}

// The hook callback runs on the thread that installed it, so the sender
// lives in that thread's local storage.
thread_local! {
    static KEY_SENDER: RefCell<Option<Sender<KeyInput>>> = const { RefCell::new(None) };
}

/// Low-level keyboard hook callback.
unsafe extern "system" fn keyboard_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 && matches!(w_param.0 as u32, WM_KEYDOWN | WM_SYSKEYDOWN) {
        let kb_struct = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
        let shift = GetKeyState(VK_SHIFT.0 as i32) < 0;
        let caps = GetKeyState(VK_CAPITAL.0 as i32) & 1 != 0;

        if let Some(input) = translate_virtual_key(kb_struct.vkCode, shift, caps) {
            KEY_SENDER.with(|sender| {
                if let Some(ref s) = *sender.borrow() {
                    let _ = s.try_send(input);
                }
            });
        }
    }

    // Pass the event to the next hook
    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

/// Map a virtual-key code on a US layout to a [`KeyInput`].
pub fn translate_virtual_key(vk: u32, shift: bool, caps: bool) -> Option<KeyInput> {
    const DIGIT_SHIFTED: &[u8; 10] = b")!@#$%^&*(";

    let c = match vk {
        0x08 => return Some(KeyInput::Backspace),
        0x09 => return Some(KeyInput::Tab),
        0x0D => return Some(KeyInput::Enter),
        0x20 => ' ',
        0x30..=0x39 => {
            let idx = (vk - 0x30) as usize;
            if shift {
                DIGIT_SHIFTED[idx] as char
            } else {
                (b'0' + idx as u8) as char
            }
        }
        0x41..=0x5A => {
            let lower = (b'a' + (vk - 0x41) as u8) as char;
            if shift != caps {
                lower.to_ascii_uppercase()
            } else {
                lower
            }
        }
        // Numpad digits
        0x60..=0x69 => (b'0' + (vk - 0x60) as u8) as char,
        0xBA => pick(shift, ';', ':'),
        0xBB => pick(shift, '=', '+'),
        0xBC => pick(shift, ',', '<'),
        0xBD => pick(shift, '-', '_'),
        0xBE => pick(shift, '.', '>'),
        0xBF => pick(shift, '/', '?'),
        0xC0 => pick(shift, '`', '~'),
        0xDB => pick(shift, '[', '{'),
        0xDC => pick(shift, '\\', '|'),
        0xDD => pick(shift, ']', '}'),
        0xDE => pick(shift, '\'', '"'),
        _ => return None,
    };
    Some(KeyInput::Char(c))
}

fn pick(shift: bool, plain: char, shifted: char) -> char {
    if shift {
        shifted
    } else {
        plain
    }
}

/// Keyboard input from a WH_KEYBOARD_LL hook.
pub struct HookKeyboard {
    receiver: Option<Receiver<KeyInput>>,
    hook_thread: Option<(u32, JoinHandle<()>)>,
}

impl HookKeyboard {
    pub fn new() -> Self {
        Self {
            receiver: None,
            hook_thread: None,
        }
    }
}

impl Default for HookKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyInputBackend for HookKeyboard {
    fn open(&mut self) -> Result<(), CaptureError> {
        let (key_tx, key_rx) = bounded(KEY_QUEUE);
        let (ready_tx, ready_rx) = bounded::<Result<u32, String>>(1);

        let handle = thread::Builder::new()
            .name("keyboard-hook".into())
            .spawn(move || run_hook_loop(key_tx, ready_tx))
            .map_err(|e| CaptureError::Backend(format!("failed to spawn hook thread: {e}")))?;

        match ready_rx.recv_timeout(HOOK_INSTALL_TIMEOUT) {
            Ok(Ok(thread_id)) => {
                self.receiver = Some(key_rx);
                self.hook_thread = Some((thread_id, handle));
                Ok(())
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(CaptureError::Unavailable(reason))
            }
            Err(_) => Err(CaptureError::Unavailable(
                "keyboard hook did not come up".into(),
            )),
        }
    }

    fn next_key(&mut self, timeout: Duration) -> Result<Option<KeyInput>, CaptureError> {
        let Some(ref receiver) = self.receiver else {
            return Err(CaptureError::Backend("keyboard hook is not open".into()));
        };
        match receiver.recv_timeout(timeout) {
            Ok(key) => Ok(Some(key)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Backend(
                "keyboard hook thread exited".into(),
            )),
        }
    }

    fn close(&mut self) {
        self.receiver = None;
        if let Some((thread_id, handle)) = self.hook_thread.take() {
            unsafe {
                let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
            }
            let _ = handle.join();
        }
    }
}

/// Install the hook and pump messages until WM_QUIT.
fn run_hook_loop(sender: Sender<KeyInput>, ready: Sender<Result<u32, String>>) {
    KEY_SENDER.with(|s| {
        *s.borrow_mut() = Some(sender);
    });

    unsafe {
        let mut msg = MSG::default();
        // Force creation of this thread's message queue so WM_QUIT can be
        // posted to it.
        let _ = PeekMessageW(&mut msg, HWND::default(), WM_USER, WM_USER, PM_NOREMOVE);

        let hook = match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
            Ok(hook) => hook,
            Err(e) => {
                let _ = ready.send(Err(format!("failed to install keyboard hook: {e}")));
                return;
            }
        };
        let _ = ready.send(Ok(GetCurrentThreadId()));

        // The hook is invoked from inside GetMessageW; nothing to dispatch.
        while GetMessageW(&mut msg, HWND::default(), 0, 0).0 > 0 {}

        let _ = UnhookWindowsHookEx(hook);
    }

    KEY_SENDER.with(|s| {
        s.borrow_mut().take();
    });
}

/// Executable name of the process owning the foreground window.
pub struct WindowsForeground;

impl ForegroundLookup for WindowsForeground {
    fn foreground_process(&mut self) -> Option<String> {
        unsafe {
            let hwnd = GetForegroundWindow();
            if hwnd.0.is_null() {
                return None;
            }

            let mut pid = 0u32;
            GetWindowThreadProcessId(hwnd, Some(&mut pid));
            if pid == 0 {
                return None;
            }

            let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid).ok()?;
            let mut buf = [0u16; 1024];
            let mut len = buf.len() as u32;
            let queried = QueryFullProcessImageNameW(
                process,
                PROCESS_NAME_WIN32,
                PWSTR(buf.as_mut_ptr()),
                &mut len,
            );
            let _ = CloseHandle(process);
            queried.ok()?;

            let full = String::from_utf16_lossy(&buf[..len as usize]);
            Path::new(&full)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        }
    }
}

/// Primary-display capture through GDI.
pub struct ScreensGrabber;

impl ScreenGrabber for ScreensGrabber {
    fn probe(&mut self) -> Result<(), CaptureError> {
        let screens = screenshots::Screen::all()
            .map_err(|e| CaptureError::Unavailable(format!("cannot enumerate displays: {e}")))?;
        if screens.is_empty() {
            return Err(CaptureError::Unavailable("no displays attached".into()));
        }
        Ok(())
    }

    fn grab(&mut self) -> Result<Vec<u8>, CaptureError> {
        let screen = match screenshots::Screen::from_point(0, 0) {
            Ok(screen) => screen,
            Err(_) => screenshots::Screen::all()
                .map_err(|e| CaptureError::Backend(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| CaptureError::Backend("no displays attached".into()))?,
        };

        let img = screen
            .capture()
            .map_err(|e| CaptureError::Backend(format!("capture failed: {e}")))?;
        let (width, height) = (img.width(), img.height());
        encode_png(width, height, bgra_to_rgba(img.into_raw()))
    }
}

fn bgra_to_rgba(buf: Vec<u8>) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(buf.len());
    for chunk in buf.chunks_exact(4) {
        rgba.extend_from_slice(&[chunk[2], chunk[1], chunk[0], 255]);
    }
    rgba
}

fn encode_png(width: u32, height: u32, rgba: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
    let image = image::RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| CaptureError::Backend("capture buffer size mismatch".into()))?;
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| CaptureError::Backend(format!("png encoding failed: {e}")))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letters_follow_shift_and_caps() {
        assert_eq!(translate_virtual_key(0x41, false, false), Some(KeyInput::Char('a')));
        assert_eq!(translate_virtual_key(0x41, true, false), Some(KeyInput::Char('A')));
        assert_eq!(translate_virtual_key(0x41, false, true), Some(KeyInput::Char('A')));
        assert_eq!(translate_virtual_key(0x41, true, true), Some(KeyInput::Char('a')));
    }

    #[test]
    fn test_digits_and_punctuation() {
        assert_eq!(translate_virtual_key(0x31, false, false), Some(KeyInput::Char('1')));
        assert_eq!(translate_virtual_key(0x31, true, false), Some(KeyInput::Char('!')));
        assert_eq!(translate_virtual_key(0x30, true, true), Some(KeyInput::Char(')')));
        assert_eq!(translate_virtual_key(0xBE, false, false), Some(KeyInput::Char('.')));
        assert_eq!(translate_virtual_key(0x62, false, false), Some(KeyInput::Char('2')));
    }

    #[test]
    fn test_control_keys() {
        assert_eq!(translate_virtual_key(0x0D, false, false), Some(KeyInput::Enter));
        assert_eq!(translate_virtual_key(0x09, false, false), Some(KeyInput::Tab));
        assert_eq!(translate_virtual_key(0x08, false, false), Some(KeyInput::Backspace));
        // Shift itself produces nothing
        assert_eq!(translate_virtual_key(0x10, true, false), None);
    }

    #[test]
    fn test_png_encoding() {
        let png = encode_png(2, 1, bgra_to_rgba(vec![0, 0, 255, 0, 255, 0, 0, 0])).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        assert!(encode_png(3, 3, vec![0; 4]).is_err());
    }
}
